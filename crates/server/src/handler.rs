//! Control-message handlers.
//!
//! Handlers see the connection only through [`ControlContext`], so they can
//! be exercised without a socket.

use dropline_protocol::constants::UNKNOWN_DEVICE_NAME;
use dropline_protocol::messages::{Handshake, HandshakeAck, Ping, Pong};
use dropline_protocol::{ClientInfo, OutboundMessage, ServerStatus};
use tracing::{info, warn};

/// The slice of a connection that control handlers may touch.
pub trait ControlContext {
    fn status(&self) -> ServerStatus;

    /// Protocol version this server speaks.
    fn protocol_version(&self) -> &str;

    /// Name this server advertises in `handshake_ack`.
    fn device_name(&self) -> &str;

    fn send(&mut self, msg: OutboundMessage);

    /// Records the handshaken client and moves the server to `Connected`.
    fn accept_client(&mut self, client: ClientInfo);

    /// Closes the connection once queued messages are written.
    fn disconnect(&mut self);
}

/// Answers a `handshake`. Returns whether the client was accepted.
///
/// A version mismatch is answered and then disconnected; server state is
/// left untouched.
pub fn handle_handshake(ctx: &mut impl ControlContext, msg: Handshake) -> bool {
    let expected = ctx.protocol_version().to_owned();
    let device_name = ctx.device_name().to_owned();

    if msg.version != expected {
        warn!(
            expected = %expected,
            received = %msg.version,
            platform = %msg.platform,
            "handshake rejected: protocol version mismatch"
        );
        ctx.send(OutboundMessage::HandshakeAck(HandshakeAck {
            accepted: false,
            version: expected.clone(),
            device_name,
            message: Some(format!(
                "Protocol version mismatch: expected {expected}, received {}",
                msg.version
            )),
        }));
        ctx.disconnect();
        return false;
    }

    let client = ClientInfo {
        device_name: msg
            .device_name
            .unwrap_or_else(|| UNKNOWN_DEVICE_NAME.to_owned()),
        platform: msg.platform,
        protocol_version: msg.version,
        app_version: msg.app_version,
    };
    info!(
        device = %client.device_name,
        platform = %client.platform,
        app_version = %client.app_version,
        "client handshake accepted"
    );

    // A re-handshake mid-transfer must not drop the transfer's status.
    if ctx.status() != ServerStatus::ReceivingFile {
        ctx.accept_client(client);
    }
    ctx.send(OutboundMessage::HandshakeAck(HandshakeAck {
        accepted: true,
        version: expected,
        device_name,
        message: None,
    }));
    true
}

/// Answers a `ping` with a `pong` echoing its payload, but only once the
/// client is connected and idle.
pub fn handle_ping(ctx: &mut impl ControlContext, msg: Ping) {
    if ctx.status() != ServerStatus::Connected {
        return;
    }
    ctx.send(OutboundMessage::Pong(Pong {
        payload: msg.payload,
    }));
}
