//! TCP server for the Dropline file-transfer channel.
//!
//! Accepts a single client at a time, runs the handshake and hands file
//! traffic to a [`dropline_transfer::TransferManager`] owned by the
//! connection. Progress and lifecycle changes are published through a
//! [`StateStore`].

mod connection;
pub mod handler;
mod server;
pub mod state;

pub use handler::{ControlContext, handle_handshake, handle_ping};
pub use server::{ServerConfig, TransferServer};
pub use state::{NOTIFY_INTERVAL, ServerState, StateCallback, StateStore, Subscription};

/// Outbound message buffer per connection.
///
/// Replies are small and one per request, so a modest buffer is plenty.
pub const SEND_BUFFER_SIZE: usize = 256;

/// Errors produced by the transfer server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("server already running")]
    AlreadyRunning,
}
