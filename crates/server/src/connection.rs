//! Client connection: one reactor task per socket plus a write pump.
//!
//! The reactor owns the transfer state and multiplexes socket reads, the
//! transfer deadline, deferred flushes and cancellation in one `select!`
//! loop, so nothing here needs a lock. Disk writes, the final move and
//! checksum verification run on the blocking pool.

use std::net::SocketAddr;
use std::sync::Arc;

use dropline_protocol::messages::{FileStartAck, Handshake, Ping};
use dropline_protocol::{
    ClientInfo, ErrorCode, InboundMessage, MessageType, OutboundMessage, ParseResult,
    ProtocolError, ServerStatus, parse_next,
};
use dropline_transfer::{
    ChunkOutcome, CleanupTask, Completion, Concluded, FinishStep, TransferManager,
};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::SEND_BUFFER_SIZE;
use crate::handler::{self, ControlContext};
use crate::server::ServerConfig;
use crate::state::StateStore;

/// Bytes requested from the socket per read.
const READ_CHUNK: usize = 64 * 1024;

/// Handle for queueing outbound lines to the write pump.
#[derive(Clone)]
pub(crate) struct Sender {
    tx: mpsc::Sender<Vec<u8>>,
}

impl Sender {
    /// Queues a message. Fails only when the buffer is full or the socket
    /// is gone.
    pub(crate) fn send(&self, msg: &OutboundMessage) -> Result<(), SendError> {
        let line = msg.to_line().map_err(|e| {
            warn!(msg_type = msg.msg_type().as_str(), "failed to encode message: {e}");
            SendError
        })?;
        self.tx.try_send(line).map_err(|_| {
            warn!(
                msg_type = msg.msg_type().as_str(),
                "send buffer full or closed, dropping message"
            );
            SendError
        })
    }
}

/// Error returned when the send channel is full or closed.
#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub(crate) struct SendError;

/// Owner-side handle of a running connection.
pub(crate) struct ClientConnection {
    pub peer_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ClientConnection {
    /// `true` while the reactor task is running.
    pub fn is_connected(&self) -> bool {
        !self.task.is_finished()
    }

    /// Cancels the connection and waits until the socket is closed and
    /// the transfer is cleaned up.
    pub async fn close_and_wait(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(peer_addr = %self.peer_addr, "connection task failed: {e}");
        }
    }
}

/// Spawns the reactor and write pump for an accepted socket.
pub(crate) fn spawn_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<ServerConfig>,
    state: StateStore,
    transfers: TransferManager,
    server_cancel: &CancellationToken,
) -> ClientConnection {
    let cancel = server_cancel.child_token();
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::channel(SEND_BUFFER_SIZE);

    let writer_task = tokio::spawn(write_pump(writer, rx, cancel.clone()));

    let session = Session {
        peer_addr,
        sender: Sender { tx },
        state,
        config,
        transfers,
        flush_due: false,
        completion: None,
        closing: false,
    };
    let reactor_cancel = cancel.clone();
    let server_cancel = server_cancel.clone();
    let task = tokio::spawn(async move {
        session.run(reader, reactor_cancel, writer_task, server_cancel).await;
    });

    ClientConnection {
        peer_addr,
        cancel,
        task,
    }
}

/// Write pump: drains the send channel into the socket.
async fn write_pump(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            line = rx.recv() => {
                match line {
                    Some(bytes) => {
                        if let Err(e) = writer.write_all(&bytes).await {
                            warn!("write pump error: {e}");
                            cancel.cancel();
                            break;
                        }
                    }
                    None => break, // Reactor finished.
                }
            }
        }
    }

    let _ = writer.shutdown().await;
}

struct Session {
    peer_addr: SocketAddr,
    sender: Sender,
    state: StateStore,
    config: Arc<ServerConfig>,
    transfers: TransferManager,
    flush_due: bool,
    /// Detached `file_end` work; parsing pauses until it is done.
    completion: Option<Completion>,
    closing: bool,
}

impl Session {
    async fn run(
        mut self,
        mut reader: OwnedReadHalf,
        cancel: CancellationToken,
        writer_task: JoinHandle<()>,
        server_cancel: CancellationToken,
    ) {
        info!(peer_addr = %self.peer_addr, "client connected");
        let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);
        let mut read_buf = vec![0u8; READ_CHUNK];

        loop {
            let deadline = self.transfers.deadline();
            tokio::select! {
                _ = cancel.cancelled() => break,

                _ = sleep_until(deadline) => {
                    if let Some(done) = self.transfers.expire() {
                        self.conclude(done);
                    }
                }

                read = reader.read(&mut read_buf) => {
                    match read {
                        Ok(0) => {
                            info!(peer_addr = %self.peer_addr, "client closed connection");
                            break;
                        }
                        Ok(n) => {
                            buf.extend_from_slice(&read_buf[..n]);
                            self.drain(&mut buf);
                        }
                        Err(e) => {
                            warn!(peer_addr = %self.peer_addr, "socket read error: {e}");
                            break;
                        }
                    }
                }
            }

            if self.closing {
                break;
            }
            if self.flush_due {
                self.flush_due = false;
                tokio::task::yield_now().await;
                self.run_flush().await;
            }
            if self.completion.is_some() {
                self.run_completion().await;
                // Messages that arrived behind `file_end`.
                self.drain(&mut buf);
            }
        }

        self.shut_down(writer_task, server_cancel.is_cancelled()).await;
    }

    /// Parses every complete message in `buf` and removes what was used.
    fn drain(&mut self, buf: &mut Vec<u8>) {
        let mut offset = 0;
        while !self.closing && self.completion.is_none() {
            let result = parse_next(&buf[offset..]);
            offset += result.consumed();
            match result {
                ParseResult::Incomplete => break,
                ParseResult::Skip(n) => trace!(bytes = n, "skipping unparseable input"),
                ParseResult::Json { text, .. } => self.on_json(&text),
                ParseResult::BinaryChunk(chunk) => {
                    self.on_chunk(&chunk.transfer_id, chunk.chunk_index, chunk.data)
                }
            }
        }
        buf.drain(..offset);
    }

    fn on_json(&mut self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(peer_addr = %self.peer_addr, "malformed JSON: {e}");
                self.reply(OutboundMessage::error("Invalid JSON", None));
                return;
            }
        };
        let transfer_id = value
            .get("transferId")
            .and_then(Value::as_str)
            .map(str::to_owned);

        match InboundMessage::from_value(value) {
            Ok(msg) => self.dispatch(msg),
            Err(ProtocolError::UnknownType(name)) => {
                warn!(msg_type = %name, "unknown message type");
                self.reply(OutboundMessage::error(format!("Unknown message type: {name}"), None));
            }
            Err(ProtocolError::MissingType) => {
                warn!("message without type");
                self.reply(OutboundMessage::error("Missing message type", None));
            }
            Err(ProtocolError::InvalidMessage(MessageType::FileStart)) => {
                warn!(?transfer_id, "invalid file_start");
                self.reply(OutboundMessage::FileStartAck(FileStartAck::rejected(
                    transfer_id.unwrap_or_default(),
                    "Invalid file_start message",
                )));
            }
            Err(e) => warn!(peer_addr = %self.peer_addr, "dropping message: {e}"),
        }
    }

    fn dispatch(&mut self, msg: InboundMessage) {
        debug!(msg_type = msg.msg_type().as_str(), "received");
        match msg {
            InboundMessage::Handshake(m) => self.on_handshake(m),
            InboundMessage::Ping(m) => self.on_ping(m),
            InboundMessage::FileStart(req) => {
                let status = self.state.status();
                match self.transfers.start(status, &req) {
                    Ok(()) => {
                        let progress = self.transfers.progress();
                        self.state.update(|s| {
                            s.status = ServerStatus::ReceivingFile;
                            s.transfer = progress;
                        });
                        self.reply(OutboundMessage::FileStartAck(FileStartAck::accepted(
                            req.transfer_id,
                        )));
                    }
                    Err(rejection) => {
                        info!(transfer_id = %req.transfer_id, "file_start rejected: {rejection}");
                        self.reply(OutboundMessage::FileStartAck(FileStartAck::rejected(
                            req.transfer_id,
                            rejection.to_string(),
                        )));
                    }
                }
            }
            InboundMessage::FileChunk(chunk) => {
                self.on_chunk(&chunk.transfer_id, chunk.chunk_index, chunk.data)
            }
            InboundMessage::FileEnd(end) => match self.transfers.begin_finish(&end.transfer_id) {
                Some(FinishStep::Done(done)) => self.conclude(done),
                Some(FinishStep::Pending(job)) => self.completion = Some(job),
                None => {}
            },
        }
    }

    fn on_handshake(&mut self, msg: Handshake) {
        handler::handle_handshake(self, msg);
    }

    fn on_ping(&mut self, msg: Ping) {
        handler::handle_ping(self, msg);
    }

    fn on_chunk(&mut self, transfer_id: &str, chunk_index: u32, data: Vec<u8>) {
        let status = self.state.status();
        match self.transfers.receive_chunk(status, transfer_id, chunk_index, data) {
            ChunkOutcome::Accepted { flush_due } => {
                self.flush_due |= flush_due;
                let progress = self.transfers.progress();
                self.state.update(|s| s.transfer = progress);
            }
            ChunkOutcome::Dropped(_) => {}
        }
    }

    /// Writes the detached pending buffer on the blocking pool.
    async fn run_flush(&mut self) {
        let Some(batch) = self.transfers.take_flush() else {
            return;
        };
        let transfer_id = batch.transfer_id.clone();
        let chunks = batch.chunk_count();

        let error = match tokio::task::spawn_blocking(move || batch.write()).await {
            Ok(Ok(bytes)) => {
                debug!(%transfer_id, chunks, bytes, "flushed pending chunks");
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(e) => e.to_string(),
        };

        if self
            .transfers
            .active()
            .is_some_and(|t| t.transfer_id == transfer_id)
        {
            if let Some(done) = self
                .transfers
                .fail(ErrorCode::DiskError, format!("Failed to write file: {error}"))
            {
                self.conclude(done);
            }
        }
    }

    /// Runs the detached `file_end` work on the blocking pool.
    async fn run_completion(&mut self) {
        let Some(job) = self.completion.take() else {
            return;
        };
        let transfer_id = job.transfer_id().to_owned();

        let done = match tokio::task::spawn_blocking(move || job.run()).await {
            Ok(completed) => self.transfers.complete(completed),
            Err(e) => {
                warn!(%transfer_id, "completion task failed: {e}");
                self.transfers
                    .fail(ErrorCode::DiskError, format!("Failed to write file: {e}"))
            }
        };
        if let Some(done) = done {
            self.conclude(done);
        }
    }

    /// Reports a finished transfer and returns the server to `Listening`.
    fn conclude(&mut self, done: Concluded) {
        let Concluded { report, cleanup } = done;
        self.state.update(|s| {
            s.status = ServerStatus::Listening;
            s.transfer = None;
        });
        self.reply(OutboundMessage::FileComplete(report));
        spawn_cleanup(cleanup);
    }

    async fn shut_down(mut self, writer_task: JoinHandle<()>, server_stopping: bool) {
        if let Some(done) = self.transfers.abort() {
            // The socket is gone; the report has nowhere to go.
            spawn_cleanup(done.cleanup);
        }

        // Closing the channel lets the pump write what is queued, then exit.
        drop(self.sender);
        if let Err(e) = writer_task.await {
            warn!("write pump task failed: {e}");
        }

        if !server_stopping {
            self.state.update(|s| {
                s.status = ServerStatus::Listening;
                s.client = None;
                s.transfer = None;
            });
        }
        info!(peer_addr = %self.peer_addr, "client disconnected");
    }

    fn reply(&self, msg: OutboundMessage) {
        let _ = self.sender.send(&msg);
    }
}

impl ControlContext for Session {
    fn status(&self) -> ServerStatus {
        self.state.status()
    }

    fn protocol_version(&self) -> &str {
        &self.config.protocol_version
    }

    fn device_name(&self) -> &str {
        &self.config.device_name
    }

    fn send(&mut self, msg: OutboundMessage) {
        self.reply(msg);
    }

    fn accept_client(&mut self, client: ClientInfo) {
        self.state.update(|s| {
            s.status = ServerStatus::Connected;
            s.client = Some(client);
        });
    }

    fn disconnect(&mut self) {
        self.closing = true;
    }
}

/// Runs a transfer's cleanup on a later scheduler tick.
fn spawn_cleanup(cleanup: CleanupTask) {
    tokio::spawn(async move {
        tokio::task::yield_now().await;
        cleanup.run();
    });
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
