//! TCP transfer server.
//!
//! Listens on a TCP port and serves a single client at a time. A new
//! connection replaces the current one.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use dropline_protocol::{PROTOCOL_VERSION, ServerStatus};
use dropline_transfer::{CleanupGeneration, FileSystem, LocalFileSystem, TransferManager, TransferPolicy};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ServerError;
use crate::connection::{self, ClientConnection};
use crate::state::{ServerState, StateStore};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: IpAddr,
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
    /// Name advertised to clients in `handshake_ack`.
    pub device_name: String,
    /// Version a client's handshake must match exactly.
    pub protocol_version: String,
    pub policy: TransferPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            device_name: "Dropline Receiver".into(),
            protocol_version: PROTOCOL_VERSION.into(),
            policy: TransferPolicy::default(),
        }
    }
}

struct Running {
    cancel: CancellationToken,
    accept_task: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// Shared with the accept loop.
struct Shared {
    config: Arc<ServerConfig>,
    fs: Arc<dyn FileSystem>,
    state: StateStore,
    generation: CleanupGeneration,
    client: Mutex<Option<ClientConnection>>,
}

/// The file-transfer server.
pub struct TransferServer {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl TransferServer {
    /// Creates a server that stores files on the local disk.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_file_system(config, Arc::new(LocalFileSystem))
    }

    pub fn with_file_system(config: ServerConfig, fs: Arc<dyn FileSystem>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config: Arc::new(config),
                fs,
                state: StateStore::default(),
                generation: CleanupGeneration::new(),
                client: Mutex::new(None),
            }),
            running: Mutex::new(None),
        }
    }

    /// Observable server state.
    pub fn state(&self) -> &StateStore {
        &self.shared.state
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Returns the bound address while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Returns `true` if a client socket is currently open.
    pub async fn has_client(&self) -> bool {
        self.shared
            .client
            .lock()
            .await
            .as_ref()
            .is_some_and(ClientConnection::is_connected)
    }

    /// Binds the listener and starts accepting clients.
    ///
    /// Moves `Idle → Starting → Listening`, or to `Error` if binding fails.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let state = &self.shared.state;
        state.update(|s| {
            *s = ServerState {
                status: ServerStatus::Starting,
                ..ServerState::default()
            }
        });

        let config = &self.shared.config;
        let bound = match TcpListener::bind((config.bind_addr, config.port)).await {
            Ok(listener) => listener.local_addr().map(|addr| (listener, addr)),
            Err(e) => Err(e),
        };
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                tracing::error!(port = config.port, "failed to bind: {e}");
                state.update(|s| {
                    s.status = ServerStatus::Error;
                    s.error = Some(e.to_string());
                });
                return Err(e.into());
            }
        };

        tracing::info!("transfer server listening on {local_addr}");
        state.update(|s| {
            s.status = ServerStatus::Listening;
            s.address = Some(local_addr);
        });

        let cancel = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.shared),
            cancel.clone(),
        ));
        *running = Some(Running {
            cancel,
            accept_task,
            local_addr,
        });
        Ok(local_addr)
    }

    /// Closes the client and the listener, then returns to `Idle`.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.accept_task.await {
            tracing::warn!("accept task failed: {e}");
        }
        self.shared.state.update(|s| *s = ServerState::default());
        tracing::info!("transfer server stopped");
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let client = shared.client.lock().await.take();
                if let Some(conn) = client {
                    conn.close_and_wait().await;
                }
                break;
            }

            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        accept_client(&shared, stream, peer_addr, &cancel).await;
                    }
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                    }
                }
            }
        }
    }
}

async fn accept_client(
    shared: &Shared,
    stream: tokio::net::TcpStream,
    peer_addr: SocketAddr,
    cancel: &CancellationToken,
) {
    // Wait for the old connection's cleanup so it cannot overwrite the
    // state set up for the new one.
    let old = shared.client.lock().await.take();
    if let Some(conn) = old {
        if conn.is_connected() {
            tracing::info!(%peer_addr, old = %conn.peer_addr, "replacing active client connection");
        }
        conn.close_and_wait().await;
    }

    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(%peer_addr, "set_nodelay failed: {e}");
    }

    shared.state.update(|s| {
        s.status = ServerStatus::Handshaking;
        s.client = None;
        s.transfer = None;
    });

    let transfers = TransferManager::new(
        shared.config.policy.clone(),
        Arc::clone(&shared.fs),
        shared.generation.clone(),
    );
    let conn = connection::spawn_connection(
        stream,
        peer_addr,
        Arc::clone(&shared.config),
        shared.state.clone(),
        transfers,
        cancel,
    );
    *shared.client.lock().await = Some(conn);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::path::Path;
    use std::time::Duration;

    use base64::Engine as _;
    use dropline_protocol::messages::{FileComplete, FileStartAck, HandshakeAck};
    use dropline_protocol::{ErrorCode, OutboundMessage, encode_chunk_frame};
    use dropline_transfer::ChunkFile;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

    const CHECKSUM: &str = "9c56cc51b374c3ba189210d5b6d4bf57790d351c96c47c02190ecf1e430635ab";

    fn test_config(dir: &Path) -> ServerConfig {
        ServerConfig {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            device_name: "Test Receiver".into(),
            policy: TransferPolicy::with_storage(dir.join("storage")),
            ..ServerConfig::default()
        }
    }

    async fn start_server(dir: &Path) -> (TransferServer, SocketAddr) {
        let server = TransferServer::new(test_config(dir));
        let addr = server.start().await.unwrap();
        (server, addr)
    }

    struct Client {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (reader, writer) = stream.into_split();
            Self {
                reader: BufReader::new(reader),
                writer,
            }
        }

        async fn send_json(&mut self, value: serde_json::Value) {
            let mut line = value.to_string().into_bytes();
            line.push(b'\n');
            self.writer.write_all(&line).await.unwrap();
        }

        async fn send_raw(&mut self, bytes: &[u8]) {
            self.writer.write_all(bytes).await.unwrap();
        }

        /// Next message, or `None` on EOF.
        async fn recv(&mut self) -> Option<OutboundMessage> {
            let mut line = String::new();
            let n = tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
                .await
                .expect("timed out waiting for a message")
                .unwrap();
            if n == 0 {
                return None;
            }
            Some(serde_json::from_str(&line).unwrap())
        }

        async fn handshake(&mut self) -> HandshakeAck {
            self.send_json(json!({
                "type": "handshake",
                "version": "1",
                "platform": "android",
                "appVersion": "2.1.0",
                "deviceName": "Pixel"
            }))
            .await;
            match self.recv().await {
                Some(OutboundMessage::HandshakeAck(ack)) => ack,
                other => panic!("expected handshake_ack, got {other:?}"),
            }
        }

        async fn file_start(&mut self, transfer_id: &str, file_size: u64, total_chunks: u32) -> FileStartAck {
            self.send_json(json!({
                "type": "file_start",
                "transferId": transfer_id,
                "fileName": "demo.zip",
                "fileSize": file_size,
                "mimeType": "application/zip",
                "checksum": CHECKSUM,
                "totalChunks": total_chunks,
                "chunkSize": 4
            }))
            .await;
            match self.recv().await {
                Some(OutboundMessage::FileStartAck(ack)) => ack,
                other => panic!("expected file_start_ack, got {other:?}"),
            }
        }

        async fn file_end(&mut self, transfer_id: &str) -> FileComplete {
            self.send_json(json!({"type": "file_end", "transferId": transfer_id}))
                .await;
            match self.recv().await {
                Some(OutboundMessage::FileComplete(done)) => done,
                other => panic!("expected file_complete, got {other:?}"),
            }
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn start_and_stop() {
        let dir = TempDir::new().unwrap();
        let (server, addr) = start_server(dir.path()).await;
        assert!(addr.port() > 0);
        assert_eq!(server.local_addr().await, Some(addr));

        let snap = server.state().snapshot();
        assert_eq!(snap.status, ServerStatus::Listening);
        assert_eq!(snap.address, Some(addr));
        assert!(!server.has_client().await);

        assert!(matches!(server.start().await, Err(ServerError::AlreadyRunning)));

        server.stop().await;
        assert_eq!(server.state().status(), ServerStatus::Idle);
        assert_eq!(server.local_addr().await, None);
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn bind_failure_sets_error() {
        let dir = TempDir::new().unwrap();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = test_config(dir.path());
        config.port = taken.local_addr().unwrap().port();

        let server = TransferServer::new(config);
        assert!(matches!(server.start().await, Err(ServerError::Io(_))));
        let snap = server.state().snapshot();
        assert_eq!(snap.status, ServerStatus::Error);
        assert!(snap.error.is_some());
    }

    #[tokio::test]
    async fn handshake_connects_client() {
        let dir = TempDir::new().unwrap();
        let (server, addr) = start_server(dir.path()).await;
        let mut client = Client::connect(addr).await;

        let ack = client.handshake().await;
        assert!(ack.accepted);
        assert_eq!(ack.version, PROTOCOL_VERSION);
        assert_eq!(ack.device_name, "Test Receiver");

        let snap = server.state().snapshot();
        assert_eq!(snap.status, ServerStatus::Connected);
        assert_eq!(snap.client.unwrap().device_name, "Pixel");
        assert!(server.has_client().await);

        server.stop().await;
    }

    #[tokio::test]
    async fn version_mismatch_disconnects() {
        let dir = TempDir::new().unwrap();
        let (server, addr) = start_server(dir.path()).await;
        let mut client = Client::connect(addr).await;

        client
            .send_json(json!({"type": "handshake", "version": "0", "platform": "ios", "appVersion": "1"}))
            .await;
        match client.recv().await {
            Some(OutboundMessage::HandshakeAck(ack)) => {
                assert!(!ack.accepted);
                assert!(ack.message.unwrap().contains("received 0"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(client.recv().await.is_none());
        assert!(server.state().snapshot().client.is_none());

        server.stop().await;
    }

    #[tokio::test]
    async fn ping_before_handshake_is_ignored() {
        let dir = TempDir::new().unwrap();
        let (server, addr) = start_server(dir.path()).await;
        let mut client = Client::connect(addr).await;

        client.send_json(json!({"type": "ping", "payload": 1})).await;
        // The first reply must be the handshake ack, not a pong.
        client.handshake().await;

        client.send_json(json!({"type": "ping", "payload": {"n": 2}})).await;
        match client.recv().await {
            Some(OutboundMessage::Pong(pong)) => assert_eq!(pong.payload, Some(json!({"n": 2}))),
            other => panic!("expected pong, got {other:?}"),
        }

        server.stop().await;
    }

    #[tokio::test]
    async fn protocol_errors_keep_connection() {
        let dir = TempDir::new().unwrap();
        let (server, addr) = start_server(dir.path()).await;
        let mut client = Client::connect(addr).await;
        client.handshake().await;

        client.send_raw(b"{not json}\n").await;
        assert!(matches!(client.recv().await, Some(OutboundMessage::Error(_))));

        client.send_json(json!({"type": "teleport"})).await;
        match client.recv().await {
            Some(OutboundMessage::Error(err)) => assert!(err.message.contains("teleport")),
            other => panic!("expected error, got {other:?}"),
        }

        client
            .send_json(json!({"type": "file_start", "transferId": "t9", "fileName": "x.zip"}))
            .await;
        match client.recv().await {
            Some(OutboundMessage::FileStartAck(ack)) => {
                assert_eq!(ack.transfer_id, "t9");
                assert!(!ack.accepted);
            }
            other => panic!("expected file_start_ack, got {other:?}"),
        }

        // Garbage bytes are skipped and the stream resynchronises.
        client.send_raw(b"\x00\x01\x02").await;
        client.send_json(json!({"type": "ping"})).await;
        assert!(matches!(client.recv().await, Some(OutboundMessage::Pong(_))));

        server.stop().await;
    }

    #[tokio::test]
    async fn binary_transfer_completes() {
        let dir = TempDir::new().unwrap();
        let (server, addr) = start_server(dir.path()).await;
        let mut client = Client::connect(addr).await;
        client.handshake().await;

        let ack = client.file_start("t1", 8, 2).await;
        assert!(ack.accepted, "{:?}", ack.message);
        assert_eq!(server.state().status(), ServerStatus::ReceivingFile);

        let mut frames = encode_chunk_frame("t1", 1, b"EFGH").unwrap();
        frames.extend(encode_chunk_frame("t1", 0, b"ABCD").unwrap());
        frames.extend(encode_chunk_frame("t1", 0, b"ABCD").unwrap());
        client.send_raw(&frames).await;

        let done = client.file_end("t1").await;
        assert!(done.success, "{:?}", done.error);
        assert_eq!(done.received_chunks, 2);
        assert_eq!(done.received_bytes, 8);

        let final_path = dir.path().join("storage").join("demo.zip");
        assert_eq!(std::fs::read(&final_path).unwrap(), b"ABCDEFGH");
        assert_eq!(server.state().status(), ServerStatus::Listening);
        assert!(server.has_client().await);

        let partial = dir.path().join("storage").join(".partial");
        wait_for(|| std::fs::read_dir(&partial).unwrap().next().is_none()).await;

        server.stop().await;
    }

    #[tokio::test]
    async fn base64_chunks_complete() {
        let dir = TempDir::new().unwrap();
        let (server, addr) = start_server(dir.path()).await;
        let mut client = Client::connect(addr).await;
        client.handshake().await;
        assert!(client.file_start("t1", 8, 2).await.accepted);

        for (index, data) in [(0, b"ABCD"), (1, b"EFGH")] {
            client
                .send_json(json!({
                    "type": "file_chunk",
                    "transferId": "t1",
                    "chunkIndex": index,
                    "data": base64::engine::general_purpose::STANDARD.encode(data)
                }))
                .await;
        }

        assert!(client.file_end("t1").await.success);
        server.stop().await;
    }

    #[tokio::test]
    async fn missing_chunk_reports_incomplete() {
        let dir = TempDir::new().unwrap();
        let (server, addr) = start_server(dir.path()).await;
        let mut client = Client::connect(addr).await;
        client.handshake().await;
        assert!(client.file_start("t1", 8, 2).await.accepted);

        client.send_raw(&encode_chunk_frame("t1", 0, b"ABCD").unwrap()).await;
        let done = client.file_end("t1").await;
        assert!(!done.success);
        assert_eq!(done.error_code, Some(ErrorCode::IncompleteTransfer));
        assert_eq!(done.error.as_deref(), Some("Missing chunks: 1"));
        assert_eq!(server.state().status(), ServerStatus::Listening);
        assert!(!dir.path().join("storage/demo.zip").exists());

        server.stop().await;
    }

    #[tokio::test]
    async fn second_transfer_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (server, addr) = start_server(dir.path()).await;
        let mut client = Client::connect(addr).await;
        client.handshake().await;

        assert!(client.file_start("t1", 8, 2).await.accepted);
        let ack = client.file_start("t2", 8, 2).await;
        assert!(!ack.accepted);
        assert_eq!(ack.message.as_deref(), Some("Another transfer is already in progress"));

        server.stop().await;
    }

    #[tokio::test]
    async fn file_start_requires_handshake() {
        let dir = TempDir::new().unwrap();
        let (server, addr) = start_server(dir.path()).await;
        let mut client = Client::connect(addr).await;

        let ack = client.file_start("t1", 8, 2).await;
        assert!(!ack.accepted);
        assert_eq!(server.state().status(), ServerStatus::Handshaking);

        server.stop().await;
    }

    #[tokio::test]
    async fn disconnect_mid_transfer_cleans_up() {
        let dir = TempDir::new().unwrap();
        let (server, addr) = start_server(dir.path()).await;
        let mut client = Client::connect(addr).await;
        client.handshake().await;
        assert!(client.file_start("t1", 8, 2).await.accepted);
        client.send_raw(&encode_chunk_frame("t1", 0, b"ABCD").unwrap()).await;
        drop(client);

        let state = server.state().clone();
        wait_for(|| state.status() == ServerStatus::Listening).await;
        let snap = server.state().snapshot();
        assert!(snap.client.is_none());
        assert!(snap.transfer.is_none());

        let partial = dir.path().join("storage").join(".partial");
        wait_for(|| std::fs::read_dir(&partial).unwrap().next().is_none()).await;

        server.stop().await;
    }

    #[tokio::test]
    async fn new_connection_replaces_old() {
        let dir = TempDir::new().unwrap();
        let (server, addr) = start_server(dir.path()).await;
        let mut first = Client::connect(addr).await;
        first.handshake().await;

        let mut second = Client::connect(addr).await;
        assert!(first.recv().await.is_none());
        assert!(second.handshake().await.accepted);
        assert!(server.has_client().await);

        server.stop().await;
        assert!(second.recv().await.is_none());
    }

    fn flushing_config(dir: &Path) -> ServerConfig {
        let mut config = test_config(dir);
        config.policy.flush_threshold = 4;
        config
    }

    #[tokio::test]
    async fn threshold_flushes_write_out_of_order_chunks() {
        let dir = TempDir::new().unwrap();
        let server = TransferServer::new(flushing_config(dir.path()));
        let addr = server.start().await.unwrap();
        let mut client = Client::connect(addr).await;
        client.handshake().await;
        assert!(client.file_start("t1", 12, 3).await.accepted);

        for (index, data) in [(2, b"CCCC"), (0, b"AAAA"), (1, b"BBBB")] {
            client.send_raw(&encode_chunk_frame("t1", index, data).unwrap()).await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let done = client.file_end("t1").await;
        assert!(done.success, "{:?}", done.error);
        assert_eq!(done.received_bytes, 12);
        let final_path = dir.path().join("storage").join("demo.zip");
        assert_eq!(std::fs::read(&final_path).unwrap(), b"AAAABBBBCCCC");

        server.stop().await;
    }

    struct FailingFile;

    impl ChunkFile for FailingFile {
        fn write_at(&self, _offset: u64, _data: &[u8]) -> io::Result<()> {
            Err(io::Error::other("disk full"))
        }
        fn close(&self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Local disk, except that writes to transfer files fail.
    struct FailingWrites;

    impl FileSystem for FailingWrites {
        fn create_dir_all(&self, path: &Path) -> io::Result<()> {
            LocalFileSystem.create_dir_all(path)
        }
        fn create_file(&self, path: &Path) -> io::Result<Arc<dyn ChunkFile>> {
            LocalFileSystem.create_file(path)?;
            Ok(Arc::new(FailingFile))
        }
        fn exists(&self, path: &Path) -> bool {
            LocalFileSystem.exists(path)
        }
        fn remove_file(&self, path: &Path) -> io::Result<()> {
            LocalFileSystem.remove_file(path)
        }
        fn move_file(&self, from: &Path, to: &Path) -> io::Result<()> {
            LocalFileSystem.move_file(from, to)
        }
        fn open_read(&self, path: &Path) -> io::Result<Box<dyn io::Read + Send>> {
            LocalFileSystem.open_read(path)
        }
    }

    #[tokio::test]
    async fn flush_failure_reports_disk_error() {
        let dir = TempDir::new().unwrap();
        let server = TransferServer::with_file_system(
            flushing_config(dir.path()),
            Arc::new(FailingWrites),
        );
        let addr = server.start().await.unwrap();
        let mut client = Client::connect(addr).await;
        client.handshake().await;
        assert!(client.file_start("t1", 8, 2).await.accepted);

        client.send_raw(&encode_chunk_frame("t1", 0, b"ABCD").unwrap()).await;
        match client.recv().await {
            Some(OutboundMessage::FileComplete(done)) => {
                assert!(!done.success);
                assert_eq!(done.error_code, Some(ErrorCode::DiskError));
                assert!(done.error.unwrap().contains("disk full"));
            }
            other => panic!("expected file_complete, got {other:?}"),
        }
        assert_eq!(server.state().status(), ServerStatus::Listening);
        assert!(!dir.path().join("storage/demo.zip").exists());

        // The connection survives; the client may start over.
        assert!(client.handshake().await.accepted);
        assert!(server.has_client().await);

        server.stop().await;
    }

    #[tokio::test]
    async fn transfer_times_out() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        config.policy.timeout_secs = 1;
        let server = TransferServer::new(config);
        let addr = server.start().await.unwrap();

        let mut client = Client::connect(addr).await;
        client.handshake().await;
        assert!(client.file_start("t1", 8, 2).await.accepted);

        match client.recv().await {
            Some(OutboundMessage::FileComplete(done)) => {
                assert_eq!(done.error_code, Some(ErrorCode::Timeout));
                assert_eq!(done.error.as_deref(), Some("Global timeout exceeded"));
            }
            other => panic!("expected file_complete, got {other:?}"),
        }
        assert_eq!(server.state().status(), ServerStatus::Listening);

        server.stop().await;
    }
}
