//! TCP listener and server lifecycle coordinator.
//!
//! Binds the listening socket, accepts connections, and spawns a
//! session task per client. `start`/`shutdown`/`restart` treat the
//! listener and all active sessions as one logical unit; shutdown is
//! idempotent and makes a best-effort pass through every resource.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::events::{LogEvent, SharedSink};
use crate::heartbeat::HeartbeatSettings;
use crate::session::Session;

/// Active-session registry. Inserted into by the accept loop, removed
/// from by each session as its run loop exits, drained by the shutdown
/// sweep.
pub(crate) type SessionRegistry = Arc<Mutex<HashMap<u64, SessionHandle>>>;

/// Registry entry for one live session.
pub(crate) struct SessionHandle {
    pub peer: SocketAddr,
    pub cancel: CancellationToken,
}

/// Errors surfaced by `start`; everything else the server hits is
/// logged and contained (see the module docs on `session`).
#[derive(Debug)]
pub enum ServerError {
    /// The listening port could not be bound.
    Bind(String, std::io::Error),
    /// `start` was called while an instance is already running.
    AlreadyRunning,
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Bind(addr, e) => {
                write!(f, "Failed to bind listener on '{addr}': {e}")
            }
            ServerError::AlreadyRunning => write!(f, "Server is already running"),
        }
    }
}

impl std::error::Error for ServerError {}

/// Host-facing server handle: one logical echo server that can be
/// started, stopped and restarted on the same configured port.
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(config: Config, log: SharedSink) -> Self {
        Server {
            inner: Arc::new(ServerInner {
                config,
                log,
                next_session_id: AtomicU64::new(0),
                instance: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Bind the configured port and begin accepting connections.
    /// Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        self.inner.start().await
    }

    /// Stop the listener and every active session. Idempotent; all
    /// failures during the sweep are logged, never propagated. The
    /// listening socket is released by the time this returns.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }

    /// `shutdown` followed by `start` on the same configured port.
    pub async fn restart(&self) -> Result<SocketAddr, ServerError> {
        self.inner.shutdown().await;
        self.inner.start().await
    }

    /// The bound address, while running.
    #[cfg(test)]
    pub(crate) async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.instance.lock().await.as_ref().map(|i| i.local_addr)
    }

    /// Number of sessions accepted over the process lifetime. Ids are
    /// assigned from this counter and never reused.
    #[cfg(test)]
    pub(crate) fn sessions_started(&self) -> u64 {
        self.inner.next_session_id.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) async fn active_sessions(&self) -> usize {
        match self.inner.instance.lock().await.as_ref() {
            Some(i) => i.sessions.lock().unwrap().len(),
            None => 0,
        }
    }
}

/// Shared server state. Sessions hold an `Arc` of this so a remote
/// `End Server.` can drive the full shutdown from inside its own task.
pub(crate) struct ServerInner {
    config: Config,
    log: SharedSink,
    /// Process-lifetime counter; lives outside the restartable instance
    /// so ids stay unique and strictly increasing across restarts.
    next_session_id: AtomicU64,
    instance: tokio::sync::Mutex<Option<Instance>>,
}

/// One running server instance: everything `shutdown` must release.
struct Instance {
    shutdown: CancellationToken,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    sessions: SessionRegistry,
}

impl ServerInner {
    pub(crate) fn log(&self) -> &SharedSink {
        &self.log
    }

    async fn start(self: &Arc<Self>) -> Result<SocketAddr, ServerError> {
        let mut slot = self.instance.lock().await;
        if slot.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ServerError::Bind(addr.clone(), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::Bind(addr, e))?;

        // Informational only; a failed lookup never affects startup.
        match local_ip() {
            Some(ip) => self
                .log
                .emit(LogEvent::server(format!("Starting, local IP address {ip}"))),
            None => self
                .log
                .emit(LogEvent::server("Starting, local IP address unavailable")),
        }
        self.log
            .emit(LogEvent::server(format!("Listening on {local_addr}")));

        let shutdown = CancellationToken::new();
        let sessions: SessionRegistry = Arc::new(Mutex::new(HashMap::new()));
        let accept_task = tokio::spawn(accept_loop(
            Arc::clone(self),
            listener,
            shutdown.clone(),
            Arc::clone(&sessions),
        ));

        *slot = Some(Instance {
            shutdown,
            local_addr,
            accept_task,
            sessions,
        });
        Ok(local_addr)
    }

    pub(crate) async fn shutdown(self: &Arc<Self>) {
        let mut slot = self.instance.lock().await;
        let Some(instance) = slot.take() else {
            self.log
                .emit(LogEvent::server("Shutdown requested, server already stopped"));
            return;
        };

        // Unblocks the pending accept; session tokens are children of
        // this one, so every in-flight line read unblocks too.
        instance.shutdown.cancel();

        // Snapshot-then-close: sessions racing to remove themselves
        // must not make the sweep skip entries still needing closure.
        let handles: Vec<(u64, SessionHandle)> = {
            let mut sessions = instance.sessions.lock().unwrap();
            sessions.drain().collect()
        };
        for (id, handle) in handles {
            handle.cancel.cancel();
            self.log.emit(LogEvent::client(
                id,
                format!("Closing connection from {}", handle.peer),
            ));
        }

        // Wait for the accept loop so the listening socket is released
        // before shutdown reports completion. Sessions are cancelled,
        // not awaited: a session invoking this very shutdown must not
        // deadlock on its own join handle.
        if let Err(e) = instance.accept_task.await {
            self.log.emit(LogEvent::error(
                None,
                format!("Accept task failed during shutdown: {e}"),
            ));
        }

        self.log.emit(LogEvent::server("Server stopped"));
    }
}

/// Accept connections until the token is cancelled or the listener
/// breaks. Dropping the listener on exit releases the listening socket.
async fn accept_loop(
    inner: Arc<ServerInner>,
    listener: TcpListener,
    shutdown: CancellationToken,
    sessions: SessionRegistry,
) {
    let heartbeat = HeartbeatSettings {
        interval: Duration::from_millis(inner.config.heartbeat_interval_ms),
        report_all: inner.config.heartbeat_report_all,
    };

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            res = listener.accept() => match res {
                Ok(pair) => pair,
                Err(e) => {
                    if shutdown.is_cancelled() {
                        // Deliberate shutdown closed the listener.
                        break;
                    }
                    // The listener is presumed unusable; ending the
                    // loop beats spinning on a broken socket. The
                    // coordinator can still be asked to restart.
                    inner.log.emit(LogEvent::error(None, format!("Accept failed: {e}")));
                    break;
                }
            }
        };

        if shutdown.is_cancelled() {
            // Raced with shutdown after the sweep drained the registry;
            // drop the connection instead of registering a session
            // nothing would close.
            drop(stream);
            break;
        }

        let id = inner.next_session_id.fetch_add(1, Ordering::SeqCst);
        inner
            .log
            .emit(LogEvent::client(id, format!("Connection from {peer}")));

        let cancel = shutdown.child_token();
        sessions.lock().unwrap().insert(
            id,
            SessionHandle {
                peer,
                cancel: cancel.clone(),
            },
        );

        let session = Session::new(
            id,
            stream,
            peer,
            cancel,
            heartbeat,
            Arc::clone(&inner),
            Arc::clone(&sessions),
        );
        tokio::spawn(session.run());
    }
}

/// Best-effort local IP lookup for the startup log line. A UDP connect
/// sends nothing; it only asks the kernel which interface would route.
fn local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.connect(("8.8.8.8", 80)).ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Category, MemorySink};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::TcpStream;
    use tokio_test::assert_ok;

    fn test_config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            heartbeat_interval_ms: 1000,
            heartbeat_report_all: false,
            log_level: "info".to_string(),
        }
    }

    fn test_server() -> (Server, Arc<MemorySink>) {
        let sink = MemorySink::new();
        let server = Server::new(test_config(), sink.clone());
        (server, sink)
    }

    struct TestClient {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl TestClient {
        async fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (reader, writer) = stream.into_split();
            TestClient {
                reader: BufReader::new(reader),
                writer,
            }
        }

        async fn send(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        /// Read one reply line without its terminator. Returns `None`
        /// on EOF.
        async fn recv(&mut self) -> Option<String> {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line).await.unwrap();
            if n == 0 {
                return None;
            }
            Some(line.trim_end_matches('\n').to_string())
        }
    }

    #[tokio::test]
    async fn test_plain_echo_round_trip() {
        let (server, sink) = test_server();
        let addr = assert_ok!(server.start().await);

        let mut client = TestClient::connect(addr).await;
        client.send("hello").await;
        assert_eq!(client.recv().await.as_deref(), Some("Echo: hello"));

        server.shutdown().await;
        let logged = sink.matching("hello");
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].category, Category::Client);
    }

    #[tokio::test]
    async fn test_help_line_keeps_session_open() {
        let (server, _sink) = test_server();
        let addr = server.start().await.unwrap();

        let mut client = TestClient::connect(addr).await;
        client.send("?").await;
        assert_eq!(
            client.recv().await.as_deref(),
            Some("Echo: \"Bye.\" ends Client, \"End Server.\" ends Server")
        );
        client.send("still here").await;
        assert_eq!(client.recv().await.as_deref(), Some("Echo: still here"));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_bye_closes_only_that_session() {
        let (server, _sink) = test_server();
        let addr = server.start().await.unwrap();

        let mut first = TestClient::connect(addr).await;
        let mut second = TestClient::connect(addr).await;
        first.send("warm up").await;
        assert_eq!(first.recv().await.as_deref(), Some("Echo: warm up"));

        first.send("Bye.").await;
        assert_eq!(first.recv().await, None);

        second.send("unaffected").await;
        assert_eq!(second.recv().await.as_deref(), Some("Echo: unaffected"));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_end_server_closes_listener_and_sessions() {
        let (server, _sink) = test_server();
        let addr = server.start().await.unwrap();

        let mut first = TestClient::connect(addr).await;
        let mut second = TestClient::connect(addr).await;
        first.send("warm up").await;
        assert_eq!(first.recv().await.as_deref(), Some("Echo: warm up"));

        first.send("End Server.").await;
        // Both sessions close; by the time the invoking session sees
        // EOF the listening socket is already released.
        assert_eq!(first.recv().await, None);
        assert_eq!(second.recv().await, None);
        assert!(TcpStream::connect(addr).await.is_err());
        assert!(server.local_addr().await.is_none());

        let addr = server.restart().await.unwrap();
        let mut client = TestClient::connect(addr).await;
        client.send("back again").await;
        assert_eq!(client.recv().await.as_deref(), Some("Echo: back again"));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_latency_probe_and_malformed_fallback() {
        let (server, sink) = test_server();
        let addr = server.start().await.unwrap();

        let mut client = TestClient::connect(addr).await;
        let probe = format!("{} ping", crate::clock::now_stamp());
        client.send(&probe).await;
        let reply = client.recv().await.unwrap();
        assert!(reply.starts_with(&format!("Echo: {probe} ")));
        assert!(reply.ends_with(" ms"));
        // Scheduling jitter only; the stamp was formatted moments ago.
        let delta: i64 = reply
            .trim_end_matches(" ms")
            .rsplit(' ')
            .next()
            .unwrap()
            .parse()
            .unwrap();
        assert!(delta.abs() < 5000, "delta: {delta}");

        client.send("99:99:99.999 ping").await;
        assert_eq!(
            client.recv().await.as_deref(),
            Some("Echo: 99:99:99.999 ping")
        );

        server.shutdown().await;
        let errors = sink.matching("99:99:99.999");
        assert!(errors.iter().any(|e| e.category == Category::Error));
    }

    #[tokio::test]
    async fn test_session_ids_increase_across_restarts() {
        let (server, _sink) = test_server();
        let addr = server.start().await.unwrap();

        for i in 0..3u64 {
            let mut client = TestClient::connect(addr).await;
            client.send("count me").await;
            assert_eq!(client.recv().await.as_deref(), Some("Echo: count me"));
            assert_eq!(server.sessions_started(), i + 1);
        }

        let addr = server.restart().await.unwrap();
        let mut client = TestClient::connect(addr).await;
        client.send("after restart").await;
        assert_eq!(client.recv().await.as_deref(), Some("Echo: after restart"));
        assert_eq!(server.sessions_started(), 4);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (server, sink) = test_server();
        server.start().await.unwrap();

        server.shutdown().await;
        server.shutdown().await;

        assert_eq!(sink.matching("Server stopped").len(), 1);
        assert_eq!(sink.matching("already stopped").len(), 1);
        assert_eq!(server.active_sessions().await, 0);
    }

    #[tokio::test]
    async fn test_bind_error_is_reported() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = occupied.local_addr().unwrap();

        let sink = MemorySink::new();
        let config = Config {
            port: addr.port(),
            ..test_config()
        };
        let server = Server::new(config, sink);
        match server.start().await {
            Err(ServerError::Bind(_, _)) => {}
            other => panic!("expected a bind error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_start_while_running_is_rejected() {
        let (server, _sink) = test_server();
        server.start().await.unwrap();
        assert!(matches!(
            server.start().await,
            Err(ServerError::AlreadyRunning)
        ));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_active_set_drains_after_clients_leave() {
        let (server, sink) = test_server();
        let addr = server.start().await.unwrap();

        let mut client = TestClient::connect(addr).await;
        client.send("here").await;
        assert_eq!(client.recv().await.as_deref(), Some("Echo: here"));
        assert_eq!(server.active_sessions().await, 1);

        client.send("Bye.").await;
        assert_eq!(client.recv().await, None);
        // The session removes itself as its run loop exits.
        for _ in 0..50 {
            if server.active_sessions().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.active_sessions().await, 0);
        assert_eq!(sink.matching("Socket closed").len(), 1);

        server.shutdown().await;
    }
}
