//! Client session: one accepted connection and its line protocol.
//!
//! Each session runs a read loop on its own task. Per line, in order:
//! a leading `HH:MM:SS.mmm` stamp makes the line a latency probe; then
//! the exact control strings `?`, `Bye.` and `End Server.`; anything
//! else is echoed back verbatim with an `Echo: ` prefix.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::clock;
use crate::events::{LogEvent, SharedSink};
use crate::heartbeat::{self, HeartbeatSettings};
use crate::server::{ServerInner, SessionRegistry};

const LINE_CAPACITY: usize = 1024;

/// Fixed reply to the `?` control line.
pub const HELP_REPLY: &str = "Echo: \"Bye.\" ends Client, \"End Server.\" ends Server";

/// Request to close this session only.
const CLOSE_CLIENT: &str = "Bye.";

/// Request to close the whole server.
const CLOSE_SERVER: &str = "End Server.";

/// Connection state shared with the heartbeat monitor.
pub struct SessionStatus {
    connected: AtomicBool,
    closing: AtomicBool,
}

impl SessionStatus {
    pub fn new() -> Self {
        SessionStatus {
            // Latches true at accept time, like a peer-connected flag.
            connected: AtomicBool::new(true),
            closing: AtomicBool::new(false),
        }
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn set_closing(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }
}

/// What the protocol decided for one received line.
enum Action {
    Reply(String),
    CloseSession,
    CloseServer,
}

pub(crate) struct Session {
    id: u64,
    stream: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
    heartbeat: HeartbeatSettings,
    status: Arc<SessionStatus>,
    server: Arc<ServerInner>,
    registry: SessionRegistry,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u64,
        stream: TcpStream,
        peer: SocketAddr,
        cancel: CancellationToken,
        heartbeat: HeartbeatSettings,
        server: Arc<ServerInner>,
        registry: SessionRegistry,
    ) -> Self {
        Session {
            id,
            stream,
            peer,
            cancel,
            heartbeat,
            status: Arc::new(SessionStatus::new()),
            server,
            registry,
        }
    }

    /// Run the session until EOF, a close request, an I/O error, or
    /// server shutdown. Consumes the session; all teardown happens here.
    pub(crate) async fn run(self) {
        let Session {
            id,
            stream,
            peer,
            cancel,
            heartbeat,
            status,
            server,
            registry,
        } = self;
        let log = server.log().clone();

        let _heartbeat = heartbeat::spawn(
            id,
            heartbeat,
            Arc::clone(&status),
            cancel.clone(),
            log.clone(),
        );

        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::with_capacity(LINE_CAPACITY);

        loop {
            line.clear();
            let n = tokio::select! {
                _ = cancel.cancelled() => break,
                res = reader.read_line(&mut line) => match res {
                    Ok(n) => n,
                    Err(e) => {
                        if cancel.is_cancelled() {
                            // Connection closed under us by a deliberate shutdown.
                            break;
                        }
                        log.emit(LogEvent::error(Some(id), format!("Read failed: {e}")));
                        break;
                    }
                }
            };
            if n == 0 {
                // EOF
                break;
            }
            let text = line.trim_end_matches(|c| c == '\r' || c == '\n');

            match handle_line(id, text, &log) {
                Action::Reply(reply) => {
                    if let Err(e) = send_reply(&mut writer, &reply).await {
                        log.emit(LogEvent::error(Some(id), format!("Write failed: {e}")));
                        break;
                    }
                }
                Action::CloseSession => break,
                Action::CloseServer => {
                    server.shutdown().await;
                    break;
                }
            }
        }

        status.set_closing();

        // Release in order: write half, read half, then the socket
        // itself (dropping both halves closes it). Close failures are
        // logged, never raised; the rest of teardown still runs.
        if let Err(e) = writer.shutdown().await {
            log.emit(LogEvent::error(Some(id), format!("Close failed: {e}")));
        }
        drop(writer);
        drop(reader);

        // Stops the heartbeat for good; already cancelled when the
        // server-wide shutdown got here first.
        cancel.cancel();

        registry.lock().unwrap().remove(&id);
        log.emit(LogEvent::client(id, format!("Socket closed ({peer})")));
    }
}

/// Apply the protocol rules to one line, emitting log events as a side
/// effect. The latency-pattern check runs before control-string
/// matching; a structurally matching stamp that fails to parse falls
/// back to the plain paths below.
fn handle_line(id: u64, line: &str, log: &SharedSink) -> Action {
    if clock::has_stamp_prefix(line) {
        let stamp = &line[..clock::STAMP_LEN];
        match clock::parse_stamp(stamp) {
            Ok(sent) => {
                // Signed; negative when the peer clock is ahead or the
                // probe straddled midnight.
                let delta = clock::now_millis_of_day() - sent;
                log.emit(LogEvent::client(id, format!("{line} {delta} ms")));
                return Action::Reply(format!("Echo: {line} {delta} ms"));
            }
            Err(e) => {
                log.emit(LogEvent::error(
                    Some(id),
                    format!("Error parsing timestamp '{stamp}': {e}"),
                ));
            }
        }
    }

    log.emit(LogEvent::client(id, line.to_string()));
    match line {
        "?" => Action::Reply(HELP_REPLY.to_string()),
        CLOSE_CLIENT => {
            log.emit(LogEvent::client(id, "Closing client per remote request"));
            Action::CloseSession
        }
        CLOSE_SERVER => {
            log.emit(LogEvent::client(id, "Closing server per remote request"));
            Action::CloseServer
        }
        _ => Action::Reply(format!("Echo: {line}")),
    }
}

/// Write a newline-terminated reply and flush it immediately.
async fn send_reply(writer: &mut OwnedWriteHalf, reply: &str) -> std::io::Result<()> {
    writer.write_all(reply.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
