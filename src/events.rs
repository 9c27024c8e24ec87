//! Structured log events emitted by the server core.
//!
//! The core never renders or persists anything itself: every noteworthy
//! occurrence becomes a [`LogEvent`] handed to an injected [`LogSink`].
//! The host decides what to do with them (the default sink forwards to
//! `tracing`).

use std::fmt;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::clock;

/// Coarse event classification, used by sinks for routing/severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Listener and lifecycle events.
    Server,
    /// Per-session traffic and close events.
    Client,
    /// Heartbeat diagnostics.
    Status,
    /// Swallowed failures (accept, session I/O, parse, close).
    Error,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Category::Server => "server",
            Category::Client => "client",
            Category::Status => "status",
            Category::Error => "error",
        };
        f.write_str(s)
    }
}

/// One emitted record. Append-only; the core never reads these back.
#[derive(Debug, Clone)]
pub struct LogEvent {
    /// `HH:MM:SS.mmm` local time of day at emission.
    pub timestamp: String,
    pub category: Category,
    pub session_id: Option<u64>,
    pub message: String,
}

impl LogEvent {
    pub fn server(message: impl Into<String>) -> Self {
        Self::new(Category::Server, None, message)
    }

    pub fn client(session_id: u64, message: impl Into<String>) -> Self {
        Self::new(Category::Client, Some(session_id), message)
    }

    pub fn status(session_id: u64, message: impl Into<String>) -> Self {
        Self::new(Category::Status, Some(session_id), message)
    }

    pub fn error(session_id: Option<u64>, message: impl Into<String>) -> Self {
        Self::new(Category::Error, session_id, message)
    }

    fn new(category: Category, session_id: Option<u64>, message: impl Into<String>) -> Self {
        LogEvent {
            timestamp: clock::now_stamp(),
            category,
            session_id,
            message: message.into(),
        }
    }
}

/// Thread-safe consumer of log events. Implementations must tolerate
/// events arriving from any task at any time.
pub trait LogSink: Send + Sync {
    fn emit(&self, event: LogEvent);
}

/// Shared handle to a sink, cloned into every task that logs.
pub type SharedSink = Arc<dyn LogSink>;

/// Production sink: forwards events to `tracing`.
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&self, event: LogEvent) {
        match event.category {
            Category::Error => {
                error!(
                    category = %event.category,
                    session = event.session_id,
                    time = %event.timestamp,
                    "{}", event.message
                )
            }
            Category::Status => {
                warn!(
                    category = %event.category,
                    session = event.session_id,
                    time = %event.timestamp,
                    "{}", event.message
                )
            }
            _ => {
                info!(
                    category = %event.category,
                    session = event.session_id,
                    time = %event.timestamp,
                    "{}", event.message
                )
            }
        }
    }
}

/// Test sink collecting events in memory.
#[cfg(test)]
pub struct MemorySink {
    events: std::sync::Mutex<Vec<LogEvent>>,
}

#[cfg(test)]
impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(MemorySink {
            events: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Events whose message contains `needle`.
    pub fn matching(&self, needle: &str) -> Vec<LogEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.message.contains(needle))
            .collect()
    }
}

#[cfg(test)]
impl LogSink for MemorySink {
    fn emit(&self, event: LogEvent) {
        self.events.lock().unwrap().push(event);
    }
}
