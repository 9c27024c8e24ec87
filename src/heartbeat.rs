//! Per-session heartbeat monitor.
//!
//! Each session gets a repeating timer that samples the connection state
//! and the elapsed time since the previous tick. A tick arriving more
//! than 10% past the nominal interval means the scheduler was delayed,
//! and only then is a report emitted (unless `report_all` is set). This
//! is a scheduling-health diagnostic: it never closes a connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::events::{LogEvent, SharedSink};
use crate::session::SessionStatus;

/// Heartbeat timing, resolved from config at server start.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatSettings {
    pub interval: Duration,
    pub report_all: bool,
}

/// A tick is late when it arrives more than 10% past the interval.
pub fn slack_threshold(interval: Duration) -> Duration {
    interval * 11 / 10
}

/// One sample of a session's connection state, taken each tick.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatSample {
    pub connected: bool,
    pub closed: bool,
    pub delta_millis: i64,
}

impl HeartbeatSample {
    pub fn is_late(&self, threshold: Duration) -> bool {
        self.delta_millis > threshold.as_millis() as i64
    }

    fn describe(&self) -> String {
        let conn = if self.connected { "conn" } else { "unconn" };
        let open = if self.closed { "closed" } else { "open" };
        format!("{},{} {} ms since last check", conn, open, self.delta_millis)
    }
}

/// Launch the heartbeat task for one session. The task runs until the
/// token is cancelled; cancellation is permanent, a cancelled heartbeat
/// never ticks again.
pub fn spawn(
    session_id: u64,
    settings: HeartbeatSettings,
    status: Arc<SessionStatus>,
    cancel: CancellationToken,
    log: SharedSink,
) -> JoinHandle<()> {
    tokio::spawn(run(session_id, settings, status, cancel, log))
}

async fn run(
    session_id: u64,
    settings: HeartbeatSettings,
    status: Arc<SessionStatus>,
    cancel: CancellationToken,
    log: SharedSink,
) {
    let threshold = slack_threshold(settings.interval);
    let mut ticker = interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // No previous tick yet; the first sample is a baseline and is never
    // compared or reported.
    let mut prev: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let now = Instant::now();
        if let Some(prev) = prev.replace(now) {
            let sample = HeartbeatSample {
                connected: status.connected(),
                closed: status.is_closing(),
                delta_millis: now.duration_since(prev).as_millis() as i64,
            };
            if settings.report_all || sample.is_late(threshold) {
                log.emit(LogEvent::status(session_id, sample.describe()));
            }
        }
    }
}
