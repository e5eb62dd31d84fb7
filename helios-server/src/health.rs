//! Per-connection ping/pong health checking.
//!
//! While a connection is open, a repeating task pings the peer every
//! `interval` and a one-shot task counts the pong missed if none arrives
//! within `timeout`. After `max_missed` consecutive misses the transport
//! is closed with code 1000 and reason "Ping timeout". Both tasks hold
//! only weak references; stopping aborts them and leaves the slots empty.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::HealthCheckConfig;
use crate::connection::{Connection, ConnectionState};
use crate::error::RequestError;
use crate::events::{ServerEvent, ServerEvents};
use crate::transport::Frame;

/// Close code and reason used when the peer stops answering pings.
pub const PING_TIMEOUT_CLOSE_CODE: u16 = 1000;
pub const PING_TIMEOUT_CLOSE_REASON: &str = "Ping timeout";

const MANUAL_PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Health counters and timer slots, owned by the connection.
pub(crate) struct HealthState {
    pub last_ping_at: Option<Instant>,
    pub last_pong_at: Option<Instant>,
    pub missed_pongs: u32,
    ping_task: Option<JoinHandle<()>>,
    timeout_task: Option<JoinHandle<()>>,
    pong_waiters: Vec<oneshot::Sender<Duration>>,
}

impl HealthState {
    pub(crate) fn new() -> Self {
        Self {
            last_ping_at: None,
            last_pong_at: None,
            missed_pongs: 0,
            ping_task: None,
            timeout_task: None,
            pong_waiters: Vec::new(),
        }
    }

    /// Clears timers and counters for a fresh transport generation.
    pub(crate) fn reset_for_reconnect(&mut self) {
        self.abort_tasks();
        self.missed_pongs = 0;
        self.last_ping_at = None;
        self.last_pong_at = Some(Instant::now());
        self.pong_waiters.clear();
    }

    fn abort_tasks(&mut self) {
        if let Some(task) = self.ping_task.take() {
            task.abort();
        }
        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
    }

    pub(crate) fn timers_running(&self) -> bool {
        self.ping_task.is_some() || self.timeout_task.is_some()
    }
}

/// Starts the ping loop for an open connection. Any previous loop is
/// stopped first, so rapid start/stop cycles cannot leak timers.
pub(crate) fn start(conn: &Arc<Connection>, cfg: &HealthCheckConfig, events: &ServerEvents) {
    if !cfg.enabled {
        return;
    }
    stop(conn);

    let weak = Arc::downgrade(conn);
    let cfg = cfg.clone();
    let events = events.clone();

    let task = tokio::spawn(async move {
        let start = tokio::time::Instant::now() + cfg.interval;
        let mut ticks = tokio::time::interval_at(start, cfg.interval);
        loop {
            ticks.tick().await;
            let Some(conn) = weak.upgrade() else {
                return;
            };
            if conn.state() != ConnectionState::Open {
                return;
            }

            let missed = conn.health.lock().unwrap().missed_pongs;
            if missed >= cfg.max_missed {
                debug!(connection = %conn.id(), missed, "ping timeout, closing transport");
                events.publish(ServerEvent::PingTimeout {
                    connection: conn.clone(),
                });
                conn.close(PING_TIMEOUT_CLOSE_CODE, PING_TIMEOUT_CLOSE_REASON);
                return;
            }

            conn.health.lock().unwrap().last_ping_at = Some(Instant::now());
            if conn.send_frame(Frame::Ping).is_err() {
                // Not writable this round; try again at the next tick.
                continue;
            }

            let timeout_task = spawn_pong_timeout(weak.clone(), cfg.timeout, events.clone());
            let mut health = conn.health.lock().unwrap();
            if let Some(previous) = health.timeout_task.take() {
                previous.abort();
            }
            health.timeout_task = Some(timeout_task);
        }
    });

    conn.health.lock().unwrap().ping_task = Some(task);
}

fn spawn_pong_timeout(
    weak: std::sync::Weak<Connection>,
    timeout: Duration,
    events: ServerEvents,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        let Some(conn) = weak.upgrade() else {
            return;
        };
        let missed = {
            let mut health = conn.health.lock().unwrap();
            let pong_raced_in = match (health.last_pong_at, health.last_ping_at) {
                (Some(pong), Some(ping)) => pong >= ping,
                _ => false,
            };
            if pong_raced_in {
                return;
            }
            health.missed_pongs += 1;
            health.missed_pongs
        };
        events.publish(ServerEvent::PingMissed {
            connection: conn,
            missed_pongs: missed,
        });
    })
}

/// Cancels both timers. Safe to call repeatedly and on never-started
/// connections.
pub(crate) fn stop(conn: &Connection) {
    conn.health.lock().unwrap().abort_tasks();
}

/// Records an inbound pong: resets the miss counter, cancels the pending
/// timeout, settles manual-ping waiters, and publishes the measured
/// round-trip latency.
pub(crate) fn on_pong(conn: &Arc<Connection>, events: &ServerEvents) {
    let (latency, waiters) = {
        let mut health = conn.health.lock().unwrap();
        let now = Instant::now();
        health.last_pong_at = Some(now);
        health.missed_pongs = 0;
        if let Some(task) = health.timeout_task.take() {
            task.abort();
        }
        let latency = health.last_ping_at.map(|ping| now.duration_since(ping));
        let waiters = if latency.is_some() {
            std::mem::take(&mut health.pong_waiters)
        } else {
            Vec::new()
        };
        (latency, waiters)
    };

    if let Some(latency) = latency {
        for waiter in waiters {
            let _ = waiter.send(latency);
        }
        events.publish(ServerEvent::PongReceived {
            connection: conn.clone(),
            latency,
        });
    }
}

/// Sends one ping and awaits the matching pong, yielding the round trip.
/// Rejects with `Timeout` after ten seconds.
pub(crate) async fn manual_ping(conn: &Arc<Connection>) -> Result<Duration, RequestError> {
    let (waiter, pong) = oneshot::channel();
    {
        let mut health = conn.health.lock().unwrap();
        health.pong_waiters.push(waiter);
        health.last_ping_at = Some(Instant::now());
    }
    conn.send_frame(Frame::Ping)?;

    match tokio::time::timeout(MANUAL_PING_TIMEOUT, pong).await {
        Ok(Ok(latency)) => Ok(latency),
        Ok(Err(_)) => Err(RequestError::ConnectionClosed),
        Err(_) => Err(RequestError::Timeout),
    }
}
