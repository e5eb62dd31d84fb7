//! Transport handles: the seam between the coordinator and the WebSocket
//! adapter.
//!
//! A [`TransportHandle`] is the write side of a bounded per-connection
//! frame channel. The adapter (or a test harness) owns the read side and
//! drives the actual socket. `try_send` doubles as the writability probe:
//! a full or closed channel means the transport cannot take the frame
//! right now, and the caller gets a failure indication instead of
//! blocking.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

/// Process-unique identifier of one underlying transport. A
/// [`Connection`](crate::connection::Connection) may be served by several
/// transports over its lifetime (one per reconnect); each gets a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportId(u64);

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

impl TransportId {
    fn next() -> Self {
        Self(NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport-{}", self.0)
    }
}

/// An outbound frame handed to the transport adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping,
    Pong,
    Close { code: u16, reason: String },
}

/// Write handle to one underlying WebSocket.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    id: TransportId,
    frames: mpsc::Sender<Frame>,
}

impl TransportHandle {
    /// Creates a handle and the receiver the adapter drains into the
    /// socket. `capacity` bounds the number of undelivered frames; beyond
    /// it the transport reports not-writable.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                id: TransportId::next(),
                frames: tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> TransportId {
        self.id
    }

    /// Hands a frame to the adapter without blocking. Returns `false`
    /// when the transport is not writable (channel full or adapter gone).
    pub fn try_send(&self, frame: Frame) -> bool {
        self.frames.try_send(frame).is_ok()
    }

    /// Queues a close frame. The adapter finishes the closing handshake
    /// and reports the close back through the coordinator.
    pub fn close(&self, code: u16, reason: impl Into<String>) -> bool {
        self.try_send(Frame::Close {
            code,
            reason: reason.into(),
        })
    }
}
