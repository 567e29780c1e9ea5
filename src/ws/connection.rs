use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

// Ids double as awareness client ids, which browsers read as JS numbers.
const MAX_SAFE_ID: u64 = (1 << 53) - 1;

/// Random connection id. Instances share awareness state, so ids must not
/// repeat across processes.
fn random_connection_id() -> u64 {
    let (high, _) = Uuid::new_v4().as_u64_pair();
    (high & MAX_SAFE_ID).max(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Frames queued for the transport writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Binary(Vec<u8>),
    Close { code: u16, reason: String },
}

/// Events read from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Message(Vec<u8>),
    Close,
    Error(String),
}

/// Server side of one client socket. Writes go through an unbounded queue
/// drained by the transport task.
#[derive(Debug)]
pub struct ClientConnection {
    id: u64,
    state: AtomicU8,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ClientConnection {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Self {
            id: random_connection_id(),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            tx,
        };
        (conn, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Moves `Connecting` to `Open`. Any other state is left alone.
    pub fn open(&self) {
        let _ = self.state.compare_exchange(
            ConnectionState::Connecting as u8,
            ConnectionState::Open as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Queues a binary frame. Returns false when the connection is not open.
    pub fn send(&self, bytes: Vec<u8>) -> bool {
        if !self.is_open() {
            trace!(conn = self.id, "dropping frame for connection that is not open");
            return false;
        }
        if self.tx.send(Outbound::Binary(bytes)).is_err() {
            self.mark_closed();
            return false;
        }
        true
    }

    /// Starts the closing handshake. Closing twice is a no-op.
    pub fn close(&self, code: u16, reason: &str) {
        let previous = self.state.swap(ConnectionState::Closing as u8, Ordering::SeqCst);
        match ConnectionState::from_u8(previous) {
            ConnectionState::Closing | ConnectionState::Closed => {
                self.state.store(previous, Ordering::SeqCst);
            }
            _ => {
                let _ = self.tx.send(Outbound::Close {
                    code,
                    reason: reason.to_string(),
                });
            }
        }
    }

    pub fn mark_closed(&self) {
        self.state.store(ConnectionState::Closed as u8, Ordering::SeqCst);
    }
}
