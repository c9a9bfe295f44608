use bytes::Bytes;
use tokio::sync::broadcast;

pub const BROADCAST_CAPACITY: usize = 256;

/// One event on a session's output stream.
///
/// `Data` carries a raw PTY chunk in arrival order. `Exit` is the terminal
/// event, emitted exactly once when the child process exits; subscribers
/// that are still attached at that point will observe it before the session
/// is discarded.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Data(Bytes),
    Exit(i32),
}

/// Ordered multi-subscriber fan-out for one session's events.
///
/// Built on `tokio::sync::broadcast`: every subscriber receives an
/// independent, order-preserving copy of each event from the moment it
/// subscribes. There is no replay of history predating subscription; a
/// late subscriber gets the live tail only.
#[derive(Clone)]
pub struct Broker {
    tx: broadcast::Sender<SessionEvent>,
}

impl Broker {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    /// Publish a raw output chunk. Ignores send errors (no receivers).
    pub fn publish(&self, data: Bytes) {
        let _ = self.tx.send(SessionEvent::Data(data));
    }

    /// Publish the terminal exit event with the child's exit code.
    pub fn publish_exit(&self, code: i32) {
        let _ = self.tx.send(SessionEvent::Exit(code));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Number of currently attached subscribers. Used to verify that
    /// streaming clients detach cleanly and do not leak listeners.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn sender(&self) -> broadcast::Sender<SessionEvent> {
        self.tx.clone()
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}
