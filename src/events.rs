//! Typed event bus (§6 kinds, supplemented per `core/events.py`).

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::external::PeerAddress;

#[derive(Debug, Clone)]
pub struct PeerConnectedPayload {
    pub peer_id: String,
    pub address: PeerAddress,
}

#[derive(Debug, Clone)]
pub struct PeerDisconnectedPayload {
    pub peer_id: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct PeerDiscoveredPayload {
    pub peer_id: String,
    pub address: PeerAddress,
}

#[derive(Debug, Clone)]
pub struct TransferStartedPayload {
    pub transfer_id: String,
    pub peer_id: String,
    pub total_chunks: usize,
}

#[derive(Debug, Clone)]
pub struct TransferProgressPayload {
    pub transfer_id: String,
    pub completed_chunks: usize,
    pub total_chunks: usize,
}

#[derive(Debug, Clone)]
pub struct TransferCompletedPayload {
    pub transfer_id: String,
}

#[derive(Debug, Clone)]
pub struct TransferFailedPayload {
    pub transfer_id: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct KeyRotatedPayload {
    pub peer_id: String,
    pub old_public_key: [u8; 32],
    pub new_public_key: [u8; 32],
}

#[derive(Debug, Clone)]
pub struct NetworkErrorPayload {
    pub peer_id: Option<String>,
    pub message: String,
}

/// One variant per kind named in §6, each carrying its own typed payload
/// rather than a stringly-typed map.
#[derive(Debug, Clone)]
pub enum Event {
    PeerConnected(PeerConnectedPayload),
    PeerDisconnected(PeerDisconnectedPayload),
    PeerDiscovered(PeerDiscoveredPayload),
    TransferStarted(TransferStartedPayload),
    TransferProgress(TransferProgressPayload),
    TransferCompleted(TransferCompletedPayload),
    TransferFailed(TransferFailedPayload),
    KeyRotated(KeyRotatedPayload),
    NetworkError(NetworkErrorPayload),
}

pub trait EventBus: Send + Sync {
    fn emit(&self, event: Event);
}

/// FIFO queue per subscriber with a bounded channel; an overflowing send is
/// logged rather than silently discarded.
pub struct BoundedEventBus {
    subscribers: std::sync::RwLock<Vec<mpsc::Sender<Event>>>,
}

impl BoundedEventBus {
    pub fn new() -> Self {
        Self { subscribers: std::sync::RwLock::new(Vec::new()) }
    }

    /// Register a new subscriber with the given channel capacity, returning
    /// the receiving half.
    pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(capacity);
        self.subscribers.write().expect("subscriber lock poisoned").push(tx);
        rx
    }
}

impl Default for BoundedEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for BoundedEventBus {
    fn emit(&self, event: Event) {
        let subscribers = self.subscribers.read().expect("subscriber lock poisoned");
        for subscriber in subscribers.iter() {
            if let Err(mpsc::error::TrySendError::Full(_)) = subscriber.try_send(event.clone()) {
                tracing::warn!("event bus subscriber channel full, dropping event");
            }
        }
    }
}

/// Discards every event. Used where no embedding application has wired a
/// real event bus.
#[derive(Default)]
pub struct NoopEventBus;

impl EventBus for NoopEventBus {
    fn emit(&self, _event: Event) {}
}

pub type SharedEventBus = Arc<dyn EventBus>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_emitted_event() {
        let bus = BoundedEventBus::new();
        let mut rx = bus.subscribe(4);
        bus.emit(Event::PeerDiscovered(PeerDiscoveredPayload {
            peer_id: "peer-a".to_string(),
            address: PeerAddress { host: "10.0.0.1".to_string(), port: 9000 },
        }));
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::PeerDiscovered(_)));
    }

    #[test]
    fn noop_bus_accepts_any_event_without_panicking() {
        let bus = NoopEventBus;
        bus.emit(Event::NetworkError(NetworkErrorPayload { peer_id: None, message: "x".to_string() }));
    }
}
