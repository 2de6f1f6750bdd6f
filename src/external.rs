//! Collaborator interfaces consumed by the core (§6): peer directory lookup
//! and NAT traversal address discovery. Both are out of scope to implement
//! fully (DHT, NAT traversal) but the core depends on them only through
//! these traits, plus a minimal default implementation suitable for
//! LAN-only deployments and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

#[async_trait]
pub trait PeerDirectory: Send + Sync {
    async fn find(&self, peer_id: &str) -> Option<PeerAddress>;
    async fn register(&self, peer_id: &str, address: PeerAddress);
}

#[async_trait]
pub trait ExternalAddressProbe: Send + Sync {
    async fn discover(&self) -> Option<(String, u16)>;
}

/// In-memory peer directory. Suitable for LAN deployments that rely solely
/// on BeeQuiet discovery to populate addresses, and for tests.
#[derive(Default)]
pub struct InMemoryPeerDirectory {
    entries: RwLock<HashMap<String, PeerAddress>>,
}

impl InMemoryPeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PeerDirectory for InMemoryPeerDirectory {
    async fn find(&self, peer_id: &str) -> Option<PeerAddress> {
        self.entries.read().await.get(peer_id).cloned()
    }

    async fn register(&self, peer_id: &str, address: PeerAddress) {
        self.entries.write().await.insert(peer_id.to_string(), address);
    }
}

/// Always reports no external address. Used where NAT traversal is not
/// deployed.
#[derive(Default)]
pub struct NoopAddressProbe;

#[async_trait]
impl ExternalAddressProbe for NoopAddressProbe {
    async fn discover(&self) -> Option<(String, u16)> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_directory_round_trips() {
        let directory = InMemoryPeerDirectory::new();
        assert!(directory.find("peer-a").await.is_none());
        directory.register("peer-a", PeerAddress { host: "10.0.0.1".into(), port: 9000 }).await;
        assert_eq!(directory.find("peer-a").await, Some(PeerAddress { host: "10.0.0.1".into(), port: 9000 }));
    }

    #[tokio::test]
    async fn noop_probe_discovers_nothing() {
        let probe = NoopAddressProbe;
        assert_eq!(probe.discover().await, None);
    }
}
