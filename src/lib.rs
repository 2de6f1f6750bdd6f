//! beenet - a peer-to-peer networking library providing mutually
//! authenticated secure channels, LAN peer discovery, and Merkle-verified,
//! FEC-protected bulk file transfer.

pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod external;
pub mod identity;
pub mod keystore;
pub mod noise;
pub mod orchestrator;
pub mod resilience;
pub mod static_key;
pub mod transfer;

// Re-export commonly used types
pub use error::{Error, Result};
pub use orchestrator::PeerOrchestrator;
