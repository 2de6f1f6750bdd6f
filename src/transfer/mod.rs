//! Chunked, Merkle-verified, FEC-protected bulk transfer (component 4.6).

mod chunker;
mod ecc;
mod engine;
mod enhanced_merkle;
mod flow_control;
mod merkle;

pub use chunker::{negotiate_chunk_size, Chunk};
pub use ecc::{EccBlock, EccConfig};
pub use engine::{NoopObserver, TransferEvent, TransferHandle, TransferObserver, TransferReceiver, TransferSender, TransferState};
pub use enhanced_merkle::EnhancedMerkleProof;
pub use flow_control::FlowController;
pub use merkle::{Hash, MerkleProof, MerkleTree};
