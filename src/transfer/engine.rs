//! Transfer lifecycle: sender/receiver state machines and resumable state (4.6.5).

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::config::TransferConfig;
use crate::error::{Error, Result};
use crate::transfer::chunker::{chunk_bytes, Chunk};
use crate::transfer::ecc::{EccBlock, EccConfig};
use crate::transfer::enhanced_merkle::EnhancedMerkleProof;
use crate::transfer::flow_control::FlowController;
use crate::transfer::merkle::{Hash, MerkleTree};

/// Observer capability injected at construction so the engine never depends
/// on an event bus directly (the orchestrator adapts these calls to
/// `transfer_progress`/`transfer_completed`/`transfer_failed` events).
#[derive(Debug, Clone)]
pub enum TransferEvent {
    Progress { transfer_id: String, completed: usize, total: usize },
    Complete { transfer_id: String },
    Error { transfer_id: String, message: String },
}

pub trait TransferObserver: Send + Sync {
    fn notify(&self, event: TransferEvent);
}

#[derive(Default)]
pub struct NoopObserver;

impl TransferObserver for NoopObserver {
    fn notify(&self, _event: TransferEvent) {}
}

/// A handle callers hold to an in-progress transfer on either side.
pub enum TransferHandle {
    Sending(TransferSender),
    Receiving(TransferReceiver),
}

/// Resumable progress: total chunk count, the completed set, negotiated
/// chunk size, and the Merkle root, serialized as the JSON shape in §6.
#[derive(Debug, Clone)]
pub struct TransferState {
    pub transfer_id: String,
    pub total_chunks: usize,
    pub completed_chunks: BTreeSet<usize>,
    pub chunk_size: usize,
    pub merkle_root: Hash,
}

impl TransferState {
    pub fn progress(&self) -> f64 {
        if self.total_chunks == 0 {
            return 1.0;
        }
        self.completed_chunks.len() as f64 / self.total_chunks as f64
    }

    pub fn missing_chunks(&self) -> Vec<usize> {
        (0..self.total_chunks).filter(|i| !self.completed_chunks.contains(i)).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.completed_chunks.len() == self.total_chunks
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let wire = WireState {
            transfer_id: self.transfer_id.clone(),
            total_chunks: self.total_chunks,
            completed_chunks: self.completed_chunks.iter().copied().collect(),
            chunk_size: self.chunk_size,
            merkle_root: hex::encode(self.merkle_root),
            progress: self.progress(),
        };
        let tmp = path.as_ref().with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&wire)?).await?;
        tokio::fs::rename(&tmp, path.as_ref()).await?;
        Ok(())
    }

    /// Load state from disk, rejecting a `transfer_id` mismatch as fatal.
    pub async fn load(path: impl AsRef<Path>, expected_transfer_id: &str) -> Result<Self> {
        let raw = tokio::fs::read(path.as_ref()).await?;
        let wire: WireState = serde_json::from_slice(&raw).map_err(|e| Error::transfer(format!("invalid transfer state file: {e}")))?;
        if wire.transfer_id != expected_transfer_id {
            return Err(Error::transfer("resumed transfer_id does not match expected transfer"));
        }
        let merkle_root_vec = hex::decode(&wire.merkle_root).map_err(|_| Error::transfer("transfer state merkle_root not hex"))?;
        let merkle_root: Hash = merkle_root_vec
            .try_into()
            .map_err(|_| Error::transfer("transfer state merkle_root wrong length"))?;
        Ok(Self {
            transfer_id: wire.transfer_id,
            total_chunks: wire.total_chunks,
            completed_chunks: wire.completed_chunks.into_iter().collect(),
            chunk_size: wire.chunk_size,
            merkle_root,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireState {
    transfer_id: String,
    total_chunks: usize,
    completed_chunks: Vec<usize>,
    chunk_size: usize,
    merkle_root: String,
    progress: f64,
}

/// Sender side: holds the built Merkle tree and drives chunk admission
/// through a `FlowController`.
pub struct TransferSender {
    transfer_id: String,
    tree: MerkleTree,
    chunks: Vec<Chunk>,
    flow: FlowController,
    next_unsent: usize,
    observer: Arc<dyn TransferObserver>,
    ecc: Option<EccConfig>,
}

impl TransferSender {
    pub fn new(transfer_id: impl Into<String>, data: &[u8], chunk_size: usize, config: &TransferConfig, observer: Arc<dyn TransferObserver>) -> Self {
        let chunks = chunk_bytes(data, chunk_size);
        let leaf_bytes: Vec<Vec<u8>> = chunks.iter().map(|c| c.bytes.clone()).collect();
        let tree = MerkleTree::from_chunks(&leaf_bytes);
        let ecc_config = EccConfig { data_block_size: config.ecc_data_block_size, ecc_symbols: config.ecc_symbols };
        let ecc = ecc_config.validate().is_ok().then_some(ecc_config);
        Self {
            transfer_id: transfer_id.into(),
            tree,
            chunks,
            flow: FlowController::new(config),
            next_unsent: 0,
            observer,
            ecc,
        }
    }

    pub fn root(&mut self) -> Hash {
        self.tree.root().expect("non-empty transfer always has a root")
    }

    pub fn total_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Pop the next chunk to transmit if the flow window admits it,
    /// returning its bytes and an inclusion proof. When the chunk fits
    /// within the configured ECC data block size, an `EccBlock` is attached
    /// so the receiver can recover from corruption (4.6.3); larger chunks
    /// carry no ECC block. Records the send time for RTT accounting.
    pub fn next_send(&mut self) -> Option<(usize, Vec<u8>, EnhancedMerkleProof)> {
        if self.next_unsent >= self.chunks.len() || !self.flow.can_admit() {
            return None;
        }
        let index = self.next_unsent;
        let proof = self.tree.proof(index).expect("index within bounds");
        let bytes = self.chunks[index].bytes.clone();

        let ecc_block = self.ecc.as_ref().and_then(|cfg| {
            if bytes.len() > cfg.data_block_size {
                return None;
            }
            EccBlock::encode(index, bytes.clone(), cfg).ok()
        });
        let send_bytes = ecc_block.as_ref().map(|b| b.encoded.clone()).unwrap_or_else(|| bytes.clone());
        let enhanced = EnhancedMerkleProof::new(proof, ecc_block);

        self.flow.on_send(index);
        self.next_unsent += 1;
        Some((index, send_bytes, enhanced))
    }

    pub fn on_ack(&mut self, index: usize, bytes_len: usize) {
        self.flow.on_ack(index, bytes_len);
        self.observer.notify(TransferEvent::Progress {
            transfer_id: self.transfer_id.clone(),
            completed: index + 1,
            total: self.chunks.len(),
        });
    }

    pub fn on_congestion_signal(&mut self) {
        self.flow.on_congestion_signal();
    }

    pub fn is_complete(&self) -> bool {
        self.next_unsent >= self.chunks.len()
    }
}

/// Receiver side: verifies inbound chunks against the expected root and
/// writes them into a pre-sized file at `index * chunk_size`.
pub struct TransferReceiver {
    state: TransferState,
    path: PathBuf,
    observer: Arc<dyn TransferObserver>,
}

impl TransferReceiver {
    /// Create the parent directory, pre-size the destination file to
    /// `total_chunks * chunk_size` zero bytes, and begin tracking state.
    pub async fn start_receive(
        transfer_id: impl Into<String>,
        path: impl Into<PathBuf>,
        expected_root: Hash,
        total_chunks: usize,
        chunk_size: usize,
        observer: Arc<dyn TransferObserver>,
    ) -> Result<Self> {
        if total_chunks == 0 {
            return Err(Error::validation("total_chunks must be greater than zero"));
        }
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new().create(true).write(true).truncate(true).open(&path).await?;
        file.set_len((total_chunks * chunk_size) as u64).await?;

        Ok(Self {
            state: TransferState {
                transfer_id: transfer_id.into(),
                total_chunks,
                completed_chunks: BTreeSet::new(),
                chunk_size,
                merkle_root: expected_root,
            },
            path,
            observer,
        })
    }

    pub async fn resume(path: impl Into<PathBuf>, state_path: impl AsRef<Path>, expected_transfer_id: &str, observer: Arc<dyn TransferObserver>) -> Result<Self> {
        let state = TransferState::load(state_path, expected_transfer_id).await?;
        Ok(Self { state, path: path.into(), observer })
    }

    pub fn missing_chunks(&self) -> Vec<usize> {
        self.state.missing_chunks()
    }

    pub fn is_complete(&self) -> bool {
        self.state.is_complete()
    }

    pub fn progress(&self) -> f64 {
        self.state.progress()
    }

    /// Verify proof against the expected root, falling back to ECC-assisted
    /// recovery on a standard verification failure (4.6.3), then write the
    /// canonical chunk bytes at its offset and mark it completed. Duplicate
    /// indices already in the completed set are accepted idempotently.
    /// Verification or bounds failures are reported as transfer errors
    /// without admitting the chunk.
    pub async fn accept_chunk(&mut self, index: usize, bytes: &[u8], proof: &EnhancedMerkleProof) -> Result<()> {
        if index >= self.state.total_chunks {
            let err = Error::transfer(format!("chunk index {index} out of range"));
            self.observer.notify(TransferEvent::Error { transfer_id: self.state.transfer_id.clone(), message: err.to_string() });
            return Err(err);
        }
        if self.state.completed_chunks.contains(&index) {
            return Ok(());
        }
        if proof.proof.index != index {
            return Err(Error::transfer("proof index does not match chunk index"));
        }

        let (verified, canonical) = proof.verify_with_recovery(bytes, &self.state.merkle_root);
        if !verified {
            return Err(Error::transfer("chunk proof does not verify against expected root, even with ECC recovery"));
        }
        let canonical_bytes = canonical.as_deref().unwrap_or(bytes);

        let offset = (index * self.state.chunk_size) as u64;
        let mut file = tokio::fs::OpenOptions::new().write(true).open(&self.path).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.write_all(canonical_bytes).await?;

        self.state.completed_chunks.insert(index);
        let total = self.state.total_chunks;
        let completed = self.state.completed_chunks.len();
        if completed == total {
            self.observer.notify(TransferEvent::Complete { transfer_id: self.state.transfer_id.clone() });
        } else {
            self.observer.notify(TransferEvent::Progress { transfer_id: self.state.transfer_id.clone(), completed, total });
        }
        Ok(())
    }

    pub async fn save_state(&self, state_path: impl AsRef<Path>) -> Result<()> {
        self.state.save(state_path).await
    }

    pub fn transfer_id(&self) -> &str {
        &self.state.transfer_id
    }
}

/// Re-hash `path` in `chunk_size`-byte pieces and recompute the Merkle root,
/// returning whether it matches `expected_root`.
pub async fn verify_complete_file(path: impl AsRef<Path>, chunk_size: usize, expected_root: Hash) -> Result<bool> {
    let data = tokio::fs::read(path).await?;
    let chunks = chunk_bytes(&data, chunk_size);
    let leaf_bytes: Vec<Vec<u8>> = chunks.into_iter().map(|c| c.bytes).collect();
    let mut tree = MerkleTree::from_chunks(&leaf_bytes);
    Ok(tree.root() == Some(expected_root))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config() -> TransferConfig {
        TransferConfig {
            default_chunk_size: 64 * 1024,
            min_chunk_size: 4 * 1024,
            max_chunk_size: 64 * 1024,
            initial_window: 4,
            min_window: 1,
            max_window: 64,
            rtt_samples: 20,
            ecc_data_block_size: 223,
            ecc_symbols: 10,
        }
    }

    #[tokio::test]
    async fn s5_transfer_with_merkle_verification() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..(10 * 2usize.pow(20))).map(|i| (i % 251) as u8).collect();
        let chunk_size = 64 * 1024;

        let observer = Arc::new(NoopObserver);
        let mut sender = TransferSender::new("xfer-1", &data, chunk_size, &config(), observer.clone());
        let root = sender.root();
        assert_eq!(sender.total_chunks(), 160);

        let dest = dir.path().join("out.bin");
        let mut receiver =
            TransferReceiver::start_receive("xfer-1", &dest, root, sender.total_chunks(), chunk_size, observer).await.unwrap();

        while let Some((index, bytes, proof)) = sender.next_send() {
            receiver.accept_chunk(index, &bytes, &proof).await.unwrap();
            sender.on_ack(index, bytes.len());
        }

        assert!(receiver.is_complete());
        assert!(verify_complete_file(&dest, chunk_size, root).await.unwrap());
    }

    #[tokio::test]
    async fn corrupted_chunk_is_rejected_and_retransmit_succeeds() {
        let dir = TempDir::new().unwrap();
        let data = vec![7u8; 64 * 1024 * 3];
        let chunk_size = 64 * 1024;

        let observer = Arc::new(NoopObserver);
        let mut sender = TransferSender::new("xfer-2", &data, chunk_size, &config(), observer.clone());
        let root = sender.root();
        let dest = dir.path().join("out.bin");
        let mut receiver =
            TransferReceiver::start_receive("xfer-2", &dest, root, sender.total_chunks(), chunk_size, observer).await.unwrap();

        let (index, mut bytes, proof) = sender.next_send().unwrap();
        bytes[0] ^= 0xFF;
        assert!(receiver.accept_chunk(index, &bytes, &proof).await.is_err());
        assert!(!receiver.is_complete());

        let (_, good_bytes, good_proof) = (index, sender.chunks[index].bytes.clone(), proof);
        receiver.accept_chunk(index, &good_bytes, &good_proof).await.unwrap();
        sender.on_ack(index, good_bytes.len());

        while let Some((index, bytes, proof)) = sender.next_send() {
            receiver.accept_chunk(index, &bytes, &proof).await.unwrap();
            sender.on_ack(index, bytes.len());
        }
        assert!(receiver.is_complete());
        assert!(verify_complete_file(&dest, chunk_size, root).await.unwrap());
    }

    #[tokio::test]
    async fn corrupted_chunk_is_transparently_recovered_via_ecc_block() {
        let dir = TempDir::new().unwrap();
        let data = vec![9u8; 64 * 3];
        let chunk_size = 64;

        let observer = Arc::new(NoopObserver);
        let mut sender = TransferSender::new("xfer-ecc", &data, chunk_size, &config(), observer.clone());
        let root = sender.root();
        let dest = dir.path().join("out.bin");
        let mut receiver =
            TransferReceiver::start_receive("xfer-ecc", &dest, root, sender.total_chunks(), chunk_size, observer).await.unwrap();

        let (index, mut wire_bytes, proof) = sender.next_send().unwrap();
        assert!(proof.ecc_block.is_some(), "a chunk within the ECC block size should carry an ECC block");
        wire_bytes[0] ^= 0xFF;
        wire_bytes[1] ^= 0xFF;

        receiver.accept_chunk(index, &wire_bytes, &proof).await.unwrap();
        sender.on_ack(index, wire_bytes.len());

        while let Some((index, bytes, proof)) = sender.next_send() {
            receiver.accept_chunk(index, &bytes, &proof).await.unwrap();
            sender.on_ack(index, bytes.len());
        }

        assert!(receiver.is_complete());
        assert!(verify_complete_file(&dest, chunk_size, root).await.unwrap());
    }

    #[tokio::test]
    async fn property_10_duplicate_chunk_accept_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let data = vec![1u8; 4096];
        let chunk_size = 4096;
        let observer = Arc::new(NoopObserver);
        let mut sender = TransferSender::new("xfer-3", &data, chunk_size, &config(), observer.clone());
        let root = sender.root();
        let dest = dir.path().join("out.bin");
        let mut receiver =
            TransferReceiver::start_receive("xfer-3", &dest, root, sender.total_chunks(), chunk_size, observer).await.unwrap();

        let (index, bytes, proof) = sender.next_send().unwrap();
        receiver.accept_chunk(index, &bytes, &proof).await.unwrap();
        receiver.accept_chunk(index, &bytes, &proof).await.unwrap();
        assert_eq!(receiver.missing_chunks().len(), 0);
    }

    #[tokio::test]
    async fn s6_resume_after_cancellation() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..(64 * 1024 * 10)).map(|i| (i % 200) as u8).collect();
        let chunk_size = 64 * 1024;
        let observer = Arc::new(NoopObserver);
        let mut sender = TransferSender::new("xfer-resume", &data, chunk_size, &config(), observer.clone());
        let root = sender.root();
        let dest = dir.path().join("out.bin");
        let state_path = dir.path().join("state.json");

        {
            let mut receiver =
                TransferReceiver::start_receive("xfer-resume", &dest, root, sender.total_chunks(), chunk_size, observer.clone())
                    .await
                    .unwrap();
            for _ in 0..2 {
                let (index, bytes, proof) = sender.next_send().unwrap();
                receiver.accept_chunk(index, &bytes, &proof).await.unwrap();
                sender.on_ack(index, bytes.len());
            }
            receiver.save_state(&state_path).await.unwrap();
        }

        let mut resumed = TransferReceiver::resume(&dest, &state_path, "xfer-resume", observer).await.unwrap();
        let missing_before = resumed.missing_chunks();
        assert_eq!(missing_before.len(), sender.total_chunks() - 2);

        while let Some((index, bytes, proof)) = sender.next_send() {
            resumed.accept_chunk(index, &bytes, &proof).await.unwrap();
            sender.on_ack(index, bytes.len());
        }
        assert!(resumed.is_complete());
        assert!(verify_complete_file(&dest, chunk_size, root).await.unwrap());
    }
}
