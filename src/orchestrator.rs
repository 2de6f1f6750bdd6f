//! Binds every component into a running peer process (component 4.8).

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex, RwLock};

use crate::config::BeenetConfig;
use crate::discovery::BeeQuietDiscovery;
use crate::error::{Error, Result};
use crate::events::{
    Event, KeyRotatedPayload, NetworkErrorPayload, PeerConnectedPayload, PeerDisconnectedPayload, SharedEventBus,
    TransferCompletedPayload, TransferFailedPayload, TransferStartedPayload,
};
use crate::external::{ExternalAddressProbe, PeerAddress, PeerDirectory};
use crate::identity::Identity;
use crate::keystore::Keystore;
use crate::noise::{NoiseChannel, Role};
use crate::resilience::ResilienceController;
use crate::static_key::StaticKeyManager;
use crate::transfer::{EnhancedMerkleProof, Hash, NoopObserver, TransferReceiver, TransferSender};

#[derive(Debug, Serialize, Deserialize)]
enum WireMessage {
    Chunk { index: usize, bytes: Vec<u8>, proof: EnhancedMerkleProof },
    Ack { index: usize },
}

async fn write_framed(writer: &mut OwnedWriteHalf, payload: &[u8]) -> Result<()> {
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    Ok(())
}

async fn read_framed(reader: &mut OwnedReadHalf) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// One connection in the peer arena: a transport-backed Noise channel plus
/// serialized send/receive halves. Held by peer-id, not by a back-pointer
/// into the orchestrator.
struct Connection {
    peer_id: String,
    noise: Mutex<NoiseChannel>,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
}

impl Connection {
    async fn send_app_message(&self, msg: &WireMessage) -> Result<()> {
        let plaintext = bincode::serialize(msg)?;
        let ciphertext = self.noise.lock().await.encrypt(&plaintext)?;
        write_framed(&mut *self.writer.lock().await, &ciphertext).await
    }

    async fn recv_app_message(&self) -> Result<WireMessage> {
        let ciphertext = read_framed(&mut *self.reader.lock().await).await?;
        let plaintext = self.noise.lock().await.decrypt(&ciphertext)?;
        bincode::deserialize(&plaintext).map_err(Error::from)
    }
}

/// Opaque handle to a registered connection; callers address it by peer-id.
#[derive(Debug, Clone)]
pub struct ConnectionHandle(pub String);

/// Opaque handle to a running transfer; resolves once the background task
/// driving it finishes.
pub struct TransferHandle {
    pub transfer_id: String,
    task: tokio::task::JoinHandle<Result<()>>,
}

impl TransferHandle {
    pub async fn join(self) -> Result<()> {
        self.task.await.map_err(|e| Error::transfer(format!("transfer task panicked: {e}")))?
    }
}

pub struct PeerOrchestrator {
    config: BeenetConfig,
    local_peer_id: String,
    identity: Identity,
    keystore: Arc<Keystore>,
    static_keys: Arc<RwLock<StaticKeyManager>>,
    peers: RwLock<HashMap<String, Arc<Connection>>>,
    event_bus: SharedEventBus,
    peer_directory: Arc<dyn PeerDirectory>,
    address_probe: Arc<dyn ExternalAddressProbe>,
    resilience: Arc<ResilienceController>,
    discovery: Arc<BeeQuietDiscovery>,
    janitor_stop: watch::Sender<bool>,
}

impl PeerOrchestrator {
    pub async fn new(
        config: BeenetConfig,
        passphrase: Option<&str>,
        event_bus: SharedEventBus,
        peer_directory: Arc<dyn PeerDirectory>,
        address_probe: Arc<dyn ExternalAddressProbe>,
    ) -> Result<Self> {
        let keystore = Arc::new(Keystore::open(config.keystore.clone(), passphrase).await?);
        let identity = Identity::load_or_generate(&keystore, "local").await?;
        let local_peer_id = identity.peer_id().to_string();
        let static_keys = Arc::new(RwLock::new(StaticKeyManager::load_or_generate(&keystore, &local_peer_id).await?));
        let resilience = Arc::new(ResilienceController::new(config.resilience.clone()));
        let discovery = Arc::new(BeeQuietDiscovery::bind(config.discovery.clone(), local_peer_id.clone()).await?);
        let (janitor_stop, _) = watch::channel(false);

        Ok(Self {
            config,
            local_peer_id,
            identity,
            keystore,
            static_keys,
            peers: RwLock::new(HashMap::new()),
            event_bus,
            peer_directory,
            address_probe,
            resilience,
            discovery,
            janitor_stop,
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.local_peer_id
    }

    /// Spawn the resilience janitor and the BeeQuiet discovery loop, and
    /// broadcast an initial WHO_IS_HERE. The inbound TCP listener is driven
    /// by the embedder via `accept` plus its own chosen bind address; this
    /// keeps the orchestrator agnostic of a specific listen port.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.resilience.clone().spawn_janitor(self.janitor_stop.subscribe());
        self.discovery.clone().spawn(self.janitor_stop.subscribe());
        self.discovery.announce().await
    }

    pub async fn dial(self: &Arc<Self>, peer_id: &str) -> Result<ConnectionHandle> {
        if self.resilience.is_blacklisted(peer_id).await {
            return Err(Error::validation(format!("peer {peer_id} is blacklisted")));
        }

        let address = match self.peer_directory.find(peer_id).await {
            Some(address) => address,
            None => self
                .discovery
                .find_address(peer_id)
                .await
                .ok_or_else(|| Error::validation(format!("peer {peer_id} not found in directory or discovery")))?,
        };

        let stream = match TcpStream::connect((address.host.as_str(), address.port)).await {
            Ok(stream) => stream,
            Err(e) => {
                self.resilience.record_connection_attempt(peer_id, false).await;
                return Err(Error::protocol(format!("dial failed: {e}")));
            }
        };
        self.resilience.record_connection_attempt(peer_id, true).await;

        let (static_priv, _) = self.static_keys.read().await.current();
        let mut noise = NoiseChannel::new();
        let msg1 = noise.start(Role::Initiator, &static_priv)?.expect("initiator always emits message 1");

        let (mut reader, mut writer) = stream.into_split();
        write_framed(&mut writer, &msg1).await?;
        let msg2 = read_framed(&mut reader).await?;
        let msg3 = noise.process(&msg2)?.expect("initiator emits message 3 after message 2");
        write_framed(&mut writer, &msg3).await?;

        self.register_connection(peer_id.to_string(), noise, reader, writer, Some(address)).await
    }

    pub async fn accept(self: &Arc<Self>, stream: TcpStream) -> Result<ConnectionHandle> {
        let (static_priv, _) = self.static_keys.read().await.current();
        let mut noise = NoiseChannel::new();
        noise.start(Role::Responder, &static_priv)?;

        let (mut reader, mut writer) = stream.into_split();
        let msg1 = read_framed(&mut reader).await?;
        let msg2 = noise.process(&msg1)?.expect("responder emits message 2 after message 1");
        write_framed(&mut writer, &msg2).await?;
        let msg3 = read_framed(&mut reader).await?;
        noise.process(&msg3)?;

        let remote_static = noise.remote_static_key().ok_or_else(|| Error::crypto("handshake finished without a remote static key"))?;
        let peer_id = hex::encode(remote_static);
        self.register_connection(peer_id, noise, reader, writer, None).await
    }

    async fn register_connection(
        &self,
        peer_id: String,
        noise: NoiseChannel,
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        address: Option<PeerAddress>,
    ) -> Result<ConnectionHandle> {
        let connection = Arc::new(Connection {
            peer_id: peer_id.clone(),
            noise: Mutex::new(noise),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        });
        self.peers.write().await.insert(peer_id.clone(), connection);

        if let Some(address) = address {
            self.peer_directory.register(&peer_id, address.clone()).await;
            self.event_bus.emit(Event::PeerConnected(PeerConnectedPayload { peer_id: peer_id.clone(), address }));
        } else {
            self.event_bus.emit(Event::PeerConnected(PeerConnectedPayload {
                peer_id: peer_id.clone(),
                address: PeerAddress { host: "unknown".to_string(), port: 0 },
            }));
        }
        Ok(ConnectionHandle(peer_id))
    }

    fn connection_for(&self, peers: &HashMap<String, Arc<Connection>>, peer_id: &str) -> Result<Arc<Connection>> {
        peers.get(peer_id).cloned().ok_or_else(|| Error::validation(format!("no connection registered for peer {peer_id}")))
    }

    pub async fn send_file(self: &Arc<Self>, peer_id: &str, path: impl Into<std::path::PathBuf>) -> Result<TransferHandle> {
        let connection = self.connection_for(&*self.peers.read().await, peer_id)?;
        let path = path.into();
        let data = tokio::fs::read(&path).await?;
        let transfer_id = format!("{peer_id}-{}", hex::encode(blake2_short(&data)));
        let total_estimate = data.len().div_ceil(self.config.transfer.default_chunk_size).max(1);

        self.event_bus.emit(Event::TransferStarted(TransferStartedPayload {
            transfer_id: transfer_id.clone(),
            peer_id: peer_id.to_string(),
            total_chunks: total_estimate,
        }));

        let config = self.config.transfer.clone();
        let event_bus = self.event_bus.clone();
        let transfer_id_for_task = transfer_id.clone();

        let task = tokio::spawn(async move {
            let mut sender = TransferSender::new(transfer_id_for_task.clone(), &data, config.default_chunk_size, &config, Arc::new(NoopObserver));
            let total = sender.total_chunks();
            let mut acked = 0usize;

            while acked < total {
                if let Some((index, bytes, proof)) = sender.next_send() {
                    let len = bytes.len();
                    if let Err(e) = connection.send_app_message(&WireMessage::Chunk { index, bytes, proof }).await {
                        event_bus.emit(Event::TransferFailed(TransferFailedPayload { transfer_id: transfer_id_for_task.clone(), reason: e.to_string() }));
                        return Err(e);
                    }
                    match connection.recv_app_message().await {
                        Ok(WireMessage::Ack { index: acked_index }) if acked_index == index => {
                            sender.on_ack(index, len);
                            acked += 1;
                        }
                        Ok(_) => sender.on_congestion_signal(),
                        Err(e) => {
                            event_bus.emit(Event::TransferFailed(TransferFailedPayload { transfer_id: transfer_id_for_task.clone(), reason: e.to_string() }));
                            return Err(e);
                        }
                    }
                }
            }

            event_bus.emit(Event::TransferCompleted(TransferCompletedPayload { transfer_id: transfer_id_for_task }));
            Ok(())
        });

        Ok(TransferHandle { transfer_id, task })
    }

    pub async fn receive_file(
        self: &Arc<Self>,
        peer_id: &str,
        transfer_id: String,
        expected_root: Hash,
        total_chunks: usize,
        dest: impl Into<std::path::PathBuf>,
    ) -> Result<TransferHandle> {
        let connection = self.connection_for(&*self.peers.read().await, peer_id)?;
        let dest = dest.into();
        let chunk_size = self.config.transfer.default_chunk_size;
        let event_bus = self.event_bus.clone();
        let transfer_id_for_task = transfer_id.clone();

        let task = tokio::spawn(async move {
            let mut receiver =
                TransferReceiver::start_receive(transfer_id_for_task.clone(), dest, expected_root, total_chunks, chunk_size, Arc::new(NoopObserver)).await?;

            while !receiver.is_complete() {
                match connection.recv_app_message().await {
                    Ok(WireMessage::Chunk { index, bytes, proof }) => {
                        if receiver.accept_chunk(index, &bytes, &proof).await.is_ok() {
                            connection.send_app_message(&WireMessage::Ack { index }).await?;
                        }
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        event_bus.emit(Event::TransferFailed(TransferFailedPayload { transfer_id: transfer_id_for_task.clone(), reason: e.to_string() }));
                        return Err(e);
                    }
                }
            }

            event_bus.emit(Event::TransferCompleted(TransferCompletedPayload { transfer_id: transfer_id_for_task }));
            Ok(())
        });

        Ok(TransferHandle { transfer_id, task })
    }

    /// Rotate the local static key and emit `key_rotated`.
    pub async fn rotate_static_key(&self) -> Result<()> {
        let (old_pub, new_pub, _signed) =
            self.static_keys.write().await.rotate(&self.keystore, &self.local_peer_id, &self.identity).await?;
        self.event_bus.emit(Event::KeyRotated(KeyRotatedPayload { peer_id: self.local_peer_id.clone(), old_public_key: old_pub, new_public_key: new_pub }));
        Ok(())
    }

    pub async fn disconnect(&self, peer_id: &str, reason: impl Into<String>) {
        if self.peers.write().await.remove(peer_id).is_some() {
            self.event_bus.emit(Event::PeerDisconnected(PeerDisconnectedPayload { peer_id: peer_id.to_string(), reason: reason.into() }));
        }
    }

    /// Send a best-effort goodbye over BeeQuiet, close every connection, and
    /// stop the janitor and discovery loops. Active transfers are expected
    /// to have already persisted their state via their own `save_state`
    /// call (the transfer task owns that responsibility, since the
    /// orchestrator does not hold transfer state directly).
    pub async fn shutdown(&self) -> Result<()> {
        self.discovery.leave().await?;
        let _ = self.janitor_stop.send(true);
        let peer_ids: Vec<String> = self.peers.read().await.keys().cloned().collect();
        for peer_id in peer_ids {
            self.disconnect(&peer_id, "shutdown").await;
        }
        self.keystore.close().await?;
        Ok(())
    }

    pub async fn probe_external_address(&self) -> Option<(String, u16)> {
        match self.address_probe.discover().await {
            Some(addr) => Some(addr),
            None => {
                self.event_bus.emit(Event::NetworkError(NetworkErrorPayload { peer_id: None, message: "no external address probe available".to_string() }));
                None
            }
        }
    }

    pub async fn listen(addr: impl tokio::net::ToSocketAddrs) -> Result<TcpListener> {
        TcpListener::bind(addr).await.map_err(|e| Error::Discovery(e.to_string()))
    }
}

fn blake2_short(data: &[u8]) -> [u8; 8] {
    use blake2::digest::consts::U8;
    use blake2::{Blake2b, Digest};
    let mut hasher = Blake2b::<U8>::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventBus;
    use crate::external::{InMemoryPeerDirectory, NoopAddressProbe};
    use tempfile::TempDir;

    async fn orchestrator(dir: &TempDir) -> Arc<PeerOrchestrator> {
        let mut config = BeenetConfig::default();
        config.keystore.path = dir.path().to_path_buf();
        config.keystore.pbkdf2_iterations = 100;
        config.discovery.port = 0;
        Arc::new(
            PeerOrchestrator::new(
                config,
                None,
                Arc::new(NoopEventBus),
                Arc::new(InMemoryPeerDirectory::new()),
                Arc::new(NoopAddressProbe),
            )
            .await
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn two_orchestrators_handshake_over_tcp() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let orch_a = orchestrator(&dir_a).await;
        let orch_b = orchestrator(&dir_b).await;

        let listener = PeerOrchestrator::listen(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept_orch = orch_b.clone();
        let accept_task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            accept_orch.accept(stream).await.unwrap()
        });

        orch_a
            .peer_directory
            .register("peer-b", PeerAddress { host: addr.ip().to_string(), port: addr.port() })
            .await;
        let handle = orch_a.dial("peer-b").await.unwrap();
        let accepted = accept_task.await.unwrap();

        assert_eq!(handle.0, "peer-b");
        assert!(!accepted.0.is_empty());
    }
}
