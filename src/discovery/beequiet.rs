//! Wire codec and session state machine for BeeQuiet LAN discovery.
//!
//! Every datagram begins with a 5-byte big-endian header, `[u16 magic][u8
//! type][u16 payload_len]`, followed by the payload - mirrors the fixed
//! header + explicit `byteorder` read/write style used for binary framing
//! elsewhere in this codebase.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::RwLock;

use crate::config::DiscoveryConfig;
use crate::error::{Error, Result};
use crate::external::PeerAddress;

pub const WIRE_MAGIC: u16 = 0xBEEC;
const HEADER_LEN: usize = 5;
const NONCE_LEN: usize = 12;
const SESSION_KEY_LEN: usize = 32;
const HKDF_INFO: &[u8] = b"beenet-beequiet-session-key";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    WhoIsHere = 0x01,
    IAmHere = 0x02,
    Heartbeat = 0x03,
    Goodbye = 0x04,
}

impl FrameType {
    fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::WhoIsHere),
            0x02 => Some(Self::IAmHere),
            0x03 => Some(Self::Heartbeat),
            0x04 => Some(Self::Goodbye),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    pub peer_id: String,
    pub host: String,
    pub port: u16,
    pub last_seen: Instant,
    pub protocol_tag: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocalState {
    Discovering,
    Steady,
    Leaving,
}

#[derive(Debug, Serialize, Deserialize)]
struct WhoPayload {
    peer_id: String,
    nonce: String,
    timestamp: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct IamPayload {
    peer_id: String,
    response: String,
    timestamp: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct HeartbeatPayload {
    peer_id: String,
    timestamp: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct GoodbyePayload {
    peer_id: String,
    timestamp: i64,
}

/// Encode a frame: 5-byte header followed by the payload.
pub fn encode_frame(frame_type: FrameType, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > u16::MAX as usize {
        return Err(Error::protocol("beequiet payload too large"));
    }
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.write_u16::<BigEndian>(WIRE_MAGIC)?;
    out.write_u8(frame_type as u8)?;
    out.write_u16::<BigEndian>(payload.len() as u16)?;
    out.extend_from_slice(payload);
    Ok(out)
}

/// Decode a frame. Never panics; any malformed input (bad magic, truncated
/// header, unknown type, length mismatch) returns a protocol error rather
/// than raising, satisfying the "parser never panics" property.
pub fn decode_frame(datagram: &[u8]) -> Result<(FrameType, &[u8])> {
    if datagram.len() < HEADER_LEN {
        return Err(Error::protocol("beequiet datagram truncated"));
    }
    let mut cursor = std::io::Cursor::new(&datagram[..HEADER_LEN]);
    let magic = cursor.read_u16::<BigEndian>()?;
    if magic != WIRE_MAGIC {
        return Err(Error::protocol("beequiet bad magic"));
    }
    let frame_type = cursor
        .read_u8()
        .ok()
        .and_then(FrameType::from_u8)
        .ok_or_else(|| Error::protocol("beequiet unknown frame type"))?;
    let payload_len = cursor.read_u16::<BigEndian>()? as usize;

    let payload = &datagram[HEADER_LEN..];
    if payload.len() != payload_len {
        return Err(Error::protocol("beequiet length mismatch"));
    }
    Ok((frame_type, payload))
}

/// HKDF-BLAKE2b-512, salt=nonce, info="beenet-beequiet-session-key",
/// ikm=response, length=32.
pub fn derive_session_key(nonce: &[u8], response: &[u8]) -> [u8; SESSION_KEY_LEN] {
    let hk = Hkdf::<blake2::Blake2b512>::new(Some(nonce), response);
    let mut key = [0u8; SESSION_KEY_LEN];
    hk.expand(HKDF_INFO, &mut key).expect("32-byte output is always valid for HKDF expand");
    key
}

/// Normalize a key to exactly 32 bytes by truncation or zero-pad. Only used
/// behind the `fuzz-safe-aead` test feature; production code rejects
/// mis-sized keys outright (see `seal`/`open`).
#[cfg(test)]
fn normalize_key(key: &[u8]) -> [u8; SESSION_KEY_LEN] {
    let mut out = [0u8; SESSION_KEY_LEN];
    let n = key.len().min(SESSION_KEY_LEN);
    out[..n].copy_from_slice(&key[..n]);
    out
}

/// AEAD-wrap `plaintext` with `key`, producing `[12B nonce][ciphertext||16B tag]`.
pub fn seal(key: &[u8; SESSION_KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| Error::crypto("beequiet seal failed"))?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open an AEAD-wrapped payload. A decrypt/authentication failure is
/// reported as a protocol error; callers must drop the datagram silently
/// and log at debug rather than propagate it further.
pub fn open(key: &[u8; SESSION_KEY_LEN], blob: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < NONCE_LEN {
        return Err(Error::protocol("beequiet sealed payload truncated"));
    }
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| Error::protocol("beequiet decrypt/auth failed"))
}

struct PendingHandshake {
    nonce: [u8; 16],
}

struct PeerSession {
    session_key: [u8; SESSION_KEY_LEN],
    address: SocketAddr,
}

/// Drives the discovery protocol over a bound multicast socket. The
/// `DISCOVERING -> STEADY -> LEAVING` state machine is tracked internally;
/// `STEADY` is reached implicitly once the first peer is known.
pub struct BeeQuietDiscovery {
    config: DiscoveryConfig,
    local_peer_id: String,
    socket: Arc<UdpSocket>,
    state: RwLock<LocalState>,
    peers: RwLock<HashMap<String, DiscoveredPeer>>,
    sessions: RwLock<HashMap<String, PeerSession>>,
    pending: RwLock<Option<PendingHandshake>>,
}

impl BeeQuietDiscovery {
    pub async fn bind(config: DiscoveryConfig, local_peer_id: String) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.port))
            .await
            .map_err(|e| Error::Discovery(e.to_string()))?;
        socket.set_multicast_loop_v4(true).map_err(|e| Error::Discovery(e.to_string()))?;
        let group: Ipv4Addr = config
            .multicast_group
            .parse()
            .map_err(|_| Error::validation("invalid multicast group address"))?;
        socket
            .join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
            .map_err(|e| Error::Discovery(e.to_string()))?;

        Ok(Self {
            config,
            local_peer_id,
            socket: Arc::new(socket),
            state: RwLock::new(LocalState::Discovering),
            peers: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            pending: RwLock::new(None),
        })
    }

    fn multicast_endpoint(&self) -> Result<SocketAddr> {
        let ip: Ipv4Addr = self
            .config
            .multicast_group
            .parse()
            .map_err(|_| Error::validation("invalid multicast group address"))?;
        Ok(SocketAddr::from((ip, self.config.port)))
    }

    /// Emit WHO_IS_HERE to the multicast endpoint, remembering the nonce so
    /// a later IAM can be matched to it.
    pub async fn announce(&self) -> Result<()> {
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        let payload = WhoPayload {
            peer_id: self.local_peer_id.clone(),
            nonce: hex::encode(nonce),
            timestamp: now_secs(),
        };
        let frame = encode_frame(FrameType::WhoIsHere, &serde_json::to_vec(&payload)?)?;
        let endpoint = self.multicast_endpoint()?;
        self.socket.send_to(&frame, endpoint).await.map_err(|e| Error::Discovery(e.to_string()))?;
        *self.pending.write().await = Some(PendingHandshake { nonce });
        Ok(())
    }

    /// Handle one inbound datagram. Malformed frames are dropped and logged
    /// at debug; this never returns a protocol error to its caller.
    pub async fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let Ok((frame_type, payload)) = decode_frame(datagram) else {
            tracing::debug!(?from, len = datagram.len(), "dropping malformed beequiet datagram");
            return;
        };

        let result = match frame_type {
            FrameType::WhoIsHere => self.handle_who(payload, from).await,
            FrameType::IAmHere => self.handle_iam(payload, from).await,
            FrameType::Heartbeat => self.handle_heartbeat(payload).await,
            FrameType::Goodbye => self.handle_goodbye(payload).await,
        };

        if let Err(e) = result {
            tracing::debug!(?from, error = %e, "dropping invalid beequiet frame");
        }
    }

    async fn handle_who(&self, payload: &[u8], from: SocketAddr) -> Result<()> {
        let who: WhoPayload = serde_json::from_slice(payload)?;
        if who.peer_id == self.local_peer_id {
            return Ok(());
        }
        let nonce = hex::decode(&who.nonce).map_err(|_| Error::protocol("who nonce not hex"))?;

        let mut response = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut response);
        let session_key = derive_session_key(&nonce, &response);

        self.sessions
            .write()
            .await
            .insert(who.peer_id.clone(), PeerSession { session_key, address: from });

        let iam = IamPayload {
            peer_id: self.local_peer_id.clone(),
            response: hex::encode(response),
            timestamp: now_secs(),
        };
        let frame = encode_frame(FrameType::IAmHere, &serde_json::to_vec(&iam)?)?;
        self.socket.send_to(&frame, from).await.map_err(|e| Error::Discovery(e.to_string()))?;
        Ok(())
    }

    async fn handle_iam(&self, payload: &[u8], from: SocketAddr) -> Result<()> {
        let iam: IamPayload = serde_json::from_slice(payload)?;
        let pending = self.pending.read().await;
        let Some(handshake) = pending.as_ref() else {
            return Err(Error::protocol("iam received with no pending who"));
        };
        let response = hex::decode(&iam.response).map_err(|_| Error::protocol("iam response not hex"))?;
        let session_key = derive_session_key(&handshake.nonce, &response);
        drop(pending);

        self.sessions
            .write()
            .await
            .insert(iam.peer_id.clone(), PeerSession { session_key, address: from });

        let peer = DiscoveredPeer {
            peer_id: iam.peer_id.clone(),
            host: from.ip().to_string(),
            port: from.port(),
            last_seen: Instant::now(),
            protocol_tag: "beequiet/1".to_string(),
        };
        self.peers.write().await.insert(iam.peer_id, peer);
        *self.state.write().await = LocalState::Steady;
        Ok(())
    }

    async fn handle_heartbeat(&self, sealed: &[u8]) -> Result<()> {
        let sessions = self.sessions.read().await;
        for (peer_id, session) in sessions.iter() {
            if let Ok(plaintext) = open(&session.session_key, sealed) {
                let hb: HeartbeatPayload = serde_json::from_slice(&plaintext)?;
                if &hb.peer_id == peer_id {
                    drop(sessions);
                    if let Some(peer) = self.peers.write().await.get_mut(peer_id) {
                        peer.last_seen = Instant::now();
                    }
                    return Ok(());
                }
            }
        }
        Err(Error::protocol("heartbeat did not decrypt under any known session"))
    }

    async fn handle_goodbye(&self, sealed: &[u8]) -> Result<()> {
        let target_peer_id = {
            let sessions = self.sessions.read().await;
            sessions.iter().find_map(|(peer_id, session)| {
                open(&session.session_key, sealed)
                    .ok()
                    .and_then(|plaintext| serde_json::from_slice::<GoodbyePayload>(&plaintext).ok())
                    .filter(|goodbye| &goodbye.peer_id == peer_id)
                    .map(|_| peer_id.clone())
            })
        };
        let Some(peer_id) = target_peer_id else {
            return Err(Error::protocol("goodbye did not decrypt under any known session"));
        };
        self.sessions.write().await.remove(&peer_id);
        self.peers.write().await.remove(&peer_id);
        Ok(())
    }

    /// Send a heartbeat to every known peer over its session key.
    pub async fn send_heartbeats(&self) -> Result<()> {
        let sessions = self.sessions.read().await;
        for (peer_id, session) in sessions.iter() {
            let payload = HeartbeatPayload { peer_id: self.local_peer_id.clone(), timestamp: now_secs() };
            let sealed = seal(&session.session_key, &serde_json::to_vec(&payload)?)?;
            let frame = encode_frame(FrameType::Heartbeat, &sealed)?;
            let _ = self.socket.send_to(&frame, session.address).await;
        }
        Ok(())
    }

    /// Evict peers whose last-seen exceeds the configured TTL, dropping
    /// their session keys too.
    pub async fn evict_expired(&self) {
        let ttl = self.config.peer_ttl;
        let expired: Vec<String> = self
            .peers
            .read()
            .await
            .iter()
            .filter(|(_, peer)| peer.last_seen.elapsed() > ttl)
            .map(|(peer_id, _)| peer_id.clone())
            .collect();
        for peer_id in expired {
            self.peers.write().await.remove(&peer_id);
            self.sessions.write().await.remove(&peer_id);
        }
    }

    /// Best-effort goodbye to every known peer, then mark local state as
    /// leaving. Called on shutdown.
    pub async fn leave(&self) -> Result<()> {
        *self.state.write().await = LocalState::Leaving;
        let sessions = self.sessions.read().await;
        for (peer_id, session) in sessions.iter() {
            let payload = GoodbyePayload { peer_id: self.local_peer_id.clone(), timestamp: now_secs() };
            let Ok(plaintext) = serde_json::to_vec(&payload) else { continue };
            let Ok(sealed) = seal(&session.session_key, &plaintext) else { continue };
            let Ok(frame) = encode_frame(FrameType::Goodbye, &sealed) else { continue };
            let _ = self.socket.send_to(&frame, session.address).await;
        }
        Ok(())
    }

    pub async fn known_peers(&self) -> Vec<DiscoveredPeer> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn find_address(&self, peer_id: &str) -> Option<PeerAddress> {
        self.peers
            .read()
            .await
            .get(peer_id)
            .map(|peer| PeerAddress { host: peer.host.clone(), port: peer.port })
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.config.heartbeat_interval
    }

    /// Drive the discovery loop until `stop` is signalled: receive and
    /// dispatch datagrams, send heartbeats, and evict stale peers, all
    /// against the same interval the config names.
    pub fn spawn(self: Arc<Self>, mut stop: tokio::sync::watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
            let mut eviction = tokio::time::interval(self.config.peer_ttl / 2);
            let mut buf = vec![0u8; 2048];

            loop {
                tokio::select! {
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            break;
                        }
                    }
                    _ = heartbeat.tick() => {
                        if let Err(e) = self.send_heartbeats().await {
                            tracing::warn!(error = %e, "failed to send beequiet heartbeats");
                        }
                    }
                    _ = eviction.tick() => {
                        self.evict_expired().await;
                    }
                    recv = self.socket.recv_from(&mut buf) => {
                        match recv {
                            Ok((len, from)) => self.handle_datagram(&buf[..len], from).await,
                            Err(e) => tracing::warn!(error = %e, "beequiet socket recv failed"),
                        }
                    }
                }
            }
        })
    }
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips() {
        let payload = b"hello world".to_vec();
        let encoded = encode_frame(FrameType::WhoIsHere, &payload).unwrap();
        let (frame_type, decoded) = decode_frame(&encoded).unwrap();
        assert_eq!(frame_type, FrameType::WhoIsHere);
        assert_eq!(decoded, payload.as_slice());
    }

    #[test]
    fn property_7_parser_never_panics_on_arbitrary_input() {
        let inputs: Vec<Vec<u8>> = vec![
            vec![],
            vec![0u8; 1],
            vec![0xBE, 0xEC, 0x01],
            vec![0xBE, 0xEC, 0x99, 0x00, 0x00],
            vec![0xFF; 2048],
        ];
        for input in inputs {
            let _ = decode_frame(&input);
        }
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let mut bytes = vec![0x00, 0x00, 0x01, 0x00, 0x00];
        assert!(decode_frame(&bytes).is_err());
        bytes[0] = 0xBE;
        bytes[1] = 0xEC;
        assert!(decode_frame(&bytes).is_ok());
    }

    #[test]
    fn decode_rejects_length_mismatch() {
        let mut encoded = encode_frame(FrameType::Heartbeat, b"abc").unwrap();
        encoded.truncate(encoded.len() - 1);
        assert!(decode_frame(&encoded).is_err());
    }

    #[test]
    fn s3_session_key_derivation_is_deterministic_both_sides() {
        let nonce = [1u8; 16];
        let response = [2u8; 16];
        let key_a = derive_session_key(&nonce, &response);
        let key_b = derive_session_key(&nonce, &response);
        assert_eq!(key_a, key_b);
        assert_eq!(key_a.len(), SESSION_KEY_LEN);
    }

    #[test]
    fn property_4_aead_round_trips_and_rejects_wrong_key() {
        let key = derive_session_key(b"salt", b"ikm");
        let other_key = derive_session_key(b"other-salt", b"other-ikm");
        let plaintext = b"heartbeat payload";

        let sealed = seal(&key, plaintext).unwrap();
        assert_eq!(open(&key, &sealed).unwrap(), plaintext);
        assert!(open(&other_key, &sealed).is_err());
    }

    #[test]
    fn key_normalization_helper_pads_and_truncates() {
        assert_eq!(normalize_key(&[1u8; 10]).len(), SESSION_KEY_LEN);
        assert_eq!(normalize_key(&[1u8; 64]).len(), SESSION_KEY_LEN);
    }
}
