//! X25519 static key management for the Noise role (component 4.3).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{Error, Result};
use crate::identity::{self, Identity};
use crate::keystore::Keystore;

const MAX_SKEW_SECS: i64 = 300;

#[derive(Debug, Serialize, Deserialize)]
struct RotationMessage {
    #[serde(rename = "type")]
    kind: String,
    old_key: String,
    new_key: String,
    timestamp: i64,
    peer_id: String,
}

pub struct StaticKeyManager {
    secret: StaticSecret,
    public: PublicKey,
}

impl StaticKeyManager {
    pub async fn load_or_generate(keystore: &Keystore, peer_id: &str) -> Result<Self> {
        let key_id = format!("static_{peer_id}");
        if let Some(bytes) = keystore.get(&key_id).await? {
            let raw: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| Error::crypto("stored static key has wrong length"))?;
            return Ok(Self::from_secret(StaticSecret::from(raw)));
        }

        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let manager = Self::from_secret(secret);
        keystore.store(&key_id, manager.secret.to_bytes().to_vec(), true).await?;
        Ok(manager)
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn current(&self) -> ([u8; 32], [u8; 32]) {
        (self.secret.to_bytes(), self.public.to_bytes())
    }

    /// Replace the static key, persist the new one, and return a signed
    /// rotation announcement the peer can broadcast alongside the new
    /// public key. `(old_pub, new_pub)` is returned for caller bookkeeping.
    pub async fn rotate(
        &mut self,
        keystore: &Keystore,
        peer_id: &str,
        identity: &Identity,
    ) -> Result<([u8; 32], [u8; 32], Vec<u8>)> {
        let old_pub = self.public.to_bytes();
        let new_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let new_public = PublicKey::from(&new_secret);

        keystore
            .store(&format!("static_{peer_id}"), new_secret.to_bytes().to_vec(), true)
            .await?;

        let announcement = build_rotation_message(&old_pub, &new_public.to_bytes(), peer_id);
        let canonical = canonicalize(&announcement)?;
        let signature = identity.sign(&canonical);

        self.secret = new_secret;
        self.public = new_public;

        let mut signed = Vec::with_capacity(canonical.len() + identity::SIGNATURE_LEN);
        signed.extend_from_slice(&canonical);
        signed.extend_from_slice(&signature);
        Ok((old_pub, new_public.to_bytes(), signed))
    }
}

fn build_rotation_message(old_pub: &[u8; 32], new_pub: &[u8; 32], peer_id: &str) -> RotationMessage {
    RotationMessage {
        kind: "key_rotation".to_string(),
        old_key: hex::encode(old_pub),
        new_key: hex::encode(new_pub),
        timestamp: now_secs(),
        peer_id: peer_id.to_string(),
    }
}

/// Canonical JSON: object with sorted keys, no extraneous whitespace.
fn canonicalize(message: &RotationMessage) -> Result<Vec<u8>> {
    let value = serde_json::to_value(message)?;
    let Value::Object(map) = value else {
        unreachable!("RotationMessage always serializes to an object");
    };
    let sorted: std::collections::BTreeMap<_, _> = map.into_iter().collect();
    Ok(serde_json::to_vec(&sorted)?)
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}

/// Verify a signed rotation announcement produced by `rotate`, splitting the
/// trailing 64-byte Ed25519 signature off the canonical JSON payload.
/// Rejects a `type` mismatch, timestamp skew beyond 300s, or a bad signature
/// without mutating any state.
pub fn verify_rotation_message(signed: &[u8], identity_public_key: &[u8; 32]) -> Result<(Vec<u8>, Vec<u8>)> {
    if signed.len() < identity::SIGNATURE_LEN {
        return Err(Error::protocol("rotation message truncated"));
    }
    let split = signed.len() - identity::SIGNATURE_LEN;
    let (canonical, signature) = signed.split_at(split);

    if identity::verify(canonical, signature, identity_public_key) != identity::VerifyOutcome::Valid {
        return Err(Error::protocol("rotation message signature invalid"));
    }

    let message: RotationMessage =
        serde_json::from_slice(canonical).map_err(|e| Error::protocol(format!("malformed rotation message: {e}")))?;
    if message.kind != "key_rotation" {
        return Err(Error::protocol("rotation message has wrong type"));
    }
    if (now_secs() - message.timestamp).abs() > MAX_SKEW_SECS {
        return Err(Error::protocol("rotation message timestamp skew too large"));
    }

    let old_key = hex::decode(&message.old_key).map_err(|_| Error::protocol("rotation message old_key not hex"))?;
    let new_key = hex::decode(&message.new_key).map_err(|_| Error::protocol("rotation message new_key not hex"))?;
    Ok((old_key, new_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeystoreConfig;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_or_generate_persists() {
        let dir = TempDir::new().unwrap();
        let cfg = KeystoreConfig { path: dir.path().to_path_buf(), pbkdf2_iterations: 100 };
        let keystore = Keystore::open(cfg, None).await.unwrap();

        let first = StaticKeyManager::load_or_generate(&keystore, "p1").await.unwrap().current();
        let second = StaticKeyManager::load_or_generate(&keystore, "p1").await.unwrap().current();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn rotate_produces_verifiable_announcement() {
        let dir = TempDir::new().unwrap();
        let cfg = KeystoreConfig { path: dir.path().to_path_buf(), pbkdf2_iterations: 100 };
        let keystore = Keystore::open(cfg, None).await.unwrap();

        let mut manager = StaticKeyManager::load_or_generate(&keystore, "p1").await.unwrap();
        let identity = Identity::load_or_generate(&keystore, "p1").await.unwrap();
        let (old_pub, new_pub) = manager.current();

        let (returned_old, returned_new, signed) =
            manager.rotate(&keystore, "p1", &identity).await.unwrap();
        assert_eq!(old_pub, returned_old);
        assert_ne!(new_pub, returned_new);

        let (decoded_old, decoded_new) = verify_rotation_message(&signed, &identity.public_key()).unwrap();
        assert_eq!(decoded_old, returned_old.to_vec());
        assert_eq!(decoded_new, returned_new.to_vec());
    }

    #[test]
    fn verify_rejects_bad_signature() {
        let message = build_rotation_message(&[0u8; 32], &[1u8; 32], "p1");
        let canonical = canonicalize(&message).unwrap();
        let mut bogus = canonical;
        bogus.extend_from_slice(&[0u8; identity::SIGNATURE_LEN]);
        let identity_pub = [9u8; 32];
        assert!(verify_rotation_message(&bogus, &identity_pub).is_err());
    }
}
