//! Encrypted at-rest key storage (component 4.1).
//!
//! A `Keystore` holds an in-memory map of string-keyed records and mirrors it
//! to two files on disk: `keystore.json` (the record map, optionally
//! encrypted) and `salt` (the 32-byte PBKDF2 salt, present once any encrypted
//! save has happened). Every save goes to a temp sibling and is renamed over
//! the target so a crash mid-write never corrupts the store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hmac::Hmac;
use pbkdf2::pbkdf2;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::RwLock;
use zeroize::Zeroize;

use crate::config::KeystoreConfig;
use crate::error::{Error, Result};

const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyRecord {
    data: String, // base64
    encrypted: bool,
    created_at: u64,
}

pub struct Keystore {
    path: PathBuf,
    records: RwLock<HashMap<String, KeyRecord>>,
    cipher_key: Option<[u8; 32]>,
}

impl Keystore {
    /// Load the store at `config.path`, decrypting it with `passphrase` if
    /// one is given. A missing store materializes empty; it is written on
    /// the first `store`/`flush` call. A decrypt failure is fatal - the
    /// caller must not proceed with a partially-loaded store.
    pub async fn open(config: KeystoreConfig, passphrase: Option<&str>) -> Result<Self> {
        tokio::fs::create_dir_all(&config.path).await?;
        let store_path = config.path.join("keystore.json");
        let salt_path = config.path.join("salt");

        let cipher_key = match passphrase {
            Some(pass) => {
                let salt = load_or_create_salt(&salt_path).await?;
                Some(derive_key(pass, &salt, config.pbkdf2_iterations))
            }
            None => None,
        };

        let records = if store_path.exists() {
            let raw = tokio::fs::read(&store_path).await?;
            decode_records(&raw, cipher_key.as_ref())?
        } else {
            HashMap::new()
        };

        Ok(Self {
            path: config.path,
            records: RwLock::new(records),
            cipher_key,
        })
    }

    pub async fn store(&self, key_id: &str, bytes: Vec<u8>, encrypted: bool) -> Result<()> {
        let record = KeyRecord {
            data: base64::engine::general_purpose::STANDARD.encode(&bytes),
            encrypted,
            created_at: now_secs(),
        };
        self.records.write().await.insert(key_id.to_string(), record);
        self.flush().await
    }

    pub async fn get(&self, key_id: &str) -> Result<Option<Vec<u8>>> {
        let records = self.records.read().await;
        match records.get(key_id) {
            Some(record) => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(&record.data)
                    .map_err(|e| Error::storage(format!("corrupt record {key_id}: {e}")))?;
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }

    /// Remove a record, best-effort overwriting its in-memory bytes with
    /// random data before it is dropped. Returns whether a record existed.
    pub async fn delete(&self, key_id: &str) -> Result<bool> {
        let mut records = self.records.write().await;
        match records.remove(key_id) {
            Some(mut record) => {
                scramble(&mut record.data);
                self.save_locked(&records).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Atomically replace a record's bytes, returning the prior value.
    pub async fn rotate(&self, key_id: &str, new_bytes: Vec<u8>) -> Result<Option<Vec<u8>>> {
        let old = self.get(key_id).await?;
        self.store(key_id, new_bytes, true).await?;
        Ok(old)
    }

    pub async fn list(&self) -> Vec<String> {
        self.records.read().await.keys().cloned().collect()
    }

    pub async fn flush(&self) -> Result<()> {
        let records = self.records.read().await;
        self.save_locked(&records).await
    }

    pub async fn close(&self) -> Result<()> {
        self.flush().await
    }

    async fn save_locked(&self, records: &HashMap<String, KeyRecord>) -> Result<()> {
        let plaintext = serde_json::to_vec(records)?;
        let payload = match &self.cipher_key {
            Some(key) => encrypt_payload(key, &plaintext)?,
            None => plaintext,
        };

        let tmp_path = self.path.join("keystore.json.tmp");
        let final_path = self.path.join("keystore.json");
        tokio::fs::write(&tmp_path, &payload).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;
        Ok(())
    }
}

fn scramble(data: &mut String) {
    let mut bytes = std::mem::take(data).into_bytes();
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.zeroize();
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}

async fn load_or_create_salt(salt_path: &Path) -> Result<[u8; SALT_LEN]> {
    if salt_path.exists() {
        let raw = tokio::fs::read(salt_path).await?;
        raw.as_slice()
            .try_into()
            .map_err(|_| Error::storage("salt file has wrong length"))
    } else {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        tokio::fs::write(salt_path, salt).await?;
        Ok(salt)
    }
}

fn derive_key(passphrase: &str, salt: &[u8; SALT_LEN], iterations: u32) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::<Hmac<Sha256>>(passphrase.as_bytes(), salt, iterations, &mut key)
        .expect("pbkdf2 output length is fixed and always valid");
    key
}

fn encrypt_payload(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| Error::crypto("keystore encryption failed"))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn decrypt_payload(key: &[u8; 32], blob: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < NONCE_LEN {
        return Err(Error::storage("keystore blob truncated"));
    }
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| Error::storage("keystore decryption failed: wrong passphrase or corrupt store"))
}

fn decode_records(raw: &[u8], cipher_key: Option<&[u8; 32]>) -> Result<HashMap<String, KeyRecord>> {
    let plaintext = match cipher_key {
        Some(key) => decrypt_payload(key, raw)?,
        None => raw.to_vec(),
    };
    serde_json::from_slice(&plaintext).map_err(|e| Error::storage(format!("corrupt keystore: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> KeystoreConfig {
        KeystoreConfig { path: dir.path().to_path_buf(), pbkdf2_iterations: 100 }
    }

    #[tokio::test]
    async fn s1_keystore_round_trip_with_passphrase() {
        let dir = TempDir::new().unwrap();
        let value: Vec<u8> = (1..=32u8).collect();

        {
            let ks = Keystore::open(config(&dir), Some("hunter2")).await.unwrap();
            ks.store("k1", value.clone(), true).await.unwrap();
            ks.close().await.unwrap();
        }

        let ks = Keystore::open(config(&dir), Some("hunter2")).await.unwrap();
        assert_eq!(ks.get("k1").await.unwrap(), Some(value));
    }

    #[tokio::test]
    async fn wrong_passphrase_fails_open() {
        let dir = TempDir::new().unwrap();
        {
            let ks = Keystore::open(config(&dir), Some("right")).await.unwrap();
            ks.store("k1", vec![1, 2, 3], true).await.unwrap();
        }
        let result = Keystore::open(config(&dir), Some("wrong")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn delete_removes_record() {
        let dir = TempDir::new().unwrap();
        let ks = Keystore::open(config(&dir), None).await.unwrap();
        ks.store("k1", vec![9, 9, 9], false).await.unwrap();
        assert!(ks.delete("k1").await.unwrap());
        assert_eq!(ks.get("k1").await.unwrap(), None);
        assert!(!ks.delete("k1").await.unwrap());
    }

    #[tokio::test]
    async fn rotate_returns_prior_value() {
        let dir = TempDir::new().unwrap();
        let ks = Keystore::open(config(&dir), None).await.unwrap();
        ks.store("k1", vec![1], true).await.unwrap();
        let old = ks.rotate("k1", vec![2]).await.unwrap();
        assert_eq!(old, Some(vec![1]));
        assert_eq!(ks.get("k1").await.unwrap(), Some(vec![2]));
    }

    #[tokio::test]
    async fn list_reflects_stored_keys() {
        let dir = TempDir::new().unwrap();
        let ks = Keystore::open(config(&dir), None).await.unwrap();
        ks.store("a", vec![1], false).await.unwrap();
        ks.store("b", vec![2], false).await.unwrap();
        let mut keys = ks.list().await;
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn unencrypted_store_round_trips_without_passphrase() {
        let dir = TempDir::new().unwrap();
        {
            let ks = Keystore::open(config(&dir), None).await.unwrap();
            ks.store("k1", vec![7; 16], false).await.unwrap();
        }
        let ks = Keystore::open(config(&dir), None).await.unwrap();
        assert_eq!(ks.get("k1").await.unwrap(), Some(vec![7; 16]));
    }
}
