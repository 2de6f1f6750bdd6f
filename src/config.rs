//! Centralized configuration for beenet components.
//!
//! Every numeric default named in the component design lives here as a
//! `Default` impl, so a deployment can override only what it needs to by
//! loading a TOML file over these defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeenetConfig {
    pub keystore: KeystoreConfig,
    pub discovery: DiscoveryConfig,
    pub transfer: TransferConfig,
    pub resilience: ResilienceConfig,
    pub version: u64,
}

impl Default for BeenetConfig {
    fn default() -> Self {
        Self {
            keystore: KeystoreConfig::default(),
            discovery: DiscoveryConfig::default(),
            transfer: TransferConfig::default(),
            resilience: ResilienceConfig::default(),
            version: 1,
        }
    }
}

impl BeenetConfig {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
        toml::from_str(&raw).map_err(|e| Error::validation(format!("invalid config at {}: {e}", path.display())))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeystoreConfig {
    pub path: PathBuf,
    pub pbkdf2_iterations: u32,
}

impl Default for KeystoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./keystore"),
            pbkdf2_iterations: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub multicast_group: String,
    pub port: u16,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub peer_ttl: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            multicast_group: "239.255.7.7".to_string(),
            port: 7777,
            heartbeat_interval: Duration::from_secs(30),
            peer_ttl: Duration::from_secs(90),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    pub default_chunk_size: usize,
    pub min_chunk_size: usize,
    pub max_chunk_size: usize,
    pub initial_window: usize,
    pub min_window: usize,
    pub max_window: usize,
    pub rtt_samples: usize,
    pub ecc_data_block_size: usize,
    pub ecc_symbols: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: 16 * 1024,
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
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    pub multiplier: f64,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub jitter: bool,
    pub min_score_for_retry: f64,
    #[serde(with = "humantime_serde")]
    pub blacklist_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub janitor_interval: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(300),
            max_attempts: 10,
            jitter: true,
            min_score_for_retry: 0.1,
            blacklist_duration: Duration::from_secs(86_400),
            janitor_interval: Duration::from_secs(60),
        }
    }
}
