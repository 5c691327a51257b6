pub use config::Config as RawConfig;
pub use once_cell::sync::OnceCell;
use serde::Deserialize;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::types::Hash32;

static GLOBAL_CONFIG: OnceCell<StoreConfig> = OnceCell::new();

/// A `(height, hash)` checkpoint a candidate chain must match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub height: u32,
    pub hash: Hash32,
}

/// Raw, deserializable shape of `config.toml`'s `[store]` table.
#[derive(Debug, Deserialize)]
struct RawStoreConfig {
    data_directory: String,
    #[serde(default = "default_history_start_height")]
    history_start_height: u32,
    #[serde(default = "default_stealth_start_height")]
    stealth_start_height: u32,
    #[serde(default)]
    block_pool_capacity: usize,
    #[serde(default)]
    checkpoints: Vec<RawCheckpoint>,
    #[serde(default)]
    use_testnet_rules: bool,
    #[serde(default)]
    flush_reorganizations: bool,
    #[serde(default = "default_priority_threads")]
    priority_threads: usize,
    #[serde(default = "default_normal_threads")]
    normal_threads: usize,
}

#[derive(Debug, Deserialize)]
struct RawCheckpoint {
    height: u32,
    hash: String,
}

fn default_history_start_height() -> u32 {
    0
}

fn default_stealth_start_height() -> u32 {
    0
}

fn default_priority_threads() -> usize {
    2
}

fn default_normal_threads() -> usize {
    4
}

/// Startup configuration for the storage core.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub data_directory: PathBuf,
    pub history_start_height: u32,
    pub stealth_start_height: u32,
    /// Max depth of orphan/branch retention. 0 means unlimited.
    pub block_pool_capacity: usize,
    pub checkpoints: Vec<Checkpoint>,
    pub use_testnet_rules: bool,
    pub flush_reorganizations: bool,
    pub priority_threads: usize,
    pub normal_threads: usize,
}

impl StoreConfig {
    fn from_raw(raw: RawStoreConfig) -> Result<Self> {
        let mut checkpoints = Vec::with_capacity(raw.checkpoints.len());
        for cp in raw.checkpoints {
            let bytes = hex::decode(&cp.hash)
                .map_err(|e| Error::Config(config::ConfigError::Message(e.to_string())))?;
            let hash = Hash32::from_slice(&bytes).ok_or_else(|| {
                Error::Config(config::ConfigError::Message(format!(
                    "checkpoint hash at height {} is not 32 bytes",
                    cp.height
                )))
            })?;
            checkpoints.push(Checkpoint { height: cp.height, hash });
        }
        Ok(StoreConfig {
            data_directory: PathBuf::from(raw.data_directory),
            history_start_height: raw.history_start_height,
            stealth_start_height: raw.stealth_start_height,
            block_pool_capacity: raw.block_pool_capacity,
            checkpoints,
            use_testnet_rules: raw.use_testnet_rules,
            flush_reorganizations: raw.flush_reorganizations,
            priority_threads: raw.priority_threads,
            normal_threads: raw.normal_threads,
        })
    }
}

/// Loads `config.toml`'s `[store]` table into a typed `StoreConfig`.
pub fn load_config() -> Result<StoreConfig> {
    let raw = RawConfig::builder()
        .add_source(config::File::with_name("config.toml"))
        .build()?;
    let store: RawStoreConfig = raw.get("store")?;
    StoreConfig::from_raw(store)
}

pub fn init_global_config() -> Result<()> {
    let config = load_config()?;
    GLOBAL_CONFIG
        .set(config)
        .map_err(|_| Error::OperationFailed("config already initialized".into()))
}

pub fn get_global_config() -> &'static StoreConfig {
    GLOBAL_CONFIG
        .get()
        .expect("init_global_config() must be called before get_global_config()")
}
