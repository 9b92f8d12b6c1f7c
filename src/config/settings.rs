use crate::error::{BlockchainError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const DATA_DIR_KEY: &str = "SHARECHAIN_DATA_DIR";
const NODE_PORT_KEY: &str = "SHARECHAIN_NODE_PORT";
const SERVER_URL_KEY: &str = "SHARECHAIN_SERVER_URL";

pub const UNITS_PER_COIN: u64 = 100_000_000;

/// Consensus tunables. Every node on a network must agree on these,
/// otherwise genesis hashes and difficulty schedules diverge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainParams {
    pub shares_per_block: u32,
    /// Target seconds between closed blocks
    pub target_block_time_secs: u64,
    pub difficulty_adjustment_interval: u64,
    pub initial_share_difficulty: u32,
    /// block_difficulty = share_difficulty + offset
    pub block_difficulty_offset: u32,
    pub max_transactions_per_block: usize,
    /// Base block reward in base units
    pub block_reward: u64,
    pub halving_interval: u64,
    pub max_future_drift_secs: i64,
    /// Unix seconds
    pub genesis_timestamp: i64,
    pub genesis_message: String,
}

impl Default for ChainParams {
    fn default() -> Self {
        ChainParams {
            shares_per_block: 100,
            target_block_time_secs: 900,
            difficulty_adjustment_interval: 10,
            initial_share_difficulty: 4,
            block_difficulty_offset: 8,
            max_transactions_per_block: 100,
            block_reward: 50 * UNITS_PER_COIN,
            halving_interval: 210_000,
            max_future_drift_secs: 7200,
            genesis_timestamp: 1_703_548_800,
            genesis_message: "CPUCoin Genesis Block - Fast CPU Mining!".to_string(),
        }
    }
}

impl ChainParams {
    pub fn initial_block_difficulty(&self) -> u32 {
        self.initial_share_difficulty + self.block_difficulty_offset
    }

    pub fn target_block_time_ms(&self) -> i64 {
        self.target_block_time_secs as i64 * 1000
    }

    pub fn genesis_timestamp_ms(&self) -> i64 {
        self.genesis_timestamp * 1000
    }

    pub fn max_future_drift_ms(&self) -> i64 {
        self.max_future_drift_secs * 1000
    }
}

/// Memory-hard hash parameters (Argon2id first, scrypt as the fallback).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HashParams {
    pub time_cost: u32,
    /// Argon2 memory in KiB
    pub memory_cost_kb: u32,
    pub parallelism: u32,
    pub hash_len: usize,
    pub scrypt_log_n: u8,
    pub scrypt_r: u32,
    pub scrypt_p: u32,
}

impl Default for HashParams {
    fn default() -> Self {
        HashParams {
            time_cost: 1,
            memory_cost_kb: 65536,
            parallelism: 4,
            hash_len: 32,
            scrypt_log_n: 14,
            scrypt_r: 8,
            scrypt_p: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkParams {
    pub bind_host: String,
    /// Gossip listening port
    pub node_port: u16,
    /// HTTP mining coordination port
    pub server_port: u16,
    pub server_url: String,
    pub max_peers: usize,
    pub sync_interval_secs: u64,
    pub peer_timeout_secs: u64,
    pub max_blocks_per_sync: usize,
    pub connect_timeout_ms: u64,
    pub protocol_version: String,
    /// `host:port` of nodes to contact on startup
    pub seed_peers: Vec<String>,
}

impl Default for NetworkParams {
    fn default() -> Self {
        NetworkParams {
            bind_host: "0.0.0.0".to_string(),
            node_port: 8333,
            server_port: 8080,
            server_url: "http://127.0.0.1:8080".to_string(),
            max_peers: 50,
            sync_interval_secs: 5,
            peer_timeout_secs: 60,
            max_blocks_per_sync: 100,
            connect_timeout_ms: 2000,
            protocol_version: "1.0.0".to_string(),
            seed_peers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub chain: ChainParams,
    pub hash: HashParams,
    pub network: NetworkParams,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from("data"),
            chain: ChainParams::default(),
            hash: HashParams::default(),
            network: NetworkParams::default(),
        }
    }
}

impl Config {
    /// Load a TOML file if one is given, then layer environment overrides on top.
    /// Missing keys fall back to the defaults.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let mut config = match path {
            Some(path) => {
                let raw = fs::read_to_string(path).map_err(|e| {
                    BlockchainError::Config(format!("Cannot read {}: {e}", path.display()))
                })?;
                toml::from_str::<Config>(&raw)?
            }
            None => Config::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(dir) = env::var(DATA_DIR_KEY) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(port) = env::var(NODE_PORT_KEY) {
            self.network.node_port = port
                .parse()
                .map_err(|e| BlockchainError::Config(format!("{NODE_PORT_KEY}={port}: {e}")))?;
        }
        if let Ok(url) = env::var(SERVER_URL_KEY) {
            self.network.server_url = url;
        }
        Ok(())
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("blockchain.json")
    }

    pub fn coin_store_path(&self) -> PathBuf {
        self.data_dir.join("coins")
    }

    pub fn wallet_path(&self) -> PathBuf {
        self.data_dir.join("wallet.json")
    }
}
