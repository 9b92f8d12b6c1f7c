//! Command-line interface
//!
//! Argument parsing for the `share-chain` binary, plus turning the global
//! flags into a `Config`.

pub mod commands;

pub use commands::{Command, Opt};

use crate::config::Config;
use crate::error::Result;
use crate::testnet::{fast_chain_params, fast_hash_params};

impl Opt {
    /// The configuration this invocation runs with: file and environment
    /// first, then `--testnet`, then `--data-dir`.
    pub fn resolve_config(&self) -> Result<Config> {
        let mut config = Config::load(self.config.as_deref())?;
        if self.testnet {
            config.chain = fast_chain_params();
            config.hash = fast_hash_params();
            config.data_dir = config.data_dir.join("testnet");
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        Ok(config)
    }
}
