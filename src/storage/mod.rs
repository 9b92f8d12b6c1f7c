//! Data storage and persistence
//!
//! The pending-transaction pool, the JSON ledger file and the sled-backed coin
//! store that records what miners earned.

pub mod coin_store;
pub mod ledger_file;
pub mod memory_pool;

pub use coin_store::{Coin, CoinStore, MintRequest, SledCoinStore};
pub use ledger_file::{load_snapshot, save_snapshot, LedgerSnapshot};
pub use memory_pool::MemoryPool;
