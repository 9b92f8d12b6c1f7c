//! Local mining
//!
//! `search` runs the nonce search over a block template, single-threaded or
//! striped across worker threads. `engine` drives the attempt cycle against a
//! `Ledger`: search, settle the proof, mint reward records. `mint_queue` holds
//! records the coin store refused, for both local and remote miners.

pub mod engine;
pub mod mint_queue;
pub mod search;

pub use engine::{MineOutcome, MinerState, MinerStats, MiningEngine};
pub use mint_queue::MintQueue;
pub use search::{FoundNonce, Search, SearchOutcome};
