//! # Share Chain - My Share-Based Proof-of-Work Ledger
//!
//! Blocks here are not won in one go. Each block is split into shares that any
//! miner can claim with a hash meeting the (low) share difficulty; whoever finds
//! a hash meeting the (higher) block difficulty closes the block and picks up
//! every share still left as a bonus. When I come back to this code, here's
//! what I need to remember:
//!
//! ## What I Built
//! - **Share/Block Ledger**: open blocks with claimable shares, closure, retargeting
//!   and halving, all behind one `Ledger` handle
//! - **Memory-Hard Hashing**: Argon2id with an scrypt fallback, salted by the
//!   previous block hash
//! - **Mining Engine**: single and multi-threaded nonce search, reward records
//!   minted for every share won
//! - **Gossip Network**: length-prefixed JSON over TCP, block relay, peer
//!   discovery and longest-valid-chain sync
//! - **HTTP Pool**: an axum coordinator that settles remote proofs, and a
//!   blocking client that mines against it
//! - **Coin Store**: sled-backed reward records that can be transferred, split
//!   and combined by their owner
//!
//! ## How I Organized My Code
//! - `core/`: blocks, the chain state machine, the ledger handle, proof of work
//! - `miner/`: nonce search and the local mining loop
//! - `network/`: gossip messages, peer table, transport and the node
//! - `pool/`: HTTP coordinator and remote miner
//! - `storage/`: ledger file, coin store, pending pool
//! - `wallet/`: the P-256 key pair that identifies a miner
//! - `config/`: every tunable in one `Config`
//! - `testnet/`: fast parameters for demos and tests
//! - `utils/`: hashing, signatures, serialization helpers
//! - `cli/`: command-line parsing
//!
//! ## Things I Keep Forgetting
//! 1. The proof header leaves out the miner and the claims, so claiming shares
//!    never invalidates a recorded hash
//! 2. Every proof, local or remote, goes through `Ledger::settle_proof`, which
//!    recomputes the hash itself
//! 3. Hashing never happens under the ledger lock

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod miner;
pub mod network;
pub mod pool;
pub mod storage;
pub mod testnet;
pub mod utils;
pub mod wallet;

// Re-export commonly used types for convenience
pub use crate::cli::{Command, Opt};
pub use crate::config::{ChainParams, Config, HashParams, NetworkParams, UNITS_PER_COIN};
pub use crate::core::{
    meets_difficulty, Block, BlockTemplate, Blockchain, ChainInfo, Ledger, MiningProof,
    ProofOfWork, Rejection, RejectionKind, Settlement, Transaction,
};
pub use crate::error::{BlockchainError, Result};
pub use crate::miner::{MineOutcome, MinerStats, MiningEngine, Search};
pub use crate::network::{start_node, start_tcp_node, Message, Node, NodeHandle, PeerTable, Transport};
pub use crate::pool::{MiningClient, PoolServer, PoolState, RemoteMiner};
pub use crate::storage::{Coin, CoinStore, MemoryPool, SledCoinStore};
pub use crate::wallet::{Signer, Wallet};
