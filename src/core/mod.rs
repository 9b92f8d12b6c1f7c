//! Core ledger functionality
//!
//! Blocks with claimable shares, the chain state machine, the thread-safe
//! ledger handle, proof of work, difficulty retargeting and the reward schedule.

pub mod block;
pub mod blockchain;
pub mod difficulty;
pub mod ledger;
pub mod merkle;
pub mod monetary;
pub mod proof_of_work;
pub mod transaction;

pub use block::{Block, BlockTemplate, ShareClaim};
pub use blockchain::{Blockchain, ChainInfo, Utxo, GENESIS_PREVIOUS_HASH};
pub use difficulty::{Difficulty, DifficultyAdjustment};
pub use ledger::{Ledger, MiningProof, Rejection, RejectionKind, Settlement};
pub use merkle::merkle_root;
pub use monetary::{block_reward, format_coins, share_value};
pub use proof_of_work::{leading_zero_bits, meets_difficulty, ProofOfWork};
pub use transaction::{Transaction, TxInput, TxOutput, TxType, SHARE_POOL_ADDRESS};
