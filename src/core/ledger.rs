//! Thread-safe ledger handle.
//!
//! `Ledger` is a cheap-to-clone handle around one `Blockchain` behind one mutex.
//! The miner, the gossip node and the HTTP coordinator each get a clone; there is
//! no process-wide instance. Every claim and closure goes through that mutex, so
//! no two threads can take the same share and nobody sees a closed block as open.
//!
//! Proof checking is split so the lock is never held while hashing: the header
//! is copied out under the lock, the memory-hard hash is recomputed without it,
//! and the lock is taken again to apply the claim only if the open block is
//! still the one the proof was made for.

use crate::config::{ChainParams, Config};
use crate::core::blockchain::{admit_transaction, ChainInfo, Utxo};
use crate::core::{Block, BlockTemplate, Blockchain, ProofOfWork, Transaction};
use crate::error::Result;
use crate::storage::{load_snapshot, save_snapshot, MemoryPool};
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// The proof a share or block was claimed with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct MiningProof {
    pub nonce: u64,
    pub hash: String,
    pub share_difficulty: u32,
    pub block_difficulty: u32,
}

/// Outcome of an accepted proof. Carries everything a caller needs to mint
/// reward records: one at `share_index` (when there was a share left) and one
/// per entry of `bonus_shares`, each worth `share_value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub block_index: u64,
    pub share_index: Option<u32>,
    pub bonus_shares: Vec<u32>,
    pub is_block_find: bool,
    pub share_value: u64,
    /// Empty unless the block closed
    pub block_hash: String,
    pub proof: MiningProof,
    pub closed_block: Option<Block>,
}

impl Settlement {
    pub fn total_shares(&self) -> usize {
        self.share_index.iter().count() + self.bonus_shares.len()
    }
}

/// Why a proof was refused. Nothing is mutated on any of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    StaleBlock { expected: u64, submitted: u64 },
    NoOpenBlock,
    BlockClosed,
    HashMismatch,
    InsufficientDifficulty,
    NoSharesRemaining,
    /// The hash already holds a share of this block
    DuplicateProof,
    Internal(String),
}

/// Machine-readable rejection reason, sent alongside the message so remote
/// miners never have to parse display text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    StaleBlock,
    NoOpenBlock,
    BlockClosed,
    HashMismatch,
    InsufficientDifficulty,
    NoSharesRemaining,
    DuplicateProof,
    Internal,
}

impl Rejection {
    pub fn kind(&self) -> RejectionKind {
        match self {
            Rejection::StaleBlock { .. } => RejectionKind::StaleBlock,
            Rejection::NoOpenBlock => RejectionKind::NoOpenBlock,
            Rejection::BlockClosed => RejectionKind::BlockClosed,
            Rejection::HashMismatch => RejectionKind::HashMismatch,
            Rejection::InsufficientDifficulty => RejectionKind::InsufficientDifficulty,
            Rejection::NoSharesRemaining => RejectionKind::NoSharesRemaining,
            Rejection::DuplicateProof => RejectionKind::DuplicateProof,
            Rejection::Internal(_) => RejectionKind::Internal,
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::StaleBlock {
                expected,
                submitted,
            } => write!(
                f,
                "Block index mismatch: current is {expected}, submitted {submitted}"
            ),
            Rejection::NoOpenBlock => write!(f, "No open block"),
            Rejection::BlockClosed => write!(f, "Block already closed"),
            Rejection::HashMismatch => write!(f, "Hash mismatch - invalid proof of work"),
            Rejection::InsufficientDifficulty => write!(f, "Hash does not meet share difficulty"),
            Rejection::NoSharesRemaining => write!(f, "No shares remaining in block"),
            Rejection::DuplicateProof => write!(f, "Proof already claimed a share of this block"),
            Rejection::Internal(msg) => write!(f, "Internal error: {msg}"),
        }
    }
}

impl std::error::Error for Rejection {}

#[derive(Clone)]
pub struct Ledger {
    inner: Arc<Mutex<Blockchain>>,
    pending: Arc<MemoryPool>,
    pow: ProofOfWork,
    path: Option<PathBuf>,
    save_lock: Arc<Mutex<()>>,
}

impl Ledger {
    /// In-memory ledger, nothing is written to disk
    pub fn new(blockchain: Blockchain) -> Ledger {
        Ledger {
            pending: blockchain.pending_pool(),
            pow: blockchain.proof_of_work().clone(),
            inner: Arc::new(Mutex::new(blockchain)),
            path: None,
            save_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Ledger persisted at `path`. Loads the file when it exists, otherwise
    /// starts from genesis and writes the first snapshot.
    pub fn open_at(path: &Path, config: &Config) -> Result<Ledger> {
        let blockchain = match load_snapshot(path)? {
            Some(snapshot) => Blockchain::from_snapshot(snapshot, config.chain.clone(), &config.hash)?,
            None => {
                info!("No ledger at {}, starting from genesis", path.display());
                Blockchain::new(config.chain.clone(), &config.hash)?
            }
        };
        let mut ledger = Ledger::new(blockchain);
        ledger.path = Some(path.to_path_buf());
        ledger.save()?;
        Ok(ledger)
    }

    pub fn open(config: &Config) -> Result<Ledger> {
        Self::open_at(&config.ledger_path(), config)
    }

    fn lock(&self) -> MutexGuard<'_, Blockchain> {
        // A panic while holding the lock cannot leave a half-applied claim (claims
        // are single pushes), so the state is still usable.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn read<R>(&self, f: impl FnOnce(&Blockchain) -> R) -> R {
        f(&self.lock())
    }

    pub fn proof_of_work(&self) -> &ProofOfWork {
        &self.pow
    }

    pub fn params(&self) -> ChainParams {
        self.lock().params().clone()
    }

    pub fn pending_pool(&self) -> Arc<MemoryPool> {
        Arc::clone(&self.pending)
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _writer = self.save_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let snapshot = self.lock().snapshot();
        save_snapshot(path, &snapshot)
    }

    // Mutations are already applied in memory when this runs. A failed write is
    // logged; the next successful save writes the full state again.
    fn persist(&self) {
        if let Err(e) = self.save() {
            error!("Failed to persist ledger: {e}");
        }
    }

    /// Template of the open block, allocating one if needed.
    pub fn open_template(&self) -> Result<BlockTemplate> {
        let (template, created) = {
            let mut chain = self.lock();
            let created = chain.open_block().map_or(true, |b| b.is_closed());
            (chain.get_or_create_open_block()?.template(), created)
        };
        if created {
            self.persist();
        }
        Ok(template)
    }

    pub fn claim_share(
        &self,
        block_index: u64,
        share_index: u32,
        claimer: &str,
        nonce: u64,
        hash: &str,
        timestamp: i64,
    ) -> bool {
        let claimed =
            self.lock()
                .claim_share(block_index, share_index, claimer, nonce, hash, timestamp);
        if claimed {
            self.persist();
        }
        claimed
    }

    pub fn close_block(&self, finder: &str, nonce: u64, hash: &str) -> Option<Block> {
        let closed = self.lock().close_open_block(finder, nonce, hash);
        if closed.is_some() {
            self.persist();
        }
        closed
    }

    /// The one place proofs enter the ledger, for local and remote miners alike.
    /// The submitted hash is never trusted: it is recomputed from the stored header.
    pub fn settle_proof(
        &self,
        miner: &str,
        block_index: u64,
        nonce: u64,
        hash: &str,
    ) -> std::result::Result<Settlement, Rejection> {
        let (header, previous_hash) = {
            let chain = self.lock();
            let open = chain.open_block().ok_or(Rejection::NoOpenBlock)?;
            if open.index != block_index {
                return Err(Rejection::StaleBlock {
                    expected: open.index,
                    submitted: block_index,
                });
            }
            if open.is_closed() {
                return Err(Rejection::BlockClosed);
            }
            (open.header(), open.previous_hash.clone())
        };

        let recomputed = self
            .pow
            .mining_hash(&header, nonce, &previous_hash)
            .map_err(|e| Rejection::Internal(e.to_string()))?;
        if recomputed != hash {
            return Err(Rejection::HashMismatch);
        }

        let settlement = {
            let mut chain = self.lock();
            // The open block may have been replaced while we were hashing
            match chain.open_block() {
                Some(open) if open.header() == header => {}
                Some(open) => {
                    return Err(Rejection::StaleBlock {
                        expected: open.index,
                        submitted: block_index,
                    })
                }
                None => return Err(Rejection::NoOpenBlock),
            }
            chain.settle_proof(miner, block_index, nonce, &recomputed)?
        };
        self.persist();
        Ok(settlement)
    }

    pub fn add_block(&self, block: Block) -> bool {
        let added = self.lock().add_block(block);
        if added {
            self.persist();
        }
        added
    }

    pub fn replace_chain(&self, candidate: Vec<Block>) -> bool {
        let replaced = self.lock().replace_chain(candidate);
        if replaced {
            self.persist();
        }
        replaced
    }

    /// Pool admission only takes the pool's own lock
    pub fn add_transaction(&self, tx: Transaction) -> bool {
        admit_transaction(&self.pending, tx)
    }

    pub fn height(&self) -> u64 {
        self.lock().height()
    }

    pub fn last_block(&self) -> Block {
        self.lock().last_block().clone()
    }

    pub fn chain(&self) -> Vec<Block> {
        self.lock().chain().to_vec()
    }

    pub fn blocks_from(&self, start: u64, limit: usize) -> Vec<Block> {
        self.lock().blocks_from(start, limit)
    }

    pub fn validate_chain(&self) -> bool {
        self.lock().validate_chain()
    }

    pub fn info(&self) -> ChainInfo {
        self.lock().info()
    }

    pub fn balance(&self, address: &str) -> u64 {
        self.lock().balance(address)
    }

    pub fn utxos(&self, address: &str) -> Vec<Utxo> {
        self.lock().utxos(address)
    }

    pub fn reset(&self) -> Result<()> {
        self.lock().reset();
        self.save()
    }
}
