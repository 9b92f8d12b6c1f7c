// The chain state machine: closed blocks, the single open block, the difficulty
// pair and the pending pool. Nothing in here locks; `Ledger` wraps it in one mutex
// and is what the miner, the gossip node and the HTTP server share.

use crate::config::{ChainParams, HashParams, UNITS_PER_COIN};
use crate::core::difficulty::{Difficulty, DifficultyAdjustment};
use crate::core::ledger::{MiningProof, Rejection, Settlement};
use crate::core::monetary::{block_reward, share_value};
use crate::core::proof_of_work::meets_difficulty;
use crate::core::transaction::SHARE_POOL_ADDRESS;
use crate::core::{Block, ProofOfWork, Transaction};
use crate::error::{BlockchainError, Result};
use crate::storage::{LedgerSnapshot, MemoryPool};
use crate::utils::current_timestamp;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

pub const GENESIS_PREVIOUS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";
const GENESIS_MINER: &str = "genesis";

/// No fee can exceed the total coin supply
pub const MAX_TRANSACTION_FEE: u64 = 21_000_000 * UNITS_PER_COIN;

/// Unspent output owned by some identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenBlockInfo {
    pub index: u64,
    pub shares_claimed: u32,
    pub shares_remaining: u32,
    pub opened_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentBlock {
    pub index: u64,
    pub hash: String,
    pub shares: u32,
    pub is_closed: bool,
}

/// Summary served by `/blockchain/info` and printed by the `info` command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainInfo {
    pub height: u64,
    pub share_difficulty: u32,
    pub block_difficulty: u32,
    pub block_reward: u64,
    pub share_value: u64,
    pub shares_per_block: u32,
    pub pending_transactions: usize,
    pub current_open_block: Option<OpenBlockInfo>,
    pub recent_blocks: Vec<RecentBlock>,
}

pub struct Blockchain {
    chain: Vec<Block>,
    difficulty: Difficulty,
    open_block: Option<Block>,
    pending: Arc<MemoryPool>,
    params: ChainParams,
    pow: ProofOfWork,
}

impl Blockchain {
    // A fresh chain holding only the genesis block
    pub fn new(params: ChainParams, hash_params: &HashParams) -> Result<Blockchain> {
        let pow = ProofOfWork::new(hash_params)?;
        let genesis = Self::create_genesis(&params, &pow)?;
        info!("Created genesis block {}", genesis.hash);
        Ok(Blockchain {
            chain: vec![genesis],
            difficulty: Difficulty::initial(&params),
            open_block: None,
            pending: Arc::new(MemoryPool::new()),
            params,
            pow,
        })
    }

    /// Rebuild from a saved snapshot. The snapshot's chain is trusted only as far
    /// as it validates; a snapshot with a different genesis or a broken link is
    /// refused so a corrupt file is never silently adopted.
    pub fn from_snapshot(
        snapshot: LedgerSnapshot,
        params: ChainParams,
        hash_params: &HashParams,
    ) -> Result<Blockchain> {
        let mut blockchain = Blockchain::new(params, hash_params)?;
        if snapshot.chain.first().map(|b| &b.hash) != Some(&blockchain.chain[0].hash)
            || !blockchain.validate_blocks(&snapshot.chain)
        {
            return Err(BlockchainError::InvalidBlock(
                "Saved chain does not validate".to_string(),
            ));
        }
        blockchain.chain = snapshot.chain;
        blockchain.difficulty = Difficulty {
            share: snapshot.share_difficulty,
            block: snapshot.block_difficulty,
        };
        for tx in snapshot.pending_transactions {
            blockchain.pending.add(tx);
        }
        // A saved open block is only worth keeping while it still extends the tip
        blockchain.open_block = snapshot.current_open_block.filter(|open| {
            !open.is_closed()
                && open.index == blockchain.last_block().index + 1
                && open.previous_hash == blockchain.last_block().hash
        });
        Ok(blockchain)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            chain: self.chain.clone(),
            share_difficulty: self.difficulty.share,
            block_difficulty: self.difficulty.block,
            pending_transactions: self.pending.get_all(),
            current_open_block: self.open_block.clone(),
        }
    }

    /// Genesis is built only from consensus constants, so every node with the
    /// same parameters derives the same block and hash.
    pub fn create_genesis(params: &ChainParams, pow: &ProofOfWork) -> Result<Block> {
        let timestamp = params.genesis_timestamp_ms();
        let tx = Transaction::new_genesis(&params.genesis_message, timestamp);
        let difficulty = Difficulty::initial(params);
        let mut genesis = Block::new_open(
            0,
            GENESIS_PREVIOUS_HASH,
            vec![tx],
            difficulty.share,
            difficulty.block,
            params.shares_per_block,
            timestamp,
        );
        let hash = pow.mining_hash(&genesis.header(), 0, GENESIS_PREVIOUS_HASH)?;
        genesis.close_block(GENESIS_MINER, 0, &hash);
        Ok(genesis)
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn proof_of_work(&self) -> &ProofOfWork {
        &self.pow
    }

    pub fn chain(&self) -> &[Block] {
        &self.chain
    }

    pub fn genesis(&self) -> &Block {
        &self.chain[0]
    }

    pub fn height(&self) -> u64 {
        self.last_block().index
    }

    pub fn last_block(&self) -> &Block {
        // the chain always holds at least the genesis block
        &self.chain[self.chain.len() - 1]
    }

    pub fn difficulty(&self) -> Difficulty {
        self.difficulty
    }

    pub fn pending_pool(&self) -> Arc<MemoryPool> {
        Arc::clone(&self.pending)
    }

    pub fn open_block(&self) -> Option<&Block> {
        self.open_block.as_ref()
    }

    pub fn block_reward(&self) -> u64 {
        block_reward(self.height() + 1, &self.params)
    }

    pub fn share_value(&self) -> u64 {
        share_value(self.height() + 1, &self.params)
    }

    /// Difficulty for the block after `chain`'s tip. Each block records its own
    /// pair, so this only needs the tip and the adjustment window.
    fn expected_difficulty(&self, chain: &[Block]) -> Difficulty {
        let current = chain
            .last()
            .map(|tip| Difficulty {
                share: tip.share_difficulty,
                block: tip.block_difficulty,
            })
            .unwrap_or_else(|| Difficulty::initial(&self.params));
        DifficultyAdjustment::next_difficulty(chain, current, &self.params)
    }

    pub fn calculate_difficulty(&self) -> Difficulty {
        self.expected_difficulty(&self.chain)
    }

    /// Open block for the next height: coinbase first, then up to
    /// `max_transactions_per_block - 1` pending transactions.
    pub fn create_block(&mut self) -> Result<Block> {
        self.difficulty = self.calculate_difficulty();
        let height = self.height() + 1;
        let reward = block_reward(height, &self.params);
        let (pending, total) = self.take_pending(reward);
        let now = current_timestamp()?;

        let coinbase = Transaction::new_coinbase(
            SHARE_POOL_ADDRESS,
            total,
            &format!(
                "Block {height} reward distributed as {} shares",
                self.params.shares_per_block
            ),
            now,
        );
        let mut transactions = Vec::with_capacity(pending.len() + 1);
        transactions.push(coinbase);
        transactions.extend(pending);

        Ok(Block::new_open(
            height,
            &self.last_block().hash,
            transactions,
            self.difficulty.share,
            self.difficulty.block,
            self.params.shares_per_block,
            now,
        ))
    }

    /// Oldest pending transactions that fit next to the coinbase, and the
    /// coinbase amount they add up to. A transaction whose fee would overflow
    /// the amount is evicted from the pool rather than left to block every
    /// later allocation.
    fn take_pending(&self, reward: u64) -> (Vec<Transaction>, u64) {
        let limit = self.params.max_transactions_per_block.saturating_sub(1);
        let mut total = reward;
        let mut taken = Vec::with_capacity(limit);
        let mut evicted = HashSet::new();
        for tx in self.pending.oldest(self.pending.len()) {
            if taken.len() >= limit {
                break;
            }
            match total.checked_add(tx.fee) {
                Some(sum) => {
                    total = sum;
                    taken.push(tx);
                }
                None => {
                    warn!("Evicting transaction {} with fee {}", tx.txid, tx.fee);
                    evicted.insert(tx.txid);
                }
            }
        }
        if !evicted.is_empty() {
            self.pending.remove_all(&evicted);
        }
        (taken, total)
    }

    /// The open block, allocating one when there is none or the last one closed.
    pub fn get_or_create_open_block(&mut self) -> Result<&mut Block> {
        let needs_new = self
            .open_block
            .as_ref()
            .map_or(true, |block| block.is_closed());
        if needs_new {
            let block = self.create_block()?;
            info!(
                "Opened block {} (share difficulty {}, block difficulty {})",
                block.index, block.share_difficulty, block.block_difficulty
            );
            self.open_block = Some(block);
        }
        self.open_block
            .as_mut()
            .ok_or_else(|| BlockchainError::InvalidBlock("No open block".to_string()))
    }

    /// Claim one share of the open block. False when there is no open block at
    /// `block_index` or the block refuses the claim.
    pub fn claim_share(
        &mut self,
        block_index: u64,
        share_index: u32,
        claimer: &str,
        nonce: u64,
        hash: &str,
        timestamp: i64,
    ) -> bool {
        match self.open_block.as_mut() {
            Some(block) if block.index == block_index => {
                block.claim_share(share_index, claimer, nonce, hash, timestamp)
            }
            _ => false,
        }
    }

    /// Close the open block with the finder's proof and append it. Bonus shares
    /// must already be claimed. Works on a copy so a proof that does not validate
    /// leaves the open block untouched.
    pub fn close_open_block(&mut self, finder: &str, nonce: u64, hash: &str) -> Option<Block> {
        let mut candidate = self.open_block.clone()?;
        if !candidate.close_block(finder, nonce, hash) {
            return None;
        }
        if !self.add_block(candidate.clone()) {
            return None;
        }
        self.open_block = None;
        Some(candidate)
    }

    /// Apply a proof whose hash has already been recomputed and checked against
    /// the open block's header. Either claims one share, or (block find) claims
    /// the finder's share plus every remaining share as bonus and closes the block.
    pub fn settle_proof(
        &mut self,
        miner: &str,
        block_index: u64,
        nonce: u64,
        hash: &str,
    ) -> std::result::Result<Settlement, Rejection> {
        let now = current_timestamp().map_err(|e| Rejection::Internal(e.to_string()))?;
        let value = self.share_value();
        let block = match self.open_block.as_ref() {
            Some(block) if block.index == block_index => block,
            Some(block) => {
                return Err(Rejection::StaleBlock {
                    expected: block.index,
                    submitted: block_index,
                })
            }
            None => return Err(Rejection::NoOpenBlock),
        };
        if block.is_closed() {
            return Err(Rejection::BlockClosed);
        }
        if !meets_difficulty(hash, block.share_difficulty) {
            return Err(Rejection::InsufficientDifficulty);
        }
        // The header does not cover claims, so a recorded proof stays valid
        // and would otherwise take the next free share on every resubmission
        if block.share_claims().iter().any(|claim| claim.hash == hash) {
            return Err(Rejection::DuplicateProof);
        }

        let is_block_find = meets_difficulty(hash, block.block_difficulty);
        let proof = MiningProof {
            nonce,
            hash: hash.to_string(),
            share_difficulty: block.share_difficulty,
            block_difficulty: block.block_difficulty,
        };
        let share_index = block.next_share_index();

        if !is_block_find {
            let share_index = share_index.ok_or(Rejection::NoSharesRemaining)?;
            if !self.claim_share(block_index, share_index, miner, nonce, hash, now) {
                return Err(Rejection::NoSharesRemaining);
            }
            return Ok(Settlement {
                block_index,
                share_index: Some(share_index),
                bonus_shares: vec![],
                is_block_find: false,
                share_value: value,
                block_hash: String::new(),
                proof,
                closed_block: None,
            });
        }

        // Block find. Claims go onto a copy first so a failed close leaves
        // the open block exactly as it was.
        let saved = self.open_block.clone();
        let mut bonus_shares = Vec::new();
        if let Some(open) = self.open_block.as_mut() {
            if let Some(index) = share_index {
                open.claim_share(index, miner, nonce, hash, now);
            }
            for index in open.unclaimed_shares() {
                if open.claim_bonus_share(index, miner, nonce, hash, now) {
                    bonus_shares.push(index);
                }
            }
        }

        match self.close_open_block(miner, nonce, hash) {
            Some(closed) => {
                let short_miner: String = miner.chars().take(16).collect();
                info!(
                    "Block {} closed by {short_miner}..., {} bonus shares",
                    closed.index,
                    bonus_shares.len()
                );
                Ok(Settlement {
                    block_index,
                    share_index,
                    bonus_shares,
                    is_block_find: true,
                    share_value: value,
                    block_hash: closed.hash.clone(),
                    proof,
                    closed_block: Some(closed),
                })
            }
            None => {
                self.open_block = saved;
                Err(Rejection::Internal(format!(
                    "block {block_index} failed validation on close"
                )))
            }
        }
    }

    /// Check `block` against its predecessor: linkage, merkle root, transaction
    /// signatures, claim bookkeeping, difficulty schedule, proof of work at the
    /// recorded difficulty and the forward-drift limit.
    pub fn validate_block(&self, block: &Block, prev: &Block) -> bool {
        if block.index != prev.index + 1 {
            warn!("Block {} does not follow {}", block.index, prev.index);
            return false;
        }
        if block.previous_hash != prev.hash {
            warn!("Block {} previous hash mismatch", block.index);
            return false;
        }
        if block.is_closed() && block.miner.is_empty() {
            return false;
        }
        if block.block_difficulty != block.share_difficulty + self.params.block_difficulty_offset
        {
            warn!("Block {} has an inconsistent difficulty pair", block.index);
            return false;
        }
        if !block.verify_merkle_root() {
            warn!("Block {} merkle root mismatch", block.index);
            return false;
        }
        if !block.transactions.first().is_some_and(|tx| tx.is_coinbase())
            || !block.transactions.iter().all(|tx| tx.verify())
        {
            warn!("Block {} carries an invalid transaction", block.index);
            return false;
        }
        if !self.claims_are_consistent(block) {
            warn!("Block {} has inconsistent share claims", block.index);
            return false;
        }
        if !self.pow.validate(block) {
            warn!("Block {} fails proof of work", block.index);
            return false;
        }
        match current_timestamp() {
            Ok(now) if block.timestamp <= now + self.params.max_future_drift_ms() => true,
            Ok(_) => {
                warn!("Block {} is too far in the future", block.index);
                false
            }
            Err(_) => false,
        }
    }

    fn claims_are_consistent(&self, block: &Block) -> bool {
        if block.total_shares != self.params.shares_per_block {
            return false;
        }
        let mut seen = HashSet::new();
        block
            .claimed_shares()
            .iter()
            .all(|i| *i < block.total_shares && seen.insert(*i))
            && block.share_claims().len() == block.claimed_shares().len()
    }

    /// Validate a complete chain: same genesis as ours, then every adjacent pair,
    /// including the difficulty each block should have had.
    pub fn validate_blocks(&self, chain: &[Block]) -> bool {
        match chain.first() {
            Some(genesis) if genesis == self.genesis() => {}
            _ => return false,
        }
        (1..chain.len()).all(|i| {
            let expected = self.expected_difficulty(&chain[..i]);
            let block = &chain[i];
            if block.share_difficulty != expected.share {
                warn!(
                    "Block {} share difficulty {} differs from schedule {}",
                    block.index, block.share_difficulty, expected.share
                );
                return false;
            }
            self.validate_block(block, &chain[i - 1])
        })
    }

    pub fn validate_chain(&self) -> bool {
        self.validate_blocks(&self.chain)
    }

    /// Longest valid chain wins. The candidate has to be strictly longer and
    /// validate end to end; otherwise nothing changes.
    pub fn replace_chain(&mut self, candidate: Vec<Block>) -> bool {
        if candidate.len() <= self.chain.len() {
            return false;
        }
        if !self.validate_blocks(&candidate) {
            warn!("Rejected candidate chain of length {}", candidate.len());
            return false;
        }

        let included = Self::included_txids(&candidate);
        self.pending.remove_all(&included);
        self.chain = candidate;
        self.after_tip_change();
        info!("Replaced chain, new height {}", self.height());
        true
    }

    /// Append a closed block that extends the tip.
    pub fn add_block(&mut self, block: Block) -> bool {
        if !block.is_closed() {
            return false;
        }
        let expected = self.calculate_difficulty();
        if block.share_difficulty != expected.share {
            warn!(
                "Block {} share difficulty {} differs from schedule {}",
                block.index, block.share_difficulty, expected.share
            );
            return false;
        }
        if !self.validate_block(&block, self.last_block()) {
            return false;
        }

        let included = Self::included_txids(std::slice::from_ref(&block));
        self.pending.remove_all(&included);
        self.chain.push(block);
        self.after_tip_change();
        true
    }

    // An open block built on an old tip can never be appended any more
    fn after_tip_change(&mut self) {
        self.difficulty = self.calculate_difficulty();
        let tip_hash = self.last_block().hash.clone();
        if let Some(open) = &self.open_block {
            if open.previous_hash != tip_hash {
                warn!(
                    "Discarding open block {} with {} claims, the tip moved",
                    open.index,
                    open.claimed_shares().len()
                );
                self.open_block = None;
            }
        }
    }

    fn included_txids(blocks: &[Block]) -> HashSet<String> {
        blocks
            .iter()
            .flat_map(|b| b.transactions.iter().map(|tx| tx.txid.clone()))
            .collect()
    }

    /// Admit a transaction to the pending pool.
    pub fn add_transaction(&self, tx: Transaction) -> bool {
        admit_transaction(&self.pending, tx)
    }

    pub fn blocks_from(&self, start: u64, limit: usize) -> Vec<Block> {
        self.chain
            .iter()
            .skip(start as usize)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Full sweep of the chain. Spent references first, then every output
    /// addressed to `address` that nothing spends.
    pub fn utxos(&self, address: &str) -> Vec<Utxo> {
        let spent: HashSet<(&str, u32)> = self
            .chain
            .iter()
            .flat_map(|b| b.transactions.iter())
            .flat_map(|tx| tx.inputs.iter())
            .map(|input| (input.txid.as_str(), input.vout))
            .collect();

        self.chain
            .iter()
            .flat_map(|b| b.transactions.iter())
            .flat_map(|tx| {
                tx.outputs
                    .iter()
                    .enumerate()
                    .map(move |(vout, output)| (tx, vout as u32, output))
            })
            .filter(|(tx, vout, output)| {
                output.address == address && !spent.contains(&(tx.txid.as_str(), *vout))
            })
            .map(|(tx, vout, output)| Utxo {
                txid: tx.txid.clone(),
                vout,
                amount: output.amount,
            })
            .collect()
    }

    pub fn balance(&self, address: &str) -> u64 {
        self.utxos(address)
            .iter()
            .fold(0u64, |sum, u| sum.saturating_add(u.amount))
    }

    pub fn info(&self) -> ChainInfo {
        let recent_start = self.chain.len().saturating_sub(5);
        ChainInfo {
            height: self.height(),
            share_difficulty: self.difficulty.share,
            block_difficulty: self.difficulty.block,
            block_reward: self.block_reward(),
            share_value: self.share_value(),
            shares_per_block: self.params.shares_per_block,
            pending_transactions: self.pending.len(),
            current_open_block: self.open_block.as_ref().map(|ob| OpenBlockInfo {
                index: ob.index,
                shares_claimed: ob.claimed_shares().len() as u32,
                shares_remaining: ob.shares_remaining(),
                opened_at: ob.opened_at,
            }),
            recent_blocks: self.chain[recent_start..]
                .iter()
                .map(|b| RecentBlock {
                    index: b.index,
                    hash: b.hash.clone(),
                    shares: b.claimed_shares().len() as u32,
                    is_closed: b.is_closed(),
                })
                .collect(),
        }
    }

    /// Back to genesis only. Test/admin use.
    pub fn reset(&mut self) {
        self.chain.truncate(1);
        self.open_block = None;
        self.pending.clear();
        self.difficulty = Difficulty::initial(&self.params);
        warn!("Ledger reset to genesis");
    }
}

/// Pool admission without the ledger lock: the transaction must verify, must
/// not be a coinbase (those are only created with a block) and must not carry
/// a fee above `MAX_TRANSACTION_FEE`.
pub fn admit_transaction(pool: &MemoryPool, tx: Transaction) -> bool {
    if tx.is_coinbase() || tx.fee > MAX_TRANSACTION_FEE || !tx.verify() {
        return false;
    }
    pool.add(tx)
}
