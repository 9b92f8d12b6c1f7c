use crate::core::merkle::merkle_root;
use crate::core::Transaction;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One claimed share of a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareClaim {
    pub share_index: u32,
    pub claimer: String,
    pub nonce: u64,
    pub hash: String,
    pub timestamp: i64,
    #[serde(default)]
    pub is_bonus: bool,
}

/// A block split into `total_shares` independently claimable shares.
///
/// A block is created open. Shares are claimed one at a time by anyone who finds a
/// hash meeting `share_difficulty`. Whoever finds a hash meeting `block_difficulty`
/// closes it, after first claiming every share still left as a bonus. Closing is
/// terminal: `is_closed` never goes back to false and a closed block takes no
/// further claims.
///
/// The proof header covers index, timestamp, merkle root, previous hash and both
/// difficulties. It leaves out the miner and the claim state, so
/// claiming and closing never invalidate the recorded hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    /// Unix milliseconds
    pub timestamp: i64,
    pub transactions: Vec<Transaction>,
    pub previous_hash: String,
    pub merkle_root: String,
    pub nonce: u64,
    pub share_difficulty: u32,
    pub block_difficulty: u32,
    pub hash: String,
    /// Block finder's public key, empty until closed
    pub miner: String,
    pub total_shares: u32,
    claimed_shares: Vec<u32>,
    share_claims: Vec<ShareClaim>,
    is_closed: bool,
    #[serde(default)]
    pub opened_at: i64,
}

/// What a miner needs to search for a proof on the open block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockTemplate {
    pub block_index: u64,
    pub previous_hash: String,
    pub merkle_root: String,
    pub timestamp: i64,
    pub share_difficulty: u32,
    pub block_difficulty: u32,
    pub shares_claimed: u32,
    pub shares_remaining: u32,
    pub is_closed: bool,
    pub header: String,
}

impl BlockTemplate {
    /// The difficulty a search has to reach to be worth submitting. A fully
    /// claimed block can only be closed, so only a block find is useful there.
    pub fn search_difficulty(&self) -> u32 {
        if self.shares_remaining == 0 {
            self.block_difficulty
        } else {
            self.share_difficulty
        }
    }
}

impl Block {
    pub fn new_open(
        index: u64,
        previous_hash: &str,
        transactions: Vec<Transaction>,
        share_difficulty: u32,
        block_difficulty: u32,
        total_shares: u32,
        timestamp: i64,
    ) -> Block {
        let merkle_root = Self::compute_merkle_root(&transactions);
        Block {
            index,
            timestamp,
            transactions,
            previous_hash: previous_hash.to_string(),
            merkle_root,
            nonce: 0,
            share_difficulty,
            block_difficulty,
            hash: String::new(),
            miner: String::new(),
            total_shares,
            claimed_shares: vec![],
            share_claims: vec![],
            is_closed: false,
            opened_at: timestamp,
        }
    }

    /// Canonical header string: sorted-key JSON of the proof-relevant fields.
    pub fn header(&self) -> String {
        let fields: BTreeMap<&str, Value> = BTreeMap::from([
            ("index", Value::from(self.index)),
            ("timestamp", Value::from(self.timestamp)),
            ("merkle_root", Value::from(self.merkle_root.as_str())),
            ("previous_hash", Value::from(self.previous_hash.as_str())),
            ("share_difficulty", Value::from(self.share_difficulty)),
            ("block_difficulty", Value::from(self.block_difficulty)),
        ]);
        // BTreeMap keeps the keys sorted whatever serde_json features are enabled
        serde_json::to_string(&fields).unwrap_or_default()
    }

    pub fn compute_merkle_root(transactions: &[Transaction]) -> String {
        let ids: Vec<String> = transactions.iter().map(|tx| tx.txid.clone()).collect();
        merkle_root(&ids)
    }

    pub fn verify_merkle_root(&self) -> bool {
        Self::compute_merkle_root(&self.transactions) == self.merkle_root
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed
    }

    pub fn claimed_shares(&self) -> &[u32] {
        &self.claimed_shares
    }

    pub fn share_claims(&self) -> &[ShareClaim] {
        &self.share_claims
    }

    /// Difficulty the recorded hash has to meet
    pub fn target_difficulty(&self) -> u32 {
        if self.is_closed {
            self.block_difficulty
        } else {
            self.share_difficulty
        }
    }

    pub fn is_share_claimed(&self, share_index: u32) -> bool {
        self.claimed_shares.contains(&share_index)
    }

    pub fn shares_remaining(&self) -> u32 {
        self.total_shares
            .saturating_sub(self.claimed_shares.len() as u32)
    }

    /// Lowest unclaimed share index
    pub fn next_share_index(&self) -> Option<u32> {
        (0..self.total_shares).find(|i| !self.is_share_claimed(*i))
    }

    pub fn unclaimed_shares(&self) -> Vec<u32> {
        (0..self.total_shares)
            .filter(|i| !self.is_share_claimed(*i))
            .collect()
    }

    /// Record a claim. Returns false without touching the block when the index is
    /// out of range, already claimed, or the block is closed.
    pub fn claim_share(
        &mut self,
        share_index: u32,
        claimer: &str,
        nonce: u64,
        hash: &str,
        timestamp: i64,
    ) -> bool {
        self.record_claim(share_index, claimer, nonce, hash, timestamp, false)
    }

    pub fn claim_bonus_share(
        &mut self,
        share_index: u32,
        claimer: &str,
        nonce: u64,
        hash: &str,
        timestamp: i64,
    ) -> bool {
        self.record_claim(share_index, claimer, nonce, hash, timestamp, true)
    }

    fn record_claim(
        &mut self,
        share_index: u32,
        claimer: &str,
        nonce: u64,
        hash: &str,
        timestamp: i64,
        is_bonus: bool,
    ) -> bool {
        if self.is_closed || share_index >= self.total_shares || self.is_share_claimed(share_index)
        {
            return false;
        }
        self.claimed_shares.push(share_index);
        self.share_claims.push(ShareClaim {
            share_index,
            claimer: claimer.to_string(),
            nonce,
            hash: hash.to_string(),
            timestamp,
            is_bonus,
        });
        true
    }

    /// Close the block with the finder's proof. Bonus shares have to be claimed
    /// before this; afterwards the block takes no more claims.
    pub fn close_block(&mut self, finder: &str, nonce: u64, hash: &str) -> bool {
        if self.is_closed {
            return false;
        }
        self.miner = finder.to_string();
        self.nonce = nonce;
        self.hash = hash.to_string();
        self.is_closed = true;
        true
    }

    pub fn template(&self) -> BlockTemplate {
        BlockTemplate {
            block_index: self.index,
            previous_hash: self.previous_hash.clone(),
            merkle_root: self.merkle_root.clone(),
            timestamp: self.timestamp,
            share_difficulty: self.share_difficulty,
            block_difficulty: self.block_difficulty,
            shares_claimed: self.claimed_shares.len() as u32,
            shares_remaining: self.shares_remaining(),
            is_closed: self.is_closed,
            header: self.header(),
        }
    }
}
