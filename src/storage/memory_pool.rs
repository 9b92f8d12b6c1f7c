use crate::core::Transaction;
use std::collections::HashSet;
use std::sync::RwLock;

/// Pending transactions in arrival order, guarded by their own lock so gossip
/// can admit transactions without touching the ledger mutex.
pub struct MemoryPool {
    inner: RwLock<Vec<Transaction>>,
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPool {
    pub fn new() -> MemoryPool {
        MemoryPool {
            inner: RwLock::new(Vec::new()),
        }
    }

    pub fn from_transactions(transactions: Vec<Transaction>) -> MemoryPool {
        let pool = MemoryPool::new();
        for tx in transactions {
            pool.add(tx);
        }
        pool
    }

    pub fn get(&self, txid: &str) -> Option<Transaction> {
        match self.inner.read() {
            Ok(pool) => pool.iter().find(|tx| tx.txid == txid).cloned(),
            Err(_) => {
                log::error!("Failed to acquire read lock on memory pool");
                None
            }
        }
    }

    /// Returns false if a transaction with the same id is already pending.
    pub fn add(&self, tx: Transaction) -> bool {
        match self.inner.write() {
            Ok(mut pool) => {
                if pool.iter().any(|p| p.txid == tx.txid) {
                    return false;
                }
                pool.push(tx);
                true
            }
            Err(_) => {
                log::error!("Failed to acquire write lock on memory pool");
                false
            }
        }
    }

    pub fn contains(&self, txid: &str) -> bool {
        match self.inner.read() {
            Ok(pool) => pool.iter().any(|tx| tx.txid == txid),
            Err(_) => {
                log::error!("Failed to acquire read lock on memory pool");
                false
            }
        }
    }

    /// Drop every pending transaction whose id is in `txids`
    pub fn remove_all(&self, txids: &HashSet<String>) {
        match self.inner.write() {
            Ok(mut pool) => pool.retain(|tx| !txids.contains(&tx.txid)),
            Err(_) => {
                log::error!("Failed to acquire write lock on memory pool");
            }
        }
    }

    /// The oldest `limit` transactions, left in the pool
    pub fn oldest(&self, limit: usize) -> Vec<Transaction> {
        match self.inner.read() {
            Ok(pool) => pool.iter().take(limit).cloned().collect(),
            Err(_) => {
                log::error!("Failed to acquire read lock on memory pool");
                Vec::new()
            }
        }
    }

    pub fn len(&self) -> usize {
        match self.inner.read() {
            Ok(pool) => pool.len(),
            Err(_) => {
                log::error!("Failed to acquire read lock on memory pool");
                0
            }
        }
    }

    pub fn get_all(&self) -> Vec<Transaction> {
        self.oldest(usize::MAX)
    }

    pub fn clear(&self) {
        match self.inner.write() {
            Ok(mut pool) => pool.clear(),
            Err(_) => {
                log::error!("Failed to acquire write lock on memory pool");
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
