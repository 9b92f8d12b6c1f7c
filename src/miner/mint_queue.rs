// Reward records that could not be written yet. Each one keeps its own attempt
// count and retry deadline, so a store that stays down is asked less and less
// often instead of once per mining attempt.

use crate::storage::{Coin, CoinStore, MintRequest};
use log::{debug, info};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const RETRY_BASE: Duration = Duration::from_millis(500);
pub const RETRY_MAX: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct PendingMint {
    request: MintRequest,
    attempts: u32,
    next_attempt: Instant,
}

#[derive(Debug, Default)]
pub struct MintQueue {
    pending: VecDeque<PendingMint>,
}

impl MintQueue {
    pub fn new() -> MintQueue {
        MintQueue::default()
    }

    /// Queue a request whose first mint just failed
    pub fn push(&mut self, request: MintRequest) {
        self.pending.push_back(PendingMint {
            request,
            attempts: 1,
            next_attempt: Instant::now() + RETRY_BASE,
        });
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn requests(&self) -> Vec<MintRequest> {
        self.pending.iter().map(|p| p.request.clone()).collect()
    }

    /// Retry every request whose deadline has passed and return what got
    /// minted. A failure doubles that request's wait, up to `RETRY_MAX`.
    pub fn retry(&mut self, coins: &dyn CoinStore) -> Vec<Coin> {
        let now = Instant::now();
        let mut minted = Vec::new();
        let mut waiting = VecDeque::with_capacity(self.pending.len());
        while let Some(mut pending) = self.pending.pop_front() {
            if pending.next_attempt > now {
                waiting.push_back(pending);
                continue;
            }
            match coins.mint(pending.request.clone()) {
                Ok(coin) => {
                    info!("Minted queued coin {}", coin.coin_id);
                    minted.push(coin);
                }
                Err(e) => {
                    pending.attempts += 1;
                    pending.next_attempt = now + backoff(pending.attempts);
                    debug!("Mint retry {} failed: {e}", pending.attempts);
                    waiting.push_back(pending);
                }
            }
        }
        self.pending = waiting;
        minted
    }
}

fn backoff(attempts: u32) -> Duration {
    RETRY_BASE
        .saturating_mul(1 << attempts.min(10))
        .min(RETRY_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MiningProof;
    use crate::error::{BlockchainError, Result};
    use crate::wallet::Signer;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    /// Counts mint calls and fails every one of them
    #[derive(Default)]
    struct BrokenCoins {
        calls: AtomicUsize,
    }

    impl CoinStore for BrokenCoins {
        fn mint(&self, _: MintRequest) -> Result<Coin> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(BlockchainError::Database("read-only".to_string()))
        }
        fn get(&self, _: &str) -> Result<Option<Coin>> {
            Ok(None)
        }
        fn list(&self, _: &str) -> Result<Vec<Coin>> {
            Ok(vec![])
        }
        fn transfer(&self, _: &str, _: &str, _: &dyn Signer) -> Result<Coin> {
            unimplemented!()
        }
        fn split(&self, _: &str, _: &[u64], _: &dyn Signer) -> Result<Vec<Coin>> {
            unimplemented!()
        }
        fn combine(&self, _: &[String], _: &dyn Signer) -> Result<Coin> {
            unimplemented!()
        }
    }

    fn request() -> MintRequest {
        MintRequest {
            owner: "alice".to_string(),
            value: 10,
            block_height: 1,
            share_index: Some(0),
            block_hash: "00".to_string(),
            is_block_finder: false,
            is_bonus_share: false,
            mining_proof: MiningProof {
                nonce: 1,
                hash: "00".to_string(),
                share_difficulty: 1,
                block_difficulty: 3,
            },
        }
    }

    #[test]
    fn test_retry_waits_for_deadline() {
        let coins = BrokenCoins::default();
        let mut queue = MintQueue::new();
        queue.push(request());

        // nothing is due yet, so the store is not touched
        for _ in 0..5 {
            assert!(queue.retry(&coins).is_empty());
        }
        assert_eq!(coins.calls.load(Ordering::SeqCst), 0);

        thread::sleep(RETRY_BASE + Duration::from_millis(50));
        queue.retry(&coins);
        queue.retry(&coins);
        assert_eq!(coins.calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(backoff(1), RETRY_BASE * 2);
        assert!(backoff(3) > backoff(2));
        assert_eq!(backoff(40), RETRY_MAX);
    }
}
