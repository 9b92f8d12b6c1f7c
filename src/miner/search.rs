use crate::core::{meets_difficulty, BlockTemplate, ProofOfWork};
use crate::error::{BlockchainError, Result};
use log::info;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const REPORT_INTERVAL: Duration = Duration::from_secs(5);
// single-threaded search asks whether the template went stale this often
const STALE_CHECK_EVERY: u64 = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundNonce {
    pub nonce: u64,
    pub hash: String,
}

/// What a search produced. `found` is None when it was stopped, hit its hash
/// limit, or the template went stale.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub found: Option<FoundNonce>,
    pub hashes: u64,
    pub elapsed: Duration,
}

impl SearchOutcome {
    pub fn hash_rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.hashes as f64 / secs
        } else {
            0.0
        }
    }
}

/// A nonce search over one block template. The header is taken from the
/// template once; workers only append the nonce.
pub struct Search<'a> {
    pow: &'a ProofOfWork,
    template: &'a BlockTemplate,
    difficulty: u32,
    start_nonce: u64,
    max_hashes: Option<u64>,
}

impl<'a> Search<'a> {
    pub fn new(pow: &'a ProofOfWork, template: &'a BlockTemplate) -> Search<'a> {
        Search {
            pow,
            template,
            difficulty: template.search_difficulty(),
            start_nonce: 0,
            max_hashes: None,
        }
    }

    pub fn with_difficulty(mut self, difficulty: u32) -> Self {
        self.difficulty = difficulty;
        self
    }

    pub fn with_start_nonce(mut self, start_nonce: u64) -> Self {
        self.start_nonce = start_nonce;
        self
    }

    /// Give up after this many hashes across all threads
    pub fn with_max_hashes(mut self, max_hashes: u64) -> Self {
        self.max_hashes = Some(max_hashes);
        self
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    fn hash(&self, nonce: u64) -> Result<String> {
        self.pow
            .mining_hash(&self.template.header, nonce, &self.template.previous_hash)
    }

    /// Try nonces `start, start+1, ...` on the calling thread.
    pub fn run(&self, stop: &AtomicBool, is_stale: &dyn Fn() -> bool) -> Result<SearchOutcome> {
        let started = Instant::now();
        let mut nonce = self.start_nonce;
        let mut hashes = 0u64;
        let mut found = None;

        while !stop.load(Ordering::Relaxed) {
            if self.max_hashes.is_some_and(|max| hashes >= max) {
                break;
            }
            if hashes > 0 && hashes % STALE_CHECK_EVERY == 0 && is_stale() {
                break;
            }
            let hash = self.hash(nonce)?;
            hashes += 1;
            if meets_difficulty(&hash, self.difficulty) {
                found = Some(FoundNonce { nonce, hash });
                break;
            }
            nonce = nonce.wrapping_add(1);
        }

        Ok(SearchOutcome {
            found,
            hashes,
            elapsed: started.elapsed(),
        })
    }

    /// Striped search: thread `i` of `n` tries `start+i, start+i+n, ...`. The
    /// first winner is kept and every worker stops; the calling thread polls,
    /// logs the hash rate and checks `is_stale`.
    pub fn run_parallel(
        &self,
        threads: usize,
        stop: &AtomicBool,
        is_stale: &dyn Fn() -> bool,
    ) -> Result<SearchOutcome> {
        let threads = threads.max(1);
        let started = Instant::now();
        let done = AtomicBool::new(false);
        let counter = AtomicU64::new(0);
        let active = AtomicUsize::new(threads);
        let winner: Mutex<Option<FoundNonce>> = Mutex::new(None);
        let failure: Mutex<Option<BlockchainError>> = Mutex::new(None);

        thread::scope(|scope| {
            for i in 0..threads {
                let (done, counter, active, winner, failure) =
                    (&done, &counter, &active, &winner, &failure);
                scope.spawn(move || {
                    let stride = threads as u64;
                    let mut nonce = self.start_nonce.wrapping_add(i as u64);
                    while !done.load(Ordering::Relaxed) && !stop.load(Ordering::Relaxed) {
                        if self
                            .max_hashes
                            .is_some_and(|max| counter.load(Ordering::Relaxed) >= max)
                        {
                            break;
                        }
                        match self.hash(nonce) {
                            Ok(hash) => {
                                counter.fetch_add(1, Ordering::Relaxed);
                                if meets_difficulty(&hash, self.difficulty) {
                                    let mut slot =
                                        winner.lock().unwrap_or_else(PoisonError::into_inner);
                                    if slot.is_none() {
                                        *slot = Some(FoundNonce { nonce, hash });
                                    }
                                    done.store(true, Ordering::SeqCst);
                                    break;
                                }
                            }
                            Err(e) => {
                                failure
                                    .lock()
                                    .unwrap_or_else(PoisonError::into_inner)
                                    .get_or_insert(e);
                                done.store(true, Ordering::SeqCst);
                                break;
                            }
                        }
                        nonce = nonce.wrapping_add(stride);
                    }
                    active.fetch_sub(1, Ordering::SeqCst);
                });
            }

            let mut last_report = Instant::now();
            while active.load(Ordering::SeqCst) > 0 {
                thread::sleep(POLL_INTERVAL);
                if !done.load(Ordering::Relaxed) && is_stale() {
                    done.store(true, Ordering::SeqCst);
                }
                if last_report.elapsed() >= REPORT_INTERVAL {
                    let hashes = counter.load(Ordering::Relaxed);
                    let secs = started.elapsed().as_secs_f64().max(f64::EPSILON);
                    info!(
                        "Searching block {} at difficulty {}: {hashes} hashes, {:.2} H/s",
                        self.template.block_index,
                        self.difficulty,
                        hashes as f64 / secs
                    );
                    last_report = Instant::now();
                }
            }
        });

        if let Some(e) = failure.into_inner().unwrap_or_else(PoisonError::into_inner) {
            return Err(e);
        }
        Ok(SearchOutcome {
            found: winner.into_inner().unwrap_or_else(PoisonError::into_inner),
            hashes: counter.load(Ordering::SeqCst),
            elapsed: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Blockchain;
    use crate::testnet::fast_config;

    fn template() -> (Blockchain, BlockTemplate) {
        let config = fast_config();
        let mut chain = Blockchain::new(config.chain, &config.hash).unwrap();
        let template = chain.get_or_create_open_block().unwrap().template();
        (chain, template)
    }

    #[test]
    fn test_single_thread_finds_share() {
        let (chain, template) = template();
        let stop = AtomicBool::new(false);
        let outcome = Search::new(chain.proof_of_work(), &template)
            .run(&stop, &|| false)
            .unwrap();
        let found = outcome.found.unwrap();
        assert!(meets_difficulty(&found.hash, template.share_difficulty));
        assert_eq!(outcome.hashes, found.nonce + 1);
    }

    #[test]
    fn test_parallel_winner_is_valid() {
        let (chain, template) = template();
        let stop = AtomicBool::new(false);
        let outcome = Search::new(chain.proof_of_work(), &template)
            .with_difficulty(template.block_difficulty)
            .with_start_nonce(1_000)
            .run_parallel(4, &stop, &|| false)
            .unwrap();
        let found = outcome.found.unwrap();
        assert!(found.nonce >= 1_000);
        let recomputed = chain
            .proof_of_work()
            .mining_hash(&template.header, found.nonce, &template.previous_hash)
            .unwrap();
        assert_eq!(recomputed, found.hash);
        assert!(meets_difficulty(&found.hash, template.block_difficulty));
    }

    #[test]
    fn test_stop_flag_ends_search() {
        let (chain, template) = template();
        let stop = AtomicBool::new(true);
        let outcome = Search::new(chain.proof_of_work(), &template)
            .with_difficulty(256)
            .run_parallel(2, &stop, &|| false)
            .unwrap();
        assert!(outcome.found.is_none());
        assert_eq!(outcome.hashes, 0);
    }

    #[test]
    fn test_hash_limit_and_staleness() {
        let (chain, template) = template();
        let stop = AtomicBool::new(false);
        let limited = Search::new(chain.proof_of_work(), &template)
            .with_difficulty(256)
            .with_max_hashes(10)
            .run(&stop, &|| false)
            .unwrap();
        assert!(limited.found.is_none());
        assert_eq!(limited.hashes, 10);

        let stale = Search::new(chain.proof_of_work(), &template)
            .with_difficulty(256)
            .run_parallel(2, &stop, &|| true)
            .unwrap();
        assert!(stale.found.is_none());
    }
}
