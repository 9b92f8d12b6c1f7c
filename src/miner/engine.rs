use crate::core::{meets_difficulty, Block, BlockTemplate, Ledger, Rejection};
use crate::error::Result;
use crate::miner::mint_queue::MintQueue;
use crate::miner::search::Search;
use crate::storage::{Coin, CoinStore, MintRequest};
use log::{debug, info, warn};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MinerState {
    Idle,
    Searching,
    ShareFound,
    BlockFound,
    Claimed,
    Closing,
}

impl fmt::Display for MinerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MinerState::Idle => "idle",
            MinerState::Searching => "searching",
            MinerState::ShareFound => "share found",
            MinerState::BlockFound => "block found",
            MinerState::Claimed => "claimed",
            MinerState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Result of one mining attempt
#[derive(Debug, Clone)]
pub enum MineOutcome {
    Share {
        block_index: u64,
        share_index: u32,
        coins: Vec<Coin>,
    },
    Block {
        block: Block,
        share_index: Option<u32>,
        bonus_shares: Vec<u32>,
        coins: Vec<Coin>,
    },
    /// Every share of the block is taken; only a block find is worth searching for now
    Exhausted { block_index: u64 },
    /// The open block changed while searching
    Stale { block_index: u64 },
    Rejected(Rejection),
    Stopped,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MinerStats {
    pub blocks_closed: u64,
    pub shares_claimed: u64,
    pub bonus_shares: u64,
    pub hashes: u64,
    pub coins_minted: u64,
    pub value_mined: u64,
    pub elapsed: Duration,
}

impl MinerStats {
    pub fn hash_rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.hashes as f64 / secs
        } else {
            0.0
        }
    }
}

type BlockListener = Box<dyn Fn(&Block) + Send>;

/// Local miner working directly against a `Ledger`. Proofs go through the same
/// `Ledger::settle_proof` path the HTTP coordinator uses.
pub struct MiningEngine {
    ledger: Ledger,
    coins: Arc<dyn CoinStore>,
    identity: String,
    threads: usize,
    state: MinerState,
    stats: MinerStats,
    pending_mints: MintQueue,
    on_block: Option<BlockListener>,
}

impl MiningEngine {
    pub fn new(ledger: Ledger, coins: Arc<dyn CoinStore>, identity: &str) -> MiningEngine {
        MiningEngine {
            ledger,
            coins,
            identity: identity.to_string(),
            threads: 1,
            state: MinerState::Idle,
            stats: MinerStats::default(),
            pending_mints: MintQueue::new(),
            on_block: None,
        }
    }

    /// Search with `threads` workers; 1 searches on the calling thread.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Called with every block this engine closes, e.g. to broadcast it.
    pub fn on_block_found(mut self, listener: impl Fn(&Block) + Send + 'static) -> Self {
        self.on_block = Some(Box::new(listener));
        self
    }

    pub fn state(&self) -> MinerState {
        self.state
    }

    pub fn stats(&self) -> &MinerStats {
        &self.stats
    }

    /// Mint requests that failed and are waiting for a retry
    pub fn pending_mints(&self) -> Vec<MintRequest> {
        self.pending_mints.requests()
    }

    /// Fetch the open block, search it and settle whatever was found.
    pub fn mine_once(&mut self, stop: &AtomicBool) -> Result<MineOutcome> {
        self.retry_pending_mints();

        let template = self.ledger.open_template()?;
        self.state = MinerState::Searching;
        debug!(
            "Mining block {} ({} shares left) at difficulty {}",
            template.block_index,
            template.shares_remaining,
            template.search_difficulty()
        );

        let search = Search::new(self.ledger.proof_of_work(), &template)
            .with_start_nonce(rand::random::<u32>() as u64);
        let is_stale = || self.template_is_stale(&template);
        let searched = if self.threads > 1 {
            search.run_parallel(self.threads, stop, &is_stale)
        } else {
            search.run(stop, &is_stale)
        };
        let outcome = match searched {
            Ok(outcome) => outcome,
            Err(e) => {
                self.state = MinerState::Idle;
                return Err(e);
            }
        };
        self.stats.hashes += outcome.hashes;

        let Some(found) = outcome.found else {
            self.state = MinerState::Idle;
            if stop.load(Ordering::Relaxed) {
                return Ok(MineOutcome::Stopped);
            }
            return Ok(MineOutcome::Stale {
                block_index: template.block_index,
            });
        };

        self.state = if meets_difficulty(&found.hash, template.block_difficulty) {
            MinerState::BlockFound
        } else {
            MinerState::ShareFound
        };

        let settled = self.ledger.settle_proof(
            &self.identity,
            template.block_index,
            found.nonce,
            &found.hash,
        );
        let settlement = match settled {
            Ok(settlement) => settlement,
            Err(rejection) => {
                self.state = MinerState::Idle;
                return Ok(match rejection {
                    Rejection::NoSharesRemaining => {
                        info!(
                            "Block {} has no shares left, waiting for a block find",
                            template.block_index
                        );
                        MineOutcome::Exhausted {
                            block_index: template.block_index,
                        }
                    }
                    Rejection::StaleBlock { .. }
                    | Rejection::NoOpenBlock
                    | Rejection::BlockClosed => MineOutcome::Stale {
                        block_index: template.block_index,
                    },
                    other => {
                        warn!("Proof for block {} rejected: {other}", template.block_index);
                        MineOutcome::Rejected(other)
                    }
                });
            }
        };
        self.state = MinerState::Claimed;

        let coins = self.mint_all(MintRequest::from_settlement(&self.identity, &settlement));
        self.stats.shares_claimed += settlement.share_index.iter().count() as u64;
        self.stats.bonus_shares += settlement.bonus_shares.len() as u64;

        let outcome = match settlement.closed_block {
            Some(block) => {
                self.state = MinerState::Closing;
                self.stats.blocks_closed += 1;
                info!(
                    "Closed block {} ({}), {} coins minted",
                    block.index,
                    block.hash,
                    coins.len()
                );
                if let Some(listener) = &self.on_block {
                    listener(&block);
                }
                MineOutcome::Block {
                    block,
                    share_index: settlement.share_index,
                    bonus_shares: settlement.bonus_shares,
                    coins,
                }
            }
            None => {
                let share_index = settlement.share_index.unwrap_or_default();
                info!("Claimed share {share_index} of block {}", settlement.block_index);
                MineOutcome::Share {
                    block_index: settlement.block_index,
                    share_index,
                    coins,
                }
            }
        };
        self.state = MinerState::Idle;
        Ok(outcome)
    }

    /// Mine until `stop` is set or `max_blocks` blocks have been closed by this
    /// engine. Errors are logged and retried after a short pause.
    pub fn mine_continuous(&mut self, max_blocks: Option<u64>, stop: &AtomicBool) -> MinerStats {
        let started = Instant::now();
        let base = self.stats.elapsed;
        while !stop.load(Ordering::Relaxed) {
            if max_blocks.is_some_and(|max| self.stats.blocks_closed >= max) {
                break;
            }
            match self.mine_once(stop) {
                Ok(MineOutcome::Stopped) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("Mining attempt failed: {e}");
                    thread::sleep(ERROR_BACKOFF);
                }
            }
            self.stats.elapsed = base + started.elapsed();
        }
        self.stats.elapsed = base + started.elapsed();
        self.retry_pending_mints();
        self.stats.clone()
    }

    fn template_is_stale(&self, template: &BlockTemplate) -> bool {
        self.ledger.read(|chain| match chain.open_block() {
            Some(open) => open.index != template.block_index || open.is_closed(),
            None => true,
        })
    }

    fn mint_all(&mut self, requests: Vec<MintRequest>) -> Vec<Coin> {
        let mut coins = Vec::with_capacity(requests.len());
        for request in requests {
            match self.coins.mint(request.clone()) {
                Ok(coin) => {
                    self.record_mint(&coin);
                    coins.push(coin);
                }
                Err(e) => {
                    warn!(
                        "Failed to mint coin for share {:?} of block {}: {e}, queued for retry",
                        request.share_index, request.block_height
                    );
                    self.pending_mints.push(request);
                }
            }
        }
        coins
    }

    fn record_mint(&mut self, coin: &Coin) {
        self.stats.coins_minted += 1;
        self.stats.value_mined += coin.value;
    }

    fn retry_pending_mints(&mut self) {
        for coin in self.pending_mints.retry(self.coins.as_ref()) {
            self.record_mint(&coin);
        }
    }
}
