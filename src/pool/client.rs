//! Remote mining against the HTTP coordinator

use crate::config::HashParams;
use crate::core::{BlockTemplate, ChainInfo, ProofOfWork, RejectionKind};
use crate::error::{BlockchainError, Result};
use crate::miner::{MinerStats, MintQueue, Search};
use crate::pool::server::{
    endpoint, HeightResponse, ResetResponse, ServerInfo, SubmitRequest, SubmitResponse,
};
use crate::storage::{Coin, CoinStore, MintRequest};
use log::{debug, info, warn};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
// how often a running search asks the server whether the chain moved on
const STALE_CHECK_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_BATCH: u64 = 100_000;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Thin blocking wrapper around the coordinator's HTTP API
#[derive(Clone)]
pub struct MiningClient {
    base_url: String,
    http: Client,
}

impl MiningClient {
    pub fn new(base_url: &str) -> Result<MiningClient> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(MiningClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.http.get(self.url(path)).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(BlockchainError::Network(format!(
                "GET {path} returned {status}"
            )));
        }
        Ok(response.json()?)
    }

    pub fn server_info(&self) -> Result<ServerInfo> {
        self.get_json(endpoint::server_info::PATH)
    }

    pub fn current_block(&self) -> Result<BlockTemplate> {
        self.get_json(endpoint::current_block::PATH)
    }

    pub fn chain_info(&self) -> Result<ChainInfo> {
        self.get_json(endpoint::chain_info::PATH)
    }

    pub fn height(&self) -> Result<u64> {
        let response: HeightResponse = self.get_json(endpoint::height::PATH)?;
        Ok(response.height)
    }

    /// Submit a proof. A rejection comes back as 400 with the same body shape,
    /// so both are returned as `Ok` and only transport failures are errors.
    pub fn submit_share(&self, request: &SubmitRequest) -> Result<SubmitResponse> {
        let response = self
            .http
            .post(self.url(endpoint::submit_share::PATH))
            .json(request)
            .send()?;
        match response.status() {
            StatusCode::OK | StatusCode::BAD_REQUEST => Ok(response.json()?),
            status => Err(BlockchainError::Network(format!(
                "Share submission returned {status}"
            ))),
        }
    }

    pub fn reset(&self) -> Result<ResetResponse> {
        let response = self.http.post(self.url(endpoint::reset::PATH)).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(BlockchainError::Network(format!("Reset returned {status}")));
        }
        Ok(response.json()?)
    }
}

/// Records to mint for an accepted submission: one for `share_index`, then
/// one per bonus share, all worth the server-reported value.
pub fn mint_requests(owner: &str, response: &SubmitResponse) -> Vec<MintRequest> {
    let Some(data) = response.coin_data.as_ref().filter(|_| response.success) else {
        return Vec::new();
    };
    let request = |share_index: u32, is_bonus_share: bool| MintRequest {
        owner: owner.to_string(),
        value: data.value,
        block_height: data.block_height,
        share_index: Some(share_index),
        block_hash: data.block_hash.clone(),
        is_block_finder: data.is_block_finder,
        is_bonus_share,
        mining_proof: data.mining_proof.clone(),
    };
    response
        .share_index
        .iter()
        .map(|idx| request(*idx, false))
        .chain(response.bonus_shares.iter().map(|idx| request(*idx, true)))
        .collect()
}

#[derive(Debug, Clone)]
pub enum RemoteOutcome {
    Share {
        block_index: u64,
        share_index: u32,
        coins: Vec<Coin>,
    },
    Block {
        block_index: u64,
        share_index: Option<u32>,
        bonus_shares: Vec<u32>,
        coins: Vec<Coin>,
    },
    Exhausted { block_index: u64 },
    /// The chain moved on or the hash batch ran out; fetch a fresh template
    Stale { block_index: u64 },
    Rejected(String),
    Stopped,
}

/// Fetch, search, submit, mint. Hashing happens locally with the same
/// parameters the coordinator uses; the server is only asked for templates and
/// to settle proofs.
pub struct RemoteMiner {
    client: MiningClient,
    pow: ProofOfWork,
    coins: Arc<dyn CoinStore>,
    identity: String,
    threads: usize,
    batch: u64,
    stats: MinerStats,
    pending_mints: MintQueue,
}

impl RemoteMiner {
    pub fn new(
        client: MiningClient,
        hash_params: &HashParams,
        coins: Arc<dyn CoinStore>,
        identity: &str,
    ) -> Result<RemoteMiner> {
        Ok(RemoteMiner {
            client,
            pow: ProofOfWork::new(hash_params)?,
            coins,
            identity: identity.to_string(),
            threads: 1,
            batch: DEFAULT_BATCH,
            stats: MinerStats::default(),
            pending_mints: MintQueue::new(),
        })
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Hashes per template before fetching a new one
    pub fn with_batch(mut self, batch: u64) -> Self {
        self.batch = batch.max(1);
        self
    }

    pub fn client(&self) -> &MiningClient {
        &self.client
    }

    pub fn stats(&self) -> &MinerStats {
        &self.stats
    }

    /// Mint requests that failed and are waiting for a retry
    pub fn pending_mints(&self) -> Vec<MintRequest> {
        self.pending_mints.requests()
    }

    pub fn mine_once(&mut self, stop: &AtomicBool) -> Result<RemoteOutcome> {
        self.retry_pending_mints();

        let template = self.client.current_block()?;
        debug!(
            "Fetched block {} ({} shares left) from {}",
            template.block_index,
            template.shares_remaining,
            self.client.base_url()
        );

        let last_check = Cell::new(Instant::now());
        let client = &self.client;
        let block_index = template.block_index;
        let is_stale = move || {
            if last_check.get().elapsed() < STALE_CHECK_INTERVAL {
                return false;
            }
            last_check.set(Instant::now());
            // an unreachable server is not a reason to drop the current search
            client.height().map(|h| h >= block_index).unwrap_or(false)
        };

        let search = Search::new(&self.pow, &template)
            .with_start_nonce(rand::random::<u32>() as u64)
            .with_max_hashes(self.batch);
        let outcome = if self.threads > 1 {
            search.run_parallel(self.threads, stop, &is_stale)?
        } else {
            search.run(stop, &is_stale)?
        };
        self.stats.hashes += outcome.hashes;

        let Some(found) = outcome.found else {
            if stop.load(Ordering::Relaxed) {
                return Ok(RemoteOutcome::Stopped);
            }
            return Ok(RemoteOutcome::Stale { block_index });
        };

        let response = self.client.submit_share(&SubmitRequest {
            miner_pubkey: self.identity.clone(),
            nonce: found.nonce,
            hash: found.hash,
            block_index,
        })?;
        if !response.success {
            return Ok(classify_rejection(block_index, &response));
        }
        if response.coin_data.is_none() {
            return Err(BlockchainError::Network(
                "Accepted submission carried no coin data".to_string(),
            ));
        }

        let coins = self.mint_all(mint_requests(&self.identity, &response));
        self.stats.shares_claimed += response.share_index.iter().count() as u64;
        self.stats.bonus_shares += response.bonus_shares.len() as u64;
        info!("{}", response.message);

        if response.is_block_find {
            self.stats.blocks_closed += 1;
            return Ok(RemoteOutcome::Block {
                block_index,
                share_index: response.share_index,
                bonus_shares: response.bonus_shares,
                coins,
            });
        }
        Ok(RemoteOutcome::Share {
            block_index,
            share_index: response.share_index.unwrap_or_default(),
            coins,
        })
    }

    /// Mine until stopped or until `max_blocks` blocks were closed by this
    /// miner. Server errors back off exponentially instead of hammering it.
    pub fn mine_continuous(&mut self, max_blocks: Option<u64>, stop: &AtomicBool) -> MinerStats {
        let started = Instant::now();
        let base = self.stats.elapsed;
        let mut backoff = BACKOFF_BASE;
        while !stop.load(Ordering::Relaxed) {
            if max_blocks.is_some_and(|max| self.stats.blocks_closed >= max) {
                break;
            }
            match self.mine_once(stop) {
                Ok(RemoteOutcome::Stopped) => break,
                Ok(RemoteOutcome::Rejected(message)) => {
                    warn!("Submission rejected: {message}");
                    backoff = BACKOFF_BASE;
                }
                Ok(_) => backoff = BACKOFF_BASE,
                Err(e) => {
                    warn!("Remote mining attempt failed: {e}, retrying in {backoff:?}");
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
            }
            self.stats.elapsed = base + started.elapsed();
        }
        self.stats.elapsed = base + started.elapsed();
        self.retry_pending_mints();
        self.stats.clone()
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
                        "Failed to record share {:?} of block {}: {e}, queued for retry",
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

fn classify_rejection(block_index: u64, response: &SubmitResponse) -> RemoteOutcome {
    match response.reason {
        Some(RejectionKind::NoSharesRemaining) => {
            info!("Block {block_index} has no shares left, waiting for a block find");
            RemoteOutcome::Exhausted { block_index }
        }
        Some(RejectionKind::BlockClosed | RejectionKind::NoOpenBlock | RejectionKind::StaleBlock) => {
            RemoteOutcome::Stale { block_index }
        }
        _ => RemoteOutcome::Rejected(response.message.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MiningProof;
    use crate::pool::server::CoinData;

    fn accepted(share_index: Option<u32>, bonus_shares: Vec<u32>) -> SubmitResponse {
        SubmitResponse {
            success: true,
            message: "ok".to_string(),
            share_index,
            is_block_find: !bonus_shares.is_empty(),
            bonus_shares,
            coin_data: Some(CoinData {
                value: 125,
                block_height: 3,
                block_hash: "00ab".to_string(),
                is_block_finder: true,
                mining_proof: MiningProof {
                    nonce: 7,
                    hash: "00ab".to_string(),
                    share_difficulty: 1,
                    block_difficulty: 3,
                },
            }),
            reason: None,
        }
    }

    #[test]
    fn test_mint_requests_cover_share_and_bonus() {
        let requests = mint_requests("04aa", &accepted(Some(1), vec![2, 3]));
        let indices: Vec<_> = requests.iter().map(|r| r.share_index).collect();
        assert_eq!(indices, vec![Some(1), Some(2), Some(3)]);
        assert!(!requests[0].is_bonus_share);
        assert!(requests[1..].iter().all(|r| r.is_bonus_share));
        assert!(requests.iter().all(|r| r.value == 125 && r.owner == "04aa"));
    }

    #[test]
    fn test_mint_requests_for_exhausted_block_find() {
        let requests = mint_requests("04aa", &accepted(None, Vec::new()));
        assert!(requests.is_empty());

        let mut rejected = accepted(Some(0), Vec::new());
        rejected.success = false;
        assert!(mint_requests("04aa", &rejected).is_empty());
    }

    fn rejected(reason: Option<RejectionKind>) -> SubmitResponse {
        SubmitResponse {
            success: false,
            message: "no".to_string(),
            share_index: None,
            is_block_find: false,
            bonus_shares: vec![],
            coin_data: None,
            reason,
        }
    }

    #[test]
    fn test_rejection_classification() {
        assert!(matches!(
            classify_rejection(4, &rejected(Some(RejectionKind::NoSharesRemaining))),
            RemoteOutcome::Exhausted { block_index: 4 }
        ));
        assert!(matches!(
            classify_rejection(4, &rejected(Some(RejectionKind::StaleBlock))),
            RemoteOutcome::Stale { block_index: 4 }
        ));
        assert!(matches!(
            classify_rejection(4, &rejected(Some(RejectionKind::DuplicateProof))),
            RemoteOutcome::Rejected(_)
        ));
        // an older server that sends no reason
        assert!(matches!(
            classify_rejection(4, &rejected(None)),
            RemoteOutcome::Rejected(_)
        ));
    }

    #[test]
    fn test_client_trims_trailing_slash() {
        let client = MiningClient::new("http://127.0.0.1:8080/").unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:8080");
        assert_eq!(client.url("/block/current"), "http://127.0.0.1:8080/block/current");
    }
}
