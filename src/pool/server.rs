//! HTTP mining coordinator
//!
//! Remote miners fetch the open block's template here and submit proofs. The
//! server never trusts a submission: the hash is recomputed from its own copy
//! of the header, and claims go through `Ledger::settle_proof` like any local
//! miner's.

use crate::core::{Block, Ledger, MiningProof, Rejection, RejectionKind, Settlement};
use crate::error::{BlockchainError, Result};
use axum::extract::FromRef;
use axum::http::{header, Method, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    pub height: u64,
    pub share_difficulty: u32,
    pub block_difficulty: u32,
    pub share_value: u64,
    pub shares_per_block: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub miner_pubkey: String,
    pub nonce: u64,
    pub hash: String,
    pub block_index: u64,
}

/// What a miner needs to record its reward: one record per entry of
/// `share_index` and `bonus_shares`, each worth `value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinData {
    pub value: u64,
    pub block_height: u64,
    pub block_hash: String,
    pub is_block_finder: bool,
    pub mining_proof: MiningProof,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub success: bool,
    pub message: String,
    pub share_index: Option<u32>,
    pub is_block_find: bool,
    #[serde(default)]
    pub bonus_shares: Vec<u32>,
    pub coin_data: Option<CoinData>,
    /// Set on rejections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectionKind>,
}

impl SubmitResponse {
    fn rejected(rejection: &Rejection) -> SubmitResponse {
        SubmitResponse {
            success: false,
            message: rejection.to_string(),
            share_index: None,
            is_block_find: false,
            bonus_shares: Vec::new(),
            coin_data: None,
            reason: Some(rejection.kind()),
        }
    }

    fn accepted(settlement: Settlement) -> SubmitResponse {
        let message = match (settlement.is_block_find, settlement.share_index) {
            (true, _) => format!(
                "Block {} found, {} bonus shares",
                settlement.block_index,
                settlement.bonus_shares.len()
            ),
            (false, Some(idx)) => format!("Share {idx} claimed"),
            (false, None) => "Share claimed".to_string(),
        };
        SubmitResponse {
            success: true,
            message,
            share_index: settlement.share_index,
            is_block_find: settlement.is_block_find,
            bonus_shares: settlement.bonus_shares,
            coin_data: Some(CoinData {
                value: settlement.share_value,
                block_height: settlement.block_index,
                block_hash: settlement.proof.hash.clone(),
                is_block_finder: settlement.is_block_find,
                mining_proof: settlement.proof,
            }),
            reason: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeightResponse {
    pub height: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetResponse {
    pub success: bool,
    pub message: String,
}

/// Internal failures are reported as 500 with the error text
pub struct ApiError(String);

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (StatusCode::INTERNAL_SERVER_ERROR, self.0).into_response()
    }
}

impl From<BlockchainError> for ApiError {
    fn from(err: BlockchainError) -> Self {
        ApiError(err.to_string())
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError(format!("worker task failed: {err}"))
    }
}

type BlockListener = Arc<dyn Fn(&Block) + Send + Sync>;

/// Router state: the ledger, plus whoever wants to hear about blocks closed
/// through `/share/submit` (usually the gossip node, to announce them).
#[derive(Clone)]
pub struct PoolState {
    ledger: Ledger,
    on_block: Option<BlockListener>,
}

impl PoolState {
    pub fn new(ledger: Ledger) -> PoolState {
        PoolState {
            ledger,
            on_block: None,
        }
    }

    pub fn on_block_found(mut self, listener: impl Fn(&Block) + Send + Sync + 'static) -> Self {
        self.on_block = Some(Arc::new(listener));
        self
    }
}

impl From<Ledger> for PoolState {
    fn from(ledger: Ledger) -> Self {
        PoolState::new(ledger)
    }
}

impl FromRef<PoolState> for Ledger {
    fn from_ref(state: &PoolState) -> Ledger {
        state.ledger.clone()
    }
}

/// One small module per endpoint, each with its `PATH` and `handler`. The
/// ledger calls block (mutex, memory-hard hashing), so they run on the
/// blocking pool.
pub mod endpoint {
    use super::*;
    use axum::extract::State;
    use axum::Json;

    pub mod server_info {
        use super::*;
        pub const PATH: &str = "/";
        pub async fn handler(State(ledger): State<Ledger>) -> std::result::Result<Json<ServerInfo>, ApiError> {
            let info = tokio::task::spawn_blocking(move || ledger.info()).await?;
            Ok(Json(ServerInfo {
                name: "share-chain".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                height: info.height,
                share_difficulty: info.share_difficulty,
                block_difficulty: info.block_difficulty,
                share_value: info.share_value,
                shares_per_block: info.shares_per_block,
            }))
        }
    }

    pub mod current_block {
        use super::*;
        use crate::core::BlockTemplate;
        pub const PATH: &str = "/block/current";
        pub async fn handler(
            State(ledger): State<Ledger>,
        ) -> std::result::Result<Json<BlockTemplate>, ApiError> {
            let template = tokio::task::spawn_blocking(move || ledger.open_template()).await??;
            Ok(Json(template))
        }
    }

    pub mod chain_info {
        use super::*;
        use crate::core::ChainInfo;
        pub const PATH: &str = "/blockchain/info";
        pub async fn handler(State(ledger): State<Ledger>) -> std::result::Result<Json<ChainInfo>, ApiError> {
            Ok(Json(tokio::task::spawn_blocking(move || ledger.info()).await?))
        }
    }

    pub mod height {
        use super::*;
        pub const PATH: &str = "/blockchain/height";
        pub async fn handler(
            State(ledger): State<Ledger>,
        ) -> std::result::Result<Json<HeightResponse>, ApiError> {
            let height = tokio::task::spawn_blocking(move || ledger.height()).await?;
            Ok(Json(HeightResponse { height }))
        }
    }

    pub mod submit_share {
        use super::*;
        pub const PATH: &str = "/share/submit";
        pub async fn handler(
            State(state): State<PoolState>,
            Json(request): Json<SubmitRequest>,
        ) -> std::result::Result<(StatusCode, Json<SubmitResponse>), ApiError> {
            let settled = tokio::task::spawn_blocking(move || {
                let settled = state.ledger.settle_proof(
                    &request.miner_pubkey,
                    request.block_index,
                    request.nonce,
                    &request.hash,
                );
                // listeners may do blocking I/O, so they run here too
                if let (Ok(settlement), Some(listener)) = (&settled, &state.on_block) {
                    if let Some(block) = &settlement.closed_block {
                        listener(block);
                    }
                }
                settled
            })
            .await?;
            match settled {
                Ok(settlement) => {
                    let response = SubmitResponse::accepted(settlement);
                    info!("{}", response.message);
                    Ok((StatusCode::OK, Json(response)))
                }
                Err(rejection) => {
                    warn!("Rejected submission: {rejection}");
                    Ok((
                        StatusCode::BAD_REQUEST,
                        Json(SubmitResponse::rejected(&rejection)),
                    ))
                }
            }
        }
    }

    pub mod reset {
        use super::*;
        pub const PATH: &str = "/blockchain/reset";
        pub async fn handler(State(ledger): State<Ledger>) -> std::result::Result<Json<ResetResponse>, ApiError> {
            tokio::task::spawn_blocking(move || ledger.reset()).await??;
            Ok(Json(ResetResponse {
                success: true,
                message: "Blockchain reset to genesis".to_string(),
            }))
        }
    }
}

pub fn router(state: impl Into<PoolState>) -> Router {
    use endpoint::*;
    let state: PoolState = state.into();
    Router::new()
        .route(server_info::PATH, get(server_info::handler))
        .route(current_block::PATH, get(current_block::handler))
        .route(chain_info::PATH, get(chain_info::handler))
        .route(height::PATH, get(height::handler))
        .route(submit_share::PATH, post(submit_share::handler))
        .route(reset::PATH, post(reset::handler))
        .layer(cors_layer())
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}

/// The coordinator with its own tokio runtime, so the rest of the program can
/// stay on plain threads.
pub struct PoolServer {
    runtime: Runtime,
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl PoolServer {
    /// Bind `addr` and start serving. A bind failure is returned, never logged
    /// and ignored.
    pub fn start(state: impl Into<PoolState>, addr: &str) -> Result<PoolServer> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("pool-server")
            .build()?;
        let listener = runtime
            .block_on(tokio::net::TcpListener::bind(addr))
            .map_err(|e| BlockchainError::Network(format!("Failed to bind to {addr}: {e}")))?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = oneshot::channel::<()>();
        let app = router(state);
        let task = runtime.spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = rx.await;
                })
                .await;
            if let Err(e) = served {
                error!("Mining server stopped: {e}");
            }
        });
        info!("Mining server listening on http://{local_addr}");
        Ok(PoolServer {
            runtime,
            local_addr,
            shutdown: Some(tx),
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// Serve until the process is killed
    pub fn wait(self) {
        // dropping the sender would trigger the graceful shutdown
        let PoolServer {
            runtime,
            task,
            shutdown: _shutdown,
            ..
        } = self;
        if let Err(e) = runtime.block_on(task) {
            error!("Mining server task failed: {e}");
        }
    }

    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let PoolServer { runtime, task, .. } = self;
        let _ = runtime.block_on(task);
    }
}
