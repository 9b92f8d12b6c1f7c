//! Centralized mining coordination over HTTP
//!
//! `server` exposes the ledger's open block to remote miners and settles their
//! proofs; `client` is the matching blocking client plus a remote mining loop.

pub mod client;
pub mod server;

pub use client::{mint_requests, MiningClient, RemoteMiner, RemoteOutcome};
pub use server::{
    router, CoinData, HeightResponse, PoolServer, PoolState, ResetResponse, ServerInfo,
    SubmitRequest, SubmitResponse,
};
