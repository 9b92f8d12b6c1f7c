//! Fast parameters and helpers for local test networks
//!
//! The real network uses 64 MiB Argon2 evaluations and 100 shares per block,
//! which is far too slow for a laptop demo or the test suite. `--testnet` on the
//! command line and the tests use these instead.

pub mod memory_transport;
pub mod test_utils;

pub use memory_transport::MemoryTransport;
pub use test_utils::{
    fast_chain_params, fast_config, fast_hash_params, mine_proof, share_only_proofs,
};
