//! Mining identities
//!
//! A wallet is a single ECDSA P-256 key pair. Its public key, hex encoded, is
//! the miner identity recorded in share claims, block headers and coin records.

#[allow(clippy::module_inception)]
pub mod wallet;

pub use wallet::{Signer, Wallet};
