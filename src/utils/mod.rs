//! Utility functions and helpers
//!
//! Hashing primitives (SHA-256, the memory-hard KDF), ECDSA helpers and the
//! bincode helpers used by the coin store.

pub mod crypto;
pub mod serialization;

pub use crypto::{
    current_timestamp, derive_salt, double_sha256_hex, ecdsa_p256_sha256_sign_digest,
    ecdsa_p256_sha256_sign_verify, new_key_pair, sha256_digest, sha256_hex,
    verify_hex_signature, MemoryHardHasher,
};

pub use serialization::{deserialize, serialize};
