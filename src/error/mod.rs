//! Error handling for the share chain
//!
//! Validation in this crate is boolean (a block or chain is either accepted or
//! silently rejected). This enum covers everything else: I/O, storage,
//! networking and the occasional cryptographic failure.

use std::fmt;

/// Result type alias for share chain operations
pub type Result<T> = std::result::Result<T, BlockchainError>;

#[derive(Debug, Clone)]
pub enum BlockchainError {
    /// Coin store / sled errors
    Database(String),
    /// Hashing, key handling and signature errors
    Crypto(String),
    /// Gossip and HTTP communication errors
    Network(String),
    /// Malformed or unverifiable transactions
    Transaction(String),
    /// Key material errors
    Wallet(String),
    /// Configuration file or environment errors
    Config(String),
    /// JSON / bincode errors
    Serialization(String),
    /// File I/O errors
    Io(String),
    /// Not enough unspent value to cover a coin operation
    InsufficientFunds { required: u64, available: u64 },
    /// Block or chain level errors that are not plain validation failures
    InvalidBlock(String),
    /// Mining engine errors
    Mining(String),
}

impl fmt::Display for BlockchainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockchainError::Database(msg) => write!(f, "Database error: {msg}"),
            BlockchainError::Crypto(msg) => write!(f, "Cryptographic error: {msg}"),
            BlockchainError::Network(msg) => write!(f, "Network error: {msg}"),
            BlockchainError::Transaction(msg) => write!(f, "Transaction error: {msg}"),
            BlockchainError::Wallet(msg) => write!(f, "Wallet error: {msg}"),
            BlockchainError::Config(msg) => write!(f, "Configuration error: {msg}"),
            BlockchainError::Serialization(msg) => write!(f, "Serialization error: {msg}"),
            BlockchainError::Io(msg) => write!(f, "I/O error: {msg}"),
            BlockchainError::InsufficientFunds {
                required,
                available,
            } => {
                write!(
                    f,
                    "Insufficient funds: required {required}, available {available}"
                )
            }
            BlockchainError::InvalidBlock(msg) => write!(f, "Invalid block: {msg}"),
            BlockchainError::Mining(msg) => write!(f, "Mining error: {msg}"),
        }
    }
}

impl std::error::Error for BlockchainError {}

impl From<std::io::Error> for BlockchainError {
    fn from(err: std::io::Error) -> Self {
        BlockchainError::Io(err.to_string())
    }
}

impl From<sled::Error> for BlockchainError {
    fn from(err: sled::Error) -> Self {
        BlockchainError::Database(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for BlockchainError {
    fn from(err: bincode::error::EncodeError) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for BlockchainError {
    fn from(err: bincode::error::DecodeError) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for BlockchainError {
    fn from(err: serde_json::Error) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for BlockchainError {
    fn from(err: toml::de::Error) -> Self {
        BlockchainError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for BlockchainError {
    fn from(err: reqwest::Error) -> Self {
        BlockchainError::Network(err.to_string())
    }
}
