//! Configuration management
//!
//! Every tunable the chain depends on lives in one `Config` value that gets
//! passed around explicitly. Defaults are the main network's constants; a TOML
//! file and a handful of environment variables can override them.

pub mod settings;

pub use settings::{ChainParams, Config, HashParams, NetworkParams, UNITS_PER_COIN};
