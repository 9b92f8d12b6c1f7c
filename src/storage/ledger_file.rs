use crate::core::{Block, Transaction};
use crate::error::Result;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// On-disk shape of the ledger. Blocks are written with every field, claims
/// included, so loading gives back exactly the state that was saved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub chain: Vec<Block>,
    pub share_difficulty: u32,
    pub block_difficulty: u32,
    #[serde(default)]
    pub pending_transactions: Vec<Transaction>,
    #[serde(default)]
    pub current_open_block: Option<Block>,
}

/// Write the snapshot next to `path` and rename it into place, so a crash
/// mid-write never leaves a truncated ledger behind.
pub fn save_snapshot(path: &Path, snapshot: &LedgerSnapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(snapshot)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Ok(None) when there is no ledger file yet.
pub fn load_snapshot(path: &Path) -> Result<Option<LedgerSnapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path)?;
    let snapshot: LedgerSnapshot = serde_json::from_slice(&bytes)?;
    info!(
        "Loaded ledger from {} ({} blocks)",
        path.display(),
        snapshot.chain.len()
    );
    Ok(Some(snapshot))
}
