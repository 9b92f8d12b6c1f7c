use crate::config::ChainParams;
use crate::core::Block;
use log::info;

const MIN_SHARE_DIFFICULTY: u32 = 1;

/// Share/block difficulty pair. The block difficulty is always the share
/// difficulty plus the configured offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Difficulty {
    pub share: u32,
    pub block: u32,
}

impl Difficulty {
    pub fn from_share(share: u32, params: &ChainParams) -> Difficulty {
        Difficulty {
            share,
            block: share + params.block_difficulty_offset,
        }
    }

    pub fn initial(params: &ChainParams) -> Difficulty {
        Self::from_share(params.initial_share_difficulty, params)
    }
}

/// Retargeting at every adjustment boundary.
pub struct DifficultyAdjustment;

impl DifficultyAdjustment {
    /// Whether a chain with this many closed blocks sits on an adjustment
    /// boundary. The tip height (len - 1) has to be a non-zero multiple of the
    /// interval, and there must be a full interval of blocks after genesis.
    pub fn is_adjustment_boundary(chain_len: usize, params: &ChainParams) -> bool {
        let interval = params.difficulty_adjustment_interval as usize;
        interval > 0 && chain_len > interval && (chain_len - 1) % interval == 0
    }

    /// Difficulty for the next block, given the closed chain and the current pair.
    ///
    /// Compares the timestamp span of the last `interval` blocks with
    /// `target_block_time * interval`. Faster than half the target raises the
    /// share difficulty by one, slower than twice the target lowers it by one
    /// (never below 1). Off the boundary the pair is returned unchanged.
    pub fn next_difficulty(chain: &[Block], current: Difficulty, params: &ChainParams) -> Difficulty {
        if !Self::is_adjustment_boundary(chain.len(), params) {
            return current;
        }

        let interval = params.difficulty_adjustment_interval as usize;
        let window = &chain[chain.len() - interval..];
        let (Some(first), Some(last)) = (window.first(), window.last()) else {
            return current;
        };
        let actual = last.timestamp - first.timestamp;
        let expected = params.target_block_time_ms() * interval as i64;

        let share = if actual < expected / 2 {
            current.share + 1
        } else if actual > expected * 2 {
            current.share.saturating_sub(1).max(MIN_SHARE_DIFFICULTY)
        } else {
            current.share
        };

        let next = Difficulty::from_share(share, params);
        if next != current {
            info!(
                "Difficulty adjustment at height {}: share {} -> {}, block {} -> {} (actual: {actual}ms, expected: {expected}ms)",
                chain.len() - 1,
                current.share,
                next.share,
                current.block,
                next.block
            );
        }
        next
    }
}
