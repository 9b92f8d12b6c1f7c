//! Monetary schedule
//!
//! Amounts are integer base units, `UNITS_PER_COIN` to the coin. A block's reward
//! halves every `halving_interval` blocks and is divided evenly into
//! `shares_per_block` shares; any remainder of that division stays unpaid in the
//! share pool.

use crate::config::{ChainParams, UNITS_PER_COIN};

/// Reward for the block at `height`: `base >> (height / halving_interval)`.
///
/// ```
/// use share_chain::config::ChainParams;
/// use share_chain::core::monetary::block_reward;
/// let params = ChainParams::default();
/// assert_eq!(block_reward(0, &params), params.block_reward);
/// assert_eq!(block_reward(params.halving_interval, &params), params.block_reward / 2);
/// ```
pub fn block_reward(height: u64, params: &ChainParams) -> u64 {
    if params.halving_interval == 0 {
        return params.block_reward;
    }
    let halvings = height / params.halving_interval;
    if halvings >= 64 {
        return 0;
    }
    params.block_reward >> halvings
}

/// Value of one share of the block at `height`
pub fn share_value(height: u64, params: &ChainParams) -> u64 {
    if params.shares_per_block == 0 {
        return 0;
    }
    block_reward(height, params) / params.shares_per_block as u64
}

/// Render base units as a decimal coin amount, e.g. `12.50000000`.
pub fn format_coins(units: u64) -> String {
    format!("{}.{:08}", units / UNITS_PER_COIN, units % UNITS_PER_COIN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_halving_schedule() {
        let params = ChainParams::default();
        let base = params.block_reward;
        assert_eq!(block_reward(0, &params), base);
        assert_eq!(block_reward(params.halving_interval - 1, &params), base);
        assert_eq!(block_reward(params.halving_interval, &params), base / 2);
        assert_eq!(block_reward(params.halving_interval * 2, &params), base / 4);
        assert_eq!(block_reward(params.halving_interval * 64, &params), 0);
    }

    #[test]
    fn test_share_value_divides_reward() {
        let params = ChainParams::default();
        for height in [0, 1, params.halving_interval, params.halving_interval * 3] {
            assert_eq!(
                share_value(height, &params),
                block_reward(height, &params) / params.shares_per_block as u64
            );
        }
        assert_eq!(share_value(0, &params), 50_000_000);
    }

    #[test]
    fn test_format_coins() {
        assert_eq!(format_coins(0), "0.00000000");
        assert_eq!(format_coins(150_000_000), "1.50000000");
        assert_eq!(format_coins(100_000), "0.00100000");
    }
}
