use crate::config::{ChainParams, Config, HashParams};
use crate::core::{meets_difficulty, BlockTemplate, ProofOfWork};
use crate::error::Result;

/// Four shares per block, share difficulty 1 and block difficulty 3, and no
/// retargeting for the first thousand blocks.
pub fn fast_chain_params() -> ChainParams {
    ChainParams {
        shares_per_block: 4,
        target_block_time_secs: 1,
        difficulty_adjustment_interval: 1000,
        initial_share_difficulty: 1,
        block_difficulty_offset: 2,
        ..ChainParams::default()
    }
}

/// Smallest Argon2 setting that still exercises the real code path
pub fn fast_hash_params() -> HashParams {
    HashParams {
        time_cost: 1,
        memory_cost_kb: 64,
        parallelism: 1,
        scrypt_log_n: 4,
        ..HashParams::default()
    }
}

pub fn fast_config() -> Config {
    Config {
        chain: fast_chain_params(),
        hash: fast_hash_params(),
        ..Config::default()
    }
}

/// Brute-force the first nonce whose hash meets `difficulty` for `template`.
pub fn mine_proof(
    pow: &ProofOfWork,
    template: &BlockTemplate,
    difficulty: u32,
) -> Result<(u64, String)> {
    let mut nonce = 0u64;
    loop {
        let hash = pow.mining_hash(&template.header, nonce, &template.previous_hash)?;
        if meets_difficulty(&hash, difficulty) {
            return Ok((nonce, hash));
        }
        nonce += 1;
    }
}

/// The first `count` proofs that claim a share without closing the block
pub fn share_only_proofs(
    pow: &ProofOfWork,
    template: &BlockTemplate,
    count: usize,
) -> Result<Vec<(u64, String)>> {
    let mut proofs = Vec::with_capacity(count);
    let mut nonce = 0u64;
    while proofs.len() < count {
        let hash = pow.mining_hash(&template.header, nonce, &template.previous_hash)?;
        if meets_difficulty(&hash, template.share_difficulty)
            && !meets_difficulty(&hash, template.block_difficulty)
        {
            proofs.push((nonce, hash));
        }
        nonce += 1;
    }
    Ok(proofs)
}
