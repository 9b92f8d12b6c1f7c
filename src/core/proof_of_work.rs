use crate::config::HashParams;
use crate::core::Block;
use crate::error::Result;
use crate::utils::{derive_salt, sha256_hex, MemoryHardHasher};
use data_encoding::HEXLOWER;
use num_bigint::BigUint;

const HASH_BITS: u64 = 256;

/// Number of leading zero bits of a hex hash read as a 256-bit integer.
/// Zero counts as 256. Returns None for anything that is not hex.
pub fn leading_zero_bits(hash_hex: &str) -> Option<u32> {
    let value = BigUint::parse_bytes(hash_hex.as_bytes(), 16)?;
    Some(HASH_BITS.saturating_sub(value.bits()) as u32)
}

pub fn meets_difficulty(hash_hex: &str, difficulty: u32) -> bool {
    match leading_zero_bits(hash_hex) {
        Some(zeros) => zeros >= difficulty,
        None => difficulty == 0,
    }
}

/// The mining hash: SHA-256 over the hex of the memory-hard hash of
/// `header ++ decimal(nonce)`, salted by the previous block hash.
///
/// I keep one of these per miner thread / server; building it validates the
/// hash parameters once instead of on every nonce.
#[derive(Clone)]
pub struct ProofOfWork {
    hasher: MemoryHardHasher,
}

impl ProofOfWork {
    pub fn new(params: &HashParams) -> Result<ProofOfWork> {
        Ok(ProofOfWork {
            hasher: MemoryHardHasher::new(params)?,
        })
    }

    pub fn from_hasher(hasher: MemoryHardHasher) -> ProofOfWork {
        ProofOfWork { hasher }
    }

    pub fn mining_hash(&self, header: &str, nonce: u64, previous_hash: &str) -> Result<String> {
        let data = format!("{header}{nonce}");
        let salt = derive_salt(previous_hash);
        let memory_hard = self.hasher.hash(data.as_bytes(), &salt)?;
        Ok(sha256_hex(HEXLOWER.encode(&memory_hard).as_bytes()))
    }

    /// Recompute the block's hash from header and nonce. Closed blocks must meet
    /// the block difficulty, open ones the share difficulty.
    pub fn validate(&self, block: &Block) -> bool {
        match self.mining_hash(&block.header(), block.nonce, &block.previous_hash) {
            Ok(hash) => hash == block.hash && meets_difficulty(&hash, block.target_difficulty()),
            Err(e) => {
                log::error!("Cannot recompute hash of block {}: {e}", block.index);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Transaction;

    fn fast_params() -> HashParams {
        HashParams {
            memory_cost_kb: 64,
            parallelism: 1,
            scrypt_log_n: 4,
            ..HashParams::default()
        }
    }

    #[test]
    fn test_meets_difficulty_examples() {
        let one_zero_nibble = format!("0{}", "f".repeat(63));
        let no_zeros = "f".repeat(64);
        let two_zero_nibbles = format!("00{}", "f".repeat(62));

        assert!(meets_difficulty(&one_zero_nibble, 4));
        assert!(!meets_difficulty(&one_zero_nibble, 5));
        assert!(!meets_difficulty(&no_zeros, 4));
        assert!(meets_difficulty(&no_zeros, 0));
        assert!(meets_difficulty(&two_zero_nibbles, 8));
    }

    #[test]
    fn test_leading_zero_bits_edges() {
        assert_eq!(leading_zero_bits(&"0".repeat(64)), Some(256));
        assert_eq!(leading_zero_bits(&format!("1{}", "0".repeat(63))), Some(3));
        assert_eq!(leading_zero_bits(&format!("8{}", "0".repeat(63))), Some(0));
        assert_eq!(leading_zero_bits("not hex"), None);
        assert!(!meets_difficulty("not hex", 1));
    }

    #[test]
    fn test_mining_hash_is_deterministic() {
        let pow = ProofOfWork::new(&fast_params()).unwrap();
        let a = pow.mining_hash("header", 1, "prev").unwrap();
        let b = pow.mining_hash("header", 1, "prev").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, pow.mining_hash("header", 2, "prev").unwrap());
        // the salt comes from the previous hash
        assert_ne!(a, pow.mining_hash("header", 1, "other").unwrap());
    }

    #[test]
    fn test_validate_open_and_closed_block() {
        let pow = ProofOfWork::new(&fast_params()).unwrap();
        let coinbase = Transaction::new_coinbase("shares", 1, "", 1);
        let mut block = Block::new_open(1, "prev", vec![coinbase], 1, 2, 4, 1_000);

        let header = block.header();
        let (nonce, hash) = (0u64..)
            .map(|n| (n, pow.mining_hash(&header, n, "prev").unwrap()))
            .find(|(_, h)| meets_difficulty(h, 2))
            .unwrap();

        block.nonce = nonce;
        block.hash = hash.clone();
        assert!(pow.validate(&block));

        block.close_block("finder", nonce, &hash);
        assert!(pow.validate(&block));

        block.hash = "f".repeat(64);
        assert!(!pow.validate(&block));
    }
}
