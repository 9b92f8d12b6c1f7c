use argon2::{Algorithm, Argon2, Version};
use data_encoding::HEXLOWER;
use log::warn;
use ring::digest::{Context, SHA256};
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, ECDSA_P256_SHA256_FIXED, ECDSA_P256_SHA256_FIXED_SIGNING};

use crate::config::HashParams;
use crate::error::{BlockchainError, Result};
use std::time::{SystemTime, UNIX_EPOCH};

pub const SALT_LEN: usize = 16;
const GENESIS_SALT: &str = "genesis";

pub fn current_timestamp() -> Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| BlockchainError::Crypto(format!("System time error: {e}")))?
        .as_millis();

    // Ensure the timestamp fits in i64
    if duration > i64::MAX as u128 {
        return Err(BlockchainError::Crypto("Timestamp overflow".to_string()));
    }

    Ok(duration as i64)
}

pub fn sha256_digest(data: &[u8]) -> Vec<u8> {
    let mut context = Context::new(&SHA256);
    context.update(data);
    let digest = context.finish();
    digest.as_ref().to_vec()
}

pub fn sha256_hex(data: &[u8]) -> String {
    HEXLOWER.encode(&sha256_digest(data))
}

pub fn double_sha256_hex(data: &[u8]) -> String {
    HEXLOWER.encode(&sha256_digest(&sha256_digest(data)))
}

/// 16-byte salt taken from the previous block hash string, zero padded.
pub fn derive_salt(previous_hash: &str) -> [u8; SALT_LEN] {
    let source = if previous_hash.is_empty() {
        GENESIS_SALT
    } else {
        previous_hash
    };
    let mut salt = [0u8; SALT_LEN];
    for (slot, byte) in salt.iter_mut().zip(source.as_bytes()) {
        *slot = *byte;
    }
    salt
}

/// Memory-hard KDF used as the inner step of the mining hash.
///
/// Argon2id is the primary primitive. If the configured parameters are rejected
/// or an evaluation fails (usually an allocation failure on a small machine) I fall
/// back to scrypt with the same output length, so the outer SHA-256 step never
/// sees a different input size.
#[derive(Clone)]
pub struct MemoryHardHasher {
    argon2: Option<Argon2<'static>>,
    scrypt: scrypt::Params,
    hash_len: usize,
}

impl MemoryHardHasher {
    pub fn new(params: &HashParams) -> Result<MemoryHardHasher> {
        let argon2 = match argon2::Params::new(
            params.memory_cost_kb,
            params.time_cost,
            params.parallelism,
            Some(params.hash_len),
        ) {
            Ok(p) => Some(Argon2::new(Algorithm::Argon2id, Version::V0x13, p)),
            Err(e) => {
                warn!("Argon2 parameters rejected ({e}), using scrypt");
                None
            }
        };
        let scrypt = scrypt::Params::new(
            params.scrypt_log_n,
            params.scrypt_r,
            params.scrypt_p,
            params.hash_len,
        )
        .map_err(|e| BlockchainError::Crypto(format!("Invalid scrypt parameters: {e}")))?;

        Ok(MemoryHardHasher {
            argon2,
            scrypt,
            hash_len: params.hash_len,
        })
    }

    /// Scrypt only, regardless of the Argon2 parameters.
    pub fn scrypt_only(params: &HashParams) -> Result<MemoryHardHasher> {
        let mut hasher = MemoryHardHasher::new(params)?;
        hasher.argon2 = None;
        Ok(hasher)
    }

    pub fn uses_argon2(&self) -> bool {
        self.argon2.is_some()
    }

    pub fn hash(&self, data: &[u8], salt: &[u8]) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.hash_len];
        if let Some(argon2) = &self.argon2 {
            match argon2.hash_password_into(data, salt, &mut out) {
                Ok(()) => return Ok(out),
                Err(e) => warn!("Argon2 evaluation failed ({e}), falling back to scrypt"),
            }
        }
        scrypt::scrypt(data, salt, &self.scrypt, &mut out)
            .map_err(|e| BlockchainError::Crypto(format!("scrypt failed: {e}")))?;
        Ok(out)
    }
}

pub fn new_key_pair() -> Result<Vec<u8>> {
    let rng = SystemRandom::new();
    let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
        .map_err(|e| BlockchainError::Crypto(format!("Failed to generate ECDSA key pair: {e}")))?
        .as_ref()
        .to_vec();
    Ok(pkcs8)
}

pub fn ecdsa_p256_sha256_sign_digest(pkcs8: &[u8], message: &[u8]) -> Result<Vec<u8>> {
    let rng = ring::rand::SystemRandom::new();
    let key_pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8, &rng)
        .map_err(|e| {
            BlockchainError::Crypto(format!("Failed to create key pair from PKCS8: {e}"))
        })?;
    let signature = key_pair
        .sign(&rng, message)
        .map_err(|e| BlockchainError::Crypto(format!("Failed to sign message: {e}")))?
        .as_ref()
        .to_vec();
    Ok(signature)
}

pub fn ecdsa_p256_sha256_sign_verify(public_key: &[u8], signature: &[u8], message: &[u8]) -> bool {
    let peer_public_key =
        ring::signature::UnparsedPublicKey::new(&ECDSA_P256_SHA256_FIXED, public_key);
    peer_public_key.verify(message, signature).is_ok()
}

/// Verify a signature where both the key and the signature are lowercase hex.
pub fn verify_hex_signature(public_key_hex: &str, signature_hex: &str, message: &[u8]) -> bool {
    let (Ok(public_key), Ok(signature)) = (
        HEXLOWER.decode(public_key_hex.as_bytes()),
        HEXLOWER.decode(signature_hex.as_bytes()),
    ) else {
        return false;
    };
    ecdsa_p256_sha256_sign_verify(&public_key, &signature, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_params() -> HashParams {
        HashParams {
            memory_cost_kb: 64,
            parallelism: 1,
            scrypt_log_n: 4,
            ..HashParams::default()
        }
    }

    #[test]
    fn test_sha256_of_empty_input() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_salt_is_prefix_and_padded() {
        let salt = derive_salt("abcdef0123456789ffff");
        assert_eq!(&salt, b"abcdef0123456789");

        let genesis = derive_salt("");
        assert_eq!(&genesis[..7], b"genesis");
        assert!(genesis[7..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_memory_hard_hash_is_deterministic() {
        let hasher = MemoryHardHasher::new(&small_params()).unwrap();
        assert!(hasher.uses_argon2());
        let salt = derive_salt("prev");
        let a = hasher.hash(b"header42", &salt).unwrap();
        let b = hasher.hash(b"header42", &salt).unwrap();
        let c = hasher.hash(b"header43", &salt).unwrap();
        assert_eq!(a.len(), 32);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_scrypt_fallback_keeps_output_length() {
        let params = small_params();
        let argon = MemoryHardHasher::new(&params).unwrap();
        let scrypt = MemoryHardHasher::scrypt_only(&params).unwrap();
        let salt = derive_salt("prev");
        let a = argon.hash(b"data", &salt).unwrap();
        let s = scrypt.hash(b"data", &salt).unwrap();
        assert_eq!(a.len(), s.len());
        assert_ne!(a, s);
    }

    #[test]
    fn test_rejected_argon2_params_fall_back() {
        let params = HashParams {
            memory_cost_kb: 1, // below the Argon2 minimum
            ..small_params()
        };
        let hasher = MemoryHardHasher::new(&params).unwrap();
        assert!(!hasher.uses_argon2());
        assert_eq!(hasher.hash(b"x", &derive_salt("")).unwrap().len(), 32);
    }

    #[test]
    fn test_sign_and_verify() {
        let pkcs8 = new_key_pair().unwrap();
        let rng = SystemRandom::new();
        let key_pair =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &pkcs8, &rng).unwrap();
        use ring::signature::KeyPair;
        let public_key = key_pair.public_key().as_ref().to_vec();

        let signature = ecdsa_p256_sha256_sign_digest(&pkcs8, b"message").unwrap();
        assert!(ecdsa_p256_sha256_sign_verify(&public_key, &signature, b"message"));
        assert!(!ecdsa_p256_sha256_sign_verify(&public_key, &signature, b"other"));
        assert!(verify_hex_signature(
            &HEXLOWER.encode(&public_key),
            &HEXLOWER.encode(&signature),
            b"message"
        ));
        assert!(!verify_hex_signature("zz", "zz", b"message"));
    }
}
