use crate::error::{BlockchainError, Result};
use data_encoding::HEXLOWER;
use log::info;
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use zeroize::Zeroizing;

/// Anything that can sign spending transactions on behalf of an owner.
pub trait Signer {
    /// Owner identity, the lowercase hex of the public key
    fn public_key_hex(&self) -> String;

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>>;
}

pub struct Wallet {
    pkcs8: Zeroizing<Vec<u8>>,
    public_key: Vec<u8>,
}

// On-disk form of a wallet
#[derive(Serialize, Deserialize)]
struct WalletFile {
    pkcs8: String,
    public_key: String,
}

impl Wallet {
    pub fn new() -> Result<Wallet> {
        let pkcs8 = Zeroizing::new(crate::utils::new_key_pair()?);
        Wallet::from_pkcs8(pkcs8)
    }

    fn from_pkcs8(pkcs8: Zeroizing<Vec<u8>>) -> Result<Wallet> {
        let rng = SystemRandom::new();
        let key_pair =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng)
                .map_err(|e| {
                    BlockchainError::Wallet(format!("Failed to create key pair from PKCS8: {e}"))
                })?;
        let public_key = key_pair.public_key().as_ref().to_vec();
        Ok(Wallet { pkcs8, public_key })
    }

    pub fn get_public_key(&self) -> &[u8] {
        self.public_key.as_slice()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = WalletFile {
            pkcs8: HEXLOWER.encode(&self.pkcs8),
            public_key: HEXLOWER.encode(&self.public_key),
        };
        let json = Zeroizing::new(serde_json::to_vec_pretty(&file)?);
        fs::write(path, json.as_slice())?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Wallet> {
        let bytes = Zeroizing::new(fs::read(path)?);
        let file: WalletFile = serde_json::from_slice(&bytes)?;
        let pkcs8 = Zeroizing::new(
            HEXLOWER
                .decode(file.pkcs8.as_bytes())
                .map_err(|e| BlockchainError::Wallet(format!("Corrupt wallet key: {e}")))?,
        );
        let wallet = Wallet::from_pkcs8(pkcs8)?;
        if wallet.public_key_hex() != file.public_key {
            return Err(BlockchainError::Wallet(
                "Wallet public key does not match its private key".to_string(),
            ));
        }
        Ok(wallet)
    }

    /// Load the wallet at `path`, creating and saving a fresh one if there is none.
    pub fn load_or_create(path: &Path) -> Result<Wallet> {
        if path.exists() {
            return Wallet::load(path);
        }
        let wallet = Wallet::new()?;
        wallet.save(path)?;
        info!("Created new wallet {}", path.display());
        Ok(wallet)
    }
}

impl Signer for Wallet {
    fn public_key_hex(&self) -> String {
        HEXLOWER.encode(&self.public_key)
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        crate::utils::ecdsa_p256_sha256_sign_digest(&self.pkcs8, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ecdsa_p256_sha256_sign_verify;
    use tempfile::tempdir;

    #[test]
    fn test_signature_verifies_with_public_key() {
        let wallet = Wallet::new().unwrap();
        let sig = wallet.sign(b"hello").unwrap();
        assert!(ecdsa_p256_sha256_sign_verify(wallet.get_public_key(), &sig, b"hello"));
        assert!(!ecdsa_p256_sha256_sign_verify(wallet.get_public_key(), &sig, b"other"));
    }

    #[test]
    fn test_identity_is_public_key_hex() {
        let wallet = Wallet::new().unwrap();
        let id = wallet.public_key_hex();
        // uncompressed P-256 point
        assert_eq!(id.len(), 130);
        assert!(id.starts_with("04"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wallet.json");
        let wallet = Wallet::load_or_create(&path).unwrap();
        let loaded = Wallet::load_or_create(&path).unwrap();
        assert_eq!(wallet.public_key_hex(), loaded.public_key_hex());
    }

    #[test]
    fn test_tampered_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wallet.json");
        Wallet::new().unwrap().save(&path).unwrap();
        let other = Wallet::new().unwrap().public_key_hex();
        let mut value: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        value["public_key"] = serde_json::Value::String(other);
        fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();
        assert!(Wallet::load(&path).is_err());
    }
}
