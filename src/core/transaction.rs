// Transactions record value moving between public-key identities.
// The coinbase of every block pays the whole reward to the "shares" pool address;
// individual share rewards are materialized as coin records outside the chain.

use crate::error::{BlockchainError, Result};
use crate::utils::{double_sha256_hex, sha256_hex, verify_hex_signature};
use crate::wallet::Signer;
use data_encoding::HEXLOWER;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Address the coinbase output is paid to. Shares are carved out of it.
pub const SHARE_POOL_ADDRESS: &str = "shares";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxType {
    Coinbase,
    Transfer,
    Split,
    Combine,
}

// A reference to an output of an earlier transaction, signed by its owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub txid: String,
    pub vout: u32,
    /// Public key hex of the output owner
    pub owner: String,
    /// Signature hex over the transaction signing data
    pub signature: String,
}

impl TxInput {
    pub fn new(txid: &str, vout: u32) -> TxInput {
        TxInput {
            txid: txid.to_string(),
            vout,
            owner: String::new(),
            signature: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub address: String,
    pub amount: u64,
}

impl TxOutput {
    pub fn new(address: &str, amount: u64) -> TxOutput {
        TxOutput {
            address: address.to_string(),
            amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub txid: String,
    pub timestamp: i64,
    pub tx_type: TxType,
    #[serde(default)]
    pub inputs: Vec<TxInput>,
    #[serde(default)]
    pub outputs: Vec<TxOutput>,
    #[serde(default)]
    pub fee: u64,
    #[serde(default)]
    pub message: String,
}

impl Transaction {
    /// Coinbase paying `amount` to `address`. The id commits to the message and
    /// timestamp, so two coinbases for different heights never collide.
    pub fn new_coinbase(address: &str, amount: u64, message: &str, timestamp: i64) -> Transaction {
        let mut tx = Transaction {
            txid: String::new(),
            timestamp,
            tx_type: TxType::Coinbase,
            inputs: vec![],
            outputs: vec![TxOutput::new(address, amount)],
            fee: 0,
            message: message.to_string(),
        };
        tx.txid = tx.compute_txid();
        tx
    }

    /// The genesis coinbase: a zero-value output and the network message.
    /// Its id is the plain SHA-256 of the message so it is reproducible anywhere.
    pub fn new_genesis(message: &str, timestamp: i64) -> Transaction {
        Transaction {
            txid: sha256_hex(message.as_bytes()),
            timestamp,
            tx_type: TxType::Coinbase,
            inputs: vec![],
            outputs: vec![TxOutput::new("genesis", 0)],
            fee: 0,
            message: message.to_string(),
        }
    }

    /// Build and sign a spending transaction. Every input is signed by `signer`,
    /// which therefore has to own all referenced outputs.
    pub fn new_signed(
        tx_type: TxType,
        inputs: Vec<TxInput>,
        outputs: Vec<TxOutput>,
        fee: u64,
        message: &str,
        timestamp: i64,
        signer: &dyn Signer,
    ) -> Result<Transaction> {
        if tx_type == TxType::Coinbase {
            return Err(BlockchainError::Transaction(
                "Coinbase transactions are not signed".to_string(),
            ));
        }
        if inputs.is_empty() || outputs.is_empty() {
            return Err(BlockchainError::Transaction(
                "Transaction needs at least one input and one output".to_string(),
            ));
        }

        let owner = signer.public_key_hex();
        let mut tx = Transaction {
            txid: String::new(),
            timestamp,
            tx_type,
            inputs: inputs
                .into_iter()
                .map(|input| TxInput {
                    owner: owner.clone(),
                    signature: String::new(),
                    ..input
                })
                .collect(),
            outputs,
            fee,
            message: message.to_string(),
        };

        let signing_data = tx.signing_data();
        let signature = HEXLOWER.encode(&signer.sign(&signing_data)?);
        for input in tx.inputs.iter_mut() {
            input.signature = signature.clone();
        }
        tx.txid = tx.compute_txid();
        Ok(tx)
    }

    pub fn is_coinbase(&self) -> bool {
        self.tx_type == TxType::Coinbase
    }

    /// Bytes every input owner signs. Signatures themselves are excluded.
    pub fn signing_data(&self) -> Vec<u8> {
        let inputs: Vec<_> = self
            .inputs
            .iter()
            .map(|i| json!({"txid": i.txid, "vout": i.vout, "owner": i.owner}))
            .collect();
        json!({
            "timestamp": self.timestamp,
            "tx_type": self.tx_type,
            "inputs": inputs,
            "outputs": self.outputs,
            "fee": self.fee,
        })
        .to_string()
        .into_bytes()
    }

    /// Double SHA-256 over the canonical JSON of every field but the id.
    pub fn compute_txid(&self) -> String {
        let data = json!({
            "timestamp": self.timestamp,
            "tx_type": self.tx_type,
            "inputs": self.inputs,
            "outputs": self.outputs,
            "fee": self.fee,
            "message": self.message,
        });
        double_sha256_hex(data.to_string().as_bytes())
    }

    pub fn total_output(&self) -> u64 {
        self.outputs.iter().map(|o| o.amount).sum()
    }

    /// Structural and signature checks. There is no script system; an input is
    /// valid when its owner's key verifies the signature over the signing data.
    pub fn verify(&self) -> bool {
        if self.txid.is_empty() || self.outputs.is_empty() {
            return false;
        }
        if self.is_coinbase() {
            return self.inputs.is_empty();
        }
        if self.txid != self.compute_txid() || self.inputs.is_empty() {
            return false;
        }
        let signing_data = self.signing_data();
        self.inputs
            .iter()
            .all(|input| verify_hex_signature(&input.owner, &input.signature, &signing_data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::Wallet;

    #[test]
    fn test_coinbase_ids_differ_by_message() {
        let a = Transaction::new_coinbase(SHARE_POOL_ADDRESS, 100, "block 1", 1_000);
        let b = Transaction::new_coinbase(SHARE_POOL_ADDRESS, 100, "block 2", 1_000);
        assert_ne!(a.txid, b.txid);
        assert!(a.verify());
        assert!(a.is_coinbase());
    }

    #[test]
    fn test_genesis_transaction_is_reproducible() {
        let a = Transaction::new_genesis("hello", 5);
        let b = Transaction::new_genesis("hello", 5);
        assert_eq!(a, b);
        assert_eq!(a.txid, sha256_hex(b"hello"));
    }

    #[test]
    fn test_signed_transfer_verifies() {
        let wallet = Wallet::new().unwrap();
        let tx = Transaction::new_signed(
            TxType::Transfer,
            vec![TxInput::new("aa", 0)],
            vec![TxOutput::new("bob", 40)],
            1,
            "",
            10,
            &wallet,
        )
        .unwrap();
        assert!(tx.verify());
        assert_eq!(tx.inputs[0].owner, wallet.public_key_hex());
        assert_eq!(tx.total_output(), 40);
    }

    #[test]
    fn test_tampered_transfer_fails() {
        let wallet = Wallet::new().unwrap();
        let mut tx = Transaction::new_signed(
            TxType::Split,
            vec![TxInput::new("aa", 0)],
            vec![TxOutput::new("bob", 40), TxOutput::new("carol", 10)],
            0,
            "",
            10,
            &wallet,
        )
        .unwrap();
        tx.outputs[0].amount = 45;
        assert!(!tx.verify());

        // recomputing the id does not help, the signature still covers the old outputs
        tx.txid = tx.compute_txid();
        assert!(!tx.verify());
    }

    #[test]
    fn test_unsigned_input_rejected() {
        let mut tx = Transaction::new_coinbase("bob", 5, "", 1);
        tx.tx_type = TxType::Transfer;
        tx.inputs.push(TxInput::new("aa", 0));
        tx.txid = tx.compute_txid();
        assert!(!tx.verify());
    }

    #[test]
    fn test_tx_type_serializes_lowercase() {
        let tx = Transaction::new_coinbase("x", 1, "", 1);
        let value = serde_json::to_value(&tx).unwrap();
        assert_eq!(value["tx_type"], "coinbase");
    }
}
