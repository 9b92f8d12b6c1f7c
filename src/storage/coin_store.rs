use crate::core::{MiningProof, Settlement};
use crate::error::{BlockchainError, Result};
use crate::utils::{current_timestamp, deserialize, serialize, sha256_hex};
use crate::wallet::Signer;
use data_encoding::HEXLOWER;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult, TransactionError};
use std::collections::HashSet;
use std::path::Path;
use uuid::Uuid;

const COINS_TREE: &str = "coins";

/// One reward record. A mined share produces one coin; spending marks it spent
/// and creates the replacement coins with `parent_coins` pointing back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Coin {
    pub coin_id: String,
    pub value: u64,
    pub owner: String,
    pub created_at: i64,
    pub block_height: u64,
    pub share_index: Option<u32>,
    pub block_hash: String,
    pub is_block_finder: bool,
    pub is_bonus_share: bool,
    pub mining_proof: MiningProof,
    pub parent_coins: Vec<String>,
    /// Owner's signature over the operation that created this coin, empty for mints
    pub signature: String,
    pub is_spent: bool,
}

/// Everything needed to mint one record for a claimed share
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintRequest {
    pub owner: String,
    pub value: u64,
    pub block_height: u64,
    pub share_index: Option<u32>,
    pub block_hash: String,
    pub is_block_finder: bool,
    pub is_bonus_share: bool,
    pub mining_proof: MiningProof,
}

impl MintRequest {
    /// One request per share the settlement awarded: the regular share first,
    /// then each bonus share.
    pub fn from_settlement(owner: &str, settlement: &Settlement) -> Vec<MintRequest> {
        let request = |share_index: u32, is_bonus_share: bool| MintRequest {
            owner: owner.to_string(),
            value: settlement.share_value,
            block_height: settlement.block_index,
            share_index: Some(share_index),
            block_hash: settlement.proof.hash.clone(),
            is_block_finder: settlement.is_block_find,
            is_bonus_share,
            mining_proof: settlement.proof.clone(),
        };
        settlement
            .share_index
            .iter()
            .map(|idx| request(*idx, false))
            .chain(settlement.bonus_shares.iter().map(|idx| request(*idx, true)))
            .collect()
    }
}

fn new_coin_id(owner: &str, block_height: u64, nonce: u64) -> String {
    let unique = format!("{owner}{block_height}{nonce}{}", Uuid::new_v4());
    let digest = sha256_hex(unique.as_bytes());
    format!("COIN-{}", &digest[..32])
}

/// Owner-side coin bookkeeping. The ledger never reads this; it only records
/// what a miner earned and lets the owner move it around.
pub trait CoinStore: Send + Sync {
    fn mint(&self, request: MintRequest) -> Result<Coin>;

    fn get(&self, coin_id: &str) -> Result<Option<Coin>>;

    /// Every readable coin owned by `owner`, spent ones included
    fn list(&self, owner: &str) -> Result<Vec<Coin>>;

    /// Sum of unspent coins owned by `owner`
    fn balance(&self, owner: &str) -> Result<u64> {
        Ok(self
            .list(owner)?
            .iter()
            .filter(|c| !c.is_spent)
            .map(|c| c.value)
            .sum())
    }

    fn transfer(&self, coin_id: &str, new_owner: &str, signer: &dyn Signer) -> Result<Coin>;

    /// Split one coin into several whose values sum to the original
    fn split(&self, coin_id: &str, amounts: &[u64], signer: &dyn Signer) -> Result<Vec<Coin>>;

    /// Merge several coins of the same owner into one
    fn combine(&self, coin_ids: &[String], signer: &dyn Signer) -> Result<Coin>;
}

pub struct SledCoinStore {
    tree: sled::Tree,
}

impl SledCoinStore {
    pub fn open(path: &Path) -> Result<SledCoinStore> {
        let db = sled::open(path)
            .map_err(|e| BlockchainError::Database(format!("Failed to open coin store: {e}")))?;
        let tree = db
            .open_tree(COINS_TREE)
            .map_err(|e| BlockchainError::Database(format!("Failed to open coins tree: {e}")))?;
        Ok(SledCoinStore { tree })
    }

    /// Fetch an unspent coin owned by `signer`, or explain why it cannot be spent
    fn spendable(&self, coin_id: &str, signer: &dyn Signer) -> Result<Coin> {
        let coin = self
            .get(coin_id)?
            .ok_or_else(|| BlockchainError::Transaction(format!("Unknown coin {coin_id}")))?;
        if coin.is_spent {
            return Err(BlockchainError::Transaction(format!(
                "Coin {coin_id} has already been spent"
            )));
        }
        if coin.owner != signer.public_key_hex() {
            return Err(BlockchainError::Wallet(format!(
                "Coin {coin_id} is not owned by this wallet"
            )));
        }
        Ok(coin)
    }

    fn child(parent: &Coin, owner: &str, value: u64, parents: Vec<String>, signature: &str) -> Result<Coin> {
        Ok(Coin {
            coin_id: new_coin_id(owner, parent.block_height, parent.mining_proof.nonce),
            value,
            owner: owner.to_string(),
            created_at: current_timestamp()?,
            block_height: parent.block_height,
            share_index: parent.share_index,
            block_hash: parent.block_hash.clone(),
            is_block_finder: parent.is_block_finder,
            is_bonus_share: parent.is_bonus_share,
            mining_proof: parent.mining_proof.clone(),
            parent_coins: parents,
            signature: signature.to_string(),
            is_spent: false,
        })
    }

    /// Mark `spent` and insert `created` in one sled transaction. The parents
    /// are read again inside it, so of two spends racing for the same coin only
    /// the first to commit succeeds.
    fn commit(&self, spent: Vec<Coin>, created: &[Coin]) -> Result<()> {
        let created = created
            .iter()
            .map(|coin| Ok((coin.coin_id.clone(), serialize(coin)?)))
            .collect::<Result<Vec<(String, Vec<u8>)>>>()?;
        let outcome = self.tree.transaction(
            |tree| -> ConflictableTransactionResult<(), BlockchainError> {
                for parent in &spent {
                    let Some(bytes) = tree.get(parent.coin_id.as_bytes())? else {
                        return Err(ConflictableTransactionError::Abort(
                            BlockchainError::Transaction(format!("Unknown coin {}", parent.coin_id)),
                        ));
                    };
                    let mut current: Coin =
                        deserialize(&bytes).map_err(ConflictableTransactionError::Abort)?;
                    if current.is_spent {
                        return Err(ConflictableTransactionError::Abort(
                            BlockchainError::Transaction(format!(
                                "Coin {} has already been spent",
                                parent.coin_id
                            )),
                        ));
                    }
                    current.is_spent = true;
                    let updated = serialize(&current).map_err(ConflictableTransactionError::Abort)?;
                    tree.insert(parent.coin_id.as_bytes(), updated)?;
                }
                for (coin_id, bytes) in &created {
                    tree.insert(coin_id.as_bytes(), bytes.clone())?;
                }
                Ok(())
            },
        );
        match outcome {
            Ok(()) => {}
            Err(TransactionError::Abort(e)) => return Err(e),
            Err(TransactionError::Storage(e)) => return Err(e.into()),
        }
        self.tree.flush()?;
        Ok(())
    }
}

fn sign_hex(signer: &dyn Signer, message: &str) -> Result<String> {
    Ok(HEXLOWER.encode(&signer.sign(message.as_bytes())?))
}

impl CoinStore for SledCoinStore {
    fn mint(&self, request: MintRequest) -> Result<Coin> {
        let coin = Coin {
            coin_id: new_coin_id(&request.owner, request.block_height, request.mining_proof.nonce),
            value: request.value,
            owner: request.owner,
            created_at: current_timestamp()?,
            block_height: request.block_height,
            share_index: request.share_index,
            block_hash: request.block_hash,
            is_block_finder: request.is_block_finder,
            is_bonus_share: request.is_bonus_share,
            mining_proof: request.mining_proof,
            parent_coins: Vec::new(),
            signature: String::new(),
            is_spent: false,
        };
        self.tree.insert(coin.coin_id.as_bytes(), serialize(&coin)?)?;
        self.tree.flush()?;
        Ok(coin)
    }

    fn get(&self, coin_id: &str) -> Result<Option<Coin>> {
        match self.tree.get(coin_id.as_bytes())? {
            Some(bytes) => Ok(Some(deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn list(&self, owner: &str) -> Result<Vec<Coin>> {
        let mut coins = Vec::new();
        for item in self.tree.iter() {
            let (key, value) = item?;
            match deserialize::<Coin>(&value) {
                Ok(coin) if coin.owner == owner => coins.push(coin),
                Ok(_) => {}
                Err(e) => warn!(
                    "Skipping unreadable coin record {}: {e}",
                    String::from_utf8_lossy(&key)
                ),
            }
        }
        coins.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(coins)
    }

    fn transfer(&self, coin_id: &str, new_owner: &str, signer: &dyn Signer) -> Result<Coin> {
        let coin = self.spendable(coin_id, signer)?;
        let signature = sign_hex(signer, &format!("transfer:{coin_id}:{new_owner}"))?;
        let created = Self::child(&coin, new_owner, coin.value, vec![coin.coin_id.clone()], &signature)?;
        self.commit(vec![coin], std::slice::from_ref(&created))?;
        info!("Transferred {coin_id} to {}", created.coin_id);
        Ok(created)
    }

    fn split(&self, coin_id: &str, amounts: &[u64], signer: &dyn Signer) -> Result<Vec<Coin>> {
        let coin = self.spendable(coin_id, signer)?;
        if amounts.len() < 2 || amounts.contains(&0) {
            return Err(BlockchainError::Transaction(
                "A split needs at least two non-zero amounts".to_string(),
            ));
        }
        let total = amounts.iter().try_fold(0u64, |acc, a| acc.checked_add(*a));
        if total != Some(coin.value) {
            return Err(BlockchainError::Transaction(format!(
                "Split amounts must sum to {}",
                coin.value
            )));
        }
        let listed: Vec<String> = amounts.iter().map(u64::to_string).collect();
        let signature = sign_hex(signer, &format!("split:{coin_id}:{}", listed.join(",")))?;
        let created = amounts
            .iter()
            .map(|amount| {
                Self::child(&coin, &coin.owner, *amount, vec![coin.coin_id.clone()], &signature)
            })
            .collect::<Result<Vec<Coin>>>()?;
        self.commit(vec![coin], &created)?;
        Ok(created)
    }

    fn combine(&self, coin_ids: &[String], signer: &dyn Signer) -> Result<Coin> {
        let unique: HashSet<&String> = coin_ids.iter().collect();
        if coin_ids.len() < 2 || unique.len() != coin_ids.len() {
            return Err(BlockchainError::Transaction(
                "Combine needs at least two distinct coins".to_string(),
            ));
        }
        let coins = coin_ids
            .iter()
            .map(|id| self.spendable(id, signer))
            .collect::<Result<Vec<Coin>>>()?;
        let total = coins
            .iter()
            .try_fold(0u64, |acc, c| acc.checked_add(c.value))
            .ok_or_else(|| BlockchainError::Transaction("Combined value overflows".to_string()))?;
        let signature = sign_hex(signer, &format!("combine:{}", coin_ids.join(",")))?;
        let created = Self::child(&coins[0], &coins[0].owner, total, coin_ids.to_vec(), &signature)?;
        self.commit(coins, std::slice::from_ref(&created))?;
        Ok(created)
    }
}
