//! Ledger integration tests
//!
//! Full block lifecycles through the mining engine, persistence across
//! restarts, and several miners racing for the shares of the same blocks.

use share_chain::core::Ledger;
use share_chain::miner::{MineOutcome, MiningEngine};
use share_chain::storage::{CoinStore, SledCoinStore};
use share_chain::testnet::{fast_config, mine_proof};
use share_chain::wallet::{Signer, Wallet};
use share_chain::UNITS_PER_COIN;
use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

#[test]
fn test_block_lifecycle_with_four_shares() {
    let dir = tempdir().unwrap();
    let config = fast_config();
    let ledger_path = dir.path().join("blockchain.json");
    let ledger = Ledger::open_at(&ledger_path, &config).unwrap();
    let coins: Arc<dyn CoinStore> =
        Arc::new(SledCoinStore::open(&dir.path().join("coins")).unwrap());
    let identity = Wallet::new().unwrap().public_key_hex();

    let stop = AtomicBool::new(false);
    let mut engine = MiningEngine::new(ledger.clone(), Arc::clone(&coins), &identity);
    let stats = engine.mine_continuous(Some(1), &stop);

    assert_eq!(stats.blocks_closed, 1);
    assert_eq!(ledger.height(), 1);
    let block = ledger.last_block();
    assert!(block.is_closed());
    assert_eq!(block.miner, identity);
    let claimed: BTreeSet<u32> = block.claimed_shares().iter().copied().collect();
    assert_eq!(claimed, (0..4).collect());
    assert!(ledger.validate_chain());

    // one record per share, each worth a quarter of the block reward
    let owned = coins.list(&identity).unwrap();
    assert_eq!(owned.len(), 4);
    let share_value = 50 * UNITS_PER_COIN / 4;
    assert!(owned.iter().all(|c| c.value == share_value && c.block_height == 1));
    assert_eq!(coins.balance(&identity).unwrap(), 4 * share_value);
    let indices: BTreeSet<u32> = owned.iter().filter_map(|c| c.share_index).collect();
    assert_eq!(indices, (0..4).collect());
    assert_eq!(
        stats.shares_claimed + stats.bonus_shares,
        owned.len() as u64
    );

    // a restart sees the same chain
    drop(engine);
    let reopened = Ledger::open_at(&ledger_path, &config).unwrap();
    assert_eq!(reopened.height(), 1);
    assert_eq!(reopened.last_block().hash, block.hash);
    assert!(reopened.validate_chain());
}

#[test]
fn test_exhausted_block_waits_for_block_find() {
    let config = fast_config();
    let ledger = Ledger::new(
        share_chain::Blockchain::new(config.chain.clone(), &config.hash).unwrap(),
    );
    let template = ledger.open_template().unwrap();
    for share in 0..4 {
        assert!(ledger.claim_share(template.block_index, share, "someone", 0, "00", 1));
    }

    let exhausted = ledger.open_template().unwrap();
    assert_eq!(exhausted.shares_remaining, 0);
    assert_eq!(exhausted.search_difficulty(), exhausted.block_difficulty);

    let identity = Wallet::new().unwrap().public_key_hex();
    let dir = tempdir().unwrap();
    let coins: Arc<dyn CoinStore> = Arc::new(SledCoinStore::open(dir.path()).unwrap());
    let mut engine = MiningEngine::new(ledger.clone(), Arc::clone(&coins), &identity);
    match engine.mine_once(&AtomicBool::new(false)).unwrap() {
        MineOutcome::Block {
            share_index,
            bonus_shares,
            coins: minted,
            ..
        } => {
            assert_eq!(share_index, None);
            assert!(bonus_shares.is_empty());
            assert!(minted.is_empty());
        }
        other => panic!("expected a block find, got {other:?}"),
    }
    assert_eq!(ledger.height(), 1);
    assert!(ledger.last_block().is_closed());
    assert!(ledger.validate_chain());
}

#[test]
fn test_concurrent_miners_split_the_shares() {
    let dir = tempdir().unwrap();
    let config = fast_config();
    let ledger = Ledger::open_at(&dir.path().join("blockchain.json"), &config).unwrap();
    let coins: Arc<dyn CoinStore> =
        Arc::new(SledCoinStore::open(&dir.path().join("coins")).unwrap());
    let target_height = 3;

    let identities: Vec<String> = (0..3)
        .map(|_| Wallet::new().unwrap().public_key_hex())
        .collect();
    let handles: Vec<_> = identities
        .iter()
        .cloned()
        .map(|identity| {
            let ledger = ledger.clone();
            let coins = Arc::clone(&coins);
            thread::spawn(move || {
                let stop = AtomicBool::new(false);
                let mut engine = MiningEngine::new(ledger.clone(), coins, &identity);
                while ledger.height() < target_height {
                    engine.mine_once(&stop).unwrap();
                }
                engine.stats().clone()
            })
        })
        .collect();
    let stats: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(ledger.height() >= target_height);
    assert!(ledger.validate_chain());
    let closed: u64 = stats.iter().map(|s| s.blocks_closed).sum();
    assert_eq!(closed, ledger.height());

    // every share of every closed block went to exactly one record
    let chain = ledger.chain();
    let mut all_coins = Vec::new();
    for identity in &identities {
        all_coins.extend(coins.list(identity).unwrap());
    }
    for block in &chain[1..] {
        let mut seen = BTreeSet::new();
        for claim in block.share_claims() {
            assert!(seen.insert(claim.share_index));
        }
        assert_eq!(seen, (0..4).collect());

        let minted: Vec<u32> = all_coins
            .iter()
            .filter(|c| c.block_height == block.index)
            .filter_map(|c| c.share_index)
            .collect();
        assert_eq!(minted.len(), 4);
        assert_eq!(minted.iter().copied().collect::<BTreeSet<_>>(), seen);
    }
}

#[test]
fn test_coins_move_between_owners() {
    let dir = tempdir().unwrap();
    let config = fast_config();
    let ledger = Ledger::new(share_chain::Blockchain::new(config.chain, &config.hash).unwrap());
    let coins: Arc<dyn CoinStore> = Arc::new(SledCoinStore::open(dir.path()).unwrap());
    let alice = Wallet::new().unwrap();
    let bob = Wallet::new().unwrap();

    let template = ledger.open_template().unwrap();
    let (nonce, hash) =
        mine_proof(ledger.proof_of_work(), &template, template.block_difficulty).unwrap();
    let settlement = ledger
        .settle_proof(&alice.public_key_hex(), template.block_index, nonce, &hash)
        .unwrap();
    let minted: Vec<_> = share_chain::storage::MintRequest::from_settlement(
        &alice.public_key_hex(),
        &settlement,
    )
    .into_iter()
    .map(|request| coins.mint(request).unwrap())
    .collect();
    assert_eq!(minted.len(), 4);

    let total = coins.balance(&alice.public_key_hex()).unwrap();
    let ids: Vec<String> = minted.iter().map(|c| c.coin_id.clone()).collect();
    let merged = coins.combine(&ids, &alice).unwrap();
    assert_eq!(merged.value, total);

    let parts = coins.split(&merged.coin_id, &[total - 10, 10], &alice).unwrap();
    let gift = coins.transfer(&parts[1].coin_id, &bob.public_key_hex(), &alice).unwrap();
    assert_eq!(gift.value, 10);
    assert_eq!(coins.balance(&bob.public_key_hex()).unwrap(), 10);
    assert_eq!(coins.balance(&alice.public_key_hex()).unwrap(), total - 10);

    // bob cannot spend what alice still owns
    assert!(coins.transfer(&parts[0].coin_id, &bob.public_key_hex(), &bob).is_err());
}
