//! HTTP coordinator integration tests
//!
//! A real `PoolServer` on an ephemeral port, driven through `MiningClient`.

use share_chain::core::{Ledger, Rejection, RejectionKind};
use share_chain::network::Node;
use share_chain::pool::{
    mint_requests, MiningClient, PoolServer, PoolState, RemoteMiner, SubmitRequest,
};
use share_chain::storage::{CoinStore, SledCoinStore};
use share_chain::testnet::{fast_config, mine_proof, share_only_proofs, MemoryTransport};
use share_chain::wallet::{Signer, Wallet};
use share_chain::{Blockchain, NetworkParams};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tempfile::tempdir;

fn start() -> (Ledger, PoolServer, MiningClient) {
    let config = fast_config();
    let ledger = Ledger::new(Blockchain::new(config.chain, &config.hash).unwrap());
    let server = PoolServer::start(ledger.clone(), "127.0.0.1:0").unwrap();
    let client = MiningClient::new(&server.url()).unwrap();
    (ledger, server, client)
}

#[test]
fn test_info_and_template() {
    let (ledger, server, client) = start();

    let info = client.server_info().unwrap();
    assert_eq!(info.name, "share-chain");
    assert_eq!(info.height, 0);
    assert_eq!(info.shares_per_block, 4);
    assert_eq!(info.block_difficulty, info.share_difficulty + 2);

    let template = client.current_block().unwrap();
    assert_eq!(template.block_index, 1);
    assert_eq!(template.shares_remaining, 4);
    assert_eq!(template, ledger.open_template().unwrap());

    let chain_info = client.chain_info().unwrap();
    assert_eq!(chain_info.current_open_block.map(|b| b.index), Some(1));
    assert_eq!(client.height().unwrap(), 0);
    server.shutdown();
}

#[test]
fn test_submissions_are_checked_by_the_server() {
    let (ledger, server, client) = start();
    let miner = Wallet::new().unwrap().public_key_hex();
    let template = client.current_block().unwrap();

    // forged hash: claims plenty of leading zeros but is not what the header hashes to
    let forged = client
        .submit_share(&SubmitRequest {
            miner_pubkey: miner.clone(),
            nonce: 1,
            hash: "0".repeat(64),
            block_index: template.block_index,
        })
        .unwrap();
    assert!(!forged.success);
    assert_eq!(forged.message, Rejection::HashMismatch.to_string());
    assert_eq!(forged.reason, Some(RejectionKind::HashMismatch));
    assert!(forged.coin_data.is_none());

    // a real proof against an index that is not open
    let (nonce, hash) =
        mine_proof(ledger.proof_of_work(), &template, template.share_difficulty).unwrap();
    let stale = client
        .submit_share(&SubmitRequest {
            miner_pubkey: miner.clone(),
            nonce,
            hash: hash.clone(),
            block_index: template.block_index + 5,
        })
        .unwrap();
    assert!(!stale.success);
    assert!(stale.message.starts_with("Block index mismatch"));
    assert_eq!(stale.reason, Some(RejectionKind::StaleBlock));
    assert_eq!(client.current_block().unwrap().shares_remaining, 4);

    // close the block, then replay the same proof
    let (nonce, hash) =
        mine_proof(ledger.proof_of_work(), &template, template.block_difficulty).unwrap();
    let request = SubmitRequest {
        miner_pubkey: miner.clone(),
        nonce,
        hash,
        block_index: template.block_index,
    };
    let found = client.submit_share(&request).unwrap();
    assert!(found.success);
    assert!(found.is_block_find);
    assert_eq!(found.share_index, Some(0));
    assert_eq!(found.bonus_shares, vec![1, 2, 3]);
    let coin_data = found.coin_data.clone().unwrap();
    assert_eq!(coin_data.block_height, template.block_index);
    assert!(coin_data.is_block_finder);
    assert_eq!(mint_requests(&miner, &found).len(), 4);
    assert_eq!(client.height().unwrap(), 1);

    let replay = client.submit_share(&request).unwrap();
    assert!(!replay.success);
    assert!(replay.coin_data.is_none());
    assert_eq!(ledger.last_block().claimed_shares().len(), 4);
    server.shutdown();
}

#[test]
fn test_remote_miner_closes_a_block() {
    let (ledger, server, client) = start();
    let dir = tempdir().unwrap();
    let coins: Arc<dyn CoinStore> = Arc::new(SledCoinStore::open(dir.path()).unwrap());
    let identity = Wallet::new().unwrap().public_key_hex();

    let mut miner = RemoteMiner::new(
        client.clone(),
        &fast_config().hash,
        Arc::clone(&coins),
        &identity,
    )
    .unwrap()
    .with_threads(2);
    let stats = miner.mine_continuous(Some(1), &AtomicBool::new(false));

    assert_eq!(stats.blocks_closed, 1);
    assert_eq!(ledger.height(), 1);
    assert_eq!(ledger.last_block().miner, identity);
    assert!(ledger.validate_chain());
    let owned = coins.list(&identity).unwrap();
    assert_eq!(owned.len(), 4);
    assert_eq!(stats.coins_minted, 4);
    assert_eq!(coins.balance(&identity).unwrap(), stats.value_mined);

    let reset = client.reset().unwrap();
    assert!(reset.success);
    assert_eq!(client.height().unwrap(), 0);
    server.shutdown();
}

#[test]
fn test_resubmitted_share_is_refused() {
    let (ledger, server, client) = start();
    let template = client.current_block().unwrap();
    let (nonce, hash) = share_only_proofs(ledger.proof_of_work(), &template, 1)
        .unwrap()
        .remove(0);
    let request = |miner: &str| SubmitRequest {
        miner_pubkey: miner.to_string(),
        nonce,
        hash: hash.clone(),
        block_index: template.block_index,
    };

    let first = client.submit_share(&request("alice")).unwrap();
    assert!(first.success);
    assert_eq!(first.share_index, Some(0));

    for miner in ["alice", "mallory"] {
        let replay = client.submit_share(&request(miner)).unwrap();
        assert!(!replay.success);
        assert_eq!(replay.reason, Some(RejectionKind::DuplicateProof));
        assert!(replay.coin_data.is_none());
    }
    assert_eq!(client.current_block().unwrap().shares_remaining, 3);
    server.shutdown();
}

#[test]
fn test_block_closed_over_http_reaches_peers() {
    let config = fast_config();
    let ledger = Ledger::new(Blockchain::new(config.chain.clone(), &config.hash).unwrap());
    let peer_ledger = Ledger::new(Blockchain::new(config.chain, &config.hash).unwrap());

    let transport = Arc::new(MemoryTransport::new());
    let coordinator = Node::new(ledger.clone(), NetworkParams::default(), 9300, transport.clone());
    let peer = Node::new(peer_ledger.clone(), NetworkParams::default(), 9301, transport.clone());
    transport.register("127.0.0.1:9300", coordinator.clone());
    transport.register("127.0.0.1:9301", peer);
    coordinator.connect("127.0.0.1:9301").unwrap();

    let state = PoolState::new(ledger.clone()).on_block_found(move |block| {
        coordinator.broadcast_block(block, None);
    });
    let server = PoolServer::start(state, "127.0.0.1:0").unwrap();
    let client = MiningClient::new(&server.url()).unwrap();

    let template = client.current_block().unwrap();
    let (nonce, hash) =
        mine_proof(ledger.proof_of_work(), &template, template.block_difficulty).unwrap();
    let found = client
        .submit_share(&SubmitRequest {
            miner_pubkey: "finder".to_string(),
            nonce,
            hash,
            block_index: template.block_index,
        })
        .unwrap();
    assert!(found.is_block_find);

    // the announcement goes out before the response does
    assert_eq!(peer_ledger.height(), 1);
    assert_eq!(peer_ledger.last_block(), ledger.last_block());
    server.shutdown();
}
