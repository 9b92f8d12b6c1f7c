// Entry point for the share-chain CLI. Every command builds its own Config and
// opens only the stores it needs, so two commands never fight over sled locks
// unless they really share a data directory.
use clap::Parser;
use log::{error, info, LevelFilter};
use share_chain::core::monetary::format_coins;
use share_chain::miner::MiningEngine;
use share_chain::network::start_tcp_node;
use share_chain::pool::{MiningClient, PoolServer, PoolState, RemoteMiner};
use share_chain::storage::{CoinStore, SledCoinStore};
use share_chain::wallet::{Signer, Wallet};
use share_chain::{Command, Config, Ledger, Opt};
use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

fn main() {
    // Info by default, RUST_LOG still wins
    env_logger::builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let opt = Opt::parse();
    let config = match opt.resolve_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Error: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = run_command(opt.command, config) {
        error!("Error: {e}");
        process::exit(1);
    }
}

fn open_coins(config: &Config) -> Result<Arc<dyn CoinStore>, Box<dyn std::error::Error>> {
    Ok(Arc::new(SledCoinStore::open(&config.coin_store_path())?))
}

fn print_stats(stats: &share_chain::miner::MinerStats) {
    println!("Blocks closed:  {}", stats.blocks_closed);
    println!("Shares claimed: {}", stats.shares_claimed);
    println!("Bonus shares:   {}", stats.bonus_shares);
    println!("Coins minted:   {}", stats.coins_minted);
    println!("Value mined:    {}", format_coins(stats.value_mined));
    println!("Hash rate:      {:.2} H/s", stats.hash_rate());
}

fn run_command(command: Command, mut config: Config) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Server { port, with_node } => {
            if let Some(port) = port {
                config.network.server_port = port;
            }
            let ledger = Ledger::open(&config)?;
            let mut state = PoolState::new(ledger.clone());
            // the gossip node shares the ledger and announces blocks closed over HTTP
            let node = if with_node {
                let handle = start_tcp_node(ledger, config.network.clone())?;
                let node = handle.node().clone();
                state = state.on_block_found(move |block| {
                    let sent = node.broadcast_block(block, None);
                    info!("Announced block {} to {sent} peers", block.index);
                });
                Some(handle)
            } else {
                None
            };
            let addr = format!("{}:{}", config.network.bind_host, config.network.server_port);
            let server = PoolServer::start(state, &addr)?;
            println!("Mining server running at {}", server.url());
            server.wait();
            if let Some(node) = node {
                node.shutdown();
            }
        }
        Command::Node {
            port,
            peers,
            mine,
            threads,
        } => {
            if let Some(port) = port {
                config.network.node_port = port;
            }
            config.network.seed_peers.extend(peers);
            let ledger = Ledger::open(&config)?;
            let handle = start_tcp_node(ledger.clone(), config.network.clone())?;
            println!("Node listening on {}", handle.local_addr());

            if mine {
                let wallet = Wallet::load_or_create(&config.wallet_path())?;
                let identity = wallet.public_key_hex();
                info!("Mining is on, rewards go to {identity}");
                let node = handle.node().clone();
                let mut engine = MiningEngine::new(ledger, open_coins(&config)?, &identity)
                    .with_threads(threads)
                    .on_block_found(move |block| {
                        let sent = node.broadcast_block(block, None);
                        info!("Announced block {} to {sent} peers", block.index);
                    });
                let stop = AtomicBool::new(false);
                let stats = engine.mine_continuous(None, &stop);
                print_stats(&stats);
                handle.shutdown();
            } else {
                handle.wait();
            }
        }
        Command::Mine { blocks, threads } => {
            let wallet = Wallet::load_or_create(&config.wallet_path())?;
            let ledger = Ledger::open(&config)?;
            let identity = wallet.public_key_hex();
            println!("Mining to {identity}");
            let mut engine =
                MiningEngine::new(ledger, open_coins(&config)?, &identity).with_threads(threads);
            let stop = AtomicBool::new(false);
            let stats = engine.mine_continuous(blocks, &stop);
            print_stats(&stats);
            if !engine.pending_mints().is_empty() {
                println!("Unrecorded coins: {}", engine.pending_mints().len());
            }
        }
        Command::RemoteMine {
            url,
            blocks,
            threads,
        } => {
            let url = url.unwrap_or_else(|| config.network.server_url.clone());
            let wallet = Wallet::load_or_create(&config.wallet_path())?;
            let client = MiningClient::new(&url)?;
            let info = client.server_info()?;
            println!(
                "Connected to {} {} at height {}, share difficulty {}, block difficulty {}",
                info.name, info.version, info.height, info.share_difficulty, info.block_difficulty
            );
            let mut miner = RemoteMiner::new(
                client,
                &config.hash,
                open_coins(&config)?,
                &wallet.public_key_hex(),
            )?
            .with_threads(threads);
            let stop = AtomicBool::new(false);
            let stats = miner.mine_continuous(blocks, &stop);
            print_stats(&stats);
        }
        Command::Info { url } => {
            let info = match url {
                Some(url) => MiningClient::new(&url)?.chain_info()?,
                None => Ledger::open(&config)?.info(),
            };
            println!("Height:           {}", info.height);
            println!("Share difficulty: {}", info.share_difficulty);
            println!("Block difficulty: {}", info.block_difficulty);
            println!("Block reward:     {}", format_coins(info.block_reward));
            println!("Share value:      {}", format_coins(info.share_value));
            println!("Shares per block: {}", info.shares_per_block);
            println!("Pending txs:      {}", info.pending_transactions);
            if let Some(open) = &info.current_open_block {
                println!(
                    "Open block {}:    {} claimed, {} remaining",
                    open.index, open.shares_claimed, open.shares_remaining
                );
            }
            for block in &info.recent_blocks {
                println!(
                    "  #{} {} shares={} closed={}",
                    block.index, block.hash, block.shares, block.is_closed
                );
            }
        }
        Command::Balance { owner } => {
            let owner = match owner {
                Some(owner) => owner,
                None => Wallet::load(&config.wallet_path())?.public_key_hex(),
            };
            let coins = open_coins(&config)?;
            for coin in coins.list(&owner)?.iter().filter(|c| !c.is_spent) {
                println!(
                    "{}  {}  block {} share {:?}{}",
                    coin.coin_id,
                    format_coins(coin.value),
                    coin.block_height,
                    coin.share_index,
                    if coin.is_bonus_share { " (bonus)" } else { "" }
                );
            }
            println!("Balance of {owner}: {}", format_coins(coins.balance(&owner)?));
        }
        Command::Createwallet => {
            let path = config.wallet_path();
            if path.exists() {
                return Err(format!("A wallet already exists at {}", path.display()).into());
            }
            let wallet = Wallet::new()?;
            wallet.save(&path)?;
            println!("Your new identity: {}", wallet.public_key_hex());
        }
        Command::Validate => {
            let ledger = Ledger::open(&config)?;
            if !ledger.validate_chain() {
                return Err("Ledger failed validation".into());
            }
            println!("Ledger valid, height {}", ledger.height());
        }
        Command::Printchain => {
            for block in Ledger::open(&config)?.chain() {
                println!("Block {}", block.index);
                println!("  Hash:     {}", block.hash);
                println!("  Previous: {}", block.previous_hash);
                println!("  Time:     {}", block.timestamp);
                println!(
                    "  Difficulty share/block: {}/{}",
                    block.share_difficulty, block.block_difficulty
                );
                println!(
                    "  Shares claimed: {}/{}",
                    block.claimed_shares().len(),
                    block.total_shares
                );
                if !block.miner.is_empty() {
                    println!("  Finder:   {}", block.miner);
                }
                for tx in &block.transactions {
                    println!("  - {} {:?}", tx.txid, tx.tx_type);
                }
            }
        }
        Command::Transfer { coin_id, to } => {
            let wallet = Wallet::load(&config.wallet_path())?;
            let coin = open_coins(&config)?.transfer(&coin_id, &to, &wallet)?;
            println!("Transferred as {} ({})", coin.coin_id, format_coins(coin.value));
        }
        Command::Split { coin_id, amounts } => {
            let wallet = Wallet::load(&config.wallet_path())?;
            for coin in open_coins(&config)?.split(&coin_id, &amounts, &wallet)? {
                println!("{}  {}", coin.coin_id, format_coins(coin.value));
            }
        }
        Command::Combine { coin_ids } => {
            let wallet = Wallet::load(&config.wallet_path())?;
            let coin = open_coins(&config)?.combine(&coin_ids, &wallet)?;
            println!("Combined into {} ({})", coin.coin_id, format_coins(coin.value));
        }
    }
    Ok(())
}
