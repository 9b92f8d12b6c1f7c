use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "share-chain", about = "Share-based proof-of-work ledger")]
pub struct Opt {
    #[arg(long, global = true, help = "TOML configuration file")]
    pub config: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        help = "Use tiny hashing parameters and low difficulties"
    )]
    pub testnet: bool,
    #[arg(long = "data-dir", global = true, help = "Override the data directory")]
    pub data_dir: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(name = "server", about = "Run the HTTP mining coordinator")]
    Server {
        #[arg(long, help = "HTTP port (defaults to the configured server port)")]
        port: Option<u16>,
        #[arg(long = "with-node", help = "Also run a gossip node on the same ledger")]
        with_node: bool,
    },
    #[command(name = "node", about = "Run a gossip node")]
    Node {
        #[arg(long, help = "Gossip port (defaults to the configured node port)")]
        port: Option<u16>,
        #[arg(long = "peer", help = "host:port of a peer to contact on startup")]
        peers: Vec<String>,
        #[arg(long, help = "Mine on this node's ledger and broadcast found blocks")]
        mine: bool,
        #[arg(long, default_value_t = 1, help = "Mining threads")]
        threads: usize,
    },
    #[command(name = "mine", about = "Mine directly on the local ledger")]
    Mine {
        #[arg(long, help = "Stop after closing this many blocks")]
        blocks: Option<u64>,
        #[arg(long, default_value_t = 1, help = "Mining threads")]
        threads: usize,
    },
    #[command(name = "remote-mine", about = "Mine against an HTTP coordinator")]
    RemoteMine {
        #[arg(long, help = "Coordinator URL (defaults to the configured server URL)")]
        url: Option<String>,
        #[arg(long, help = "Stop after closing this many blocks")]
        blocks: Option<u64>,
        #[arg(long, default_value_t = 1, help = "Mining threads")]
        threads: usize,
    },
    #[command(name = "info", about = "Show chain height, difficulty and rewards")]
    Info {
        #[arg(long, help = "Ask a coordinator instead of reading the local ledger")]
        url: Option<String>,
    },
    #[command(name = "balance", about = "Show the coins recorded for an owner")]
    Balance {
        #[arg(help = "Owner public key (defaults to the local wallet)")]
        owner: Option<String>,
    },
    #[command(name = "createwallet", about = "Create the local mining wallet")]
    Createwallet,
    #[command(name = "validate", about = "Validate the local ledger")]
    Validate,
    #[command(name = "printchain", about = "Print all blocks of the local ledger")]
    Printchain,
    #[command(name = "transfer", about = "Give a coin to another owner")]
    Transfer {
        #[arg(help = "Coin to transfer")]
        coin_id: String,
        #[arg(help = "Recipient public key")]
        to: String,
    },
    #[command(name = "split", about = "Split a coin into several")]
    Split {
        #[arg(help = "Coin to split")]
        coin_id: String,
        #[arg(required = true, num_args = 2.., help = "Values of the new coins")]
        amounts: Vec<u64>,
    },
    #[command(name = "combine", about = "Merge several coins into one")]
    Combine {
        #[arg(required = true, num_args = 2.., help = "Coins to merge")]
        coin_ids: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_node_with_peers() {
        let opt = Opt::parse_from([
            "share-chain",
            "--testnet",
            "node",
            "--port",
            "9001",
            "--peer",
            "127.0.0.1:9000",
            "--peer",
            "127.0.0.1:9002",
            "--mine",
        ]);
        assert!(opt.testnet);
        match opt.command {
            Command::Node {
                port, peers, mine, ..
            } => {
                assert_eq!(port, Some(9001));
                assert_eq!(peers.len(), 2);
                assert!(mine);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_split_needs_two_amounts() {
        assert!(Opt::try_parse_from(["share-chain", "split", "COIN-1", "5"]).is_err());
        let opt = Opt::try_parse_from(["share-chain", "split", "COIN-1", "5", "7"]).unwrap();
        assert!(matches!(opt.command, Command::Split { ref amounts, .. } if amounts == &[5, 7]));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let opt = Opt::parse_from(["share-chain", "info", "--data-dir", "/tmp/x"]);
        assert_eq!(opt.data_dir, Some(PathBuf::from("/tmp/x")));
    }
}
