use crate::config::NetworkParams;
use crate::core::{Block, Ledger, Transaction};
use crate::error::{BlockchainError, Result};
use crate::network::message::{read_frame, write_frame, Message};
use crate::network::peer::{parse_address, Peer, PeerTable};
use crate::network::transport::{TcpTransport, Transport};
use crate::utils::current_timestamp;
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const STOP_POLL: Duration = Duration::from_millis(100);

fn now() -> i64 {
    current_timestamp().unwrap_or_default()
}

/// A gossip node: answers peers, relays blocks and transactions, and keeps the
/// local ledger in line with the longest valid chain it can see.
#[derive(Clone)]
pub struct Node {
    ledger: Ledger,
    peers: Arc<PeerTable>,
    transport: Arc<dyn Transport>,
    params: NetworkParams,
    port: u16,
    stop: Arc<AtomicBool>,
    // peers a block-triggered sync is currently running against
    syncing: Arc<Mutex<HashSet<String>>>,
}

impl Node {
    /// `port` is the port peers should use to reach this node.
    pub fn new(
        ledger: Ledger,
        params: NetworkParams,
        port: u16,
        transport: Arc<dyn Transport>,
    ) -> Node {
        Node {
            ledger,
            peers: Arc::new(PeerTable::new(params.max_peers)),
            transport,
            params,
            port,
            stop: Arc::new(AtomicBool::new(false)),
            syncing: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn hello(&self) -> Message {
        Message::Hello {
            version: self.params.protocol_version.clone(),
            height: self.ledger.height(),
            port: self.port,
        }
    }

    fn is_self(&self, address: &str) -> bool {
        match parse_address(address) {
            Some((host, port)) => {
                port == self.port
                    && (matches!(
                        host.as_str(),
                        "127.0.0.1" | "localhost" | "0.0.0.0" | "::1"
                    ) || host == self.params.bind_host)
            }
            None => false,
        }
    }

    /// Answer one message from `from_host`. Returns the reply, if the message
    /// has one.
    pub fn handle(&self, from_host: &str, message: Message) -> Option<Message> {
        debug!("Received {} from {from_host}", message.kind());
        match message {
            Message::Hello {
                version,
                height,
                port,
            } => {
                let peer = Peer {
                    host: from_host.to_string(),
                    port,
                    version,
                    height,
                    last_seen: now(),
                };
                let address = peer.address();
                if !self.is_self(&address) && !self.peers.contains(&address) {
                    if self.peers.upsert(peer) {
                        info!("New peer {address} at height {height}");
                    }
                } else {
                    self.peers.touch(&address, Some(height), now());
                }
                Some(self.hello())
            }
            Message::Ping { .. } => Some(Message::Pong { timestamp: now() }),
            Message::GetBlocks { start } => Some(Message::Blocks {
                blocks: self
                    .ledger
                    .blocks_from(start, self.params.max_blocks_per_sync),
            }),
            Message::NewBlock { block, port } => {
                let sender = format!("{from_host}:{port}");
                self.peers.touch(&sender, Some(block.index), now());
                self.receive_block(block, &sender);
                None
            }
            Message::NewTx { transaction, port } => {
                let sender = format!("{from_host}:{port}");
                self.peers.touch(&sender, None, now());
                if self.ledger.add_transaction(transaction.clone()) {
                    self.broadcast_transaction(&transaction, Some(&sender));
                }
                None
            }
            Message::GetPeers => Some(Message::Peers {
                peers: self.peers.addresses(),
            }),
            other => {
                debug!("Ignoring unsolicited {} from {from_host}", other.kind());
                None
            }
        }
    }

    fn receive_block(&self, block: Block, sender: &str) {
        let index = block.index;
        if self.ledger.add_block(block.clone()) {
            info!("Accepted block {index} from {sender}");
            self.broadcast_block(&block, Some(sender));
            return;
        }
        // A block past our tip that does not attach means we are behind or on
        // another branch; ask the sender for its chain.
        // At most one such sync per sender; further blocks from it while one
        // is running are dropped.
        if index > self.ledger.height() {
            if !self.begin_sync(sender) {
                debug!("Sync with {sender} already running, ignoring block {index}");
                return;
            }
            let node = self.clone();
            let sender = sender.to_string();
            thread::spawn(move || {
                if let Err(e) = node.sync_with(&sender) {
                    warn!("Sync with {sender} failed: {e}");
                }
                node.end_sync(&sender);
            });
        }
    }

    fn syncing(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.syncing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin_sync(&self, sender: &str) -> bool {
        self.syncing().insert(sender.to_string())
    }

    fn end_sync(&self, sender: &str) {
        self.syncing().remove(sender);
    }

    /// Block-triggered syncs still running
    pub fn syncs_in_flight(&self) -> usize {
        self.syncing().len()
    }

    /// Handshake with `address` and remember it as a peer.
    pub fn connect(&self, address: &str) -> Result<Peer> {
        if self.is_self(address) {
            return Err(BlockchainError::Network(format!(
                "Refusing to connect to self at {address}"
            )));
        }
        let (host, port) = parse_address(address)
            .ok_or_else(|| BlockchainError::Network(format!("Invalid peer address {address}")))?;
        match self.transport.request(address, &self.hello())? {
            Message::Hello {
                version, height, ..
            } => {
                let peer = Peer {
                    host,
                    port,
                    version,
                    height,
                    last_seen: now(),
                };
                if !self.peers.upsert(peer.clone()) {
                    return Err(BlockchainError::Network(format!(
                        "Peer table full, not adding {address}"
                    )));
                }
                info!("Connected to {address} at height {height}");
                Ok(peer)
            }
            other => Err(BlockchainError::Network(format!(
                "Expected hello from {address}, got {}",
                other.kind()
            ))),
        }
    }

    /// Best effort: a peer that cannot be reached is logged and skipped.
    /// Returns how many peers the block was delivered to.
    pub fn broadcast_block(&self, block: &Block, except: Option<&str>) -> usize {
        self.broadcast(
            &Message::NewBlock {
                block: block.clone(),
                port: self.port,
            },
            except,
        )
    }

    pub fn broadcast_transaction(&self, transaction: &Transaction, except: Option<&str>) -> usize {
        self.broadcast(
            &Message::NewTx {
                transaction: transaction.clone(),
                port: self.port,
            },
            except,
        )
    }

    fn broadcast(&self, message: &Message, except: Option<&str>) -> usize {
        let mut delivered = 0;
        for address in self.peers.addresses() {
            if except == Some(address.as_str()) {
                continue;
            }
            match self.transport.send(&address, message) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Failed to send {} to {address}: {e}", message.kind()),
            }
        }
        delivered
    }

    fn fetch_blocks(&self, address: &str, start: u64) -> Result<Vec<Block>> {
        match self
            .transport
            .request(address, &Message::GetBlocks { start })?
        {
            Message::Blocks { blocks } => Ok(blocks),
            other => Err(BlockchainError::Network(format!(
                "Expected blocks from {address}, got {}",
                other.kind()
            ))),
        }
    }

    /// The peer's whole chain, page by page
    fn fetch_chain(&self, address: &str, peer_height: u64) -> Result<Vec<Block>> {
        let mut chain: Vec<Block> = Vec::new();
        while (chain.len() as u64) <= peer_height {
            let page = self.fetch_blocks(address, chain.len() as u64)?;
            if page.is_empty() || page[0].index != chain.len() as u64 {
                break;
            }
            chain.extend(page);
        }
        Ok(chain)
    }

    /// Catch up with one peer. Blocks that extend our tip are appended one by
    /// one; if the first one does not attach, the peer is on another branch and
    /// its full chain is offered to `replace_chain`. Returns the height gained.
    pub fn sync_with(&self, address: &str) -> Result<u64> {
        let peer_height = match self.transport.request(address, &self.hello())? {
            Message::Hello { height, .. } => height,
            other => {
                return Err(BlockchainError::Network(format!(
                    "Expected hello from {address}, got {}",
                    other.kind()
                )))
            }
        };
        self.peers.touch(address, Some(peer_height), now());

        let start_height = self.ledger.height();
        let mut local = start_height;
        while local < peer_height && !self.is_stopped() {
            let blocks = self.fetch_blocks(address, local + 1)?;
            if blocks.is_empty() {
                break;
            }
            let mut added = 0;
            for block in blocks {
                if !self.ledger.add_block(block) {
                    break;
                }
                added += 1;
            }
            if added == 0 {
                let chain = self.fetch_chain(address, peer_height)?;
                if self.ledger.replace_chain(chain) {
                    info!("Switched to the chain of {address}");
                }
                break;
            }
            local = self.ledger.height();
        }

        let gained = self.ledger.height().saturating_sub(start_height);
        if gained > 0 {
            info!("Synced {gained} blocks from {address}");
        }
        Ok(gained)
    }

    /// Sync with every peer that reports a greater height. The hello each
    /// sync starts with also keeps the peer's `last_seen` fresh.
    pub fn sync_with_peers(&self) -> u64 {
        let mut gained = 0;
        for address in self.peers.addresses() {
            match self.sync_with(&address) {
                Ok(n) => gained += n,
                Err(e) => warn!("Sync with {address} failed: {e}"),
            }
        }
        gained
    }

    /// Ask every peer for its peers and connect to the ones we do not know
    pub fn discover_peers(&self) -> usize {
        let mut learnt = 0;
        for address in self.peers.addresses() {
            if self.peers.is_full() {
                break;
            }
            let candidates = match self.transport.request(&address, &Message::GetPeers) {
                Ok(Message::Peers { peers }) => peers,
                Ok(other) => {
                    debug!("Expected peers from {address}, got {}", other.kind());
                    continue;
                }
                Err(e) => {
                    debug!("Peer discovery via {address} failed: {e}");
                    continue;
                }
            };
            for candidate in candidates {
                if self.peers.is_full() {
                    break;
                }
                if self.is_self(&candidate) || self.peers.contains(&candidate) {
                    continue;
                }
                match self.connect(&candidate) {
                    Ok(_) => learnt += 1,
                    Err(e) => debug!("Could not reach {candidate}: {e}"),
                }
            }
        }
        learnt
    }

    /// One maintenance round: prune, discover, sync
    pub fn maintain(&self) {
        let timeout_ms = self.params.peer_timeout_secs as i64 * 1000;
        for address in self.peers.prune(now(), timeout_ms) {
            info!("Dropped silent peer {address}");
        }
        self.discover_peers();
        self.sync_with_peers();
    }

    fn maintenance_loop(&self) {
        let interval = Duration::from_secs(self.params.sync_interval_secs.max(1));
        while !self.is_stopped() {
            self.maintain();
            let mut waited = Duration::ZERO;
            while waited < interval && !self.is_stopped() {
                thread::sleep(STOP_POLL);
                waited += STOP_POLL;
            }
        }
    }

    fn accept_loop(&self, listener: TcpListener) {
        while !self.is_stopped() {
            match listener.accept() {
                Ok((stream, remote)) => {
                    let node = self.clone();
                    thread::spawn(move || {
                        if let Err(e) = node.serve(stream, remote) {
                            debug!("Connection from {remote} ended: {e}");
                        }
                    });
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(e) => {
                    error!("Error accepting connection: {e}");
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
        info!("Node on port {} stopped accepting", self.port);
    }

    fn serve(&self, mut stream: TcpStream, remote: SocketAddr) -> Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(Duration::from_secs(self.params.peer_timeout_secs.max(1))))?;
        let host = remote.ip().to_string();
        while !self.is_stopped() {
            let Some(message) = read_frame(&mut stream)? else {
                break;
            };
            if let Some(reply) = self.handle(&host, message) {
                write_frame(&mut stream, &reply)?;
            }
        }
        Ok(())
    }
}

/// A running node: the accept thread and the maintenance thread.
pub struct NodeHandle {
    node: Node,
    local_addr: SocketAddr,
    threads: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Block until the node is stopped from elsewhere
    pub fn wait(self) {
        for handle in self.threads {
            let _ = handle.join();
        }
    }

    pub fn shutdown(self) {
        self.node.stop();
        self.wait();
    }
}

/// Bind the gossip port, contact the seed peers and start serving. A bind
/// failure is returned to the caller.
pub fn start_node(
    ledger: Ledger,
    params: NetworkParams,
    transport: Arc<dyn Transport>,
) -> Result<NodeHandle> {
    let bind = format!("{}:{}", params.bind_host, params.node_port);
    let listener = TcpListener::bind(&bind)
        .map_err(|e| BlockchainError::Network(format!("Failed to bind to {bind}: {e}")))?;
    let local_addr = listener.local_addr()?;
    listener.set_nonblocking(true)?;

    let node = Node::new(ledger, params, local_addr.port(), transport);
    info!("Node listening on {local_addr}");
    for seed in node.params.seed_peers.clone() {
        if let Err(e) = node.connect(&seed) {
            warn!("Seed peer {seed} unreachable: {e}");
        }
    }

    let accept = {
        let node = node.clone();
        thread::spawn(move || node.accept_loop(listener))
    };
    let maintenance = {
        let node = node.clone();
        thread::spawn(move || node.maintenance_loop())
    };
    Ok(NodeHandle {
        node,
        local_addr,
        threads: vec![accept, maintenance],
    })
}

/// `start_node` over plain TCP with the configured timeouts
pub fn start_tcp_node(ledger: Ledger, params: NetworkParams) -> Result<NodeHandle> {
    let transport = Arc::new(TcpTransport::new(
        Duration::from_millis(params.connect_timeout_ms),
        Duration::from_secs(params.peer_timeout_secs.max(1)),
    ));
    start_node(ledger, params, transport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Blockchain, TxInput, TxOutput, TxType};
    use crate::testnet::{fast_config, mine_proof, MemoryTransport};
    use crate::wallet::Wallet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Condvar;
    use std::time::Instant;

    fn ledger() -> Ledger {
        let config = fast_config();
        Ledger::new(Blockchain::new(config.chain, &config.hash).unwrap())
    }

    /// Close the open block on `ledger` with a block-difficulty proof
    fn close_block(ledger: &Ledger) -> Block {
        let template = ledger.open_template().unwrap();
        let (nonce, hash) =
            mine_proof(ledger.proof_of_work(), &template, template.block_difficulty).unwrap();
        ledger
            .settle_proof("miner", template.block_index, nonce, &hash)
            .unwrap()
            .closed_block
            .unwrap()
    }

    fn mesh(count: u16) -> (Arc<MemoryTransport>, Vec<Node>) {
        let transport = Arc::new(MemoryTransport::new());
        let nodes: Vec<Node> = (0..count)
            .map(|i| {
                let node = Node::new(
                    ledger(),
                    NetworkParams::default(),
                    9000 + i,
                    transport.clone(),
                );
                transport.register(&format!("127.0.0.1:{}", 9000 + i), node.clone());
                node
            })
            .collect();
        (transport, nodes)
    }

    #[test]
    fn test_hello_registers_peer() {
        let (_transport, nodes) = mesh(2);
        let peer = nodes[0].connect("127.0.0.1:9001").unwrap();
        assert_eq!(peer.port, 9001);
        assert!(nodes[0].peers().contains("127.0.0.1:9001"));
        // the other side learnt about us from the hello
        assert!(nodes[1].peers().contains("127.0.0.1:9000"));
        assert!(nodes[0].connect("127.0.0.1:9000").is_err());
    }

    #[test]
    fn test_new_block_is_not_echoed_to_sender() {
        let (transport, nodes) = mesh(3);
        nodes[0].connect("127.0.0.1:9001").unwrap();
        nodes[0].connect("127.0.0.1:9002").unwrap();
        nodes[1].connect("127.0.0.1:9002").unwrap();

        let block = close_block(nodes[0].ledger());
        nodes[0].broadcast_block(&block, None);

        assert!(nodes.iter().all(|n| n.ledger().height() == 1));
        let sends = transport.sent();
        assert!(sends
            .iter()
            .all(|(from, to, _)| !(*from == 9001 && to == "127.0.0.1:9000")));
        assert!(sends
            .iter()
            .any(|(from, to, kind)| *from == 9001 && to == "127.0.0.1:9002" && kind == "new_block"));
    }

    #[test]
    fn test_sync_appends_missing_blocks() {
        let (_transport, nodes) = mesh(2);
        for _ in 0..3 {
            close_block(nodes[0].ledger());
        }
        nodes[1].connect("127.0.0.1:9000").unwrap();
        assert_eq!(nodes[1].sync_with("127.0.0.1:9000").unwrap(), 3);
        assert_eq!(nodes[1].ledger().chain(), nodes[0].ledger().chain());
        // nothing more to fetch
        assert_eq!(nodes[1].sync_with("127.0.0.1:9000").unwrap(), 0);
    }

    #[test]
    fn test_fork_resolves_to_longer_chain() {
        let (_transport, nodes) = mesh(2);
        close_block(nodes[1].ledger());
        thread::sleep(Duration::from_millis(5));
        for _ in 0..2 {
            close_block(nodes[0].ledger());
        }
        assert_ne!(nodes[0].ledger().last_block(), nodes[1].ledger().last_block());

        nodes[1].connect("127.0.0.1:9000").unwrap();
        nodes[1].sync_with("127.0.0.1:9000").unwrap();
        assert_eq!(nodes[1].ledger().chain(), nodes[0].ledger().chain());
    }

    #[test]
    fn test_discovery_and_queries() {
        let (_transport, nodes) = mesh(3);
        nodes[1].connect("127.0.0.1:9002").unwrap();
        nodes[0].connect("127.0.0.1:9001").unwrap();
        assert_eq!(nodes[0].discover_peers(), 1);
        assert!(nodes[0].peers().contains("127.0.0.1:9002"));

        assert!(matches!(
            nodes[0].handle("127.0.0.1", Message::Ping { timestamp: 1 }),
            Some(Message::Pong { .. })
        ));
        match nodes[0].handle("127.0.0.1", Message::GetBlocks { start: 0 }) {
            Some(Message::Blocks { blocks }) => assert_eq!(blocks.len(), 1),
            other => panic!("unexpected reply {other:?}"),
        }
        assert_eq!(
            nodes[0].handle("127.0.0.1", Message::Blocks { blocks: vec![] }),
            None
        );
    }

    fn transfer(fee: u64) -> Transaction {
        let wallet = Wallet::new().unwrap();
        Transaction::new_signed(
            TxType::Transfer,
            vec![TxInput::new("aa", 0)],
            vec![TxOutput::new("bob", 10)],
            fee,
            "",
            1,
            &wallet,
        )
        .unwrap()
    }

    fn new_tx_sends(transport: &MemoryTransport, from: u16) -> Vec<String> {
        transport
            .sent()
            .into_iter()
            .filter(|(port, _, kind)| *port == from && kind == "new_tx")
            .map(|(_, to, _)| to)
            .collect()
    }

    #[test]
    fn test_new_tx_is_relayed_once_and_not_echoed() {
        // a line: 9000 - 9001 - 9002
        let (transport, nodes) = mesh(3);
        nodes[0].connect("127.0.0.1:9001").unwrap();
        nodes[1].connect("127.0.0.1:9002").unwrap();

        let tx = transfer(3);
        assert!(nodes[0].ledger().add_transaction(tx.clone()));
        assert_eq!(nodes[0].broadcast_transaction(&tx, None), 1);

        assert!(nodes
            .iter()
            .all(|n| n.ledger().pending_pool().contains(&tx.txid)));
        assert_eq!(new_tx_sends(&transport, 9000), vec!["127.0.0.1:9001"]);
        // the middle node relays onwards but never back to where it came from
        assert_eq!(new_tx_sends(&transport, 9001), vec!["127.0.0.1:9002"]);
        assert!(new_tx_sends(&transport, 9002).is_empty());

        // the same transaction again is neither admitted nor relayed
        let before = transport.sent().len();
        assert_eq!(
            nodes[1].handle(
                "127.0.0.1",
                Message::NewTx {
                    transaction: tx,
                    port: 9000
                }
            ),
            None
        );
        assert_eq!(transport.sent().len(), before);
    }

    #[test]
    fn test_unacceptable_tx_is_not_relayed() {
        let (transport, nodes) = mesh(2);
        nodes[0].connect("127.0.0.1:9001").unwrap();
        let tx = transfer(u64::MAX);
        nodes[1].handle(
            "127.0.0.1",
            Message::NewTx {
                transaction: tx.clone(),
                port: 9000,
            },
        );
        assert!(!nodes[1].ledger().pending_pool().contains(&tx.txid));
        assert!(new_tx_sends(&transport, 9001).is_empty());
    }

    /// Requests block until the gate opens, then fail
    #[derive(Default)]
    struct GatedTransport {
        requests: AtomicUsize,
        open: Mutex<bool>,
        opened: Condvar,
    }

    impl GatedTransport {
        fn release(&self) {
            *self.open.lock().unwrap() = true;
            self.opened.notify_all();
        }
    }

    impl Transport for GatedTransport {
        fn request(&self, peer: &str, _: &Message) -> Result<Message> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            let mut open = self.open.lock().unwrap();
            while !*open {
                open = self.opened.wait(open).unwrap();
            }
            Err(BlockchainError::Network(format!("{peer} unreachable")))
        }

        fn send(&self, _: &str, _: &Message) -> Result<()> {
            Ok(())
        }
    }

    fn wait_until(what: &str, condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_one_sync_per_sender() {
        let transport = Arc::new(GatedTransport::default());
        let node = Node::new(ledger(), NetworkParams::default(), 9100, transport.clone());

        // a block two ahead of us, which cannot attach
        let ahead = ledger();
        close_block(&ahead);
        let block = close_block(&ahead);
        let frame = || Message::NewBlock {
            block: block.clone(),
            port: 9000,
        };

        for _ in 0..20 {
            node.handle("127.0.0.1", frame());
        }
        wait_until("the first sync to start", || {
            transport.requests.load(Ordering::SeqCst) == 1
        });
        thread::sleep(Duration::from_millis(50));
        assert_eq!(transport.requests.load(Ordering::SeqCst), 1);
        assert_eq!(node.syncs_in_flight(), 1);

        // another sender gets its own sync
        node.handle(
            "127.0.0.1",
            Message::NewBlock {
                block: block.clone(),
                port: 9001,
            },
        );
        wait_until("the second sender's sync", || {
            transport.requests.load(Ordering::SeqCst) == 2
        });

        transport.release();
        wait_until("the syncs to finish", || node.syncs_in_flight() == 0);
        node.handle("127.0.0.1", frame());
        wait_until("a fresh sync", || {
            transport.requests.load(Ordering::SeqCst) == 3
        });
    }
}
