use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub host: String,
    pub port: u16,
    pub version: String,
    pub height: u64,
    /// Unix milliseconds
    pub last_seen: i64,
}

impl Peer {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Split `host:port`. IPv6 hosts are expected in brackets.
pub fn parse_address(address: &str) -> Option<(String, u16)> {
    let (host, port) = address.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

/// Known peers keyed by `host:port`
pub struct PeerTable {
    inner: RwLock<HashMap<String, Peer>>,
    max_peers: usize,
}

impl PeerTable {
    pub fn new(max_peers: usize) -> PeerTable {
        PeerTable {
            inner: RwLock::new(HashMap::new()),
            max_peers,
        }
    }

    /// Insert or refresh a peer. A new peer is refused once the table is full.
    pub fn upsert(&self, peer: Peer) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let address = peer.address();
        if !inner.contains_key(&address) && inner.len() >= self.max_peers {
            return false;
        }
        inner.insert(address, peer);
        true
    }

    /// Mark a known peer as alive, optionally with its new height
    pub fn touch(&self, address: &str, height: Option<u64>, now: i64) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(peer) = inner.get_mut(address) {
            peer.last_seen = now;
            if let Some(height) = height {
                peer.height = height;
            }
        }
    }

    pub fn remove(&self, address: &str) -> Option<Peer> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(address)
    }

    pub fn get(&self, address: &str) -> Option<Peer> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(address)
    }

    pub fn all(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        peers.sort_by_key(|p| p.address());
        peers
    }

    pub fn addresses(&self) -> Vec<String> {
        self.all().iter().map(Peer::address).collect()
    }

    /// Drop peers not heard from since `now - timeout_ms`; returns their addresses.
    pub fn prune(&self, now: i64, timeout_ms: i64) -> Vec<String> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let stale: Vec<String> = inner
            .iter()
            .filter(|(_, p)| now - p.last_seen > timeout_ms)
            .map(|(a, _)| a.clone())
            .collect();
        for address in &stale {
            inner.remove(address);
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_peers
    }
}
