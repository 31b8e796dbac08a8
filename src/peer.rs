/*
src/peer.rs

Peer identity and the soft-state membership containers. A peer is just an
IPv4 address and a TCP service port; "host:port" is the canonical key
everywhere. The table maps peers to the instant they were last heard from,
and entries expire unless refreshed by heartbeats or responses.
*/

use crate::error::{ShareError, ShareResult};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> PeerAddr {
        PeerAddr {
            host: host.into(),
            port,
        }
    }

    /// Resolves to a socket address, failing if the host is not an IPv4
    /// literal.
    pub fn socket_addr(&self) -> ShareResult<SocketAddr> {
        let ip: Ipv4Addr = self
            .host
            .parse()
            .map_err(|_| ShareError::InvalidAddress(self.to_string()))?;
        Ok(SocketAddr::V4(SocketAddrV4::new(ip, self.port)))
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerAddr {
    type Err = ShareError;

    fn from_str(s: &str) -> ShareResult<PeerAddr> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ShareError::InvalidAddress(s.to_string()))?;
        if host.parse::<Ipv4Addr>().is_err() {
            return Err(ShareError::InvalidAddress(s.to_string()));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| ShareError::InvalidAddress(s.to_string()))?;
        Ok(PeerAddr::new(host, port))
    }
}

/// Last-seen timestamps for every known peer. All mutations go through the
/// inner mutex so the UDP handler, the timers, and searchers can share it.
#[derive(Debug, Default)]
pub struct PeerTable {
    entries: Mutex<HashMap<PeerAddr, Instant>>,
}

impl PeerTable {
    pub fn new() -> PeerTable {
        PeerTable::default()
    }

    /// Inserts the peer or refreshes its last-seen instant.
    pub fn touch(&self, addr: PeerAddr) {
        self.entries.lock().unwrap().insert(addr, Instant::now());
    }

    pub fn remove(&self, addr: &PeerAddr) {
        self.entries.lock().unwrap().remove(addr);
    }

    pub fn contains(&self, addr: &PeerAddr) -> bool {
        self.entries.lock().unwrap().contains_key(addr)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the current membership.
    pub fn addresses(&self) -> Vec<PeerAddr> {
        self.entries.lock().unwrap().keys().cloned().collect()
    }

    /// Drops every peer not heard from within `timeout`; returns how many
    /// were evicted.
    pub fn remove_expired(&self, timeout: Duration) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        let now = Instant::now();
        entries.retain(|_, last_seen| now.duration_since(*last_seen) < timeout);
        before - entries.len()
    }
}

/// Recently seen discovery message ids, used to suppress forwarding loops.
/// The set is bounded; inserting past the cap evicts an arbitrary element.
#[derive(Debug)]
pub struct ProcessedSet {
    ids: Mutex<HashSet<String>>,
    cap: usize,
}

impl ProcessedSet {
    pub fn new(cap: usize) -> ProcessedSet {
        ProcessedSet {
            ids: Mutex::new(HashSet::new()),
            cap,
        }
    }

    /// Records a message id. Returns false if it was already known.
    pub fn insert(&self, id: &str) -> bool {
        let mut ids = self.ids.lock().unwrap();
        if ids.contains(id) {
            return false;
        }
        if ids.len() >= self.cap {
            if let Some(victim) = ids.iter().next().cloned() {
                ids.remove(&victim);
            }
        }
        ids.insert(id.to_string())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.lock().unwrap().contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_addr_round_trip() {
        let addr: PeerAddr = "192.168.1.7:8080".parse().unwrap();
        assert_eq!(addr.host, "192.168.1.7");
        assert_eq!(addr.port, 8080);
        assert_eq!(addr.to_string(), "192.168.1.7:8080");
        assert_eq!(
            addr.socket_addr().unwrap(),
            "192.168.1.7:8080".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_peer_addr_rejects_garbage() {
        assert!("no-port".parse::<PeerAddr>().is_err());
        assert!("localhost:80".parse::<PeerAddr>().is_err());
        assert!("10.0.0.1:notaport".parse::<PeerAddr>().is_err());
        assert!("10.0.0.1:99999".parse::<PeerAddr>().is_err());
    }

    #[test]
    fn test_table_touch_and_expire() {
        let table = PeerTable::new();
        let a = PeerAddr::new("10.0.0.1", 9000);
        let b = PeerAddr::new("10.0.0.2", 9000);
        table.touch(a.clone());
        table.touch(b.clone());
        assert_eq!(table.len(), 2);

        // nothing is older than a generous timeout
        assert_eq!(table.remove_expired(Duration::from_secs(60)), 0);
        assert_eq!(table.len(), 2);

        // everything is older than a zero timeout
        assert_eq!(table.remove_expired(Duration::from_secs(0)), 2);
        assert!(table.is_empty());
        assert!(!table.contains(&a));
    }

    #[test]
    fn test_table_touch_refreshes() {
        let table = PeerTable::new();
        let a = PeerAddr::new("10.0.0.1", 9000);
        table.touch(a.clone());
        table.touch(a.clone());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_processed_set_dedup() {
        let set = ProcessedSet::new(16);
        assert!(set.insert("m1"));
        assert!(!set.insert("m1"));
        assert!(set.contains("m1"));
    }

    #[test]
    fn test_processed_set_bounded() {
        let set = ProcessedSet::new(4);
        for i in 0..10 {
            assert!(set.insert(&format!("m{}", i)));
        }
        assert!(set.len() <= 4);
    }
}
