use std::time::Duration;

pub mod catalog;
pub mod error;
pub mod node;
pub mod peer;
pub mod progress;
pub mod server;
pub mod storage;
pub mod utils;
pub mod wire;

pub mod discovery {
    pub mod message;
    pub mod service;
}

pub mod transfer {
    pub mod client;
    pub mod download;
    pub mod search;
}

/// Size of one transfer chunk in bytes; the last chunk of a file may be short.
pub const CHUNK_SIZE: u64 = 256_000;

/// Well-known UDP port for peer discovery.
pub const DISCOVERY_PORT: u16 = 8888;

/// Initial TTL carried by a discovery request.
pub const DISCOVERY_TTL: u32 = 3;

/// Discovery datagrams never exceed this size.
pub const MAX_DATAGRAM: usize = 1024;

/// Upper bound on remembered discovery message ids.
pub const PROCESSED_IDS_CAP: usize = 1024;

/// Receive timeout on the discovery socket, so shutdown is noticed promptly.
pub const UDP_RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// Interval between heartbeats to known peers.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Interval between peer table cleanup sweeps.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// A peer not heard from for this long is evicted.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(300);

/// Connect/read/write timeout on chunk transfer connections.
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(10);

/// Connect timeout when querying peer file lists.
pub const SEARCH_CONNECT_TIMEOUT: Duration = Duration::from_millis(1500);

/// Read timeout when querying peer file lists.
pub const SEARCH_READ_TIMEOUT: Duration = Duration::from_secs(3);

/// Workers per download job.
pub const DOWNLOAD_WORKERS: usize = 4;

/// Workers used to fan a search out over the peer set.
pub const SEARCH_WORKERS: usize = 5;

/// Attempts per chunk, and the consecutive-failure count that blacklists a
/// peer for the rest of a job.
pub const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Number of chunks needed to hold `length` bytes.
pub fn chunk_count(length: u64) -> u64 {
    length.div_ceil(CHUNK_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(0), 0);
        assert_eq!(chunk_count(1), 1);
        assert_eq!(chunk_count(CHUNK_SIZE - 1), 1);
        assert_eq!(chunk_count(CHUNK_SIZE), 1);
        assert_eq!(chunk_count(CHUNK_SIZE + 1), 2);
        assert_eq!(chunk_count(650_000), 3);
        assert_eq!(chunk_count(4 * CHUNK_SIZE), 4);
    }
}
