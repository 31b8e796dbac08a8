/*
src/transfer/download.rs

The download engine. Given a filename and a candidate peer set it settles on
a declared length, keeps only the peers that agree with it, pre-sizes the
destination file, and pulls chunks over a bounded worker pool with per-peer
failure accounting.

Peer trouble (timeouts, resets, sentinel replies, malformed frames) is
counted in the job's failure ledger and retried against other peers up to
the attempt cap; a peer that keeps failing is blacklisted for the rest of
this job only. Local I/O trouble is fatal for the job. Nothing is thrown
across the engine boundary; the caller gets a single terminal outcome and
the progress sink sees percent updates along the way.
*/

use crate::error::{ShareError, ShareResult};
use crate::peer::PeerAddr;
use crate::progress::ProgressSink;
use crate::storage::ChunkFile;
use crate::transfer::client::PeerClient;
use crate::{
    chunk_count, CHUNK_SIZE, DOWNLOAD_WORKERS, MAX_RETRY_ATTEMPTS, TRANSFER_TIMEOUT,
};

use crossbeam::channel;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// Terminal state of one download job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Every chunk landed.
    Completed,
    /// At least one chunk ran out of attempts.
    Incomplete,
    /// Local I/O failed; the job was abandoned.
    Error,
    /// No peer could state the file's length.
    FileNotFound,
}

impl DownloadOutcome {
    /// The status string posted to the progress sink.
    pub fn as_status(&self) -> &'static str {
        match self {
            DownloadOutcome::Completed => "Completed",
            DownloadOutcome::Incomplete => "Incomplete",
            DownloadOutcome::Error => "Error",
            DownloadOutcome::FileNotFound => "File Not Found",
        }
    }
}

/// Consecutive-failure counts per peer. Reaching the attempt cap blacklists
/// the peer until the job ends; any success clears its count.
#[derive(Debug, Default)]
pub struct FailureLedger {
    counts: Mutex<HashMap<PeerAddr, u32>>,
}

impl FailureLedger {
    pub fn new() -> FailureLedger {
        FailureLedger::default()
    }

    pub fn record_failure(&self, peer: &PeerAddr) {
        *self.counts.lock().unwrap().entry(peer.clone()).or_insert(0) += 1;
    }

    pub fn reset(&self, peer: &PeerAddr) {
        self.counts.lock().unwrap().remove(peer);
    }

    pub fn is_blacklisted(&self, peer: &PeerAddr) -> bool {
        self.counts
            .lock()
            .unwrap()
            .get(peer)
            .is_some_and(|&count| count >= MAX_RETRY_ATTEMPTS)
    }
}

/// Downloads `filename` into `dest_dir` using `candidates`, reporting
/// progress and the terminal status through `sink`.
pub fn download(
    filename: &str,
    candidates: &[PeerAddr],
    dest_dir: &Path,
    sink: &dyn ProgressSink,
) -> DownloadOutcome {
    sink.log(&format!(
        "downloading {:?} from {} candidate peer(s)",
        filename,
        candidates.len()
    ));
    let outcome = run_job(filename, candidates, dest_dir, sink);
    sink.update_progress(filename, outcome.as_status());
    log::info!("download of {:?} finished: {}", filename, outcome.as_status());
    outcome
}

fn run_job(
    filename: &str,
    candidates: &[PeerAddr],
    dest_dir: &Path,
    sink: &dyn ProgressSink,
) -> DownloadOutcome {
    // a peer-supplied name must not be able to escape the download folder
    if !crate::catalog::is_safe_name(filename) {
        log::error!("refusing unsafe destination name {:?}", filename);
        return DownloadOutcome::Error;
    }

    let ledger = FailureLedger::new();

    // settle on a declared length and keep only the peers that agree
    let (length, validated) = match validate_peers(filename, candidates, sink) {
        Some(v) => v,
        None => return DownloadOutcome::FileNotFound,
    };

    // pre-size the destination so chunk writes can seek freely
    let path = dest_dir.join(filename);
    let file = match ChunkFile::create(&path, length) {
        Ok(file) => file,
        Err(e) => {
            log::error!("cannot prepare {:?}: {}", path, e);
            return DownloadOutcome::Error;
        }
    };

    if length == 0 {
        return DownloadOutcome::Completed;
    }

    let total = chunk_count(length);
    if total == 1 && length < CHUNK_SIZE {
        small_file_job(filename, length, &validated, &file, &ledger, sink)
    } else {
        parallel_job(filename, length, total, &validated, &file, &ledger, sink)
    }
}

/// Asks candidates for the file's length; the first definite answer becomes
/// the declared length and only peers reporting exactly that length survive.
fn validate_peers(
    filename: &str,
    candidates: &[PeerAddr],
    sink: &dyn ProgressSink,
) -> Option<(u64, Vec<PeerAddr>)> {
    let mut declared: Option<u64> = None;
    let mut validated = Vec::new();

    for peer in candidates {
        match query_length(peer, filename) {
            Ok(Some(len)) => {
                if declared.is_none() {
                    declared = Some(len);
                }
                if declared == Some(len) {
                    validated.push(peer.clone());
                } else {
                    log::warn!(
                        "{} reports {} bytes for {:?}, expected {}; excluded",
                        peer,
                        len,
                        filename,
                        declared.unwrap()
                    );
                }
            }
            Ok(None) => log::debug!("{} does not share {:?}", peer, filename),
            Err(e) => log::debug!("size query to {} failed: {}", peer, e),
        }
    }

    let length = declared?;
    sink.log(&format!(
        "{:?} is {} bytes; {} peer(s) agree",
        filename,
        length,
        validated.len()
    ));
    Some((length, validated))
}

fn query_length(peer: &PeerAddr, filename: &str) -> ShareResult<Option<u64>> {
    PeerClient::connect(peer, TRANSFER_TIMEOUT, TRANSFER_TIMEOUT)?.request_file_info(filename)
}

/// Single short chunk: no pool, just walk the validated peers in order.
fn small_file_job(
    filename: &str,
    length: u64,
    validated: &[PeerAddr],
    file: &ChunkFile,
    ledger: &FailureLedger,
    sink: &dyn ProgressSink,
) -> DownloadOutcome {
    for peer in validated {
        if ledger.is_blacklisted(peer) {
            continue;
        }
        match attempt_chunk(peer, filename, 0, length, file) {
            Ok(()) => {
                ledger.reset(peer);
                sink.update_progress(filename, "100%");
                return DownloadOutcome::Completed;
            }
            Err(AttemptError::Peer(e)) => {
                log::debug!("chunk 0 from {} failed: {}", peer, e);
                ledger.record_failure(peer);
            }
            Err(AttemptError::Local(e)) => {
                log::error!("cannot write {:?}: {}", filename, e);
                return DownloadOutcome::Error;
            }
        }
    }
    DownloadOutcome::Incomplete
}

/// General path: shuffled chunk ids feed a fixed pool of workers, each
/// chunk retried against a locally shuffled view of the peer set.
fn parallel_job(
    filename: &str,
    length: u64,
    total: u64,
    validated: &[PeerAddr],
    file: &ChunkFile,
    ledger: &FailureLedger,
    sink: &dyn ProgressSink,
) -> DownloadOutcome {
    let mut ids: Vec<u64> = (0..total).collect();
    ids.shuffle(&mut rand::thread_rng());

    let (id_tx, id_rx) = channel::unbounded::<u64>();
    for id in ids {
        id_tx.send(id).unwrap();
    }
    drop(id_tx);

    let completed = AtomicU64::new(0);
    let local_error = AtomicBool::new(false);
    let workers = DOWNLOAD_WORKERS.min(total as usize);

    crossbeam::thread::scope(|scope| {
        for _ in 0..workers {
            let id_rx = id_rx.clone();
            let completed = &completed;
            let local_error = &local_error;
            scope.spawn(move |_| {
                for id in id_rx.iter() {
                    if local_error.load(Ordering::SeqCst) {
                        break;
                    }
                    match pull_chunk(id, filename, length, validated, file, ledger) {
                        Ok(true) => {
                            let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                            let percent = done * 100 / total;
                            sink.update_progress(filename, &format!("{}%", percent));
                        }
                        Ok(false) => {
                            log::warn!("chunk {} of {:?} ran out of attempts", id, filename);
                        }
                        Err(e) => {
                            log::error!("cannot write chunk {} of {:?}: {}", id, filename, e);
                            local_error.store(true, Ordering::SeqCst);
                            break;
                        }
                    }
                }
            });
        }
    })
    .unwrap();

    if local_error.load(Ordering::SeqCst) {
        DownloadOutcome::Error
    } else if completed.load(Ordering::SeqCst) == total {
        DownloadOutcome::Completed
    } else {
        DownloadOutcome::Incomplete
    }
}

/// Tries one chunk against rotating peers. Ok(true) when it landed,
/// Ok(false) when the attempt budget ran dry, Err on local I/O failure.
fn pull_chunk(
    id: u64,
    filename: &str,
    length: u64,
    validated: &[PeerAddr],
    file: &ChunkFile,
    ledger: &FailureLedger,
) -> io::Result<bool> {
    // each chunk gets its own peer order, so no single peer is monopolised
    let mut peers: Vec<&PeerAddr> = validated.iter().collect();
    peers.shuffle(&mut rand::thread_rng());

    for attempt in 0..MAX_RETRY_ATTEMPTS {
        let peer = peers[attempt as usize % peers.len()];
        if ledger.is_blacklisted(peer) {
            log::trace!("skipping blacklisted {} for chunk {}", peer, id);
            continue;
        }
        match attempt_chunk(peer, filename, id, length, file) {
            Ok(()) => {
                ledger.reset(peer);
                return Ok(true);
            }
            Err(AttemptError::Peer(e)) => {
                log::debug!("chunk {} from {} failed: {}", id, peer, e);
                ledger.record_failure(peer);
            }
            Err(AttemptError::Local(e)) => return Err(e),
        }
    }
    Ok(false)
}

enum AttemptError {
    /// The peer's fault; counted in the ledger.
    Peer(ShareError),
    /// Our disk's fault; fatal for the job.
    Local(io::Error),
}

/// One wire exchange: fetch the chunk, write it at its offset, then ack.
fn attempt_chunk(
    peer: &PeerAddr,
    filename: &str,
    id: u64,
    length: u64,
    file: &ChunkFile,
) -> Result<(), AttemptError> {
    let mut client =
        PeerClient::connect(peer, TRANSFER_TIMEOUT, TRANSFER_TIMEOUT).map_err(AttemptError::Peer)?;
    let payload = client
        .request_chunk(filename, id)
        .map_err(AttemptError::Peer)?
        .ok_or_else(|| AttemptError::Peer(ShareError::NotOnPeer(filename.to_string())))?;

    let expected = (length - id * CHUNK_SIZE).min(CHUNK_SIZE) as usize;
    if payload.len() != expected {
        return Err(AttemptError::Peer(ShareError::MalformedFrame(format!(
            "chunk {} carried {} bytes, expected {}",
            id,
            payload.len(),
            expected
        ))));
    }

    file.write_chunk(id, &payload).map_err(AttemptError::Local)?;

    // the payload is on disk; a lost ack costs nothing
    if let Err(e) = client.send_ack(id) {
        log::debug!("ack for chunk {} to {} failed: {}", id, peer, e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FixedFolder;
    use crate::server::FileServer;
    use std::fs;
    use std::sync::Arc;

    #[derive(Debug, Default)]
    struct MemorySink {
        updates: Mutex<Vec<(String, String)>>,
    }

    impl MemorySink {
        fn statuses(&self, filename: &str) -> Vec<String> {
            self.updates
                .lock()
                .unwrap()
                .iter()
                .filter(|(f, _)| f == filename)
                .map(|(_, s)| s.clone())
                .collect()
        }
    }

    impl ProgressSink for MemorySink {
        fn log(&self, _message: &str) {}

        fn update_progress(&self, filename: &str, status: &str) {
            self.updates
                .lock()
                .unwrap()
                .push((filename.to_string(), status.to_string()));
        }
    }

    fn serve(dir: &std::path::Path) -> (Arc<FileServer>, PeerAddr) {
        let server = FileServer::new(Arc::new(FixedFolder::new(dir))).unwrap();
        server.start();
        let addr = PeerAddr::new("127.0.0.1", server.port());
        (server, addr)
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_small_file_download() {
        let share = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        fs::write(share.path().join("hello.txt"), b"hello!\n").unwrap();
        let (server, peer) = serve(share.path());
        let sink = MemorySink::default();

        let outcome = download("hello.txt", &[peer], dest.path(), &sink);

        assert_eq!(outcome, DownloadOutcome::Completed);
        assert_eq!(
            fs::read(dest.path().join("hello.txt")).unwrap(),
            b"hello!\n"
        );
        assert_eq!(sink.statuses("hello.txt"), vec!["100%", "Completed"]);

        server.shutdown();
    }

    #[test]
    fn test_zero_length_file() {
        let share = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        fs::write(share.path().join("empty.bin"), b"").unwrap();
        let (server, peer) = serve(share.path());
        let sink = MemorySink::default();

        let outcome = download("empty.bin", &[peer], dest.path(), &sink);

        assert_eq!(outcome, DownloadOutcome::Completed);
        assert_eq!(
            fs::metadata(dest.path().join("empty.bin")).unwrap().len(),
            0
        );
        // no chunk was requested, so the only status is the terminal one
        assert_eq!(sink.statuses("empty.bin"), vec!["Completed"]);

        server.shutdown();
    }

    #[test]
    fn test_multi_chunk_single_source() {
        let share = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let source = patterned(650_000);
        fs::write(share.path().join("big.bin"), &source).unwrap();
        let (server, peer) = serve(share.path());
        let sink = MemorySink::default();

        let outcome = download("big.bin", &[peer], dest.path(), &sink);

        assert_eq!(outcome, DownloadOutcome::Completed);
        assert_eq!(fs::read(dest.path().join("big.bin")).unwrap(), source);

        // workers may publish percents out of order, but 100% must appear
        // and the terminal status comes last
        let statuses = sink.statuses("big.bin");
        assert_eq!(statuses.last().unwrap(), "Completed");
        assert!(statuses.contains(&"100%".to_string()));

        server.shutdown();
    }

    #[test]
    fn test_multi_source_consistency() {
        let share_a = tempfile::tempdir().unwrap();
        let share_b = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let source = patterned(650_000);
        fs::write(share_a.path().join("big.bin"), &source).unwrap();
        fs::write(share_b.path().join("big.bin"), &source).unwrap();
        let (server_a, peer_a) = serve(share_a.path());
        let (server_b, peer_b) = serve(share_b.path());
        let sink = MemorySink::default();

        let outcome = download("big.bin", &[peer_a, peer_b], dest.path(), &sink);

        assert_eq!(outcome, DownloadOutcome::Completed);
        assert_eq!(fs::read(dest.path().join("big.bin")).unwrap(), source);

        server_a.shutdown();
        server_b.shutdown();
    }

    #[test]
    fn test_size_disagreement_excludes_peer() {
        let share_a = tempfile::tempdir().unwrap();
        let share_b = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        fs::write(share_a.path().join("f.bin"), vec![1u8; 1000]).unwrap();
        fs::write(share_b.path().join("f.bin"), vec![2u8; 2000]).unwrap();
        let (server_a, peer_a) = serve(share_a.path());
        let (server_b, peer_b) = serve(share_b.path());
        let sink = MemorySink::default();

        // the first replier fixes the declared length; the other is excluded
        let outcome = download("f.bin", &[peer_a, peer_b], dest.path(), &sink);

        assert_eq!(outcome, DownloadOutcome::Completed);
        assert_eq!(fs::read(dest.path().join("f.bin")).unwrap(), vec![1u8; 1000]);

        server_a.shutdown();
        server_b.shutdown();
    }

    #[test]
    fn test_dead_peer_is_routed_around() {
        let share = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let source = patterned(650_000);
        fs::write(share.path().join("big.bin"), &source).unwrap();
        let (server, live) = serve(share.path());

        let throwaway = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead = PeerAddr::new("127.0.0.1", throwaway.local_addr().unwrap().port());
        drop(throwaway);

        let sink = MemorySink::default();
        let outcome = download("big.bin", &[dead, live], dest.path(), &sink);

        assert_eq!(outcome, DownloadOutcome::Completed);
        assert_eq!(fs::read(dest.path().join("big.bin")).unwrap(), source);

        server.shutdown();
    }

    #[test]
    fn test_unparseable_peer_is_ignored() {
        let share = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        fs::write(share.path().join("hello.txt"), b"hello!\n").unwrap();
        let (server, live) = serve(share.path());

        let bogus = PeerAddr::new("not-an-ip", 1234);
        let sink = MemorySink::default();
        let outcome = download("hello.txt", &[bogus, live], dest.path(), &sink);

        assert_eq!(outcome, DownloadOutcome::Completed);

        server.shutdown();
    }

    #[test]
    fn test_file_nobody_has() {
        let share = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let (server, peer) = serve(share.path());
        let sink = MemorySink::default();

        let outcome = download("ghost.bin", &[peer], dest.path(), &sink);

        assert_eq!(outcome, DownloadOutcome::FileNotFound);
        assert_eq!(sink.statuses("ghost.bin"), vec!["File Not Found"]);
        assert!(!dest.path().join("ghost.bin").exists());

        server.shutdown();
    }

    #[test]
    fn test_no_candidates() {
        let dest = tempfile::tempdir().unwrap();
        let sink = MemorySink::default();
        assert_eq!(
            download("x.bin", &[], dest.path(), &sink),
            DownloadOutcome::FileNotFound
        );
    }

    #[test]
    fn test_ledger_blacklists_after_cap() {
        let ledger = FailureLedger::new();
        let peer = PeerAddr::new("10.0.0.1", 9999);

        for _ in 0..MAX_RETRY_ATTEMPTS - 1 {
            ledger.record_failure(&peer);
            assert!(!ledger.is_blacklisted(&peer));
        }
        ledger.record_failure(&peer);
        assert!(ledger.is_blacklisted(&peer));

        ledger.reset(&peer);
        assert!(!ledger.is_blacklisted(&peer));
    }
}
