/*
src/transfer/search.rs

Fans a file-list query out over the peer set on a small worker pool and
aggregates the answers into "who offers what". Peers that cannot be reached
within the (deliberately short) search timeouts are skipped; the caller sees
only peers that actually answered.
*/

use crate::error::ShareResult;
use crate::peer::PeerAddr;
use crate::transfer::client::PeerClient;
use crate::{SEARCH_CONNECT_TIMEOUT, SEARCH_READ_TIMEOUT, SEARCH_WORKERS};

use crossbeam::channel;
use std::collections::HashMap;

/// Queries every peer's catalog and returns filename -> peers offering it.
/// The result is the candidate list a download starts from.
pub fn search(peers: &[PeerAddr]) -> HashMap<String, Vec<PeerAddr>> {
    if peers.is_empty() {
        return HashMap::new();
    }

    let (job_tx, job_rx) = channel::unbounded::<PeerAddr>();
    for peer in peers {
        job_tx.send(peer.clone()).unwrap();
    }
    drop(job_tx);

    let (result_tx, result_rx) = channel::unbounded::<(PeerAddr, Vec<String>)>();
    let workers = SEARCH_WORKERS.min(peers.len());

    crossbeam::thread::scope(|scope| {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move |_| {
                for peer in job_rx.iter() {
                    match query_catalog(&peer) {
                        Ok(names) => {
                            log::debug!("{} offers {} file(s)", peer, names.len());
                            let _ = result_tx.send((peer, names));
                        }
                        Err(e) => log::debug!("search skipping {}: {}", peer, e),
                    }
                }
            });
        }
    })
    .unwrap();
    drop(result_tx);

    let mut offers: HashMap<String, Vec<PeerAddr>> = HashMap::new();
    for (peer, names) in result_rx.iter() {
        for name in names {
            offers.entry(name).or_default().push(peer.clone());
        }
    }
    offers
}

fn query_catalog(peer: &PeerAddr) -> ShareResult<Vec<String>> {
    PeerClient::connect(peer, SEARCH_CONNECT_TIMEOUT, SEARCH_READ_TIMEOUT)?.request_file_list()
}
