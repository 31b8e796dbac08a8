/*
src/node.rs

Wires the long-lived components together. The TCP server binds first so the
discovery service can learn the OS-assigned port through the server's
getter; there is no global state and no cyclic wiring between them.
*/

use crate::catalog::SharedFolder;
use crate::discovery::service::DiscoveryService;
use crate::peer::PeerAddr;
use crate::progress::ProgressSink;
use crate::server::FileServer;
use crate::transfer::download::{self, DownloadOutcome};
use crate::transfer::search;

use anyhow::Context;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

pub struct Node {
    server: Arc<FileServer>,
    discovery: Arc<DiscoveryService>,
    download_dir: PathBuf,
    sink: Arc<dyn ProgressSink>,
}

impl Node {
    /// Binds and starts the server and the discovery service.
    pub fn start(
        folder: Arc<dyn SharedFolder>,
        download_dir: PathBuf,
        sink: Arc<dyn ProgressSink>,
    ) -> anyhow::Result<Node> {
        let server = FileServer::new(folder).context("binding file server")?;
        server.start();

        let local_ip = crate::utils::local_ipv4().unwrap_or(Ipv4Addr::LOCALHOST);
        let discovery = DiscoveryService::new(local_ip, server.port())
            .context("binding discovery socket")?;
        discovery.start();

        Ok(Node {
            server,
            discovery,
            download_dir,
            sink,
        })
    }

    /// The address this node announces to the network.
    pub fn local_addr(&self) -> &PeerAddr {
        self.discovery.local_addr()
    }

    pub fn server_port(&self) -> u16 {
        self.server.port()
    }

    /// Broadcasts a discovery request to grow the peer set.
    pub fn discover(&self) -> crate::error::ShareResult<()> {
        self.discovery.send_discovery_request()
    }

    pub fn register_peer(&self, addr: PeerAddr) {
        self.discovery.register_peer(addr);
    }

    pub fn peers(&self) -> Vec<PeerAddr> {
        self.discovery.peer_addresses()
    }

    /// Queries every known peer's catalog.
    pub fn search(&self) -> HashMap<String, Vec<PeerAddr>> {
        search::search(&self.peers())
    }

    /// Downloads `filename` from `candidates` into the download directory.
    pub fn download(&self, filename: &str, candidates: &[PeerAddr]) -> DownloadOutcome {
        download::download(filename, candidates, &self.download_dir, self.sink.as_ref())
    }

    pub fn shutdown(&self) {
        self.discovery.shutdown();
        self.server.shutdown();
    }
}
