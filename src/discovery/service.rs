/*
src/discovery/service.rs

Soft-state peer membership over a single UDP socket on the well-known
discovery port. Three loops run on their own threads: the receive loop
(classify datagrams, answer and forward requests), a heartbeat ticker, and a
cleanup ticker that evicts peers not heard from within the timeout. The
receive socket uses a short read timeout so all three notice shutdown
promptly.

Requests flood the segment with a decrementing TTL. Loop freedom relies on
the bounded processed-id set: a request whose id was already handled is
dropped without response or forward.
*/

use crate::discovery::message::{new_msg_id, DiscoveryMessage};
use crate::error::ShareResult;
use crate::peer::{PeerAddr, PeerTable, ProcessedSet};
use crate::{
    CLEANUP_INTERVAL, DISCOVERY_PORT, DISCOVERY_TTL, HEARTBEAT_INTERVAL, MAX_DATAGRAM,
    PEER_TIMEOUT, PROCESSED_IDS_CAP, UDP_RECV_TIMEOUT,
};

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Granularity at which the ticker threads check the shutdown flag.
const TICK: Duration = Duration::from_millis(250);

pub struct DiscoveryService {
    /// Swapped out if the socket dies and has to be re-bound, so it sits
    /// behind a short-lived lock; blocking receives happen on a clone taken
    /// out of the lock.
    socket: Mutex<Arc<UdpSocket>>,
    /// The address we advertise: our IPv4 and the TCP server's assigned port.
    local: PeerAddr,
    /// Port the discovery socket is bound to.
    bound_port: u16,
    /// Where discovery requests are broadcast.
    broadcast: SocketAddr,
    peers: PeerTable,
    processed: ProcessedSet,
    running: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl DiscoveryService {
    /// Binds the discovery socket on the well-known port. `server_port` is
    /// the TCP service port to advertise, obtained from the server after it
    /// picked its OS-assigned port.
    pub fn new(local_ip: Ipv4Addr, server_port: u16) -> io::Result<Arc<DiscoveryService>> {
        DiscoveryService::bind(
            local_ip,
            server_port,
            DISCOVERY_PORT,
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, DISCOVERY_PORT)),
        )
    }

    /// Binds on an explicit port with an explicit broadcast target. Port 0
    /// picks a free port; tests use this to run several services on one
    /// host.
    pub fn bind(
        local_ip: Ipv4Addr,
        server_port: u16,
        discovery_port: u16,
        broadcast: SocketAddr,
    ) -> io::Result<Arc<DiscoveryService>> {
        let socket = bind_discovery_socket(discovery_port)?;
        let bound_port = socket.local_addr()?.port();

        Ok(Arc::new(DiscoveryService {
            socket: Mutex::new(Arc::new(socket)),
            local: PeerAddr::new(local_ip.to_string(), server_port),
            bound_port,
            broadcast,
            peers: PeerTable::new(),
            processed: ProcessedSet::new(PROCESSED_IDS_CAP),
            running: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        }))
    }

    /// The address this node advertises to peers.
    pub fn local_addr(&self) -> &PeerAddr {
        &self.local
    }

    /// Port the discovery socket ended up bound to.
    pub fn port(&self) -> u16 {
        self.bound_port
    }

    /// Snapshot of the current peer set.
    pub fn peer_addresses(&self) -> Vec<PeerAddr> {
        self.peers.addresses()
    }

    /// Inserts a caller-supplied peer directly, bypassing discovery.
    pub fn register_peer(&self, addr: PeerAddr) {
        if addr == self.local {
            return;
        }
        log::info!("manually registered peer {}", addr);
        self.peers.touch(addr);
    }

    /// Spawns the receive loop and the two tickers.
    pub fn start(self: &Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        let mut threads = self.threads.lock().unwrap();

        let svc = Arc::clone(self);
        threads.push(thread::spawn(move || svc.receive_loop()));

        let svc = Arc::clone(self);
        threads.push(thread::spawn(move || {
            svc.ticker(HEARTBEAT_INTERVAL, DiscoveryService::heartbeat_tick)
        }));

        let svc = Arc::clone(self);
        threads.push(thread::spawn(move || {
            svc.ticker(CLEANUP_INTERVAL, DiscoveryService::cleanup_tick)
        }));

        log::info!(
            "discovery running on udp port {}, advertising {}",
            self.bound_port,
            self.local
        );
    }

    /// Clears the running flag and joins all loops. An empty datagram to our
    /// own port kicks the receive loop out of its blocking read early; the
    /// read timeout covers the case where that packet is lost.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let wakeup = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, self.bound_port));
        let _ = self.socket().send_to(&[], wakeup);
        let handles: Vec<JoinHandle<()>> = self.threads.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        log::info!("discovery stopped");
    }

    /// Broadcasts a fresh discovery request. The new msg-id goes straight
    /// into the processed set so our own echo is dropped.
    pub fn send_discovery_request(&self) -> ShareResult<()> {
        let msg_id = new_msg_id();
        self.processed.insert(&msg_id);
        let msg = DiscoveryMessage::Request {
            msg_id,
            ttl: DISCOVERY_TTL,
            origin: self.local.clone(),
        };
        self.socket()
            .send_to(msg.encode().as_bytes(), self.broadcast)?;
        log::debug!("sent discovery request to {}", self.broadcast);
        Ok(())
    }

    fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket.lock().unwrap())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn receive_loop(&self) {
        let mut buf = [0u8; MAX_DATAGRAM];
        while self.is_running() {
            let socket = self.socket();
            match socket.recv_from(&mut buf) {
                Ok((len, src)) => {
                    let raw = match std::str::from_utf8(&buf[..len]) {
                        Ok(raw) => raw,
                        Err(_) => {
                            log::debug!("non-UTF-8 datagram from {}", src);
                            continue;
                        }
                    };
                    if let Err(e) = self.handle_datagram(raw) {
                        log::debug!("bad datagram from {}: {}", src, e);
                    }
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    log::warn!("discovery receive failed: {}", e);
                    if !self.rebind() {
                        log::error!("could not re-bind discovery socket, stopping");
                        break;
                    }
                }
            }
        }
    }

    /// One attempt to replace a dead socket.
    fn rebind(&self) -> bool {
        match bind_discovery_socket(self.bound_port) {
            Ok(socket) => {
                *self.socket.lock().unwrap() = Arc::new(socket);
                log::info!("discovery socket re-bound on port {}", self.bound_port);
                true
            }
            Err(e) => {
                log::error!("discovery re-bind failed: {}", e);
                false
            }
        }
    }

    fn handle_datagram(&self, raw: &str) -> ShareResult<()> {
        let msg = DiscoveryMessage::parse(raw)?;

        // our own announcements come back via broadcast; never table them
        if *msg.advertised() == self.local {
            return Ok(());
        }

        match msg {
            DiscoveryMessage::Request {
                msg_id,
                ttl,
                origin,
            } => {
                if !self.processed.insert(&msg_id) {
                    log::trace!("duplicate request {}", msg_id);
                    return Ok(());
                }
                log::debug!("discovery request {} from {} (ttl {})", msg_id, origin, ttl);
                self.peers.touch(origin.clone());

                // answer the requester directly with our own address
                let reply = DiscoveryMessage::Response {
                    msg_id: msg_id.clone(),
                    ttl,
                    responder: self.local.clone(),
                };
                self.socket()
                    .send_to(reply.encode().as_bytes(), origin.socket_addr()?)?;

                // limited-scope flooding: pass the request on with one less
                // hop, keeping the original origin
                if ttl > 1 {
                    let forward = DiscoveryMessage::Request {
                        msg_id,
                        ttl: ttl - 1,
                        origin,
                    };
                    self.socket()
                        .send_to(forward.encode().as_bytes(), self.broadcast)?;
                }
            }
            DiscoveryMessage::Response { responder, .. } => {
                log::debug!("discovery response from {}", responder);
                self.peers.touch(responder);
            }
            DiscoveryMessage::Heartbeat { sender } => {
                log::trace!("heartbeat from {}", sender);
                self.peers.touch(sender);
            }
        }
        Ok(())
    }

    /// Runs `tick` every `interval` until shutdown, checking the flag at a
    /// much finer grain than the interval. A failing tick is logged and the
    /// schedule keeps going.
    fn ticker(&self, interval: Duration, tick: fn(&DiscoveryService)) {
        let mut last = Instant::now();
        while self.is_running() {
            thread::sleep(TICK);
            if last.elapsed() >= interval {
                tick(self);
                last = Instant::now();
            }
        }
    }

    fn heartbeat_tick(&self) {
        let msg = DiscoveryMessage::Heartbeat {
            sender: self.local.clone(),
        };
        let encoded = msg.encode();
        for peer in self.peers.addresses() {
            let addr = match peer.socket_addr() {
                Ok(addr) => addr,
                Err(_) => {
                    self.peers.remove(&peer);
                    continue;
                }
            };
            if let Err(e) = self.socket().send_to(encoded.as_bytes(), addr) {
                log::warn!("heartbeat to {} failed: {}", peer, e);
            }
        }
    }

    fn cleanup_tick(&self) {
        let removed = self.peers.remove_expired(PEER_TIMEOUT);
        if removed > 0 {
            log::info!("evicted {} stale peer(s)", removed);
        }
    }
}

/// Builds the discovery socket: SO_REUSEADDR and broadcast are set before
/// binding, and the read timeout keeps the receive loop responsive to
/// shutdown.
fn bind_discovery_socket(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).into())?;

    let socket: UdpSocket = socket.into();
    socket.set_read_timeout(Some(UDP_RECV_TIMEOUT))?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCALHOST: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

    /// Service bound to a free port, broadcasting at `broadcast`.
    fn test_service(broadcast: SocketAddr) -> Arc<DiscoveryService> {
        DiscoveryService::bind(LOCALHOST, 40000, 0, broadcast).unwrap()
    }

    /// Plain socket standing in for a remote peer.
    fn test_socket() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        socket
    }

    fn recv_msg(socket: &UdpSocket) -> DiscoveryMessage {
        let mut buf = [0u8; MAX_DATAGRAM];
        let (len, _) = socket.recv_from(&mut buf).unwrap();
        DiscoveryMessage::parse(std::str::from_utf8(&buf[..len]).unwrap()).unwrap()
    }

    fn service_addr(svc: &DiscoveryService) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(LOCALHOST, svc.port()))
    }

    #[test]
    fn test_request_gets_response_and_tables_origin() {
        let sink = test_socket();
        let svc = test_service(sink.local_addr().unwrap());
        svc.start();

        let origin = PeerAddr::new("127.0.0.1", sink.local_addr().unwrap().port());
        let req = DiscoveryMessage::Request {
            msg_id: "req-1".into(),
            ttl: 1,
            origin: origin.clone(),
        };
        sink.send_to(req.encode().as_bytes(), service_addr(&svc))
            .unwrap();

        match recv_msg(&sink) {
            DiscoveryMessage::Response {
                msg_id, responder, ..
            } => {
                assert_eq!(msg_id, "req-1");
                assert_eq!(responder, *svc.local_addr());
            }
            other => panic!("expected response, got {:?}", other),
        }
        assert_eq!(svc.peer_addresses(), vec![origin]);

        svc.shutdown();
    }

    #[test]
    fn test_replayed_request_is_dropped() {
        let sink = test_socket();
        let svc = test_service(sink.local_addr().unwrap());
        svc.start();

        let req = DiscoveryMessage::Request {
            msg_id: "req-dup".into(),
            ttl: 1,
            origin: PeerAddr::new("127.0.0.1", sink.local_addr().unwrap().port()),
        };
        for _ in 0..2 {
            sink.send_to(req.encode().as_bytes(), service_addr(&svc))
                .unwrap();
        }

        // exactly one response; the replay produces nothing
        recv_msg(&sink);
        let mut buf = [0u8; MAX_DATAGRAM];
        assert!(sink.recv_from(&mut buf).is_err());
        assert_eq!(svc.peer_addresses().len(), 1);

        svc.shutdown();
    }

    #[test]
    fn test_forward_decrements_ttl_and_keeps_origin() {
        // a second socket plays the broadcast domain
        let segment = test_socket();
        let origin_sock = test_socket();
        let svc = test_service(segment.local_addr().unwrap());
        svc.start();

        let origin = PeerAddr::new("127.0.0.1", origin_sock.local_addr().unwrap().port());
        let req = DiscoveryMessage::Request {
            msg_id: "req-fwd".into(),
            ttl: 3,
            origin: origin.clone(),
        };
        origin_sock
            .send_to(req.encode().as_bytes(), service_addr(&svc))
            .unwrap();

        match recv_msg(&segment) {
            DiscoveryMessage::Request {
                msg_id,
                ttl,
                origin: fwd_origin,
            } => {
                assert_eq!(msg_id, "req-fwd");
                assert_eq!(ttl, 2);
                assert_eq!(fwd_origin, origin);
            }
            other => panic!("expected forwarded request, got {:?}", other),
        }

        svc.shutdown();
    }

    #[test]
    fn test_ttl_one_is_not_forwarded() {
        let segment = test_socket();
        let origin_sock = test_socket();
        let svc = test_service(segment.local_addr().unwrap());
        svc.start();

        let req = DiscoveryMessage::Request {
            msg_id: "req-last-hop".into(),
            ttl: 1,
            origin: PeerAddr::new("127.0.0.1", origin_sock.local_addr().unwrap().port()),
        };
        origin_sock
            .send_to(req.encode().as_bytes(), service_addr(&svc))
            .unwrap();

        // the origin still gets its response
        recv_msg(&origin_sock);
        // but nothing reaches the segment
        let mut buf = [0u8; MAX_DATAGRAM];
        assert!(segment.recv_from(&mut buf).is_err());

        svc.shutdown();
    }

    #[test]
    fn test_heartbeat_refreshes_table() {
        let sink = test_socket();
        let svc = test_service(sink.local_addr().unwrap());
        svc.start();

        let hb = DiscoveryMessage::Heartbeat {
            sender: PeerAddr::new("127.0.0.1", 45678),
        };
        sink.send_to(hb.encode().as_bytes(), service_addr(&svc))
            .unwrap();

        // wait for the receive loop to pick it up
        let deadline = Instant::now() + Duration::from_secs(2);
        while svc.peer_addresses().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(
            svc.peer_addresses(),
            vec![PeerAddr::new("127.0.0.1", 45678)]
        );

        svc.shutdown();
    }

    #[test]
    fn test_own_address_is_never_tabled() {
        let sink = test_socket();
        let svc = test_service(sink.local_addr().unwrap());
        svc.start();

        let hb = DiscoveryMessage::Heartbeat {
            sender: svc.local_addr().clone(),
        };
        sink.send_to(hb.encode().as_bytes(), service_addr(&svc))
            .unwrap();
        thread::sleep(Duration::from_millis(200));
        assert!(svc.peer_addresses().is_empty());

        svc.register_peer(svc.local_addr().clone());
        assert!(svc.peer_addresses().is_empty());

        svc.shutdown();
    }

    #[test]
    fn test_own_request_echo_is_suppressed() {
        let segment = test_socket();
        let svc = test_service(segment.local_addr().unwrap());
        svc.start();

        svc.send_discovery_request().unwrap();

        // the segment sees the broadcast request
        let echoed = match recv_msg(&segment) {
            msg @ DiscoveryMessage::Request { .. } => {
                assert_eq!(*msg.advertised(), *svc.local_addr());
                msg
            }
            other => panic!("expected request, got {:?}", other),
        };

        // feeding the echo back must neither respond nor re-forward
        segment
            .send_to(echoed.encode().as_bytes(), service_addr(&svc))
            .unwrap();
        let mut buf = [0u8; MAX_DATAGRAM];
        assert!(segment.recv_from(&mut buf).is_err());

        svc.shutdown();
    }

    #[test]
    fn test_manual_registration() {
        let sink = test_socket();
        let svc = test_service(sink.local_addr().unwrap());
        let peer = PeerAddr::new("10.9.8.7", 1234);
        svc.register_peer(peer.clone());
        assert_eq!(svc.peer_addresses(), vec![peer]);
    }
}
