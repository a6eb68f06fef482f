//! Network transport (§4.6): UDP multicast announce + unreliable/reliable
//! packetized delivery + a TCP side channel, treated everywhere else in
//! the kernel purely through its four callbacks.
//!
//! Specified as a pluggable external collaborator (§1); this is the one
//! concrete, real implementation of that contract, built on `std::net`
//! plus `socket2` for the TCP linger tweak the design notes call for
//! (§9 open question: "explicit `linger` + `send` path").

use std::collections::HashMap;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::chrono::ChronoService;
use crate::error::{Error, Result};
use crate::net::wire::{AnnouncePacket, FragmentHeader, TcpFrame};

const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1);
const UDP_POLL_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Clone, Debug)]
pub struct NetworkConfig {
    pub name: String,
    pub multicast_group: Ipv4Addr,
    pub multicast_port: u16,
    pub mtu: usize,
}

#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub name: String,
    pub address: IpAddr,
    pub tcp_port: u16,
    pub udp_port: u16,
}

struct PeerState {
    info: Mutex<PeerInfo>,
    tcp: Mutex<Option<TcpStream>>,
    last_seen: Mutex<Instant>,
}

/// A peer not heard from in this long is considered gone (§4.6 leaves
/// peer-loss detection unspecified beyond "announce periodically").
const STALE_PEER_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Default)]
struct Reassembly {
    fragment_count: u16,
    type_hash: u64,
    received: HashMap<u16, Vec<u8>>,
}

pub trait TransportCallbacks: Send + Sync + 'static {
    fn on_packet(&self, peer: PeerInfo, type_hash: u64, payload: Vec<u8>);
    fn on_join(&self, peer: PeerInfo);
    fn on_leave(&self, peer: PeerInfo);
}

pub(crate) struct NetworkTransport {
    config: NetworkConfig,
    udp_socket: UdpSocket,
    tcp_listener: TcpListener,
    local_tcp_port: u16,
    local_udp_port: u16,
    peers: DashMap<String, Arc<PeerState>>,
    callbacks: Arc<dyn TransportCallbacks>,
    message_id: AtomicU32,
    reassembly: DashMap<(SocketAddr, u32), Reassembly>,
    shutdown: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl NetworkTransport {
    pub(crate) fn new(
        config: NetworkConfig,
        callbacks: Arc<dyn TransportCallbacks>,
        chrono: Arc<ChronoService>,
    ) -> Result<Arc<Self>> {
        if !config.multicast_group.is_multicast() {
            return Err(Error::config(format!(
                "{} is not a valid multicast address",
                config.multicast_group
            )));
        }

        // Built through `socket2` rather than `UdpSocket::bind` directly so
        // `SO_REUSEADDR`/`SO_REUSEPORT` can be set before the bind: several
        // NUClear processes on the same host routinely join the same
        // multicast group/port (§4.6), which the OS otherwise refuses.
        let raw_socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )
        .map_err(|e| Error::bind("failed to create UDP socket", e))?;
        raw_socket
            .set_reuse_address(true)
            .map_err(|e| Error::bind("failed to set SO_REUSEADDR", e))?;
        #[cfg(unix)]
        raw_socket
            .set_reuse_port(true)
            .map_err(|e| Error::bind("failed to set SO_REUSEPORT", e))?;
        let bind_addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, config.multicast_port).into();
        raw_socket
            .bind(&bind_addr.into())
            .map_err(|e| Error::bind("failed to bind UDP multicast socket", e))?;
        let udp_socket: UdpSocket = raw_socket.into();
        udp_socket
            .join_multicast_v4(&config.multicast_group, &Ipv4Addr::UNSPECIFIED)
            .map_err(|e| Error::bind("failed to join multicast group", e))?;
        udp_socket
            .set_read_timeout(Some(UDP_POLL_TIMEOUT))
            .map_err(|e| Error::bind("failed to set UDP read timeout", e))?;
        let local_udp_port = udp_socket
            .local_addr()
            .map_err(|e| Error::bind("failed to read local UDP address", e))?
            .port();

        let tcp_listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))
            .map_err(|e| Error::bind("failed to bind TCP side channel", e))?;
        tcp_listener
            .set_nonblocking(true)
            .map_err(|e| Error::bind("failed to set TCP listener nonblocking", e))?;
        let local_tcp_port = tcp_listener
            .local_addr()
            .map_err(|e| Error::bind("failed to read local TCP address", e))?
            .port();

        let transport = Arc::new(NetworkTransport {
            config,
            udp_socket,
            tcp_listener,
            local_tcp_port,
            local_udp_port,
            peers: DashMap::new(),
            callbacks,
            message_id: AtomicU32::new(0),
            reassembly: DashMap::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
        });

        let mut threads = Vec::new();

        let udp_weak = Arc::downgrade(&transport);
        threads.push(
            std::thread::Builder::new()
                .name("net-udp-recv".into())
                .spawn(move || udp_recv_loop(udp_weak))
                .expect("failed to spawn UDP receive thread"),
        );

        let tcp_weak = Arc::downgrade(&transport);
        threads.push(
            std::thread::Builder::new()
                .name("net-tcp-accept".into())
                .spawn(move || tcp_accept_loop(tcp_weak))
                .expect("failed to spawn TCP accept thread"),
        );

        *transport.threads.lock().unwrap() = threads;

        let announce_weak = Arc::downgrade(&transport);
        chrono.insert(
            Instant::now(),
            Some(ANNOUNCE_INTERVAL),
            0,
            Box::new(move |next_fire| {
                let Some(transport) = announce_weak.upgrade() else {
                    return false;
                };
                if transport.shutdown.load(Ordering::Acquire) {
                    return false;
                }
                transport.send_announce();
                transport.sweep_stale_peers();
                *next_fire += ANNOUNCE_INTERVAL;
                true
            }),
        );

        Ok(transport)
    }

    pub(crate) fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub(crate) fn join(&self) {
        let handles = std::mem::take(&mut *self.threads.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
    }

    fn send_announce(&self) {
        let packet = AnnouncePacket {
            name: self.config.name.clone(),
            tcp_port: self.local_tcp_port,
            udp_port: self.local_udp_port,
        };
        let addr = SocketAddr::new(IpAddr::V4(self.config.multicast_group), self.config.multicast_port);
        if let Err(e) = self.udp_socket.send_to(&packet.encode(), addr) {
            log::warn!("failed to send multicast announce: {e}");
        }
    }

    /// `emit_network` (§4.6): dispatch through UDP (unreliable, fragmented
    /// to MTU) or TCP (reliable).
    pub(crate) fn emit(
        &self,
        type_hash: u64,
        bytes: &[u8],
        target: Option<&str>,
        reliable: bool,
    ) -> Result<()> {
        let targets: Vec<Arc<PeerState>> = match target {
            Some(name) => self.peers.get(name).map(|p| Arc::clone(&p)).into_iter().collect(),
            None => self.peers.iter().map(|e| Arc::clone(e.value())).collect(),
        };

        if reliable {
            for peer in &targets {
                self.send_reliable(peer, type_hash, bytes)?;
            }
        } else {
            self.send_unreliable(type_hash, bytes, target)?;
        }
        Ok(())
    }

    fn send_unreliable(&self, type_hash: u64, bytes: &[u8], target: Option<&str>) -> Result<()> {
        let addr = match target {
            Some(name) => {
                let peer = self
                    .peers
                    .get(name)
                    .ok_or_else(|| Error::transport(format!("unknown peer {name}")))?;
                let info = peer.info.lock().unwrap();
                SocketAddr::new(info.address, info.udp_port)
            }
            None => SocketAddr::new(IpAddr::V4(self.config.multicast_group), self.config.multicast_port),
        };

        let overhead = FragmentHeader::overhead();
        let chunk_size = self.config.mtu.saturating_sub(overhead).max(1);
        let chunks: Vec<&[u8]> = bytes.chunks(chunk_size).collect();
        let fragment_count = chunks.len().max(1) as u16;
        let message_id = self.message_id.fetch_add(1, Ordering::Relaxed);

        if chunks.is_empty() {
            let header = FragmentHeader {
                message_id,
                fragment_index: 0,
                fragment_count: 1,
                type_hash,
            };
            self.udp_socket
                .send_to(&header.encode_with_payload(&[]), addr)
                .map_err(|e| Error::transport(format!("UDP send failed: {e}")))?;
            return Ok(());
        }

        for (index, chunk) in chunks.into_iter().enumerate() {
            let header = FragmentHeader {
                message_id,
                fragment_index: index as u16,
                fragment_count,
                type_hash,
            };
            self.udp_socket
                .send_to(&header.encode_with_payload(chunk), addr)
                .map_err(|e| Error::transport(format!("UDP send failed: {e}")))?;
        }
        Ok(())
    }

    fn send_reliable(&self, peer: &PeerState, type_hash: u64, bytes: &[u8]) -> Result<()> {
        let mut guard = peer.tcp.lock().unwrap();
        if guard.is_none() {
            let addr = {
                let info = peer.info.lock().unwrap();
                SocketAddr::new(info.address, info.tcp_port)
            };
            let stream = TcpStream::connect(addr)
                .map_err(|e| Error::transport(format!("TCP connect to {addr} failed: {e}")))?;
            configure_linger(&stream);
            *guard = Some(stream);
        }
        let stream = guard.as_mut().unwrap();
        let frame = TcpFrame::encode(type_hash, bytes);
        stream
            .write_all(&frame)
            .map_err(|e| Error::transport(format!("TCP send failed: {e}")))?;
        Ok(())
    }

    fn observe_announce(&self, addr: SocketAddr, announce: AnnouncePacket) {
        if announce.name == self.config.name {
            return;
        }
        let info = PeerInfo {
            name: announce.name.clone(),
            address: addr.ip(),
            tcp_port: announce.tcp_port,
            udp_port: announce.udp_port,
        };

        if let Some(existing) = self.peers.get(&announce.name) {
            *existing.info.lock().unwrap() = info;
            *existing.last_seen.lock().unwrap() = Instant::now();
            return;
        }

        self.peers.insert(
            announce.name.clone(),
            Arc::new(PeerState {
                info: Mutex::new(info.clone()),
                tcp: Mutex::new(None),
                last_seen: Mutex::new(Instant::now()),
            }),
        );
        self.callbacks.on_join(info);
    }

    fn mark_peer_left(&self, name: &str) {
        if let Some((_, peer)) = self.peers.remove(name) {
            self.callbacks.on_leave(peer.info.lock().unwrap().clone());
        }
    }

    /// Called alongside each outgoing announce: a peer not heard from
    /// within `STALE_PEER_TIMEOUT` is dropped and reported as left.
    fn sweep_stale_peers(&self) {
        let stale: Vec<String> = self
            .peers
            .iter()
            .filter(|e| e.last_seen.lock().unwrap().elapsed() > STALE_PEER_TIMEOUT)
            .map(|e| e.key().clone())
            .collect();
        for name in stale {
            self.mark_peer_left(&name);
        }
    }
}

fn configure_linger(stream: &TcpStream) {
    // §9 open question: an explicit linger configured up front plus an
    // explicit close on drop, rather than relying on the OS default.
    let sock_ref = socket2::SockRef::from(stream);
    if let Err(e) = sock_ref.set_linger(Some(Duration::from_secs(2))) {
        log::warn!("failed to set SO_LINGER on outgoing TCP connection: {e}");
    }
}

fn udp_recv_loop(transport: std::sync::Weak<NetworkTransport>) {
    let mut buf = vec![0u8; 65536];
    loop {
        let Some(transport) = transport.upgrade() else {
            return;
        };
        if transport.shutdown.load(Ordering::Acquire) {
            return;
        }

        match transport.udp_socket.recv_from(&mut buf) {
            Ok((n, addr)) => handle_udp_packet(&transport, addr, &buf[..n]),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => log::warn!("UDP recv failed: {e}"),
        }
    }
}

fn handle_udp_packet(transport: &Arc<NetworkTransport>, addr: SocketAddr, bytes: &[u8]) {
    if let Some(announce) = AnnouncePacket::decode(bytes) {
        transport.observe_announce(addr, announce);
        return;
    }
    let Some((header, payload)) = FragmentHeader::decode(bytes) else {
        log::debug!("dropping malformed UDP packet from {addr}");
        return;
    };

    if header.fragment_count <= 1 {
        deliver_from_addr(transport, addr, header.type_hash, payload.to_vec());
        return;
    }

    let key = (addr, header.message_id);
    let mut entry = transport.reassembly.entry(key).or_insert_with(|| Reassembly {
        fragment_count: header.fragment_count,
        type_hash: header.type_hash,
        received: HashMap::new(),
    });
    entry.received.insert(header.fragment_index, payload.to_vec());
    if entry.received.len() == entry.fragment_count as usize {
        let mut complete = Vec::new();
        for i in 0..entry.fragment_count {
            match entry.received.get(&i) {
                Some(chunk) => complete.extend_from_slice(chunk),
                None => return,
            }
        }
        let type_hash = entry.type_hash;
        drop(entry);
        transport.reassembly.remove(&key);
        deliver_from_addr(transport, addr, type_hash, complete);
    }
}

fn deliver_from_addr(transport: &Arc<NetworkTransport>, addr: SocketAddr, type_hash: u64, payload: Vec<u8>) {
    let peer = transport
        .peers
        .iter()
        .find(|e| e.info.lock().unwrap().address == addr.ip())
        .map(|e| e.info.lock().unwrap().clone())
        .unwrap_or(PeerInfo {
            name: addr.to_string(),
            address: addr.ip(),
            tcp_port: 0,
            udp_port: addr.port(),
        });
    transport.callbacks.on_packet(peer, type_hash, payload);
}

fn tcp_accept_loop(transport: std::sync::Weak<NetworkTransport>) {
    loop {
        let Some(transport) = transport.upgrade() else {
            return;
        };
        if transport.shutdown.load(Ordering::Acquire) {
            return;
        }

        match transport.tcp_listener.accept() {
            Ok((stream, addr)) => {
                let weak = std::sync::Weak::clone(&Arc::downgrade(&transport));
                std::thread::Builder::new()
                    .name("net-tcp-conn".into())
                    .spawn(move || tcp_connection_loop(weak, stream, addr))
                    .expect("failed to spawn TCP connection thread");
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                log::warn!("TCP accept failed: {e}");
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

fn tcp_connection_loop(
    transport: std::sync::Weak<NetworkTransport>,
    mut stream: TcpStream,
    addr: SocketAddr,
) {
    loop {
        let Some(transport) = transport.upgrade() else {
            return;
        };
        match TcpFrame::read_one(&mut stream) {
            Ok(Some((type_hash, payload))) => {
                deliver_from_addr(&transport, addr, type_hash, payload);
            }
            Ok(None) => return,
            Err(e) => {
                log::debug!("TCP connection from {addr} ended: {e}");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    //! Scenario 5: two independent transports joining the same
    //! multicast group should discover each other and exchange an
    //! unreliable UDP packet. `NetworkTransport` is crate-private and the
    //! kernel enforces a single `PowerPlant` per process, so this exercises
    //! the transport directly rather than through two `PowerPlant`s.

    use super::*;
    use std::sync::mpsc;

    struct ChannelCallbacks {
        packets: Mutex<mpsc::Sender<(PeerInfo, u64, Vec<u8>)>>,
        joins: Mutex<mpsc::Sender<PeerInfo>>,
    }

    impl TransportCallbacks for ChannelCallbacks {
        fn on_packet(&self, peer: PeerInfo, type_hash: u64, payload: Vec<u8>) {
            let _ = self.packets.lock().unwrap().send((peer, type_hash, payload));
        }
        fn on_join(&self, peer: PeerInfo) {
            let _ = self.joins.lock().unwrap().send(peer);
        }
        fn on_leave(&self, _peer: PeerInfo) {}
    }

    struct Node {
        transport: Arc<NetworkTransport>,
        chrono: Arc<ChronoService>,
        packets: mpsc::Receiver<(PeerInfo, u64, Vec<u8>)>,
        joins: mpsc::Receiver<PeerInfo>,
    }

    impl Node {
        fn join(name: &str, group: Ipv4Addr, port: u16) -> Node {
            let (tx_p, packets) = mpsc::channel();
            let (tx_j, joins) = mpsc::channel();
            let callbacks = Arc::new(ChannelCallbacks {
                packets: Mutex::new(tx_p),
                joins: Mutex::new(tx_j),
            });
            let chrono = ChronoService::new();
            let transport = NetworkTransport::new(
                NetworkConfig {
                    name: name.to_string(),
                    multicast_group: group,
                    multicast_port: port,
                    mtu: 1200,
                },
                callbacks,
                Arc::clone(&chrono),
            )
            .expect("transport should bind and join the multicast group");
            Node {
                transport,
                chrono,
                packets,
                joins,
            }
        }

        fn shutdown(self) {
            self.transport.shutdown();
            self.chrono.shutdown();
            self.transport.join();
            self.chrono.join();
        }
    }

    #[test]
    fn two_peers_discover_each_other_and_exchange_a_udp_packet() {
        let group = Ipv4Addr::new(230, 12, 3, 21);
        let port = 40002;

        let a = Node::join("node-a", group, port);
        let b = Node::join("node-b", group, port);

        let seen_b_by_a = a
            .joins
            .recv_timeout(Duration::from_secs(5))
            .expect("node-a should observe node-b's announce");
        assert_eq!(seen_b_by_a.name, "node-b");

        let seen_a_by_b = b
            .joins
            .recv_timeout(Duration::from_secs(5))
            .expect("node-b should observe node-a's announce");
        assert_eq!(seen_a_by_b.name, "node-a");

        a.transport
            .emit(0xDEAD_BEEF, b"hello from a", None, false)
            .expect("unreliable emit should succeed once a peer is known");

        let (peer, type_hash, payload) = b
            .packets
            .recv_timeout(Duration::from_secs(5))
            .expect("node-b should receive node-a's packet");
        assert_eq!(peer.name, "node-a");
        assert_eq!(type_hash, 0xDEAD_BEEF);
        assert_eq!(payload, b"hello from a");

        a.shutdown();
        b.shutdown();
    }
}
