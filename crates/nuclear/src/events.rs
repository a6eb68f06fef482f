//! Built-in events observable by user reactors (§6).

use crate::task::TaskStatistics;

/// Emitted once after installation, before the worker pool runs.
#[derive(Clone, Debug, Default)]
pub struct Startup;

/// Emitted once at shutdown request.
#[derive(Clone, Debug, Default)]
pub struct Shutdown;

/// Emitted Initialize-scoped with the process argv.
#[derive(Clone, Debug, Default)]
pub struct CommandLineArguments(pub Vec<String>);

/// Input event: ask the network transport to join a multicast group.
#[derive(Clone, Debug)]
pub struct NetworkConfiguration {
    pub name: String,
    pub multicast_group: std::net::Ipv4Addr,
    pub multicast_port: u16,
    pub mtu: usize,
}

/// Output event: a peer announced itself and was accepted.
#[derive(Clone, Debug)]
pub struct NetworkJoin {
    pub name: String,
    pub address: std::net::IpAddr,
    pub tcp_port: u16,
    pub udp_port: u16,
}

/// Output event: a previously joined peer is considered gone.
#[derive(Clone, Debug)]
pub struct NetworkLeave {
    pub name: String,
    pub address: std::net::IpAddr,
}

/// Output event: a data packet arrived from a joined peer. Carries the raw
/// payload and its wire type hash; decoding into an application type is
/// left to the receiving reaction (§4.6 does not specify a serialization
/// framework).
#[derive(Clone, Debug)]
pub struct NetworkPacket {
    pub peer_name: String,
    pub peer_address: std::net::IpAddr,
    pub type_hash: u64,
    pub payload: Vec<u8>,
}

/// Emitted after every task except those handling `ReactionStatistics`
/// itself (prevents infinite recursion, §4.2 P6).
#[derive(Clone, Debug)]
pub struct ReactionStatistics(pub TaskStatistics);

/// Emitted by the kernel's logging helper (§A.2 of SPEC_FULL.md).
#[derive(Clone, Debug)]
pub struct LogMessage {
    pub level: log::Level,
    pub message: String,
}
