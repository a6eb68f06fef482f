//! Network transport (§4.6): UDP multicast presence announce plus a TCP
//! side channel, wrapped so the rest of the kernel only ever sees the
//! four-callback contract (`packet`, `join`, `leave`) and an `emit` call.
//!
//! Uses `socket2` to configure `SO_LINGER` explicitly on outgoing TCP
//! connections (§9 open question), the same way `radicle-node` reaches
//! for `socket2::SockRef` to tune an already-connected `std::net` socket;
//! see DESIGN.md.

mod transport;
mod wire;

pub use transport::{NetworkConfig, PeerInfo, TransportCallbacks};
pub(crate) use transport::NetworkTransport;
