//! The I/O poll loop (§4.5): one dedicated thread multiplexing registered
//! file descriptors via `poll(2)`, woken early by a self-pipe whenever the
//! registered set changes.
//!
//! Uses `bitflags` for the `READ|WRITE|CLOSE|ERROR` interest/event bitset
//! (§3 I/O Entry), the same way the k23 kernel workspace builds its own
//! interest/event sets; see DESIGN.md.

mod poller;

pub use poller::{Event, Interest};
pub(crate) use poller::IoPoller;
