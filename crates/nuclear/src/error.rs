//! Crate-wide error type.
//!
//! Mirrors §7 of the design: installation-time failures are fatal to the
//! caller, steady-state failures are confined to the faulting task or peer
//! and never propagate out of a worker thread.

#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Duplicate `PowerPlant` instance, zero threads, or an invalid
    /// multicast address passed at construction time.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Socket / bind / setsockopt failure encountered while installing a
    /// reaction that binds an fd (TCP listener, UDP socket, self-pipe).
    #[error("bind error: {message}")]
    Bind {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// A user callback unwound out of a reaction body. Captured into the
    /// task's statistics; never escapes the worker thread that ran it.
    #[error("reaction {reaction_id} panicked: {message}")]
    Task { reaction_id: u64, message: String },

    /// A send/recv failure on the network transport after start-up. Never
    /// fatal: the affected peer is marked left.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// An attempt to register a startup hook (Initialize-scoped emit,
    /// install) after `start()` has begun.
    #[error("shutdown in progress, cannot register new work")]
    ShutdownInProgress,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
        }
    }

    pub(crate) fn bind(message: impl Into<String>, source: std::io::Error) -> Self {
        Error::Bind {
            message: message.into(),
            source: Some(source),
        }
    }

    pub(crate) fn transport(message: impl Into<String>) -> Self {
        Error::Transport {
            message: message.into(),
        }
    }
}
