//! Error types for service exposure.

use thiserror::Error;

/// Result type for exposure operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by a reconcile cycle.
///
/// Validation problems with a `Service`'s annotations are not errors: they
/// are reported on the `Service` status instead. Everything here either
/// needs an operator to act or should make the scheduler retry the cycle.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error.
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The address record document could not be encoded or decoded.
    #[error("service records serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A pool definition was not a list of masked IPv4 prefixes.
    #[error("invalid address pool: {0}")]
    InvalidPool(String),

    /// Every configured pool is full.
    #[error("no free address left in any pool for {dns_name}")]
    PoolExhausted {
        /// The DNS name that could not be given an address.
        dns_name: String,
    },

    /// The record store changed between read and write.
    #[error("service records were modified concurrently")]
    Conflict,

    /// Every write attempt lost the race against another writer.
    #[error("service records still conflicting after {attempts} attempts")]
    ConflictRetriesExhausted {
        /// How many allocate-then-persist cycles were tried.
        attempts: u32,
    },

    /// The object the operation needs does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// The proxy workload reconciler failed.
    #[error("proxy reconciler error: {0}")]
    Proxy(String),
}

impl Error {
    /// Create an invalid pool error with the given message
    pub fn invalid_pool(msg: impl Into<String>) -> Self {
        Self::InvalidPool(msg.into())
    }

    /// Create a proxy reconciler error with the given message
    pub fn proxy(msg: impl Into<String>) -> Self {
        Self::Proxy(msg.into())
    }

    /// Reports whether retrying the whole cycle later may succeed.
    ///
    /// Pool exhaustion and malformed configuration won't change on their
    /// own, so the scheduler should not hammer them.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Kube(_)
            | Self::Conflict
            | Self::ConflictRetriesExhausted { .. }
            | Self::NotFound(_)
            | Self::Proxy(_) => true,
            Self::Serialization(_) | Self::InvalidPool(_) | Self::PoolExhausted { .. } => false,
        }
    }
}
