//! Pool error types.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during pool operations.
///
/// Only the terminal outcomes cross the pool boundary: busy, unavailable,
/// disposed, and invalid configuration. Transport failures are absorbed
/// into the reconnect cycle.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// A settings value violates its bound.
    #[error("invalid configuration for {field}: {message}")]
    InvalidConfiguration {
        /// Name of the offending setting.
        field: &'static str,
        /// What was wrong with the value.
        message: String,
    },

    /// Every connection is either dead or at its in-flight ceiling.
    #[error(
        "connection pool is busy: all {pool_size} connections are dead or have \
         {max_in_process} requests in flight"
    )]
    PoolBusy {
        /// Number of slots in the pool.
        pool_size: usize,
        /// Per-connection in-flight ceiling.
        max_in_process: usize,
    },

    /// A connection could not be used; handled by reconnecting.
    #[error("connection unusable: {0}")]
    ConnectionUnusable(String),

    /// The server could not be reached within the reconnect budget.
    #[error("server unavailable after {attempts} connection attempts: {last_error}")]
    ServerUnavailable {
        /// Number of connection attempts made.
        attempts: u32,
        /// Error reported by the last attempt.
        last_error: String,
    },

    /// The pool has been disposed.
    #[error("pool has been disposed")]
    PoolDisposed,
}

impl PoolError {
    /// Check if this error is transient and may succeed on retry.
    ///
    /// A busy pool or an unusable connection may clear up on its own.
    /// Exhausted reconnects, disposal, and bad configuration will not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::PoolBusy { .. } | Self::ConnectionUnusable(_))
    }

    pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            field,
            message: message.into(),
        }
    }
}

/// Reasons a single connection refuses a new request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AcquireError {
    /// The connection already carries its maximum number of requests.
    #[error("connection is at capacity")]
    AtCapacity,

    /// The connection is dead and waits to be replaced.
    #[error("connection is unusable")]
    Unusable,
}

/// Errors reported by the transport collaborator.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// Connection could not be established.
    #[error("connection failed: {0}")]
    Connect(String),

    /// Connection attempt did not finish in time.
    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),

    /// Connection was closed by the remote side.
    #[error("connection closed")]
    Closed,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Check if this error is transient and may succeed on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Closed | Self::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let busy = PoolError::PoolBusy {
            pool_size: 4,
            max_in_process: 32,
        };
        assert!(busy.is_transient());
        assert!(PoolError::ConnectionUnusable("reset".into()).is_transient());
        assert!(!PoolError::PoolDisposed.is_transient());
        assert!(
            !PoolError::ServerUnavailable {
                attempts: 5,
                last_error: "refused".into(),
            }
            .is_transient()
        );
    }

    #[test]
    fn test_error_messages() {
        let err = PoolError::ServerUnavailable {
            attempts: 5,
            last_error: "connection refused".into(),
        };
        assert_eq!(
            err.to_string(),
            "server unavailable after 5 connection attempts: connection refused"
        );

        let err = PoolError::invalid("pool_size", "must be > 0");
        assert_eq!(
            err.to_string(),
            "invalid configuration for pool_size: must be > 0"
        );
    }

    #[test]
    fn test_transport_error_transient() {
        assert!(TransportError::Closed.is_transient());
        assert!(TransportError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!TransportError::Connect("bad handshake".into()).is_transient());
    }
}
