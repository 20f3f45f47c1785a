//! Transport collaborator traits.
//!
//! The pool does not speak any wire protocol itself. It opens connections
//! through a [`ConnectionFactory`] and only asks the resulting [`Channel`]s
//! whether they are still open and to close themselves. Sending requests
//! and reading responses is done by the caller on the borrowed channel.

use async_trait::async_trait;

use crate::config::Endpoint;
use crate::error::TransportError;

/// A single open channel to the server.
///
/// Uses `#[async_trait]` so that the pool can drive channels from spawned
/// tasks, which requires `Send` futures.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Check if the underlying transport is still open.
    ///
    /// This should be cheap, typically just a flag set by the reader task
    /// when the socket is closed. The pool calls it while holding its slot
    /// lock during selection.
    fn is_open(&self) -> bool;

    /// Close the channel.
    ///
    /// Errors while closing are not interesting to the pool and are
    /// swallowed by implementations.
    async fn close(&self);
}

/// Opens new channels to a server endpoint.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// The channel type produced by this factory.
    type Channel: Channel;

    /// Open a new channel to `endpoint`.
    ///
    /// Authentication and handshakes belong here; the pool treats a
    /// returned channel as ready for requests.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Self::Channel, TransportError>;
}
