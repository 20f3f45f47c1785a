//! Pool configuration.

use std::fmt;
use std::time::Duration;

use crate::error::PoolError;

/// Default number of connections held by the pool.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Default ceiling on in-flight requests per connection.
pub const DEFAULT_MAX_IN_PROCESS_PER_CONNECTION: usize = 32;

/// Default number of reconnect retries after the first attempt.
pub const DEFAULT_NR_RECONNECT_RETRIES: u32 = 4;

/// Default Gremlin server port.
pub const DEFAULT_PORT: u16 = 8182;

/// Default Gremlin server path.
pub const DEFAULT_PATH: &str = "/gremlin";

/// Delay applied between reconnect attempts.
///
/// No jitter is ever added, so the schedule for a given policy is fully
/// deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum Backoff {
    /// Retry straight away.
    #[default]
    Immediate,
    /// Wait the same amount of time before every retry.
    Fixed(Duration),
    /// Double the delay on every retry, starting at `initial` and capped at `max`.
    Exponential {
        /// Delay before the first retry.
        initial: Duration,
        /// Upper bound for any single delay.
        max: Duration,
    },
}

impl Backoff {
    /// Delay to wait before the given attempt (1-based).
    ///
    /// The first attempt is never delayed.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        match *self {
            Self::Immediate => Duration::ZERO,
            Self::Fixed(delay) => delay,
            Self::Exponential { initial, max } => {
                let shift = (attempt - 2).min(31);
                initial.saturating_mul(1u32 << shift).min(max)
            }
        }
    }
}

/// Location of the Gremlin server the pool connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Endpoint {
    /// Server hostname or IP address.
    pub host: String,

    /// Server port (default: 8182).
    pub port: u16,

    /// Request path on the server (default: `/gremlin`).
    pub path: String,

    /// Whether to connect over TLS.
    pub tls: bool,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: DEFAULT_PORT,
            path: DEFAULT_PATH.into(),
            tls: false,
        }
    }
}

impl Endpoint {
    /// Create an endpoint for the given host with default port and path.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    /// Set the server port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the request path.
    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Enable or disable TLS.
    #[must_use]
    pub fn tls(mut self, enabled: bool) -> Self {
        self.tls = enabled;
        self
    }

    /// Render the WebSocket URI of this endpoint.
    #[must_use]
    pub fn uri(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        let path = self.path.trim_start_matches('/');
        format!("{scheme}://{}:{}/{path}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())
    }
}

/// Settings for the connection pool.
///
/// The bounded values are only reachable through validating setters. A
/// rejected value leaves the previous one in place.
///
/// ```rust
/// use gremlin_driver_pool::PoolSettings;
///
/// let mut settings = PoolSettings::new();
/// settings.set_pool_size(8).unwrap();
/// assert!(settings.set_pool_size(0).is_err());
/// assert_eq!(settings.pool_size(), 8);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pool_size: usize,
    max_in_process_per_connection: usize,
    nr_reconnect_retries: u32,
    reconnect_backoff: Backoff,
    connect_timeout: Option<Duration>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            max_in_process_per_connection: DEFAULT_MAX_IN_PROCESS_PER_CONNECTION,
            nr_reconnect_retries: DEFAULT_NR_RECONNECT_RETRIES,
            reconnect_backoff: Backoff::Immediate,
            connect_timeout: None,
        }
    }
}

impl PoolSettings {
    /// Create pool settings with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connections the pool maintains.
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Set the number of connections the pool maintains. Must be > 0.
    pub fn set_pool_size(&mut self, value: i64) -> Result<(), PoolError> {
        self.pool_size = positive("pool_size", value)?;
        Ok(())
    }

    /// Maximum number of in-flight requests on one connection.
    ///
    /// [`Pool::get`](crate::Pool::get) fails with
    /// [`PoolError::PoolBusy`] once every connection has reached it.
    #[must_use]
    pub fn max_in_process_per_connection(&self) -> usize {
        self.max_in_process_per_connection
    }

    /// Set the maximum number of in-flight requests per connection. Must be > 0.
    pub fn set_max_in_process_per_connection(&mut self, value: i64) -> Result<(), PoolError> {
        self.max_in_process_per_connection = positive("max_in_process_per_connection", value)?;
        Ok(())
    }

    /// Number of retries after a failed connection attempt.
    ///
    /// Zero means a single attempt. Once the retries are used up the pool
    /// reports [`PoolError::ServerUnavailable`].
    #[must_use]
    pub fn nr_reconnect_retries(&self) -> u32 {
        self.nr_reconnect_retries
    }

    /// Set the number of reconnect retries. Must be >= 0.
    pub fn set_nr_reconnect_retries(&mut self, value: i64) -> Result<(), PoolError> {
        if value < 0 {
            return Err(PoolError::invalid(
                "nr_reconnect_retries",
                format!("{value} must be >= 0"),
            ));
        }
        self.nr_reconnect_retries = u32::try_from(value).map_err(|_| {
            PoolError::invalid("nr_reconnect_retries", format!("{value} is too large"))
        })?;
        Ok(())
    }

    /// Total connection attempts in one reconnect cycle.
    #[must_use]
    pub fn max_connect_attempts(&self) -> u32 {
        self.nr_reconnect_retries.saturating_add(1)
    }

    /// Delay schedule between reconnect attempts.
    #[must_use]
    pub fn reconnect_backoff(&self) -> Backoff {
        self.reconnect_backoff
    }

    /// Set the delay schedule between reconnect attempts.
    #[must_use]
    pub fn with_reconnect_backoff(mut self, backoff: Backoff) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    /// Time allowed for a single connection attempt, if bounded.
    #[must_use]
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    /// Bound every connection attempt by `timeout`.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.pool_size == 0 {
            return Err(PoolError::invalid("pool_size", "must be > 0"));
        }
        if self.max_in_process_per_connection == 0 {
            return Err(PoolError::invalid(
                "max_in_process_per_connection",
                "must be > 0",
            ));
        }
        if self.connect_timeout == Some(Duration::ZERO) {
            return Err(PoolError::invalid("connect_timeout", "must be non-zero"));
        }
        Ok(())
    }
}

fn positive(field: &'static str, value: i64) -> Result<usize, PoolError> {
    if value <= 0 {
        return Err(PoolError::invalid(field, format!("{value} must be > 0")));
    }
    usize::try_from(value).map_err(|_| PoolError::invalid(field, format!("{value} is too large")))
}
