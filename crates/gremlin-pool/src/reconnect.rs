//! Bounded reconnection.
//!
//! ## State Transitions
//!
//! ```text
//! Idle -> Attempting (run() starts a cycle)
//! Attempting -> Attempting (attempt failed, budget left)
//! Attempting -> Succeeded (a channel was opened)
//! Attempting -> Exhausted (nr_reconnect_retries + 1 attempts failed)
//! Succeeded | Exhausted -> Idle (reset(), or the next run())
//! ```
//!
//! The budget only covers connection establishment. Requests that fail on
//! an established connection are never retried here.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::{Backoff, Endpoint, PoolSettings};
use crate::error::{PoolError, TransportError};
use crate::transport::ConnectionFactory;

/// Where a reconnect cycle currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectState {
    /// No cycle running.
    #[default]
    Idle,
    /// Attempt number `attempt` (1-based) is in progress.
    Attempting {
        /// Current attempt.
        attempt: u32,
    },
    /// The cycle opened a channel.
    Succeeded {
        /// Attempts it took.
        attempts: u32,
    },
    /// Every attempt failed.
    Exhausted {
        /// Attempts made.
        attempts: u32,
    },
}

impl ReconnectState {
    /// Check if the cycle has finished, successfully or not.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded { .. } | Self::Exhausted { .. })
    }
}

/// Attempts to open a channel a bounded number of times.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    max_attempts: u32,
    backoff: Backoff,
    connect_timeout: Option<Duration>,
    state: ReconnectState,
}

impl ReconnectPolicy {
    /// Create a policy allowing `nr_retries` retries after the first attempt.
    #[must_use]
    pub fn new(nr_retries: u32) -> Self {
        Self {
            max_attempts: nr_retries.saturating_add(1),
            backoff: Backoff::Immediate,
            connect_timeout: None,
            state: ReconnectState::Idle,
        }
    }

    /// Create a policy matching the pool settings.
    #[must_use]
    pub fn from_settings(settings: &PoolSettings) -> Self {
        Self {
            max_attempts: settings.max_connect_attempts(),
            backoff: settings.reconnect_backoff(),
            connect_timeout: settings.connect_timeout(),
            state: ReconnectState::Idle,
        }
    }

    /// Set the delay schedule between attempts.
    #[must_use]
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Bound every attempt by `timeout`.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Total attempts allowed per cycle.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ReconnectState {
        self.state
    }

    /// Return to `Idle` so a new cycle can start.
    pub fn reset(&mut self) {
        self.state = ReconnectState::Idle;
    }

    /// Run one reconnect cycle.
    ///
    /// Returns the first channel that opens, or
    /// [`PoolError::ServerUnavailable`] once every attempt failed. If
    /// `cancel` fires the cycle stops with [`PoolError::PoolDisposed`] and
    /// the policy goes back to `Idle`.
    pub async fn run<F: ConnectionFactory>(
        &mut self,
        factory: &F,
        endpoint: &Endpoint,
        cancel: &CancellationToken,
    ) -> Result<F::Channel, PoolError> {
        if self.state.is_terminal() {
            self.reset();
        }

        let mut last_error = String::from("no connection attempt made");
        for attempt in 1..=self.max_attempts {
            let delay = self.backoff.delay_for(attempt);
            if !delay.is_zero() {
                tracing::trace!(attempt, delay = ?delay, "waiting before retry");
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(self.cancelled()),
                    () = tokio::time::sleep(delay) => {}
                }
            }
            if cancel.is_cancelled() {
                return Err(self.cancelled());
            }

            self.state = ReconnectState::Attempting { attempt };
            tracing::debug!(
                attempt,
                max_attempts = self.max_attempts,
                endpoint = %endpoint,
                "opening connection"
            );

            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(self.cancelled()),
                result = connect_once(factory, endpoint, self.connect_timeout) => result,
            };

            match result {
                Ok(channel) => {
                    self.state = ReconnectState::Succeeded { attempts: attempt };
                    tracing::debug!(attempt, endpoint = %endpoint, "connection established");
                    return Ok(channel);
                }
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        transient = e.is_transient(),
                        error = %e,
                        "connection attempt failed"
                    );
                    last_error = e.to_string();
                }
            }
        }

        self.state = ReconnectState::Exhausted {
            attempts: self.max_attempts,
        };
        tracing::warn!(
            attempts = self.max_attempts,
            endpoint = %endpoint,
            "reconnect attempts exhausted, server unavailable"
        );
        Err(PoolError::ServerUnavailable {
            attempts: self.max_attempts,
            last_error,
        })
    }

    fn cancelled(&mut self) -> PoolError {
        tracing::debug!("reconnect cancelled");
        self.state = ReconnectState::Idle;
        PoolError::PoolDisposed
    }
}

async fn connect_once<F: ConnectionFactory>(
    factory: &F,
    endpoint: &Endpoint,
    timeout: Option<Duration>,
) -> Result<F::Channel, TransportError> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, factory.connect(endpoint))
            .await
            .map_err(|_| TransportError::Timeout(limit))?,
        None => factory.connect(endpoint).await,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::transport::Channel;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    struct NullChannel;

    #[async_trait]
    impl Channel for NullChannel {
        fn is_open(&self) -> bool {
            true
        }

        async fn close(&self) {}
    }

    /// Fails the first `failures` attempts, then succeeds.
    struct FlakyFactory {
        failures: u32,
        attempts: AtomicU32,
        hang: bool,
    }

    impl FlakyFactory {
        fn failing(failures: u32) -> Self {
            Self {
                failures,
                attempts: AtomicU32::new(0),
                hang: false,
            }
        }

        fn hanging() -> Self {
            Self {
                failures: 0,
                attempts: AtomicU32::new(0),
                hang: true,
            }
        }

        fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ConnectionFactory for FlakyFactory {
        type Channel = NullChannel;

        async fn connect(&self, _endpoint: &Endpoint) -> Result<NullChannel, TransportError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if self.hang {
                std::future::pending::<()>().await;
            }
            if n <= self.failures {
                Err(TransportError::Connect(format!("refused #{n}")))
            } else {
                Ok(NullChannel)
            }
        }
    }

    #[tokio::test]
    async fn test_zero_retries_single_attempt() {
        let factory = FlakyFactory::failing(u32::MAX);
        let mut policy = ReconnectPolicy::new(0);

        let err = policy
            .run(&factory, &Endpoint::default(), &CancellationToken::new())
            .await
            .err()
            .unwrap();

        assert_eq!(factory.attempts(), 1);
        assert!(matches!(err, PoolError::ServerUnavailable { attempts: 1, .. }));
        assert_eq!(policy.state(), ReconnectState::Exhausted { attempts: 1 });
    }

    #[tokio::test]
    async fn test_four_retries_five_attempts() {
        let factory = FlakyFactory::failing(u32::MAX);
        let mut policy = ReconnectPolicy::new(4);

        let err = policy
            .run(&factory, &Endpoint::default(), &CancellationToken::new())
            .await
            .err()
            .unwrap();

        assert_eq!(factory.attempts(), 5);
        match err {
            PoolError::ServerUnavailable {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 5);
                assert!(last_error.contains("refused #5"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_succeeds_within_budget() {
        let factory = FlakyFactory::failing(2);
        let mut policy = ReconnectPolicy::new(4);

        let result = policy
            .run(&factory, &Endpoint::default(), &CancellationToken::new())
            .await;

        assert!(result.is_ok());
        assert_eq!(factory.attempts(), 3);
        assert_eq!(policy.state(), ReconnectState::Succeeded { attempts: 3 });
    }

    #[tokio::test]
    async fn test_next_run_starts_fresh_cycle() {
        let factory = FlakyFactory::failing(u32::MAX);
        let mut policy = ReconnectPolicy::new(1);
        let cancel = CancellationToken::new();

        let _ = policy.run(&factory, &Endpoint::default(), &cancel).await;
        let _ = policy.run(&factory, &Endpoint::default(), &cancel).await;

        assert_eq!(factory.attempts(), 4);
        policy.reset();
        assert_eq!(policy.state(), ReconnectState::Idle);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let factory = FlakyFactory::failing(0);
        let mut policy = ReconnectPolicy::new(4);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = policy
            .run(&factory, &Endpoint::default(), &cancel)
            .await
            .err()
            .unwrap();

        assert!(matches!(err, PoolError::PoolDisposed));
        assert_eq!(factory.attempts(), 0);
        assert_eq!(policy.state(), ReconnectState::Idle);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_hanging_attempt() {
        let factory = FlakyFactory::hanging();
        let mut policy = ReconnectPolicy::new(4);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = policy
            .run(&factory, &Endpoint::default(), &cancel)
            .await
            .err()
            .unwrap();

        assert!(matches!(err, PoolError::PoolDisposed));
        assert_eq!(factory.attempts(), 1);
    }

    #[tokio::test]
    async fn test_connect_timeout_counts_as_failure() {
        let factory = FlakyFactory::hanging();
        let mut policy = ReconnectPolicy::new(1).connect_timeout(Duration::from_millis(10));

        let err = policy
            .run(&factory, &Endpoint::default(), &CancellationToken::new())
            .await
            .err()
            .unwrap();

        assert_eq!(factory.attempts(), 2);
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_fixed_backoff_delays_retries() {
        let factory = FlakyFactory::failing(u32::MAX);
        let mut policy =
            ReconnectPolicy::new(2).backoff(Backoff::Fixed(Duration::from_millis(15)));

        let start = Instant::now();
        let _ = policy
            .run(&factory, &Endpoint::default(), &CancellationToken::new())
            .await;

        assert_eq!(factory.attempts(), 3);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
