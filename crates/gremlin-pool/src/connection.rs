//! A single pooled connection and its in-flight accounting.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::error::AcquireError;
use crate::transport::Channel;

/// Connection state as seen by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connection accepts requests, capacity permitting.
    Open,
    /// Connection failed and waits to be replaced.
    Dead,
}

impl ConnectionState {
    /// Check if the connection can take requests.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

/// One logical channel to the server.
///
/// Tracks how many requests are in flight against a fixed ceiling. A dead
/// connection is never revived: the pool replaces it with a freshly opened
/// one.
pub struct Connection<C> {
    id: u64,
    channel: C,
    dead: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: usize,
    created_at: Instant,
}

impl<C: Channel> Connection<C> {
    /// Wrap an open channel.
    pub fn new(id: u64, channel: C, max_in_flight: usize) -> Self {
        Self {
            id,
            channel,
            dead: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            max_in_flight,
            created_at: Instant::now(),
        }
    }

    /// Pool-unique identifier of this connection.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The underlying transport channel.
    #[must_use]
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Current state.
    ///
    /// A connection whose channel reports itself closed is dead even if
    /// nobody has called [`mark_dead`](Self::mark_dead) yet.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        if self.dead.load(Ordering::Acquire) || !self.channel.is_open() {
            ConnectionState::Dead
        } else {
            ConnectionState::Open
        }
    }

    /// Check if the connection is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Number of requests currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Capacity left before the connection refuses requests.
    #[must_use]
    pub fn spare_capacity(&self) -> usize {
        self.max_in_flight.saturating_sub(self.in_flight())
    }

    /// Time since the connection was opened.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Reserve capacity for one request.
    pub fn acquire(&self) -> Result<(), AcquireError> {
        if !self.is_open() {
            return Err(AcquireError::Unusable);
        }

        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            if current >= self.max_in_flight {
                return Err(AcquireError::AtCapacity);
            }
            match self.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Give back capacity reserved by [`acquire`](Self::acquire).
    ///
    /// Releasing more often than acquiring is a caller bug; the counter
    /// saturates at zero rather than wrapping.
    pub fn release(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Mark the connection dead.
    ///
    /// Returns `true` if this call performed the transition, `false` if the
    /// connection was already marked.
    pub fn mark_dead(&self) -> bool {
        !self.dead.swap(true, Ordering::AcqRel)
    }
}

impl<C: Channel> fmt::Debug for Connection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("dead", &self.dead.load(Ordering::Relaxed))
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .field("max_in_flight", &self.max_in_flight)
            .field("age", &self.age())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;

    #[derive(Default)]
    struct FlagChannel {
        closed: AtomicBool,
    }

    #[async_trait]
    impl Channel for FlagChannel {
        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::Acquire)
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::Release);
        }
    }

    #[test]
    fn test_acquire_until_capacity() {
        let conn = Connection::new(1, FlagChannel::default(), 2);

        assert!(conn.acquire().is_ok());
        assert!(conn.acquire().is_ok());
        assert_eq!(conn.acquire(), Err(AcquireError::AtCapacity));
        assert_eq!(conn.in_flight(), 2);
        assert_eq!(conn.spare_capacity(), 0);

        conn.release();
        assert_eq!(conn.in_flight(), 1);
        assert!(conn.acquire().is_ok());
    }

    #[test]
    fn test_debug_reports_age() {
        let conn = Connection::new(3, FlagChannel::default(), 4);
        assert!(conn.age() < Duration::from_secs(60));

        let debug = format!("{conn:?}");
        assert!(debug.contains("id: 3"));
        assert!(debug.contains("age: "));
    }

    #[test]
    fn test_release_saturates() {
        let conn = Connection::new(1, FlagChannel::default(), 1);
        conn.release();
        assert_eq!(conn.in_flight(), 0);
    }

    #[test]
    fn test_mark_dead_once() {
        let conn = Connection::new(7, FlagChannel::default(), 4);
        assert_eq!(conn.state(), ConnectionState::Open);

        assert!(conn.mark_dead());
        assert!(!conn.mark_dead());
        assert_eq!(conn.state(), ConnectionState::Dead);
        assert_eq!(conn.acquire(), Err(AcquireError::Unusable));
    }

    #[test]
    fn test_closed_channel_is_dead() {
        let conn = Connection::new(1, FlagChannel::default(), 4);
        conn.channel().closed.store(true, Ordering::Release);

        assert!(!conn.is_open());
        assert_eq!(conn.acquire(), Err(AcquireError::Unusable));
    }

    #[test]
    fn test_concurrent_acquire_respects_ceiling() {
        let conn = Arc::new(Connection::new(1, FlagChannel::default(), 10));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let conn = Arc::clone(&conn);
                std::thread::spawn(move || (0..10).filter(|_| conn.acquire().is_ok()).count())
            })
            .collect();

        let acquired: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(acquired, 10);
        assert_eq!(conn.in_flight(), 10);
    }
}
