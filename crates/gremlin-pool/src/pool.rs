//! Connection pool implementation.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::config::{Endpoint, PoolSettings};
use crate::connection::Connection;
use crate::error::PoolError;
use crate::reconnect::{ReconnectPolicy, ReconnectState};
use crate::transport::{Channel, ConnectionFactory};

/// Capacity of the event channel returned by [`Pool::subscribe`].
const EVENT_CAPACITY: usize = 64;

/// Published once a reconnect cycle finishes. `None` while it runs.
type Outcome = Option<Result<(), PoolError>>;

/// Lifecycle events published by the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PoolEvent {
    /// A connection was opened into a slot.
    ConnectionOpened {
        /// Slot index.
        slot: usize,
        /// Identifier of the new connection.
        connection_id: u64,
        /// Attempts the reconnect cycle needed.
        attempts: u32,
    },
    /// A connection was found dead and its slot is being reconnected.
    ConnectionDead {
        /// Slot index.
        slot: usize,
        /// Identifier of the dead connection.
        connection_id: u64,
    },
    /// A reconnect cycle used up its budget; the slot stays dead.
    ServerUnavailable {
        /// Slot index.
        slot: usize,
        /// Attempts made.
        attempts: u32,
    },
    /// The pool was disposed.
    Disposed,
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Number of slots.
    pub pool_size: usize,
    /// Slots holding an open connection.
    pub open: usize,
    /// Slots that are dead and not being reconnected.
    pub dead: usize,
    /// Slots with a reconnect cycle in progress.
    pub reconnecting: usize,
    /// Requests in flight across all open connections.
    pub in_flight: usize,
    /// Requests that could still be started before the pool is busy.
    pub available: usize,
}

enum Slot<C> {
    Open(Arc<Connection<C>>),
    Reconnecting(watch::Receiver<Outcome>),
    /// Idle until healed. Remembers the connection whose death emptied the
    /// slot and how the last cycle ended, so late reports of that death do
    /// not start another cycle.
    Dead {
        last_connection_id: Option<u64>,
        last_error: Option<PoolError>,
    },
}

impl<C> Slot<C> {
    fn empty() -> Self {
        Self::Dead {
            last_connection_id: None,
            last_error: None,
        }
    }
}

/// A connection pool for a Gremlin server.
///
/// The pool owns a fixed number of slots, each holding at most one
/// connection. Callers borrow a connection for one request through
/// [`get`](Self::get); the returned guard gives the capacity back when
/// dropped.
///
/// `Pool` is a cheap handle: clones share the same slots. The pool lives
/// until [`dispose`](Self::dispose) is called, after which every operation
/// fails with [`PoolError::PoolDisposed`].
pub struct Pool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

struct PoolInner<F: ConnectionFactory> {
    settings: PoolSettings,
    endpoint: Endpoint,
    factory: F,
    slots: Mutex<Vec<Slot<F::Channel>>>,
    disposed: AtomicBool,
    cancel: CancellationToken,
    events: broadcast::Sender<PoolEvent>,
    next_id: AtomicU64,
}

impl<F: ConnectionFactory> Pool<F> {
    /// Create a builder for a pool that opens connections with `factory`.
    pub fn builder(factory: F) -> PoolBuilder<F> {
        PoolBuilder::new(factory)
    }

    /// Borrow a connection with spare capacity.
    ///
    /// Picks the open connection with the fewest requests in flight, the
    /// lowest slot index winning ties, and reserves one unit of its
    /// capacity in the same step. This never waits: if every connection is
    /// dead or at its ceiling the call fails with [`PoolError::PoolBusy`].
    ///
    /// Connections whose transport reports itself closed are marked dead
    /// during the scan and their slots start reconnecting in the
    /// background. Slots left dead by an exhausted cycle are skipped.
    pub fn get(&self) -> Result<PooledConnection<F>, PoolError> {
        let inner = &self.inner;
        if inner.is_disposed() {
            return Err(PoolError::PoolDisposed);
        }

        let mut slots = inner.slots.lock();
        if inner.is_disposed() {
            return Err(PoolError::PoolDisposed);
        }

        let mut candidates = Vec::with_capacity(slots.len());
        let mut newly_dead = Vec::new();
        for (index, slot) in slots.iter().enumerate() {
            if let Slot::Open(conn) = slot {
                if !conn.is_open() {
                    newly_dead.push(index);
                } else if conn.spare_capacity() > 0 {
                    candidates.push((conn.in_flight(), index, Arc::clone(conn)));
                }
            }
        }

        for index in newly_dead {
            let _ = inner.begin_reconnect(&mut slots, index);
        }

        candidates.sort_by_key(|(in_flight, index, _)| (*in_flight, *index));
        let chosen = candidates
            .into_iter()
            .find(|(_, _, conn)| conn.acquire().is_ok());
        drop(slots);

        match chosen {
            Some((_, slot, conn)) => {
                tracing::trace!(
                    slot,
                    connection_id = conn.id(),
                    in_flight = conn.in_flight(),
                    "acquired connection from pool"
                );
                Ok(PooledConnection {
                    conn,
                    slot,
                    pool: self.clone(),
                })
            }
            None => {
                tracing::debug!("no connection with spare capacity, pool busy");
                Err(PoolError::PoolBusy {
                    pool_size: inner.settings.pool_size(),
                    max_in_process: inner.settings.max_in_process_per_connection(),
                })
            }
        }
    }

    /// Return a borrowed connection to the pool.
    ///
    /// Equivalent to dropping the guard.
    pub fn release(&self, conn: PooledConnection<F>) {
        drop(conn);
    }

    /// Report that a request on `conn` failed at the transport level.
    ///
    /// Marks the connection dead and waits for its slot to be reconnected.
    /// Only one reconnect cycle runs per death: callers reporting the same
    /// dead connection concurrently all wait for that cycle and receive its
    /// outcome. Returns `Ok(())` once the slot holds a fresh connection, or
    /// [`PoolError::ServerUnavailable`] if the cycle used up its budget.
    /// Reporting a death whose cycle already finished returns that cycle's
    /// outcome without reconnecting again.
    ///
    /// The guard keeps its reservation; drop it afterwards.
    pub async fn report_failure(&self, conn: &PooledConnection<F>) -> Result<(), PoolError> {
        self.inner.reconnect_after_failure(conn.slot, conn.conn.id()).await
    }

    /// Start a reconnect cycle for every dead slot and wait for all of them.
    ///
    /// Slots left dead by an exhausted cycle are never revived by
    /// [`get`](Self::get) or by late reports of the death that emptied
    /// them; this is the way to retry them. Returns the number of slots that
    /// hold an open connection afterwards.
    pub async fn heal(&self) -> Result<usize, PoolError> {
        let receivers = {
            let inner = &self.inner;
            if inner.is_disposed() {
                return Err(PoolError::PoolDisposed);
            }
            let mut slots = inner.slots.lock();
            let mut receivers = Vec::new();
            for index in 0..slots.len() {
                match &slots[index] {
                    Slot::Open(conn) if conn.is_open() => {}
                    Slot::Reconnecting(rx) => receivers.push(rx.clone()),
                    Slot::Open(_) | Slot::Dead { .. } => {
                        receivers.push(inner.begin_reconnect(&mut slots, index));
                    }
                }
            }
            receivers
        };

        for rx in receivers {
            if let Err(e) = wait_for_outcome(rx).await {
                if matches!(e, PoolError::PoolDisposed) {
                    return Err(e);
                }
            }
        }

        if self.inner.is_disposed() {
            return Err(PoolError::PoolDisposed);
        }
        Ok(self.status().open)
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let slots = self.inner.slots.lock();
        let mut status = PoolStatus {
            pool_size: slots.len(),
            open: 0,
            dead: 0,
            reconnecting: 0,
            in_flight: 0,
            available: 0,
        };
        for slot in slots.iter() {
            match slot {
                Slot::Open(conn) if conn.is_open() => {
                    status.open += 1;
                    status.in_flight += conn.in_flight();
                    status.available += conn.spare_capacity();
                }
                Slot::Open(conn) => {
                    status.dead += 1;
                    status.in_flight += conn.in_flight();
                }
                Slot::Reconnecting(_) => status.reconnecting += 1,
                Slot::Dead { .. } => status.dead += 1,
            }
        }
        status
    }

    /// Subscribe to pool lifecycle events.
    ///
    /// [`PoolEvent::ServerUnavailable`] is published here whenever a slot
    /// exhausts its reconnect budget, whether or not a caller was waiting.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    /// Dispose of the pool, closing all connections.
    ///
    /// Reconnect cycles still running are cancelled and their waiters
    /// receive [`PoolError::PoolDisposed`]. Calling this again is a no-op.
    pub async fn dispose(&self) {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.cancel.cancel();

        let connections: Vec<_> = {
            let mut slots = inner.slots.lock();
            slots
                .iter_mut()
                .filter_map(|slot| match std::mem::replace(slot, Slot::empty()) {
                    Slot::Open(conn) => Some(conn),
                    Slot::Reconnecting(_) | Slot::Dead { .. } => None,
                })
                .collect()
        };

        for conn in connections {
            conn.mark_dead();
            if conn.in_flight() > 0 {
                tracing::debug!(
                    connection_id = conn.id(),
                    in_flight = conn.in_flight(),
                    "closing connection with requests in flight"
                );
            }
            conn.channel().close().await;
        }

        inner.emit(PoolEvent::Disposed);
        tracing::info!(endpoint = %inner.endpoint, "connection pool disposed");
    }

    /// Check if the pool has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Get the pool settings.
    #[must_use]
    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    /// Get the endpoint the pool connects to.
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }
}

impl<F: ConnectionFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("endpoint", &self.inner.endpoint)
            .field("settings", &self.inner.settings)
            .field("disposed", &self.inner.is_disposed())
            .finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> PoolInner<F> {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn emit(&self, event: PoolEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Move `index` into `Reconnecting` and spawn the cycle.
    ///
    /// Must be called with the slot lock held, which is what makes the
    /// transition single-flight.
    fn begin_reconnect(
        self: &Arc<Self>,
        slots: &mut [Slot<F::Channel>],
        index: usize,
    ) -> watch::Receiver<Outcome> {
        let dead_id = match &slots[index] {
            Slot::Reconnecting(rx) => return rx.clone(),
            Slot::Open(conn) => {
                conn.mark_dead();
                tracing::debug!(slot = index, connection_id = conn.id(), "connection dead");
                self.emit(PoolEvent::ConnectionDead {
                    slot: index,
                    connection_id: conn.id(),
                });
                Some(conn.id())
            }
            Slot::Dead {
                last_connection_id, ..
            } => *last_connection_id,
        };

        let (tx, rx) = watch::channel(None);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                slots[index] = Slot::Reconnecting(rx.clone());
                let pool = Arc::clone(self);
                runtime.spawn(async move { pool.reconnect_slot(index, dead_id, tx).await });
            }
            Err(_) => {
                tracing::warn!(slot = index, "no async runtime available, slot left dead");
                let error =
                    PoolError::ConnectionUnusable("no async runtime available to reconnect".into());
                slots[index] = Slot::Dead {
                    last_connection_id: dead_id,
                    last_error: Some(error.clone()),
                };
                tx.send_replace(Some(Err(error)));
            }
        }
        rx
    }

    async fn reconnect_slot(
        self: Arc<Self>,
        index: usize,
        dead_id: Option<u64>,
        tx: watch::Sender<Outcome>,
    ) {
        let mut policy = ReconnectPolicy::from_settings(&self.settings);
        let result = policy.run(&self.factory, &self.endpoint, &self.cancel).await;
        let attempts = match policy.state() {
            ReconnectState::Succeeded { attempts } | ReconnectState::Exhausted { attempts } => {
                attempts
            }
            ReconnectState::Attempting { attempt } => attempt,
            ReconnectState::Idle => 0,
        };

        let mut orphan = None;
        let outcome = {
            let mut slots = self.slots.lock();
            match result {
                Ok(channel) if self.is_disposed() => {
                    slots[index] = Slot::empty();
                    orphan = Some(channel);
                    Err(PoolError::PoolDisposed)
                }
                Ok(channel) => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let conn = Connection::new(
                        id,
                        channel,
                        self.settings.max_in_process_per_connection(),
                    );
                    slots[index] = Slot::Open(Arc::new(conn));
                    tracing::debug!(slot = index, connection_id = id, attempts, "slot reconnected");
                    self.emit(PoolEvent::ConnectionOpened {
                        slot: index,
                        connection_id: id,
                        attempts,
                    });
                    Ok(())
                }
                Err(e) => {
                    slots[index] = Slot::Dead {
                        last_connection_id: dead_id,
                        last_error: Some(e.clone()),
                    };
                    if let PoolError::ServerUnavailable { attempts, .. } = &e {
                        self.emit(PoolEvent::ServerUnavailable {
                            slot: index,
                            attempts: *attempts,
                        });
                    }
                    Err(e)
                }
            }
        };

        if let Some(channel) = orphan {
            channel.close().await;
        }
        tx.send_replace(Some(outcome));
    }

    async fn reconnect_after_failure(
        self: &Arc<Self>,
        index: usize,
        connection_id: u64,
    ) -> Result<(), PoolError> {
        let rx = {
            if self.is_disposed() {
                return Err(PoolError::PoolDisposed);
            }
            let mut slots = self.slots.lock();
            match &slots[index] {
                Slot::Open(current) if current.id() != connection_id => {
                    tracing::trace!(slot = index, connection_id, "connection already replaced");
                    return Ok(());
                }
                // Ids only grow, so this death was already handled by the
                // cycle that left the slot dead.
                Slot::Dead {
                    last_connection_id: Some(dead_id),
                    last_error: Some(e),
                } if connection_id <= *dead_id => {
                    tracing::trace!(slot = index, connection_id, "death already handled");
                    return Err(e.clone());
                }
                Slot::Reconnecting(rx) => rx.clone(),
                Slot::Open(_) | Slot::Dead { .. } => self.begin_reconnect(&mut slots, index),
            }
        };
        wait_for_outcome(rx).await
    }
}

async fn wait_for_outcome(mut rx: watch::Receiver<Outcome>) -> Result<(), PoolError> {
    let outcome = match rx.wait_for(Option::is_some).await {
        Ok(outcome) => outcome.clone(),
        // Sender dropped without publishing: the runtime is shutting down.
        Err(_) => None,
    };
    outcome.unwrap_or(Err(PoolError::PoolDisposed))
}

/// Builder for [`Pool`].
#[derive(Debug)]
pub struct PoolBuilder<F> {
    factory: F,
    endpoint: Endpoint,
    settings: PoolSettings,
}

impl<F: ConnectionFactory> PoolBuilder<F> {
    /// Create a builder with default endpoint and settings.
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            endpoint: Endpoint::default(),
            settings: PoolSettings::default(),
        }
    }

    /// Set the server endpoint.
    #[must_use]
    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Set the pool settings.
    #[must_use]
    pub fn settings(mut self, settings: PoolSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Build the pool and open its connections.
    ///
    /// Every slot is filled through its own reconnect cycle, all running
    /// concurrently. Slots whose cycle is exhausted stay dead; the build
    /// only fails if no slot could be opened at all.
    pub async fn build(self) -> Result<Pool<F>, PoolError> {
        self.settings.validate()?;

        let pool_size = self.settings.pool_size();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(PoolInner {
            settings: self.settings,
            endpoint: self.endpoint,
            factory: self.factory,
            slots: Mutex::new((0..pool_size).map(|_| Slot::empty()).collect()),
            disposed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            events,
            next_id: AtomicU64::new(1),
        });

        tracing::debug!(pool_size, endpoint = %inner.endpoint, "opening pool connections");

        let receivers: Vec<_> = {
            let mut slots = inner.slots.lock();
            (0..pool_size)
                .map(|index| inner.begin_reconnect(&mut slots, index))
                .collect()
        };

        let mut opened = 0;
        let mut last_error = None;
        for rx in receivers {
            match wait_for_outcome(rx).await {
                Ok(()) => opened += 1,
                Err(e) => last_error = Some(e),
            }
        }

        let pool = Pool { inner };
        if opened == 0 {
            pool.dispose().await;
            return Err(last_error.unwrap_or(PoolError::ServerUnavailable {
                attempts: 0,
                last_error: "no connection could be opened".into(),
            }));
        }
        if opened < pool_size {
            tracing::warn!(opened, pool_size, "pool started with dead slots");
        }

        tracing::info!(
            opened,
            pool_size,
            endpoint = %pool.inner.endpoint,
            "connection pool ready"
        );
        Ok(pool)
    }
}

/// A connection borrowed from the pool.
///
/// Holds one unit of the connection's in-flight capacity, given back when
/// the guard is dropped. Dereferences to the transport channel.
pub struct PooledConnection<F: ConnectionFactory> {
    conn: Arc<Connection<F::Channel>>,
    slot: usize,
    pool: Pool<F>,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    /// Identifier of the underlying connection.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.conn.id()
    }

    /// Index of the pool slot this connection lives in.
    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// The underlying pooled connection.
    #[must_use]
    pub fn connection(&self) -> &Connection<F::Channel> {
        &self.conn
    }

    /// Release the connection after a transport failure and wait for its
    /// slot to be reconnected.
    ///
    /// See [`Pool::report_failure`].
    pub async fn fail(self) -> Result<(), PoolError> {
        let pool = self.pool.clone();
        let slot = self.slot;
        let connection_id = self.conn.id();
        self.conn.mark_dead();
        drop(self);
        pool.inner.reconnect_after_failure(slot, connection_id).await
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Channel;

    fn deref(&self) -> &Self::Target {
        self.conn.channel()
    }
}

impl<F: ConnectionFactory> fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("slot", &self.slot)
            .field("connection", &self.conn)
            .finish()
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        self.conn.release();
        tracing::trace!(
            slot = self.slot,
            connection_id = self.conn.id(),
            "returning connection to pool"
        );
    }
}
