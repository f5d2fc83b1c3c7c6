//! Identity-keyed connection pool.
//!
//! The pool owns a fixed arena of `max_pool_size` slots. A lease refers to
//! its slot by index. The backend handle is only reachable through the lease
//! and only while the slot's own lock is held.
//!
//! Locks taken under the pool state lock are slot locks of free or reserved
//! slots, which no lease holds. A lease may therefore take the pool state
//! lock while holding its own slot lock, as `mark_invalid` does when called
//! from inside `with_handle`.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use federa_error::{ConnectorError, Result};
use parking_lot::{Condvar, MappedMutexGuard, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::config::PoolConfig;
use crate::identity::ConnectorIdentity;

/// Creates, validates and closes backend handles for a pool.
pub trait ManageConnection: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Open a new handle on behalf of `identity`.
    fn connect(&self, identity: &ConnectorIdentity) -> Result<Self::Connection>;

    /// Check a handle before it's handed out. Called at checkout once the
    /// handle is older than the resource test interval.
    fn is_valid(&self, conn: &mut Self::Connection) -> Result<()>;

    /// Cheap check run on release.
    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        let _ = conn;
        false
    }

    fn close(&self, conn: Self::Connection) {
        drop(conn)
    }
}

/// Lease state of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Free,
    Leased,
    /// Leased and marked invalid, will be discarded on release.
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub max: usize,
    pub total: usize,
    pub free: usize,
    pub leased: usize,
    pub waiting: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub slot: usize,
    pub handle_id: u64,
    pub identity: ConnectorIdentity,
    pub state: LeaseState,
    pub created_at: DateTime<Utc>,
    pub last_validated: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Occupied {
    identity: ConnectorIdentity,
    state: LeaseState,
    handle_id: u64,
    created_at: DateTime<Utc>,
    last_validated: Instant,
    last_validated_at: DateTime<Utc>,
    last_used: Instant,
}

#[derive(Debug)]
struct PoolState {
    /// None for an empty slot.
    slots: Vec<Option<Occupied>>,
    waiting: usize,
    shutdown: bool,
}

impl PoolState {
    fn total(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn bucket_size(&self, identity: &ConnectorIdentity) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|s| &s.identity == identity)
            .count()
    }
}

enum Acquired<C> {
    Reused {
        slot: usize,
        handle_id: u64,
        last_validated: Instant,
    },
    Create {
        slot: usize,
    },
    Evicted {
        slot: usize,
        evicted: Option<C>,
    },
}

struct PoolInner<C> {
    name: String,
    config: PoolConfig,
    manager: Box<dyn ManageConnection<Connection = C>>,
    handles: Vec<Mutex<Option<C>>>,
    state: Mutex<PoolState>,
    available: Condvar,
    next_handle_id: AtomicU64,
}

/// Pool of backend handles bucketed by [`ConnectorIdentity`].
pub struct ConnectionPool<C: Send + 'static> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Send + 'static> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        ConnectionPool {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Send + 'static> fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<C: Send + 'static> ConnectionPool<C> {
    pub fn new<M>(name: impl Into<String>, config: PoolConfig, manager: M) -> Result<Self>
    where
        M: ManageConnection<Connection = C>,
    {
        config.validate()?;
        let max = config.max_pool_size;
        Ok(ConnectionPool {
            inner: Arc::new(PoolInner {
                name: name.into(),
                config,
                manager: Box::new(manager),
                handles: (0..max).map(|_| Mutex::new(None)).collect(),
                state: Mutex::new(PoolState {
                    slots: vec![None; max],
                    waiting: 0,
                    shutdown: false,
                }),
                available: Condvar::new(),
                next_handle_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Lease a connection for `identity`, waiting up to the configured wait
    /// time for one to become available.
    pub fn lease(&self, identity: &ConnectorIdentity) -> Result<PooledConnection<C>> {
        let inner = &self.inner;
        let started = Instant::now();
        // None when the wait time is too large to represent, meaning wait
        // indefinitely.
        let deadline = started.checked_add(inner.config.wait_time_for_resource);

        let acquired = {
            let mut state = inner.state.lock();
            loop {
                if state.shutdown {
                    return Err(ConnectorError::invalid_state(format!(
                        "Connection pool '{}' is shut down",
                        inner.name
                    )));
                }
                if let Some(acquired) = inner.try_acquire(&mut state, identity) {
                    break acquired;
                }
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    let waited = started.elapsed();
                    warn!(pool = %inner.name, %identity, waited_ms = waited.as_millis() as u64, "timed out waiting for connection");
                    return Err(ConnectorError::PoolTimeout {
                        identity: identity.to_string(),
                        waited,
                    });
                }
                state.waiting += 1;
                match deadline {
                    Some(deadline) => {
                        let _ = inner.available.wait_until(&mut state, deadline);
                    }
                    None => inner.available.wait(&mut state),
                }
                state.waiting -= 1;
            }
        };

        let (slot, handle_id) = match acquired {
            Acquired::Reused {
                slot,
                handle_id,
                last_validated,
            } => {
                if last_validated.elapsed() >= inner.config.resource_test_interval {
                    (slot, inner.validate_or_replace(slot, handle_id, identity)?)
                } else {
                    (slot, handle_id)
                }
            }
            Acquired::Create { slot } => (slot, inner.populate(slot, identity)?),
            Acquired::Evicted { slot, evicted } => {
                if let Some(conn) = evicted {
                    inner.manager.close(conn);
                }
                (slot, inner.populate(slot, identity)?)
            }
        };

        trace!(pool = %inner.name, %identity, slot, handle_id, "leased connection");

        Ok(PooledConnection {
            pool: inner.clone(),
            slot,
            handle_id,
            identity: identity.clone(),
            invalid: AtomicBool::new(false),
            released: false,
        })
    }

    /// Close every free connection and reject further leases. Leased
    /// connections are closed as they are released.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        let mut closing = Vec::new();
        {
            let mut state = inner.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            for (idx, slot) in state.slots.iter_mut().enumerate() {
                if matches!(slot, Some(occupied) if occupied.state == LeaseState::Free) {
                    *slot = None;
                    if let Some(conn) = inner.handles[idx].lock().take() {
                        closing.push(conn);
                    }
                }
            }
            inner.available.notify_all();
        }
        debug!(pool = %inner.name, closed = closing.len(), "pool shut down");
        for conn in closing {
            inner.manager.close(conn);
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        let mut stats = PoolStats {
            max: self.inner.config.max_pool_size,
            total: 0,
            free: 0,
            leased: 0,
            waiting: state.waiting,
        };
        for occupied in state.slots.iter().flatten() {
            stats.total += 1;
            match occupied.state {
                LeaseState::Free => stats.free += 1,
                LeaseState::Leased | LeaseState::Invalid => stats.leased += 1,
            }
        }
        stats
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let state = self.inner.state.lock();
        state
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, occupied)| {
                occupied.as_ref().map(|o| ConnectionInfo {
                    slot,
                    handle_id: o.handle_id,
                    identity: o.identity.clone(),
                    state: o.state,
                    created_at: o.created_at,
                    last_validated: o.last_validated_at,
                })
            })
            .collect()
    }
}

impl<C: Send + 'static> PoolInner<C> {
    /// Pick a slot for `identity` without blocking.
    ///
    /// Prefers the most recently used free connection in the bucket, then an
    /// empty slot, then evicting the least recently used free connection of
    /// another bucket.
    fn try_acquire(&self, state: &mut PoolState, identity: &ConnectorIdentity) -> Option<Acquired<C>> {
        let reuse = state
            .slots
            .iter()
            .enumerate()
            .filter_map(|(idx, s)| s.as_ref().map(|s| (idx, s)))
            .filter(|(_, s)| s.state == LeaseState::Free && &s.identity == identity)
            .max_by_key(|(_, s)| s.last_used)
            .map(|(idx, _)| idx);

        if let Some(slot) = reuse {
            let occupied = state.slots[slot].as_mut()?;
            occupied.state = LeaseState::Leased;
            occupied.last_used = Instant::now();
            return Some(Acquired::Reused {
                slot,
                handle_id: occupied.handle_id,
                last_validated: occupied.last_validated,
            });
        }

        if let Some(max) = self.config.max_per_identity {
            if state.bucket_size(identity) >= max {
                return None;
            }
        }

        let now = Instant::now();
        let reserve = |identity: &ConnectorIdentity| Occupied {
            identity: identity.clone(),
            state: LeaseState::Leased,
            handle_id: 0,
            created_at: Utc::now(),
            last_validated: now,
            last_validated_at: Utc::now(),
            last_used: now,
        };

        if state.total() < self.config.max_pool_size {
            let slot = state.slots.iter().position(|s| s.is_none())?;
            state.slots[slot] = Some(reserve(identity));
            return Some(Acquired::Create { slot });
        }

        let victim = state
            .slots
            .iter()
            .enumerate()
            .filter_map(|(idx, s)| s.as_ref().map(|s| (idx, s)))
            .filter(|(_, s)| s.state == LeaseState::Free)
            .min_by_key(|(_, s)| s.last_used)
            .map(|(idx, s)| (idx, s.identity.clone(), s.handle_id));

        let (slot, evicted_identity, evicted_handle) = victim?;
        debug!(pool = %self.name, slot, evicted = %evicted_identity, handle_id = evicted_handle, %identity, "evicting idle connection");
        let evicted = self.handles[slot].lock().take();
        state.slots[slot] = Some(reserve(identity));
        Some(Acquired::Evicted { slot, evicted })
    }

    /// Open a new handle into a reserved slot.
    fn populate(&self, slot: usize, identity: &ConnectorIdentity) -> Result<u64> {
        match self.manager.connect(identity) {
            Ok(conn) => {
                let handle_id = self.next_handle_id.fetch_add(1, Ordering::Relaxed);
                *self.handles[slot].lock() = Some(conn);
                let mut state = self.state.lock();
                if let Some(occupied) = state.slots[slot].as_mut() {
                    let now = Instant::now();
                    occupied.handle_id = handle_id;
                    occupied.created_at = Utc::now();
                    occupied.last_validated = now;
                    occupied.last_validated_at = Utc::now();
                    occupied.last_used = now;
                }
                debug!(pool = %self.name, %identity, slot, handle_id, "created connection");
                Ok(handle_id)
            }
            Err(e) => {
                debug!(pool = %self.name, %identity, slot, error = %e, "failed to create connection");
                self.vacate(slot);
                Err(e)
            }
        }
    }

    fn validate_or_replace(&self, slot: usize, handle_id: u64, identity: &ConnectorIdentity) -> Result<u64> {
        let discarded = {
            let mut handle = self.handles[slot].lock();
            let valid = match handle.as_mut() {
                Some(conn) => match self.manager.is_valid(conn) {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(pool = %self.name, %identity, slot, handle_id, error = %e, "discarding invalid connection");
                        false
                    }
                },
                None => false,
            };
            if valid { None } else { Some(handle.take()) }
        };

        match discarded {
            None => {
                let mut state = self.state.lock();
                if let Some(occupied) = state.slots[slot].as_mut() {
                    occupied.last_validated = Instant::now();
                    occupied.last_validated_at = Utc::now();
                }
                Ok(handle_id)
            }
            Some(conn) => {
                if let Some(conn) = conn {
                    self.manager.close(conn);
                }
                self.populate(slot, identity)
            }
        }
    }

    fn vacate(&self, slot: usize) {
        let mut state = self.state.lock();
        state.slots[slot] = None;
        self.available.notify_all();
    }

    fn release(&self, slot: usize, handle_id: u64, invalid: bool) {
        let broken = invalid || {
            let mut handle = self.handles[slot].lock();
            match handle.as_mut() {
                Some(conn) => self.manager.has_broken(conn),
                None => true,
            }
        };

        let closing = {
            let mut state = self.state.lock();
            let discard = broken || state.shutdown;
            let closing = if discard {
                state.slots[slot] = None;
                self.handles[slot].lock().take()
            } else {
                if let Some(occupied) = state.slots[slot].as_mut() {
                    occupied.state = LeaseState::Free;
                    occupied.last_used = Instant::now();
                }
                None
            };
            self.available.notify_all();
            closing
        };

        match closing {
            Some(conn) => {
                debug!(pool = %self.name, slot, handle_id, "discarded connection on release");
                self.manager.close(conn);
            }
            None => trace!(pool = %self.name, slot, handle_id, "released connection"),
        }
    }
}

/// A leased connection.
///
/// Released explicitly with [`PooledConnection::release`], or when dropped.
pub struct PooledConnection<C: Send + 'static> {
    pool: Arc<PoolInner<C>>,
    slot: usize,
    handle_id: u64,
    identity: ConnectorIdentity,
    invalid: AtomicBool,
    released: bool,
}

impl<C: Send + 'static> PooledConnection<C> {
    pub fn identity(&self) -> &ConnectorIdentity {
        &self.identity
    }

    /// Identifier of the underlying backend handle. Stable for the life of
    /// that handle across leases.
    pub fn handle_id(&self) -> u64 {
        self.handle_id
    }

    pub fn pool_name(&self) -> &str {
        &self.pool.name
    }

    /// Lock the backend handle.
    pub fn handle(&self) -> Result<MappedMutexGuard<'_, C>> {
        MutexGuard::try_map(self.pool.handles[self.slot].lock(), |h| h.as_mut()).map_err(|_| {
            ConnectorError::invalid_state(format!(
                "Connection {} in pool '{}' has no handle",
                self.handle_id, self.pool.name
            ))
        })
    }

    pub fn with_handle<R>(&self, f: impl FnOnce(&mut C) -> R) -> Result<R> {
        let mut handle = self.handle()?;
        Ok(f(&mut handle))
    }

    /// Mark the connection as unusable. It will be discarded on release.
    pub fn mark_invalid(&self) {
        if !self.invalid.swap(true, Ordering::SeqCst) {
            let mut state = self.pool.state.lock();
            if let Some(occupied) = state.slots[self.slot].as_mut() {
                occupied.state = LeaseState::Invalid;
            }
        }
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::SeqCst)
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.pool
            .release(self.slot, self.handle_id, self.invalid.load(Ordering::SeqCst));
    }
}

impl<C: Send + 'static> fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.pool.name)
            .field("slot", &self.slot)
            .field("handle_id", &self.handle_id)
            .field("identity", &self.identity)
            .field("invalid", &self.is_invalid())
            .finish()
    }
}

impl<C: Send + 'static> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        self.release_inner();
    }
}
