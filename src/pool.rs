//! A bounded-target stack of reusable connections keyed to a single
//! snapshot (or to no snapshot, for the live pool).
//!
//! Callers must hold the coordinator's lock around every call; this type
//! performs no locking of its own (§4.1).

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tracing::{error, warn};

use crate::connection::ManagedConnection;

/// Failure releasing a reaped connection's resources.
#[derive(Debug)]
pub struct ReleaseError(pub String);

impl fmt::Display for ReleaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to release connection resources: {}", self.0)
    }
}

impl std::error::Error for ReleaseError {}

/// A single-key stack of idle connections, plus a weak registry of every
/// connection this pool has ever admitted (§3, Pool state).
pub struct ConnectionPool<C: ManagedConnection> {
    size: usize,
    timeout: Option<Duration>,
    /// Every connection ever pushed, while still reachable. Entries are
    /// lazily pruned (never proactively removed on drop) whenever a pool
    /// operation walks this vector.
    all: Vec<Weak<C>>,
    /// The idle stack. Holds strong references: while idle, the pool is
    /// the connection's only owner.
    available: VecDeque<(Instant, Arc<C>)>,
}

impl<C: ManagedConnection> fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("size", &self.size)
            .field("timeout", &self.timeout)
            .field("all_len", &self.all.len())
            .field("available_len", &self.available.len())
            .finish()
    }
}

impl<C: ManagedConnection> ConnectionPool<C> {
    pub fn new(size: usize, timeout: Option<Duration>) -> Self {
        ConnectionPool {
            size,
            timeout,
            all: Vec::new(),
            available: VecDeque::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Drop registry entries whose connection is no longer reachable.
    fn prune(&mut self) {
        self.all.retain(|w| w.strong_count() > 0);
    }

    /// Number of connections still reachable in `all`, after pruning.
    pub fn live_count(&mut self) -> usize {
        self.prune();
        self.all.len()
    }

    /// Register a freshly created connection. `c` must not already be
    /// tracked by this pool.
    pub fn push(&mut self, c: Arc<C>) -> Result<(), ReleaseError> {
        self.reduce_size(true)?;
        self.all.push(Arc::downgrade(&c));
        self.insert_by_warmth(Instant::now(), c);

        self.prune();
        let n = self.all.len();
        let limit = self.size;
        if n > limit {
            if n > 2 * limit {
                error!(open_connections = n, pool_size = limit, "too many open connections");
            } else {
                warn!(open_connections = n, pool_size = limit, "pool has more open connections than pool_size");
            }
        }
        Ok(())
    }

    /// Return a previously popped connection to the idle stack. `c` must
    /// already be tracked by this pool (still present, weakly, in `all`)
    /// and must not currently be in `available`.
    pub fn repush(&mut self, c: Arc<C>) -> Result<(), ReleaseError> {
        self.reduce_size(true)?;
        self.insert_by_warmth(Instant::now(), c);
        Ok(())
    }

    /// Warmth-ordered insertion (§4.1): maintain a weak invariant that the
    /// trailing suffix of `available` is non-decreasing in
    /// `non_ghost_count`, so `pop` (which removes the back) tends to return
    /// the warmest idle connection.
    fn insert_by_warmth(&mut self, enqueued_at: Instant, c: Arc<C>) {
        let warmth = c.cache().non_ghost_count();
        let should_scan = self
            .available
            .back()
            .map(|(_, last)| last.cache().non_ghost_count() > warmth)
            .unwrap_or(false);

        if should_scan {
            let mut i = self.available.len() - 1;
            while i > 0 && self.available[i - 1].1.cache().non_ghost_count() > warmth {
                i -= 1;
            }
            self.available.insert(i, (enqueued_at, c));
        } else {
            self.available.push_back((enqueued_at, c));
        }
    }

    /// Pop the warmest idle connection (the back of the stack), or `None`
    /// if the pool has no idle connections. The popped connection remains
    /// weakly tracked in `all`.
    pub fn pop(&mut self) -> Option<Arc<C>> {
        self.available.pop_back().map(|(_, c)| c)
    }

    /// Bring the pool within its current size/timeout targets (public,
    /// non-strict form).
    pub fn reduce_size_public(&mut self) -> Result<(), ReleaseError> {
        self.reduce_size(false)
    }

    /// `target := size - (1 if strictly_less else 0)`; evict from the
    /// front (coldest/oldest) while over target or while the front entry
    /// has aged past `timeout`.
    fn reduce_size(&mut self, strictly_less: bool) -> Result<(), ReleaseError> {
        let target = if strictly_less {
            self.size.saturating_sub(1)
        } else {
            self.size
        };
        let now = Instant::now();

        loop {
            let over_target = self.available.len() > target;
            let stale_front = match (self.timeout, self.available.front()) {
                (Some(timeout), Some((t, _))) => now.saturating_duration_since(*t) > timeout,
                _ => false,
            };
            if !over_target && !stale_front {
                break;
            }
            let (_, c) = match self.available.pop_front() {
                Some(entry) => entry,
                None => break,
            };
            self.all.retain(|w| !matches!(w.upgrade(), Some(existing) if Arc::ptr_eq(&existing, &c)));
            c.release_resources().map_err(ReleaseError)?;
        }
        Ok(())
    }

    /// Reap every idle entry older than `timeout`; for every surviving
    /// idle entry, trigger an incremental cache GC pass.
    pub fn available_gc(&mut self) -> Result<(), ReleaseError> {
        let now = Instant::now();
        let timeout = match self.timeout {
            Some(t) => t,
            None => {
                // Effectively infinite: nothing times out, but incremental
                // GC still runs on every surviving entry.
                for (_, c) in self.available.iter() {
                    c.cache().incremental_gc();
                }
                return Ok(());
            }
        };

        let mut to_release = Vec::new();
        self.available.retain(|(t, c)| {
            if now.saturating_duration_since(*t) > timeout {
                to_release.push(c.clone());
                false
            } else {
                true
            }
        });

        for c in &to_release {
            self.all.retain(|w| !matches!(w.upgrade(), Some(existing) if Arc::ptr_eq(&existing, c)));
        }
        for c in to_release {
            c.release_resources().map_err(ReleaseError)?;
        }
        for (_, c) in self.available.iter() {
            c.cache().incremental_gc();
        }
        Ok(())
    }

    /// Apply `f` to every reachable connection this pool has ever admitted.
    pub fn map(&mut self, mut f: impl FnMut(&Arc<C>)) {
        self.prune();
        for w in &self.all {
            if let Some(c) = w.upgrade() {
                f(&c);
            }
        }
    }

    /// Reconfigure the size target; reduces immediately if more
    /// restrictive.
    pub fn set_size(&mut self, size: usize) -> Result<(), ReleaseError> {
        self.size = size;
        self.reduce_size(false)
    }

    /// Reconfigure the idle timeout; reduces immediately if more
    /// restrictive (smaller, or newly finite where it was infinite).
    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<(), ReleaseError> {
        let more_restrictive = match (timeout, self.timeout) {
            (Some(new), Some(old)) => new < old,
            (Some(_), None) => true,
            _ => false,
        };
        self.timeout = timeout;
        if more_restrictive {
            self.reduce_size(false)
        } else {
            Ok(())
        }
    }

    /// Test/debug view: the idle stack's enqueue order, oldest first.
    #[cfg(test)]
    pub fn available_order(&self) -> Vec<Arc<C>> {
        self.available.iter().map(|(_, c)| c.clone()).collect()
    }

    #[cfg(test)]
    pub fn available_len(&self) -> usize {
        self.available.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestConnection;
    use std::thread::sleep;

    fn conn(warmth: usize) -> Arc<TestConnection> {
        let c = TestConnection::new(None);
        c.cache().set_non_ghost_count(warmth);
        c
    }

    #[test]
    fn push_then_pop_returns_same_connection_when_empty() {
        let mut pool: ConnectionPool<TestConnection> = ConnectionPool::new(3, None);
        let c = conn(1);
        pool.push(c.clone()).unwrap();
        let popped = pool.pop().unwrap();
        assert!(Arc::ptr_eq(&c, &popped));
    }

    #[test]
    fn warmth_order_suffix_is_non_decreasing() {
        let mut pool: ConnectionPool<TestConnection> = ConnectionPool::new(10, None);
        for w in [50, 10, 200] {
            pool.push(conn(w)).unwrap();
        }
        let order: Vec<usize> = pool
            .available_order()
            .iter()
            .map(|c| c.cache().non_ghost_count())
            .collect();
        // Warmest (200) should be last, so pop() returns it first.
        assert_eq!(*order.last().unwrap(), 200);
        let popped = pool.pop().unwrap();
        assert_eq!(popped.cache().non_ghost_count(), 200);
    }

    #[test]
    fn capacity_over_target_does_not_reject_pushes() {
        let mut pool: ConnectionPool<TestConnection> = ConnectionPool::new(2, None);
        for _ in 0..4 {
            pool.push(conn(1)).unwrap();
        }
        assert_eq!(pool.available_len(), 2);
    }

    #[test]
    fn successive_pops_return_distinct_connections() {
        let mut pool: ConnectionPool<TestConnection> = ConnectionPool::new(5, None);
        let a = conn(1);
        let b = conn(2);
        pool.push(a.clone()).unwrap();
        pool.push(b.clone()).unwrap();
        let first = pool.pop().unwrap();
        let second = pool.pop();
        match second {
            Some(c) => assert!(!Arc::ptr_eq(&first, &c)),
            None => {}
        }
    }

    #[test]
    fn available_gc_reaps_after_timeout() {
        let mut pool: ConnectionPool<TestConnection> =
            ConnectionPool::new(5, Some(Duration::from_millis(20)));
        let c = conn(1);
        pool.push(c.clone()).unwrap();
        pool.available_gc().unwrap();
        assert_eq!(pool.available_len(), 1);

        sleep(Duration::from_millis(40));
        pool.available_gc().unwrap();
        assert_eq!(pool.available_len(), 0);
        assert!(c.release_called());
    }

    #[test]
    fn set_size_smaller_reduces_immediately() {
        let mut pool: ConnectionPool<TestConnection> = ConnectionPool::new(5, None);
        for _ in 0..5 {
            pool.push(conn(1)).unwrap();
        }
        pool.set_size(2).unwrap();
        assert!(pool.available_len() <= 2);
    }

    #[test]
    fn set_timeout_smaller_evicts_stale_entries() {
        let mut pool: ConnectionPool<TestConnection> =
            ConnectionPool::new(5, Some(Duration::from_secs(100)));
        pool.push(conn(1)).unwrap();
        sleep(Duration::from_millis(30));
        pool.set_timeout(Some(Duration::from_millis(5))).unwrap();
        assert_eq!(pool.available_len(), 0);
    }
}
