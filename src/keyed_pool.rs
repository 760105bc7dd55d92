//! A family of [`ConnectionPool`]s indexed by snapshot key (§4.2).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::connection::ManagedConnection;
use crate::ids::Tid;
use crate::pool::{ConnectionPool, ReleaseError};

/// Historical connections are pooled per snapshot key so that re-opening
/// the same point in time reuses a warm connection, while distinct
/// snapshots don't compete for the same slots.
pub struct KeyedConnectionPool<C: ManagedConnection> {
    size: usize,
    timeout: Option<Duration>,
    pools: HashMap<Tid, ConnectionPool<C>>,
}

impl<C: ManagedConnection> KeyedConnectionPool<C> {
    pub fn new(size: usize, timeout: Option<Duration>) -> Self {
        KeyedConnectionPool {
            size,
            timeout,
            pools: HashMap::new(),
        }
    }

    pub fn push(&mut self, c: Arc<C>, key: Tid) -> Result<(), ReleaseError> {
        let size = self.size;
        let timeout = self.timeout;
        let pool = self
            .pools
            .entry(key)
            .or_insert_with(|| ConnectionPool::new(size, timeout));
        pool.push(c)
    }

    pub fn repush(&mut self, c: Arc<C>, key: Tid) -> Result<(), ReleaseError> {
        if let Some(pool) = self.pools.get_mut(&key) {
            pool.repush(c)
        } else {
            Ok(())
        }
    }

    pub fn pop(&mut self, key: Tid) -> Option<Arc<C>> {
        self.pools.get_mut(&key).and_then(|pool| pool.pop())
    }

    pub fn reduce_size(&mut self) -> Result<(), ReleaseError> {
        for pool in self.pools.values_mut() {
            pool.reduce_size_public()?;
        }
        self.drop_empty();
        Ok(())
    }

    pub fn available_gc(&mut self) -> Result<(), ReleaseError> {
        for pool in self.pools.values_mut() {
            pool.available_gc()?;
        }
        self.drop_empty();
        Ok(())
    }

    /// Remove every sub-pool whose `all` set has emptied.
    fn drop_empty(&mut self) {
        self.pools.retain(|_, pool| pool.live_count() > 0);
    }

    pub fn map(&mut self, mut f: impl FnMut(&Arc<C>)) {
        for pool in self.pools.values_mut() {
            pool.map(&mut f);
        }
    }

    pub fn set_size(&mut self, size: usize) -> Result<(), ReleaseError> {
        self.size = size;
        for pool in self.pools.values_mut() {
            pool.set_size(size)?;
        }
        Ok(())
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<(), ReleaseError> {
        self.timeout = timeout;
        for pool in self.pools.values_mut() {
            pool.set_timeout(timeout)?;
        }
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Inspection view: the union of every sub-pool's `all` set, for tests.
    #[cfg(test)]
    pub fn test_all(&mut self) -> Vec<Arc<C>> {
        let mut result = Vec::new();
        for pool in self.pools.values_mut() {
            pool.map(|c| result.push(c.clone()));
        }
        result
    }

    /// Inspection view: the concatenation of every sub-pool's `available`
    /// sequence, for tests.
    #[cfg(test)]
    pub fn test_available(&self) -> Vec<Arc<C>> {
        let mut result = Vec::new();
        for pool in self.pools.values() {
            result.extend(pool.available_order());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestConnection;

    fn key(n: u8) -> Tid {
        Tid([0, 0, 0, 0, 0, 0, 0, n])
    }

    #[test]
    fn push_creates_subpool_lazily() {
        let mut kp: KeyedConnectionPool<TestConnection> = KeyedConnectionPool::new(2, None);
        let c = TestConnection::new(Some(key(1)));
        kp.push(c, key(1)).unwrap();
        assert_eq!(kp.test_all().len(), 1);
    }

    #[test]
    fn subpool_is_dropped_once_empty() {
        let mut kp: KeyedConnectionPool<TestConnection> = KeyedConnectionPool::new(1, None);
        let c = TestConnection::new(Some(key(1)));
        kp.push(c.clone(), key(1)).unwrap();
        drop(c);
        kp.pop(key(1)); // popped Arc immediately dropped too
        kp.available_gc().unwrap();
        assert_eq!(kp.pools.len(), 0);
    }

    #[test]
    fn distinct_keys_do_not_share_slots() {
        let mut kp: KeyedConnectionPool<TestConnection> = KeyedConnectionPool::new(1, None);
        kp.push(TestConnection::new(Some(key(1))), key(1)).unwrap();
        kp.push(TestConnection::new(Some(key(2))), key(2)).unwrap();
        assert_eq!(kp.test_available().len(), 2);
    }
}
