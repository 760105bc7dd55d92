//! In-memory fixtures shared by unit and integration tests: a mock cache,
//! connection, connection factory and storage. Not part of the public API.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;

use crate::cache::{CachedObjectInfo, ObjectCache};
use crate::connection::{ConnectionFactory, ConnectionState, ManagedConnection, TransactionManager};
use crate::ids::{Oid, Tid};
use crate::storage::Storage;

#[derive(Debug, thiserror::Error)]
#[error("test storage error: {0}")]
pub struct TestStorageError(pub String);

#[derive(Debug, Default)]
pub struct TestCache {
    non_ghost_count: AtomicUsize,
    size: AtomicUsize,
    size_bytes: AtomicUsize,
    full_sweeps: AtomicUsize,
    minimizes: AtomicUsize,
    gc_passes: AtomicUsize,
}

impl TestCache {
    pub fn set_non_ghost_count(&self, n: usize) {
        self.non_ghost_count.store(n, Ordering::SeqCst);
    }

    pub fn full_sweep_count(&self) -> usize {
        self.full_sweeps.load(Ordering::SeqCst)
    }

    pub fn minimize_count(&self) -> usize {
        self.minimizes.load(Ordering::SeqCst)
    }

    pub fn gc_pass_count(&self) -> usize {
        self.gc_passes.load(Ordering::SeqCst)
    }
}

impl ObjectCache for TestCache {
    fn non_ghost_count(&self) -> usize {
        self.non_ghost_count.load(Ordering::SeqCst)
    }

    fn len(&self) -> usize {
        self.non_ghost_count()
    }

    fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    fn set_size(&self, size: usize) {
        self.size.store(size, Ordering::SeqCst);
    }

    fn size_bytes(&self) -> usize {
        self.size_bytes.load(Ordering::SeqCst)
    }

    fn set_size_bytes(&self, size_bytes: usize) {
        self.size_bytes.store(size_bytes, Ordering::SeqCst);
    }

    fn full_sweep(&self) {
        self.full_sweeps.fetch_add(1, Ordering::SeqCst);
    }

    fn minimize(&self) {
        self.minimizes.fetch_add(1, Ordering::SeqCst);
    }

    fn last_gc_time(&self) -> Instant {
        Instant::now()
    }

    fn incremental_gc(&self) {
        self.gc_passes.fetch_add(1, Ordering::SeqCst);
    }

    fn class_histogram_entries(&self) -> Vec<(Oid, String)> {
        Vec::new()
    }

    fn extreme_detail(&self) -> Vec<CachedObjectInfo> {
        Vec::new()
    }
}

#[derive(Debug)]
pub struct TestConnection {
    cache: TestCache,
    before: Option<Tid>,
    state: ConnectionState,
    released: AtomicBool,
    invalidations: Mutex<Vec<(Tid, Vec<Oid>)>>,
    invalidate_cache_calls: AtomicUsize,
}

impl TestConnection {
    pub fn new(before: Option<Tid>) -> Arc<Self> {
        Arc::new(TestConnection {
            cache: TestCache::default(),
            before,
            state: ConnectionState::default(),
            released: AtomicBool::new(false),
            invalidations: Mutex::new(Vec::new()),
            invalidate_cache_calls: AtomicUsize::new(0),
        })
    }

    pub fn release_called(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub fn invalidations(&self) -> Vec<(Tid, Vec<Oid>)> {
        self.invalidations.lock().unwrap().clone()
    }

    pub fn invalidate_cache_call_count(&self) -> usize {
        self.invalidate_cache_calls.load(Ordering::SeqCst)
    }
}

impl ManagedConnection for TestConnection {
    type Cache = TestCache;

    fn cache(&self) -> &TestCache {
        &self.cache
    }

    fn before(&self) -> Option<Tid> {
        self.before
    }

    fn invalidate(&self, tid: Tid, oids: &HashSet<Oid>) {
        let mut oids: Vec<Oid> = oids.iter().copied().collect();
        oids.sort();
        self.invalidations.lock().unwrap().push((tid, oids));
    }

    fn invalidate_cache(&self) {
        self.invalidate_cache_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn release_resources(&self) -> Result<(), String> {
        self.released.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn open(&self, txn_manager: Arc<dyn TransactionManager>) {
        self.state.bind(txn_manager);
        self.state.set_opened(Some(Instant::now()));
    }

    fn transaction_manager(&self) -> Option<Arc<dyn TransactionManager>> {
        self.state.transaction_manager()
    }

    fn opened(&self) -> Option<Instant> {
        self.state.opened()
    }

    fn set_opened(&self, at: Option<Instant>) {
        self.state.set_opened(at);
    }

    fn closed_by_database(&self) -> bool {
        self.state.closed_by_database()
    }

    fn mark_closed_by_database(&self) {
        self.state.mark_closed_by_database();
    }
}

pub struct TestConnectionFactory {
    pub cache_size_seen: Mutex<Vec<usize>>,
}

impl Default for TestConnectionFactory {
    fn default() -> Self {
        TestConnectionFactory {
            cache_size_seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ConnectionFactory for TestConnectionFactory {
    type Connection = TestConnection;
    type Error = TestStorageError;

    async fn connect(
        &self,
        before: Option<Tid>,
        cache_size: usize,
        _cache_size_bytes: usize,
    ) -> Result<Arc<TestConnection>, TestStorageError> {
        self.cache_size_seen.lock().unwrap().push(cache_size);
        Ok(TestConnection::new(before))
    }
}

/// An in-memory storage fixture: tracks the root object, the last
/// transaction id, and a log of undo calls, enough to drive the bootstrap
/// and undo test scenarios.
pub struct TestStorage {
    inner: Mutex<TestStorageInner>,
}

struct TestStorageInner {
    objects: std::collections::HashMap<Oid, Vec<u8>>,
    last_tid: Tid,
    next_tid: u64,
    next_oid: u64,
    read_only: bool,
    supports_undo: bool,
    undo_log: Vec<Tid>,
    closed: bool,
}

impl TestStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(TestStorage {
            inner: Mutex::new(TestStorageInner {
                objects: std::collections::HashMap::new(),
                last_tid: Tid::from_raw([0; 8]),
                next_tid: 1,
                next_oid: 1,
                read_only: false,
                supports_undo: true,
                undo_log: Vec::new(),
                closed: false,
            }),
        })
    }

    pub fn last_tid(&self) -> Tid {
        self.inner.lock().unwrap().last_tid
    }

    pub fn undo_calls(&self) -> Vec<Tid> {
        self.inner.lock().unwrap().undo_log.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    pub fn set_supports_undo(&self, v: bool) {
        self.inner.lock().unwrap().supports_undo = v;
    }
}

#[async_trait]
impl Storage for TestStorage {
    type Error = TestStorageError;
    type Txn = ();

    async fn load_root(&self) -> Result<Vec<u8>, Self::Error> {
        let inner = self.inner.lock().unwrap();
        inner
            .objects
            .get(&crate::ids::ZERO_OID)
            .cloned()
            .ok_or_else(|| TestStorageError("not found".into()))
    }

    async fn tpc_begin(&self, _txn: &Self::Txn) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn store_root(&self, pickle: Vec<u8>, _txn: &Self::Txn) -> Result<(), Self::Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.objects.insert(crate::ids::ZERO_OID, pickle);
        Ok(())
    }

    async fn tpc_vote(&self, _txn: &Self::Txn) -> Result<Vec<Oid>, Self::Error> {
        Ok(Vec::new())
    }

    async fn tpc_finish(&self, _txn: &Self::Txn) -> Result<Tid, Self::Error> {
        let mut inner = self.inner.lock().unwrap();
        let tid = Tid::from_raw(inner.next_tid.to_be_bytes());
        inner.next_tid += 1;
        inner.last_tid = tid;
        Ok(tid)
    }

    async fn tpc_abort(&self, _txn: &Self::Txn) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn undo(&self, tid: Tid, _txn: &Self::Txn) -> Result<Option<Vec<Oid>>, Self::Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.undo_log.push(tid);
        Ok(Some(vec![Oid::from(u64::from_be_bytes(tid.0))]))
    }

    async fn pack(
        &self,
        _t: i64,
        _references: &crate::storage::ReferencesFn,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn close(&self) -> Result<(), Self::Error> {
        self.inner.lock().unwrap().closed = true;
        Ok(())
    }

    fn last_transaction(&self) -> Tid {
        self.inner.lock().unwrap().last_tid
    }

    fn get_name(&self) -> String {
        "test-storage".to_string()
    }

    fn get_size(&self) -> usize {
        self.inner.lock().unwrap().objects.len()
    }

    fn is_read_only(&self) -> bool {
        self.inner.lock().unwrap().read_only
    }

    fn new_oid(&self) -> Oid {
        let mut inner = self.inner.lock().unwrap();
        let oid = Oid::from(inner.next_oid);
        inner.next_oid += 1;
        oid
    }

    fn supports_undo(&self) -> bool {
        self.inner.lock().unwrap().supports_undo
    }

    fn supports_vote(&self) -> bool {
        true
    }

    fn sort_key(&self) -> String {
        "test-storage".to_string()
    }
}
