//! The `Database` coordinator (§4.3): owns the pools, fans out
//! invalidations, reconfigures caches atomically, bootstraps the root
//! object, and exposes the session lifecycle.

use std::collections::{HashSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::cache::ObjectCache;
use crate::connection::{ConnectionFactory, ManagedConnection, TransactionManager};
use crate::error::{CoreError, CoreResult};
use crate::ids::{At, Oid, Tid, ZERO_OID};
use crate::keyed_pool::KeyedConnectionPool;
use crate::pool::ConnectionPool;
use crate::storage::{ReferencesFn, Storage};
use crate::undo::{Invalidator, TransactionalUndo};

/// Tunable parameters (§6). Carries `serde` (de)serialization so an
/// embedding application can load it from its own configuration source;
/// loading it from a file/env is out of scope for this crate.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub pool_size: usize,
    pub pool_timeout: Option<Duration>,
    pub cache_size: usize,
    pub cache_size_bytes: usize,
    pub historical_pool_size: usize,
    pub historical_cache_size: usize,
    pub historical_cache_size_bytes: usize,
    pub historical_timeout: Option<Duration>,
    pub database_name: String,
    pub xrefs: bool,
    pub large_record_size: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            pool_size: 7,
            pool_timeout: None,
            cache_size: 400,
            cache_size_bytes: 0,
            historical_pool_size: 3,
            historical_cache_size: 1000,
            historical_cache_size_bytes: 0,
            historical_timeout: Some(Duration::from_secs(300)),
            database_name: "unnamed".to_string(),
            xrefs: true,
            large_record_size: 16 * 1024 * 1024,
        }
    }
}

/// Notified when a connection is returned to the pool. External collaborator
/// (§1); the activity monitor's own accounting is out of scope.
pub trait ActivityMonitor<C: ManagedConnection>: Send + Sync {
    fn closed_connection(&self, connection: &Arc<C>);
}

/// Produces the bootstrap pickle written at [`ZERO_OID`] when a storage is
/// empty. The real object-graph serializer is out of scope (§1); this is
/// the injected callback the source project describes.
pub trait RootSerializer: Send + Sync {
    fn empty_root_pickle(&self) -> Vec<u8>;
}

/// A minimal stand-in matching the documented bootstrap format (§6): a
/// two-record stream of `(class_reference, None)` followed by
/// `object_state`. Embedding applications with a real pickler should
/// provide their own [`RootSerializer`].
#[derive(Default)]
pub struct PlaceholderRootSerializer;

impl RootSerializer for PlaceholderRootSerializer {
    fn empty_root_pickle(&self) -> Vec<u8> {
        const CLASS_REF: &[u8] = b"persistent.mapping.PersistentMapping";
        let mut out = Vec::with_capacity(CLASS_REF.len() + 16);
        out.extend_from_slice(&(CLASS_REF.len() as u32).to_be_bytes());
        out.extend_from_slice(CLASS_REF);
        // `None` companion value for the first record, then an empty
        // object_state record.
        out.extend_from_slice(&0u32.to_be_bytes());
        out
    }
}

/// Shared name-reservation registry for a multi-database group (§4.3).
pub type DatabaseRegistry = Arc<StdMutex<HashSet<String>>>;

struct DatabaseInner<C: ManagedConnection> {
    pool: ConnectionPool<C>,
    historical_pool: KeyedConnectionPool<C>,
    cache_size: usize,
    cache_size_bytes: usize,
    historical_cache_size: usize,
    historical_cache_size_bytes: usize,
    activity_monitor: Option<Arc<dyn ActivityMonitor<C>>>,
    closed: bool,
}

/// Per-class histogram entry returned by [`Database::cache_detail`].
pub type CacheDetail = Vec<(String, usize)>;

/// A single connection's debug summary, returned by
/// [`Database::connection_debug_info`].
#[derive(Clone, Debug)]
pub struct ConnectionDebugInfo {
    pub opened_seconds_ago: Option<f64>,
    pub before: Option<Tid>,
    pub cache_len: usize,
}

/// The coordination core: owns the live pool and the keyed historical pool
/// for one storage, and routes the session lifecycle.
pub struct Database<F, S>
where
    F: ConnectionFactory<Error = S::Error>,
    S: Storage,
{
    inner: StdMutex<DatabaseInner<F::Connection>>,
    storage: Arc<S>,
    factory: F,
    database_name: String,
    xrefs: bool,
    large_record_size: usize,
    registry: DatabaseRegistry,
    references: ReferencesFn,
}

impl<F, S> Database<F, S>
where
    F: ConnectionFactory<Error = S::Error>,
    S: Storage,
{
    /// Construct a coordinator over `storage`, bootstrapping the root
    /// object if the storage is empty.
    ///
    /// `registry` is the shared `{name -> Database}` membership set for a
    /// multi-database group; pass a fresh, empty one to start a new group.
    /// Registration fails with `CoreError::Argument` if `config.database_name`
    /// is already present.
    ///
    /// `references` is the callable `pack` forwards to the storage so it
    /// can walk the object graph reachable from the root; the object-graph
    /// pickler itself is out of scope (§1), so embedders supply this.
    pub async fn new(
        storage: Arc<S>,
        factory: F,
        config: DatabaseConfig,
        root_serializer: &dyn RootSerializer,
        registry: DatabaseRegistry,
        references: ReferencesFn,
    ) -> CoreResult<Arc<Self>, S::Error> {
        if !storage.supports_vote() && !storage.is_read_only() {
            warn!(
                storage = %storage.get_name(),
                "storage has no tpc_vote phase; treating vote as a no-op"
            );
        }

        Self::bootstrap_root(&storage, root_serializer).await?;

        {
            let mut names = registry.lock().unwrap();
            if !names.insert(config.database_name.clone()) {
                return Err(CoreError::argument(format!(
                    "database_name {:?} already in databases",
                    config.database_name
                )));
            }
        }

        info!(database = %config.database_name, storage = %storage.get_name(), "database opened");

        let inner = DatabaseInner {
            pool: ConnectionPool::new(config.pool_size, config.pool_timeout),
            historical_pool: KeyedConnectionPool::new(
                config.historical_pool_size,
                config.historical_timeout,
            ),
            cache_size: config.cache_size,
            cache_size_bytes: config.cache_size_bytes,
            historical_cache_size: config.historical_cache_size,
            historical_cache_size_bytes: config.historical_cache_size_bytes,
            activity_monitor: None,
            closed: false,
        };

        Ok(Arc::new(Database {
            inner: StdMutex::new(inner),
            storage,
            factory,
            database_name: config.database_name,
            xrefs: config.xrefs,
            large_record_size: config.large_record_size,
            registry,
            references,
        }))
    }

    async fn bootstrap_root(
        storage: &Arc<S>,
        root_serializer: &dyn RootSerializer,
    ) -> CoreResult<(), S::Error> {
        if storage.load_root().await.is_ok() {
            return Ok(());
        }
        let txn = S::Txn::default();
        storage.tpc_begin(&txn).await.map_err(CoreError::Storage)?;
        storage
            .store_root(root_serializer.empty_root_pickle(), &txn)
            .await
            .map_err(CoreError::Storage)?;
        storage.tpc_vote(&txn).await.map_err(CoreError::Storage)?;
        storage.tpc_finish(&txn).await.map_err(CoreError::Storage)?;
        info!("bootstrapped empty database root");
        Ok(())
    }

    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    pub fn xrefs(&self) -> bool {
        self.xrefs
    }

    pub fn large_record_size(&self) -> usize {
        self.large_record_size
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn set_activity_monitor(&self, monitor: Arc<dyn ActivityMonitor<F::Connection>>) {
        self.inner.lock().unwrap().activity_monitor = Some(monitor);
    }

    pub fn activity_monitor(&self) -> Option<Arc<dyn ActivityMonitor<F::Connection>>> {
        self.inner.lock().unwrap().activity_monitor.clone()
    }

    /// Return a connection for application use (§4.3). Exactly one of
    /// `at`/`before` may be given; both absent means "live".
    pub async fn open(
        self: &Arc<Self>,
        txn_manager: Arc<dyn TransactionManager>,
        at: Option<At>,
        before: Option<At>,
    ) -> CoreResult<Arc<F::Connection>, S::Error> {
        let before = crate::ids::normalize(at, before)
            .map_err(|_| CoreError::argument("can only pass zero or one of `at` and `before`"))?;

        if let Some(before) = before {
            if before > self.storage.last_transaction() {
                return Err(CoreError::argument(
                    "cannot open a historical connection in the future",
                ));
            }
        }

        let existing = {
            let mut inner = self.inner.lock().unwrap();
            match before {
                Some(key) => inner.historical_pool.pop(key),
                None => inner.pool.pop(),
            }
        };

        let connection = match existing {
            Some(c) => c,
            None => {
                let (cache_size, cache_size_bytes) = {
                    let inner = self.inner.lock().unwrap();
                    match before {
                        Some(_) => (inner.historical_cache_size, inner.historical_cache_size_bytes),
                        None => (inner.cache_size, inner.cache_size_bytes),
                    }
                };

                // Construct outside the lock: connection creation may do
                // real I/O and must not block other pool operations (§5).
                let fresh = self
                    .factory
                    .connect(before, cache_size, cache_size_bytes)
                    .await
                    .map_err(CoreError::Storage)?;

                let mut inner = self.inner.lock().unwrap();
                match before {
                    Some(key) => inner
                        .historical_pool
                        .push(fresh, key)
                        .map_err(|e| CoreError::Release(e.0))?,
                    None => inner.pool.push(fresh).map_err(|e| CoreError::Release(e.0))?,
                }
                let popped = match before {
                    Some(key) => inner.historical_pool.pop(key),
                    None => inner.pool.pop(),
                };
                popped.expect("a connection just pushed must be poppable")
            }
        };

        connection.open(txn_manager);

        {
            let mut inner = self.inner.lock().unwrap();
            inner
                .pool
                .available_gc()
                .map_err(|e| CoreError::Release(e.0))?;
            inner
                .historical_pool
                .available_gc()
                .map_err(|e| CoreError::Release(e.0))?;
        }

        Ok(connection)
    }

    /// Return a connection to its pool. Called by the connection itself on
    /// close (§4.3).
    pub fn return_connection(&self, connection: Arc<F::Connection>) {
        let mut inner = self.inner.lock().unwrap();
        connection.set_opened(None);
        if let Some(am) = inner.activity_monitor.clone() {
            am.closed_connection(&connection);
        }
        let result = match connection.before() {
            Some(key) => inner.historical_pool.repush(connection, key),
            None => inner.pool.repush(connection),
        };
        if let Err(e) = result {
            warn!(error = %e, "failed to release resources while returning a connection to the pool");
        }
    }

    fn connection_map(&self, mut f: impl FnMut(&Arc<F::Connection>)) {
        let mut inner = self.inner.lock().unwrap();
        inner.pool.map(&mut f);
        inner.historical_pool.map(&mut f);
    }

    /// Broadcast `invalidate(tid, oids)` to every tracked connection except
    /// `committer` (§4.3).
    pub fn invalidate(&self, tid: Tid, oids: HashSet<Oid>, committer: Option<&Arc<F::Connection>>) {
        self.connection_map(|c| {
            if let Some(cm) = committer {
                if Arc::ptr_eq(cm, c) {
                    return;
                }
            }
            c.invalidate(tid, &oids);
        });
    }

    pub fn invalidate_cache(&self) {
        self.connection_map(|c| c.invalidate_cache());
    }

    /// Idempotent; the second and subsequent calls are a no-op (§4.3).
    pub async fn close(&self) -> CoreResult<(), S::Error> {
        let first_err = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Ok(());
            }
            inner.closed = true;

            let mut first_err: Option<String> = None;
            let mut neuter = |c: &Arc<F::Connection>| {
                if let Some(tm) = c.transaction_manager() {
                    tm.abort();
                }
                c.mark_closed_by_database();
                if let Err(e) = c.release_resources() {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            };
            inner.pool.map(&mut neuter);
            inner.historical_pool.map(&mut neuter);
            first_err
        };

        self.storage.close().await.map_err(CoreError::Storage)?;
        self.registry.lock().unwrap().remove(&self.database_name);

        if let Some(e) = first_err {
            return Err(CoreError::Release(e));
        }
        Ok(())
    }

    pub fn set_cache_size(&self, size: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.cache_size = size;
        inner.pool.map(|c| c.cache().set_size(size));
    }

    pub fn set_cache_size_bytes(&self, size_bytes: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.cache_size_bytes = size_bytes;
        inner.pool.map(|c| c.cache().set_size_bytes(size_bytes));
    }

    pub fn set_historical_cache_size(&self, size: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.historical_cache_size = size;
        inner.historical_pool.map(|c| c.cache().set_size(size));
    }

    pub fn set_historical_cache_size_bytes(&self, size_bytes: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.historical_cache_size_bytes = size_bytes;
        inner
            .historical_pool
            .map(|c| c.cache().set_size_bytes(size_bytes));
    }

    pub fn set_pool_size(&self, size: usize) -> CoreResult<(), S::Error> {
        self.inner
            .lock()
            .unwrap()
            .pool
            .set_size(size)
            .map_err(|e| CoreError::Release(e.0))
    }

    pub fn set_historical_pool_size(&self, size: usize) -> CoreResult<(), S::Error> {
        self.inner
            .lock()
            .unwrap()
            .historical_pool
            .set_size(size)
            .map_err(|e| CoreError::Release(e.0))
    }

    pub fn set_historical_timeout(&self, timeout: Option<Duration>) -> CoreResult<(), S::Error> {
        self.inner
            .lock()
            .unwrap()
            .historical_pool
            .set_timeout(timeout)
            .map_err(|e| CoreError::Release(e.0))
    }

    pub fn get_pool_size(&self) -> usize {
        self.inner.lock().unwrap().pool.size()
    }

    pub fn get_historical_pool_size(&self) -> usize {
        self.inner.lock().unwrap().historical_pool.size()
    }

    pub fn get_historical_timeout(&self) -> Option<Duration> {
        self.inner.lock().unwrap().historical_pool.timeout()
    }

    /// Per-class histogram of cached objects, across all pools (§4.3).
    pub fn cache_detail(&self) -> CacheDetail {
        let mut detail: HashMap<String, usize> = HashMap::new();
        self.connection_map(|c| {
            for (_, class_name) in c.cache().class_histogram_entries() {
                *detail.entry(class_name).or_insert(0) += 1;
            }
        });
        let mut detail: Vec<(String, usize)> = detail.into_iter().collect();
        detail.sort();
        detail
    }

    /// Per-object cache detail, across all pools (§4.3).
    pub fn cache_extreme_detail(&self) -> Vec<crate::cache::CachedObjectInfo> {
        let mut detail = Vec::new();
        self.connection_map(|c| detail.extend(c.cache().extreme_detail()));
        detail
    }

    pub fn cache_full_sweep(&self) {
        self.connection_map(|c| c.cache().full_sweep());
    }

    pub fn cache_minimize(&self) {
        self.connection_map(|c| c.cache().minimize());
    }

    /// Sum of `non_ghost_count` across every tracked connection.
    pub fn cache_size(&self) -> usize {
        let mut total = 0usize;
        self.connection_map(|c| total += c.cache().non_ghost_count());
        total
    }

    pub fn cache_last_gc_time(&self) -> Option<std::time::Instant> {
        let mut latest: Option<std::time::Instant> = None;
        self.connection_map(|c| {
            let t = c.cache().last_gc_time();
            latest = Some(latest.map_or(t, |l| l.max(t)));
        });
        latest
    }

    pub fn connection_debug_info(&self) -> Vec<ConnectionDebugInfo> {
        let mut result = Vec::new();
        let now = std::time::Instant::now();
        self.connection_map(|c| {
            result.push(ConnectionDebugInfo {
                opened_seconds_ago: c
                    .opened()
                    .map(|t| now.saturating_duration_since(t).as_secs_f64()),
                before: c.before(),
                cache_len: c.cache().len(),
            });
        });
        result
    }

    /// `(t.unwrap_or(now) - days * 86400)`, forwarded to the storage along
    /// with the reference-extraction callable supplied at construction
    /// (§4.3).
    pub async fn pack(&self, t: Option<i64>, days: i64, now_unix: i64) -> CoreResult<(), S::Error> {
        let pack_time = t.unwrap_or(now_unix) - days * 86400;
        self.storage.pack(pack_time, &self.references).await.map_err(|e| {
            error!(error = %e, "pack failed");
            CoreError::Storage(e)
        })
    }

    /// Undoable transaction log, most recent first. Empty if the storage
    /// does not support undo (`DB.py:899`).
    pub async fn undo_log(&self, first: usize, last: usize) -> Vec<crate::storage::TransactionRecord> {
        if !self.storage.supports_undo() {
            return Vec::new();
        }
        self.storage.undo_log(first, last).await
    }

    /// Undo information, most recent first. Empty if the storage does not
    /// support undo (`DB.py:904`).
    pub async fn undo_info(&self, first: usize, last: usize) -> Vec<crate::storage::TransactionRecord> {
        if !self.storage.supports_undo() {
            return Vec::new();
        }
        self.storage.undo_info(first, last).await
    }

    /// Revision history of a single object (`DB.py:889`).
    pub async fn history(&self, oid: Oid, size: usize) -> Vec<crate::storage::TransactionRecord> {
        self.storage.history(oid, size).await
    }

    /// Build a joinable undo data manager for `tids`. The caller is
    /// responsible for joining it to the enclosing transaction (the
    /// transaction manager itself is out of scope, §1).
    pub fn start_undo(
        self: &Arc<Self>,
        tids: Vec<Tid>,
    ) -> CoreResult<TransactionalUndo<S>, S::Error> {
        if !self.storage.supports_undo() {
            return Err(CoreError::not_supported("storage does not support undo"));
        }
        Ok(TransactionalUndo::new(
            self.storage.clone(),
            self.clone() as Arc<dyn Invalidator>,
            tids,
        ))
    }
}

impl<F, S> Invalidator for Database<F, S>
where
    F: ConnectionFactory<Error = S::Error>,
    S: Storage,
{
    fn invalidate(&self, tid: Tid, oids: HashSet<Oid>) {
        Database::invalidate(self, tid, oids, None)
    }
}

pub const ROOT_OID: Oid = ZERO_OID;
