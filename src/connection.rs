//! The `Connection` contract the coordination core depends on.
//!
//! The Connection's own per-object cache, pickling, and loader are out of
//! scope (§1): this module only specifies the lifecycle hooks the
//! coordinator calls on it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;

use crate::cache::ObjectCache;
use crate::ids::{Oid, Tid};

/// A transaction manager, external to this core: it sequences commit/abort
/// of the joined data managers. The core only needs to force an abort (on
/// database close) and to observe whether one has been bound.
pub trait TransactionManager: Send + Sync {
    /// Force-abort the current transaction, if any. Called by
    /// `Database::close` on every live connection's transaction manager.
    fn abort(&self);
}

/// A connection: an opaque application session handle.
///
/// Implementations own a [`ObjectCache`], and respond to the lifecycle hooks
/// the coordinator drives (`invalidate`, `open`, `release_resources`, ...).
/// The core manages connections behind `Arc<C>`; `all` registries hold
/// `Weak<C>` (see [`crate::pool`]).
pub trait ManagedConnection: Send + Sync + 'static {
    type Cache: ObjectCache;

    /// The connection's object cache.
    fn cache(&self) -> &Self::Cache;

    /// `None` for a live (writable) connection, `Some(key)` for a
    /// historical (read-only, point-in-time) connection.
    fn before(&self) -> Option<Tid>;

    /// Called once per commit, for every tracked connection except the
    /// committer.
    fn invalidate(&self, tid: Tid, oids: &HashSet<Oid>);

    /// Invalidate the entire cache unconditionally (used by
    /// `Database::invalidate_cache`).
    fn invalidate_cache(&self);

    /// Release any resources held by this connection. Called exactly once,
    /// when the connection is reaped from a pool or the database closes.
    fn release_resources(&self) -> Result<(), String>;

    /// Bind (or rebind) this connection's transaction manager and mark it
    /// open for use. Called by `Database::open` before handing the
    /// connection to the caller.
    fn open(&self, txn_manager: Arc<dyn TransactionManager>);

    /// The transaction manager bound by the most recent `open`, if any.
    fn transaction_manager(&self) -> Option<Arc<dyn TransactionManager>>;

    /// Wall time at which this connection was last handed out by `open`,
    /// or `None` while idle.
    fn opened(&self) -> Option<Instant>;
    fn set_opened(&self, at: Option<Instant>);

    /// Whether the owning database has been closed and neutered this
    /// connection's close/after-completion hooks (§9, dynamic method
    /// rebinding). Once set, `close`/`after_completion` on the connection
    /// must short-circuit.
    fn closed_by_database(&self) -> bool;
    fn mark_closed_by_database(&self);
}

/// Produces new connections on demand, analogous to `bb8::ManageConnection`
/// but parameterized by the cache-size settings and `before` binding the
/// coordinator computes for each pool.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: ManagedConnection;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Create a fresh connection bound to `before` (`None` for live), with
    /// the given cache-size targets.
    async fn connect(
        &self,
        before: Option<Tid>,
        cache_size: usize,
        cache_size_bytes: usize,
    ) -> Result<Arc<Self::Connection>, Self::Error>;
}

/// A minimal, ready-to-use [`TransactionManager`] for tests and simple
/// embeddings: tracks whether `abort` has been called.
#[derive(Debug, Default)]
pub struct NullTransactionManager {
    aborted: AtomicBool,
}

impl NullTransactionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn was_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

impl TransactionManager for NullTransactionManager {
    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }
}

/// Interior-mutable bookkeeping shared by `ManagedConnection` impls: the
/// `opened`/`closed_by_database` state the coordinator mutates directly.
#[derive(Debug, Default)]
pub struct ConnectionState {
    opened_at: Mutex<Option<Instant>>,
    txn_manager: Mutex<Option<Arc<dyn TransactionManager>>>,
    closed_by_database: AtomicBool,
}

impl ConnectionState {
    pub fn opened(&self) -> Option<Instant> {
        *self.opened_at.lock().unwrap()
    }

    pub fn set_opened(&self, at: Option<Instant>) {
        *self.opened_at.lock().unwrap() = at;
    }

    pub fn bind(&self, txn_manager: Arc<dyn TransactionManager>) {
        *self.txn_manager.lock().unwrap() = Some(txn_manager);
    }

    pub fn transaction_manager(&self) -> Option<Arc<dyn TransactionManager>> {
        self.txn_manager.lock().unwrap().clone()
    }

    pub fn closed_by_database(&self) -> bool {
        self.closed_by_database.load(Ordering::SeqCst)
    }

    pub fn mark_closed_by_database(&self) {
        self.closed_by_database.store(true, Ordering::SeqCst);
    }
}

/// A trivial, allocation-free "normalized refcount" source for
/// implementations that don't otherwise track external holders. Stored as
/// an `AtomicI64` so tests can tune it.
#[derive(Debug, Default)]
pub struct RefcountHint(AtomicI64);

impl RefcountHint {
    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, v: i64) {
        self.0.store(v, Ordering::Relaxed)
    }
}
