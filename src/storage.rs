//! The storage interface the coordination core depends on (§6).
//!
//! The storage engine itself — append-only log, MVCC index, pack
//! mechanics — is out of scope (§1); this trait is only the seam the core
//! calls through.

use std::sync::Arc;

use async_trait::async_trait;

use crate::ids::{Oid, Tid};

/// Extracts the oids a pickled record references, so `pack` can walk the
/// object graph reachable from the root. The pickler/unpickler themselves
/// are out of scope (§1); embedders inject their own extraction logic.
pub type ReferencesFn = Arc<dyn Fn(&[u8]) -> Vec<Oid> + Send + Sync>;

/// A transaction record, produced by `undo_log`/`undo_info`.
#[derive(Clone, Debug)]
pub struct TransactionRecord {
    pub id: String,
    pub tid: Tid,
    pub description: String,
}

/// The storage seam. Generic core code is written against this trait, not
/// against a concrete storage engine.
///
/// `Txn` is the storage's own transaction/context handle, threaded through
/// the two-phase-commit calls; the core never inspects it.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;
    type Txn: Send + Sync + Default;

    /// `load(ZERO_OID, "")`. An `Err` is interpreted by the bootstrap logic
    /// as "not found" unconditionally — storages with a richer error model
    /// should map their own not-found condition to `Err` here and surface
    /// other failures through `Storage::Error` as well; the core cannot
    /// distinguish the two without downcasting, so implementations that
    /// need that distinction should bootstrap with a wrapper storage.
    async fn load_root(&self) -> Result<Vec<u8>, Self::Error>;

    async fn tpc_begin(&self, txn: &Self::Txn) -> Result<(), Self::Error>;

    /// Store the bootstrap root pickle at oid zero.
    async fn store_root(&self, pickle: Vec<u8>, txn: &Self::Txn) -> Result<(), Self::Error>;

    /// Vote phase. Storages without a vote phase should return `Ok(vec![])`
    /// from a no-op implementation; `Database::new` checks
    /// [`Storage::supports_vote`] and only logs the compatibility warning,
    /// it does not change which method is called.
    async fn tpc_vote(&self, txn: &Self::Txn) -> Result<Vec<Oid>, Self::Error>;

    /// Finish phase; returns the assigned transaction id.
    async fn tpc_finish(&self, txn: &Self::Txn) -> Result<Tid, Self::Error>;

    async fn tpc_abort(&self, txn: &Self::Txn) -> Result<(), Self::Error>;

    /// Undo a single prior transaction within `txn`. Returns the set of
    /// affected oids, if the storage can determine them eagerly.
    async fn undo(&self, tid: Tid, txn: &Self::Txn) -> Result<Option<Vec<Oid>>, Self::Error>;

    /// Pack to `pack_time_unix`, walking references with `references` to
    /// find the reachable object set. `Database::pack` (§4.3) forwards its
    /// own injected callable straight through here.
    async fn pack(
        &self,
        pack_time_unix: i64,
        references: &ReferencesFn,
    ) -> Result<(), Self::Error>;

    /// Close the storage and release its resources. `Database::close`
    /// calls this last, after every connection has been neutered.
    async fn close(&self) -> Result<(), Self::Error>;

    fn last_transaction(&self) -> Tid;
    fn get_name(&self) -> String;
    fn get_size(&self) -> usize;
    fn is_read_only(&self) -> bool;
    fn new_oid(&self) -> Oid;

    /// Absence of undo support; default `false` (no undo).
    fn supports_undo(&self) -> bool {
        false
    }

    /// Whether `tpc_vote` is a real vote phase. `Database::new` installs a
    /// no-op vote shim (skips calling `tpc_vote`) and logs a warning when
    /// this is `false` and the storage is not read-only.
    fn supports_vote(&self) -> bool {
        true
    }

    fn sort_key(&self) -> String;

    /// Undoable transaction log, most recent first. Default: empty.
    async fn undo_log(&self, _first: usize, _last: usize) -> Vec<TransactionRecord> {
        Vec::new()
    }

    /// Undo information; distinct from `undo_log` only in the detail a
    /// storage chooses to populate (e.g. a user-facing description vs. a
    /// machine-oriented one). Default: empty.
    async fn undo_info(&self, _first: usize, _last: usize) -> Vec<TransactionRecord> {
        Vec::new()
    }

    /// Revision history of a single object, most recent first. Default:
    /// empty.
    async fn history(&self, _oid: Oid, _size: usize) -> Vec<TransactionRecord> {
        Vec::new()
    }
}

/// Capability marker for storages offering a detachable, point-in-time
/// instance used during root bootstrap on MVCC-isolated backends. Most
/// storages don't need this; `Database::new` only uses it when present.
#[async_trait]
pub trait MvccStorage: Storage {
    type Instance: Storage<Error = Self::Error, Txn = Self::Txn>;

    async fn new_instance(&self) -> Self::Instance;
}
