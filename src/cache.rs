//! The object-cache trait surface a `ManagedConnection` must expose.
//!
//! The cache's own eviction policy is out of scope (§1 Non-goals): the core
//! only reads its warmth/size statistics and triggers sweeps, it does not
//! implement how objects are ghosted or loaded.

use std::time::Instant;

use crate::ids::Oid;

/// A per-object record returned by [`ObjectCache::extreme_detail`].
#[derive(Clone, Debug)]
pub struct CachedObjectInfo {
    pub oid: Oid,
    pub class_name: String,
    /// An opaque hint identifying the cached object's identity (e.g. its
    /// address), for debugging only — never dereferenced by the core.
    pub identity_hint: usize,
    /// The object's refcount as seen by external holders, with the cache's
    /// own reference on non-ghost entries subtracted out.
    pub normalized_refcount: i64,
    pub is_ghost: bool,
}

/// The cache owned by a connection.
///
/// Implementations back this with their own eviction policy; the core only
/// reads statistics and drives `full_sweep`/`minimize`/GC.
pub trait ObjectCache: Send + Sync {
    /// Count of non-ghost (loaded) entries. Used as the "warmth" signal for
    /// pool reuse ordering.
    fn non_ghost_count(&self) -> usize;

    /// Total entries, ghost or not.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Target entry count; `set_size` reconfigures it.
    fn size(&self) -> usize;
    fn set_size(&self, size: usize);

    /// Target estimated byte size; 0 means unlimited.
    fn size_bytes(&self) -> usize;
    fn set_size_bytes(&self, size_bytes: usize);

    /// Evict every non-ghost entry that can be ghosted.
    fn full_sweep(&self);

    /// Evict as aggressively as possible, including entries a normal sweep
    /// would keep.
    fn minimize(&self);

    /// Monotonic timestamp of the cache's own last incremental GC pass.
    fn last_gc_time(&self) -> Instant;

    /// Trigger one incremental GC pass (used by `available_gc`).
    fn incremental_gc(&self);

    /// Per-class histogram contribution: (oid, class_name) for every
    /// resident object.
    fn class_histogram_entries(&self) -> Vec<(Oid, String)>;

    /// Full per-object detail, used by `cache_extreme_detail`.
    fn extreme_detail(&self) -> Vec<CachedObjectInfo>;
}
