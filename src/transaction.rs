//! The two-phase-commit data-manager seam (§4.4, §9).
//!
//! The transaction manager's own commit/abort sequencing is out of scope
//! (§1): this module only specifies the callback surface a joinable
//! resource exposes to it.

use async_trait::async_trait;

pub type DmError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A two-phase-commit participant, joinable to a transaction whose context
/// type is `Txn` (typically a storage's own transaction handle).
///
/// Modeled as explicit callbacks rather than free-form hooks so a
/// transaction manager can drive multiple heterogeneous data managers
/// through the same sequence.
#[async_trait]
pub trait DataManager<Txn: Send + Sync>: Send + Sync {
    async fn tpc_begin(&self, txn: &Txn) -> Result<(), DmError>;
    async fn commit(&self, txn: &Txn) -> Result<(), DmError>;
    async fn tpc_vote(&self, txn: &Txn) -> Result<(), DmError>;
    async fn tpc_finish(&self, txn: &Txn) -> Result<(), DmError>;
    async fn tpc_abort(&self, txn: &Txn);
    async fn abort(&self, txn: &Txn);

    /// A stable ordering key, so a transaction manager joining multiple
    /// data managers can sequence them deterministically.
    fn sort_key(&self) -> String;
}
