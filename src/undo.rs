//! `TransactionalUndo`: a transaction resource that undoes a sequence of
//! prior transactions via two-phase commit, broadcasting invalidations for
//! the affected objects on success (§4.4).

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::ids::{Oid, Tid};
use crate::storage::Storage;
use crate::transaction::{DataManager, DmError};

static UNDO_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Sink for the invalidation broadcast `tpc_finish` triggers once the
/// storage assigns the final transaction id. Implemented by `Database`;
/// kept as a narrow trait so `TransactionalUndo` doesn't need to be
/// generic over the connection/factory types a `Database` carries.
pub trait Invalidator: Send + Sync {
    fn invalidate(&self, tid: Tid, oids: HashSet<Oid>);
}

/// Explicit two-phase-commit state, rejecting out-of-order calls (§9).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UndoState {
    Idle,
    Begun,
    Voted,
    Finished,
    Aborted,
}

#[derive(Debug, thiserror::Error)]
#[error("undo data manager called out of order: {0}")]
pub struct OutOfOrderError(String);

fn out_of_order(what: &str, state: UndoState) -> DmError {
    Box::new(OutOfOrderError(format!("{} while in state {:?}", what, state)))
}

/// A data manager that undoes `tids`, in order, when driven through
/// two-phase commit.
pub struct TransactionalUndo<S: Storage> {
    storage: Arc<S>,
    invalidator: Arc<dyn Invalidator>,
    tids: Vec<Tid>,
    oids: Mutex<HashSet<Oid>>,
    state: Mutex<UndoState>,
    sort_suffix: u64,
}

impl<S: Storage> TransactionalUndo<S> {
    pub fn new(storage: Arc<S>, invalidator: Arc<dyn Invalidator>, tids: Vec<Tid>) -> Self {
        TransactionalUndo {
            storage,
            invalidator,
            tids,
            oids: Mutex::new(HashSet::new()),
            state: Mutex::new(UndoState::Idle),
            sort_suffix: UNDO_COUNTER.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn transition(&self, from: &[UndoState], to: UndoState, what: &str) -> Result<(), DmError> {
        let mut state = self.state.lock().unwrap();
        if !from.contains(&*state) {
            return Err(out_of_order(what, *state));
        }
        *state = to;
        Ok(())
    }

    fn wrap_storage_err(e: S::Error) -> DmError {
        Box::new(e)
    }

    /// Collected oids across `commit`/`tpc_vote` so far, for tests.
    #[cfg(test)]
    pub fn collected_oids(&self) -> HashSet<Oid> {
        self.oids.lock().unwrap().clone()
    }
}

#[async_trait]
impl<S: Storage> DataManager<S::Txn> for TransactionalUndo<S> {
    async fn tpc_begin(&self, txn: &S::Txn) -> Result<(), DmError> {
        self.transition(&[UndoState::Idle], UndoState::Begun, "tpc_begin")?;
        self.storage.tpc_begin(txn).await.map_err(Self::wrap_storage_err)
    }

    async fn commit(&self, txn: &S::Txn) -> Result<(), DmError> {
        {
            let state = *self.state.lock().unwrap();
            if state != UndoState::Begun {
                return Err(out_of_order("commit", state));
            }
        }
        for tid in &self.tids {
            if let Some(affected) = self
                .storage
                .undo(*tid, txn)
                .await
                .map_err(Self::wrap_storage_err)?
            {
                self.oids.lock().unwrap().extend(affected);
            }
        }
        Ok(())
    }

    async fn tpc_vote(&self, txn: &S::Txn) -> Result<(), DmError> {
        self.transition(&[UndoState::Begun], UndoState::Voted, "tpc_vote")?;
        let voted_oids = self.storage.tpc_vote(txn).await.map_err(Self::wrap_storage_err)?;
        self.oids.lock().unwrap().extend(voted_oids);
        Ok(())
    }

    async fn tpc_finish(&self, txn: &S::Txn) -> Result<(), DmError> {
        self.transition(&[UndoState::Voted], UndoState::Finished, "tpc_finish")?;
        let tid = self
            .storage
            .tpc_finish(txn)
            .await
            .map_err(Self::wrap_storage_err)?;
        let oids = self.oids.lock().unwrap().clone();
        self.invalidator.invalidate(tid, oids);
        Ok(())
    }

    async fn tpc_abort(&self, txn: &S::Txn) {
        *self.state.lock().unwrap() = UndoState::Aborted;
        let _ = self.storage.tpc_abort(txn).await;
    }

    async fn abort(&self, _txn: &S::Txn) {
        // Pre-vote abort: nothing was committed to storage, so there is
        // nothing to unwind there.
        *self.state.lock().unwrap() = UndoState::Aborted;
    }

    fn sort_key(&self) -> String {
        format!("{}:{}", self.storage.sort_key(), self.sort_suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestStorage;
    use std::sync::Mutex as StdMutex;

    struct RecordingInvalidator {
        calls: StdMutex<Vec<(Tid, HashSet<Oid>)>>,
    }

    impl RecordingInvalidator {
        fn new() -> Arc<Self> {
            Arc::new(RecordingInvalidator {
                calls: StdMutex::new(Vec::new()),
            })
        }
    }

    impl Invalidator for RecordingInvalidator {
        fn invalidate(&self, tid: Tid, oids: HashSet<Oid>) {
            self.calls.lock().unwrap().push((tid, oids));
        }
    }

    fn tid(n: u8) -> Tid {
        Tid([0, 0, 0, 0, 0, 0, 0, n])
    }

    #[tokio::test]
    async fn undo_finish_broadcasts_collected_oids() {
        let storage = TestStorage::new();
        let invalidator = RecordingInvalidator::new();
        let undo = TransactionalUndo::new(
            storage.clone(),
            invalidator.clone(),
            vec![tid(10), tid(20)],
        );

        undo.tpc_begin(&()).await.unwrap();
        undo.commit(&()).await.unwrap();
        undo.tpc_vote(&()).await.unwrap();
        undo.tpc_finish(&()).await.unwrap();

        assert_eq!(storage.undo_calls(), vec![tid(10), tid(20)]);
        let calls = invalidator.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].1.contains(&Oid::from(10u64)));
        assert!(calls[0].1.contains(&Oid::from(20u64)));
    }

    #[tokio::test]
    async fn out_of_order_calls_are_rejected() {
        let storage = TestStorage::new();
        let invalidator = RecordingInvalidator::new();
        let undo = TransactionalUndo::new(storage, invalidator, vec![tid(1)]);

        // commit before tpc_begin.
        let err = undo.commit(&()).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn sort_key_is_stable_and_unique_per_instance() {
        let storage = TestStorage::new();
        let invalidator = RecordingInvalidator::new();
        let a = TransactionalUndo::new(storage.clone(), invalidator.clone(), vec![]);
        let b = TransactionalUndo::new(storage, invalidator, vec![]);
        assert_ne!(a.sort_key(), b.sort_key());
    }
}
