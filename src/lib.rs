//! Connection pool, invalidation fan-out, and transactional-undo
//! coordinator for an object-database front end.
//!
//! This crate is the coordination core sitting between a storage engine
//! and the application's connections: it hands out connections warmed
//! from a pool, fans out invalidations on commit, drives storage undo
//! through two-phase commit, and reaps idle connections on a timeout.
//! The storage engine, the object cache's eviction policy, and the
//! transaction manager's own commit sequencing are all external
//! collaborators reached through the [`storage`], [`cache`] and
//! [`transaction`] seams.

pub mod cache;
pub mod connection;
pub mod database;
pub mod error;
pub mod ids;
pub mod keyed_pool;
pub mod pool;
pub mod storage;
pub mod transaction;
pub mod undo;

/// In-memory test fixtures (a mock cache, connection, factory and
/// storage), exported so integration tests can drive the coordinator
/// without a real storage engine. No stability guarantees.
pub mod testutil;

pub use cache::{CachedObjectInfo, ObjectCache};
pub use connection::{ConnectionFactory, ManagedConnection, NullTransactionManager, TransactionManager};
pub use database::{
    ActivityMonitor, CacheDetail, ConnectionDebugInfo, Database, DatabaseConfig, DatabaseRegistry,
    PlaceholderRootSerializer, RootSerializer,
};
pub use error::{CoreError, CoreResult};
pub use ids::{At, Oid, Tid, TimeStamp, ZERO_OID};
pub use keyed_pool::KeyedConnectionPool;
pub use pool::ConnectionPool;
pub use storage::{MvccStorage, ReferencesFn, Storage, TransactionRecord};
pub use transaction::{DataManager, DmError};
pub use undo::{Invalidator, TransactionalUndo};
