//! The ordered, transactional key-value substrate consumed by every other
//! subsystem.
//!
//! The store requires only what these traits state: lexicographically ordered
//! byte keys, atomic multi-key transactions with snapshot reads, and
//! commit-time completion of versionstamped keys. [`mem::MemKv`] is the
//! reference backend used by tests and development.

use thiserror::Error;

pub mod mem;

pub use mem::MemKv;

/// Transport-layer failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KvError {
    /// The commit raced another transaction; the transaction runner retries
    /// these before they ever reach a caller.
    #[error("transaction conflict")]
    CommitConflict,

    /// The commit failed terminally.
    #[error("commit failed: {0}")]
    CommitFailed(String),

    #[error("key length {got} exceeds limit {limit}")]
    KeyLimitExceeded { got: usize, limit: usize },

    #[error("transaction exceeds size limit ({got} > {limit} bytes)")]
    TxTooLarge { got: usize, limit: usize },

    #[error("operation canceled")]
    Canceled,

    #[error("storage error: {0}")]
    Storage(String),
}

/// Errors that can flow out of a transaction closure.
///
/// The transaction runner needs to see through a caller's error type to the
/// underlying [`KvError`] to decide whether a failed attempt is retriable.
pub trait TransactError: From<KvError> {
    fn as_kv(&self) -> Option<&KvError>;
}

impl TransactError for KvError {
    fn as_kv(&self) -> Option<&KvError> {
        Some(self)
    }
}

/// A key plus its value, as returned by range scans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Read operations shared by transactions and snapshots.
pub trait ReadOps {
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError>;

    /// Scan `[begin, end)` in key order (reversed when `reverse`), yielding
    /// at most `limit` pairs. A `limit` of 0 means no limit.
    fn range(
        &mut self,
        begin: &[u8],
        end: &[u8],
        limit: usize,
        reverse: bool,
    ) -> Result<Vec<KvPair>, KvError>;
}

/// Mutations staged inside a transaction. Nothing is visible to other
/// transactions until the runner commits.
pub trait Tx: ReadOps {
    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), KvError>;

    /// Stage a write whose key contains a 12-byte versionstamp slot at
    /// `offset`; the commit fills in the 10-byte commit prefix, keeping the
    /// 2-byte batch index already present. The key is not readable within
    /// the writing transaction.
    fn set_versionstamped_key(
        &mut self,
        key: Vec<u8>,
        offset: usize,
        value: &[u8],
    ) -> Result<(), KvError>;

    fn clear(&mut self, key: &[u8]);

    fn clear_range(&mut self, begin: &[u8], end: &[u8]);
}

/// A transactional key-value store.
pub trait Kv: Send + Sync + 'static {
    type Tx<'a>: Tx
    where
        Self: 'a;

    /// An owned snapshot for long-lived read paths; sees a single consistent
    /// version of the store and never blocks writers.
    type Snapshot: ReadOps + Send + 'static;

    /// Run `f` inside a transaction, committing on `Ok` and discarding all
    /// staged writes on `Err`. Attempts that fail with
    /// [`KvError::CommitConflict`] are retried with a fresh transaction.
    fn transact<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: TransactError,
        F: FnMut(&mut Self::Tx<'_>) -> Result<T, E>;

    fn snapshot(&self) -> Result<Self::Snapshot, KvError>;
}
