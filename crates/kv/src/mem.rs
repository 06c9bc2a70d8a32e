//! In-memory reference backend.
//!
//! Transactions execute one at a time under a single lock, which makes the
//! backend strictly serializable; `CommitConflict` therefore never surfaces
//! here. Commit order is a process-local counter packed big-endian into the
//! 10-byte versionstamp prefix, so stamps from later commits always compare
//! greater.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard};

use tidemark_core::VERSIONSTAMP_LEN;

use crate::{Kv, KvError, KvPair, ReadOps, TransactError, Tx};

/// Per-key limit, matching common transactional stores.
pub const MAX_KEY_LEN: usize = 10_000;
/// Per-value limit; larger payloads should store a reference instead.
pub const MAX_VALUE_LEN: usize = 100_000;
/// Total staged bytes per transaction.
pub const MAX_TX_BYTES: usize = 10_000_000;

const MAX_COMMIT_ATTEMPTS: usize = 10;
const COMMIT_PREFIX_LEN: usize = 10;

#[derive(Debug, Default)]
struct MemState {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    commit_seq: u64,
}

/// In-memory transactional store for tests and development.
#[derive(Debug, Default)]
pub struct MemKv {
    state: Mutex<MemState>,
}

impl MemKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored (test helper).
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
enum Op {
    Set { key: Vec<u8>, value: Vec<u8> },
    SetVs { key: Vec<u8>, offset: usize, value: Vec<u8> },
    Clear { key: Vec<u8> },
    ClearRange { begin: Vec<u8>, end: Vec<u8> },
}

/// A transaction holding the store lock until commit or abort.
pub struct MemTx<'a> {
    state: &'a mut MemState,
    ops: Vec<Op>,
    overlay: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    staged_bytes: usize,
}

impl<'a> MemTx<'a> {
    fn new(state: &'a mut MemState) -> Self {
        Self {
            state,
            ops: Vec::new(),
            overlay: BTreeMap::new(),
            staged_bytes: 0,
        }
    }

    fn check_write(&mut self, key: &[u8], value: &[u8]) -> Result<(), KvError> {
        if key.len() > MAX_KEY_LEN {
            return Err(KvError::KeyLimitExceeded {
                got: key.len(),
                limit: MAX_KEY_LEN,
            });
        }
        if value.len() > MAX_VALUE_LEN {
            return Err(KvError::Storage(format!(
                "value length {} exceeds limit {MAX_VALUE_LEN}",
                value.len()
            )));
        }
        self.staged_bytes += key.len() + value.len();
        if self.staged_bytes > MAX_TX_BYTES {
            return Err(KvError::TxTooLarge {
                got: self.staged_bytes,
                limit: MAX_TX_BYTES,
            });
        }
        Ok(())
    }

    fn commit(self) -> Result<(), KvError> {
        let seq = self.state.commit_seq + 1;
        let mut prefix = [0u8; COMMIT_PREFIX_LEN];
        prefix[..8].copy_from_slice(&seq.to_be_bytes());

        for op in self.ops {
            match op {
                Op::Set { key, value } => {
                    self.state.data.insert(key, value);
                }
                Op::SetVs { mut key, offset, value } => {
                    key[offset..offset + COMMIT_PREFIX_LEN].copy_from_slice(&prefix);
                    self.state.data.insert(key, value);
                }
                Op::Clear { key } => {
                    self.state.data.remove(&key);
                }
                Op::ClearRange { begin, end } => {
                    if begin < end {
                        let doomed: Vec<Vec<u8>> = self
                            .state
                            .data
                            .range::<[u8], _>((Bound::Included(&begin[..]), Bound::Excluded(&end[..])))
                            .map(|(k, _)| k.clone())
                            .collect();
                        for key in doomed {
                            self.state.data.remove(&key);
                        }
                    }
                }
            }
        }

        self.state.commit_seq = seq;
        Ok(())
    }
}

impl ReadOps for MemTx<'_> {
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        if let Some(staged) = self.overlay.get(key) {
            return Ok(staged.clone());
        }
        Ok(self.state.data.get(key).cloned())
    }

    fn range(
        &mut self,
        begin: &[u8],
        end: &[u8],
        limit: usize,
        reverse: bool,
    ) -> Result<Vec<KvPair>, KvError> {
        if begin >= end {
            return Ok(Vec::new());
        }

        let mut view: BTreeMap<Vec<u8>, Vec<u8>> = self
            .state
            .data
            .range::<[u8], _>((Bound::Included(begin), Bound::Excluded(end)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, staged) in self
            .overlay
            .range::<[u8], _>((Bound::Included(begin), Bound::Excluded(end)))
        {
            match staged {
                Some(value) => {
                    view.insert(key.clone(), value.clone());
                }
                None => {
                    view.remove(key);
                }
            }
        }

        Ok(take_pairs(view, limit, reverse))
    }
}

impl Tx for MemTx<'_> {
    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), KvError> {
        self.check_write(key, value)?;
        self.overlay.insert(key.to_vec(), Some(value.to_vec()));
        self.ops.push(Op::Set {
            key: key.to_vec(),
            value: value.to_vec(),
        });
        Ok(())
    }

    fn set_versionstamped_key(
        &mut self,
        key: Vec<u8>,
        offset: usize,
        value: &[u8],
    ) -> Result<(), KvError> {
        if offset + VERSIONSTAMP_LEN > key.len() {
            return Err(KvError::Storage(format!(
                "versionstamp offset {offset} out of range for key of {} bytes",
                key.len()
            )));
        }
        self.check_write(&key, value)?;
        // Not added to the overlay: a versionstamped key is unreadable until
        // the commit fills in its prefix.
        self.ops.push(Op::SetVs {
            key,
            offset,
            value: value.to_vec(),
        });
        Ok(())
    }

    fn clear(&mut self, key: &[u8]) {
        self.overlay.insert(key.to_vec(), None);
        self.ops.push(Op::Clear { key: key.to_vec() });
    }

    fn clear_range(&mut self, begin: &[u8], end: &[u8]) {
        if begin >= end {
            return;
        }
        let doomed: Vec<Vec<u8>> = self
            .state
            .data
            .range::<[u8], _>((Bound::Included(begin), Bound::Excluded(end)))
            .map(|(k, _)| k.clone())
            .chain(
                self.overlay
                    .range::<[u8], _>((Bound::Included(begin), Bound::Excluded(end)))
                    .filter(|(_, staged)| staged.is_some())
                    .map(|(k, _)| k.clone()),
            )
            .collect();
        for key in doomed {
            self.overlay.insert(key, None);
        }
        self.ops.push(Op::ClearRange {
            begin: begin.to_vec(),
            end: end.to_vec(),
        });
    }
}

/// An owned copy of the store taken at one commit boundary.
#[derive(Debug)]
pub struct MemSnapshot {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl ReadOps for MemSnapshot {
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.data.get(key).cloned())
    }

    fn range(
        &mut self,
        begin: &[u8],
        end: &[u8],
        limit: usize,
        reverse: bool,
    ) -> Result<Vec<KvPair>, KvError> {
        if begin >= end {
            return Ok(Vec::new());
        }
        let view: BTreeMap<Vec<u8>, Vec<u8>> = self
            .data
            .range::<[u8], _>((Bound::Included(begin), Bound::Excluded(end)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(take_pairs(view, limit, reverse))
    }
}

fn take_pairs(view: BTreeMap<Vec<u8>, Vec<u8>>, limit: usize, reverse: bool) -> Vec<KvPair> {
    let cap = if limit == 0 { usize::MAX } else { limit };
    let iter: Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)>> = if reverse {
        Box::new(view.into_iter().rev())
    } else {
        Box::new(view.into_iter())
    };
    iter.take(cap)
        .map(|(key, value)| KvPair { key, value })
        .collect()
}

impl Kv for MemKv {
    type Tx<'a>
        = MemTx<'a>
    where
        Self: 'a;
    type Snapshot = MemSnapshot;

    fn transact<T, E, F>(&self, mut f: F) -> Result<T, E>
    where
        E: TransactError,
        F: FnMut(&mut Self::Tx<'_>) -> Result<T, E>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let mut guard: MutexGuard<'_, MemState> = self.state.lock().unwrap();
            let mut tx = MemTx::new(&mut guard);
            match f(&mut tx) {
                Ok(value) => match tx.commit() {
                    Ok(()) => return Ok(value),
                    Err(KvError::CommitConflict) if attempts < MAX_COMMIT_ATTEMPTS => continue,
                    Err(e) => return Err(E::from(e)),
                },
                Err(e) => {
                    if matches!(e.as_kv(), Some(KvError::CommitConflict))
                        && attempts < MAX_COMMIT_ATTEMPTS
                    {
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    fn snapshot(&self) -> Result<Self::Snapshot, KvError> {
        Ok(MemSnapshot {
            data: self.state.lock().unwrap().data.clone(),
        })
    }
}
