//! Streaming read path: a k-way merge over index ranges.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use tidemark_core::tuple::key_after;
use tidemark_core::{CancelToken, Element, StoredEvent, Subspace, Versionstamp};
use tidemark_kv::{KvError, KvPair, ReadOps};

use crate::metrics::StoreMetrics;
use crate::plan::KeyRange;
use crate::{decode_event_row, position_of_key, StoreError};

const PAGE_SIZE: usize = 256;

/// Options shared by every read entry point.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Skip events at or before this position.
    pub after: Option<Versionstamp>,
    /// Stop after yielding this many events.
    pub limit: Option<usize>,
    /// Checked between emissions; a canceled token ends the sequence with an
    /// error.
    pub cancel: Option<CancelToken>,
}

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn after(mut self, position: Versionstamp) -> Self {
        self.after = Some(position);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// One paged scan over an index range. Keys arrive in ascending order, so the
/// next page always starts just past the last key seen.
#[derive(Debug)]
struct RangeCursor {
    begin: Vec<u8>,
    end: Vec<u8>,
    buf: VecDeque<KvPair>,
    exhausted: bool,
}

impl RangeCursor {
    fn new(range: KeyRange) -> Self {
        Self {
            begin: range.begin,
            end: range.end,
            buf: VecDeque::new(),
            exhausted: false,
        }
    }

    fn next_pair(&mut self, reader: &mut impl ReadOps) -> Result<Option<KvPair>, KvError> {
        if self.buf.is_empty() && !self.exhausted {
            let page = reader.range(&self.begin, &self.end, PAGE_SIZE, false)?;
            if page.len() < PAGE_SIZE {
                self.exhausted = true;
            }
            if let Some(last) = page.last() {
                self.begin = key_after(&last.key);
            }
            self.buf.extend(page);
        }
        Ok(self.buf.pop_front())
    }
}

enum Mode {
    /// Merge index ranges by position, then fetch each primary row.
    Merge {
        cursors: Vec<RangeCursor>,
        heap: BinaryHeap<Reverse<(Versionstamp, usize)>>,
    },
    /// Walk the primary subspace directly; values are the event rows.
    Scan { cursor: RangeCursor },
}

/// A lazy, single-pass sequence of stored events in ascending position order.
///
/// Duplicates reached through multiple ranges are suppressed. The first error
/// terminates the sequence; everything yielded before it is a valid prefix.
pub struct EventIter<S: ReadOps> {
    snap: S,
    events: Subspace,
    mode: Mode,
    last: Option<Versionstamp>,
    remaining: Option<usize>,
    cancel: Option<CancelToken>,
    metrics: Arc<dyn StoreMetrics>,
    started: Instant,
    yielded: usize,
    done: bool,
}

impl<S: ReadOps> EventIter<S> {
    pub(crate) fn merge(
        mut snap: S,
        events: Subspace,
        ranges: Vec<KeyRange>,
        opts: ReadOptions,
        metrics: Arc<dyn StoreMetrics>,
    ) -> Result<Self, StoreError> {
        let mut cursors: Vec<RangeCursor> = ranges.into_iter().map(RangeCursor::new).collect();
        let mut heap = BinaryHeap::with_capacity(cursors.len());
        for (idx, cursor) in cursors.iter_mut().enumerate() {
            if let Some(pair) = cursor.next_pair(&mut snap)? {
                heap.push(Reverse((position_of_key(&pair.key)?, idx)));
            }
        }
        Ok(Self {
            snap,
            events,
            mode: Mode::Merge { cursors, heap },
            last: None,
            remaining: opts.limit,
            cancel: opts.cancel,
            metrics,
            started: Instant::now(),
            yielded: 0,
            done: false,
        })
    }

    pub(crate) fn scan(
        snap: S,
        events: Subspace,
        opts: ReadOptions,
        metrics: Arc<dyn StoreMetrics>,
    ) -> Self {
        let (mut begin, end) = events.range();
        if let Some(after) = opts.after {
            begin = key_after(&events.pack(&[Element::Versionstamp(after)]));
        }
        Self {
            snap,
            events,
            mode: Mode::Scan {
                cursor: RangeCursor::new(KeyRange { begin, end }),
            },
            last: None,
            remaining: opts.limit,
            cancel: opts.cancel,
            metrics,
            started: Instant::now(),
            yielded: 0,
            done: false,
        }
    }

    fn next_event(&mut self) -> Result<Option<StoredEvent>, StoreError> {
        loop {
            if let Some(token) = &self.cancel {
                if token.is_canceled() {
                    return Err(StoreError::Kv(KvError::Canceled));
                }
            }
            if self.remaining == Some(0) {
                return Ok(None);
            }

            let (position, row) = match &mut self.mode {
                Mode::Merge { cursors, heap } => {
                    let Some(Reverse((position, idx))) = heap.pop() else {
                        return Ok(None);
                    };
                    if let Some(pair) = cursors[idx].next_pair(&mut self.snap)? {
                        heap.push(Reverse((position_of_key(&pair.key)?, idx)));
                    }
                    if self.last == Some(position) {
                        continue;
                    }
                    (position, None)
                }
                Mode::Scan { cursor } => {
                    let Some(pair) = cursor.next_pair(&mut self.snap)? else {
                        return Ok(None);
                    };
                    (position_of_key(&pair.key)?, Some(pair.value))
                }
            };

            let event = match row {
                Some(value) => decode_event_row(&value, position)?,
                None => {
                    let key = self.events.pack(&[Element::Versionstamp(position)]);
                    match self.snap.get(&key)? {
                        Some(value) => decode_event_row(&value, position)?,
                        None => return Err(StoreError::EventNotFound(position)),
                    }
                }
            };

            self.last = Some(position);
            if let Some(remaining) = &mut self.remaining {
                *remaining -= 1;
            }
            self.yielded += 1;
            return Ok(Some(event));
        }
    }
}

impl<S: ReadOps> Iterator for EventIter<S> {
    type Item = Result<StoredEvent, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_event() {
            Ok(Some(event)) => Some(Ok(event)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                self.metrics.record_error("read", e.kind());
                Some(Err(e))
            }
        }
    }
}

impl<S: ReadOps> Drop for EventIter<S> {
    fn drop(&mut self) {
        self.metrics.record_read_duration(self.started.elapsed());
        self.metrics.record_read_events(self.yielded);
    }
}
