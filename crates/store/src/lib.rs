//! The DCB event store: an append-only log with a dual type/tag index,
//! conditional appends, and a streaming merge read path.
//!
//! Layout under the store's namespace:
//!
//! ```text
//! ns/e/<VS>                            → (type, tags, payload)
//! ns/t/<type>/<VS>                     → ()
//! ns/g/<tag…>/_e/<type>/<VS>          → ()   for every non-empty sorted tag subset
//! ```
//!
//! All three families for one event commit in one transaction, so the indexes
//! are coherent with the log at every observable version.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::debug;

use tidemark_core::tuple::{self, Element, TupleError};
use tidemark_core::{
    AppendCondition, CodecError, Query, StoredEvent, Subspace, UncommittedEvent, Versionstamp,
};
use tidemark_kv::{Kv, KvError, ReadOps, TransactError, Tx};

mod metrics;
mod plan;
mod read;

pub use metrics::{NoopMetrics, StoreMetrics};
pub use read::{EventIter, ReadOptions};

/// Tag subsets are enumerated per event; past this many tags the index would
/// fan out beyond reason.
pub const MAX_TAGS_PER_EVENT: usize = 16;

/// Store-level failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no events to append")]
    EmptyEvents,

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// The append condition matched a newer event; the caller's read is
    /// stale.
    #[error("append condition failed")]
    ConditionFailed,

    /// An index entry pointed at a missing primary row.
    #[error("event not found at position {0}")]
    EventNotFound(Versionstamp),

    #[error("corrupt store row: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Kv(#[from] KvError),
}

impl StoreError {
    /// Stable kind label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::EmptyEvents => "empty_events",
            StoreError::InvalidEvent(_) => "invalid_event",
            StoreError::InvalidQuery(_) => "invalid_query",
            StoreError::ConditionFailed => "condition_failed",
            StoreError::EventNotFound(_) => "event_not_found",
            StoreError::Corrupt(_) => "corrupt",
            StoreError::Codec(_) => "codec",
            StoreError::Kv(_) => "kv",
        }
    }
}

impl TransactError for StoreError {
    fn as_kv(&self) -> Option<&KvError> {
        match self {
            StoreError::Kv(e) => Some(e),
            _ => None,
        }
    }
}

/// The event store over a KV backend.
///
/// Cheap to clone; clones share the backend and metrics sink.
pub struct EventStore<K: Kv> {
    kv: Arc<K>,
    root: Subspace,
    events: Subspace,
    types: Subspace,
    tags: Subspace,
    metrics: Arc<dyn StoreMetrics>,
}

impl<K: Kv> Clone for EventStore<K> {
    fn clone(&self) -> Self {
        Self {
            kv: self.kv.clone(),
            root: self.root.clone(),
            events: self.events.clone(),
            types: self.types.clone(),
            tags: self.tags.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<K: Kv> EventStore<K> {
    pub fn new(kv: Arc<K>, namespace: &str) -> Self {
        let root = Subspace::new(&[Element::str(namespace)]);
        let events = root.subspace(&[Element::str("e")]);
        let types = root.subspace(&[Element::str("t")]);
        let tags = root.subspace(&[Element::str("g")]);
        Self {
            kv,
            root,
            events,
            types,
            tags,
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn StoreMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// The namespace subspace this store owns. Sibling components (read
    /// models) derive their own subspaces from it.
    pub fn root(&self) -> &Subspace {
        &self.root
    }

    pub fn kv(&self) -> &Arc<K> {
        &self.kv
    }

    /// Append `events` to the log, optionally guarded by `condition`.
    ///
    /// The condition check, the primary rows, and every index entry commit in
    /// one transaction; positions are assigned at commit with intra-batch
    /// counters `0..n`, so the input order is the stream order.
    pub fn append(
        &self,
        events: &[UncommittedEvent],
        condition: Option<&AppendCondition>,
    ) -> Result<(), StoreError> {
        let started = Instant::now();
        validate_events(events)?;

        let result = self
            .kv
            .transact(|tx| self.append_tx(tx, events, condition));
        match &result {
            Ok(()) => {
                self.metrics.record_append_duration(started.elapsed());
                self.metrics.record_append_events(events.len());
                debug!(count = events.len(), conditional = condition.is_some(), "appended events");
            }
            Err(e) => self.metrics.record_error("append", e.kind()),
        }
        result
    }

    fn append_tx(
        &self,
        tx: &mut K::Tx<'_>,
        events: &[UncommittedEvent],
        condition: Option<&AppendCondition>,
    ) -> Result<(), StoreError> {
        if let Some(condition) = condition {
            let stale = plan::query_exists(
                tx,
                &self.types,
                &self.tags,
                &condition.query,
                condition.after.as_ref(),
            )?;
            if stale {
                return Err(StoreError::ConditionFailed);
            }
        }

        for (batch_index, event) in events.iter().enumerate() {
            let stamp = Versionstamp::incomplete(batch_index as u16);

            let row = encode_event_row(event);
            let (key, offset) = self
                .events
                .pack_with_versionstamp(&[Element::Versionstamp(stamp)])
                .map_err(corrupt_key)?;
            tx.set_versionstamped_key(key, offset, &row)?;

            let (key, offset) = self
                .types
                .pack_with_versionstamp(&[
                    Element::str(event.event_type.clone()),
                    Element::Versionstamp(stamp),
                ])
                .map_err(corrupt_key)?;
            tx.set_versionstamped_key(key, offset, b"")?;

            let mut sorted = event.tags.clone();
            sorted.sort();
            for mask in 1u32..(1u32 << sorted.len()) {
                let mut path: Vec<Element> = Vec::with_capacity(sorted.len() + 3);
                for (bit, tag) in sorted.iter().enumerate() {
                    if mask & (1 << bit) != 0 {
                        path.push(Element::str(tag.clone()));
                    }
                }
                path.push(Element::str(plan::TAG_EVENTS_SEGMENT));
                path.push(Element::str(event.event_type.clone()));
                path.push(Element::Versionstamp(stamp));
                let (key, offset) =
                    self.tags.pack_with_versionstamp(&path).map_err(corrupt_key)?;
                tx.set_versionstamped_key(key, offset, b"")?;
            }
        }

        Ok(())
    }

    /// Stream events matching `query` in ascending position order.
    pub fn read(
        &self,
        query: &Query,
        opts: ReadOptions,
    ) -> Result<EventIter<K::Snapshot>, StoreError> {
        let mut snap = self.kv.snapshot()?;
        let ranges =
            plan::plan_ranges(&mut snap, &self.types, &self.tags, query, opts.after.as_ref())?;
        EventIter::merge(snap, self.events.clone(), ranges, opts, self.metrics.clone())
    }

    /// Stream the whole log in position order.
    pub fn read_all(&self, opts: ReadOptions) -> Result<EventIter<K::Snapshot>, StoreError> {
        let snap = self.kv.snapshot()?;
        Ok(EventIter::scan(
            snap,
            self.events.clone(),
            opts,
            self.metrics.clone(),
        ))
    }

    /// True if `query` matches any event positioned after `after`.
    pub fn query_exists(
        &self,
        query: &Query,
        after: Option<&Versionstamp>,
    ) -> Result<bool, StoreError> {
        let mut snap = self.kv.snapshot()?;
        plan::query_exists(&mut snap, &self.types, &self.tags, query, after)
    }

    /// Fetch one event by position through an existing transaction or
    /// snapshot.
    pub fn event_at(
        &self,
        reader: &mut impl ReadOps,
        position: &Versionstamp,
    ) -> Result<StoredEvent, StoreError> {
        let key = self.events.pack(&[Element::Versionstamp(*position)]);
        match reader.get(&key)? {
            Some(value) => decode_event_row(&value, *position),
            None => Err(StoreError::EventNotFound(*position)),
        }
    }

    /// Fetch one event by position from a fresh snapshot.
    pub fn fetch_event(&self, position: &Versionstamp) -> Result<StoredEvent, StoreError> {
        let mut snap = self.kv.snapshot()?;
        self.event_at(&mut snap, position)
    }

    /// The position of the most recently committed event, if any.
    pub fn head(&self) -> Result<Option<Versionstamp>, StoreError> {
        let mut snap = self.kv.snapshot()?;
        let (begin, end) = self.events.range();
        let pairs = snap.range(&begin, &end, 1, true)?;
        match pairs.first() {
            Some(pair) => Ok(Some(position_of_key(&pair.key)?)),
            None => Ok(None),
        }
    }

    /// Scan the type index for `event_type`, strictly after `after`, up to
    /// `limit` positions. Works inside a transaction, which is how the
    /// automation watcher keeps its cursor atomic with its enqueues.
    pub fn scan_type_index(
        &self,
        reader: &mut impl ReadOps,
        event_type: &str,
        after: Option<&Versionstamp>,
        limit: usize,
    ) -> Result<Vec<Versionstamp>, StoreError> {
        let space = self.types.subspace(&[Element::str(event_type)]);
        let (mut begin, end) = space.range();
        if let Some(after) = after {
            begin = tuple::key_after(&space.pack(&[Element::Versionstamp(*after)]));
        }
        let pairs = reader.range(&begin, &end, limit, false)?;
        pairs
            .iter()
            .map(|pair| position_of_key(&pair.key))
            .collect()
    }
}

fn validate_events(events: &[UncommittedEvent]) -> Result<(), StoreError> {
    if events.is_empty() {
        return Err(StoreError::EmptyEvents);
    }
    if events.len() > u16::MAX as usize {
        return Err(StoreError::InvalidEvent(format!(
            "append batch of {} exceeds the intra-commit counter range",
            events.len()
        )));
    }
    for event in events {
        if event.event_type.is_empty() {
            return Err(StoreError::InvalidEvent("event type is empty".into()));
        }
        if event.tags.len() > MAX_TAGS_PER_EVENT {
            return Err(StoreError::InvalidEvent(format!(
                "event carries {} tags, limit is {MAX_TAGS_PER_EVENT}",
                event.tags.len()
            )));
        }
        let mut seen = event.tags.clone();
        seen.sort();
        for window in seen.windows(2) {
            if window[0] == window[1] {
                return Err(StoreError::InvalidEvent(format!(
                    "duplicate tag '{}'",
                    window[0]
                )));
            }
        }
    }
    Ok(())
}

/// Pack an event's primary row: `(type, tags, payload)`.
fn encode_event_row(event: &UncommittedEvent) -> Vec<u8> {
    let tags: Vec<Element> = event.tags.iter().cloned().map(Element::Str).collect();
    tuple::pack(&[
        Element::str(event.event_type.clone()),
        Element::Nested(tags),
        Element::Bytes(event.data.clone()),
    ])
}

fn decode_event_row(value: &[u8], position: Versionstamp) -> Result<StoredEvent, StoreError> {
    let elements = tuple::unpack(value).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    match elements.as_slice() {
        [Element::Str(event_type), Element::Nested(tag_elements), Element::Bytes(data)] => {
            let mut tags = Vec::with_capacity(tag_elements.len());
            for el in tag_elements {
                match el {
                    Element::Str(tag) => tags.push(tag.clone()),
                    other => {
                        return Err(StoreError::Corrupt(format!(
                            "non-string tag element {other:?}"
                        )))
                    }
                }
            }
            Ok(StoredEvent {
                event_type: event_type.clone(),
                tags,
                data: data.clone(),
                position,
            })
        }
        _ => Err(StoreError::Corrupt(
            "event row is not a (type, tags, payload) tuple".into(),
        )),
    }
}

/// Extract the position from an index or primary key (its last tuple
/// element).
pub(crate) fn position_of_key(key: &[u8]) -> Result<Versionstamp, StoreError> {
    let elements = tuple::unpack(key).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    elements
        .last()
        .and_then(Element::as_versionstamp)
        .copied()
        .ok_or_else(|| StoreError::Corrupt("key does not end in a versionstamp".into()))
}

fn corrupt_key(e: TupleError) -> StoreError {
    StoreError::Corrupt(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidemark_kv::MemKv;

    fn store() -> EventStore<MemKv> {
        EventStore::new(Arc::new(MemKv::new()), "test")
    }

    fn event(event_type: &str, tags: &[&str]) -> UncommittedEvent {
        UncommittedEvent::new(event_type, tags.iter().copied(), b"{}".to_vec())
    }

    #[test]
    fn append_rejects_empty_batches_and_invalid_events() {
        let store = store();
        assert!(matches!(store.append(&[], None), Err(StoreError::EmptyEvents)));
        assert!(matches!(
            store.append(&[event("", &[])], None),
            Err(StoreError::InvalidEvent(_))
        ));
        assert!(matches!(
            store.append(&[event("t", &["a", "a"])], None),
            Err(StoreError::InvalidEvent(_))
        ));
    }

    #[test]
    fn append_writes_primary_type_and_tag_subset_rows() {
        let store = store();
        store
            .append(&[event("item_updated", &["b", "a"])], None)
            .unwrap();

        // 1 primary + 1 type index + (2^2 - 1) tag subsets.
        assert_eq!(store.kv().len(), 5);

        let head = store.head().unwrap().unwrap();
        let stored = store.fetch_event(&head).unwrap();
        assert_eq!(stored.event_type, "item_updated");
        assert_eq!(stored.tags, vec!["b", "a"]);
    }

    #[test]
    fn batch_positions_share_a_commit_and_preserve_input_order() {
        let store = store();
        store
            .append(&[event("a", &[]), event("b", &[]), event("c", &[])], None)
            .unwrap();

        let events: Vec<StoredEvent> = store
            .read_all(ReadOptions::new())
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(events.len(), 3);

        let kinds: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(kinds, vec!["a", "b", "c"]);

        let first = events[0].position;
        for (i, ev) in events.iter().enumerate() {
            assert_eq!(ev.position.commit_order(), first.commit_order());
            assert_eq!(ev.position.batch_index(), i as u16);
        }
    }

    #[test]
    fn conditional_append_fails_on_matching_event() {
        let store = store();
        store
            .append(&[event("list_created", &["list:1"])], None)
            .unwrap();

        let condition = AppendCondition::new(Query::single(
            tidemark_core::QueryItem::new(["list_created"], ["list:1"]),
        ));
        let err = store
            .append(&[event("list_created", &["list:1"])], Some(&condition))
            .unwrap_err();
        assert!(matches!(err, StoreError::ConditionFailed));

        // The failed append left nothing behind.
        let count = store.read_all(ReadOptions::new()).unwrap().count();
        assert_eq!(count, 1);
    }

    #[test]
    fn conditional_append_passes_with_after_at_last_seen() {
        let store = store();
        store
            .append(&[event("list_created", &["list:1"])], None)
            .unwrap();
        let seen = store.head().unwrap().unwrap();

        let condition =
            AppendCondition::new(Query::of_types(["list_created"])).after(seen);
        store
            .append(&[event("item_added", &["list:1"])], Some(&condition))
            .unwrap();

        assert_eq!(store.read_all(ReadOptions::new()).unwrap().count(), 2);
    }

    #[test]
    fn read_merges_overlapping_query_items_without_duplicates() {
        let store = store();
        store.append(&[event("t1", &["a", "b"])], None).unwrap();
        store.append(&[event("t2", &["a"])], None).unwrap();

        let query = Query::any_of([
            tidemark_core::QueryItem::of_types(["t1", "t2"]),
            tidemark_core::QueryItem::of_tags(["a"]),
        ]);
        let events: Vec<StoredEvent> = store
            .read(&query, ReadOptions::new())
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        let kinds: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(kinds, vec!["t1", "t2"]);
    }

    #[test]
    fn read_honors_after_and_limit() {
        let store = store();
        for _ in 0..5 {
            store.append(&[event("tick", &[])], None).unwrap();
        }

        let all: Vec<StoredEvent> = store
            .read_all(ReadOptions::new())
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(all.len(), 5);

        let rest: Vec<StoredEvent> = store
            .read(
                &Query::of_types(["tick"]),
                ReadOptions::new().after(all[1].position),
            )
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(rest.len(), 3);
        assert_eq!(rest[0].position, all[2].position);

        let capped = store
            .read(&Query::of_types(["tick"]), ReadOptions::new().limit(2))
            .unwrap()
            .count();
        assert_eq!(capped, 2);
    }

    #[test]
    fn canceled_reads_end_with_an_error() {
        let store = store();
        store.append(&[event("tick", &[])], None).unwrap();

        let token = tidemark_core::CancelToken::new();
        token.cancel();
        let mut iter = store
            .read_all(ReadOptions::new().cancel(token))
            .unwrap();
        assert!(matches!(
            iter.next(),
            Some(Err(StoreError::Kv(KvError::Canceled)))
        ));
        assert!(iter.next().is_none());
    }

    #[test]
    fn tag_queries_require_all_tags() {
        let store = store();
        store.append(&[event("t", &["a", "b"])], None).unwrap();
        store.append(&[event("t", &["a"])], None).unwrap();

        let both: Vec<_> = store
            .read(&Query::of_tags(["a", "b"]), ReadOptions::new())
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(both.len(), 1);
        assert_eq!(both[0].tags, vec!["a", "b"]);
    }

    #[test]
    fn unconstrained_reads_are_rejected() {
        let store = store();
        let err = store
            .read(&Query::default(), ReadOptions::new())
            .err()
            .map(|e| e.kind());
        assert_eq!(err, Some("invalid_query"));
    }
}
