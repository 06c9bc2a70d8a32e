//! Query planning: translating a [`Query`] into index key ranges.

use tidemark_core::tuple::{key_after, strinc, Element};
use tidemark_core::{Query, Subspace, Versionstamp};
use tidemark_kv::ReadOps;

use crate::StoreError;

/// Marker segment separating the tag path from the type/position layer of a
/// tag-tree key.
pub(crate) const TAG_EVENTS_SEGMENT: &str = "_e";

/// One `[begin, end)` scan over an index, yielding keys in position order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct KeyRange {
    pub begin: Vec<u8>,
    pub end: Vec<u8>,
}

/// Translate `query` into index ranges.
///
/// Tag-only items discover the distinct event types below the tag path with a
/// skip-scan, so the caller never intersects ranges client-side: the tag tree
/// already materializes every tag subset.
pub(crate) fn plan_ranges(
    reader: &mut impl ReadOps,
    types: &Subspace,
    tags: &Subspace,
    query: &Query,
    after: Option<&Versionstamp>,
) -> Result<Vec<KeyRange>, StoreError> {
    if query.items.is_empty() {
        return Err(StoreError::InvalidQuery("query has no items".into()));
    }

    let mut ranges = Vec::new();
    for item in &query.items {
        if item.is_unconstrained() {
            return Err(StoreError::InvalidQuery(
                "query item has neither types nor tags".into(),
            ));
        }

        let canonical = item.canonical_tags();
        if canonical.is_empty() {
            for event_type in &item.types {
                ranges.push(position_range(
                    &types.subspace(&[Element::str(event_type.clone())]),
                    after,
                ));
            }
            continue;
        }

        let mut path: Vec<Element> = canonical.into_iter().map(Element::Str).collect();
        path.push(Element::str(TAG_EVENTS_SEGMENT));
        let dir = tags.subspace(&path);

        if item.types.is_empty() {
            for event_type in discover_types(reader, &dir)? {
                ranges.push(position_range(
                    &dir.subspace(&[Element::Str(event_type)]),
                    after,
                ));
            }
        } else {
            for event_type in &item.types {
                ranges.push(position_range(
                    &dir.subspace(&[Element::str(event_type.clone())]),
                    after,
                ));
            }
        }
    }

    Ok(ranges)
}

/// True if any range of `query` holds at least one key past `after`.
pub(crate) fn query_exists(
    reader: &mut impl ReadOps,
    types: &Subspace,
    tags: &Subspace,
    query: &Query,
    after: Option<&Versionstamp>,
) -> Result<bool, StoreError> {
    for range in plan_ranges(reader, types, tags, query, after)? {
        if !reader.range(&range.begin, &range.end, 1, false)?.is_empty() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// The scan over one `<...>/<type>/<VS>` layer, starting byte-exclusive past
/// `after` when present.
fn position_range(space: &Subspace, after: Option<&Versionstamp>) -> KeyRange {
    let (mut begin, end) = space.range();
    if let Some(after) = after {
        begin = key_after(&space.pack(&[Element::Versionstamp(*after)]));
    }
    KeyRange { begin, end }
}

/// Enumerate the distinct event types directly below `dir` with a one-key
/// skip-scan per type.
fn discover_types(
    reader: &mut impl ReadOps,
    dir: &Subspace,
) -> Result<Vec<String>, StoreError> {
    let (mut begin, end) = dir.range();
    let mut found = Vec::new();
    loop {
        let page = reader.range(&begin, &end, 1, false)?;
        let Some(first) = page.first() else {
            return Ok(found);
        };
        let elements = dir
            .unpack(&first.key)
            .map_err(|e| StoreError::Corrupt(format!("tag index key: {e}")))?;
        let event_type = elements
            .first()
            .and_then(Element::as_str)
            .ok_or_else(|| StoreError::Corrupt("tag index key missing type segment".into()))?
            .to_string();

        begin = strinc(&dir.pack(&[Element::str(event_type.clone())]));
        found.push(event_type);
    }
}
