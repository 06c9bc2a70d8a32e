//! Queries over the event log and append conditions built from them.

use crate::version::Versionstamp;

/// One disjunct of a [`Query`]: matches events whose type is any of `types`
/// (OR) and which carry every tag in `tags` (AND). A query item with neither
/// types nor tags is rejected at read time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryItem {
    pub types: Vec<String>,
    pub tags: Vec<String>,
}

impl QueryItem {
    pub fn new(
        types: impl IntoIterator<Item = impl Into<String>>,
        tags: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            types: types.into_iter().map(Into::into).collect(),
            tags: tags.into_iter().map(Into::into).collect(),
        }
    }

    pub fn of_types(types: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::new(types, Vec::<String>::new())
    }

    pub fn of_tags(tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::new(Vec::<String>::new(), tags)
    }

    /// Neither types nor tags: not a valid read constraint.
    pub fn is_unconstrained(&self) -> bool {
        self.types.is_empty() && self.tags.is_empty()
    }

    /// Tags sorted alphabetically with duplicates removed, the canonical
    /// layout used by the tag index.
    pub fn canonical_tags(&self) -> Vec<String> {
        let mut tags = self.tags.clone();
        tags.sort();
        tags.dedup();
        tags
    }
}

/// An OR-union of [`QueryItem`]s.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Query {
    pub items: Vec<QueryItem>,
}

impl Query {
    pub fn single(item: QueryItem) -> Self {
        Self { items: vec![item] }
    }

    pub fn any_of(items: impl IntoIterator<Item = QueryItem>) -> Self {
        Self {
            items: items.into_iter().collect(),
        }
    }

    /// Shorthand for a single types-only item.
    pub fn of_types(types: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::single(QueryItem::of_types(types))
    }

    /// Shorthand for a single tags-only item.
    pub fn of_tags(tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::single(QueryItem::of_tags(tags))
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Guard evaluated inside the append transaction: the append commits only if
/// `query` matches no event positioned after `after` (no event at all when
/// `after` is `None`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendCondition {
    pub query: Query,
    pub after: Option<Versionstamp>,
}

impl AppendCondition {
    pub fn new(query: Query) -> Self {
        Self { query, after: None }
    }

    pub fn after(mut self, position: Versionstamp) -> Self {
        self.after = Some(position);
        self
    }
}
