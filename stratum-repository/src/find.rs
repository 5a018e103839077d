//! Find options and result cursors.
//!
//! A find runs in three stages over the materialized `(id, document)` pairs
//! of a collection: condition filter, then a stable multi-key sort, then
//! the skip/limit window. Each stage wraps the previous iterator; only the
//! sort has to buffer.

use std::fmt;

use stratum_core::{Condition, Document, EntityId, SortOrder, SortSpec};

/// Parameters of a find.
///
/// ```ignore
/// let options = FindOptions::new()
///     .condition(Condition::gt("n", 1))
///     .sort("n", SortOrder::Ascending)
///     .limit(10);
/// ```
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    skip: usize,
    limit: Option<usize>,
    condition: Option<Condition>,
    sort: SortSpec,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for a find with only a condition.
    pub fn matching(condition: Condition) -> Self {
        Self::new().condition(condition)
    }

    /// Skip the first `n` results.
    pub fn skip(mut self, n: usize) -> Self {
        self.skip = n;
        self
    }

    /// Return at most `n` results.
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Add a sort key. Repeat for a multi-key sort; earlier keys win.
    pub fn sort(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort.push(field, order);
        self
    }

    pub fn sort_spec(&self) -> &SortSpec {
        &self.sort
    }

    /// Number of leading results dropped.
    pub fn skip_count(&self) -> usize {
        self.skip
    }

    pub fn result_limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn filter_condition(&self) -> Option<&Condition> {
        self.condition.as_ref()
    }

    /// Run the filter, sort and window stages over `entries`.
    pub(crate) fn apply(&self, entries: Vec<(EntityId, Document)>) -> Cursor<Document> {
        let filtered: Box<dyn Iterator<Item = (EntityId, Document)> + '_> = match &self.condition {
            Some(condition) => Box::new(
                entries
                    .into_iter()
                    .filter(move |(id, doc)| condition.matches(id, doc)),
            ),
            None => Box::new(entries.into_iter()),
        };

        let sorted: Box<dyn Iterator<Item = (EntityId, Document)> + '_> = if self.sort.is_empty() {
            filtered
        } else {
            let mut buffered: Vec<_> = filtered.collect();
            // sort_by is stable: equal keys keep enumeration order.
            buffered.sort_by(|(_, a), (_, b)| self.sort.compare(a, b));
            Box::new(buffered.into_iter())
        };

        let windowed = sorted
            .skip(self.skip)
            .take(self.limit.unwrap_or(usize::MAX));
        Cursor::new(windowed.collect())
    }
}

/// Finite, forward-only result of a find.
///
/// [`size`](Cursor::size) is the total number of results regardless of how
/// many have been consumed.
pub struct Cursor<T> {
    size: usize,
    items: std::vec::IntoIter<(EntityId, T)>,
}

impl<T> Cursor<T> {
    pub(crate) fn new(items: Vec<(EntityId, T)>) -> Self {
        Self {
            size: items.len(),
            items: items.into_iter(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Ids of the remaining results, consuming the cursor.
    pub fn ids(self) -> Vec<EntityId> {
        self.items.map(|(id, _)| id).collect()
    }

    /// Convert every remaining value, stopping at the first failure.
    pub(crate) fn try_map<U, E>(self, mut f: impl FnMut(T) -> Result<U, E>) -> Result<Cursor<U>, E> {
        let items = self
            .items
            .map(|(id, value)| f(value).map(|value| (id, value)))
            .collect::<Result<Vec<_>, E>>()?;
        Ok(Cursor::new(items))
    }
}

impl<T> Iterator for Cursor<T> {
    type Item = (EntityId, T);

    fn next(&mut self) -> Option<Self::Item> {
        self.items.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.items.size_hint()
    }
}

impl<T> ExactSizeIterator for Cursor<T> {}

impl<T> fmt::Debug for Cursor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("size", &self.size)
            .field("remaining", &self.items.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use uuid::Uuid;

    fn doc(value: serde_json::Value) -> Document {
        Document::from_value(value).unwrap()
    }

    fn records() -> (Vec<EntityId>, Vec<(EntityId, Document)>) {
        let ids: Vec<_> = (0..3).map(|_| Uuid::now_v7()).collect();
        let entries = vec![
            (ids[0], doc(json!({"n": 3}))),
            (ids[1], doc(json!({"n": 1}))),
            (ids[2], doc(json!({"n": 2}))),
        ];
        (ids, entries)
    }

    #[test]
    fn test_filter_then_sort() {
        let (ids, entries) = records();
        let cursor = FindOptions::new()
            .condition(Condition::gt("n", 1))
            .sort("n", SortOrder::Ascending)
            .apply(entries);
        assert_eq!(cursor.size(), 2);
        assert_eq!(cursor.ids(), vec![ids[2], ids[0]]);
    }

    #[test]
    fn test_window_over_sorted_records() {
        let (ids, entries) = records();
        let cursor = FindOptions::new()
            .sort("n", SortOrder::Ascending)
            .skip(1)
            .limit(1)
            .apply(entries);
        assert_eq!(cursor.ids(), vec![ids[2]]);
    }

    #[test]
    fn test_builder_settings_are_readable() {
        let options = FindOptions::matching(Condition::gt("n", 1)).skip(2).limit(5);
        assert_eq!(options.skip_count(), 2);
        assert_eq!(options.result_limit(), Some(5));
        assert!(options.filter_condition().is_some());

        let empty = FindOptions::new();
        assert_eq!(empty.skip_count(), 0);
        assert_eq!(empty.result_limit(), None);
        assert!(empty.filter_condition().is_none());
    }

    #[test]
    fn test_no_options_returns_everything_in_order() {
        let (ids, entries) = records();
        let cursor = FindOptions::new().apply(entries);
        assert_eq!(cursor.size(), 3);
        assert_eq!(cursor.ids(), ids);
    }

    #[test]
    fn test_multi_key_sort_is_stable() {
        let ids: Vec<_> = (0..4).map(|_| Uuid::now_v7()).collect();
        let entries = vec![
            (ids[0], doc(json!({"team": "b", "score": 1}))),
            (ids[1], doc(json!({"team": "a", "score": 5}))),
            (ids[2], doc(json!({"team": "b", "score": 1}))),
            (ids[3], doc(json!({"team": "a", "score": 9}))),
        ];
        let cursor = FindOptions::new()
            .sort("team", SortOrder::Ascending)
            .sort("score", SortOrder::Descending)
            .apply(entries);
        assert_eq!(cursor.ids(), vec![ids[3], ids[1], ids[0], ids[2]]);
    }

    #[test]
    fn test_cursor_is_forward_only() {
        let (_, entries) = records();
        let mut cursor = FindOptions::new().apply(entries);
        assert_eq!(cursor.len(), 3);
        cursor.next();
        assert_eq!(cursor.len(), 2);
        assert_eq!(cursor.size(), 3);
        assert_eq!(cursor.by_ref().count(), 2);
        assert!(cursor.next().is_none());
    }

    #[test]
    fn test_predicate_sees_id() {
        let (ids, entries) = records();
        let wanted = ids[1];
        let cursor = FindOptions::matching(Condition::predicate(move |id, _| *id == wanted))
            .apply(entries);
        assert_eq!(cursor.ids(), vec![wanted]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_window_size(len in 0usize..40, skip in 0usize..50, limit in 0usize..50) {
            let entries: Vec<_> = (0..len)
                .map(|i| (Uuid::from_u128(i as u128), doc(json!({"i": i}))))
                .collect();
            let cursor = FindOptions::new().skip(skip).limit(limit).apply(entries);
            prop_assert_eq!(cursor.size(), len.saturating_sub(skip).min(limit));
        }

        #[test]
        fn prop_sorted_output_is_ordered(values in prop::collection::vec(-100i64..100, 0..30)) {
            let entries: Vec<_> = values
                .iter()
                .enumerate()
                .map(|(i, v)| (Uuid::from_u128(i as u128), doc(json!({"v": v}))))
                .collect();
            let spec = SortSpec::new().then("v", SortOrder::Ascending);
            let docs: Vec<Document> = FindOptions::new()
                .sort("v", SortOrder::Ascending)
                .apply(entries)
                .map(|(_, d)| d)
                .collect();
            for pair in docs.windows(2) {
                prop_assert_ne!(spec.compare(&pair[0], &pair[1]), std::cmp::Ordering::Greater);
            }
        }
    }
}
