//! Item store - canonical and projection rows in one partitioned table
//!
//! The engine only needs a small contract from its backing store:
//!
//! - point get by key
//! - conditional put/delete with an expected-version predicate
//! - atomic counter increment without a read step
//! - bounded all-or-nothing multi-item transactions
//! - range query over a partition's time index with a continuation position
//!
//! ## Backends
//!
//! - `MemoryStore` - in-process table with an execution log and fault
//!   injection, used by tests and embedders
//! - `SqliteStore` - durable single-table store (rusqlite)

pub mod memory;
pub mod schema;
pub mod sqlite;

use std::cmp::Ordering;
use std::collections::HashSet;
use std::ops::Bound;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ProjectionError, Result};
use crate::model::{CounterField, IndexEntry, ItemKey, Record, StoreItem, TypedItem, Versioned};

pub use memory::{MemoryStore, OpKind, StoreOperation};
pub use sqlite::SqliteStore;

/// Items accepted by one transaction unless a store says otherwise
pub const DEFAULT_TRANSACTION_LIMIT: usize = 100;

// ============================================================================
// Write conditions and intents
// ============================================================================

/// Precondition evaluated against the stored row at write time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// Unconditional write (repair path)
    Always,
    NotExists,
    Exists,
    /// Stored version must equal the version the caller read
    VersionEquals(u64),
}

impl Condition {
    /// Evaluate against the stored version (None when the row is absent)
    pub fn check(&self, stored: Option<u64>) -> std::result::Result<(), String> {
        match (self, stored) {
            (Condition::Always, _) => Ok(()),
            (Condition::NotExists, None) => Ok(()),
            (Condition::NotExists, Some(v)) => Err(format!("row exists at version {}", v)),
            (Condition::Exists, Some(_)) => Ok(()),
            (Condition::Exists, None) => Err("row does not exist".to_string()),
            (Condition::VersionEquals(expected), Some(v)) if *expected == v => Ok(()),
            (Condition::VersionEquals(expected), Some(v)) => {
                Err(format!("expected version {}, stored version {}", expected, v))
            }
            (Condition::VersionEquals(expected), None) => {
                Err(format!("expected version {}, row does not exist", expected))
            }
        }
    }
}

/// Version a row gets when written over `stored`
pub fn next_version(stored: Option<u64>) -> u64 {
    stored.map_or(1, |v| v + 1)
}

/// One write inside a transaction
#[derive(Debug, Clone, PartialEq)]
pub enum WriteIntent {
    Put {
        key: ItemKey,
        item: StoreItem,
        condition: Condition,
    },
    Delete {
        key: ItemKey,
        condition: Condition,
    },
    /// Assert a condition on a row without writing it
    Check {
        key: ItemKey,
        condition: Condition,
    },
}

impl WriteIntent {
    pub fn key(&self) -> &ItemKey {
        match self {
            WriteIntent::Put { key, .. } => key,
            WriteIntent::Delete { key, .. } => key,
            WriteIntent::Check { key, .. } => key,
        }
    }

    pub fn condition(&self) -> Condition {
        match self {
            WriteIntent::Put { condition, .. } => *condition,
            WriteIntent::Delete { condition, .. } => *condition,
            WriteIntent::Check { condition, .. } => *condition,
        }
    }
}

/// Reject transactions the store would refuse before touching any row
pub fn validate_transaction(intents: &[WriteIntent], limit: usize) -> Result<()> {
    if intents.len() > limit {
        return Err(ProjectionError::TransactionTooLarge {
            items: intents.len(),
            limit,
        });
    }

    let mut seen = HashSet::with_capacity(intents.len());
    for (index, intent) in intents.iter().enumerate() {
        if !seen.insert(intent.key()) {
            return Err(ProjectionError::TransactionCanceled {
                index,
                reason: format!("multiple operations on {}", intent.key()),
            });
        }
    }
    Ok(())
}

// ============================================================================
// Time-window queries
// ============================================================================

/// Which timestamp of a projection row the query ranges over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeIndex {
    Start,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Position of a row in a time index; total order is `(timestamp, entity_id)`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexPosition {
    pub timestamp: i64,
    pub entity_id: String,
}

impl IndexPosition {
    pub fn new(timestamp: i64, entity_id: impl Into<String>) -> Self {
        Self {
            timestamp,
            entity_id: entity_id.into(),
        }
    }
}

/// Range query over one partition's time index
#[derive(Debug, Clone)]
pub struct TimeQuery {
    pub partition: String,
    pub index: TimeIndex,
    pub lower: Bound<i64>,
    pub upper: Bound<i64>,
    /// Only rows whose effective end is at or after this instant
    pub min_end: Option<i64>,
    pub order: SortOrder,
    pub limit: usize,
    /// Continue strictly after this position (in query order)
    pub start_after: Option<IndexPosition>,
}

impl TimeQuery {
    pub fn new(partition: impl Into<String>, index: TimeIndex) -> Self {
        Self {
            partition: partition.into(),
            index,
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
            min_end: None,
            order: SortOrder::Ascending,
            limit: 20,
            start_after: None,
        }
    }

    pub fn range(mut self, lower: Bound<i64>, upper: Bound<i64>) -> Self {
        self.lower = lower;
        self.upper = upper;
        self
    }

    pub fn with_min_end(mut self, min_end: i64) -> Self {
        self.min_end = Some(min_end);
        self
    }

    pub fn order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn start_after(mut self, position: Option<IndexPosition>) -> Self {
        self.start_after = position;
        self
    }

    /// Position of `entry` in this query's index if the row matches the
    /// range, the end filter, and lies after the continuation position.
    pub fn admit(&self, entry: &IndexEntry) -> Option<IndexPosition> {
        let timestamp = match self.index {
            TimeIndex::Start => entry.start?,
            TimeIndex::End => entry.end?,
        };

        let in_lower = match self.lower {
            Bound::Included(l) => timestamp >= l,
            Bound::Excluded(l) => timestamp > l,
            Bound::Unbounded => true,
        };
        let in_upper = match self.upper {
            Bound::Included(u) => timestamp <= u,
            Bound::Excluded(u) => timestamp < u,
            Bound::Unbounded => true,
        };
        if !in_lower || !in_upper {
            return None;
        }

        if let Some(min_end) = self.min_end {
            match entry.end {
                Some(end) if end >= min_end => {}
                _ => return None,
            }
        }

        let position = IndexPosition::new(timestamp, entry.entity_id.clone());
        if let Some(ref after) = self.start_after {
            if self.compare(&position, after) != Ordering::Greater {
                return None;
            }
        }
        Some(position)
    }

    /// Compare positions in this query's order
    pub fn compare(&self, a: &IndexPosition, b: &IndexPosition) -> Ordering {
        match self.order {
            SortOrder::Ascending => a.cmp(b),
            SortOrder::Descending => b.cmp(a),
        }
    }
}

/// One page of a time-window query
#[derive(Debug, Clone, Default)]
pub struct QueryPage {
    pub items: Vec<Record>,
    /// Position of the last returned row when more rows may follow
    pub last_position: Option<IndexPosition>,
}

impl QueryPage {
    pub fn has_more(&self) -> bool {
        self.last_position.is_some()
    }
}

// ============================================================================
// Store contract
// ============================================================================

#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Maximum intents accepted by `transact`
    fn max_transaction_items(&self) -> usize;

    async fn get(&self, key: &ItemKey) -> Result<Option<Record>>;

    /// Write `item` if `condition` holds; returns the stored record
    async fn put(&self, key: ItemKey, item: StoreItem, condition: Condition) -> Result<Record>;

    /// Delete if `condition` holds; returns whether a row was removed
    async fn delete(&self, key: &ItemKey, condition: Condition) -> Result<bool>;

    /// `field = field + delta` in one step; bumps the row version
    async fn increment(&self, key: &ItemKey, field: CounterField, delta: i64) -> Result<Record>;

    /// Apply every intent or none
    async fn transact(&self, intents: Vec<WriteIntent>) -> Result<()>;

    async fn query_window(&self, query: &TimeQuery) -> Result<QueryPage>;

    /// Rows of one partition whose sort key starts with `sk_prefix`, in sort-key order
    async fn query_partition(&self, pk: &str, sk_prefix: &str) -> Result<Vec<Record>>;
}

/// Typed point read
pub async fn get_typed<T: TypedItem>(store: &dyn ItemStore, key: &ItemKey) -> Result<Option<Versioned<T>>> {
    match store.get(key).await? {
        Some(record) => record.into_typed().map(Some),
        None => Ok(None),
    }
}

/// Typed point read that treats absence as `NotFound`
pub async fn require_typed<T: TypedItem>(store: &dyn ItemStore, key: &ItemKey) -> Result<Versioned<T>> {
    get_typed(store, key)
        .await?
        .ok_or_else(|| ProjectionError::NotFound(format!("{} {}", T::KIND, key)))
}

/// Typed partition read; rows of other types under the prefix are skipped
pub async fn query_typed<T: TypedItem>(
    store: &dyn ItemStore,
    pk: &str,
    sk_prefix: &str,
) -> Result<Vec<Versioned<T>>> {
    let records = store.query_partition(pk, sk_prefix).await?;
    Ok(records
        .into_iter()
        .filter_map(|r| r.into_typed::<T>().ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, start: Option<i64>, end: Option<i64>) -> IndexEntry {
        IndexEntry {
            entity_id: id.into(),
            start,
            end,
        }
    }

    #[test]
    fn test_condition_check() {
        assert!(Condition::Always.check(Some(3)).is_ok());
        assert!(Condition::NotExists.check(None).is_ok());
        assert!(Condition::NotExists.check(Some(1)).is_err());
        assert!(Condition::Exists.check(None).is_err());
        assert!(Condition::VersionEquals(2).check(Some(2)).is_ok());
        assert!(Condition::VersionEquals(2).check(Some(3)).is_err());
        assert!(Condition::VersionEquals(2).check(None).is_err());
        assert_eq!(next_version(None), 1);
        assert_eq!(next_version(Some(4)), 5);
    }

    #[test]
    fn test_validate_transaction_limits() {
        let intent = |sk: &str| WriteIntent::Check {
            key: ItemKey::new("P", sk),
            condition: Condition::Exists,
        };
        assert!(validate_transaction(&[intent("a"), intent("b")], 2).is_ok());
        assert!(matches!(
            validate_transaction(&[intent("a"), intent("b"), intent("c")], 2),
            Err(ProjectionError::TransactionTooLarge { items: 3, limit: 2 })
        ));
        assert!(matches!(
            validate_transaction(&[intent("a"), intent("a")], 5),
            Err(ProjectionError::TransactionCanceled { index: 1, .. })
        ));
    }

    #[test]
    fn test_admit_range_and_filter() {
        let q = TimeQuery::new("GROUP#g", TimeIndex::Start)
            .range(Bound::Unbounded, Bound::Included(100))
            .with_min_end(100);
        assert!(q.admit(&entry("a", Some(50), Some(150))).is_some());
        assert!(q.admit(&entry("b", Some(50), Some(90))).is_none());
        assert!(q.admit(&entry("c", Some(101), Some(150))).is_none());
        assert!(q.admit(&entry("d", None, None)).is_none());
    }

    #[test]
    fn test_admit_respects_continuation_in_order() {
        let asc = TimeQuery::new("GROUP#g", TimeIndex::Start)
            .start_after(Some(IndexPosition::new(10, "b")));
        assert!(asc.admit(&entry("a", Some(10), None)).is_none());
        assert!(asc.admit(&entry("c", Some(10), None)).is_some());

        let desc = TimeQuery::new("GROUP#g", TimeIndex::End)
            .order(SortOrder::Descending)
            .start_after(Some(IndexPosition::new(10, "b")));
        assert!(desc.admit(&entry("a", Some(1), Some(10))).is_some());
        assert!(desc.admit(&entry("c", Some(1), Some(10))).is_none());
        assert!(desc.admit(&entry("z", Some(1), Some(11))).is_none());
    }
}
