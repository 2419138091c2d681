//! In-memory item store
//!
//! A `BTreeMap` keyed by `(pk, sk)` behind a mutex, so partition scans come
//! back in sort-key order. Every write attempt is appended to an execution
//! log. Tests can inject a transaction failure after item k, or simulate a
//! concurrent writer winning the next conditional puts.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{debug, trace};

use super::{
    next_version, validate_transaction, Condition, ItemStore, QueryPage, TimeQuery, WriteIntent,
    DEFAULT_TRANSACTION_LIMIT,
};
use crate::error::{ProjectionError, Result};
use crate::model::{CounterField, ItemKey, Record, StoreItem};

/// Kind of write recorded in the execution log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpKind {
    Put { condition: Condition },
    Delete { condition: Condition },
    Increment { field: CounterField, delta: i64 },
    Transact { items: usize },
    /// Simulated foreign write injected by `interfere_with_next_puts`
    Interference,
}

/// One entry of the execution log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOperation {
    pub kind: OpKind,
    pub key: Option<ItemKey>,
    pub applied: bool,
}

/// Injected transaction failure: let `skip` transactions through, then fail
/// the next `remaining` ones at intent index `at`
#[derive(Debug, Clone, Copy)]
struct TransactionFault {
    skip: usize,
    at: usize,
    remaining: usize,
}

#[derive(Default)]
struct Inner {
    rows: BTreeMap<ItemKey, Record>,
    log: Vec<StoreOperation>,
    fault: Option<TransactionFault>,
    interfering_puts: usize,
}

/// In-memory store with an execution log
pub struct MemoryStore {
    inner: Mutex<Inner>,
    transaction_limit: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_transaction_limit(DEFAULT_TRANSACTION_LIMIT)
    }

    pub fn with_transaction_limit(limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            transaction_limit: limit,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|e| ProjectionError::Internal(format!("Lock poisoned: {}", e)))
    }

    /// Snapshot of the execution log
    pub fn operations(&self) -> Vec<StoreOperation> {
        self.lock().map(|inner| inner.log.clone()).unwrap_or_default()
    }

    /// Clear the execution log
    pub fn clear_operations(&self) {
        if let Ok(mut inner) = self.lock() {
            inner.log.clear();
        }
    }

    /// Number of stored rows
    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make the next transaction fail after staging `after_items` intents.
    /// Nothing from that transaction is committed.
    pub fn fail_next_transaction_at(&self, after_items: usize) {
        self.fail_transactions(0, 1, after_items);
    }

    /// Let `skip` transactions commit, then fail the following `count`
    /// transactions after staging `after_items` intents each.
    pub fn fail_transactions(&self, skip: usize, count: usize, after_items: usize) {
        if let Ok(mut inner) = self.lock() {
            inner.fault = (count > 0).then_some(TransactionFault {
                skip,
                at: after_items,
                remaining: count,
            });
        }
    }

    /// Make the next `count` version-checked puts lose to a simulated
    /// concurrent writer that bumps the row version first.
    pub fn interfere_with_next_puts(&self, count: usize) {
        if let Ok(mut inner) = self.lock() {
            inner.interfering_puts = count;
        }
    }

    fn take_fault(inner: &mut Inner) -> Option<usize> {
        let fault = inner.fault.as_mut()?;
        if fault.skip > 0 {
            fault.skip -= 1;
            return None;
        }
        let at = fault.at;
        fault.remaining = fault.remaining.saturating_sub(1);
        if fault.remaining == 0 {
            inner.fault = None;
        }
        Some(at)
    }

    fn record(inner: &mut Inner, kind: OpKind, key: Option<ItemKey>, applied: bool) {
        inner.log.push(StoreOperation { kind, key, applied });
    }
}

#[async_trait]
impl ItemStore for MemoryStore {
    fn max_transaction_items(&self) -> usize {
        self.transaction_limit
    }

    async fn get(&self, key: &ItemKey) -> Result<Option<Record>> {
        let inner = self.lock()?;
        Ok(inner.rows.get(key).cloned())
    }

    async fn put(&self, key: ItemKey, item: StoreItem, condition: Condition) -> Result<Record> {
        let mut inner = self.lock()?;

        if matches!(condition, Condition::VersionEquals(_)) && inner.interfering_puts > 0 {
            inner.interfering_puts -= 1;
            if let Some(row) = inner.rows.get_mut(&key) {
                row.version += 1;
                trace!(key = %key, version = row.version, "Injected concurrent write");
            }
            Self::record(&mut inner, OpKind::Interference, Some(key.clone()), true);
        }

        let stored = inner.rows.get(&key).map(|r| r.version);
        if let Err(reason) = condition.check(stored) {
            Self::record(&mut inner, OpKind::Put { condition }, Some(key.clone()), false);
            return Err(ProjectionError::ConditionFailed { key, reason });
        }

        let record = Record {
            key: key.clone(),
            version: next_version(stored),
            item,
        };
        inner.rows.insert(key.clone(), record.clone());
        Self::record(&mut inner, OpKind::Put { condition }, Some(key), true);
        Ok(record)
    }

    async fn delete(&self, key: &ItemKey, condition: Condition) -> Result<bool> {
        let mut inner = self.lock()?;
        let stored = inner.rows.get(key).map(|r| r.version);
        if let Err(reason) = condition.check(stored) {
            Self::record(&mut inner, OpKind::Delete { condition }, Some(key.clone()), false);
            return Err(ProjectionError::ConditionFailed {
                key: key.clone(),
                reason,
            });
        }
        let removed = inner.rows.remove(key).is_some();
        Self::record(&mut inner, OpKind::Delete { condition }, Some(key.clone()), removed);
        Ok(removed)
    }

    async fn increment(&self, key: &ItemKey, field: CounterField, delta: i64) -> Result<Record> {
        let mut inner = self.lock()?;
        let kind = OpKind::Increment { field, delta };

        let Some(row) = inner.rows.get_mut(key) else {
            Self::record(&mut inner, kind, Some(key.clone()), false);
            return Err(ProjectionError::NotFound(key.to_string()));
        };
        let Some(counter) = row.item.counter_mut(field) else {
            let type_name = row.item.type_name();
            Self::record(&mut inner, kind, Some(key.clone()), false);
            return Err(ProjectionError::InvalidOperation(format!(
                "{} has no counter {}",
                type_name, field
            )));
        };
        *counter += delta;
        row.version += 1;
        let updated = row.clone();

        Self::record(&mut inner, kind, Some(key.clone()), true);
        Ok(updated)
    }

    async fn transact(&self, intents: Vec<WriteIntent>) -> Result<()> {
        validate_transaction(&intents, self.transaction_limit)?;
        if intents.is_empty() {
            return Ok(());
        }

        let mut inner = self.lock()?;
        let items = intents.len();
        let fail_at = Self::take_fault(&mut inner);

        // Stage against an overlay; rows are only touched once every intent passes
        let mut staged: HashMap<ItemKey, Option<Record>> = HashMap::with_capacity(items);
        for (index, intent) in intents.into_iter().enumerate() {
            if fail_at == Some(index) {
                Self::record(&mut inner, OpKind::Transact { items }, None, false);
                return Err(ProjectionError::TransactionCanceled {
                    index,
                    reason: "injected failure".to_string(),
                });
            }

            let stored = inner.rows.get(intent.key()).map(|r| r.version);
            if let Err(reason) = intent.condition().check(stored) {
                Self::record(&mut inner, OpKind::Transact { items }, Some(intent.key().clone()), false);
                return Err(ProjectionError::TransactionCanceled {
                    index,
                    reason: format!("{}: {}", intent.key(), reason),
                });
            }

            match intent {
                WriteIntent::Put { key, item, .. } => {
                    let record = Record {
                        key: key.clone(),
                        version: next_version(stored),
                        item,
                    };
                    staged.insert(key, Some(record));
                }
                WriteIntent::Delete { key, .. } => {
                    staged.insert(key, None);
                }
                WriteIntent::Check { .. } => {}
            }
        }

        for (key, row) in staged {
            match row {
                Some(record) => {
                    inner.rows.insert(key, record);
                }
                None => {
                    inner.rows.remove(&key);
                }
            }
        }
        Self::record(&mut inner, OpKind::Transact { items }, None, true);
        debug!(items, "Memory transaction committed");
        Ok(())
    }

    async fn query_window(&self, query: &TimeQuery) -> Result<QueryPage> {
        let inner = self.lock()?;
        let start = ItemKey::new(query.partition.clone(), String::new());

        let mut matches: Vec<_> = inner
            .rows
            .range((Bound::Included(start), Bound::Unbounded))
            .take_while(|(key, _)| key.pk == query.partition)
            .filter_map(|(_, record)| {
                let entry = record.item.index_entry()?;
                let position = query.admit(&entry)?;
                Some((position, record))
            })
            .collect();
        matches.sort_by(|(a, _), (b, _)| query.compare(a, b));

        let has_more = matches.len() > query.limit;
        matches.truncate(query.limit);

        let last_position = if has_more {
            matches.last().map(|(p, _)| p.clone())
        } else {
            None
        };
        Ok(QueryPage {
            items: matches.into_iter().map(|(_, r)| r.clone()).collect(),
            last_position,
        })
    }

    async fn query_partition(&self, pk: &str, sk_prefix: &str) -> Result<Vec<Record>> {
        let inner = self.lock()?;
        let start = ItemKey::new(pk, sk_prefix);
        Ok(inner
            .rows
            .range((Bound::Included(start), Bound::Unbounded))
            .take_while(|(key, _)| key.pk == pk && key.sk.starts_with(sk_prefix))
            .map(|(_, record)| record.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Group, HangoutPointer, Hangout, Visibility};
    use crate::store::{IndexPosition, SortOrder, TimeIndex};

    fn group(id: &str) -> StoreItem {
        StoreItem::Group(Group {
            group_id: id.into(),
            group_name: "Friends".into(),
            member_ids: vec![],
            public: false,
            created_at: 0,
        })
    }

    fn pointer(id: &str, start: Option<i64>, end: Option<i64>) -> StoreItem {
        StoreItem::HangoutPointer(HangoutPointer::from_hangout(
            "g1",
            &Hangout {
                hangout_id: id.into(),
                title: id.into(),
                description: None,
                start_timestamp: start,
                end_timestamp: end,
                location: None,
                visibility: Visibility::InviteOnly,
                associated_groups: vec!["g1".into()],
                series_id: None,
                carpool_enabled: false,
                created_at: 0,
            },
        ))
    }

    #[tokio::test]
    async fn test_conditional_put_versions() {
        let store = MemoryStore::new();
        let key = ItemKey::group("g1");

        let first = store.put(key.clone(), group("g1"), Condition::NotExists).await.unwrap();
        assert_eq!(first.version, 1);

        let err = store.put(key.clone(), group("g1"), Condition::NotExists).await.unwrap_err();
        assert!(err.is_conflict());

        let second = store.put(key.clone(), group("g1"), Condition::VersionEquals(1)).await.unwrap();
        assert_eq!(second.version, 2);

        assert!(store.put(key.clone(), group("g1"), Condition::VersionEquals(1)).await.is_err());
        assert_eq!(store.get(&key).await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_transaction_is_all_or_nothing() {
        let store = MemoryStore::new();
        store.put(ItemKey::group("g1"), group("g1"), Condition::NotExists).await.unwrap();

        let intents = vec![
            WriteIntent::Put {
                key: ItemKey::group("g2"),
                item: group("g2"),
                condition: Condition::NotExists,
            },
            WriteIntent::Put {
                key: ItemKey::group("g1"),
                item: group("g1"),
                condition: Condition::NotExists,
            },
        ];
        let err = store.transact(intents).await.unwrap_err();
        assert!(matches!(err, ProjectionError::TransactionCanceled { index: 1, .. }));
        assert!(store.get(&ItemKey::group("g2")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_failure_commits_nothing() {
        let store = MemoryStore::new();
        let intents: Vec<_> = (0..5)
            .map(|i| WriteIntent::Put {
                key: ItemKey::group(&format!("g{}", i)),
                item: group(&format!("g{}", i)),
                condition: Condition::NotExists,
            })
            .collect();

        store.fail_next_transaction_at(3);
        assert!(store.transact(intents.clone()).await.is_err());
        assert!(store.is_empty());

        store.transact(intents).await.unwrap();
        assert_eq!(store.len(), 5);
    }

    #[tokio::test]
    async fn test_transaction_limit() {
        let store = MemoryStore::with_transaction_limit(2);
        let intents: Vec<_> = (0..3)
            .map(|i| WriteIntent::Put {
                key: ItemKey::group(&format!("g{}", i)),
                item: group("g"),
                condition: Condition::Always,
            })
            .collect();
        assert!(matches!(
            store.transact(intents).await,
            Err(ProjectionError::TransactionTooLarge { items: 3, limit: 2 })
        ));
    }

    #[tokio::test]
    async fn test_increment_logs_and_bumps_version() {
        let store = MemoryStore::new();
        let key = ItemKey::hangout_pointer("g1", "h1");
        store.put(key.clone(), pointer("h1", Some(10), None), Condition::NotExists).await.unwrap();

        let updated = store.increment(&key, CounterField::ParticipantCount, 1).await.unwrap();
        assert_eq!(updated.version, 2);

        assert!(matches!(
            store.increment(&ItemKey::hangout_pointer("g1", "missing"), CounterField::ParticipantCount, 1).await,
            Err(ProjectionError::NotFound(_))
        ));
        assert!(matches!(
            store.increment(&key, CounterField::ClaimedSpots, 1).await,
            Err(ProjectionError::InvalidOperation(_))
        ));

        let applied: Vec<_> = store
            .operations()
            .into_iter()
            .filter(|op| matches!(op.kind, OpKind::Increment { .. }) && op.applied)
            .collect();
        assert_eq!(applied.len(), 1);
    }

    #[tokio::test]
    async fn test_query_window_pages() {
        let store = MemoryStore::new();
        for (id, start) in [("a", 10), ("b", 20), ("c", 20), ("d", 30)] {
            store
                .put(ItemKey::hangout_pointer("g1", id), pointer(id, Some(start), None), Condition::Always)
                .await
                .unwrap();
        }
        store
            .put(ItemKey::hangout_pointer("g1", "u"), pointer("u", None, None), Condition::Always)
            .await
            .unwrap();

        let query = TimeQuery::new("GROUP#g1", TimeIndex::Start).with_limit(2);
        let page = store.query_window(&query).await.unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.last_position, Some(IndexPosition::new(20, "b")));

        let page = store
            .query_window(&query.clone().start_after(page.last_position))
            .await
            .unwrap();
        let ids: Vec<_> = page.items.iter().map(|r| r.key.sk.clone()).collect();
        assert_eq!(ids, vec!["HANGOUT#c", "HANGOUT#d"]);
        assert!(!page.has_more());

        let desc = TimeQuery::new("GROUP#g1", TimeIndex::End)
            .order(SortOrder::Descending)
            .with_limit(10);
        let page = store.query_window(&desc).await.unwrap();
        assert_eq!(page.items.first().unwrap().key.sk, "HANGOUT#d");
        assert_eq!(page.items.len(), 4);
    }

    #[tokio::test]
    async fn test_query_partition_prefix() {
        let store = MemoryStore::new();
        store.put(ItemKey::hangout_pointer("g1", "h1"), pointer("h1", None, None), Condition::Always).await.unwrap();
        store.put(ItemKey::group("g1"), group("g1"), Condition::Always).await.unwrap();
        store.put(ItemKey::group("g2"), group("g2"), Condition::Always).await.unwrap();

        let rows = store.query_partition("GROUP#g1", "HANGOUT#").await.unwrap();
        assert_eq!(rows.len(), 1);
        let rows = store.query_partition("GROUP#g1", "").await.unwrap();
        assert_eq!(rows.len(), 2);
    }
}
