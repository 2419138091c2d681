//! Write-intent batches
//!
//! `TransactionBatch` is one all-or-nothing store transaction and is never
//! split. `BulkBatch` is a sequence of independent per-item writes that is
//! chunked to the store's item limit; each chunk is atomic on its own and the
//! items must be idempotent so a failed run can be resumed.

use tracing::{debug, warn};

use crate::error::{ProjectionError, Result};
use crate::model::{ItemKey, StoreItem, TypedItem, Versioned};
use crate::store::{Condition, ItemStore, WriteIntent};

#[derive(Debug, Clone)]
pub struct TransactionBatch {
    operation: &'static str,
    intents: Vec<WriteIntent>,
}

impl TransactionBatch {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            intents: Vec::new(),
        }
    }

    pub fn put(&mut self, key: ItemKey, item: StoreItem, condition: Condition) -> &mut Self {
        self.intents.push(WriteIntent::Put { key, item, condition });
        self
    }

    /// Create a row that must not exist yet
    pub fn create<T: TypedItem>(&mut self, key: ItemKey, value: T) -> &mut Self {
        self.put(key, value.into_item(), Condition::NotExists)
    }

    /// Replace a row, conditioned on the version it was read at
    pub fn replace<T: TypedItem>(&mut self, read: &Versioned<T>, value: T) -> &mut Self {
        self.put(read.key.clone(), value.into_item(), Condition::VersionEquals(read.version))
    }

    /// Delete a row, conditioned on the version it was read at
    pub fn remove<T>(&mut self, read: &Versioned<T>) -> &mut Self {
        self.intents.push(WriteIntent::Delete {
            key: read.key.clone(),
            condition: Condition::VersionEquals(read.version),
        });
        self
    }

    /// Assert a row is unchanged without writing it
    pub fn check(&mut self, key: ItemKey, condition: Condition) -> &mut Self {
        self.intents.push(WriteIntent::Check { key, condition });
        self
    }

    pub fn len(&self) -> usize {
        self.intents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }

    pub fn intents(&self) -> &[WriteIntent] {
        &self.intents
    }

    /// Partitions touched by this batch, in first-seen order
    pub fn partitions(&self) -> Vec<String> {
        let mut partitions: Vec<String> = Vec::new();
        for intent in &self.intents {
            let pk = &intent.key().pk;
            if !partitions.contains(pk) {
                partitions.push(pk.clone());
            }
        }
        partitions
    }

    /// Submit as a single store transaction and return the partitions it
    /// touched. A batch over the store's item limit is rejected before
    /// anything is written.
    pub async fn submit(self, store: &dyn ItemStore) -> Result<Vec<String>> {
        let limit = store.max_transaction_items();
        if self.intents.len() > limit {
            warn!(
                operation = self.operation,
                items = self.intents.len(),
                limit,
                "Structural batch exceeds transaction limit"
            );
            return Err(ProjectionError::TransactionTooLarge {
                items: self.intents.len(),
                limit,
            });
        }

        let items = self.intents.len();
        let partitions = self.partitions();
        store.transact(self.intents).await?;
        debug!(operation = self.operation, items, partitions = partitions.len(), "Structural batch committed");
        Ok(partitions)
    }
}

/// Outcome of a completed bulk run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkReport {
    pub committed: usize,
    pub chunks: usize,
}

#[derive(Debug, Clone)]
pub struct BulkBatch {
    operation: &'static str,
    intents: Vec<WriteIntent>,
}

impl BulkBatch {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            intents: Vec::new(),
        }
    }

    /// Add one item. Items must not depend on each other: any prefix of the
    /// batch may end up applied alone.
    pub fn push(&mut self, intent: WriteIntent) -> &mut Self {
        self.intents.push(intent);
        self
    }

    pub fn len(&self) -> usize {
        self.intents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }

    /// Submit in chunks of at most the store's item limit, sequentially. The
    /// first failing chunk stops the run with `PartialBulk`; earlier chunks
    /// stay applied.
    pub async fn submit(self, store: &dyn ItemStore) -> Result<BulkReport> {
        let total = self.intents.len();
        let chunk_size = store.max_transaction_items().max(1);
        let mut report = BulkReport {
            committed: 0,
            chunks: 0,
        };

        let mut remaining = self.intents.into_iter().peekable();
        while remaining.peek().is_some() {
            let chunk: Vec<WriteIntent> = remaining.by_ref().take(chunk_size).collect();
            let size = chunk.len();

            if let Err(e) = store.transact(chunk).await {
                warn!(
                    operation = self.operation,
                    committed = report.committed,
                    total,
                    error = %e,
                    "Bulk chunk failed; run is resumable"
                );
                return Err(ProjectionError::PartialBulk {
                    committed: report.committed,
                    total,
                    reason: e.to_string(),
                });
            }

            report.committed += size;
            report.chunks += 1;
            debug!(operation = self.operation, chunk = report.chunks, size, "Bulk chunk committed");
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Group, StoreItem};
    use crate::store::MemoryStore;

    fn group(id: &str) -> Group {
        Group {
            group_id: id.into(),
            group_name: id.into(),
            member_ids: vec![],
            public: false,
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn test_oversized_batch_never_touches_store() {
        let store = MemoryStore::with_transaction_limit(2);
        let mut batch = TransactionBatch::new("test");
        for id in ["a", "b", "c"] {
            batch.create(ItemKey::group(id), group(id));
        }
        assert!(matches!(
            batch.submit(&store).await,
            Err(ProjectionError::TransactionTooLarge { items: 3, limit: 2 })
        ));
        assert!(store.operations().is_empty());
    }

    #[tokio::test]
    async fn test_failed_check_cancels_batch() {
        let store = MemoryStore::new();
        let seeded = store
            .put(ItemKey::group("a"), group("a").into_item(), Condition::NotExists)
            .await
            .unwrap();

        let mut batch = TransactionBatch::new("test");
        batch
            .create(ItemKey::group("b"), group("b"))
            .check(ItemKey::group("a"), Condition::VersionEquals(seeded.version + 1));
        assert!(matches!(
            batch.submit(&store).await,
            Err(ProjectionError::TransactionCanceled { index: 1, .. })
        ));
        assert!(store.get(&ItemKey::group("b")).await.unwrap().is_none());

        let mut batch = TransactionBatch::new("test");
        batch
            .create(ItemKey::group("b"), group("b"))
            .check(ItemKey::group("a"), Condition::VersionEquals(seeded.version));
        assert_eq!(batch.submit(&store).await.unwrap(), vec!["GROUP#b".to_string(), "GROUP#a".to_string()]);
    }

    #[tokio::test]
    async fn test_partitions_in_first_seen_order() {
        let mut batch = TransactionBatch::new("test");
        batch
            .create(ItemKey::group("b"), group("b"))
            .create(ItemKey::group("a"), group("a"))
            .check(ItemKey::group("b"), Condition::Always);
        assert_eq!(batch.partitions(), vec!["GROUP#b".to_string(), "GROUP#a".to_string()]);
    }

    #[tokio::test]
    async fn test_bulk_chunks_by_limit() {
        let store = MemoryStore::with_transaction_limit(3);
        let mut bulk = BulkBatch::new("seed");
        for i in 0..7 {
            let id = format!("g{}", i);
            bulk.push(WriteIntent::Put {
                key: ItemKey::group(&id),
                item: StoreItem::Group(group(&id)),
                condition: Condition::NotExists,
            });
        }
        let report = bulk.submit(&store).await.unwrap();
        assert_eq!(report, BulkReport { committed: 7, chunks: 3 });
        assert_eq!(store.len(), 7);
    }

    #[tokio::test]
    async fn test_bulk_failure_reports_progress() {
        let store = MemoryStore::with_transaction_limit(2);
        store
            .put(ItemKey::group("g3"), StoreItem::Group(group("g3")), Condition::NotExists)
            .await
            .unwrap();

        let mut bulk = BulkBatch::new("seed");
        for i in 0..5 {
            let id = format!("g{}", i);
            bulk.push(WriteIntent::Put {
                key: ItemKey::group(&id),
                item: StoreItem::Group(group(&id)),
                condition: Condition::NotExists,
            });
        }
        match bulk.submit(&store).await {
            Err(ProjectionError::PartialBulk { committed, total, .. }) => {
                assert_eq!(committed, 2);
                assert_eq!(total, 5);
            }
            other => panic!("unexpected {:?}", other),
        }
        // g0, g1 from the first chunk plus the pre-existing g3
        assert_eq!(store.len(), 3);
    }
}
