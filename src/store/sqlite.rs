//! SQLite-backed item store
//!
//! One `items` table holds every row. Conditional writes and transactions run
//! inside SQLite transactions; counters are a single `UPDATE` with
//! `json_set`, so no read happens on the increment path.

use std::ops::Bound;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use tracing::{debug, info};

use super::schema;
use super::{
    next_version, validate_transaction, Condition, IndexPosition, ItemStore, QueryPage, SortOrder,
    TimeIndex, TimeQuery, WriteIntent, DEFAULT_TRANSACTION_LIMIT,
};
use crate::error::{ProjectionError, Result};
use crate::model::{CounterField, ItemKey, Record, StoreItem};

/// SQLite item store
pub struct SqliteStore {
    conn: Mutex<Connection>,
    transaction_limit: usize,
}

impl SqliteStore {
    /// Open or create the item database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        info!("Opening SQLite item store at {:?}", path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ProjectionError::Database(format!("Failed to create {:?}: {}", parent, e)))?;
        }

        let conn = Connection::open(path)
            .map_err(|e| ProjectionError::Database(format!("Failed to open SQLite: {}", e)))?;

        // WAL for concurrent readers from other processes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| ProjectionError::Database(format!("Failed to set PRAGMA: {}", e)))?;

        schema::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            transaction_limit: DEFAULT_TRANSACTION_LIMIT,
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        debug!("Opening in-memory SQLite item store");

        let conn = Connection::open_in_memory()
            .map_err(|e| ProjectionError::Database(format!("Failed to open in-memory SQLite: {}", e)))?;
        schema::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            transaction_limit: DEFAULT_TRANSACTION_LIMIT,
        })
    }

    pub fn with_transaction_limit(mut self, limit: usize) -> Self {
        self.transaction_limit = limit;
        self
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ProjectionError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| ProjectionError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&mut conn)
    }

    /// Number of stored rows
    pub fn count(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))?;
            Ok(count as u64)
        })
    }
}

// ============================================================================
// Row helpers
// ============================================================================

fn read_version(conn: &Connection, key: &ItemKey) -> Result<Option<u64>> {
    let version: Option<i64> = conn
        .query_row(
            "SELECT version FROM items WHERE pk = ?1 AND sk = ?2",
            params![key.pk, key.sk],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version.map(|v| v as u64))
}

fn read_record(conn: &Connection, key: &ItemKey) -> Result<Option<Record>> {
    let row: Option<(i64, String)> = conn
        .query_row(
            "SELECT version, body FROM items WHERE pk = ?1 AND sk = ?2",
            params![key.pk, key.sk],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match row {
        Some((version, body)) => Ok(Some(Record {
            key: key.clone(),
            version: version as u64,
            item: serde_json::from_str(&body)?,
        })),
        None => Ok(None),
    }
}

fn write_row(conn: &Connection, key: &ItemKey, item: &StoreItem, version: u64) -> Result<()> {
    let body = serde_json::to_string(item)?;
    let index = item.index_entry();
    conn.execute(
        "INSERT OR REPLACE INTO items (pk, sk, version, item_type, entity_id, start_ts, end_ts, body, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, datetime('now'))",
        params![
            key.pk,
            key.sk,
            version as i64,
            item.type_name(),
            index.as_ref().map(|e| e.entity_id.clone()),
            index.as_ref().and_then(|e| e.start),
            index.as_ref().and_then(|e| e.end),
            body,
        ],
    )?;
    Ok(())
}

fn delete_row(conn: &Connection, key: &ItemKey) -> Result<bool> {
    let removed = conn.execute(
        "DELETE FROM items WHERE pk = ?1 AND sk = ?2",
        params![key.pk, key.sk],
    )?;
    Ok(removed > 0)
}

/// Apply one intent inside an open transaction
fn apply_intent(tx: &Transaction<'_>, index: usize, intent: &WriteIntent) -> Result<()> {
    let stored = read_version(tx, intent.key())?;
    intent
        .condition()
        .check(stored)
        .map_err(|reason| ProjectionError::TransactionCanceled {
            index,
            reason: format!("{}: {}", intent.key(), reason),
        })?;

    match intent {
        WriteIntent::Put { key, item, .. } => write_row(tx, key, item, next_version(stored)),
        WriteIntent::Delete { key, .. } => delete_row(tx, key).map(|_| ()),
        WriteIntent::Check { .. } => Ok(()),
    }
}

#[async_trait]
impl ItemStore for SqliteStore {
    fn max_transaction_items(&self) -> usize {
        self.transaction_limit
    }

    async fn get(&self, key: &ItemKey) -> Result<Option<Record>> {
        self.with_conn(|conn| read_record(conn, key))
    }

    async fn put(&self, key: ItemKey, item: StoreItem, condition: Condition) -> Result<Record> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let stored = read_version(&tx, &key)?;
            if let Err(reason) = condition.check(stored) {
                return Err(ProjectionError::ConditionFailed { key, reason });
            }

            let version = next_version(stored);
            write_row(&tx, &key, &item, version)?;
            tx.commit()?;

            Ok(Record { key, version, item })
        })
    }

    async fn delete(&self, key: &ItemKey, condition: Condition) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let stored = read_version(&tx, key)?;
            if let Err(reason) = condition.check(stored) {
                return Err(ProjectionError::ConditionFailed {
                    key: key.clone(),
                    reason,
                });
            }
            let removed = delete_row(&tx, key)?;
            tx.commit()?;
            Ok(removed)
        })
    }

    async fn increment(&self, key: &ItemKey, field: CounterField, delta: i64) -> Result<Record> {
        self.with_conn(|conn| {
            let path = format!("$.{}", field.attribute());
            let changed = conn.execute(
                "UPDATE items
                 SET body = json_set(body, ?1, COALESCE(json_extract(body, ?1), 0) + ?2),
                     version = version + 1,
                     updated_at = datetime('now')
                 WHERE pk = ?3 AND sk = ?4 AND item_type = ?5",
                params![path, delta, key.pk, key.sk, field.owner_type()],
            )?;

            if changed == 0 {
                return match read_version(conn, key)? {
                    Some(_) => Err(ProjectionError::InvalidOperation(format!(
                        "{} has no counter {}",
                        key, field
                    ))),
                    None => Err(ProjectionError::NotFound(key.to_string())),
                };
            }

            read_record(conn, key)?.ok_or_else(|| ProjectionError::NotFound(key.to_string()))
        })
    }

    async fn transact(&self, intents: Vec<WriteIntent>) -> Result<()> {
        validate_transaction(&intents, self.transaction_limit)?;
        if intents.is_empty() {
            return Ok(());
        }

        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            for (index, intent) in intents.iter().enumerate() {
                // Dropping `tx` on error rolls everything back
                apply_intent(&tx, index, intent)?;
            }
            tx.commit()?;
            debug!(items = intents.len(), "SQLite transaction committed");
            Ok(())
        })
    }

    async fn query_window(&self, query: &TimeQuery) -> Result<QueryPage> {
        let column = match query.index {
            TimeIndex::Start => "start_ts",
            TimeIndex::End => "end_ts",
        };
        let (direction, after_op) = match query.order {
            SortOrder::Ascending => ("ASC", ">"),
            SortOrder::Descending => ("DESC", "<"),
        };

        let mut sql = format!(
            "SELECT pk, sk, version, body, entity_id, {col} FROM items WHERE pk = ? AND {col} IS NOT NULL",
            col = column
        );
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(query.partition.clone())];

        match query.lower {
            Bound::Included(l) => {
                sql.push_str(&format!(" AND {} >= ?", column));
                params.push(Box::new(l));
            }
            Bound::Excluded(l) => {
                sql.push_str(&format!(" AND {} > ?", column));
                params.push(Box::new(l));
            }
            Bound::Unbounded => {}
        }
        match query.upper {
            Bound::Included(u) => {
                sql.push_str(&format!(" AND {} <= ?", column));
                params.push(Box::new(u));
            }
            Bound::Excluded(u) => {
                sql.push_str(&format!(" AND {} < ?", column));
                params.push(Box::new(u));
            }
            Bound::Unbounded => {}
        }
        if let Some(min_end) = query.min_end {
            sql.push_str(" AND end_ts IS NOT NULL AND end_ts >= ?");
            params.push(Box::new(min_end));
        }
        if let Some(ref after) = query.start_after {
            sql.push_str(&format!(
                " AND ({col} {op} ? OR ({col} = ? AND entity_id {op} ?))",
                col = column,
                op = after_op
            ));
            params.push(Box::new(after.timestamp));
            params.push(Box::new(after.timestamp));
            params.push(Box::new(after.entity_id.clone()));
        }

        sql.push_str(&format!(
            " ORDER BY {col} {dir}, entity_id {dir} LIMIT ?",
            col = column,
            dir = direction
        ));
        params.push(Box::new(query.limit as i64 + 1));

        debug!("Executing window query: {}", sql);

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

            let rows = stmt
                .query_map(param_refs.as_slice(), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let has_more = rows.len() > query.limit;
            let mut items = Vec::with_capacity(rows.len().min(query.limit));
            let mut last_position = None;
            for (pk, sk, version, body, entity_id, timestamp) in rows.into_iter().take(query.limit) {
                items.push(Record {
                    key: ItemKey::new(pk, sk),
                    version: version as u64,
                    item: serde_json::from_str(&body)?,
                });
                last_position = Some(IndexPosition::new(timestamp, entity_id));
            }

            Ok(QueryPage {
                items,
                last_position: if has_more { last_position } else { None },
            })
        })
    }

    async fn query_partition(&self, pk: &str, sk_prefix: &str) -> Result<Vec<Record>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT sk, version, body FROM items
                 WHERE pk = ?1 AND substr(sk, 1, ?2) = ?3
                 ORDER BY sk",
            )?;
            let rows = stmt
                .query_map(params![pk, sk_prefix.len() as i64, sk_prefix], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(sk, version, body)| {
                    Ok(Record {
                        key: ItemKey::new(pk, sk),
                        version: version as u64,
                        item: serde_json::from_str(&body)?,
                    })
                })
                .collect()
        })
    }
}
