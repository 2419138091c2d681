//! Feed assembler
//!
//! Builds a group's chronological feed from its projection rows.
//!
//! ## Windows
//!
//! ```text
//!                      now
//!   past               |  in progress          future
//!   end < now          |  start <= now <= end  start > now
//!   end index, desc    |  start index, asc     start index, asc
//! ```
//!
//! A forward page queries the in-progress and future windows concurrently,
//! merges them, and sorts the merge by `(start, entity id)`. The two windows
//! are disjoint and both read the start index, so one continuation position
//! serves both. A backward page reads the past window newest-first in the
//! store's own order.
//!
//! Raw rows are turned into entries by two-pass hydration (see `hydrate`).

pub mod cursor;
pub mod hydrate;

use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::config::Config;
use crate::error::{ProjectionError, Result};
use crate::model::keys::group_pk;
use crate::model::Record;
use crate::store::{IndexPosition, ItemStore, QueryPage, SortOrder, TimeIndex, TimeQuery};

pub use cursor::{FeedCursor, FeedDirection};
pub use hydrate::{FeedEntry, HangoutSummary, SeriesSummary};

use hydrate::{collect_series_members, emit_entries, hydrate};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedPage {
    pub entries: Vec<FeedEntry>,
    /// Entries without a start time; only on the first forward page
    pub unscheduled: Vec<FeedEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_cursor: Option<String>,
}

pub struct FeedAssembler {
    store: Arc<dyn ItemStore>,
    default_limit: usize,
    max_limit: usize,
    query_timeout: Duration,
}

impl FeedAssembler {
    pub fn new(store: Arc<dyn ItemStore>, config: &Config) -> Self {
        Self {
            store,
            default_limit: config.default_feed_limit,
            max_limit: config.max_feed_limit,
            query_timeout: config.query_timeout(),
        }
    }

    pub fn clamp_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_limit)
            .clamp(1, self.max_limit.max(1))
    }

    /// One page of `group_id`'s feed as seen at `now`.
    ///
    /// `cursor` must be a token from an earlier page in the same direction.
    pub async fn assemble_feed(
        &self,
        group_id: &str,
        now: i64,
        limit: Option<usize>,
        cursor: Option<&str>,
        direction: FeedDirection,
    ) -> Result<FeedPage> {
        let limit = self.clamp_limit(limit);
        let cursor = cursor.map(FeedCursor::decode).transpose()?;
        if let Some(ref c) = cursor {
            if c.direction != direction {
                return Err(ProjectionError::InvalidCursor(format!(
                    "cursor reads {:?} but {:?} was requested",
                    c.direction, direction
                )));
            }
        }

        let partition = group_pk(group_id);
        let page = match direction {
            FeedDirection::Forward => self.forward_page(&partition, now, limit, cursor).await?,
            FeedDirection::Backward => self.backward_page(&partition, now, limit, cursor).await?,
        };

        debug!(
            group = %group_id,
            direction = ?direction,
            entries = page.entries.len(),
            unscheduled = page.unscheduled.len(),
            more = page.next_cursor.is_some(),
            "Feed page assembled"
        );
        Ok(page)
    }

    async fn forward_page(
        &self,
        partition: &str,
        now: i64,
        limit: usize,
        cursor: Option<FeedCursor>,
    ) -> Result<FeedPage> {
        let anchor = window_anchor(cursor.as_ref(), now);
        let after = cursor.as_ref().and_then(FeedCursor::to_continuation);

        let in_progress = TimeQuery::new(partition, TimeIndex::Start)
            .range(Bound::Unbounded, Bound::Included(anchor))
            .with_min_end(anchor)
            .with_limit(limit)
            .start_after(after.clone());
        let upcoming = TimeQuery::new(partition, TimeIndex::Start)
            .range(Bound::Excluded(anchor), Bound::Unbounded)
            .with_limit(limit)
            .start_after(after);

        let (current, future) = self
            .with_timeout(async {
                tokio::try_join!(
                    self.store.query_window(&in_progress),
                    self.store.query_window(&upcoming)
                )
            })
            .await?;

        let (rows, next) = merge_windows(current, future, limit);
        let next_cursor = next
            .map(|p| FeedCursor::after(&p, FeedDirection::Forward).encode())
            .transpose()?;

        let unscheduled_rows = if cursor.is_none() {
            self.unscheduled_rows(partition).await?
        } else {
            Vec::new()
        };

        let members = collect_series_members(rows.iter().chain(unscheduled_rows.iter()));
        Ok(FeedPage {
            entries: emit_entries(&rows, &members),
            unscheduled: emit_entries(&unscheduled_rows, &members),
            next_cursor,
            previous_cursor: Some(FeedCursor::boundary(anchor, FeedDirection::Backward).encode()?),
        })
    }

    async fn backward_page(
        &self,
        partition: &str,
        now: i64,
        limit: usize,
        cursor: Option<FeedCursor>,
    ) -> Result<FeedPage> {
        let anchor = window_anchor(cursor.as_ref(), now);
        let query = TimeQuery::new(partition, TimeIndex::End)
            .range(Bound::Unbounded, Bound::Excluded(anchor))
            .order(SortOrder::Descending)
            .with_limit(limit)
            .start_after(cursor.as_ref().and_then(FeedCursor::to_continuation));

        let page = self.with_timeout(self.store.query_window(&query)).await?;
        let next_cursor = page
            .last_position
            .as_ref()
            .map(|p| FeedCursor::after(p, FeedDirection::Backward).encode())
            .transpose()?;

        Ok(FeedPage {
            entries: hydrate(&page.items),
            unscheduled: Vec::new(),
            next_cursor,
            previous_cursor: Some(FeedCursor::boundary(anchor, FeedDirection::Forward).encode()?),
        })
    }

    /// Projection rows of the partition that have no start time
    async fn unscheduled_rows(&self, partition: &str) -> Result<Vec<Record>> {
        let rows = self
            .with_timeout(self.store.query_partition(partition, ""))
            .await?;
        Ok(rows
            .into_iter()
            .filter(|r| r.item.index_entry().map_or(false, |e| e.start.is_none()))
            .collect())
    }

    async fn with_timeout<T>(&self, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.query_timeout, fut)
            .await
            .map_err(|_| {
                ProjectionError::Timeout(format!("feed query exceeded {:?}", self.query_timeout))
            })?
    }
}

/// Boundary tokens anchor the window at their own timestamp
fn window_anchor(cursor: Option<&FeedCursor>, now: i64) -> i64 {
    match cursor {
        Some(c) if c.is_boundary() => c.timestamp,
        _ => now,
    }
}

/// Merge the in-progress and future pages into one chronological page of at
/// most `limit` rows. Returns the rows and, when more may follow, the
/// position to continue after.
fn merge_windows(current: QueryPage, future: QueryPage, limit: usize) -> (Vec<Record>, Option<IndexPosition>) {
    let store_has_more = current.has_more() || future.has_more();

    let mut merged: Vec<(IndexPosition, Record)> = current
        .items
        .into_iter()
        .chain(future.items)
        .filter_map(|record| {
            let entry = record.item.index_entry()?;
            Some((IndexPosition::new(entry.start?, entry.entity_id), record))
        })
        .collect();
    merged.sort_by(|(a, _), (b, _)| a.cmp(b));

    let has_more = store_has_more || merged.len() > limit;
    merged.truncate(limit);

    let next = if has_more {
        merged.last().map(|(p, _)| p.clone())
    } else {
        None
    };
    (merged.into_iter().map(|(_, r)| r).collect(), next)
}
