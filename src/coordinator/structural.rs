//! Structural lifecycle operations
//!
//! Every operation reads what it needs, builds exactly one
//! `TransactionBatch`, and submits it. Nothing is written before the batch is
//! complete, so an oversized or conflicting operation leaves no trace.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use super::batch::{BulkBatch, BulkReport, TransactionBatch};
use crate::error::{ProjectionError, Result};
use crate::events::{ChangeSignal, EventBus};
use crate::model::keys::event_pk;
use crate::model::pointer::time_bounds;
use crate::model::{
    now_millis, EventSeries, Hangout, HangoutPointer, ItemKey, NewHangout, SeriesDetails,
    SeriesPointer, Versioned,
};
use crate::store::{get_typed, require_typed, Condition, ItemStore, WriteIntent};

/// What happens to a hangout taken out of its series
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberRemoval {
    /// Keep the hangout as a standalone hangout
    Unlink,
    /// Delete the hangout and its pointers
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovalOutcome {
    /// The removed hangout was the last member and the series is gone
    pub series_deleted: bool,
    pub hangout_deleted: bool,
}

pub struct StructuralCoordinator {
    store: Arc<dyn ItemStore>,
    events: Arc<EventBus>,
}

impl StructuralCoordinator {
    pub fn new(store: Arc<dyn ItemStore>, events: Arc<EventBus>) -> Self {
        Self { store, events }
    }

    fn emit_touched(&self, partitions: &[String]) {
        self.events.emit_partitions(partitions.iter().map(String::as_str));
    }

    // =========================================================================
    // Standalone hangouts
    // =========================================================================

    /// Create a standalone hangout and its pointer in every associated group
    pub async fn create_hangout(&self, hangout: Hangout) -> Result<Hangout> {
        if hangout.series_id.is_some() {
            return Err(ProjectionError::InvalidOperation(
                "Series members are created through the series".into(),
            ));
        }

        let mut batch = TransactionBatch::new("create_hangout");
        batch.create(ItemKey::hangout(&hangout.hangout_id), hangout.clone());
        for group_id in &hangout.associated_groups {
            batch.create(
                ItemKey::hangout_pointer(group_id, &hangout.hangout_id),
                HangoutPointer::from_hangout(group_id, &hangout),
            );
        }
        let touched = batch.submit(self.store.as_ref()).await?;

        info!(hangout = %hangout.hangout_id, groups = hangout.associated_groups.len(), "Hangout created");
        self.emit_touched(&touched);
        Ok(hangout)
    }

    /// Delete a standalone hangout and its pointers. Series members go
    /// through `remove_member` so the series stays consistent.
    pub async fn delete_hangout(&self, hangout_id: &str) -> Result<()> {
        let store = self.store.as_ref();
        let hangout = require_typed::<Hangout>(store, &ItemKey::hangout(hangout_id)).await?;
        if let Some(ref series_id) = hangout.value.series_id {
            self.remove_member(series_id, hangout_id, MemberRemoval::Delete)
                .await?;
            return Ok(());
        }

        let mut batch = TransactionBatch::new("delete_hangout");
        batch.remove(&hangout);
        for group_id in &hangout.value.associated_groups {
            if let Some(pointer) =
                get_typed::<HangoutPointer>(store, &ItemKey::hangout_pointer(group_id, hangout_id)).await?
            {
                batch.remove(&pointer);
            }
        }
        let touched = batch.submit(store).await?;

        info!(hangout = %hangout_id, "Hangout deleted");
        self.events.emit(ChangeSignal::HangoutDeleted {
            hangout_id: hangout_id.to_string(),
        });
        self.emit_touched(&touched);
        self.purge_hangout_children(hangout_id).await;
        Ok(())
    }

    // =========================================================================
    // Series operations
    // =========================================================================

    /// Turn a standalone hangout into a two-member series with `new_member`.
    ///
    /// Writes the series record, the new member, the existing hangout with
    /// its series id, and per group: the new member's pointer, the existing
    /// pointer with its series id, and a series pointer holding both parts.
    pub async fn promote_to_series(
        &self,
        existing_hangout_id: &str,
        new_member: NewHangout,
        details: SeriesDetails,
    ) -> Result<EventSeries> {
        let store = self.store.as_ref();
        let existing = require_typed::<Hangout>(store, &ItemKey::hangout(existing_hangout_id)).await?;
        if let Some(ref series_id) = existing.value.series_id {
            return Err(ProjectionError::InvalidOperation(format!(
                "Hangout {} already belongs to series {}",
                existing_hangout_id, series_id
            )));
        }

        let now = now_millis();
        let series_id = details.series_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let groups = existing.value.associated_groups.clone();
        let new_hangout = new_member.into_hangout(&series_id, groups.clone(), now);
        if new_hangout.hangout_id == existing_hangout_id {
            return Err(ProjectionError::InvalidOperation(
                "New member must be a different hangout".into(),
            ));
        }

        let mut linked = existing.value.clone();
        linked.series_id = Some(series_id.clone());

        let (start, end) = time_bounds(
            [&linked, &new_hangout]
                .iter()
                .map(|h| (h.start_timestamp, h.end_timestamp)),
        );
        let series = EventSeries {
            series_id: series_id.clone(),
            series_title: details.title,
            series_description: details.description,
            hangout_ids: vec![linked.hangout_id.clone(), new_hangout.hangout_id.clone()],
            group_ids: groups.clone(),
            start_timestamp: start,
            end_timestamp: end,
            created_at: now,
        };

        let mut batch = TransactionBatch::new("promote_to_series");
        batch
            .create(ItemKey::series(&series_id), series.clone())
            .replace(&existing, linked.clone())
            .create(ItemKey::hangout(&new_hangout.hangout_id), new_hangout.clone());

        for group_id in &groups {
            let key = ItemKey::hangout_pointer(group_id, existing_hangout_id);
            // Parts carry the version their pointer has once the batch commits
            let existing_part = match get_typed::<HangoutPointer>(store, &key).await? {
                Some(read) => {
                    let mut pointer = read.value.clone();
                    pointer.series_id = Some(series_id.clone());
                    batch.replace(&read, pointer.clone());
                    (pointer, read.version + 1)
                }
                None => {
                    warn!(group = %group_id, hangout = %existing_hangout_id, "Existing pointer missing, recreating");
                    let pointer = HangoutPointer::from_hangout(group_id, &linked);
                    batch.create(key, pointer.clone());
                    (pointer, 1)
                }
            };

            let new_part = HangoutPointer::from_hangout(group_id, &new_hangout);
            batch.create(
                ItemKey::hangout_pointer(group_id, &new_hangout.hangout_id),
                new_part.clone(),
            );
            batch.create(
                ItemKey::series_pointer(group_id, &series_id),
                SeriesPointer::from_versioned_parts(group_id, &series, vec![existing_part, (new_part, 1)]),
            );
        }

        let touched = batch.submit(store).await?;

        info!(series = %series_id, from = %existing_hangout_id, groups = groups.len(), "Hangout promoted to series");
        self.events.emit(ChangeSignal::SeriesCreated {
            series_id: series_id.clone(),
            hangout_ids: series.hangout_ids.clone(),
        });
        self.emit_touched(&touched);
        Ok(series)
    }

    /// Add a new hangout to an existing series
    pub async fn add_member_to_series(&self, series_id: &str, new_member: NewHangout) -> Result<Hangout> {
        let store = self.store.as_ref();
        let series = require_typed::<EventSeries>(store, &ItemKey::series(series_id)).await?;

        let new_hangout = new_member.into_hangout(series_id, series.value.group_ids.clone(), now_millis());
        if series.value.hangout_ids.contains(&new_hangout.hangout_id) {
            return Err(ProjectionError::InvalidOperation(format!(
                "Hangout {} is already a member of series {}",
                new_hangout.hangout_id, series_id
            )));
        }

        let mut updated = series.value.clone();
        updated.hangout_ids.push(new_hangout.hangout_id.clone());
        let (start, end) = time_bounds(
            [
                (series.value.start_timestamp, series.value.end_timestamp),
                (new_hangout.start_timestamp, new_hangout.end_timestamp),
            ]
            .into_iter(),
        );
        updated.start_timestamp = start;
        updated.end_timestamp = end;

        let mut batch = TransactionBatch::new("add_member_to_series");
        batch
            .replace(&series, updated.clone())
            .create(ItemKey::hangout(&new_hangout.hangout_id), new_hangout.clone());

        for group_id in &series.value.group_ids {
            let new_part = HangoutPointer::from_hangout(group_id, &new_hangout);
            batch.create(
                ItemKey::hangout_pointer(group_id, &new_hangout.hangout_id),
                new_part.clone(),
            );

            let key = ItemKey::series_pointer(group_id, series_id);
            match get_typed::<SeriesPointer>(store, &key).await? {
                Some(read) => {
                    let mut pointer = read.value.clone();
                    pointer.hangout_ids.push(new_hangout.hangout_id.clone());
                    pointer.upsert_versioned_part(new_part, 1);
                    batch.replace(&read, pointer);
                }
                None => {
                    let mut parts = self.stored_parts(group_id, &series.value.hangout_ids).await?;
                    parts.push((new_part, 1));
                    batch.create(key, SeriesPointer::from_versioned_parts(group_id, &updated, parts));
                }
            }
        }

        let touched = batch.submit(store).await?;

        info!(series = %series_id, hangout = %new_hangout.hangout_id, "Member added to series");
        self.events.emit(ChangeSignal::SeriesUpdated {
            series_id: series_id.to_string(),
        });
        self.emit_touched(&touched);
        Ok(new_hangout)
    }

    /// Take `hangout_id` out of its series. Removing the last member deletes
    /// the series record and its pointers in the same batch.
    pub async fn remove_member(
        &self,
        series_id: &str,
        hangout_id: &str,
        removal: MemberRemoval,
    ) -> Result<RemovalOutcome> {
        let store = self.store.as_ref();
        let series = require_typed::<EventSeries>(store, &ItemKey::series(series_id)).await?;
        if !series.value.hangout_ids.iter().any(|id| id == hangout_id) {
            return Err(ProjectionError::InvalidOperation(format!(
                "Hangout {} is not a member of series {}",
                hangout_id, series_id
            )));
        }
        let hangout = require_typed::<Hangout>(store, &ItemKey::hangout(hangout_id)).await?;

        let remaining: Vec<String> = series
            .value
            .hangout_ids
            .iter()
            .filter(|id| *id != hangout_id)
            .cloned()
            .collect();
        let series_deleted = remaining.is_empty();

        let mut batch = TransactionBatch::new(match removal {
            MemberRemoval::Unlink => "unlink_member",
            MemberRemoval::Delete => "delete_member",
        });

        if series_deleted {
            batch.remove(&series);
            for group_id in &series.value.group_ids {
                if let Some(read) = self.series_pointer(group_id, series_id).await? {
                    batch.remove(&read);
                }
            }
        } else {
            let mut times = Vec::with_capacity(remaining.len());
            for id in &remaining {
                if let Some(member) = get_typed::<Hangout>(store, &ItemKey::hangout(id)).await? {
                    times.push((member.value.start_timestamp, member.value.end_timestamp));
                    // The new bounds hold only while these members are unchanged
                    batch.check(member.key.clone(), Condition::VersionEquals(member.version));
                }
            }
            let (start, end) = time_bounds(times.into_iter());

            let mut updated = series.value.clone();
            updated.hangout_ids = remaining;
            updated.start_timestamp = start;
            updated.end_timestamp = end;
            batch.replace(&series, updated);

            for group_id in &series.value.group_ids {
                if let Some(read) = self.series_pointer(group_id, series_id).await? {
                    let mut pointer = read.value.clone();
                    pointer.remove_part(hangout_id);
                    batch.replace(&read, pointer);
                }
            }
        }

        match removal {
            MemberRemoval::Unlink => {
                let mut standalone = hangout.value.clone();
                standalone.series_id = None;
                batch.replace(&hangout, standalone);
                for group_id in &hangout.value.associated_groups {
                    if let Some(read) = self.hangout_pointer(group_id, hangout_id).await? {
                        let mut pointer = read.value.clone();
                        pointer.series_id = None;
                        batch.replace(&read, pointer);
                    }
                }
            }
            MemberRemoval::Delete => {
                batch.remove(&hangout);
                for group_id in &hangout.value.associated_groups {
                    if let Some(read) = self.hangout_pointer(group_id, hangout_id).await? {
                        batch.remove(&read);
                    }
                }
            }
        }

        let touched = batch.submit(store).await?;

        info!(
            series = %series_id,
            hangout = %hangout_id,
            removal = ?removal,
            series_deleted,
            "Member removed from series"
        );
        if series_deleted {
            self.events.emit(ChangeSignal::SeriesDeleted {
                series_id: series_id.to_string(),
            });
        } else {
            self.events.emit(ChangeSignal::SeriesUpdated {
                series_id: series_id.to_string(),
            });
        }
        let hangout_deleted = removal == MemberRemoval::Delete;
        if hangout_deleted {
            self.events.emit(ChangeSignal::HangoutDeleted {
                hangout_id: hangout_id.to_string(),
            });
        }
        self.emit_touched(&touched);

        if hangout_deleted {
            self.purge_hangout_children(hangout_id).await;
        }

        Ok(RemovalOutcome {
            series_deleted,
            hangout_deleted,
        })
    }

    /// Delete the series, every member hangout, and all of their pointers.
    /// Returns the ids of the deleted hangouts.
    pub async fn delete_series(&self, series_id: &str) -> Result<Vec<String>> {
        let store = self.store.as_ref();
        let series = require_typed::<EventSeries>(store, &ItemKey::series(series_id)).await?;

        let mut batch = TransactionBatch::new("delete_series");
        batch.remove(&series);

        for group_id in &series.value.group_ids {
            if let Some(read) = self.series_pointer(group_id, series_id).await? {
                batch.remove(&read);
            }
        }

        let mut deleted = Vec::with_capacity(series.value.hangout_ids.len());
        for hangout_id in &series.value.hangout_ids {
            let member = match get_typed::<Hangout>(store, &ItemKey::hangout(hangout_id)).await? {
                Some(member) if member.value.series_id.as_deref() == Some(series_id) => member,
                _ => {
                    warn!(series = %series_id, hangout = %hangout_id, "Listed member missing or relinked, skipping");
                    continue;
                }
            };

            batch.remove(&member);
            for group_id in &member.value.associated_groups {
                if let Some(read) = self.hangout_pointer(group_id, hangout_id).await? {
                    batch.remove(&read);
                }
            }
            deleted.push(hangout_id.clone());
        }

        let touched = batch.submit(store).await?;

        info!(series = %series_id, members = deleted.len(), "Series deleted");
        self.events.emit(ChangeSignal::SeriesDeleted {
            series_id: series_id.to_string(),
        });
        for hangout_id in &deleted {
            self.events.emit(ChangeSignal::HangoutDeleted {
                hangout_id: hangout_id.clone(),
            });
        }
        self.emit_touched(&touched);

        for hangout_id in &deleted {
            self.purge_hangout_children(hangout_id).await;
        }
        Ok(deleted)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Delete polls, votes, RSVPs, and other child rows of a deleted hangout.
    /// Chunked and idempotent; failures are logged and can be re-run.
    pub async fn purge_hangout_children(&self, hangout_id: &str) -> Option<BulkReport> {
        let store = self.store.as_ref();
        let children = match store.query_partition(&event_pk(hangout_id), "").await {
            Ok(children) => children,
            Err(e) => {
                warn!(hangout = %hangout_id, error = %e, "Could not list child rows to purge");
                return None;
            }
        };

        let mut bulk = BulkBatch::new("purge_hangout_children");
        for child in children {
            bulk.push(WriteIntent::Delete {
                key: child.key,
                condition: Condition::Always,
            });
        }
        if bulk.is_empty() {
            return None;
        }

        match bulk.submit(store).await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(hangout = %hangout_id, error = %e, "Child row purge incomplete");
                None
            }
        }
    }

    async fn hangout_pointer(&self, group_id: &str, hangout_id: &str) -> Result<Option<Versioned<HangoutPointer>>> {
        get_typed(self.store.as_ref(), &ItemKey::hangout_pointer(group_id, hangout_id)).await
    }

    async fn series_pointer(&self, group_id: &str, series_id: &str) -> Result<Option<Versioned<SeriesPointer>>> {
        get_typed(self.store.as_ref(), &ItemKey::series_pointer(group_id, series_id)).await
    }

    async fn stored_parts(&self, group_id: &str, hangout_ids: &[String]) -> Result<Vec<(HangoutPointer, u64)>> {
        let mut parts = Vec::with_capacity(hangout_ids.len());
        for hangout_id in hangout_ids {
            if let Some(part) = self.hangout_pointer(group_id, hangout_id).await? {
                parts.push((part.value, part.version));
            }
        }
        Ok(parts)
    }
}
