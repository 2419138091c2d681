//! Repair path
//!
//! Rebuilds a projection from canonical data and overwrites it without a
//! version check. This is the only place aggregates are recomputed instead of
//! adjusted by delta.

use tracing::info;

use super::PointerSynchronizer;
use crate::error::{ProjectionError, Result};
use crate::events::ChangeSignal;
use crate::model::keys::{event_pk, ATTENDANCE_PREFIX, ATTRIBUTE_PREFIX, POLL_PREFIX, VOTE_PREFIX};
use crate::model::{
    EventSeries, Hangout, HangoutAttribute, HangoutPointer, InterestLevel, ItemKey, Poll,
    PollSummary, SeriesPointer, TypedItem, Versioned, Vote,
};
use crate::store::{get_typed, query_typed, require_typed, Condition, ItemStore};

/// Build a hangout pointer for `group_id` entirely from canonical rows
pub async fn build_hangout_pointer(
    store: &dyn ItemStore,
    group_id: &str,
    hangout: &Hangout,
) -> Result<HangoutPointer> {
    let pk = event_pk(&hangout.hangout_id);

    let polls = query_typed::<Poll>(store, &pk, POLL_PREFIX).await?;
    let votes: Vec<Vote> = query_typed::<Vote>(store, &pk, VOTE_PREFIX)
        .await?
        .into_iter()
        .map(|v| v.value)
        .collect();
    let interest_levels: Vec<InterestLevel> = query_typed::<InterestLevel>(store, &pk, ATTENDANCE_PREFIX)
        .await?
        .into_iter()
        .map(|l| l.value)
        .collect();
    let attributes: Vec<HangoutAttribute> = query_typed::<HangoutAttribute>(store, &pk, ATTRIBUTE_PREFIX)
        .await?
        .into_iter()
        .map(|a| a.value)
        .collect();

    let mut pointer = HangoutPointer::from_hangout(group_id, hangout);
    pointer.polls = polls
        .iter()
        .map(|p| PollSummary::tally(&p.value, &votes))
        .collect();
    pointer.participant_count = interest_levels
        .iter()
        .filter(|l| l.status.counts_as_participant())
        .count() as i64;
    pointer.interest_levels = interest_levels;
    pointer.attributes = attributes;
    Ok(pointer)
}

impl PointerSynchronizer {
    /// Recompute a group's hangout pointer from canonical data and overwrite
    /// it, then mirror it into the series pointer.
    ///
    /// A missing pointer is only created when `group_id` is one of the
    /// hangout's associated groups.
    pub async fn resync_hangout_pointer(
        &self,
        group_id: &str,
        hangout_id: &str,
    ) -> Result<Versioned<HangoutPointer>> {
        let store = self.store().as_ref();
        let hangout = require_typed::<Hangout>(store, &ItemKey::hangout(hangout_id)).await?;
        let key = ItemKey::hangout_pointer(group_id, hangout_id);

        let existing = get_typed::<HangoutPointer>(store, &key).await?;
        if existing.is_none() && !hangout.value.associated_groups.iter().any(|g| g == group_id) {
            return Err(ProjectionError::NotFound(format!(
                "{} {} (hangout {} is not associated with group {})",
                HangoutPointer::KIND,
                key,
                hangout_id,
                group_id
            )));
        }

        let pointer = build_hangout_pointer(store, group_id, &hangout.value).await?;
        let record = store
            .put(key.clone(), pointer.clone().into_item(), Condition::Always)
            .await?;

        info!(
            group = %group_id,
            hangout = %hangout_id,
            version = record.version,
            participants = pointer.participant_count,
            "Hangout pointer resynced"
        );
        self.events().emit(ChangeSignal::PointerResynced {
            partition: key.pk.clone(),
            entity_id: hangout_id.to_string(),
        });
        self.events().emit_partitions([key.pk.as_str()]);

        let resynced = Versioned {
            key,
            version: record.version,
            value: pointer,
        };
        self.refresh_series_part(&resynced).await?;
        Ok(resynced)
    }

    /// Rebuild a group's series pointer from the member pointers currently
    /// stored in that group and overwrite it.
    pub async fn resync_series_pointer(
        &self,
        group_id: &str,
        series_id: &str,
    ) -> Result<Versioned<SeriesPointer>> {
        let store = self.store().as_ref();
        let series = require_typed::<EventSeries>(store, &ItemKey::series(series_id)).await?;
        let key = ItemKey::series_pointer(group_id, series_id);

        let existing = get_typed::<SeriesPointer>(store, &key).await?;
        if existing.is_none() && !series.value.group_ids.iter().any(|g| g == group_id) {
            return Err(ProjectionError::NotFound(format!(
                "{} {} (series {} is not associated with group {})",
                SeriesPointer::KIND,
                key,
                series_id,
                group_id
            )));
        }

        let mut parts = Vec::with_capacity(series.value.hangout_ids.len());
        for hangout_id in &series.value.hangout_ids {
            if let Some(part) =
                get_typed::<HangoutPointer>(store, &ItemKey::hangout_pointer(group_id, hangout_id)).await?
            {
                parts.push((part.value, part.version));
            }
        }

        let pointer = SeriesPointer::from_versioned_parts(group_id, &series.value, parts);
        let record = store
            .put(key.clone(), pointer.clone().into_item(), Condition::Always)
            .await?;

        info!(
            group = %group_id,
            series = %series_id,
            parts = pointer.parts.len(),
            version = record.version,
            "Series pointer resynced"
        );
        self.events().emit(ChangeSignal::PointerResynced {
            partition: key.pk.clone(),
            entity_id: series_id.to_string(),
        });
        self.events().emit_partitions([key.pk.as_str()]);

        Ok(Versioned {
            key,
            version: record.version,
            value: pointer,
        })
    }
}
