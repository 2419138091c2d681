//! Atomic counter updater
//!
//! Aggregates that change often (participant counts, claimed spots) are
//! adjusted with a single store-side `field = field + delta` instead of a
//! read-modify-write, so concurrent adjustments never lose each other.
//! Missing rows and store errors are returned to the caller unretried.

use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::events::ChangeSignal;
use crate::model::{CounterField, Hangout, HangoutPointer, InterestStatus, ItemKey, Record, TypedItem, Versioned};
use crate::store::{require_typed, ItemStore};
use crate::sync::PointerSynchronizer;

/// Participant count delta for an RSVP transition. Only crossing the
/// going-or-interested boundary changes the count.
pub fn rsvp_delta(old: Option<InterestStatus>, new: Option<InterestStatus>) -> i64 {
    let was = old.map_or(false, InterestStatus::counts_as_participant);
    let is = new.map_or(false, InterestStatus::counts_as_participant);
    match (was, is) {
        (false, true) => 1,
        (true, false) => -1,
        _ => 0,
    }
}

pub struct CounterUpdater {
    synchronizer: Arc<PointerSynchronizer>,
}

impl CounterUpdater {
    pub fn new(synchronizer: Arc<PointerSynchronizer>) -> Self {
        Self { synchronizer }
    }

    /// Apply `delta` to `field` of the row at `key`. A zero delta performs no
    /// write and returns `None`.
    pub async fn adjust_counter(&self, key: &ItemKey, field: CounterField, delta: i64) -> Result<Option<Record>> {
        if delta == 0 {
            return Ok(None);
        }

        let record = self.synchronizer.store().increment(key, field, delta).await?;
        debug!(key = %key, field = %field, delta, version = record.version, "Counter adjusted");

        let events = self.synchronizer.events();
        events.emit(ChangeSignal::CounterAdjusted {
            partition: key.pk.clone(),
            entity_id: key.entity_id().to_string(),
            field,
            delta,
        });
        events.emit_partitions([key.pk.as_str()]);
        Ok(Some(record))
    }

    /// Adjust a group's participant count for a hangout
    pub async fn adjust_participant_count(
        &self,
        group_id: &str,
        hangout_id: &str,
        delta: i64,
    ) -> Result<Option<Versioned<HangoutPointer>>> {
        let key = ItemKey::hangout_pointer(group_id, hangout_id);
        match self.adjust_counter(&key, CounterField::ParticipantCount, delta).await? {
            Some(record) => Ok(Some(record.into_typed::<HangoutPointer>()?)),
            None => Ok(None),
        }
    }

    /// Apply the participant delta of an RSVP transition to the hangout's
    /// pointer in every associated group. Series parts are refreshed
    /// best-effort afterwards. Returns the delta that was applied.
    pub async fn record_rsvp_change(
        &self,
        hangout_id: &str,
        old: Option<InterestStatus>,
        new: Option<InterestStatus>,
    ) -> Result<i64> {
        let delta = rsvp_delta(old, new);
        if delta == 0 {
            return Ok(0);
        }

        let store = self.synchronizer.store().as_ref();
        let hangout = require_typed::<Hangout>(store, &ItemKey::hangout(hangout_id)).await?;

        for group_id in &hangout.value.associated_groups {
            if let Some(pointer) = self.adjust_participant_count(group_id, hangout_id, delta).await? {
                self.synchronizer.refresh_series_part(&pointer).await?;
            }
        }
        debug!(hangout = %hangout_id, delta, kind = HangoutPointer::KIND, "RSVP change recorded");
        Ok(delta)
    }
}
