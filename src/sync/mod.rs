//! Pointer synchronizer
//!
//! Single-projection read, mutate, conditional-write cycles. The write only
//! lands if the stored version still equals the version that was read; on a
//! conflict the whole cycle is repeated from a fresh read, up to
//! `max_attempts` times.
//!
//! What happens when the attempts run out is chosen per call site with
//! `SyncCriticality`:
//!
//! - `BestEffort` - the canonical write already succeeded, so a lagging
//!   projection is tolerated. The synchronizer logs, emits `PointerStale`,
//!   and returns `SyncOutcome::Stale`. A later sync or resync repairs it.
//! - `Required` - the caller's own operation depends on the write (spot
//!   claims). Exhaustion is `ConcurrencyExhausted`.

pub mod resync;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{ProjectionError, Result};
use crate::events::{ChangeSignal, EventBus};
use crate::model::{Hangout, HangoutPointer, ItemKey, SeriesPointer, TypedItem, Versioned};
use crate::store::{get_typed, require_typed, Condition, ItemStore};

/// Attempt bound used when none is configured
pub const DEFAULT_MAX_ATTEMPTS: usize = 5;

/// What to do when every attempt lost a version race
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCriticality {
    BestEffort,
    Required,
}

/// Result of a sync that did not fail outright
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome<P> {
    /// The mutation landed at this version
    Applied(Versioned<P>),
    /// Best-effort sync gave up after this many conflicting attempts
    Stale { attempts: usize },
}

impl<P> SyncOutcome<P> {
    pub fn is_applied(&self) -> bool {
        matches!(self, SyncOutcome::Applied(_))
    }

    pub fn applied(&self) -> Option<&Versioned<P>> {
        match self {
            SyncOutcome::Applied(v) => Some(v),
            SyncOutcome::Stale { .. } => None,
        }
    }
}

pub struct PointerSynchronizer {
    store: Arc<dyn ItemStore>,
    events: Arc<EventBus>,
    max_attempts: usize,
}

impl PointerSynchronizer {
    pub fn new(store: Arc<dyn ItemStore>, events: Arc<EventBus>) -> Self {
        Self::with_max_attempts(store, events, DEFAULT_MAX_ATTEMPTS)
    }

    pub fn with_max_attempts(store: Arc<dyn ItemStore>, events: Arc<EventBus>, max_attempts: usize) -> Self {
        Self {
            store,
            events,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    // =========================================================================
    // Generic cycle
    // =========================================================================

    /// Read the row at `key`, apply `mutate` to a copy, and write it back
    /// conditioned on the version that was read.
    ///
    /// A missing row is `NotFound`; the sync path never creates rows. An
    /// error from `mutate` aborts without retrying.
    pub async fn sync_record<P, F>(
        &self,
        key: &ItemKey,
        mut mutate: F,
        reason: &str,
        criticality: SyncCriticality,
    ) -> Result<SyncOutcome<P>>
    where
        P: TypedItem,
        F: FnMut(&mut P) -> Result<()> + Send,
    {
        for attempt in 1..=self.max_attempts {
            let current = require_typed::<P>(self.store.as_ref(), key).await?;

            let mut next = current.value.clone();
            mutate(&mut next)?;

            match self
                .store
                .put(key.clone(), next.clone().into_item(), Condition::VersionEquals(current.version))
                .await
            {
                Ok(record) => {
                    debug!(key = %key, version = record.version, attempt, reason, "Projection synced");
                    self.events.emit(ChangeSignal::PointerSynced {
                        partition: key.pk.clone(),
                        entity_id: key.entity_id().to_string(),
                        version: record.version,
                        reason: reason.to_string(),
                    });
                    self.events.emit_partitions([key.pk.as_str()]);
                    return Ok(SyncOutcome::Applied(Versioned {
                        key: record.key,
                        version: record.version,
                        value: next,
                    }));
                }
                Err(e) if e.is_conflict() => {
                    debug!(key = %key, attempt, read_version = current.version, "Version conflict, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        match criticality {
            SyncCriticality::BestEffort => {
                warn!(
                    key = %key,
                    attempts = self.max_attempts,
                    reason,
                    "Giving up on projection sync; projection left stale"
                );
                self.events.emit(ChangeSignal::PointerStale {
                    partition: key.pk.clone(),
                    entity_id: key.entity_id().to_string(),
                    attempts: self.max_attempts,
                    reason: reason.to_string(),
                });
                Ok(SyncOutcome::Stale {
                    attempts: self.max_attempts,
                })
            }
            SyncCriticality::Required => Err(ProjectionError::ConcurrencyExhausted {
                key: key.clone(),
                attempts: self.max_attempts,
            }),
        }
    }

    // =========================================================================
    // Hangout and series pointers
    // =========================================================================

    /// Sync one group's hangout pointer, then mirror the result into the
    /// group's series pointer when the hangout belongs to a series.
    pub async fn sync_hangout_pointer<F>(
        &self,
        group_id: &str,
        hangout_id: &str,
        mutate: F,
        reason: &str,
    ) -> Result<SyncOutcome<HangoutPointer>>
    where
        F: FnMut(&mut HangoutPointer) -> Result<()> + Send,
    {
        let key = ItemKey::hangout_pointer(group_id, hangout_id);
        let outcome = self
            .sync_record(&key, mutate, reason, SyncCriticality::BestEffort)
            .await?;

        if let SyncOutcome::Applied(ref pointer) = outcome {
            self.refresh_series_part(pointer).await?;
        }
        Ok(outcome)
    }

    pub async fn sync_series_pointer<F>(
        &self,
        group_id: &str,
        series_id: &str,
        mutate: F,
        reason: &str,
    ) -> Result<SyncOutcome<SeriesPointer>>
    where
        F: FnMut(&mut SeriesPointer) -> Result<()> + Send,
    {
        let key = ItemKey::series_pointer(group_id, series_id);
        self.sync_record(&key, mutate, reason, SyncCriticality::BestEffort)
            .await
    }

    /// Copy `pointer` into its series pointer's `parts`. A copy older than
    /// the part already held is skipped, so concurrent refreshes cannot roll
    /// a part back. A missing series pointer is logged and left for resync.
    pub async fn refresh_series_part(&self, pointer: &Versioned<HangoutPointer>) -> Result<()> {
        let series_id = match pointer.value.series_id {
            Some(ref id) => id.clone(),
            None => return Ok(()),
        };

        let part = pointer.value.clone();
        let version = pointer.version;
        let result = self
            .sync_series_pointer(
                &pointer.value.group_id,
                &series_id,
                move |series| {
                    if series.part_version(&part.hangout_id).map_or(false, |held| held >= version) {
                        return Err(ProjectionError::ConditionFailed {
                            key: ItemKey::hangout_pointer(&part.group_id, &part.hangout_id),
                            reason: format!("series part already at version {} or newer", version),
                        });
                    }
                    if !series.hangout_ids.contains(&part.hangout_id) {
                        series.hangout_ids.push(part.hangout_id.clone());
                    }
                    series.upsert_versioned_part(part.clone(), version);
                    Ok(())
                },
                "series part refresh",
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(ProjectionError::ConditionFailed { .. }) => {
                debug!(
                    group = %pointer.value.group_id,
                    series = %series_id,
                    hangout = %pointer.value.hangout_id,
                    version,
                    "Series part already newer, refresh skipped"
                );
                Ok(())
            }
            Err(ProjectionError::NotFound(_)) => {
                warn!(
                    group = %pointer.value.group_id,
                    series = %series_id,
                    hangout = %pointer.value.hangout_id,
                    "Series pointer missing during part refresh"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Apply `mutate` to the hangout's pointer in every associated group.
    /// Groups without a pointer are skipped with a warning.
    pub async fn sync_hangout_everywhere<F>(
        &self,
        hangout_id: &str,
        mut mutate: F,
        reason: &str,
    ) -> Result<Vec<(String, SyncOutcome<HangoutPointer>)>>
    where
        F: FnMut(&mut HangoutPointer) -> Result<()> + Send,
    {
        let hangout = require_typed::<Hangout>(self.store.as_ref(), &ItemKey::hangout(hangout_id)).await?;

        let mut outcomes = Vec::with_capacity(hangout.value.associated_groups.len());
        for group_id in &hangout.value.associated_groups {
            match self
                .sync_hangout_pointer(group_id, hangout_id, &mut mutate, reason)
                .await
            {
                Ok(outcome) => outcomes.push((group_id.clone(), outcome)),
                Err(ProjectionError::NotFound(key)) => {
                    warn!(group = %group_id, hangout = %hangout_id, missing = %key, "No pointer to sync");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(outcomes)
    }

    /// Copy the canonical hangout's display fields into every pointer
    pub async fn sync_canonical_fields(
        &self,
        hangout: &Hangout,
    ) -> Result<Vec<(String, SyncOutcome<HangoutPointer>)>> {
        let canonical = hangout.clone();
        self.sync_hangout_everywhere(
            &hangout.hangout_id,
            move |pointer| {
                pointer.apply_canonical(&canonical);
                Ok(())
            },
            "canonical fields changed",
        )
        .await
    }

    /// Current pointer for a hangout in a group
    pub async fn hangout_pointer(&self, group_id: &str, hangout_id: &str) -> Result<Option<Versioned<HangoutPointer>>> {
        get_typed(self.store.as_ref(), &ItemKey::hangout_pointer(group_id, hangout_id)).await
    }

    pub(crate) fn store(&self) -> &Arc<dyn ItemStore> {
        &self.store
    }

    pub(crate) fn events(&self) -> &Arc<EventBus> {
        &self.events
    }
}
