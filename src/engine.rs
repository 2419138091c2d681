//! Engine - service container
//!
//! Wires the synchronizer, counter updater, coordinators, and feed assembler
//! over one shared store and event bus, and exposes the business operations
//! calling services use. Every user-facing operation asks the access gate
//! first; repair operations are not gated.
//!
//! ## Write flow
//!
//! ```text
//! business op ── canonical write ──┬── PointerSynchronizer   (field change)
//!                                  ├── CounterUpdater        (delta)
//!                                  └── StructuralCoordinator (membership)
//! ```

use std::sync::Arc;

use tracing::{debug, info};

use crate::access::{AccessGate, AllowAll, EntityRef, GroupMembershipGate};
use crate::config::Config;
use crate::coordinator::{
    CompletionReport, MemberRemoval, RemovalOutcome, ReservationCoordinator, StructuralCoordinator,
};
use crate::counter::CounterUpdater;
use crate::error::{ProjectionError, Result};
use crate::events::EventBus;
use crate::feed::{FeedAssembler, FeedDirection, FeedPage};
use crate::model::{
    EventSeries, Group, Hangout, HangoutAttribute, HangoutPointer, InterestLevel, ItemKey,
    NewHangout, OfferStatus, Participation, Poll, PollSummary, Record, ReservationOffer,
    SeriesDetails, SeriesPointer, TypedItem, Versioned, Vote,
};
use crate::store::{get_typed, require_typed, Condition, ItemStore, SqliteStore};
use crate::sync::PointerSynchronizer;

pub struct Engine {
    pub config: Config,
    pub store: Arc<dyn ItemStore>,
    pub events: Arc<EventBus>,
    pub synchronizer: Arc<PointerSynchronizer>,
    pub counters: Arc<CounterUpdater>,
    pub structure: Arc<StructuralCoordinator>,
    pub reservations: Arc<ReservationCoordinator>,
    pub feed: Arc<FeedAssembler>,
    gate: Arc<dyn AccessGate>,
}

/// Result of a conditioned per-user row write
enum RowChange<T> {
    /// The stored row already matched; nothing was written
    Unchanged,
    /// Written over this previous value
    Replaced(Option<T>),
}

impl Engine {
    /// Engine over `store` that allows every request
    pub fn new(store: Arc<dyn ItemStore>, config: Config) -> Self {
        let events = Arc::new(EventBus::with_capacity(config.event_buffer));
        let synchronizer = Arc::new(PointerSynchronizer::with_max_attempts(
            store.clone(),
            events.clone(),
            config.max_sync_attempts,
        ));

        Self {
            counters: Arc::new(CounterUpdater::new(synchronizer.clone())),
            structure: Arc::new(StructuralCoordinator::new(store.clone(), events.clone())),
            reservations: Arc::new(ReservationCoordinator::new(synchronizer.clone())),
            feed: Arc::new(FeedAssembler::new(store.clone(), &config)),
            synchronizer,
            events,
            store,
            config,
            gate: Arc::new(AllowAll),
        }
    }

    /// Engine over the SQLite store in `config.storage_dir`, gated by group
    /// membership
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let store: Arc<dyn ItemStore> = Arc::new(
            SqliteStore::open(&config.database_path())?.with_transaction_limit(config.transaction_item_limit),
        );
        let gate = Arc::new(GroupMembershipGate::new(store.clone()));
        info!(path = ?config.database_path(), "Projection engine opened");
        Ok(Self::new(store, config).with_gate(gate))
    }

    pub fn with_gate(mut self, gate: Arc<dyn AccessGate>) -> Self {
        self.gate = gate;
        self
    }

    async fn require_view(&self, user_id: &str, entity: EntityRef) -> Result<()> {
        if self.gate.can_view(user_id, &entity).await? {
            Ok(())
        } else {
            Err(ProjectionError::Unauthorized(format!("{} may not view {}", user_id, entity)))
        }
    }

    async fn require_edit(&self, user_id: &str, entity: EntityRef) -> Result<()> {
        if self.gate.can_edit(user_id, &entity).await? {
            Ok(())
        } else {
            Err(ProjectionError::Unauthorized(format!("{} may not edit {}", user_id, entity)))
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn feed(
        &self,
        user_id: &str,
        group_id: &str,
        now: i64,
        limit: Option<usize>,
        cursor: Option<&str>,
        direction: FeedDirection,
    ) -> Result<FeedPage> {
        self.require_view(user_id, EntityRef::Group(group_id.to_string()))
            .await?;
        self.feed
            .assemble_feed(group_id, now, limit, cursor, direction)
            .await
    }

    /// Raw stored row
    pub async fn get(&self, key: &ItemKey) -> Result<Option<Record>> {
        self.store.get(key).await
    }

    pub async fn hangout_pointer(&self, group_id: &str, hangout_id: &str) -> Result<Option<Versioned<HangoutPointer>>> {
        get_typed(self.store.as_ref(), &ItemKey::hangout_pointer(group_id, hangout_id)).await
    }

    pub async fn series_pointer(&self, group_id: &str, series_id: &str) -> Result<Option<Versioned<SeriesPointer>>> {
        get_typed(self.store.as_ref(), &ItemKey::series_pointer(group_id, series_id)).await
    }

    // =========================================================================
    // Groups and hangouts
    // =========================================================================

    pub async fn create_group(&self, group: Group) -> Result<Group> {
        self.store
            .put(ItemKey::group(&group.group_id), group.clone().into_item(), Condition::NotExists)
            .await?;
        debug!(group = %group.group_id, "Group created");
        Ok(group)
    }

    pub async fn create_hangout(&self, user_id: &str, hangout: Hangout) -> Result<Hangout> {
        for group_id in &hangout.associated_groups {
            self.require_edit(user_id, EntityRef::Group(group_id.clone()))
                .await?;
        }
        self.structure.create_hangout(hangout).await
    }

    /// Write the hangout's editable fields, then copy them into every
    /// pointer. Group and series membership are left as stored; those
    /// change only through structural operations.
    pub async fn update_hangout(&self, user_id: &str, hangout: Hangout) -> Result<Hangout> {
        self.require_edit(user_id, EntityRef::Hangout(hangout.hangout_id.clone()))
            .await?;

        let stored = require_typed::<Hangout>(self.store.as_ref(), &ItemKey::hangout(&hangout.hangout_id)).await?;
        let mut updated = hangout;
        updated.associated_groups = stored.value.associated_groups.clone();
        updated.series_id = stored.value.series_id.clone();
        updated.created_at = stored.value.created_at;

        self.store
            .put(
                stored.key.clone(),
                updated.clone().into_item(),
                Condition::VersionEquals(stored.version),
            )
            .await?;
        self.synchronizer.sync_canonical_fields(&updated).await?;
        Ok(updated)
    }

    pub async fn delete_hangout(&self, user_id: &str, hangout_id: &str) -> Result<()> {
        self.require_edit(user_id, EntityRef::Hangout(hangout_id.to_string()))
            .await?;
        self.structure.delete_hangout(hangout_id).await
    }

    // =========================================================================
    // Hangout children
    // =========================================================================

    /// Record a user's RSVP: write the interest level, adjust participant
    /// counts when the going-or-interested boundary is crossed, and mirror
    /// the level into every pointer.
    pub async fn set_interest(&self, user_id: &str, level: InterestLevel) -> Result<i64> {
        self.require_view(user_id, EntityRef::Hangout(level.hangout_id.clone()))
            .await?;
        if level.user_id != user_id {
            return Err(ProjectionError::Unauthorized(format!(
                "{} may not answer for {}",
                user_id, level.user_id
            )));
        }

        let key = ItemKey::interest_level(&level.hangout_id, &level.user_id);
        let previous = match self.replace_own_row(&key, &level, |stored| stored == &level).await? {
            RowChange::Unchanged => return Ok(0),
            RowChange::Replaced(previous) => previous,
        };

        // Only the write that replaced `previous` applies its transition
        let delta = self
            .counters
            .record_rsvp_change(
                &level.hangout_id,
                previous.map(|p| p.status),
                Some(level.status),
            )
            .await?;

        let mirrored = level.clone();
        self.synchronizer
            .sync_hangout_everywhere(
                &level.hangout_id,
                move |pointer| {
                    match pointer
                        .interest_levels
                        .iter_mut()
                        .find(|l| l.user_id == mirrored.user_id)
                    {
                        Some(existing) => *existing = mirrored.clone(),
                        None => pointer.interest_levels.push(mirrored.clone()),
                    }
                    Ok(())
                },
                "interest level changed",
            )
            .await?;
        Ok(delta)
    }

    pub async fn create_poll(&self, user_id: &str, poll: Poll) -> Result<Poll> {
        self.require_edit(user_id, EntityRef::Hangout(poll.hangout_id.clone()))
            .await?;
        self.store
            .put(
                ItemKey::poll(&poll.hangout_id, &poll.poll_id),
                poll.clone().into_item(),
                Condition::NotExists,
            )
            .await?;

        let summary = PollSummary::tally(&poll, &[]);
        self.synchronizer
            .sync_hangout_everywhere(
                &poll.hangout_id,
                move |pointer| {
                    pointer.polls.retain(|p| p.poll_id != summary.poll_id);
                    pointer.polls.push(summary.clone());
                    Ok(())
                },
                "poll created",
            )
            .await?;
        Ok(poll)
    }

    /// Cast or change a vote. Tallies in the pointers move by delta inside
    /// the version-checked sync, so concurrent voters cannot overwrite each
    /// other's counts.
    pub async fn cast_vote(&self, user_id: &str, vote: Vote) -> Result<()> {
        self.require_view(user_id, EntityRef::Hangout(vote.hangout_id.clone()))
            .await?;
        if vote.user_id != user_id {
            return Err(ProjectionError::Unauthorized(format!(
                "{} may not vote for {}",
                user_id, vote.user_id
            )));
        }

        let poll = require_typed::<Poll>(self.store.as_ref(), &ItemKey::poll(&vote.hangout_id, &vote.poll_id)).await?;
        if !poll.value.active {
            return Err(ProjectionError::InvalidOperation(format!("Poll {} is closed", vote.poll_id)));
        }
        if !poll.value.options.iter().any(|o| o.option_id == vote.option_id) {
            return Err(ProjectionError::InvalidOperation(format!(
                "Poll {} has no option {}",
                vote.poll_id, vote.option_id
            )));
        }

        let key = ItemKey::vote(&vote.hangout_id, &vote.poll_id, &vote.user_id);
        let previous = match self
            .replace_own_row(&key, &vote, |stored| stored.option_id == vote.option_id)
            .await?
        {
            RowChange::Unchanged => return Ok(()),
            RowChange::Replaced(previous) => previous.map(|v| v.option_id),
        };

        let poll_id = vote.poll_id.clone();
        let chosen = vote.option_id.clone();
        self.synchronizer
            .sync_hangout_everywhere(
                &vote.hangout_id,
                move |pointer| {
                    let Some(summary) = pointer.polls.iter_mut().find(|p| p.poll_id == poll_id) else {
                        return Ok(());
                    };
                    for option in summary.options.iter_mut() {
                        if option.option_id == chosen {
                            option.vote_count += 1;
                        } else if previous.as_deref() == Some(option.option_id.as_str()) {
                            option.vote_count = (option.vote_count - 1).max(0);
                        }
                    }
                    summary.total_votes = summary.options.iter().map(|o| o.vote_count).sum();
                    Ok(())
                },
                "vote cast",
            )
            .await?;
        Ok(())
    }

    /// Replace a per-user row conditioned on the version that was read, so
    /// of two concurrent updates from one user the second sees the first's
    /// value as its previous one. `unchanged` short-circuits without writing.
    async fn replace_own_row<T, F>(&self, key: &ItemKey, value: &T, unchanged: F) -> Result<RowChange<T>>
    where
        T: TypedItem,
        F: Fn(&T) -> bool,
    {
        let attempts = self.synchronizer.max_attempts();
        for attempt in 1..=attempts {
            let previous = get_typed::<T>(self.store.as_ref(), key).await?;
            let condition = match previous {
                Some(ref stored) if unchanged(&stored.value) => return Ok(RowChange::Unchanged),
                Some(ref stored) => Condition::VersionEquals(stored.version),
                None => Condition::NotExists,
            };

            match self.store.put(key.clone(), value.clone().into_item(), condition).await {
                Ok(_) => return Ok(RowChange::Replaced(previous.map(|p| p.value))),
                Err(e) if e.is_conflict() => {
                    debug!(key = %key, attempt, kind = T::KIND, "Row changed underneath, re-reading");
                }
                Err(e) => return Err(e),
            }
        }
        Err(ProjectionError::ConcurrencyExhausted {
            key: key.clone(),
            attempts,
        })
    }

    pub async fn set_attribute(&self, user_id: &str, attribute: HangoutAttribute) -> Result<()> {
        self.require_edit(user_id, EntityRef::Hangout(attribute.hangout_id.clone()))
            .await?;
        self.store
            .put(
                ItemKey::attribute(&attribute.hangout_id, &attribute.attribute_id),
                attribute.clone().into_item(),
                Condition::Always,
            )
            .await?;

        let hangout_id = attribute.hangout_id.clone();
        self.synchronizer
            .sync_hangout_everywhere(
                &hangout_id,
                move |pointer| {
                    match pointer
                        .attributes
                        .iter_mut()
                        .find(|a| a.attribute_id == attribute.attribute_id)
                    {
                        Some(existing) => *existing = attribute.clone(),
                        None => pointer.attributes.push(attribute.clone()),
                    }
                    Ok(())
                },
                "attribute changed",
            )
            .await?;
        Ok(())
    }

    // =========================================================================
    // Structural operations
    // =========================================================================

    pub async fn promote_to_series(
        &self,
        user_id: &str,
        existing_hangout_id: &str,
        new_member: NewHangout,
        details: SeriesDetails,
    ) -> Result<EventSeries> {
        self.require_edit(user_id, EntityRef::Hangout(existing_hangout_id.to_string()))
            .await?;
        self.structure
            .promote_to_series(existing_hangout_id, new_member, details)
            .await
    }

    pub async fn add_member_to_series(&self, user_id: &str, series_id: &str, new_member: NewHangout) -> Result<Hangout> {
        self.require_edit(user_id, EntityRef::Series(series_id.to_string()))
            .await?;
        self.structure.add_member_to_series(series_id, new_member).await
    }

    pub async fn remove_member(
        &self,
        user_id: &str,
        series_id: &str,
        hangout_id: &str,
        removal: MemberRemoval,
    ) -> Result<RemovalOutcome> {
        self.require_edit(user_id, EntityRef::Series(series_id.to_string()))
            .await?;
        self.structure.remove_member(series_id, hangout_id, removal).await
    }

    pub async fn delete_series(&self, user_id: &str, series_id: &str) -> Result<Vec<String>> {
        self.require_edit(user_id, EntityRef::Series(series_id.to_string()))
            .await?;
        self.structure.delete_series(series_id).await
    }

    // =========================================================================
    // Reservations
    // =========================================================================

    pub async fn create_offer(&self, user_id: &str, offer: ReservationOffer) -> Result<ReservationOffer> {
        self.require_edit(user_id, EntityRef::Hangout(offer.hangout_id.clone()))
            .await?;
        let mut offer = offer;
        offer.claimed_spots = 0;
        offer.status = OfferStatus::Collecting;
        self.store
            .put(
                ItemKey::reservation_offer(&offer.hangout_id, &offer.offer_id),
                offer.clone().into_item(),
                Condition::NotExists,
            )
            .await?;
        Ok(offer)
    }

    pub async fn claim_spot(&self, user_id: &str, hangout_id: &str, offer_id: &str) -> Result<Participation> {
        self.require_view(user_id, EntityRef::Hangout(hangout_id.to_string()))
            .await?;
        self.reservations.claim_spot(hangout_id, offer_id, user_id).await
    }

    pub async fn unclaim_spot(&self, user_id: &str, hangout_id: &str, offer_id: &str) -> Result<()> {
        self.require_view(user_id, EntityRef::Hangout(hangout_id.to_string()))
            .await?;
        self.reservations.unclaim_spot(hangout_id, offer_id, user_id).await
    }

    pub async fn complete_reservation(&self, user_id: &str, hangout_id: &str, offer_id: &str) -> Result<CompletionReport> {
        self.require_edit(user_id, EntityRef::Hangout(hangout_id.to_string()))
            .await?;
        self.reservations
            .complete_reservation(hangout_id, offer_id, user_id)
            .await
    }

    // =========================================================================
    // Repair
    // =========================================================================

    pub async fn resync_hangout(&self, group_id: &str, hangout_id: &str) -> Result<Versioned<HangoutPointer>> {
        self.synchronizer.resync_hangout_pointer(group_id, hangout_id).await
    }

    pub async fn resync_series(&self, group_id: &str, series_id: &str) -> Result<Versioned<SeriesPointer>> {
        self.synchronizer.resync_series_pointer(group_id, series_id).await
    }

    /// Resync the hangout's pointer in every associated group
    pub async fn resync_hangout_everywhere(&self, hangout_id: &str) -> Result<Vec<Versioned<HangoutPointer>>> {
        let hangout = require_typed::<Hangout>(self.store.as_ref(), &ItemKey::hangout(hangout_id)).await?;
        let mut pointers = Vec::with_capacity(hangout.value.associated_groups.len());
        for group_id in &hangout.value.associated_groups {
            pointers.push(self.resync_hangout(group_id, hangout_id).await?);
        }
        Ok(pointers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InterestStatus, PollOption, Visibility};
    use crate::store::MemoryStore;

    fn engine() -> Engine {
        Engine::new(Arc::new(MemoryStore::new()), Config::default())
    }

    fn hangout(id: &str) -> Hangout {
        Hangout {
            hangout_id: id.into(),
            title: "Picnic".into(),
            description: None,
            start_timestamp: Some(1_000),
            end_timestamp: None,
            location: None,
            visibility: Visibility::InviteOnly,
            associated_groups: vec!["g1".into()],
            series_id: None,
            carpool_enabled: false,
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn test_rsvp_and_votes_mirror_into_pointer() {
        let engine = engine();
        engine.create_hangout("alice", hangout("h1")).await.unwrap();
        engine
            .create_poll(
                "alice",
                Poll {
                    poll_id: "p1".into(),
                    hangout_id: "h1".into(),
                    title: "Bring?".into(),
                    options: vec![
                        PollOption { option_id: "food".into(), text: "Food".into() },
                        PollOption { option_id: "drinks".into(), text: "Drinks".into() },
                    ],
                    active: true,
                    created_at: 0,
                },
            )
            .await
            .unwrap();

        let level = InterestLevel {
            hangout_id: "h1".into(),
            user_id: "alice".into(),
            display_name: "Alice".into(),
            status: InterestStatus::Going,
            notes: None,
        };
        assert_eq!(engine.set_interest("alice", level).await.unwrap(), 1);

        let vote = |option: &str| Vote {
            hangout_id: "h1".into(),
            poll_id: "p1".into(),
            option_id: option.into(),
            user_id: "alice".into(),
        };
        engine.cast_vote("alice", vote("food")).await.unwrap();
        engine.cast_vote("alice", vote("drinks")).await.unwrap();

        let pointer = engine.hangout_pointer("g1", "h1").await.unwrap().unwrap().value;
        assert_eq!(pointer.participant_count, 1);
        assert_eq!(pointer.interest_levels.len(), 1);
        let poll = &pointer.polls[0];
        assert_eq!(poll.total_votes, 1);
        assert_eq!(poll.options[1].vote_count, 1);

        // resync from canonical rows agrees with the incremental state
        let rebuilt = engine.resync_hangout("g1", "h1").await.unwrap().value;
        assert_eq!(rebuilt.participant_count, pointer.participant_count);
        assert_eq!(rebuilt.polls, pointer.polls);
    }

    #[tokio::test]
    async fn test_update_keeps_structural_fields() {
        let engine = engine();
        engine.create_hangout("alice", hangout("h1")).await.unwrap();

        let mut edited = hangout("h1");
        edited.title = "Beach picnic".into();
        edited.associated_groups = vec!["elsewhere".into()];
        let updated = engine.update_hangout("alice", edited).await.unwrap();
        assert_eq!(updated.associated_groups, vec!["g1".to_string()]);

        let pointer = engine.hangout_pointer("g1", "h1").await.unwrap().unwrap();
        assert_eq!(pointer.value.title, "Beach picnic");
    }

    #[tokio::test]
    async fn test_repeated_rsvp_counts_once() {
        let engine = engine();
        engine.create_hangout("alice", hangout("h1")).await.unwrap();
        let mut level = InterestLevel {
            hangout_id: "h1".into(),
            user_id: "bob".into(),
            display_name: "Bob".into(),
            status: InterestStatus::Going,
            notes: None,
        };
        assert_eq!(engine.set_interest("bob", level.clone()).await.unwrap(), 1);
        assert_eq!(engine.set_interest("bob", level.clone()).await.unwrap(), 0);
        level.notes = Some("bringing chairs".into());
        assert_eq!(engine.set_interest("bob", level.clone()).await.unwrap(), 0);
        level.status = InterestStatus::NotGoing;
        assert_eq!(engine.set_interest("bob", level).await.unwrap(), -1);

        let pointer = engine.hangout_pointer("g1", "h1").await.unwrap().unwrap().value;
        assert_eq!(pointer.participant_count, 0);
        assert_eq!(pointer.interest_levels[0].status, InterestStatus::NotGoing);
    }

    #[tokio::test]
    async fn test_cannot_answer_for_someone_else() {
        let engine = engine();
        engine.create_hangout("alice", hangout("h1")).await.unwrap();
        let level = InterestLevel {
            hangout_id: "h1".into(),
            user_id: "bob".into(),
            display_name: "Bob".into(),
            status: InterestStatus::Going,
            notes: None,
        };
        assert!(matches!(
            engine.set_interest("alice", level).await,
            Err(ProjectionError::Unauthorized(_))
        ));
    }
}
