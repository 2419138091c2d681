//! Ticket and reservation coordination
//!
//! Claiming a spot writes the offer's counter and the participation row in
//! one transaction so the two can never disagree. These writes are required
//! for the caller's operation to mean anything, so running out of attempts
//! is a hard `ConcurrencyExhausted` error.
//!
//! Completing a reservation converts every claimed spot into a purchased
//! ticket. That can be hundreds of rows, so it runs as a chunked `BulkBatch`
//! and skips rows that are already converted; re-running after a partial
//! failure picks up where it stopped.

use std::sync::Arc;

use tracing::{debug, info};

use super::batch::{BulkBatch, TransactionBatch};
use crate::error::{ProjectionError, Result};
use crate::events::ChangeSignal;
use crate::model::keys::{event_pk, PARTICIPATION_PREFIX};
use crate::model::{
    now_millis, ItemKey, OfferStatus, Participation, ParticipationType, ReservationOffer, TypedItem,
};
use crate::store::{get_typed, query_typed, require_typed, Condition, ItemStore, WriteIntent};
use crate::sync::{PointerSynchronizer, SyncCriticality};

/// Participation id for a user's claim on an offer
pub fn claim_id(offer_id: &str, user_id: &str) -> String {
    format!("{}-{}", offer_id, user_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionReport {
    pub converted: usize,
    /// Participations already converted by an earlier run
    pub skipped: usize,
}

pub struct ReservationCoordinator {
    synchronizer: Arc<PointerSynchronizer>,
}

impl ReservationCoordinator {
    pub fn new(synchronizer: Arc<PointerSynchronizer>) -> Self {
        Self { synchronizer }
    }

    fn offer_key(hangout_id: &str, offer_id: &str) -> ItemKey {
        ItemKey::reservation_offer(hangout_id, offer_id)
    }

    /// Claim one spot on an offer for `user_id`
    pub async fn claim_spot(&self, hangout_id: &str, offer_id: &str, user_id: &str) -> Result<Participation> {
        let store = self.synchronizer.store().as_ref();
        let offer_key = Self::offer_key(hangout_id, offer_id);
        let participation_id = claim_id(offer_id, user_id);
        let participation_key = ItemKey::participation(hangout_id, &participation_id);
        let attempts = self.synchronizer.max_attempts();

        for attempt in 1..=attempts {
            let offer = require_typed::<ReservationOffer>(store, &offer_key).await?;
            if offer.value.status != OfferStatus::Collecting {
                return Err(ProjectionError::InvalidOperation(format!(
                    "Offer {} is no longer collecting claims",
                    offer_id
                )));
            }
            if !offer.value.has_open_spot() {
                return Err(ProjectionError::InvalidOperation(format!("Offer {} is full", offer_id)));
            }

            let mut claimed = offer.value.clone();
            claimed.claimed_spots += 1;
            let participation = Participation {
                participation_id: participation_id.clone(),
                hangout_id: hangout_id.to_string(),
                user_id: user_id.to_string(),
                offer_id: Some(offer_id.to_string()),
                kind: ParticipationType::ClaimedSpot,
                converted_at: None,
            };

            let mut batch = TransactionBatch::new("claim_spot");
            batch
                .replace(&offer, claimed)
                .create(participation_key.clone(), participation.clone());

            match batch.submit(store).await {
                Ok(_) => {
                    debug!(offer = %offer_id, user = %user_id, attempt, "Spot claimed");
                    self.emit_claim_change(&offer_key, 1);
                    return Ok(participation);
                }
                Err(e) if e.is_conflict() => {
                    if store.get(&participation_key).await?.is_some() {
                        return Err(ProjectionError::InvalidOperation(format!(
                            "User {} already claimed a spot on offer {}",
                            user_id, offer_id
                        )));
                    }
                    debug!(offer = %offer_id, attempt, "Claim conflicted, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(ProjectionError::ConcurrencyExhausted {
            key: offer_key,
            attempts,
        })
    }

    /// Release `user_id`'s claimed spot
    pub async fn unclaim_spot(&self, hangout_id: &str, offer_id: &str, user_id: &str) -> Result<()> {
        let store = self.synchronizer.store().as_ref();
        let offer_key = Self::offer_key(hangout_id, offer_id);
        let participation_key = ItemKey::participation(hangout_id, &claim_id(offer_id, user_id));
        let attempts = self.synchronizer.max_attempts();

        for attempt in 1..=attempts {
            let offer = require_typed::<ReservationOffer>(store, &offer_key).await?;
            let participation = require_typed::<Participation>(store, &participation_key).await?;
            if participation.value.kind != ParticipationType::ClaimedSpot {
                return Err(ProjectionError::InvalidOperation(format!(
                    "Participation {} is {:?}, not a claimed spot",
                    participation.value.participation_id, participation.value.kind
                )));
            }

            let mut released = offer.value.clone();
            released.claimed_spots = (released.claimed_spots - 1).max(0);

            let mut batch = TransactionBatch::new("unclaim_spot");
            batch.replace(&offer, released).remove(&participation);

            match batch.submit(store).await {
                Ok(_) => {
                    debug!(offer = %offer_id, user = %user_id, attempt, "Spot released");
                    self.emit_claim_change(&offer_key, -1);
                    return Ok(());
                }
                Err(e) if e.is_conflict() => {
                    debug!(offer = %offer_id, attempt, "Unclaim conflicted, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(ProjectionError::ConcurrencyExhausted {
            key: offer_key,
            attempts,
        })
    }

    /// Convert every claimed spot on the offer into a purchased ticket, then
    /// mark the offer completed. Safe to re-run after `PartialBulk`.
    pub async fn complete_reservation(
        &self,
        hangout_id: &str,
        offer_id: &str,
        completed_by: &str,
    ) -> Result<CompletionReport> {
        let store = self.synchronizer.store().as_ref();
        let offer_key = Self::offer_key(hangout_id, offer_id);
        let offer = require_typed::<ReservationOffer>(store, &offer_key).await?;
        if offer.value.status == OfferStatus::Cancelled {
            return Err(ProjectionError::InvalidOperation(format!("Offer {} was cancelled", offer_id)));
        }

        let participations =
            query_typed::<Participation>(store, &event_pk(hangout_id), PARTICIPATION_PREFIX).await?;
        let now = now_millis();

        let mut bulk = BulkBatch::new("complete_reservation");
        let mut skipped = 0;
        for participation in participations
            .into_iter()
            .filter(|p| p.value.offer_id.as_deref() == Some(offer_id))
        {
            if participation.value.kind != ParticipationType::ClaimedSpot {
                skipped += 1;
                continue;
            }
            let mut converted = participation.value.clone();
            converted.kind = ParticipationType::TicketPurchased;
            converted.converted_at = Some(now);
            bulk.push(WriteIntent::Put {
                key: participation.key.clone(),
                item: converted.into_item(),
                condition: Condition::VersionEquals(participation.version),
            });
        }

        let converted = bulk.len();
        bulk.submit(store).await?;

        if offer.value.status != OfferStatus::Completed {
            let by = completed_by.to_string();
            self.synchronizer
                .sync_record::<ReservationOffer, _>(
                    &offer_key,
                    move |offer| {
                        offer.status = OfferStatus::Completed;
                        offer.completed_by = Some(by.clone());
                        offer.completed_at = Some(now);
                        Ok(())
                    },
                    "reservation completed",
                    SyncCriticality::Required,
                )
                .await?;
        }

        info!(hangout = %hangout_id, offer = %offer_id, converted, skipped, "Reservation completed");
        self.synchronizer.events().emit(ChangeSignal::ReservationCompleted {
            hangout_id: hangout_id.to_string(),
            offer_id: offer_id.to_string(),
            converted,
        });

        Ok(CompletionReport { converted, skipped })
    }

    /// Current state of an offer
    pub async fn offer(&self, hangout_id: &str, offer_id: &str) -> Result<Option<ReservationOffer>> {
        Ok(
            get_typed::<ReservationOffer>(self.synchronizer.store().as_ref(), &Self::offer_key(hangout_id, offer_id))
                .await?
                .map(|v| v.value),
        )
    }

    fn emit_claim_change(&self, offer_key: &ItemKey, delta: i64) {
        let events = self.synchronizer.events();
        events.emit(ChangeSignal::CounterAdjusted {
            partition: offer_key.pk.clone(),
            entity_id: offer_key.entity_id().to_string(),
            field: crate::model::CounterField::ClaimedSpots,
            delta,
        });
        events.emit_partitions([offer_key.pk.as_str()]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::model::{OfferType, StoreItem};
    use crate::store::{ItemStore, MemoryStore};

    async fn setup(limit: usize, capacity: Option<i64>) -> (Arc<MemoryStore>, ReservationCoordinator) {
        let store = Arc::new(MemoryStore::with_transaction_limit(limit));
        store
            .put(
                ItemKey::reservation_offer("h1", "o1"),
                StoreItem::ReservationOffer(ReservationOffer {
                    offer_id: "o1".into(),
                    hangout_id: "h1".into(),
                    offer_type: OfferType::Reservation,
                    capacity,
                    claimed_spots: 0,
                    status: OfferStatus::Collecting,
                    completed_by: None,
                    completed_at: None,
                }),
                Condition::NotExists,
            )
            .await
            .unwrap();
        let sync = Arc::new(PointerSynchronizer::new(store.clone(), Arc::new(EventBus::new())));
        (store, ReservationCoordinator::new(sync))
    }

    #[tokio::test]
    async fn test_claim_and_unclaim() {
        let (_store, coord) = setup(100, Some(2)).await;
        coord.claim_spot("h1", "o1", "u1").await.unwrap();
        coord.claim_spot("h1", "o1", "u2").await.unwrap();

        assert!(matches!(
            coord.claim_spot("h1", "o1", "u3").await,
            Err(ProjectionError::InvalidOperation(_))
        ));
        assert_eq!(coord.offer("h1", "o1").await.unwrap().unwrap().claimed_spots, 2);

        coord.unclaim_spot("h1", "o1", "u1").await.unwrap();
        assert_eq!(coord.offer("h1", "o1").await.unwrap().unwrap().claimed_spots, 1);
        coord.claim_spot("h1", "o1", "u3").await.unwrap();
    }

    #[tokio::test]
    async fn test_double_claim_rejected() {
        let (_store, coord) = setup(100, None).await;
        coord.claim_spot("h1", "o1", "u1").await.unwrap();
        assert!(matches!(
            coord.claim_spot("h1", "o1", "u1").await,
            Err(ProjectionError::InvalidOperation(_))
        ));
        assert_eq!(coord.offer("h1", "o1").await.unwrap().unwrap().claimed_spots, 1);
    }

    #[tokio::test]
    async fn test_claim_exhaustion_is_hard_error() {
        let (store, coord) = setup(100, None).await;
        store.fail_transactions(0, 5, 0);

        assert!(matches!(
            coord.claim_spot("h1", "o1", "u1").await,
            Err(ProjectionError::ConcurrencyExhausted { attempts: 5, .. })
        ));
        assert_eq!(coord.offer("h1", "o1").await.unwrap().unwrap().claimed_spots, 0);
    }

    #[tokio::test]
    async fn test_claim_absorbs_a_lost_race() {
        let (store, coord) = setup(100, None).await;
        store.fail_next_transaction_at(1);
        coord.claim_spot("h1", "o1", "u1").await.unwrap();
        assert_eq!(coord.offer("h1", "o1").await.unwrap().unwrap().claimed_spots, 1);
    }

    #[tokio::test]
    async fn test_complete_is_chunked_and_resumable() {
        let (store, coord) = setup(4, None).await;
        for i in 0..10 {
            coord.claim_spot("h1", "o1", &format!("u{}", i)).await.unwrap();
        }

        // first chunk of 4 commits, second chunk fails
        store.fail_transactions(1, 1, 0);
        match coord.complete_reservation("h1", "o1", "organizer").await {
            Err(ProjectionError::PartialBulk { committed, total, .. }) => {
                assert_eq!(committed, 4);
                assert_eq!(total, 10);
            }
            other => panic!("unexpected {:?}", other),
        }
        let offer = coord.offer("h1", "o1").await.unwrap().unwrap();
        assert_eq!(offer.status, OfferStatus::Collecting);

        let resumed = coord.complete_reservation("h1", "o1", "organizer").await.unwrap();
        assert_eq!(resumed, CompletionReport { converted: 6, skipped: 4 });

        let again = coord.complete_reservation("h1", "o1", "organizer").await.unwrap();
        assert_eq!(again, CompletionReport { converted: 0, skipped: 10 });

        let offer = coord.offer("h1", "o1").await.unwrap().unwrap();
        assert_eq!(offer.status, OfferStatus::Completed);
        assert_eq!(offer.completed_by.as_deref(), Some("organizer"));

        let purchased = query_typed::<Participation>(store.as_ref(), "EVENT#h1", PARTICIPATION_PREFIX)
            .await
            .unwrap();
        assert!(purchased
            .iter()
            .all(|p| p.value.kind == ParticipationType::TicketPurchased && p.value.converted_at.is_some()));
    }
}
