//! Stored row union
//!
//! Every row in the single table is one `StoreItem` variant, discriminated
//! by the `itemType` tag. Rows are wrapped in a `Record` envelope that owns
//! the key and the optimistic-concurrency version.

use serde::{Deserialize, Serialize};

use super::canonical::{
    EventSeries, Group, Hangout, HangoutAttribute, InterestLevel, Participation, Poll,
    ReservationOffer, Vote,
};
use super::keys::ItemKey;
use super::pointer::{HangoutPointer, SeriesPointer};
use crate::error::{ProjectionError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "itemType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StoreItem {
    Group(Group),
    Hangout(Hangout),
    Series(EventSeries),
    Poll(Poll),
    Vote(Vote),
    InterestLevel(InterestLevel),
    Attribute(HangoutAttribute),
    ReservationOffer(ReservationOffer),
    Participation(Participation),
    HangoutPointer(HangoutPointer),
    SeriesPointer(SeriesPointer),
}

/// Time-index columns extracted from a projection row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub entity_id: String,
    pub start: Option<i64>,
    /// End used by the past window; start when the row has no end
    pub end: Option<i64>,
}

/// Numeric attributes that may be adjusted by delta
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CounterField {
    ParticipantCount,
    ClaimedSpots,
}

impl CounterField {
    /// Attribute name in the serialized row
    pub fn attribute(self) -> &'static str {
        match self {
            CounterField::ParticipantCount => "participantCount",
            CounterField::ClaimedSpots => "claimedSpots",
        }
    }

    /// `itemType` of the rows that carry this counter
    pub fn owner_type(self) -> &'static str {
        match self {
            CounterField::ParticipantCount => "HANGOUT_POINTER",
            CounterField::ClaimedSpots => "RESERVATION_OFFER",
        }
    }
}

impl std::fmt::Display for CounterField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.attribute())
    }
}

impl StoreItem {
    pub fn type_name(&self) -> &'static str {
        match self {
            StoreItem::Group(_) => "GROUP",
            StoreItem::Hangout(_) => "HANGOUT",
            StoreItem::Series(_) => "SERIES",
            StoreItem::Poll(_) => "POLL",
            StoreItem::Vote(_) => "VOTE",
            StoreItem::InterestLevel(_) => "INTEREST_LEVEL",
            StoreItem::Attribute(_) => "ATTRIBUTE",
            StoreItem::ReservationOffer(_) => "RESERVATION_OFFER",
            StoreItem::Participation(_) => "PARTICIPATION",
            StoreItem::HangoutPointer(_) => "HANGOUT_POINTER",
            StoreItem::SeriesPointer(_) => "SERIES_POINTER",
        }
    }

    /// Time-index entry; only projection rows are indexed
    pub fn index_entry(&self) -> Option<IndexEntry> {
        match self {
            StoreItem::HangoutPointer(p) => Some(IndexEntry {
                entity_id: p.hangout_id.clone(),
                start: p.start_timestamp,
                end: p.effective_end(),
            }),
            StoreItem::SeriesPointer(p) => Some(IndexEntry {
                entity_id: p.series_id.clone(),
                start: p.start_timestamp,
                end: p.effective_end(),
            }),
            _ => None,
        }
    }

    /// Mutable access to a counter attribute, if this row carries it
    pub fn counter_mut(&mut self, field: CounterField) -> Option<&mut i64> {
        match (self, field) {
            (StoreItem::HangoutPointer(p), CounterField::ParticipantCount) => Some(&mut p.participant_count),
            (StoreItem::ReservationOffer(o), CounterField::ClaimedSpots) => Some(&mut o.claimed_spots),
            _ => None,
        }
    }
}

/// A stored row with its key and version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: ItemKey,
    pub version: u64,
    pub item: StoreItem,
}

impl Record {
    /// Narrow the row to a concrete type
    pub fn into_typed<T: TypedItem>(self) -> Result<Versioned<T>> {
        let type_name = self.item.type_name();
        match T::from_item(self.item) {
            Some(value) => Ok(Versioned {
                key: self.key,
                version: self.version,
                value,
            }),
            None => Err(ProjectionError::Internal(format!(
                "Expected {} at {}, found {}",
                T::KIND,
                self.key,
                type_name
            ))),
        }
    }
}

/// A typed row plus the version it was read at
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub key: ItemKey,
    pub version: u64,
    pub value: T,
}

/// Conversion between a concrete row type and the stored union
pub trait TypedItem: Clone + Send + Sync + 'static {
    const KIND: &'static str;

    fn from_item(item: StoreItem) -> Option<Self>;

    fn into_item(self) -> StoreItem;
}

macro_rules! typed_item {
    ($ty:ty, $variant:ident, $kind:literal) => {
        impl TypedItem for $ty {
            const KIND: &'static str = $kind;

            fn from_item(item: StoreItem) -> Option<Self> {
                match item {
                    StoreItem::$variant(value) => Some(value),
                    _ => None,
                }
            }

            fn into_item(self) -> StoreItem {
                StoreItem::$variant(self)
            }
        }
    };
}

typed_item!(Group, Group, "GROUP");
typed_item!(Hangout, Hangout, "HANGOUT");
typed_item!(EventSeries, Series, "SERIES");
typed_item!(Poll, Poll, "POLL");
typed_item!(Vote, Vote, "VOTE");
typed_item!(InterestLevel, InterestLevel, "INTEREST_LEVEL");
typed_item!(HangoutAttribute, Attribute, "ATTRIBUTE");
typed_item!(ReservationOffer, ReservationOffer, "RESERVATION_OFFER");
typed_item!(Participation, Participation, "PARTICIPATION");
typed_item!(HangoutPointer, HangoutPointer, "HANGOUT_POINTER");
typed_item!(SeriesPointer, SeriesPointer, "SERIES_POINTER");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::canonical::{InterestStatus, Visibility};

    fn pointer() -> HangoutPointer {
        HangoutPointer::from_hangout(
            "g1",
            &Hangout {
                hangout_id: "h1".into(),
                title: "Board games".into(),
                description: None,
                start_timestamp: Some(100),
                end_timestamp: None,
                location: None,
                visibility: Visibility::Public,
                associated_groups: vec!["g1".into()],
                series_id: None,
                carpool_enabled: true,
                created_at: 0,
            },
        )
    }

    #[test]
    fn test_item_type_tag() {
        let item = StoreItem::HangoutPointer(pointer());
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["itemType"], "HANGOUT_POINTER");
        assert_eq!(json["participantCount"], 0);

        let back: StoreItem = serde_json::from_value(json).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn test_unknown_item_type_rejected() {
        let json = serde_json::json!({ "itemType": "CARPOOL", "hangoutId": "h1" });
        assert!(serde_json::from_value::<StoreItem>(json).is_err());
    }

    #[test]
    fn test_index_entry_uses_effective_end() {
        let entry = StoreItem::HangoutPointer(pointer()).index_entry().unwrap();
        assert_eq!(entry.entity_id, "h1");
        assert_eq!(entry.start, Some(100));
        assert_eq!(entry.end, Some(100));

        let level = StoreItem::InterestLevel(InterestLevel {
            hangout_id: "h1".into(),
            user_id: "u1".into(),
            display_name: "U".into(),
            status: InterestStatus::Going,
            notes: None,
        });
        assert!(level.index_entry().is_none());
    }

    #[test]
    fn test_counter_mut_matches_field() {
        let mut item = StoreItem::HangoutPointer(pointer());
        *item.counter_mut(CounterField::ParticipantCount).unwrap() += 2;
        assert!(item.counter_mut(CounterField::ClaimedSpots).is_none());
        match item {
            StoreItem::HangoutPointer(p) => assert_eq!(p.participant_count, 2),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_into_typed_mismatch() {
        let record = Record {
            key: ItemKey::hangout_pointer("g1", "h1"),
            version: 3,
            item: StoreItem::HangoutPointer(pointer()),
        };
        assert!(record.clone().into_typed::<SeriesPointer>().is_err());
        let typed = record.into_typed::<HangoutPointer>().unwrap();
        assert_eq!(typed.version, 3);
    }
}
