//! Data model shared by the store, synchronizer, coordinator, and feed
//!
//! - `keys` - partition/sort key layout of the single table
//! - `canonical` - authoritative records and hangout child rows
//! - `pointer` - per-group projections
//! - `item` - tagged row union and versioned envelope

pub mod canonical;
pub mod item;
pub mod keys;
pub mod pointer;

pub use canonical::{
    EventSeries, Group, Hangout, HangoutAttribute, InterestLevel, InterestStatus, Location,
    NewHangout, OfferStatus, OfferType, Participation, ParticipationType, Poll, PollOption,
    ReservationOffer, SeriesDetails, Vote, Visibility,
};
pub use item::{CounterField, IndexEntry, Record, StoreItem, TypedItem, Versioned};
pub use keys::ItemKey;
pub use pointer::{HangoutPointer, PollOptionSummary, PollSummary, SeriesPointer};

/// Current time in Unix millis
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
