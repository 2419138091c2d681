//! Canonical records
//!
//! The authoritative copy of each entity. Projections are derived from these
//! plus the hangout's child rows (polls, votes, interest levels, attributes).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Group
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub group_id: String,
    pub group_name: String,
    #[serde(default)]
    pub member_ids: Vec<String>,
    #[serde(default)]
    pub public: bool,
    pub created_at: i64,
}

impl Group {
    pub fn has_member(&self, user_id: &str) -> bool {
        self.member_ids.iter().any(|m| m == user_id)
    }
}

// ============================================================================
// Hangout
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub street_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Visibility {
    #[default]
    InviteOnly,
    Public,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hangout {
    pub hangout_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub associated_groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series_id: Option<String>,
    #[serde(default)]
    pub carpool_enabled: bool,
    pub created_at: i64,
}

/// Input for a hangout created as part of a structural operation
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewHangout {
    #[serde(default)]
    pub hangout_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub start_timestamp: Option<i64>,
    #[serde(default)]
    pub end_timestamp: Option<i64>,
    #[serde(default)]
    pub location: Option<Location>,
}

impl NewHangout {
    /// Materialize the canonical record for a hangout joining `series_id`
    pub fn into_hangout(self, series_id: &str, groups: Vec<String>, created_at: i64) -> Hangout {
        Hangout {
            hangout_id: self.hangout_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            title: self.title,
            description: self.description,
            start_timestamp: self.start_timestamp,
            end_timestamp: self.end_timestamp,
            location: self.location,
            visibility: Visibility::default(),
            associated_groups: groups,
            series_id: Some(series_id.to_string()),
            carpool_enabled: false,
            created_at,
        }
    }
}

// ============================================================================
// Event series
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSeries {
    pub series_id: String,
    pub series_title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series_description: Option<String>,
    #[serde(default)]
    pub hangout_ids: Vec<String>,
    #[serde(default)]
    pub group_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<i64>,
    pub created_at: i64,
}

/// Title/description for a series created by promotion
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesDetails {
    #[serde(default)]
    pub series_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
}

// ============================================================================
// Child records of a hangout
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollOption {
    pub option_id: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Poll {
    pub poll_id: String,
    pub hangout_id: String,
    pub title: String,
    #[serde(default)]
    pub options: Vec<PollOption>,
    #[serde(default = "default_true")]
    pub active: bool,
    pub created_at: i64,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    pub hangout_id: String,
    pub poll_id: String,
    pub option_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterestStatus {
    Going,
    Interested,
    NotGoing,
}

impl InterestStatus {
    /// Whether this status counts toward a hangout's participant count
    pub fn counts_as_participant(self) -> bool {
        matches!(self, InterestStatus::Going | InterestStatus::Interested)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterestLevel {
    pub hangout_id: String,
    pub user_id: String,
    pub display_name: String,
    pub status: InterestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HangoutAttribute {
    pub attribute_id: String,
    pub hangout_id: String,
    pub name: String,
    pub value: String,
}

// ============================================================================
// Ticket / reservation coordination
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfferType {
    Ticket,
    Reservation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfferStatus {
    Collecting,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationOffer {
    pub offer_id: String,
    pub hangout_id: String,
    pub offer_type: OfferType,
    /// None means unlimited spots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<i64>,
    #[serde(default)]
    pub claimed_spots: i64,
    pub status: OfferStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
}

impl ReservationOffer {
    pub fn has_open_spot(&self) -> bool {
        self.capacity.map_or(true, |cap| self.claimed_spots < cap)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipationType {
    TicketNeeded,
    ClaimedSpot,
    TicketPurchased,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participation {
    pub participation_id: String,
    pub hangout_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: ParticipationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub converted_at: Option<i64>,
}
