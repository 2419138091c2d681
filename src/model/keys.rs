//! Single-table key layout
//!
//! Canonical records live in their own partition (`EVENT#`, `SERIES#`,
//! `GROUP#` + `METADATA`). Projections live in the group partition so a
//! group's feed is one range query.
//!
//! ```text
//! pk                  sk
//! GROUP#{g}           METADATA                 canonical group
//! GROUP#{g}           HANGOUT#{h}              hangout pointer
//! GROUP#{g}           SERIES#{s}               series pointer
//! EVENT#{h}           METADATA                 canonical hangout
//! EVENT#{h}           POLL#{p}                 poll
//! EVENT#{h}           VOTE#{p}#{u}             vote
//! EVENT#{h}           ATTENDANCE#{u}           interest level
//! EVENT#{h}           ATTRIBUTE#{a}            attribute
//! EVENT#{h}           OFFER#{o}                reservation offer
//! EVENT#{h}           PARTICIPATION#{p}        participation
//! SERIES#{s}          METADATA                 canonical series
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

pub const GROUP_PREFIX: &str = "GROUP#";
pub const EVENT_PREFIX: &str = "EVENT#";
pub const SERIES_PREFIX: &str = "SERIES#";
pub const HANGOUT_PREFIX: &str = "HANGOUT#";
pub const METADATA: &str = "METADATA";
pub const POLL_PREFIX: &str = "POLL#";
pub const VOTE_PREFIX: &str = "VOTE#";
pub const ATTENDANCE_PREFIX: &str = "ATTENDANCE#";
pub const ATTRIBUTE_PREFIX: &str = "ATTRIBUTE#";
pub const OFFER_PREFIX: &str = "OFFER#";
pub const PARTICIPATION_PREFIX: &str = "PARTICIPATION#";

/// Primary key of a stored row
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemKey {
    pub pk: String,
    pub sk: String,
}

impl ItemKey {
    pub fn new(pk: impl Into<String>, sk: impl Into<String>) -> Self {
        Self {
            pk: pk.into(),
            sk: sk.into(),
        }
    }

    pub fn group(group_id: &str) -> Self {
        Self::new(group_pk(group_id), METADATA)
    }

    pub fn hangout(hangout_id: &str) -> Self {
        Self::new(event_pk(hangout_id), METADATA)
    }

    pub fn series(series_id: &str) -> Self {
        Self::new(series_pk(series_id), METADATA)
    }

    pub fn hangout_pointer(group_id: &str, hangout_id: &str) -> Self {
        Self::new(group_pk(group_id), format!("{}{}", HANGOUT_PREFIX, hangout_id))
    }

    pub fn series_pointer(group_id: &str, series_id: &str) -> Self {
        Self::new(group_pk(group_id), format!("{}{}", SERIES_PREFIX, series_id))
    }

    pub fn poll(hangout_id: &str, poll_id: &str) -> Self {
        Self::new(event_pk(hangout_id), format!("{}{}", POLL_PREFIX, poll_id))
    }

    pub fn vote(hangout_id: &str, poll_id: &str, user_id: &str) -> Self {
        Self::new(
            event_pk(hangout_id),
            format!("{}{}#{}", VOTE_PREFIX, poll_id, user_id),
        )
    }

    pub fn interest_level(hangout_id: &str, user_id: &str) -> Self {
        Self::new(event_pk(hangout_id), format!("{}{}", ATTENDANCE_PREFIX, user_id))
    }

    pub fn attribute(hangout_id: &str, attribute_id: &str) -> Self {
        Self::new(event_pk(hangout_id), format!("{}{}", ATTRIBUTE_PREFIX, attribute_id))
    }

    pub fn reservation_offer(hangout_id: &str, offer_id: &str) -> Self {
        Self::new(event_pk(hangout_id), format!("{}{}", OFFER_PREFIX, offer_id))
    }

    pub fn participation(hangout_id: &str, participation_id: &str) -> Self {
        Self::new(
            event_pk(hangout_id),
            format!("{}{}", PARTICIPATION_PREFIX, participation_id),
        )
    }

    /// Id of the entity this row describes: the partition id for `METADATA`
    /// rows, otherwise the sort key after its type prefix.
    pub fn entity_id(&self) -> &str {
        let source = if self.sk == METADATA { &self.pk } else { &self.sk };
        source.split_once('#').map_or(source.as_str(), |(_, id)| id)
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pk, self.sk)
    }
}

pub fn group_pk(group_id: &str) -> String {
    format!("{}{}", GROUP_PREFIX, group_id)
}

pub fn event_pk(hangout_id: &str) -> String {
    format!("{}{}", EVENT_PREFIX, hangout_id)
}

pub fn series_pk(series_id: &str) -> String {
    format!("{}{}", SERIES_PREFIX, series_id)
}

/// Strip the `GROUP#` prefix from a partition key, if present
pub fn group_id_from_pk(pk: &str) -> Option<&str> {
    pk.strip_prefix(GROUP_PREFIX)
}
