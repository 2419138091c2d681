//! Opaque pagination tokens
//!
//! A token is URL-safe base64 (no padding) over a small JSON record:
//!
//! ```json
//! {"entityId": "h42", "timestamp": 1717430400000, "direction": "forward"}
//! ```
//!
//! With an `entityId` the token continues strictly after that entity's
//! position in the window's index. Without one it only anchors a window at
//! `timestamp`; the boundary between the current view and the past view is
//! such a token. Store keys never appear in a token.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{ProjectionError, Result};
use crate::store::IndexPosition;

/// Which way a feed page reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedDirection {
    /// In-progress and upcoming, soonest first
    #[default]
    Forward,
    /// Past, most recently ended first
    Backward,
}

impl std::str::FromStr for FeedDirection {
    type Err = ProjectionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "forward" => Ok(FeedDirection::Forward),
            "backward" => Ok(FeedDirection::Backward),
            other => Err(ProjectionError::InvalidOperation(format!(
                "Unknown feed direction: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedCursor {
    pub entity_id: Option<String>,
    pub timestamp: i64,
    pub direction: FeedDirection,
}

impl FeedCursor {
    /// Continue after a row the store returned
    pub fn after(position: &IndexPosition, direction: FeedDirection) -> Self {
        Self {
            entity_id: Some(position.entity_id.clone()),
            timestamp: position.timestamp,
            direction,
        }
    }

    /// Start of a window at `timestamp`, not tied to any entity
    pub fn boundary(timestamp: i64, direction: FeedDirection) -> Self {
        Self {
            entity_id: None,
            timestamp,
            direction,
        }
    }

    pub fn is_boundary(&self) -> bool {
        self.entity_id.is_none()
    }

    /// Store continuation position, if this token continues after an entity
    pub fn to_continuation(&self) -> Option<IndexPosition> {
        self.entity_id
            .as_ref()
            .map(|id| IndexPosition::new(self.timestamp, id.clone()))
    }

    pub fn encode(&self) -> Result<String> {
        Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(self)?))
    }

    pub fn decode(token: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|e| ProjectionError::InvalidCursor(format!("not base64: {}", e)))?;
        let cursor: FeedCursor = serde_json::from_slice(&bytes)
            .map_err(|e| ProjectionError::InvalidCursor(format!("bad payload: {}", e)))?;
        if matches!(cursor.entity_id.as_deref(), Some("")) {
            return Err(ProjectionError::InvalidCursor("empty entity id".into()));
        }
        Ok(cursor)
    }
}
