//! Pointer (projection) records
//!
//! A pointer is a per-group, read-optimized copy of a canonical record. It
//! carries display fields plus group-local aggregates. Pointers are caches:
//! everything here can be rebuilt from canonical rows (see `sync::resync`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::canonical::{
    EventSeries, Hangout, HangoutAttribute, InterestLevel, Location, Poll, Vote,
};

// ============================================================================
// Hangout pointer
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollOptionSummary {
    pub option_id: String,
    pub text: String,
    pub vote_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollSummary {
    pub poll_id: String,
    pub title: String,
    pub active: bool,
    #[serde(default)]
    pub options: Vec<PollOptionSummary>,
    pub total_votes: i64,
}

impl PollSummary {
    /// Tally `votes` against the options of `poll`. Votes naming an unknown
    /// option are ignored.
    pub fn tally(poll: &Poll, votes: &[Vote]) -> Self {
        let options: Vec<PollOptionSummary> = poll
            .options
            .iter()
            .map(|opt| PollOptionSummary {
                option_id: opt.option_id.clone(),
                text: opt.text.clone(),
                vote_count: votes
                    .iter()
                    .filter(|v| v.poll_id == poll.poll_id && v.option_id == opt.option_id)
                    .count() as i64,
            })
            .collect();
        let total_votes = options.iter().map(|o| o.vote_count).sum();

        Self {
            poll_id: poll.poll_id.clone(),
            title: poll.title.clone(),
            active: poll.active,
            options,
            total_votes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HangoutPointer {
    pub group_id: String,
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
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series_id: Option<String>,
    #[serde(default)]
    pub carpool_enabled: bool,
    #[serde(default)]
    pub participant_count: i64,
    #[serde(default)]
    pub polls: Vec<PollSummary>,
    #[serde(default)]
    pub interest_levels: Vec<InterestLevel>,
    #[serde(default)]
    pub attributes: Vec<HangoutAttribute>,
}

impl HangoutPointer {
    /// New pointer for `hangout` in `group_id` with empty aggregates
    pub fn from_hangout(group_id: &str, hangout: &Hangout) -> Self {
        let mut pointer = Self {
            group_id: group_id.to_string(),
            hangout_id: hangout.hangout_id.clone(),
            title: String::new(),
            description: None,
            start_timestamp: None,
            end_timestamp: None,
            location: None,
            series_id: None,
            carpool_enabled: false,
            participant_count: 0,
            polls: Vec::new(),
            interest_levels: Vec::new(),
            attributes: Vec::new(),
        };
        pointer.apply_canonical(hangout);
        pointer
    }

    /// Copy display fields from the canonical hangout. Aggregates are untouched.
    pub fn apply_canonical(&mut self, hangout: &Hangout) {
        self.title = hangout.title.clone();
        self.description = hangout.description.clone();
        self.start_timestamp = hangout.start_timestamp;
        self.end_timestamp = hangout.end_timestamp;
        self.location = hangout.location.clone();
        self.series_id = hangout.series_id.clone();
        self.carpool_enabled = hangout.carpool_enabled;
    }

    /// End used for the past-window index; falls back to the start
    pub fn effective_end(&self) -> Option<i64> {
        self.end_timestamp.or(self.start_timestamp)
    }

    pub fn is_scheduled(&self) -> bool {
        self.start_timestamp.is_some()
    }
}

// ============================================================================
// Series pointer
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesPointer {
    pub group_id: String,
    pub series_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<i64>,
    #[serde(default)]
    pub hangout_ids: Vec<String>,
    /// Full copy of every member hangout's pointer in this group
    #[serde(default)]
    pub parts: Vec<HangoutPointer>,
    /// Version of the member pointer each part was copied from
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub part_versions: BTreeMap<String, u64>,
}

impl SeriesPointer {
    pub fn from_series(group_id: &str, series: &EventSeries, parts: Vec<HangoutPointer>) -> Self {
        let mut pointer = Self {
            group_id: group_id.to_string(),
            series_id: series.series_id.clone(),
            title: series.series_title.clone(),
            description: series.series_description.clone(),
            start_timestamp: None,
            end_timestamp: None,
            hangout_ids: series.hangout_ids.clone(),
            parts: Vec::new(),
            part_versions: BTreeMap::new(),
        };
        for part in parts {
            pointer.upsert_part(part);
        }
        pointer
    }

    /// Like `from_series`, recording the version each part was read at
    pub fn from_versioned_parts(
        group_id: &str,
        series: &EventSeries,
        parts: impl IntoIterator<Item = (HangoutPointer, u64)>,
    ) -> Self {
        let mut pointer = Self::from_series(group_id, series, Vec::new());
        for (part, version) in parts {
            pointer.upsert_versioned_part(part, version);
        }
        pointer
    }

    pub fn contains_part(&self, hangout_id: &str) -> bool {
        self.parts.iter().any(|p| p.hangout_id == hangout_id)
    }

    /// Replace the part with the same hangout id, or insert it. Parts stay in
    /// chronological order and the aggregate bounds are recalculated.
    pub fn upsert_part(&mut self, part: HangoutPointer) {
        match self.parts.iter_mut().find(|p| p.hangout_id == part.hangout_id) {
            Some(existing) => *existing = part,
            None => self.parts.push(part),
        }
        sort_chronologically(&mut self.parts);
        self.recalculate_bounds();
    }

    /// Upsert a part copied from the member pointer at `version`. A copy
    /// older than the one already held is dropped. Returns whether the part
    /// was written.
    pub fn upsert_versioned_part(&mut self, part: HangoutPointer, version: u64) -> bool {
        if self.part_version(&part.hangout_id).map_or(false, |held| held >= version) {
            return false;
        }
        self.part_versions.insert(part.hangout_id.clone(), version);
        self.upsert_part(part);
        true
    }

    pub fn part_version(&self, hangout_id: &str) -> Option<u64> {
        self.part_versions.get(hangout_id).copied()
    }

    /// Remove the part for `hangout_id`. Returns whether a part was removed.
    pub fn remove_part(&mut self, hangout_id: &str) -> bool {
        let before = self.parts.len();
        self.parts.retain(|p| p.hangout_id != hangout_id);
        self.hangout_ids.retain(|id| id != hangout_id);
        self.part_versions.remove(hangout_id);
        let removed = self.parts.len() != before;
        if removed {
            self.recalculate_bounds();
        }
        removed
    }

    /// Earliest start / latest end across the current parts
    pub fn recalculate_bounds(&mut self) {
        let (start, end) = time_bounds(self.parts.iter().map(|p| (p.start_timestamp, p.end_timestamp)));
        self.start_timestamp = start;
        self.end_timestamp = end;
    }

    pub fn effective_end(&self) -> Option<i64> {
        self.end_timestamp.or(self.start_timestamp)
    }
}

/// Earliest start and latest end across `(start, end)` pairs. A member
/// without an end contributes its start to the latest end.
pub fn time_bounds(times: impl Iterator<Item = (Option<i64>, Option<i64>)>) -> (Option<i64>, Option<i64>) {
    let mut earliest: Option<i64> = None;
    let mut latest: Option<i64> = None;
    for (start, end) in times {
        if let Some(s) = start {
            earliest = Some(earliest.map_or(s, |e| e.min(s)));
        }
        if let Some(e) = end.or(start) {
            latest = Some(latest.map_or(e, |l| l.max(e)));
        }
    }
    (earliest, latest)
}

/// Order by start, then id; unscheduled members go last
pub fn sort_chronologically(parts: &mut [HangoutPointer]) {
    parts.sort_by(|a, b| {
        let ka = (a.start_timestamp.is_none(), a.start_timestamp, &a.hangout_id);
        let kb = (b.start_timestamp.is_none(), b.start_timestamp, &b.hangout_id);
        ka.cmp(&kb)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::canonical::{PollOption, Visibility};

    fn hangout(id: &str, start: Option<i64>, end: Option<i64>) -> Hangout {
        Hangout {
            hangout_id: id.into(),
            title: format!("Hangout {}", id),
            description: None,
            start_timestamp: start,
            end_timestamp: end,
            location: None,
            visibility: Visibility::InviteOnly,
            associated_groups: vec!["g1".into()],
            series_id: Some("s1".into()),
            carpool_enabled: false,
            created_at: 0,
        }
    }

    #[test]
    fn test_poll_tally() {
        let poll = Poll {
            poll_id: "p1".into(),
            hangout_id: "h1".into(),
            title: "Pizza?".into(),
            options: vec![
                PollOption { option_id: "yes".into(), text: "Yes".into() },
                PollOption { option_id: "no".into(), text: "No".into() },
            ],
            active: true,
            created_at: 0,
        };
        let vote = |user: &str, option: &str| Vote {
            hangout_id: "h1".into(),
            poll_id: "p1".into(),
            option_id: option.into(),
            user_id: user.into(),
        };
        let summary = PollSummary::tally(&poll, &[vote("a", "yes"), vote("b", "yes"), vote("c", "no"), vote("d", "maybe")]);
        assert_eq!(summary.options[0].vote_count, 2);
        assert_eq!(summary.options[1].vote_count, 1);
        assert_eq!(summary.total_votes, 3);
    }

    #[test]
    fn test_series_parts_keep_order_and_bounds() {
        let series = EventSeries {
            series_id: "s1".into(),
            series_title: "Season 1".into(),
            series_description: None,
            hangout_ids: vec!["h1".into(), "h2".into()],
            group_ids: vec!["g1".into()],
            start_timestamp: None,
            end_timestamp: None,
            created_at: 0,
        };
        let h1 = HangoutPointer::from_hangout("g1", &hangout("h1", Some(300), Some(400)));
        let h2 = HangoutPointer::from_hangout("g1", &hangout("h2", Some(100), Some(200)));
        let mut pointer = SeriesPointer::from_series("g1", &series, vec![h1, h2]);

        assert_eq!(pointer.parts[0].hangout_id, "h2");
        assert_eq!(pointer.start_timestamp, Some(100));
        assert_eq!(pointer.end_timestamp, Some(400));

        assert!(pointer.remove_part("h1"));
        assert_eq!(pointer.end_timestamp, Some(200));
        assert_eq!(pointer.hangout_ids, vec!["h2".to_string()]);
        assert!(!pointer.remove_part("h1"));
    }

    #[test]
    fn test_upsert_replaces_existing_part() {
        let series = EventSeries {
            series_id: "s1".into(),
            series_title: "Season 1".into(),
            series_description: None,
            hangout_ids: vec!["h1".into()],
            group_ids: vec!["g1".into()],
            start_timestamp: None,
            end_timestamp: None,
            created_at: 0,
        };
        let mut part = HangoutPointer::from_hangout("g1", &hangout("h1", Some(100), None));
        let mut pointer = SeriesPointer::from_series("g1", &series, vec![part.clone()]);
        part.title = "Renamed".into();
        pointer.upsert_part(part);
        assert_eq!(pointer.parts.len(), 1);
        assert_eq!(pointer.parts[0].title, "Renamed");
        assert_eq!(pointer.end_timestamp, Some(100));
    }

    #[test]
    fn test_older_part_copy_is_dropped() {
        let series = EventSeries {
            series_id: "s1".into(),
            series_title: "Season 1".into(),
            series_description: None,
            hangout_ids: vec!["h1".into()],
            group_ids: vec!["g1".into()],
            start_timestamp: None,
            end_timestamp: None,
            created_at: 0,
        };
        let mut older = HangoutPointer::from_hangout("g1", &hangout("h1", Some(100), None));
        older.participant_count = 1;
        let mut newer = older.clone();
        newer.participant_count = 2;

        let mut pointer = SeriesPointer::from_versioned_parts("g1", &series, vec![(older.clone(), 2)]);
        assert!(pointer.upsert_versioned_part(newer, 3));
        assert!(!pointer.upsert_versioned_part(older, 2));
        assert_eq!(pointer.parts[0].participant_count, 2);
        assert_eq!(pointer.part_version("h1"), Some(3));

        assert!(pointer.remove_part("h1"));
        assert_eq!(pointer.part_version("h1"), None);
    }

    #[test]
    fn test_time_bounds_skip_unscheduled() {
        let bounds = time_bounds(vec![(None, None), (Some(5), None), (Some(2), Some(3))].into_iter());
        assert_eq!(bounds, (Some(2), Some(5)));
        assert_eq!(time_bounds(std::iter::empty()), (None, None));
    }
}
