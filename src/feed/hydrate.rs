//! Two-pass hydration of raw projection rows into feed entries
//!
//! Pass one collects the ids of every hangout embedded in a series
//! pointer's `parts`. Pass two emits one entry per series pointer and one
//! per hangout pointer that is neither collected nor linked to a series, in
//! input order. A member pointer always has a series pointer in the same
//! group, so members are shown only through their series, whichever page or
//! window that series row falls on. The result depends only on the input
//! rows.

use std::collections::HashSet;

use serde::Serialize;

use crate::model::{HangoutPointer, Location, PollSummary, Record, SeriesPointer, StoreItem};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HangoutSummary {
    pub hangout_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub series_id: Option<String>,
    pub participant_count: i64,
    pub carpool_enabled: bool,
    pub polls: Vec<PollSummary>,
}

impl From<&HangoutPointer> for HangoutSummary {
    fn from(p: &HangoutPointer) -> Self {
        Self {
            hangout_id: p.hangout_id.clone(),
            title: p.title.clone(),
            description: p.description.clone(),
            start_timestamp: p.start_timestamp,
            end_timestamp: p.end_timestamp,
            location: p.location.clone(),
            series_id: p.series_id.clone(),
            participant_count: p.participant_count,
            carpool_enabled: p.carpool_enabled,
            polls: p.polls.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesSummary {
    pub series_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<i64>,
    pub parts: Vec<HangoutSummary>,
}

impl From<&SeriesPointer> for SeriesSummary {
    fn from(p: &SeriesPointer) -> Self {
        Self {
            series_id: p.series_id.clone(),
            title: p.title.clone(),
            description: p.description.clone(),
            start_timestamp: p.start_timestamp,
            end_timestamp: p.end_timestamp,
            parts: p.parts.iter().map(HangoutSummary::from).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FeedEntry {
    Hangout(HangoutSummary),
    Series(SeriesSummary),
}

impl FeedEntry {
    pub fn entity_id(&self) -> &str {
        match self {
            FeedEntry::Hangout(h) => &h.hangout_id,
            FeedEntry::Series(s) => &s.series_id,
        }
    }

    pub fn start_timestamp(&self) -> Option<i64> {
        match self {
            FeedEntry::Hangout(h) => h.start_timestamp,
            FeedEntry::Series(s) => s.start_timestamp,
        }
    }
}

/// Ids of hangouts embedded in any series pointer among `rows`
pub fn collect_series_members<'a>(rows: impl IntoIterator<Item = &'a Record>) -> HashSet<String> {
    let mut members = HashSet::new();
    for record in rows {
        if let StoreItem::SeriesPointer(series) = &record.item {
            members.extend(series.parts.iter().map(|p| p.hangout_id.clone()));
        }
    }
    members
}

/// Emit feed entries for `rows`, suppressing hangouts in `members` and
/// hangouts that belong to a series. Rows that are not projections are
/// ignored.
pub fn emit_entries(rows: &[Record], members: &HashSet<String>) -> Vec<FeedEntry> {
    rows.iter()
        .filter_map(|record| match &record.item {
            StoreItem::SeriesPointer(series) => Some(FeedEntry::Series(SeriesSummary::from(series))),
            StoreItem::HangoutPointer(hangout) if is_standalone(hangout, members) => {
                Some(FeedEntry::Hangout(HangoutSummary::from(hangout)))
            }
            _ => None,
        })
        .collect()
}

fn is_standalone(hangout: &HangoutPointer, members: &HashSet<String>) -> bool {
    hangout.series_id.is_none() && !members.contains(&hangout.hangout_id)
}

/// Both passes over one page
pub fn hydrate(rows: &[Record]) -> Vec<FeedEntry> {
    let members = collect_series_members(rows);
    emit_entries(rows, &members)
}
