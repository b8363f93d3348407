use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A recorded or in-progress span of worked time.
///
/// `end == None` means the timer is still running. Intervals are half-open,
/// `[start, end)`, so an entry ending at 10:00 does not overlap one starting
/// at 10:00.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeEntry {
    pub id: Uuid,
    pub task_id: Uuid,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub note: Option<String>,
    /// Set when the user explicitly accepted an overlap with another entry.
    pub override_overlap: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TimeEntry {
    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }

    /// Length of the entry. A running entry is measured up to `as_of`, or
    /// counts as zero when no reference time is given.
    pub fn duration(&self, as_of: Option<DateTime<Utc>>) -> Duration {
        match (self.end, as_of) {
            (Some(end), _) => end - self.start,
            (None, Some(now)) if now > self.start => now - self.start,
            (None, _) => Duration::zero(),
        }
    }

    /// Whether the two intervals share any instant. Running entries extend
    /// indefinitely.
    pub fn overlaps(&self, other: &TimeEntry) -> bool {
        let self_ends_after = other.end.map_or(true, |end| end > self.start);
        let other_ends_after = self.end.map_or(true, |end| end > other.start);
        self_ends_after && other_ends_after
    }
}

/// Input for recording a new entry. `end: None` starts a running timer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEntryInput {
    pub task_id: Uuid,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub note: Option<String>,
    #[serde(default)]
    pub override_overlap: bool,
}

/// Input for editing an entry's interval.
///
/// `end: None` is only valid for the running entry; a closed entry can never
/// be reopened. `note: None` keeps the current note.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditEntryInput {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub note: Option<String>,
    #[serde(default)]
    pub override_overlap: bool,
}

/// Selection criteria for [`crate::db::Database::query_entries`].
///
/// The date range is half-open, `[from, to)`, and matches every entry whose
/// interval intersects it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryFilter {
    pub task_id: Option<Uuid>,
    pub project_id: Option<Uuid>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl EntryFilter {
    pub fn task(task_id: Uuid) -> Self {
        Self {
            task_id: Some(task_id),
            ..Self::default()
        }
    }

    pub fn project(project_id: Uuid) -> Self {
        Self {
            project_id: Some(project_id),
            ..Self::default()
        }
    }

    pub fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }
}
