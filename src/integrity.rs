//! Startup consistency checks.
//!
//! The checker runs before the session manager accepts commands. It rebuilds
//! the running session from storage (the process may have been killed while a
//! timer was running) and reports anything that breaks the store invariants.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::db::{retry_stale, Database};
use crate::error::{Result, TrackerError};
use crate::models::{EntryFilter, TimeEntry};

/// Two entries that share time without either carrying the override flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Overlap {
    pub first: Uuid,
    pub second: Uuid,
    pub from: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

impl Overlap {
    pub fn to_error(&self) -> TrackerError {
        TrackerError::Conflict(format!(
            "Entries {} and {} overlap from {} until {}",
            self.first, self.second, self.from, self.until
        ))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    /// The single open entry, left running by the last process.
    pub resumed: Option<TimeEntry>,
    pub overlaps: Vec<Overlap>,
    /// Entries starting after the current clock reading.
    pub future_entries: Vec<Uuid>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.overlaps.is_empty() && self.future_entries.is_empty()
    }

    /// Overlaps as the errors a caller would have seen when writing them.
    pub fn diagnostics(&self) -> Vec<TrackerError> {
        self.overlaps.iter().map(Overlap::to_error).collect()
    }
}

pub struct IntegrityChecker<'a> {
    db: &'a Database,
}

impl<'a> IntegrityChecker<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Scan the store. Fails only with `Corruption` (or a storage error);
    /// overlaps and skew are reported, not fatal.
    pub fn run(&self, now: DateTime<Utc>) -> Result<IntegrityReport> {
        let mut open = self.db.open_entries()?;
        if open.len() > 1 {
            let open_entries: Vec<Uuid> = open.iter().map(|e| e.id).collect();
            tracing::error!(
                count = open_entries.len(),
                "Multiple running entries found; manual repair required"
            );
            return Err(TrackerError::Corruption { open_entries });
        }
        let resumed = open.pop();
        if let Some(entry) = &resumed {
            tracing::info!(entry_id = %entry.id, started_at = %entry.start, "Found running entry from previous session");
        }

        let mut report = IntegrityReport {
            resumed,
            ..IntegrityReport::default()
        };
        self.sweep(now, &mut report)?;

        for overlap in &report.overlaps {
            tracing::warn!(first = %overlap.first, second = %overlap.second, "Overlapping entries");
        }
        for id in &report.future_entries {
            tracing::warn!(entry_id = %id, "Entry starts in the future; clock may be skewed");
        }
        Ok(report)
    }

    /// One pass in start order, keeping the entries that are still "active"
    /// at the current start. A pass cut short by a concurrent write is run
    /// again from scratch.
    fn sweep(&self, now: DateTime<Utc>, report: &mut IntegrityReport) -> Result<()> {
        let query = self.db.query_entries(EntryFilter::default());
        let (overlaps, future_entries) = retry_stale(|| {
            let mut overlaps = Vec::new();
            let mut future_entries = Vec::new();
            let mut active: Vec<TimeEntry> = Vec::new();

            for entry in &query {
                let entry = entry?;
                if entry.start > now {
                    future_entries.push(entry.id);
                }
                if entry.override_overlap {
                    continue;
                }

                active.retain(|earlier| earlier.end.map_or(true, |end| end > entry.start));
                for earlier in &active {
                    overlaps.push(Overlap {
                        first: earlier.id,
                        second: entry.id,
                        from: entry.start,
                        until: min_end(earlier, &entry),
                    });
                }
                active.push(entry);
            }
            Ok((overlaps, future_entries))
        })?;

        report.overlaps = overlaps;
        report.future_entries = future_entries;
        Ok(())
    }
}

fn min_end(a: &TimeEntry, b: &TimeEntry) -> DateTime<Utc> {
    match (a.end, b.end) {
        (Some(x), Some(y)) => x.min(y),
        (Some(x), None) | (None, Some(x)) => x,
        // Two open entries never get this far.
        (None, None) => a.start.max(b.start),
    }
}
