use std::collections::VecDeque;

use super::Database;
use crate::error::{Result, TrackerError};
use crate::models::{EntryFilter, TimeEntry};

const DEFAULT_PAGE_SIZE: usize = 256;
const MAX_READ_ATTEMPTS: usize = 3;

/// A lazy, restartable query over time entries.
///
/// Entries come back ordered by start, then id. Pages are fetched on demand
/// with keyset pagination and the store lock is never held between pages.
/// Every page carries the store revision it was read at; a pass whose pages
/// disagree ends with [`TrackerError::StaleRead`], so a completed pass always
/// reflects a single store state.
#[derive(Clone)]
pub struct EntryQuery {
    db: Database,
    filter: EntryFilter,
    page_size: usize,
}

impl EntryQuery {
    pub(super) fn new(db: Database, filter: EntryFilter) -> Self {
        Self {
            db,
            filter,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn filter(&self) -> &EntryFilter {
        &self.filter
    }

    /// Start a fresh pass over the matching entries.
    pub fn iter(&self) -> EntryIter {
        EntryIter {
            db: self.db.clone(),
            filter: self.filter.clone(),
            page_size: self.page_size,
            revision: None,
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Drain the query, starting over if a write lands between pages.
    pub fn collect_entries(&self) -> Result<Vec<TimeEntry>> {
        retry_stale(|| self.iter().collect())
    }
}

/// Run a full read pass, repeating it while it is cut short by
/// [`TrackerError::StaleRead`].
pub(crate) fn retry_stale<T>(mut pass: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 1;
    loop {
        match pass() {
            Err(TrackerError::StaleRead { started, current }) if attempt < MAX_READ_ATTEMPTS => {
                tracing::debug!(attempt, started, current, "Store changed mid-read; starting over");
                attempt += 1;
            }
            result => return result,
        }
    }
}

impl<'a> IntoIterator for &'a EntryQuery {
    type Item = Result<TimeEntry>;
    type IntoIter = EntryIter;

    fn into_iter(self) -> EntryIter {
        self.iter()
    }
}

pub struct EntryIter {
    db: Database,
    filter: EntryFilter,
    page_size: usize,
    revision: Option<u64>,
    cursor: Option<(i64, String)>,
    buffer: VecDeque<TimeEntry>,
    exhausted: bool,
}

impl EntryIter {
    /// Store revision this pass is reading, once the first page is in.
    pub fn revision(&self) -> Option<u64> {
        self.revision
    }

    fn fill(&mut self) -> Result<()> {
        let (revision, page) = self
            .db
            .entry_page(&self.filter, self.cursor.as_ref(), self.page_size)?;
        match self.revision {
            Some(started) if started != revision => {
                self.buffer.clear();
                return Err(TrackerError::StaleRead {
                    started,
                    current: revision,
                });
            }
            _ => self.revision = Some(revision),
        }
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.cursor = Some((last.start.timestamp_millis(), last.id.to_string()));
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for EntryIter {
    type Item = Result<TimeEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
