use std::sync::Arc;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{Result, TrackerError};
use crate::models::*;
use crate::report::{Report, ReportQuery};
use crate::tracker::Tracker;

/// Async front for a [`Tracker`].
///
/// Store calls block on SQLite file I/O, so each one runs on tokio's blocking
/// pool and never on the caller's (UI or event loop) thread. Session changes
/// come back through [`TrackerHandle::subscribe`].
#[derive(Clone)]
pub struct TrackerHandle {
    inner: Arc<Tracker>,
}

impl TrackerHandle {
    pub fn new(tracker: Tracker) -> Self {
        Self {
            inner: Arc::new(tracker),
        }
    }

    pub fn tracker(&self) -> &Tracker {
        &self.inner
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Tracker) -> Result<T> + Send + 'static,
    {
        let tracker = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&tracker))
            .await
            .map_err(|e| TrackerError::Background(e.to_string()))?
    }

    pub fn status(&self) -> SessionState {
        self.inner.status()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.subscribe()
    }

    pub async fn start_timer(&self, task_id: Uuid, note: Option<String>) -> Result<TimeEntry> {
        self.run(move |t| t.start_timer_with_note(task_id, note)).await
    }

    pub async fn start_default(&self) -> Result<TimeEntry> {
        self.run(|t| t.start_default()).await
    }

    pub async fn stop_timer(&self) -> Result<TimeEntry> {
        self.run(|t| t.stop_timer()).await
    }

    pub async fn pause_timer(&self) -> Result<TimeEntry> {
        self.run(|t| t.pause_timer()).await
    }

    pub async fn resume_timer(&self) -> Result<TimeEntry> {
        self.run(|t| t.resume_timer()).await
    }

    pub async fn switch_task(&self, task_id: Uuid) -> Result<TimeEntry> {
        self.run(move |t| t.switch_task(task_id)).await
    }

    pub async fn add_entry(&self, input: CreateEntryInput) -> Result<TimeEntry> {
        self.run(move |t| t.add_entry(input)).await
    }

    pub async fn edit_entry(&self, id: Uuid, input: EditEntryInput) -> Result<TimeEntry> {
        self.run(move |t| t.edit_entry(id, input)).await
    }

    pub async fn delete_entry(&self, id: Uuid) -> Result<()> {
        self.run(move |t| t.delete_entry(id)).await
    }

    pub async fn report(&self, query: ReportQuery) -> Result<Report> {
        self.run(move |t| t.report(&query)).await
    }

    pub async fn query_entries(&self, filter: EntryFilter) -> Result<Vec<TimeEntry>> {
        self.run(move |t| t.store().query_entries(filter).collect_entries())
            .await
    }
}
