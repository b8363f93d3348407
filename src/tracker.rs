use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::TrackerConfig;
use crate::db::Database;
use crate::error::{Result, TrackerError};
use crate::integrity::{IntegrityChecker, IntegrityReport};
use crate::models::*;
use crate::report::{Aggregator, Report, ReportCache, ReportQuery};
use crate::session::SessionManager;

enum Startup {
    Ready(IntegrityReport),
    /// Several open entries were found; every session command is refused
    /// until an operator closes all but one and calls `recheck`.
    Blocked(Vec<Uuid>),
}

/// The API front ends talk to.
///
/// Opening a tracker runs the integrity check before any session command is
/// accepted. A corrupt store does not make `open` fail: the tracker comes up
/// blocked so the operator can inspect and repair it.
pub struct Tracker {
    db: Database,
    clock: Arc<dyn Clock>,
    config: TrackerConfig,
    sessions: SessionManager,
    startup: Mutex<Startup>,
    cache: ReportCache,
}

impl Tracker {
    pub fn open(db: Database, clock: Arc<dyn Clock>, config: TrackerConfig) -> Result<Self> {
        db.migrate()?;
        let tracker = Self {
            sessions: SessionManager::new(db.clone(), clock.clone()),
            db,
            clock,
            config,
            startup: Mutex::new(Startup::Blocked(Vec::new())),
            cache: ReportCache::default(),
        };
        tracker.check()?;
        Ok(tracker)
    }

    /// Run the integrity check again, typically after a manual repair.
    pub fn recheck(&self) -> Result<IntegrityReport> {
        self.check()?;
        match &*self.startup() {
            Startup::Ready(report) => Ok(report.clone()),
            Startup::Blocked(ids) => Err(TrackerError::Corruption {
                open_entries: ids.clone(),
            }),
        }
    }

    fn check(&self) -> Result<()> {
        let outcome = IntegrityChecker::new(&self.db).run(self.clock.now());
        let mut startup = self.startup();
        match outcome {
            Ok(report) => {
                if let Some(entry) = &report.resumed {
                    if self.sessions.state().entry_id() != Some(entry.id) {
                        self.sessions.restore(entry)?;
                    }
                }
                *startup = Startup::Ready(report);
                Ok(())
            }
            Err(TrackerError::Corruption { open_entries }) => {
                *startup = Startup::Blocked(open_entries);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// The last integrity report, or `None` while the tracker is blocked.
    pub fn integrity_report(&self) -> Option<IntegrityReport> {
        match &*self.startup() {
            Startup::Ready(report) => Some(report.clone()),
            Startup::Blocked(_) => None,
        }
    }

    /// Open entries that block the tracker, if any.
    pub fn blocked_by(&self) -> Option<Vec<Uuid>> {
        match &*self.startup() {
            Startup::Blocked(ids) => Some(ids.clone()),
            Startup::Ready(_) => None,
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        match &*self.startup() {
            Startup::Ready(_) => Ok(()),
            Startup::Blocked(ids) => Err(TrackerError::Corruption {
                open_entries: ids.clone(),
            }),
        }
    }

    fn startup(&self) -> MutexGuard<'_, Startup> {
        self.startup.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn store(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ============================================================
    // Session commands
    // ============================================================

    pub fn status(&self) -> SessionState {
        self.sessions.state()
    }

    pub fn paused_task(&self) -> Result<Option<Uuid>> {
        self.sessions.paused_task()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sessions.subscribe()
    }

    pub fn start_timer(&self, task_id: Uuid) -> Result<TimeEntry> {
        self.ensure_ready()?;
        self.sessions.start(task_id)
    }

    pub fn start_timer_with_note(&self, task_id: Uuid, note: Option<String>) -> Result<TimeEntry> {
        self.ensure_ready()?;
        self.sessions.start_with_note(task_id, note)
    }

    /// Start the configured default task, creating it (and its project) on
    /// first use.
    pub fn start_default(&self) -> Result<TimeEntry> {
        self.ensure_ready()?;
        let task = self.default_task()?;
        self.sessions.start(task.id)
    }

    pub fn default_task(&self) -> Result<Task> {
        self.db
            .find_or_create_task(&self.config.default_project, &self.config.default_task)
    }

    pub fn stop_timer(&self) -> Result<TimeEntry> {
        self.ensure_ready()?;
        self.sessions.stop()
    }

    pub fn pause_timer(&self) -> Result<TimeEntry> {
        self.ensure_ready()?;
        self.sessions.pause()
    }

    pub fn resume_timer(&self) -> Result<TimeEntry> {
        self.ensure_ready()?;
        self.sessions.resume()
    }

    pub fn switch_task(&self, task_id: Uuid) -> Result<TimeEntry> {
        self.ensure_ready()?;
        self.sessions.switch_task(task_id)
    }

    // ============================================================
    // Entry maintenance
    // ============================================================

    /// Record a finished interval after the fact.
    pub fn add_entry(&self, input: CreateEntryInput) -> Result<TimeEntry> {
        self.ensure_ready()?;
        if input.end.is_none() {
            return Err(TrackerError::Validation(
                "Manual entries need an end; use start_timer to run a timer".to_string(),
            ));
        }
        self.db.insert_entry(input)
    }

    pub fn edit_entry(&self, id: Uuid, input: EditEntryInput) -> Result<TimeEntry> {
        self.ensure_ready()?;
        self.sessions.edit_entry(id, input)
    }

    pub fn delete_entry(&self, id: Uuid) -> Result<()> {
        self.ensure_ready()?;
        self.db.delete_entry(id)
    }

    /// Close one of the entries that block startup. Only allowed while
    /// blocked; a healthy tracker closes its timer with `stop_timer`.
    pub fn repair_close_entry(&self, id: Uuid, end: DateTime<Utc>) -> Result<TimeEntry> {
        if self.blocked_by().is_none() {
            return Err(TrackerError::InvalidState(
                "The store is healthy; stop the timer instead".to_string(),
            ));
        }
        let entry = self.db.close_entry(id, end)?;
        tracing::warn!(entry_id = %id, end = %end, "Closed open entry during repair");
        Ok(entry)
    }

    // ============================================================
    // Reporting
    // ============================================================

    pub fn aggregator(&self) -> Aggregator<'_> {
        Aggregator::new(&self.db, self.config.utc_offset())
            .with_attribution(self.config.day_attribution)
    }

    pub fn report(&self, query: &ReportQuery) -> Result<Report> {
        let revision = self.db.revision()?;
        self.cache.get_or_compute(revision, query, || {
            self.aggregator().report(query, self.clock.now())
        })
    }
}
