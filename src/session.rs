use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::clock::Clock;
use crate::db::Database;
use crate::error::{Result, TrackerError};
use crate::models::*;

const EVENT_CAPACITY: usize = 64;

/// Owns the running-timer state machine.
///
/// Every transition holds the state lock across the store write and the
/// event broadcast, so transitions are serialized and subscribers only hear
/// about state that is already durable.
pub struct SessionManager {
    db: Database,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
    events: broadcast::Sender<SessionEvent>,
}

struct Inner {
    state: SessionState,
    /// Monotonic reading taken when this process started the timer. Absent
    /// for restored or edited sessions.
    started_mono: Option<StdDuration>,
}

impl SessionManager {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            db,
            clock,
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                started_mono: None,
            }),
            events,
        }
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Task remembered by the last `pause`, if no timer has started since.
    /// Kept in the store, so it outlives the process that paused.
    pub fn paused_task(&self) -> Result<Option<Uuid>> {
        self.db.paused_task()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Adopt an entry left open by a previous process.
    pub fn restore(&self, entry: &TimeEntry) -> Result<()> {
        let mut inner = self.lock();
        if inner.state.is_running() {
            return Err(TrackerError::InvalidState(
                "A timer is already running".to_string(),
            ));
        }
        if !entry.is_open() {
            return Err(TrackerError::InvalidState(format!(
                "Entry {} is closed and cannot be resumed",
                entry.id
            )));
        }

        inner.state = SessionState::Running {
            entry_id: entry.id,
            task_id: entry.task_id,
            started_at: entry.start,
        };
        inner.started_mono = None;
        tracing::info!(entry_id = %entry.id, task_id = %entry.task_id, "Restored running timer");
        self.publish(SessionEvent::Restored {
            entry_id: entry.id,
            task_id: entry.task_id,
            started_at: entry.start,
        });
        Ok(())
    }

    pub fn start(&self, task_id: Uuid) -> Result<TimeEntry> {
        self.start_with_note(task_id, None)
    }

    pub fn start_with_note(&self, task_id: Uuid, note: Option<String>) -> Result<TimeEntry> {
        let mut inner = self.lock();
        self.start_locked(&mut inner, task_id, note)
    }

    pub fn stop(&self) -> Result<TimeEntry> {
        let mut inner = self.lock();
        self.stop_locked(&mut inner, false)
    }

    /// Stop the timer and remember its task for `resume`. The entry close and
    /// the remembered task are written together.
    pub fn pause(&self) -> Result<TimeEntry> {
        let mut inner = self.lock();
        self.stop_locked(&mut inner, true)
    }

    /// Start a new entry on the task that was paused.
    pub fn resume(&self) -> Result<TimeEntry> {
        let mut inner = self.lock();
        let Some(task_id) = self.db.paused_task()? else {
            return Err(TrackerError::InvalidState(
                "Nothing is paused".to_string(),
            ));
        };
        self.start_locked(&mut inner, task_id, None)
    }

    /// Stop the current timer (if any) and start one on `task_id`.
    ///
    /// The stop is committed on its own: if the new task is rejected the
    /// session ends up Idle rather than rolled back, and there is never more
    /// than one open entry.
    pub fn switch_task(&self, task_id: Uuid) -> Result<TimeEntry> {
        let mut inner = self.lock();
        if inner.state.is_running() {
            self.stop_locked(&mut inner, false)?;
        }
        self.start_locked(&mut inner, task_id, None)
    }

    /// Edit an entry through the store, keeping the session in step when the
    /// running entry is the one being edited.
    pub fn edit_entry(&self, id: Uuid, input: EditEntryInput) -> Result<TimeEntry> {
        let mut inner = self.lock();
        let is_running = inner.state.entry_id() == Some(id);
        if is_running && input.end.is_some() {
            return Err(TrackerError::InvalidState(format!(
                "Entry {id} is the running timer; stop it instead of setting an end"
            )));
        }

        let entry = self.db.edit_entry(id, input)?;
        if is_running {
            inner.state = SessionState::Running {
                entry_id: entry.id,
                task_id: entry.task_id,
                started_at: entry.start,
            };
            inner.started_mono = None;
            self.publish(SessionEvent::Adjusted {
                entry_id: entry.id,
                started_at: entry.start,
            });
        }
        Ok(entry)
    }

    fn start_locked(&self, inner: &mut Inner, task_id: Uuid, note: Option<String>) -> Result<TimeEntry> {
        if let SessionState::Running { task_id: current, .. } = inner.state {
            return Err(TrackerError::Conflict(format!(
                "A timer is already running on task {current}; stop it first"
            )));
        }

        let entry = self.db.insert_entry(CreateEntryInput {
            task_id,
            start: self.clock.now(),
            end: None,
            note,
            override_overlap: false,
        })?;

        inner.state = SessionState::Running {
            entry_id: entry.id,
            task_id,
            started_at: entry.start,
        };
        inner.started_mono = Some(self.clock.monotonic());

        tracing::info!(entry_id = %entry.id, task_id = %task_id, "Timer started");
        self.publish(SessionEvent::Started {
            entry_id: entry.id,
            task_id,
            at: entry.start,
        });
        Ok(entry)
    }

    fn stop_locked(&self, inner: &mut Inner, pause: bool) -> Result<TimeEntry> {
        let SessionState::Running {
            entry_id,
            task_id,
            started_at,
        } = inner.state
        else {
            return Err(TrackerError::InvalidState(
                "No timer is running".to_string(),
            ));
        };

        let end = self.end_time(started_at, inner.started_mono);
        let entry = if pause {
            self.db.pause_entry(entry_id, end)?
        } else {
            self.db.close_entry(entry_id, end)?
        };

        inner.state = SessionState::Idle;
        inner.started_mono = None;

        tracing::info!(
            entry_id = %entry_id,
            seconds = entry.duration(None).num_seconds(),
            paused = pause,
            "Timer stopped"
        );
        self.publish(SessionEvent::Stopped {
            entry_id,
            task_id,
            started_at,
            at: entry.end.unwrap_or(end),
        });
        Ok(entry)
    }

    /// Wall-clock end for a timer, falling back to the monotonic clock when
    /// the wall clock has stepped back past the start.
    fn end_time(&self, started_at: DateTime<Utc>, started_mono: Option<StdDuration>) -> DateTime<Utc> {
        let now = self.clock.now();
        if now > started_at {
            return now;
        }
        let Some(mono_start) = started_mono else {
            return now;
        };

        let elapsed = self
            .clock
            .monotonic()
            .checked_sub(mono_start)
            .and_then(|d| Duration::from_std(d).ok())
            .unwrap_or_else(Duration::zero);
        tracing::warn!(
            wall = %now,
            started_at = %started_at,
            elapsed_secs = elapsed.num_seconds(),
            "Wall clock is behind the timer start; using monotonic elapsed time"
        );
        started_at + elapsed
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
