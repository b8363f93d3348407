mod query;
mod schema;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use uuid::Uuid;

use crate::error::{Result, TrackerError};
use crate::models::*;

pub use query::{EntryIter, EntryQuery};
pub(crate) use query::retry_stale;

const PROJECT_COLUMNS: &str = "id, name, archived, created_at, updated_at";
const TASK_COLUMNS: &str = "id, project_id, name, archived, created_at, updated_at";
const ENTRY_COLUMNS: &str =
    "e.id, e.task_id, e.start_ms, e.end_ms, e.note, e.override_overlap, e.created_at, e.updated_at";

/// Durable store for projects, tasks and time entries.
///
/// Cloning is cheap and every clone shares one connection. The connection
/// mutex is the single write lock: each mutation runs in one `IMMEDIATE`
/// transaction, so a reader sees either the state before a mutation or the
/// state after it, never a mix.
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        tracing::debug!(path = %path.display(), "Opened time store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create or upgrade the schema. Running it on an up-to-date store is a no-op.
    pub fn migrate(&self) -> Result<()> {
        let mut conn = self.lock();
        schema::run_migrations(&mut conn)
    }

    /// Sequence number bumped by every committed mutation.
    pub fn revision(&self) -> Result<u64> {
        let conn = self.lock();
        read_revision(&conn)
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<()> {
        self.lock().execute_batch(sql)?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-transaction drops the transaction, which rolls it back,
        // so the connection behind a poisoned lock is still consistent.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` in a write transaction and bump the revision with it.
    fn write<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.execute(
            "UPDATE store_meta SET value = value + 1 WHERE key = 'revision'",
            [],
        )?;
        tx.commit()?;
        Ok(value)
    }

    // ============================================================
    // Project operations
    // ============================================================

    pub fn get_all_projects(&self, include_archived: bool) -> Result<Vec<Project>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects
             WHERE archived = 0 OR ?1 ORDER BY name, created_at"
        ))?;
        let projects = stmt
            .query_map([include_archived], project_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(projects)
    }

    pub fn get_project(&self, id: Uuid) -> Result<Option<Project>> {
        let conn = self.lock();
        fetch_project(&conn, id)
    }

    /// Look up an active project by its exact (trimmed) name.
    pub fn find_project_by_name(&self, name: &str) -> Result<Option<Project>> {
        let conn = self.lock();
        active_project_named(&conn, name.trim())
    }

    pub fn create_project(&self, name: &str) -> Result<Project> {
        let name = validate_name("Project", name)?;
        self.write(|conn| {
            ensure_project_name_free(conn, &name, None)?;
            insert_project(conn, name)
        })
    }

    pub fn rename_project(&self, id: Uuid, name: &str) -> Result<Project> {
        let name = validate_name("Project", name)?;
        self.write(|conn| {
            let mut project = require_project(conn, id)?;
            if !project.archived {
                ensure_project_name_free(conn, &name, Some(id))?;
            }

            project.name = name;
            project.updated_at = now_ms();
            conn.execute(
                "UPDATE projects SET name = ?, updated_at = ? WHERE id = ?",
                (
                    &project.name,
                    project.updated_at.to_rfc3339(),
                    id.to_string(),
                ),
            )?;
            Ok(project)
        })
    }

    /// Soft-delete a project. Its tasks and entries stay queryable.
    pub fn archive_project(&self, id: Uuid) -> Result<Project> {
        self.set_project_archived(id, true)
    }

    /// Reactivate an archived project, provided its name is not taken.
    pub fn restore_project(&self, id: Uuid) -> Result<Project> {
        self.set_project_archived(id, false)
    }

    fn set_project_archived(&self, id: Uuid, archived: bool) -> Result<Project> {
        let project = self.write(|conn| {
            let mut project = require_project(conn, id)?;
            if project.archived == archived {
                return Ok(project);
            }
            if !archived {
                ensure_project_name_free(conn, &project.name, Some(id))?;
            }

            project.archived = archived;
            project.updated_at = now_ms();
            conn.execute(
                "UPDATE projects SET archived = ?, updated_at = ? WHERE id = ?",
                (archived, project.updated_at.to_rfc3339(), id.to_string()),
            )?;
            Ok(project)
        })?;

        tracing::debug!(project_id = %id, archived, "Updated project archive flag");
        Ok(project)
    }

    // ============================================================
    // Task operations
    // ============================================================

    pub fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        let conn = self.lock();
        fetch_task(&conn, id)
    }

    pub fn get_all_tasks(&self) -> Result<Vec<Task>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks ORDER BY name, created_at"
        ))?;
        let tasks = stmt
            .query_map([], task_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    pub fn get_tasks_by_project(&self, project_id: Uuid, include_archived: bool) -> Result<Vec<Task>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE project_id = ?1 AND (archived = 0 OR ?2) ORDER BY name, created_at"
        ))?;
        let tasks = stmt
            .query_map((project_id.to_string(), include_archived), task_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    /// Look up an active task in a project by its exact (trimmed) name.
    pub fn find_task_by_name(&self, project_id: Uuid, name: &str) -> Result<Option<Task>> {
        let conn = self.lock();
        active_task_named(&conn, project_id, name.trim())
    }

    pub fn create_task(&self, project_id: Uuid, name: &str) -> Result<Task> {
        let name = validate_name("Task", name)?;
        self.write(|conn| {
            let project = fetch_project(conn, project_id)?
                .filter(|p| !p.archived)
                .ok_or_else(|| TrackerError::not_found("Project", project_id))?;
            insert_task(conn, project.id, name)
        })
    }

    /// Return the active task `task_name` in the active project
    /// `project_name`, creating either or both. Lookup and creation share one
    /// write, so concurrent callers all get the same task.
    pub fn find_or_create_task(&self, project_name: &str, task_name: &str) -> Result<Task> {
        let project_name = validate_name("Project", project_name)?;
        let task_name = validate_name("Task", task_name)?;
        self.write(|conn| {
            let project = match active_project_named(conn, &project_name)? {
                Some(project) => project,
                None => insert_project(conn, project_name)?,
            };
            match active_task_named(conn, project.id, &task_name)? {
                Some(task) => Ok(task),
                None => insert_task(conn, project.id, task_name),
            }
        })
    }

    pub fn rename_task(&self, id: Uuid, name: &str) -> Result<Task> {
        let name = validate_name("Task", name)?;
        self.write(|conn| {
            let mut task = require_task(conn, id)?;
            task.name = name;
            task.updated_at = now_ms();
            conn.execute(
                "UPDATE tasks SET name = ?, updated_at = ? WHERE id = ?",
                (&task.name, task.updated_at.to_rfc3339(), id.to_string()),
            )?;
            Ok(task)
        })
    }

    pub fn archive_task(&self, id: Uuid) -> Result<Task> {
        self.set_task_archived(id, true)
    }

    /// Reactivate a task. Fails with `Conflict` while its project is archived.
    pub fn restore_task(&self, id: Uuid) -> Result<Task> {
        self.set_task_archived(id, false)
    }

    fn set_task_archived(&self, id: Uuid, archived: bool) -> Result<Task> {
        self.write(|conn| {
            let mut task = require_task(conn, id)?;
            if task.archived == archived {
                return Ok(task);
            }
            if !archived && require_project(conn, task.project_id)?.archived {
                return Err(TrackerError::Conflict(format!(
                    "Task '{}' belongs to an archived project",
                    task.name
                )));
            }

            task.archived = archived;
            task.updated_at = now_ms();
            conn.execute(
                "UPDATE tasks SET archived = ?, updated_at = ? WHERE id = ?",
                (archived, task.updated_at.to_rfc3339(), id.to_string()),
            )?;
            Ok(task)
        })
    }

    // ============================================================
    // Time entry operations
    // ============================================================

    pub fn get_entry(&self, id: Uuid) -> Result<Option<TimeEntry>> {
        let conn = self.lock();
        fetch_entry(&conn, id)
    }

    /// Every entry without an end, oldest first. More than one means the
    /// store is corrupt.
    pub fn open_entries(&self) -> Result<Vec<TimeEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM time_entries e
             WHERE e.end_ms IS NULL ORDER BY e.start_ms, e.id"
        ))?;
        let entries = stmt
            .query_map([], entry_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Record an entry. With `end: None` this starts the (single) running timer.
    pub fn insert_entry(&self, input: CreateEntryInput) -> Result<TimeEntry> {
        let start = truncate_ms(input.start);
        let end = input.end.map(truncate_ms);
        if let Some(end) = end {
            if end <= start {
                return Err(TrackerError::Validation(format!(
                    "Entry end {end} must be after its start {start}"
                )));
            }
        }

        let entry = self.write(|conn| {
            let task = require_task(conn, input.task_id)?;
            let project = require_project(conn, task.project_id)?;
            if !task.accepts_entries(&project) {
                return Err(TrackerError::Conflict(format!(
                    "Task '{}' or its project '{}' is archived",
                    task.name, project.name
                )));
            }

            if end.is_none() {
                if let Some(running) = first_open_entry(conn)? {
                    return Err(TrackerError::Conflict(format!(
                        "Entry {running} is already running"
                    )));
                }
                // Starting any timer consumes a pending pause.
                conn.execute("DELETE FROM paused_task", [])?;
            }
            if !input.override_overlap {
                ensure_no_overlap(conn, start, end, None)?;
            }

            let now = now_ms();
            let entry = TimeEntry {
                id: Uuid::new_v4(),
                task_id: task.id,
                start,
                end,
                note: input.note,
                override_overlap: input.override_overlap,
                created_at: now,
                updated_at: now,
            };
            conn.execute(
                "INSERT INTO time_entries
                    (id, task_id, start_ms, end_ms, note, override_overlap, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    entry.id.to_string(),
                    entry.task_id.to_string(),
                    entry.start.timestamp_millis(),
                    entry.end.map(|e| e.timestamp_millis()),
                    &entry.note,
                    entry.override_overlap,
                    now.to_rfc3339(),
                    now.to_rfc3339(),
                ),
            )?;
            Ok(entry)
        })?;

        tracing::debug!(
            entry_id = %entry.id,
            task_id = %entry.task_id,
            open = entry.is_open(),
            "Inserted time entry"
        );
        Ok(entry)
    }

    /// Set the end of a running entry.
    pub fn close_entry(&self, id: Uuid, end: DateTime<Utc>) -> Result<TimeEntry> {
        let entry = self.write(|conn| close_open_entry(conn, id, truncate_ms(end)))?;
        tracing::debug!(entry_id = %id, "Closed time entry");
        Ok(entry)
    }

    /// Close a running entry and remember its task for a later resume, which
    /// may come from another process.
    pub fn pause_entry(&self, id: Uuid, end: DateTime<Utc>) -> Result<TimeEntry> {
        let entry = self.write(|conn| {
            let entry = close_open_entry(conn, id, truncate_ms(end))?;
            conn.execute(
                "INSERT OR REPLACE INTO paused_task (slot, task_id, paused_at_ms)
                 VALUES (0, ?, ?)",
                (entry.task_id.to_string(), end.timestamp_millis()),
            )?;
            Ok(entry)
        })?;
        tracing::debug!(entry_id = %id, task_id = %entry.task_id, "Paused time entry");
        Ok(entry)
    }

    /// Task left by the last pause, until a timer is started again.
    pub fn paused_task(&self) -> Result<Option<Uuid>> {
        let conn = self.lock();
        let task_id = conn
            .query_row("SELECT task_id FROM paused_task WHERE slot = 0", [], |row| {
                uuid_at(row, 0)
            })
            .optional()?;
        Ok(task_id)
    }

    /// Change an entry's interval (and optionally its note), re-checking every
    /// invariant as if the entry were new.
    pub fn edit_entry(&self, id: Uuid, input: EditEntryInput) -> Result<TimeEntry> {
        let start = truncate_ms(input.start);
        let end = input.end.map(truncate_ms);
        if let Some(end) = end {
            if end <= start {
                return Err(TrackerError::Validation(format!(
                    "Entry end {end} must be after its start {start}"
                )));
            }
        }

        let entry = self.write(|conn| {
            let mut entry = require_entry(conn, id)?;
            if end.is_none() && !entry.is_open() {
                return Err(TrackerError::InvalidState(format!(
                    "Entry {id} is closed and cannot be reopened"
                )));
            }
            if !input.override_overlap {
                ensure_no_overlap(conn, start, end, Some(id))?;
            }

            entry.start = start;
            entry.end = end;
            if input.note.is_some() {
                entry.note = input.note;
            }
            entry.override_overlap = input.override_overlap;
            entry.updated_at = now_ms();
            conn.execute(
                "UPDATE time_entries
                 SET start_ms = ?, end_ms = ?, note = ?, override_overlap = ?, updated_at = ?
                 WHERE id = ?",
                (
                    start.timestamp_millis(),
                    end.map(|e| e.timestamp_millis()),
                    &entry.note,
                    entry.override_overlap,
                    entry.updated_at.to_rfc3339(),
                    id.to_string(),
                ),
            )?;
            Ok(entry)
        })?;

        tracing::debug!(entry_id = %id, override_overlap = entry.override_overlap, "Edited time entry");
        Ok(entry)
    }

    /// Remove a finished entry. The running entry can only be stopped.
    pub fn delete_entry(&self, id: Uuid) -> Result<()> {
        self.write(|conn| {
            let entry = require_entry(conn, id)?;
            if entry.is_open() {
                return Err(TrackerError::InvalidState(format!(
                    "Entry {id} is still running; stop it before deleting"
                )));
            }
            conn.execute("DELETE FROM time_entries WHERE id = ?", [id.to_string()])?;
            Ok(())
        })?;

        tracing::debug!(entry_id = %id, "Deleted time entry");
        Ok(())
    }

    /// Lazily query entries ordered by start. Nothing is read until the
    /// returned query is iterated, and each iteration starts over.
    pub fn query_entries(&self, filter: EntryFilter) -> EntryQuery {
        EntryQuery::new(self.clone(), filter)
    }

    /// One keyset page of a query: entries strictly after `after` in
    /// `(start, id)` order, with the revision the page was read at.
    pub(crate) fn entry_page(
        &self,
        filter: &EntryFilter,
        after: Option<&(i64, String)>,
        limit: usize,
    ) -> Result<(u64, Vec<TimeEntry>)> {
        let mut sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM time_entries e
             JOIN tasks t ON t.id = e.task_id WHERE 1 = 1"
        );
        let mut args: Vec<Value> = Vec::new();

        if let Some(task_id) = filter.task_id {
            sql.push_str(" AND e.task_id = ?");
            args.push(Value::Text(task_id.to_string()));
        }
        if let Some(project_id) = filter.project_id {
            sql.push_str(" AND t.project_id = ?");
            args.push(Value::Text(project_id.to_string()));
        }
        if let Some(from) = filter.from {
            sql.push_str(" AND (e.end_ms IS NULL OR e.end_ms > ?)");
            args.push(Value::Integer(from.timestamp_millis()));
        }
        if let Some(to) = filter.to {
            sql.push_str(" AND e.start_ms < ?");
            args.push(Value::Integer(to.timestamp_millis()));
        }
        if let Some((start_ms, id)) = after {
            sql.push_str(" AND (e.start_ms > ? OR (e.start_ms = ? AND e.id > ?))");
            args.push(Value::Integer(*start_ms));
            args.push(Value::Integer(*start_ms));
            args.push(Value::Text(id.clone()));
        }
        sql.push_str(" ORDER BY e.start_ms, e.id LIMIT ?");
        args.push(Value::Integer(limit as i64));

        let conn = self.lock();
        let revision = read_revision(&conn)?;
        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map(params_from_iter(args.iter()), entry_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok((revision, entries))
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
        }
    }
}

// ============================================================
// Helpers
// ============================================================

fn read_revision(conn: &Connection) -> Result<u64> {
    let value: i64 = conn.query_row(
        "SELECT value FROM store_meta WHERE key = 'revision'",
        [],
        |row| row.get(0),
    )?;
    Ok(value as u64)
}

fn validate_name(kind: &str, name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(TrackerError::Validation(format!(
            "{kind} name cannot be empty"
        )));
    }
    Ok(name.to_string())
}

fn fetch_project(conn: &Connection, id: Uuid) -> Result<Option<Project>> {
    let project = conn
        .query_row(
            &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?"),
            [id.to_string()],
            project_from_row,
        )
        .optional()?;
    Ok(project)
}

fn require_project(conn: &Connection, id: Uuid) -> Result<Project> {
    fetch_project(conn, id)?.ok_or_else(|| TrackerError::not_found("Project", id))
}

fn active_project_named(conn: &Connection, name: &str) -> Result<Option<Project>> {
    let project = conn
        .query_row(
            &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE name = ? AND archived = 0"),
            [name],
            project_from_row,
        )
        .optional()?;
    Ok(project)
}

fn ensure_project_name_free(conn: &Connection, name: &str, except: Option<Uuid>) -> Result<()> {
    match active_project_named(conn, name)? {
        Some(existing) if Some(existing.id) != except => Err(TrackerError::Validation(format!(
            "A project named '{name}' already exists"
        ))),
        _ => Ok(()),
    }
}

fn insert_project(conn: &Connection, name: String) -> Result<Project> {
    let now = now_ms();
    let project = Project {
        id: Uuid::new_v4(),
        name,
        archived: false,
        created_at: now,
        updated_at: now,
    };
    conn.execute(
        "INSERT INTO projects (id, name, archived, created_at, updated_at)
         VALUES (?, ?, 0, ?, ?)",
        (
            project.id.to_string(),
            &project.name,
            now.to_rfc3339(),
            now.to_rfc3339(),
        ),
    )?;

    tracing::debug!(project_id = %project.id, name = %project.name, "Created project");
    Ok(project)
}

fn insert_task(conn: &Connection, project_id: Uuid, name: String) -> Result<Task> {
    let now = now_ms();
    let task = Task {
        id: Uuid::new_v4(),
        project_id,
        name,
        archived: false,
        created_at: now,
        updated_at: now,
    };
    conn.execute(
        "INSERT INTO tasks (id, project_id, name, archived, created_at, updated_at)
         VALUES (?, ?, ?, 0, ?, ?)",
        (
            task.id.to_string(),
            project_id.to_string(),
            &task.name,
            now.to_rfc3339(),
            now.to_rfc3339(),
        ),
    )?;

    tracing::debug!(task_id = %task.id, project_id = %project_id, "Created task");
    Ok(task)
}

fn active_task_named(conn: &Connection, project_id: Uuid, name: &str) -> Result<Option<Task>> {
    let task = conn
        .query_row(
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE project_id = ? AND name = ? AND archived = 0
                 ORDER BY created_at LIMIT 1"
            ),
            (project_id.to_string(), name),
            task_from_row,
        )
        .optional()?;
    Ok(task)
}

fn fetch_task(conn: &Connection, id: Uuid) -> Result<Option<Task>> {
    let task = conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"),
            [id.to_string()],
            task_from_row,
        )
        .optional()?;
    Ok(task)
}

fn require_task(conn: &Connection, id: Uuid) -> Result<Task> {
    fetch_task(conn, id)?.ok_or_else(|| TrackerError::not_found("Task", id))
}

fn fetch_entry(conn: &Connection, id: Uuid) -> Result<Option<TimeEntry>> {
    let entry = conn
        .query_row(
            &format!("SELECT {ENTRY_COLUMNS} FROM time_entries e WHERE e.id = ?"),
            [id.to_string()],
            entry_from_row,
        )
        .optional()?;
    Ok(entry)
}

fn require_entry(conn: &Connection, id: Uuid) -> Result<TimeEntry> {
    fetch_entry(conn, id)?.ok_or_else(|| TrackerError::not_found("Entry", id))
}

fn close_open_entry(conn: &Connection, id: Uuid, end: DateTime<Utc>) -> Result<TimeEntry> {
    let mut entry = require_entry(conn, id)?;
    if let Some(existing) = entry.end {
        return Err(TrackerError::InvalidState(format!(
            "Entry {id} was already closed at {existing}"
        )));
    }
    if end <= entry.start {
        return Err(TrackerError::InvalidState(format!(
            "Cannot close entry {id} at {end}: it started at {}",
            entry.start
        )));
    }

    entry.end = Some(end);
    entry.updated_at = now_ms();
    conn.execute(
        "UPDATE time_entries SET end_ms = ?, updated_at = ? WHERE id = ?",
        (
            end.timestamp_millis(),
            entry.updated_at.to_rfc3339(),
            id.to_string(),
        ),
    )?;
    Ok(entry)
}

fn first_open_entry(conn: &Connection) -> Result<Option<Uuid>> {
    let id = conn
        .query_row(
            "SELECT id FROM time_entries WHERE end_ms IS NULL ORDER BY start_ms LIMIT 1",
            [],
            |row| uuid_at(row, 0),
        )
        .optional()?;
    Ok(id)
}

/// Fail with `Conflict` if `[start, end)` intersects any entry that has not
/// been explicitly allowed to overlap. A missing end means "until further
/// notice", as does the end of the running entry.
fn ensure_no_overlap(
    conn: &Connection,
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
    exclude: Option<Uuid>,
) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT id FROM time_entries
         WHERE override_overlap = 0
           AND (end_ms IS NULL OR end_ms > ?1)
           AND (?2 IS NULL OR start_ms < ?2)
           AND (?3 IS NULL OR id != ?3)
         ORDER BY start_ms LIMIT 5",
    )?;
    let clashes = stmt
        .query_map(
            (
                start.timestamp_millis(),
                end.map(|e| e.timestamp_millis()),
                exclude.map(|id| id.to_string()),
            ),
            |row| uuid_at(row, 0),
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    if clashes.is_empty() {
        return Ok(());
    }
    let ids = clashes
        .iter()
        .map(Uuid::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    Err(TrackerError::Conflict(format!(
        "Interval overlaps existing entries: {ids}"
    )))
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: uuid_at(row, 0)?,
        name: row.get(1)?,
        archived: row.get(2)?,
        created_at: datetime_at(row, 3)?,
        updated_at: datetime_at(row, 4)?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: uuid_at(row, 0)?,
        project_id: uuid_at(row, 1)?,
        name: row.get(2)?,
        archived: row.get(3)?,
        created_at: datetime_at(row, 4)?,
        updated_at: datetime_at(row, 5)?,
    })
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<TimeEntry> {
    Ok(TimeEntry {
        id: uuid_at(row, 0)?,
        task_id: uuid_at(row, 1)?,
        start: millis_at(row, 2)?,
        end: row
            .get::<_, Option<i64>>(3)?
            .map(|ms| from_millis(ms, 3))
            .transpose()?,
        note: row.get(4)?,
        override_overlap: row.get(5)?,
        created_at: datetime_at(row, 6)?,
        updated_at: datetime_at(row, 7)?,
    })
}

fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let text: String = row.get(idx)?;
    Uuid::parse_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn datetime_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn millis_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    from_millis(row.get(idx)?, idx)
}

fn from_millis(ms: i64, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

/// Entries are stored with millisecond precision; truncate up front so the
/// value handed back matches what a later read returns.
fn truncate_ms(dt: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(dt.timestamp_millis()).unwrap_or(dt)
}

fn now_ms() -> DateTime<Utc> {
    truncate_ms(Utc::now())
}
