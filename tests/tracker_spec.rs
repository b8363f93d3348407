use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use speculate2::speculate;
use timetrack::clock::ManualClock;
use timetrack::config::TrackerConfig;
use timetrack::db::Database;
use timetrack::models::*;
use timetrack::report::{Dimension, ReportQuery};
use timetrack::{Tracker, TrackerError};
use uuid::Uuid;

fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 6, hour, minute, 0).unwrap()
}

fn config() -> TrackerConfig {
    TrackerConfig {
        utc_offset_minutes: Some(0),
        ..TrackerConfig::default()
    }
}

fn open_tracker(db: Database, clock: &Arc<ManualClock>) -> Tracker {
    Tracker::open(db, clock.clone(), config()).expect("Failed to open tracker")
}

fn finished(task_id: Uuid, start: DateTime<Utc>, end: DateTime<Utc>) -> CreateEntryInput {
    CreateEntryInput {
        task_id,
        start,
        end: Some(end),
        note: None,
        override_overlap: false,
    }
}

speculate! {
    before {
        let clock = Arc::new(ManualClock::new(at(9, 0)));
        let tracker = open_tracker(
            Database::open_memory().expect("Failed to create in-memory database"),
            &clock,
        );
        let project = tracker.store().create_project("Project").expect("Failed to create project");
        let task = tracker.store().create_task(project.id, "Coding").expect("Failed to create task");
        let other = tracker.store().create_task(project.id, "Review").expect("Failed to create task");
    }

    describe "startup" {
        it "opens idle and healthy on an empty store" {
            assert_eq!(tracker.status(), SessionState::Idle);
            assert!(tracker.blocked_by().is_none());
            assert!(tracker.integrity_report().expect("Report missing").is_clean());
        }
    }

    describe "start and stop" {
        it "totals a one hour timer" {
            tracker.start_timer(task.id).expect("Failed to start");
            clock.advance(Duration::hours(1));
            let entry = tracker.stop_timer().expect("Failed to stop");

            assert_eq!(entry.start, at(9, 0));
            assert_eq!(entry.end, Some(at(10, 0)));
            let total = tracker
                .aggregator()
                .total_duration(&EntryFilter::task(task.id), None)
                .unwrap();
            assert_eq!(total, Duration::seconds(3600));
        }

        it "refuses a second timer and keeps the first" {
            let running = tracker.start_timer(task.id).expect("Failed to start");
            let err = tracker.start_timer(other.id).unwrap_err();

            assert!(matches!(err, TrackerError::Conflict(_)));
            assert_eq!(
                tracker.status(),
                SessionState::Running {
                    entry_id: running.id,
                    task_id: task.id,
                    started_at: at(9, 0),
                }
            );
        }

        it "refuses to stop when idle" {
            let err = tracker.stop_timer().unwrap_err();
            assert!(matches!(err, TrackerError::InvalidState(_)));
        }

        it "stays idle when the task does not exist" {
            let err = tracker.start_timer(Uuid::new_v4()).unwrap_err();
            assert!(matches!(err, TrackerError::NotFound { .. }));
            assert_eq!(tracker.status(), SessionState::Idle);
        }

        it "keeps the note given at start" {
            let entry = tracker
                .start_timer_with_note(task.id, Some("pairing".to_string()))
                .unwrap();
            assert_eq!(entry.note.as_deref(), Some("pairing"));
        }

        it "starts the default task when none is given" {
            let first = tracker.start_default().expect("Failed to start");
            clock.advance(Duration::minutes(10));
            tracker.stop_timer().unwrap();
            let second = tracker.start_default().expect("Failed to start again");

            assert_eq!(first.task_id, second.task_id);
            let task = tracker.store().get_task(first.task_id).unwrap().unwrap();
            assert_eq!(task.name, "Daily task");
            assert!(tracker.store().find_project_by_name("General").unwrap().is_some());
        }
    }

    describe "pause and resume" {
        it "resumes the paused task in a new entry" {
            let first = tracker.start_timer(task.id).unwrap();
            clock.advance(Duration::minutes(25));
            tracker.pause_timer().expect("Failed to pause");

            assert_eq!(tracker.status(), SessionState::Idle);
            assert_eq!(tracker.paused_task().unwrap(), Some(task.id));

            clock.advance(Duration::minutes(5));
            let second = tracker.resume_timer().expect("Failed to resume");

            assert_ne!(second.id, first.id);
            assert_eq!(second.task_id, task.id);
            assert_eq!(second.start, at(9, 30));
            assert!(tracker.paused_task().unwrap().is_none());
        }

        it "has nothing to resume without a pause" {
            let err = tracker.resume_timer().unwrap_err();
            assert!(matches!(err, TrackerError::InvalidState(_)));
        }
    }

    describe "switch_task" {
        it "closes the running entry and opens one on the new task" {
            let first = tracker.start_timer(task.id).unwrap();
            clock.advance(Duration::minutes(40));
            let second = tracker.switch_task(other.id).expect("Failed to switch");

            let first = tracker.store().get_entry(first.id).unwrap().unwrap();
            assert_eq!(first.end, Some(at(9, 40)));
            assert_eq!(second.start, at(9, 40));
            assert_eq!(second.task_id, other.id);
            assert_eq!(tracker.store().open_entries().unwrap().len(), 1);
        }

        it "starts a timer when idle" {
            let entry = tracker.switch_task(other.id).expect("Failed to switch");
            assert_eq!(tracker.status().entry_id(), Some(entry.id));
        }
    }

    describe "events" {
        it "announces transitions after they are stored" {
            let mut events = tracker.subscribe();
            let entry = tracker.start_timer(task.id).unwrap();

            match events.try_recv().expect("No event") {
                SessionEvent::Started { entry_id, task_id, at: started } => {
                    assert_eq!(entry_id, entry.id);
                    assert_eq!(task_id, task.id);
                    assert_eq!(started, at(9, 0));
                    assert!(tracker.store().get_entry(entry_id).unwrap().is_some());
                }
                event => panic!("Unexpected event {:?}", event),
            }

            clock.advance(Duration::minutes(15));
            tracker.stop_timer().unwrap();
            match events.try_recv().expect("No event") {
                SessionEvent::Stopped { entry_id, at: stopped, .. } => {
                    assert_eq!(entry_id, entry.id);
                    assert_eq!(stopped, at(9, 15));
                }
                event => panic!("Unexpected event {:?}", event),
            }
        }

        it "sends nothing for a rejected command" {
            let mut events = tracker.subscribe();
            let _ = tracker.stop_timer();
            assert!(events.try_recv().is_err());
        }
    }

    describe "entry maintenance" {
        it "rejects moving an entry onto another unless overridden" {
            tracker.add_entry(finished(task.id, at(6, 0), at(7, 0))).unwrap();
            let later = tracker.add_entry(finished(other.id, at(7, 30), at(8, 30))).unwrap();

            let moved = EditEntryInput {
                start: at(6, 30),
                end: Some(at(7, 30)),
                note: None,
                override_overlap: false,
            };
            let err = tracker.edit_entry(later.id, moved.clone()).unwrap_err();
            assert!(matches!(err, TrackerError::Conflict(_)));

            let edited = tracker
                .edit_entry(later.id, EditEntryInput { override_overlap: true, ..moved })
                .expect("Override should be accepted");
            assert!(edited.override_overlap);

            let entries = tracker
                .store()
                .query_entries(EntryFilter::default())
                .collect_entries()
                .unwrap();
            assert_eq!(entries.len(), 2);
            assert!(entries[0].overlaps(&entries[1]));
        }

        it "requires an end for manual entries" {
            let err = tracker
                .add_entry(CreateEntryInput {
                    end: None,
                    ..finished(task.id, at(6, 0), at(7, 0))
                })
                .unwrap_err();
            assert!(matches!(err, TrackerError::Validation(_)));
            assert_eq!(tracker.status(), SessionState::Idle);
        }

        it "moves the start of the running timer" {
            let entry = tracker.start_timer(task.id).unwrap();
            let mut events = tracker.subscribe();

            tracker
                .edit_entry(entry.id, EditEntryInput {
                    start: at(8, 30),
                    end: None,
                    note: None,
                    override_overlap: false,
                })
                .expect("Failed to edit");

            assert_eq!(
                tracker.status(),
                SessionState::Running {
                    entry_id: entry.id,
                    task_id: task.id,
                    started_at: at(8, 30),
                }
            );
            assert!(matches!(
                events.try_recv(),
                Ok(SessionEvent::Adjusted { started_at, .. }) if started_at == at(8, 30)
            ));
        }

        it "will not end the running timer through an edit" {
            let entry = tracker.start_timer(task.id).unwrap();
            clock.advance(Duration::minutes(5));

            let err = tracker
                .edit_entry(entry.id, EditEntryInput {
                    start: entry.start,
                    end: Some(at(9, 5)),
                    note: None,
                    override_overlap: false,
                })
                .unwrap_err();
            assert!(matches!(err, TrackerError::InvalidState(_)));
            assert!(tracker.status().is_running());
        }

        it "will not delete the running timer" {
            let entry = tracker.start_timer(task.id).unwrap();
            let err = tracker.delete_entry(entry.id).unwrap_err();
            assert!(matches!(err, TrackerError::InvalidState(_)));
        }

        it "refuses repair on a healthy store" {
            let entry = tracker.start_timer(task.id).unwrap();
            let err = tracker.repair_close_entry(entry.id, at(9, 30)).unwrap_err();
            assert!(matches!(err, TrackerError::InvalidState(_)));
        }
    }

    describe "report" {
        it "groups by task and counts the running timer only when asked" {
            tracker.add_entry(finished(task.id, at(6, 0), at(7, 0))).unwrap();
            tracker.add_entry(finished(other.id, at(7, 0), at(7, 30))).unwrap();
            tracker.start_timer(task.id).unwrap();
            clock.advance(Duration::minutes(30));

            let mut query = ReportQuery {
                filter: EntryFilter::default(),
                dimension: Some(Dimension::Task),
                include_running: false,
            };
            let report = tracker.report(&query).unwrap();
            assert_eq!(report.total, Duration::minutes(90));
            assert_eq!(report.rows.len(), 2);

            query.include_running = true;
            let report = tracker.report(&query).unwrap();
            assert_eq!(report.total, Duration::minutes(120));
            assert_eq!(report.as_of, Some(at(9, 30)));
            let coding = report
                .rows
                .iter()
                .find(|row| row.label == "Project / Coding")
                .expect("Row missing");
            assert_eq!(coding.duration, Duration::minutes(90));
        }

        it "reflects writes made after a cached report" {
            let query = ReportQuery {
                filter: EntryFilter::default(),
                dimension: None,
                include_running: false,
            };
            tracker.add_entry(finished(task.id, at(6, 0), at(7, 0))).unwrap();
            let first = tracker.report(&query).unwrap();
            assert_eq!(tracker.report(&query).unwrap(), first);

            tracker.add_entry(finished(task.id, at(7, 0), at(7, 45))).unwrap();
            let second = tracker.report(&query).unwrap();

            assert!(second.revision > first.revision);
            assert_eq!(second.total, Duration::minutes(105));
        }
    }
}

mod restart {
    use super::*;

    fn seed(path: &Path, clock: &Arc<ManualClock>) -> Task {
        let tracker = open_tracker(Database::open(path).unwrap(), clock);
        let project = tracker.store().create_project("Project").unwrap();
        tracker.store().create_task(project.id, "Coding").unwrap()
    }

    /// Leave two open entries behind, which the API itself never allows.
    fn corrupt(path: &Path, task_id: Uuid) -> Vec<Uuid> {
        let conn = rusqlite::Connection::open(path).unwrap();
        conn.execute_batch("DROP INDEX idx_time_entries_single_open").unwrap();
        let stamp = at(9, 0).to_rfc3339();
        [at(7, 0), at(8, 0)]
            .into_iter()
            .map(|start| {
                let id = Uuid::new_v4();
                conn.execute(
                    "INSERT INTO time_entries
                        (id, task_id, start_ms, end_ms, note, override_overlap, created_at, updated_at)
                     VALUES (?, ?, ?, NULL, NULL, 0, ?, ?)",
                    (id.to_string(), task_id.to_string(), start.timestamp_millis(), &stamp, &stamp),
                )
                .unwrap();
                id
            })
            .collect()
    }

    #[test]
    fn restores_the_running_timer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timetrack.db");
        let clock = Arc::new(ManualClock::new(at(9, 0)));
        let task = seed(&path, &clock);

        let entry = {
            let tracker = open_tracker(Database::open(&path).unwrap(), &clock);
            tracker.start_timer(task.id).unwrap()
        };

        clock.advance(Duration::hours(2));
        let tracker = open_tracker(Database::open(&path).unwrap(), &clock);

        assert_eq!(tracker.status().entry_id(), Some(entry.id));
        let report = tracker.integrity_report().unwrap();
        assert_eq!(report.resumed.map(|e| e.id), Some(entry.id));

        let stopped = tracker.stop_timer().expect("Failed to stop restored timer");
        assert_eq!(stopped.end, Some(at(11, 0)));
        assert!(tracker.store().open_entries().unwrap().is_empty());
    }

    #[test]
    fn resumes_a_pause_from_an_earlier_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timetrack.db");
        let clock = Arc::new(ManualClock::new(at(9, 0)));
        let task = seed(&path, &clock);

        let paused = {
            let tracker = open_tracker(Database::open(&path).unwrap(), &clock);
            tracker.start_timer(task.id).unwrap();
            clock.advance(Duration::minutes(30));
            tracker.pause_timer().unwrap()
        };

        clock.advance(Duration::minutes(15));
        let tracker = open_tracker(Database::open(&path).unwrap(), &clock);

        assert_eq!(tracker.status(), SessionState::Idle);
        assert_eq!(tracker.paused_task().unwrap(), Some(task.id));

        let resumed = tracker.resume_timer().expect("Failed to resume after restart");
        assert_eq!(resumed.task_id, task.id);
        assert_eq!(resumed.start, at(9, 45));
        assert_ne!(resumed.id, paused.id);
        assert!(tracker.paused_task().unwrap().is_none());
    }

    #[test]
    fn blocks_commands_until_corruption_is_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timetrack.db");
        let clock = Arc::new(ManualClock::new(at(9, 0)));
        let task = seed(&path, &clock);
        let ids = corrupt(&path, task.id);

        let tracker = open_tracker(Database::open(&path).unwrap(), &clock);

        assert_eq!(tracker.blocked_by(), Some(ids.clone()));
        assert_eq!(tracker.status(), SessionState::Idle);
        assert!(matches!(
            tracker.start_timer(task.id),
            Err(TrackerError::Corruption { .. })
        ));
        assert!(matches!(tracker.stop_timer(), Err(TrackerError::Corruption { .. })));
        assert!(matches!(
            tracker.add_entry(finished(task.id, at(5, 0), at(6, 0))),
            Err(TrackerError::Corruption { .. })
        ));

        tracker.repair_close_entry(ids[0], at(7, 30)).expect("Failed to repair");
        let report = tracker.recheck().expect("Store should be consistent");

        assert!(tracker.blocked_by().is_none());
        assert_eq!(report.resumed.map(|e| e.id), Some(ids[1]));
        assert_eq!(tracker.status().entry_id(), Some(ids[1]));
        let stopped = tracker.stop_timer().expect("Failed to stop");
        assert_eq!(stopped.end, Some(at(9, 0)));
    }
}
