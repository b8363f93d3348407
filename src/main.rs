use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use timetrack::clock::{Clock, SystemClock};
use timetrack::config::TrackerConfig;
use timetrack::db::Database;
use timetrack::models::*;
use timetrack::report::{Dimension, Period, Report, ReportQuery};
use timetrack::{Tracker, TrackerHandle};

#[derive(Parser)]
#[command(name = "tt")]
#[command(about = "Track time spent on projects and tasks")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema (safe to run more than once)
    Init,
    /// Manage projects
    Project {
        #[command(subcommand)]
        action: ProjectCommand,
    },
    /// Manage tasks
    Task {
        #[command(subcommand)]
        action: TaskCommand,
    },
    /// Start a timer; without a task, the configured default task is used
    Start {
        task: Option<Uuid>,
        #[arg(short, long)]
        note: Option<String>,
    },
    /// Stop the running timer
    Stop,
    /// Stop the running timer and remember its task
    Pause,
    /// Start the paused task again
    Resume,
    /// Stop the running timer and start another task
    Switch { task: Uuid },
    /// Show the running timer
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Record a finished interval
    Add {
        task: Uuid,
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        #[arg(short, long)]
        note: Option<String>,
        /// Accept overlap with existing entries
        #[arg(long = "override")]
        override_overlap: bool,
    },
    /// List entries
    Log {
        #[arg(long)]
        task: Option<Uuid>,
        #[arg(long)]
        project: Option<Uuid>,
        #[arg(short, long, value_enum, default_value = "all")]
        period: PeriodArg,
        #[arg(long)]
        json: bool,
    },
    /// Change an entry's interval or note
    Edit {
        entry: Uuid,
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
        #[arg(short, long)]
        note: Option<String>,
        /// Accept overlap with existing entries
        #[arg(long = "override")]
        override_overlap: bool,
    },
    /// Delete a finished entry
    Delete { entry: Uuid },
    /// Show totals
    Report {
        #[arg(short, long, value_enum, default_value = "today")]
        period: PeriodArg,
        #[arg(short, long, value_enum)]
        by: Option<ByArg>,
        #[arg(long)]
        project: Option<Uuid>,
        #[arg(long)]
        task: Option<Uuid>,
        /// Count the running timer up to now
        #[arg(long)]
        running: bool,
        #[arg(long)]
        json: bool,
    },
    /// Run the integrity check and print diagnostics
    Check,
    /// Repair a store that failed the integrity check
    Repair {
        #[command(subcommand)]
        action: RepairCommand,
    },
}

#[derive(Subcommand)]
enum ProjectCommand {
    Add { name: String },
    List {
        #[arg(long)]
        all: bool,
    },
    Rename { id: Uuid, name: String },
    Archive { id: Uuid },
    Restore { id: Uuid },
}

#[derive(Subcommand)]
enum TaskCommand {
    Add { project: Uuid, name: String },
    List {
        project: Uuid,
        #[arg(long)]
        all: bool,
    },
    Rename { id: Uuid, name: String },
    Archive { id: Uuid },
    Restore { id: Uuid },
}

#[derive(Subcommand)]
enum RepairCommand {
    /// Close one of several open entries
    Close {
        entry: Uuid,
        #[arg(long)]
        at: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum PeriodArg {
    Today,
    Week,
    Month,
    All,
}

impl From<PeriodArg> for Period {
    fn from(arg: PeriodArg) -> Self {
        match arg {
            PeriodArg::Today => Period::Today,
            PeriodArg::Week => Period::Week,
            PeriodArg::Month => Period::Month,
            PeriodArg::All => Period::All,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ByArg {
    Day,
    Week,
    Project,
    Task,
}

impl From<ByArg> for Dimension {
    fn from(arg: ByArg) -> Self {
        match arg {
            ByArg::Day => Dimension::Day,
            ByArg::Week => Dimension::Week,
            ByArg::Project => Dimension::Project,
            ByArg::Task => Dimension::Task,
        }
    }
}

/// Initialize tracing on stderr so stdout stays clean for `--json` output
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "timetrack=info".into()),
    );

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = TrackerConfig::load();
    let db_path = config.database_path()?;
    let db = Database::open(&db_path)
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let handle = TrackerHandle::new(Tracker::open(db, clock, config)?);

    if let Some(ids) = handle.tracker().blocked_by() {
        if !matches!(cli.command, Commands::Check | Commands::Repair { .. }) {
            tracing::error!(
                "{} entries are open at once; run `tt check` and `tt repair close`",
                ids.len()
            );
        }
    }

    run(cli.command, &handle, &db_path).await
}

async fn run(command: Commands, handle: &TrackerHandle, db_path: &Path) -> Result<()> {
    let tracker = handle.tracker();
    let offset = tracker.config().utc_offset();

    match command {
        // Opening the tracker already ran the migrations.
        Commands::Init => println!("Database initialized at: {}", db_path.display()),
        Commands::Project { action } => project_command(tracker.store(), action)?,
        Commands::Task { action } => task_command(tracker.store(), action)?,
        Commands::Start { task, note } => {
            let entry = match task {
                Some(task_id) => handle.start_timer(task_id, note).await?,
                None => handle.start_default().await?,
            };
            println!("Started {} at {}", entry.id, local(entry.start, offset));
        }
        Commands::Stop => {
            let entry = handle.stop_timer().await?;
            println!("Stopped {} after {}", entry.id, format_duration(entry.duration(None)));
        }
        Commands::Pause => {
            let entry = handle.pause_timer().await?;
            println!("Paused after {}", format_duration(entry.duration(None)));
        }
        Commands::Resume => {
            let entry = handle.resume_timer().await?;
            println!("Resumed as {}", entry.id);
        }
        Commands::Switch { task } => {
            let entry = handle.switch_task(task).await?;
            println!("Switched to task {} ({})", task, entry.id);
        }
        Commands::Status { json } => {
            let state = handle.status();
            if json {
                println!("{}", serde_json::to_string_pretty(&state)?);
            } else {
                match state {
                    SessionState::Idle => println!("Idle"),
                    SessionState::Running {
                        entry_id,
                        task_id,
                        started_at,
                    } => println!(
                        "Running {} on task {} for {}",
                        entry_id,
                        task_id,
                        format_duration(tracker.now() - started_at)
                    ),
                }
            }
        }
        Commands::Add {
            task,
            start,
            end,
            note,
            override_overlap,
        } => {
            let entry = handle
                .add_entry(CreateEntryInput {
                    task_id: task,
                    start: parse_time(&start, offset)?,
                    end: Some(parse_time(&end, offset)?),
                    note,
                    override_overlap,
                })
                .await?;
            println!("Recorded {}", entry.id);
        }
        Commands::Log {
            task,
            project,
            period,
            json,
        } => {
            let mut filter = Period::from(period).filter(tracker.now(), offset);
            filter.task_id = task;
            filter.project_id = project;
            let entries = handle.query_entries(filter).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in &entries {
                    print_entry(entry, offset);
                }
            }
        }
        Commands::Edit {
            entry,
            start,
            end,
            note,
            override_overlap,
        } => {
            let existing = tracker
                .store()
                .get_entry(entry)?
                .ok_or_else(|| anyhow::anyhow!("Entry not found: {}", entry))?;
            let input = EditEntryInput {
                start: match start {
                    Some(s) => parse_time(&s, offset)?,
                    None => existing.start,
                },
                end: match end {
                    Some(s) => Some(parse_time(&s, offset)?),
                    None => existing.end,
                },
                note,
                override_overlap,
            };
            let updated = handle.edit_entry(entry, input).await?;
            print_entry(&updated, offset);
        }
        Commands::Delete { entry } => {
            handle.delete_entry(entry).await?;
            println!("Deleted {}", entry);
        }
        Commands::Report {
            period,
            by,
            project,
            task,
            running,
            json,
        } => {
            let mut filter = Period::from(period).filter(tracker.now(), offset);
            filter.project_id = project;
            filter.task_id = task;
            let report = handle
                .report(ReportQuery {
                    filter,
                    dimension: by.map(Dimension::from),
                    include_running: running,
                })
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }
        Commands::Check => match tracker.recheck() {
            Ok(report) => {
                if let Some(entry) = &report.resumed {
                    println!("Running entry: {} since {}", entry.id, local(entry.start, offset));
                }
                for diagnostic in report.diagnostics() {
                    println!("{}", diagnostic);
                }
                for id in &report.future_entries {
                    println!("Entry {} starts in the future", id);
                }
                if report.is_clean() {
                    println!("No problems found");
                }
            }
            Err(e) => {
                println!("{}", e);
                println!("Close all but one with `tt repair close <entry> --at <time>`");
            }
        },
        Commands::Repair {
            action: RepairCommand::Close { entry, at },
        } => {
            let closed = tracker.repair_close_entry(entry, parse_time(&at, offset)?)?;
            print_entry(&closed, offset);
            match tracker.recheck() {
                Ok(_) => println!("Store is consistent again"),
                Err(e) => println!("{}", e),
            }
        }
    }

    Ok(())
}

fn project_command(db: &Database, action: ProjectCommand) -> Result<()> {
    match action {
        ProjectCommand::Add { name } => {
            let project = db.create_project(&name)?;
            println!("{}  {}", project.id, project.name);
        }
        ProjectCommand::List { all } => {
            for project in db.get_all_projects(all)? {
                let flag = if project.archived { " (archived)" } else { "" };
                println!("{}  {}{}", project.id, project.name, flag);
            }
        }
        ProjectCommand::Rename { id, name } => {
            let project = db.rename_project(id, &name)?;
            println!("{}  {}", project.id, project.name);
        }
        ProjectCommand::Archive { id } => {
            db.archive_project(id)?;
            println!("Archived {}", id);
        }
        ProjectCommand::Restore { id } => {
            db.restore_project(id)?;
            println!("Restored {}", id);
        }
    }
    Ok(())
}

fn task_command(db: &Database, action: TaskCommand) -> Result<()> {
    match action {
        TaskCommand::Add { project, name } => {
            let task = db.create_task(project, &name)?;
            println!("{}  {}", task.id, task.name);
        }
        TaskCommand::List { project, all } => {
            for task in db.get_tasks_by_project(project, all)? {
                let flag = if task.archived { " (archived)" } else { "" };
                println!("{}  {}{}", task.id, task.name, flag);
            }
        }
        TaskCommand::Rename { id, name } => {
            let task = db.rename_task(id, &name)?;
            println!("{}  {}", task.id, task.name);
        }
        TaskCommand::Archive { id } => {
            db.archive_task(id)?;
            println!("Archived {}", id);
        }
        TaskCommand::Restore { id } => {
            db.restore_task(id)?;
            println!("Restored {}", id);
        }
    }
    Ok(())
}

/// Accepts RFC 3339, or `YYYY-MM-DD HH:MM[:SS]` in local time.
fn parse_time(input: &str, offset: FixedOffset) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(input, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(input, "%Y-%m-%d %H:%M"))
        .with_context(|| format!("Unrecognized time '{}'", input))?;
    Ok((naive - Duration::seconds(offset.local_minus_utc().into())).and_utc())
}

fn local(dt: DateTime<Utc>, offset: FixedOffset) -> String {
    dt.with_timezone(&offset).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn format_duration(d: Duration) -> String {
    let secs = d.num_seconds().max(0);
    format!("{}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
}

fn print_entry(entry: &TimeEntry, offset: FixedOffset) {
    let end = entry
        .end
        .map(|e| local(e, offset))
        .unwrap_or_else(|| "In Progress".to_string());
    let duration = if entry.is_open() {
        "...".to_string()
    } else {
        format_duration(entry.duration(None))
    };
    println!(
        "{}  {}  {}  {:>9}  {}",
        entry.id,
        local(entry.start, offset),
        end,
        duration,
        entry.note.as_deref().unwrap_or("")
    );
}

fn print_report(report: &Report) {
    for row in &report.rows {
        println!("{:<40} {:>10}", row.label, format_duration(row.duration));
    }
    println!("{:<40} {:>10}", "Total Time", format_duration(report.total));
}
