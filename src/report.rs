//! Derived time totals.
//!
//! Everything here is recomputed from store queries. The only state is the
//! optional [`ReportCache`], which is keyed on the store revision so a write
//! always invalidates it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

use crate::db::{retry_stale, Database};
use crate::error::Result;
use crate::models::{EntryFilter, TimeEntry};

/// How an entry that crosses local midnight is attributed to days.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayAttribution {
    /// Split at every local midnight; each day gets the part that fell on it.
    #[default]
    Proportional,
    /// The whole duration counts for the local day the entry started on.
    StartDay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Day,
    /// ISO week, Monday first.
    Week,
    Project,
    Task,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum GroupKey {
    Day(NaiveDate),
    Week { year: i32, week: u32 },
    Project(Uuid),
    Task(Uuid),
}

/// Report windows offered by the front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Today,
    Week,
    Month,
    All,
}

impl Period {
    /// The half-open UTC range covering this period around `now`, in the
    /// given local offset. `All` has no bounds.
    pub fn range(
        &self,
        now: DateTime<Utc>,
        offset: FixedOffset,
    ) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let today = now.with_timezone(&offset).date_naive();
        let (first, last) = match self {
            Period::All => return None,
            Period::Today => (today, today.succ_opt()?),
            Period::Week => {
                let monday = today - Duration::days(today.weekday().num_days_from_monday().into());
                (monday, monday + Duration::days(7))
            }
            Period::Month => {
                let first = today.with_day(1)?;
                let next = if first.month() == 12 {
                    NaiveDate::from_ymd_opt(first.year() + 1, 1, 1)?
                } else {
                    NaiveDate::from_ymd_opt(first.year(), first.month() + 1, 1)?
                };
                (first, next)
            }
        };
        Some((local_midnight(first, offset), local_midnight(last, offset)))
    }

    pub fn filter(&self, now: DateTime<Utc>, offset: FixedOffset) -> EntryFilter {
        match self.range(now, offset) {
            Some((from, to)) => EntryFilter::default().between(from, to),
            None => EntryFilter::default(),
        }
    }
}

/// What the front end asks for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReportQuery {
    pub filter: EntryFilter,
    pub dimension: Option<Dimension>,
    /// Count the running entry up to the current time.
    #[serde(default)]
    pub include_running: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportRow {
    pub key: GroupKey,
    pub label: String,
    #[serde(rename = "seconds", serialize_with = "as_seconds")]
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Report {
    #[serde(rename = "total_seconds", serialize_with = "as_seconds")]
    pub total: Duration,
    pub rows: Vec<ReportRow>,
    /// Store revision the report was computed against.
    pub revision: u64,
    pub as_of: Option<DateTime<Utc>>,
}

fn as_seconds<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_i64(d.num_seconds())
}

struct Tally {
    revision: u64,
    total: Duration,
    groups: BTreeMap<GroupKey, Duration>,
}

pub struct Aggregator<'a> {
    db: &'a Database,
    offset: FixedOffset,
    attribution: DayAttribution,
}

impl<'a> Aggregator<'a> {
    pub fn new(db: &'a Database, offset: FixedOffset) -> Self {
        Self {
            db,
            offset,
            attribution: DayAttribution::default(),
        }
    }

    pub fn with_attribution(mut self, attribution: DayAttribution) -> Self {
        self.attribution = attribution;
        self
    }

    /// Sum of matching entry durations, clipped to the filter's date range.
    /// Running entries only count when `as_of` supplies a stand-in end.
    pub fn total_duration(
        &self,
        filter: &EntryFilter,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Duration> {
        Ok(self.tally(filter, None, as_of)?.total)
    }

    pub fn group_by(
        &self,
        dimension: Dimension,
        filter: &EntryFilter,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<BTreeMap<GroupKey, Duration>> {
        Ok(self.tally(filter, Some(dimension), as_of)?.groups)
    }

    /// Compute a labelled report for the front end. Total, rows and revision
    /// all come from the same pass over the store.
    pub fn report(&self, query: &ReportQuery, now: DateTime<Utc>) -> Result<Report> {
        let as_of = query.include_running.then_some(now);
        let tally = self.tally(&query.filter, query.dimension, as_of)?;

        let mut rows = Vec::with_capacity(tally.groups.len());
        for (key, duration) in tally.groups {
            rows.push(ReportRow {
                key,
                label: self.label(key)?,
                duration,
            });
        }

        Ok(Report {
            total: tally.total,
            rows,
            revision: tally.revision,
            as_of,
        })
    }

    fn tally(
        &self,
        filter: &EntryFilter,
        dimension: Option<Dimension>,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Tally> {
        // Tasks never change project, so this map can be read outside the
        // pass; tasks created since are looked up one by one.
        let projects: HashMap<Uuid, Uuid> = if dimension == Some(Dimension::Project) {
            self.db
                .get_all_tasks()?
                .into_iter()
                .map(|task| (task.id, task.project_id))
                .collect()
        } else {
            HashMap::new()
        };
        let query = self.db.query_entries(filter.clone());

        retry_stale(|| {
            let mut total = Duration::zero();
            let mut groups = BTreeMap::new();
            let mut entries = query.iter();

            for entry in entries.by_ref() {
                let entry = entry?;
                let Some((start, end)) = span(&entry, filter, as_of) else {
                    continue;
                };
                total += end - start;

                match dimension {
                    None => {}
                    Some(Dimension::Task) => {
                        add(&mut groups, GroupKey::Task(entry.task_id), end - start)
                    }
                    Some(Dimension::Project) => {
                        let project_id = match projects.get(&entry.task_id) {
                            Some(project_id) => Some(*project_id),
                            None => self.db.get_task(entry.task_id)?.map(|t| t.project_id),
                        };
                        if let Some(project_id) = project_id {
                            add(&mut groups, GroupKey::Project(project_id), end - start);
                        }
                    }
                    Some(dimension) => {
                        for (day, length) in self.days(start, end) {
                            let key = if dimension == Dimension::Day {
                                GroupKey::Day(day)
                            } else {
                                let week = day.iso_week();
                                GroupKey::Week {
                                    year: week.year(),
                                    week: week.week(),
                                }
                            };
                            add(&mut groups, key, length);
                        }
                    }
                }
            }

            let revision = match entries.revision() {
                Some(revision) => revision,
                None => self.db.revision()?,
            };
            Ok(Tally {
                revision,
                total,
                groups,
            })
        })
    }

    /// Attribute `[start, end)` to local days according to the policy.
    fn days(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<(NaiveDate, Duration)> {
        let first_day = start.with_timezone(&self.offset).date_naive();
        if self.attribution == DayAttribution::StartDay {
            return vec![(first_day, end - start)];
        }

        let mut pieces = Vec::new();
        let mut day = first_day;
        let mut cursor = start;
        while cursor < end {
            let Some(next_day) = day.succ_opt() else {
                pieces.push((day, end - cursor));
                break;
            };
            let boundary = local_midnight(next_day, self.offset).min(end);
            pieces.push((day, boundary - cursor));
            cursor = boundary;
            day = next_day;
        }
        pieces
    }

    fn label(&self, key: GroupKey) -> Result<String> {
        let label = match key {
            GroupKey::Day(day) => day.format("%Y-%m-%d").to_string(),
            GroupKey::Week { year, week } => format!("{year}-W{week:02}"),
            GroupKey::Project(id) => self
                .db
                .get_project(id)?
                .map(|p| p.name)
                .unwrap_or_else(|| id.to_string()),
            GroupKey::Task(id) => match self.db.get_task(id)? {
                Some(task) => match self.db.get_project(task.project_id)? {
                    Some(project) => format!("{} / {}", project.name, task.name),
                    None => task.name,
                },
                None => id.to_string(),
            },
        };
        Ok(label)
    }
}

/// The part of an entry that counts towards a report, or `None` if nothing
/// does.
fn span(
    entry: &TimeEntry,
    filter: &EntryFilter,
    as_of: Option<DateTime<Utc>>,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let end = entry.end.or(as_of)?;
    let start = filter.from.map_or(entry.start, |from| from.max(entry.start));
    let end = filter.to.map_or(end, |to| to.min(end));
    (start < end).then_some((start, end))
}

fn add(groups: &mut BTreeMap<GroupKey, Duration>, key: GroupKey, length: Duration) {
    *groups.entry(key).or_insert_with(Duration::zero) += length;
}

/// UTC instant of 00:00 local time on `date`.
pub fn local_midnight(date: NaiveDate, offset: FixedOffset) -> DateTime<Utc> {
    (date.and_time(NaiveTime::MIN) - Duration::seconds(offset.local_minus_utc().into())).and_utc()
}

/// Single-slot cache for the most recent report.
///
/// An entry is only served while the store revision it was computed at is
/// still current. Reports that include the running entry depend on the
/// current time and are never cached. The slot lock is not held while a
/// report is computed, so readers do not queue behind each other.
#[derive(Default)]
pub struct ReportCache {
    slot: Mutex<Option<(u64, ReportQuery, Report)>>,
}

impl ReportCache {
    pub fn get_or_compute(
        &self,
        revision: u64,
        query: &ReportQuery,
        compute: impl FnOnce() -> Result<Report>,
    ) -> Result<Report> {
        if query.include_running {
            return compute();
        }

        if let Some((cached_rev, cached_query, report)) = self.slot().as_ref() {
            if *cached_rev == revision && cached_query == query {
                tracing::trace!(revision, "Serving cached report");
                return Ok(report.clone());
            }
        }

        let report = compute()?;
        // Keyed by the revision the report actually saw, which may be newer
        // than the one looked up.
        let mut slot = self.slot();
        let newer = slot
            .as_ref()
            .map_or(true, |(cached_rev, _, _)| report.revision >= *cached_rev);
        if newer {
            *slot = Some((report.revision, query.clone(), report.clone()));
        }
        Ok(report)
    }

    fn slot(&self) -> MutexGuard<'_, Option<(u64, ReportQuery, Report)>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}
