//! In-process cron engine
//!
//! Expressions accept 5 fields (seconds default to 0), 6 or 7 fields, the
//! `@daily`-style descriptors and `@every <duration>`. Each entry runs on its
//! own tokio task that sleeps until the next fire time; every firing is
//! spawned on a [`TaskTracker`] so [`CronEngine::stop`] can wait for in-flight
//! jobs.

use crate::config::decoders::parse_duration;
use chrono::{DateTime, Local};
use cron::Schedule;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum SchedulingError {
    #[error("invalid cron expression `{expression}`: {reason}")]
    InvalidExpression { expression: String, reason: String },

    #[error("cron engine has been stopped")]
    Stopped,
}

/// Parsed schedule
#[derive(Debug, Clone)]
pub enum CronSchedule {
    Cron(Box<Schedule>),
    Every(Duration),
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, SchedulingError> {
        let invalid = |reason: String| SchedulingError::InvalidExpression {
            expression: expression.to_string(),
            reason,
        };

        let trimmed = expression.trim();
        if let Some(every) = trimmed.strip_prefix("@every ") {
            let interval = parse_duration(every).map_err(|e| invalid(e.to_string()))?;
            if interval.is_zero() {
                return Err(invalid("interval must be positive".to_string()));
            }
            return Ok(CronSchedule::Every(interval));
        }

        let normalized = normalize_expression(trimmed).map_err(invalid)?;
        Schedule::from_str(&normalized)
            .map(|s| CronSchedule::Cron(Box::new(s)))
            .map_err(|e| invalid(e.to_string()))
    }

    /// Next fire time strictly after `now`, `None` if there is none
    pub fn next_after(&self, now: &DateTime<Local>) -> Option<DateTime<Local>> {
        match self {
            CronSchedule::Cron(schedule) => schedule.after(now).next(),
            CronSchedule::Every(interval) => {
                chrono::Duration::from_std(*interval)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d))
            }
        }
    }

    /// Whether the schedule fires at least once after `now`
    pub fn will_fire(&self, now: &DateTime<Local>) -> bool {
        self.next_after(now).is_some()
    }
}

const WEEKDAYS: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

/// Bring a classic cron expression into the 6/7 field form with named weekdays
///
/// The cron parser counts weekdays from 1 (Sunday) while classic crontabs
/// count from 0, so numeric weekdays are replaced with their names. Step
/// values after `/` are left untouched.
pub fn normalize_expression(expression: &str) -> Result<String, String> {
    if expression.starts_with('@') {
        return Ok(expression.to_string());
    }

    let mut fields: Vec<String> = expression.split_whitespace().map(str::to_string).collect();
    match fields.len() {
        5 => fields.insert(0, "0".to_string()),
        6 | 7 => {}
        n => return Err(format!("expected 5 to 7 fields, found {}", n)),
    }

    fields[5] = name_weekdays(&fields[5])?;
    Ok(fields.join(" "))
}

fn name_weekdays(field: &str) -> Result<String, String> {
    let name = |bound: &str| -> Result<String, String> {
        match bound.parse::<usize>() {
            Ok(n) if n < WEEKDAYS.len() => Ok(WEEKDAYS[n].to_string()),
            Ok(n) => Err(format!("weekday {} out of range", n)),
            Err(_) => Ok(bound.to_string()),
        }
    };

    field
        .split(',')
        .map(|item| {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (item, None),
            };
            let Some((first, last)) = range.split_once('-') else {
                let named = name(range)?;
                return Ok(match step {
                    Some(step) => format!("{}/{}", named, step),
                    None => named,
                });
            };
            // Sunday as 7 closes a range; the parser only knows it as the first day
            if last == "7" && first != "7" {
                let start = name(first)?;
                let includes_sunday = match step {
                    None => true,
                    Some(step) => {
                        let step: usize = step.parse().map_err(|_| format!("invalid step {}", step))?;
                        let first: usize = first
                            .parse()
                            .map_err(|_| format!("weekday range {} must be numeric when ending at 7", range))?;
                        step > 0 && (7 - first) % step == 0
                    }
                };
                let mut named = match step {
                    Some(step) => format!("{}-SAT/{}", start, step),
                    None => format!("{}-SAT", start),
                };
                if includes_sunday {
                    named.push_str(",SUN");
                }
                return Ok(named);
            }
            let named = format!("{}-{}", name(first)?, name(last)?);
            Ok(match step {
                Some(step) => format!("{}/{}", named, step),
                None => named,
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .map(|items| items.join(","))
}

/// Identifier of a registered cron entry
pub type EntryId = u64;

/// Job run on every firing
pub type Job = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct Entry {
    expression: String,
    schedule: CronSchedule,
    job: Job,
    token: CancellationToken,
}

#[derive(Default)]
struct EngineState {
    entries: HashMap<EntryId, Entry>,
    started: bool,
}

/// Drives registered entries until stopped
#[derive(Clone)]
pub struct CronEngine {
    state: Arc<Mutex<EngineState>>,
    next_id: Arc<AtomicU64>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Default for CronEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CronEngine {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(EngineState::default())),
            next_id: Arc::new(AtomicU64::new(1)),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register a job; it is scheduled right away if the engine is running
    pub fn add(&self, expression: &str, job: Job) -> Result<EntryId, SchedulingError> {
        if self.shutdown.is_cancelled() {
            return Err(SchedulingError::Stopped);
        }
        let schedule = CronSchedule::parse(expression)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Entry {
            expression: expression.to_string(),
            schedule,
            job,
            token: self.shutdown.child_token(),
        };

        let mut state = self.state.lock();
        if state.started {
            self.spawn_entry(id, &entry);
        }
        state.entries.insert(id, entry);
        Ok(id)
    }

    /// Remove an entry; a job already running for it is not interrupted
    pub fn remove(&self, id: EntryId) -> bool {
        match self.state.lock().entries.remove(&id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Expressions of all live entries, ordered by id
    pub fn expressions(&self) -> Vec<(EntryId, String)> {
        let state = self.state.lock();
        let mut list: Vec<_> = state
            .entries
            .iter()
            .map(|(id, e)| (*id, e.expression.clone()))
            .collect();
        list.sort();
        list
    }

    /// Number of jobs and entry loops currently tracked
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    pub fn start(&self) {
        let mut state = self.state.lock();
        if state.started {
            return;
        }
        state.started = true;
        for (id, entry) in state.entries.iter() {
            self.spawn_entry(*id, entry);
        }
    }

    /// Stop admitting firings and wait for dispatched jobs to finish
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    fn spawn_entry(&self, id: EntryId, entry: &Entry) {
        let schedule = entry.schedule.clone();
        let job = entry.job.clone();
        let token = entry.token.clone();
        let tracker = self.tracker.clone();

        self.tracker.spawn(async move {
            loop {
                let now = Local::now();
                let Some(next) = schedule.next_after(&now) else {
                    debug!(entry = id, "Schedule has no future fire times");
                    break;
                };
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                if token.is_cancelled() {
                    break;
                }
                tracker.spawn((job)());
            }
        });
    }
}
