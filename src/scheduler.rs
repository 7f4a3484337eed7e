//! Periodic enqueueing.
//!
//! A [`Scheduler`] holds a list of `(schedule, task)` entries and enqueues a
//! copy of each task whenever its schedule next matches, in UTC. Supported
//! schedule syntax:
//!
//! - 5-field cron (`*/5 * * * *`), minute resolution, with crontab weekday
//!   numbers (0 or 7 is Sunday)
//! - 6 or 7-field cron with seconds (and years)
//! - descriptors such as `@hourly` or `@daily`
//! - `@every <duration>`, e.g. `@every 1m` or `@every 1h30m`
//!
//! # Examples
//!
//! ```rust,no_run
//! use taskrelay::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> RelayResult<()> {
//!     let scheduler = std::sync::Arc::new(Scheduler::new(SchedulerConfig::default()).await?);
//!     scheduler.with_scheduler_task("@every 1m", taskrelay::tasks::new_health_check_task().ok())?;
//!
//!     let running = std::sync::Arc::clone(&scheduler);
//!     tokio::spawn(async move { running.start().await });
//!
//!     tokio::signal::ctrl_c().await?;
//!     scheduler.shutdown().await;
//!     Ok(())
//! }
//! ```

use crate::broker::{BrokerFactory, SharedBroker};
use crate::config::{LogLevel, SchedulerConfig, validation_error};
use crate::core::engine::stopped;
use crate::error::{RelayError, RelayResult};
use crate::task::{Task, add_duration};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinSet;
use tracing::level_filters::LevelFilter;

/// When an entry fires.
#[derive(Debug, Clone)]
pub enum ScheduleSpec {
    /// Cron expression with a seconds field
    Cron(Box<cron::Schedule>),
    /// Fixed interval from the previous firing
    Every(Duration),
}

impl ScheduleSpec {
    /// Parse a schedule expression.
    pub fn parse(expression: &str) -> RelayResult<Self> {
        let expression = expression.trim();
        if expression.is_empty() {
            return Err(RelayError::NoSchedule);
        }

        let invalid = |message: String| RelayError::InvalidSchedule {
            expression: expression.to_string(),
            message,
        };

        if let Some(interval) = expression.strip_prefix("@every") {
            let every = parse_interval(interval.trim()).map_err(invalid)?;
            return Ok(Self::Every(every));
        }

        let fields: Vec<&str> = expression.split_whitespace().collect();
        let normalized = match fields.as_slice() {
            [minute, hour, day, month, weekday] => format!(
                "0 {} {} {} {} {}",
                minute,
                hour,
                day,
                month,
                crontab_weekdays(weekday).map_err(invalid)?
            ),
            _ => expression.to_string(),
        };
        let schedule = cron::Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))?;
        Ok(Self::Cron(Box::new(schedule)))
    }

    /// First firing strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Cron(schedule) => schedule.after(&after).next(),
            Self::Every(every) => Some(add_duration(after, *every)),
        }
    }
}

/// Renumber a crontab day-of-week field (0-7, Sunday is 0 and 7) into the
/// 1-7 numbering of the `cron` crate (Sunday is 1).
///
/// Numeric items are expanded into explicit lists so ranges ending on
/// Sunday stay valid. Names such as `MON-FRI` pass through unchanged.
fn crontab_weekdays(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut items = Vec::new();
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("bad step in day of week '{}'", item))?;
                if step == 0 {
                    return Err(format!("zero step in day of week '{}'", item));
                }
                (base, Some(step))
            }
            None => (item, None),
        };

        let numeric = base == "*" || base.split('-').all(|part| part.parse::<u32>().is_ok());
        if !numeric {
            items.push(item.to_string());
            continue;
        }

        let (start, end) = if base == "*" {
            (0, 6)
        } else if let Some((start, end)) = base.split_once('-') {
            (weekday_number(start)?, weekday_number(end)?)
        } else {
            let day = weekday_number(base)?;
            (day, if step.is_some() { 6 } else { day })
        };
        if start > end {
            return Err(format!("descending range in day of week '{}'", item));
        }

        let step = step.unwrap_or(1) as usize;
        items.extend(
            (start..=end)
                .step_by(step)
                .map(|day| if day == 7 { 1 } else { day + 1 })
                .map(|day| day.to_string()),
        );
    }

    let mut days: Vec<String> = Vec::new();
    for item in items {
        if !days.contains(&item) {
            days.push(item);
        }
    }
    Ok(days.join(","))
}

fn weekday_number(text: &str) -> Result<u32, String> {
    match text.parse::<u32>() {
        Ok(day) if day <= 7 => Ok(day),
        _ => Err(format!("day of week '{}' is not in 0-7", text)),
    }
}

/// Parse `1h30m`, `45s`, `250ms` and similar.
fn parse_interval(text: &str) -> Result<Duration, String> {
    if text.is_empty() {
        return Err("missing interval".to_string());
    }

    let mut total = Duration::ZERO;
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("missing unit in '{}'", text))?;
        if digits == 0 {
            return Err(format!("expected a number in '{}'", text));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|e| format!("bad number in '{}': {}", text, e))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.saturating_mul(60)),
            "h" => Duration::from_secs(value.saturating_mul(3600)),
            other => return Err(format!("unknown unit '{}' in '{}'", other, text)),
        };
        total = total.saturating_add(part);
        rest = &rest[unit_len..];
    }

    if total.is_zero() {
        return Err("interval must be positive".to_string());
    }
    Ok(total)
}

/// Lifecycle of a scheduler entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// Waiting for its next firing
    Registered,
    /// An enqueue is in flight
    Firing,
}

/// Snapshot of one registered entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerEntry {
    /// Entry identifier
    pub id: String,
    /// Expression as registered
    pub spec: String,
    /// Type of the task it enqueues
    pub task_type: String,
    /// Next firing, once the scheduler runs
    pub next: Option<DateTime<Utc>>,
    /// Previous firing
    pub prev: Option<DateTime<Utc>>,
    /// Current state
    pub state: EntryState,
}

#[derive(Debug)]
struct Entry {
    id: String,
    expression: String,
    spec: ScheduleSpec,
    task: Task,
    next: Option<DateTime<Utc>>,
    prev: Option<DateTime<Utc>>,
    state: EntryState,
}

impl Entry {
    fn snapshot(&self) -> SchedulerEntry {
        SchedulerEntry {
            id: self.id.clone(),
            spec: self.expression.clone(),
            task_type: self.task.task_type().to_string(),
            next: self.next,
            prev: self.prev,
            state: self.state,
        }
    }
}

type Entries = Arc<Mutex<Vec<Entry>>>;

fn lock(entries: &Entries) -> RelayResult<MutexGuard<'_, Vec<Entry>>> {
    entries
        .lock()
        .map_err(|_| RelayError::config("scheduler entries lock poisoned"))
}

/// Cron-driven task producer.
pub struct Scheduler {
    broker: SharedBroker,
    level: LevelFilter,
    entries: Entries,
    changed: Notify,
    running: AtomicBool,
    stop: watch::Sender<bool>,
    active: watch::Sender<bool>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("level", &self.level)
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Connect to the broker named in `config`.
    pub async fn new(config: SchedulerConfig) -> RelayResult<Self> {
        LogLevel::parse(&config.log_level)?;
        config.validate().map_err(validation_error)?;
        let broker = BrokerFactory::connect(&config.broker).await?;
        Self::with_broker(config, broker)
    }

    /// Create a scheduler on an existing broker.
    pub fn with_broker(config: SchedulerConfig, broker: SharedBroker) -> RelayResult<Self> {
        let level = LevelFilter::from(LogLevel::parse(&config.log_level)?);
        config.validate().map_err(validation_error)?;

        Ok(Self {
            broker,
            level,
            entries: Arc::new(Mutex::new(Vec::new())),
            changed: Notify::new(),
            running: AtomicBool::new(false),
            stop: watch::channel(false).0,
            active: watch::channel(false).0,
        })
    }

    /// Register `task` to be enqueued on `expression`; returns the entry ID.
    ///
    /// Fails with `NoSchedule` on an empty expression, `NoTask` without a
    /// task and `InvalidSchedule` when the expression does not parse.
    /// Entries may be added while the scheduler runs.
    pub fn with_scheduler_task(&self, expression: &str, task: Option<Task>) -> RelayResult<String> {
        if expression.trim().is_empty() {
            return Err(RelayError::NoSchedule);
        }
        let task = task.ok_or(RelayError::NoTask)?;
        let spec = ScheduleSpec::parse(expression)?;

        let id = uuid::Uuid::new_v4().to_string();
        let next = if self.running.load(Ordering::SeqCst) {
            spec.next_after(Utc::now())
        } else {
            None
        };

        tracing::info!(
            entry_id = %id,
            spec = %expression,
            task_type = %task.task_type(),
            "Registered scheduler entry"
        );

        lock(&self.entries)?.push(Entry {
            id: id.clone(),
            expression: expression.to_string(),
            spec,
            task,
            next,
            prev: None,
            state: EntryState::Registered,
        });
        self.changed.notify_one();
        Ok(id)
    }

    /// Snapshot of every registered entry.
    pub fn entries(&self) -> RelayResult<Vec<SchedulerEntry>> {
        Ok(lock(&self.entries)?.iter().map(Entry::snapshot).collect())
    }

    /// Fire entries until [`Scheduler::shutdown`] is called.
    ///
    /// Each firing is one enqueue, spawned so a slow broker never delays the
    /// next firing. A failed enqueue is logged and the entry stays
    /// registered.
    pub async fn start(&self) -> RelayResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(RelayError::AlreadyRunning);
        }
        if *self.stop.borrow() {
            self.running.store(false, Ordering::SeqCst);
            return Ok(());
        }
        self.active.send_replace(true);

        let result = self.run().await;

        self.running.store(false, Ordering::SeqCst);
        self.active.send_replace(false);
        tracing::info!("Scheduler stopped");
        result
    }

    async fn run(&self) -> RelayResult<()> {
        let mut stop = self.stop.subscribe();
        let mut firings = JoinSet::new();

        {
            let now = Utc::now();
            let mut entries = lock(&self.entries)?;
            for entry in entries.iter_mut() {
                entry.next = entry.spec.next_after(now);
            }
            tracing::info!(entries = entries.len(), "Scheduler started");
        }

        loop {
            while firings.try_join_next().is_some() {}

            let wake = lock(&self.entries)?.iter().filter_map(|e| e.next).min();
            let sleep_for = wake.map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO));

            tokio::select! {
                _ = stopped(&mut stop) => break,
                _ = self.changed.notified() => continue,
                _ = async {
                    match sleep_for {
                        Some(d) => tokio::time::sleep(d).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {}
            }

            let now = Utc::now();
            let due: Vec<(String, Task)> = {
                let mut entries = lock(&self.entries)?;
                entries
                    .iter_mut()
                    .filter(|e| e.next.is_some_and(|at| at <= now))
                    .map(|e| {
                        e.prev = e.next;
                        e.next = e.spec.next_after(now);
                        e.state = EntryState::Firing;
                        (e.id.clone(), e.task.clone())
                    })
                    .collect()
            };

            for (id, task) in due {
                let broker = Arc::clone(&self.broker);
                let entries = Arc::clone(&self.entries);
                let verbose = self.level >= tracing::Level::INFO;
                firings.spawn(async move {
                    let message = task.to_message();
                    let task_id = message.id.clone();
                    match broker.enqueue(message, task.options().process_at).await {
                        Ok(info) => {
                            if verbose {
                                tracing::info!(
                                    entry_id = %id,
                                    task_id = %info.id,
                                    task_type = %info.task_type,
                                    queue = %info.queue,
                                    "Enqueued scheduled task"
                                );
                            }
                        }
                        Err(e) => tracing::error!(
                            entry_id = %id,
                            task_id = %task_id,
                            error = %RelayError::send_task(e),
                            "Failed to enqueue scheduled task"
                        ),
                    }
                    if let Ok(mut entries) = lock(&entries) {
                        if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
                            entry.state = EntryState::Registered;
                        }
                    }
                });
            }
        }

        while firings.join_next().await.is_some() {}
        Ok(())
    }

    /// Stop firing and wait for in-flight enqueues. Idempotent.
    pub async fn shutdown(&self) {
        if !self.stop.send_replace(true) {
            tracing::info!("Shutting down scheduler");
        }
        let mut active = self.active.subscribe();
        while *active.borrow_and_update() {
            if active.changed().await.is_err() {
                break;
            }
        }
    }
}
