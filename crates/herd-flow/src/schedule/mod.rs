//! Recurring task catalog.
//!
//! A catalog of named jobs, each with a cron expression, registered at
//! process start. Guarantees:
//!
//! - At most one instance of a given job name runs at a time cluster-wide,
//!   via a pluggable [`SingleFlight`] guard (in-memory here, a distributed
//!   lock in production).
//! - A frozen task is suppressed without deletion; each suppressed or
//!   executed fire leaves a [`RecurringTaskInstance`] with captured logs.
//! - Jobs submit tickets through the ordinary `create_ticket` contract —
//!   scheduler fires get no ledger shortcuts.

pub mod jobs;
pub mod selection;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use futures::future;
use serde::{Deserialize, Serialize};

use herd_core::InstanceId;

use crate::error::{Error, Result};
use crate::metrics;

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("catalog lock poisoned")
}

/// Captured log of one task firing.
#[derive(Debug, Default)]
pub struct InstanceLog {
    lines: Vec<String>,
}

impl InstanceLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a line.
    pub fn log(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    /// Returns the captured lines.
    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

/// Outcome of one task firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    /// The job ran to completion.
    Succeeded,
    /// The job returned an error.
    Failed,
    /// The fire was suppressed (frozen, or the lock was held elsewhere).
    Skipped,
}

/// Record of one task firing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurringTaskInstance {
    /// Unique run id.
    pub run_id: InstanceId,
    /// The task name.
    pub task: String,
    /// When the fire happened.
    pub fired_at: DateTime<Utc>,
    /// Outcome.
    pub status: InstanceStatus,
    /// Captured log lines.
    pub logs: Vec<String>,
}

/// A recurring job implementation.
#[async_trait]
pub trait Job: Send + Sync {
    /// Runs one firing, writing progress into `log`.
    async fn run(&self, log: &mut InstanceLog) -> Result<()>;
}

/// Cluster-wide single-flight guard per job name.
#[async_trait]
pub trait SingleFlight: Send + Sync {
    /// Attempts to acquire the guard; returns a release token, or `None`
    /// when another instance holds it.
    async fn acquire(&self, job: &str) -> Result<Option<String>>;

    /// Releases the guard.
    async fn release(&self, job: &str, token: &str) -> Result<()>;
}

/// In-process single-flight guard for tests and single-node deployments.
#[derive(Debug, Default)]
pub struct InMemorySingleFlight {
    held: Mutex<HashMap<String, String>>,
}

impl InMemorySingleFlight {
    /// Creates an empty guard.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SingleFlight for InMemorySingleFlight {
    async fn acquire(&self, job: &str) -> Result<Option<String>> {
        let mut held = self.held.lock().map_err(poison_err)?;
        if held.contains_key(job) {
            return Ok(None);
        }
        let token = InstanceId::generate().to_string();
        held.insert(job.to_owned(), token.clone());
        Ok(Some(token))
    }

    async fn release(&self, job: &str, token: &str) -> Result<()> {
        let mut held = self.held.lock().map_err(poison_err)?;
        if held.get(job).map(String::as_str) == Some(token) {
            held.remove(job);
        }
        Ok(())
    }
}

struct TaskEntry {
    name: String,
    schedule: Schedule,
    timezone: Tz,
    frozen: bool,
    job: Arc<dyn Job>,
    last_run: Option<DateTime<Utc>>,
}

/// The recurring task catalog.
pub struct TaskCatalog {
    entries: RwLock<Vec<TaskEntry>>,
    single_flight: Arc<dyn SingleFlight>,
    instances: RwLock<Vec<RecurringTaskInstance>>,
}

impl std::fmt::Debug for TaskCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCatalog").finish_non_exhaustive()
    }
}

impl TaskCatalog {
    /// Creates a catalog over a single-flight guard.
    #[must_use]
    pub fn new(single_flight: Arc<dyn SingleFlight>) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            single_flight,
            instances: RwLock::new(Vec::new()),
        }
    }

    /// Registers a job under a UTC cron expression.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the cron expression does not parse.
    pub fn register(&self, name: &str, cron: &str, job: Arc<dyn Job>) -> Result<()> {
        self.register_with_timezone(name, cron, "UTC", job)
    }

    /// Registers a job with an explicit timezone.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the cron expression or timezone does
    /// not parse.
    pub fn register_with_timezone(
        &self,
        name: &str,
        cron: &str,
        timezone: &str,
        job: Arc<dyn Job>,
    ) -> Result<()> {
        let schedule = Schedule::from_str(cron).map_err(|e| {
            Error::validation("recurring_task", format!("bad cron '{cron}': {e}"))
        })?;
        let tz: Tz = timezone.parse().map_err(|_| {
            Error::validation("recurring_task", format!("bad timezone '{timezone}'"))
        })?;

        let mut entries = self.entries.write().map_err(poison_err)?;
        entries.push(TaskEntry {
            name: name.to_owned(),
            schedule,
            timezone: tz,
            frozen: false,
            job,
            last_run: Some(Utc::now()),
        });
        Ok(())
    }

    /// Sets or clears a task's frozen flag.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the task name is unknown.
    pub fn set_frozen(&self, name: &str, frozen: bool) -> Result<()> {
        let mut entries = self.entries.write().map_err(poison_err)?;
        let entry = entries
            .iter_mut()
            .find(|e| e.name == name)
            .ok_or_else(|| Error::validation("recurring_task", format!("unknown task {name}")))?;
        entry.frozen = frozen;
        Ok(())
    }

    /// Returns the instances recorded so far.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the lock is poisoned.
    pub fn instances(&self) -> Result<Vec<RecurringTaskInstance>> {
        let instances = self.instances.read().map_err(poison_err)?;
        Ok(instances.clone())
    }

    fn record(&self, instance: RecurringTaskInstance) -> Result<()> {
        let mut instances = self.instances.write().map_err(poison_err)?;
        instances.push(instance);
        Ok(())
    }

    /// Evaluates all tasks at `now`, running those with a due cron fire.
    /// Returns the instances recorded by this tick.
    ///
    /// # Errors
    ///
    /// Returns an error if catalog state is unreadable; job errors are
    /// captured in their instances instead.
    #[tracing::instrument(skip(self))]
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<RecurringTaskInstance>> {
        // Collect due work without holding the lock across awaits.
        let due: Vec<(String, bool, Arc<dyn Job>)> = {
            let mut entries = self.entries.write().map_err(poison_err)?;
            let mut due = Vec::new();
            for entry in entries.iter_mut() {
                let since = entry.last_run.unwrap_or(now);
                let next = entry
                    .schedule
                    .after(&since.with_timezone(&entry.timezone))
                    .next()
                    .map(|t| t.with_timezone(&Utc));
                if next.is_some_and(|t| t <= now) {
                    due.push((entry.name.clone(), entry.frozen, Arc::clone(&entry.job)));
                    entry.last_run = Some(now);
                }
            }
            due
        };

        // Distinct job names may run concurrently; the single-flight guard
        // is per name.
        let results = future::join_all(
            due.into_iter()
                .map(|(name, frozen, job)| self.fire_one(name, frozen, job, now)),
        )
        .await;

        let mut fired = Vec::new();
        for result in results {
            let instance = result?;
            self.record(instance.clone())?;
            fired.push(instance);
        }
        Ok(fired)
    }

    async fn fire_one(
        &self,
        name: String,
        frozen: bool,
        job: Arc<dyn Job>,
        now: DateTime<Utc>,
    ) -> Result<RecurringTaskInstance> {
        let mut log = InstanceLog::new();
        let status = if frozen {
            log.log("task frozen, fire suppressed");
            InstanceStatus::Skipped
        } else {
            match self.single_flight.acquire(&name).await? {
                None => {
                    log.log("another instance holds the single-flight lock");
                    InstanceStatus::Skipped
                }
                Some(token) => {
                    let status = match job.run(&mut log).await {
                        Ok(()) => InstanceStatus::Succeeded,
                        Err(e) => {
                            log.log(format!("job failed: {e}"));
                            InstanceStatus::Failed
                        }
                    };
                    self.single_flight.release(&name, &token).await?;
                    status
                }
            }
        };

        metrics::record_recurring_run(
            &name,
            match status {
                InstanceStatus::Succeeded => "succeeded",
                InstanceStatus::Failed => "failed",
                InstanceStatus::Skipped => "skipped",
            },
        );
        Ok(RecurringTaskInstance {
            run_id: InstanceId::generate(),
            task: name,
            fired_at: now,
            status,
            logs: log.lines().to_vec(),
        })
    }
}
