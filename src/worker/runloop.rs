//! The worker loop. Runs its steps in order, cycle after cycle, until the
//! wall-clock or idle budget is spent.
//!
//! One cycle:
//! 1. Each step in order: log activity, then populate (tables) or call
//!    (callables). Callable failures go to the error log.
//! 2. Clean up every namespace the steps touch (generic errors, autoclear
//!    patterns, stale reservations).
//! 3. Prune the activity and error logs.
//!
//! A failed cycle is logged and counted as idle; it never ends the loop.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value, json};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{IdlePolicy, WorkerConfig};
use crate::error::{Result, StepError};
use crate::fingerprint::key_hash;
use crate::notify::{NotificationHub, NotifyStatus, StepEvent};
use crate::queue::{JobKey, JobQueue};
use crate::store::{ActivityRecord, ErrorRecord, LedgerStore, Origin};
use crate::worker::cleanup::{clean_up_namespace, purge_invalid_jobs};
use crate::worker::naming::PrefixStripper;
use crate::worker::registration::{build_registration, register};
use crate::worker::state::WorkerState;
use crate::worker::step::{ProcessStep, StepArgs, StepFailure, StepKind};

/// Supervises a fixed sequence of steps.
pub struct WorkerLoop {
    config: WorkerConfig,
    ledger: Arc<dyn LedgerStore>,
    notifications: NotificationHub,
    stripper: PrefixStripper,
    origin: Origin,
    steps: Vec<ProcessStep>,
    /// One queue per namespace touched by a table step, first-seen order.
    queues: Vec<Arc<dyn JobQueue>>,
    registered: bool,
    state: WorkerState,
    run_start: Option<Instant>,
    idled_cycle_count: u32,
}

impl WorkerLoop {
    /// Create a worker. Deprecated settings are folded in here.
    pub fn new(config: WorkerConfig, ledger: Arc<dyn LedgerStore>) -> Result<Self> {
        let config = config.normalize();
        let stripper = PrefixStripper::new(&config.namespace_prefixes)?;
        Ok(Self {
            config,
            ledger,
            notifications: NotificationHub::default(),
            stripper,
            origin: Origin::current(),
            steps: Vec::new(),
            queues: Vec::new(),
            registered: false,
            state: WorkerState::Idle,
            run_start: None,
            idled_cycle_count: 0,
        })
    }

    pub fn with_notifications(mut self, notifications: NotificationHub) -> Self {
        self.notifications = notifications;
        self
    }

    pub fn notifications_mut(&mut self) -> &mut NotificationHub {
        &mut self.notifications
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn steps(&self) -> &[ProcessStep] {
        &self.steps
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn idled_cycle_count(&self) -> u32 {
        self.idled_cycle_count
    }

    /// Process name the ledger uses for `step`.
    pub fn process_name(&self, step: &ProcessStep) -> String {
        step.process_name(&self.stripper)
    }

    /// Add a step at `position` (default: the end).
    ///
    /// Tables must support incremental populate. A table without a schema
    /// is skipped without error.
    pub fn add_step(
        &mut self,
        target: impl Into<StepKind>,
        position: Option<usize>,
        invocation_args: StepArgs,
    ) -> Result<()> {
        let kind = target.into();

        if let StepKind::Queryable(job) = &kind {
            if !job.is_auto_populated() {
                return Err(StepError::InvalidStep {
                    table: job.full_table_name().to_string(),
                }
                .into());
            }
            if job.schema_name().is_none_or(str::is_empty) {
                debug!(table = job.full_table_name(), "Table has no schema, step skipped");
                return Ok(());
            }
            let queue = job.jobs();
            if !self.queues.iter().any(|q| q.namespace() == queue.namespace()) {
                self.queues.push(queue);
            }
        }

        let index = position.unwrap_or(self.steps.len()).min(self.steps.len());
        self.steps.insert(
            index,
            ProcessStep {
                kind,
                invocation_args,
                position: index,
            },
        );
        for (i, step) in self.steps.iter_mut().enumerate() {
            step.position = i;
        }
        self.registered = false;
        Ok(())
    }

    /// Register the current step list unless this exact configuration is
    /// already registered.
    pub async fn register_worker(&mut self) -> Result<()> {
        if self.registered {
            return Ok(());
        }
        let registration = build_registration(&self.config, &self.steps, &self.stripper)?;
        register(self.ledger.as_ref(), &registration).await?;
        self.registered = true;
        Ok(())
    }

    /// Run all steps once, then clean up and prune. Returns the number of
    /// jobs that reached success or error.
    pub async fn run_once(&self) -> Result<usize> {
        let mut processed = 0;

        for step in &self.steps {
            let process = self.process_name(step);
            self.ledger
                .log_activity(&ActivityRecord {
                    timestamp: Utc::now(),
                    process_name: process.clone(),
                    worker_name: self.config.name.clone(),
                    host: self.origin.host.clone(),
                    user: self.origin.user.clone(),
                    pid: self.origin.pid,
                })
                .await?;
            self.emit(&process, NotifyStatus::Start, None, None).await;

            match &step.kind {
                StepKind::Queryable(job) => {
                    let settings = populate_settings(self.config.display_progress, &step.invocation_args);
                    let outcome = job.populate(&settings).await?;
                    processed += outcome.processed();
                    debug!(
                        worker = %self.config.name,
                        process = %process,
                        success = outcome.success_count,
                        errors = outcome.errors.len(),
                        "Populate finished"
                    );
                    if outcome.success_count > 0 {
                        self.emit(&process, NotifyStatus::Success, None, None).await;
                    }
                    for (key, message) in &outcome.errors {
                        self.emit(&process, NotifyStatus::Error, Some(key), Some(message.as_str()))
                            .await;
                    }
                }
                StepKind::Callable(f) => match f.call(&step.invocation_args).await {
                    Ok(()) => self.emit(&process, NotifyStatus::Success, None, None).await,
                    Err(failure) => self.record_failure(&process, failure).await?,
                },
            }
        }

        for queue in &self.queues {
            clean_up_namespace(
                queue.as_ref(),
                self.ledger.as_ref(),
                &self.config.autoclear_error_patterns,
                &self.stripper,
                self.config.stale_timeout_hours,
            )
            .await?;
        }

        let days = self.config.log_retention_days;
        let pruned = self.ledger.prune_activity(days).await? + self.ledger.prune_errors(days).await?;
        if pruned > 0 {
            debug!(worker = %self.config.name, count = pruned, "Pruned ledger");
        }

        Ok(processed)
    }

    /// Log a callable's failure to the error log.
    async fn record_failure(&self, process: &str, failure: StepFailure) -> Result<()> {
        let error_message = failure.error_message();
        let key = failure.key.unwrap_or_else(error_time_key);
        warn!(
            worker = %self.config.name,
            process,
            error = %error_message,
            "Step failed"
        );

        self.ledger
            .upsert_error(&ErrorRecord {
                process_name: process.to_string(),
                key_fingerprint: key_hash(&key),
                timestamp: Utc::now(),
                key: Value::Object(key.clone()).to_string(),
                error_message: error_message.clone(),
                error_stack: failure.stack,
                host: self.origin.host.clone(),
                user: self.origin.user.clone(),
                pid: self.origin.pid,
            })
            .await?;

        self.emit(process, NotifyStatus::Error, Some(&key), Some(error_message.as_str()))
            .await;
        Ok(())
    }

    async fn emit(
        &self,
        process: &str,
        status: NotifyStatus,
        key: Option<&JobKey>,
        error_message: Option<&str>,
    ) {
        self.notifications
            .emit(StepEvent {
                worker_name: &self.config.name,
                process,
                status,
                key,
                error_message,
            })
            .await;
    }

    /// Whether another cycle should run.
    pub fn keep_running(&self) -> bool {
        let exceeded_run_duration = match (self.config.run_duration, self.run_start) {
            (Some(limit), Some(start)) => start.elapsed() >= limit,
            _ => false,
        };
        let exceeded_idle = self
            .config
            .idle_budget()
            .is_some_and(|max| self.idled_cycle_count > max);
        !(exceeded_run_duration || exceeded_idle)
    }

    /// Register, then run cycles until a limit is reached, then purge
    /// invalid jobs.
    ///
    /// Only registration failures are returned; cycle failures are logged.
    pub async fn run(&mut self) -> Result<()> {
        self.register_worker().await?;

        if self.state.is_terminal() {
            self.state = WorkerState::Idle;
        }
        self.transition(WorkerState::Running);
        self.run_start = Some(Instant::now());
        self.idled_cycle_count = 0;
        info!(worker = %self.config.name, steps = self.steps.len(), "Starting worker");

        loop {
            match self.run_once().await {
                Ok(0) => self.idled_cycle_count += 1,
                Ok(processed) => {
                    if self.config.idle_policy == IdlePolicy::ResetOnSuccess {
                        self.idled_cycle_count = 0;
                    }
                    debug!(worker = %self.config.name, count = processed, "Cycle processed jobs");
                }
                Err(e) => {
                    error!(worker = %self.config.name, error = %e, "Worker cycle failed");
                    self.idled_cycle_count += 1;
                }
            }

            if !self.keep_running() {
                break;
            }
            tokio::time::sleep(self.config.sleep_duration).await;
        }

        self.transition(WorkerState::Stopping);
        self.purge_invalid_jobs().await;
        self.transition(WorkerState::Stopped);
        info!(
            worker = %self.config.name,
            idle_cycles = self.idled_cycle_count,
            "Stopping worker"
        );
        Ok(())
    }

    /// Purge invalid jobs of every table step. Failures are logged.
    async fn purge_invalid_jobs(&self) -> usize {
        let mut total = 0;
        for job in self.steps.iter().filter_map(ProcessStep::as_queryable) {
            let queue = job.jobs();
            match purge_invalid_jobs(queue.as_ref(), job.as_ref()).await {
                Ok(removed) => total += removed,
                Err(e) => warn!(
                    worker = %self.config.name,
                    table = job.full_table_name(),
                    error = %e,
                    "Invalid job purge failed"
                ),
            }
        }
        total
    }

    fn transition(&mut self, next: WorkerState) {
        if self.state.can_transition_to(next) {
            self.state = next;
        } else {
            warn!(worker = %self.config.name, from = %self.state, to = %next, "Invalid state transition");
        }
    }
}

/// Populate settings: worker defaults overlaid with the step's own args.
fn populate_settings(display_progress: bool, args: &StepArgs) -> Map<String, Value> {
    let mut settings = Map::new();
    settings.insert("display_progress".into(), json!(display_progress));
    settings.insert("reserve_jobs".into(), json!(true));
    settings.insert("suppress_errors".into(), json!(true));
    for (k, v) in args {
        settings.insert(k.clone(), v.clone());
    }
    settings
}

/// Key recorded for failures that carry no key of their own.
fn error_time_key() -> JobKey {
    let mut key = JobKey::new();
    key.insert(
        "error_time".into(),
        json!(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
    );
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlLedger;
    use crate::worker::step::{FnStep, StepFn};
    use std::time::Duration;

    async fn worker(config: WorkerConfig) -> WorkerLoop {
        let ledger = Arc::new(LibSqlLedger::new_memory().await.unwrap());
        WorkerLoop::new(config, ledger).unwrap()
    }

    fn noop(name: &str) -> StepKind {
        let step: Arc<dyn StepFn> = Arc::new(FnStep::new(name, |_args: StepArgs| async { Ok(()) }));
        StepKind::Callable(step)
    }

    #[test]
    fn populate_settings_overlay_args() {
        let args = json!({"reserve_jobs": false, "limit": 5}).as_object().cloned().unwrap();
        let settings = populate_settings(true, &args);
        assert_eq!(settings["display_progress"], true);
        assert_eq!(settings["reserve_jobs"], false);
        assert_eq!(settings["suppress_errors"], true);
        assert_eq!(settings["limit"], 5);
    }

    #[test]
    fn error_time_key_has_single_field() {
        let key = error_time_key();
        assert_eq!(key.len(), 1);
        assert!(key["error_time"].as_str().unwrap().ends_with('Z'));
    }

    #[tokio::test]
    async fn add_step_respects_position() {
        let mut w = worker(WorkerConfig::default()).await;
        w.add_step(noop("a"), None, StepArgs::new()).unwrap();
        w.add_step(noop("c"), None, StepArgs::new()).unwrap();
        w.add_step(noop("b"), Some(1), StepArgs::new()).unwrap();
        w.add_step(noop("z"), Some(99), StepArgs::new()).unwrap();

        let names: Vec<String> = w.steps().iter().map(|s| w.process_name(s)).collect();
        assert_eq!(names, ["a", "b", "c", "z"]);
        let positions: Vec<usize> = w.steps().iter().map(|s| s.position).collect();
        assert_eq!(positions, [0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn add_step_resets_registration() {
        let mut w = worker(WorkerConfig::default()).await;
        w.add_step(noop("a"), None, StepArgs::new()).unwrap();
        w.register_worker().await.unwrap();
        assert!(w.is_registered());

        w.add_step(noop("b"), None, StepArgs::new()).unwrap();
        assert!(!w.is_registered());
    }

    #[tokio::test]
    async fn invalid_prefix_fails_construction() {
        let ledger = Arc::new(LibSqlLedger::new_memory().await.unwrap());
        let config = WorkerConfig {
            namespace_prefixes: vec!["[".into()],
            ..WorkerConfig::default()
        };
        assert!(WorkerLoop::new(config, ledger).is_err());
    }

    #[tokio::test]
    async fn keep_running_idle_budget() {
        let mut w = worker(WorkerConfig {
            max_idled_cycle: Some(2),
            ..WorkerConfig::default()
        })
        .await;
        w.idled_cycle_count = 2;
        assert!(w.keep_running());
        w.idled_cycle_count = 3;
        assert!(!w.keep_running());
    }

    #[tokio::test(start_paused = true)]
    async fn keep_running_run_duration() {
        let mut w = worker(WorkerConfig {
            run_duration: Some(Duration::from_secs(10)),
            ..WorkerConfig::default()
        })
        .await;
        w.run_start = Some(Instant::now());
        assert!(w.keep_running());
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!w.keep_running());
    }

    #[tokio::test]
    async fn unbounded_without_limits() {
        let mut w = worker(WorkerConfig::default()).await;
        w.run_start = Some(Instant::now());
        w.idled_cycle_count = 1_000;
        assert!(w.keep_running());
    }

    #[tokio::test(start_paused = true)]
    async fn run_moves_through_states() {
        let mut w = worker(WorkerConfig {
            run_duration: Some(Duration::ZERO),
            ..WorkerConfig::default()
        })
        .await;
        assert_eq!(w.state(), WorkerState::Idle);
        w.run().await.unwrap();
        assert_eq!(w.state(), WorkerState::Stopped);
        assert_eq!(w.idled_cycle_count(), 1);
    }
}
