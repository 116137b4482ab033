//! Task scheduler: triggers, per-task timeouts, fixed-delay retries and
//! auto-disable after repeated failure.
//!
//! One coordinating loop ticks at the configured poll interval and launches
//! every due task as its own tokio task. The task map and the running set
//! are only mutated by that loop, by the execution completion handler and by
//! the explicit management calls; readers get snapshots.
//!
//! Lock order is `tasks` before `running` before `executions`.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use citeflow_shared::{
    CiteflowError, Result, RunStatus, SchedulerConfig, TaskDefinition, TaskState, TriggerKind,
};
use citeflow_storage::Store;

use crate::notify::{self, LogNotifier, Notification, NotificationStatus, Notifier};
use crate::pipeline::{CANCEL_GRACE, Orchestrator, SilentProgress};
use crate::report::StageOutcome;
use crate::stages::Stage;
use crate::trigger::Trigger;

/// Snapshot of one task as returned by [`Scheduler::snapshot`].
pub type TaskStatus = TaskState;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of "now" for due-time decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        self.millis.store(to.timestamp_millis(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: chrono::Duration) {
        self.millis.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst))
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// What a scheduled task invokes.
#[async_trait]
pub trait TaskAction: Send + Sync {
    /// Run once. `cancel` fires on scheduler stop, task removal or timeout.
    /// The returned value becomes the success notification payload.
    async fn run(&self, cancel: CancellationToken) -> Result<serde_json::Value>;

    /// Shown in task state, e.g. `stage:data_quality` or `pipeline`.
    fn describe(&self) -> String;
}

/// Runs one orchestrator stage. Fails unless the run completes.
pub struct StageAction {
    orchestrator: Arc<Orchestrator>,
    stage: Stage,
}

impl StageAction {
    pub fn new(orchestrator: Arc<Orchestrator>, stage: Stage) -> Self {
        Self {
            orchestrator,
            stage,
        }
    }
}

#[async_trait]
impl TaskAction for StageAction {
    async fn run(&self, cancel: CancellationToken) -> Result<serde_json::Value> {
        let run = self.orchestrator.run_stage_until(self.stage, &cancel).await;
        match run.status() {
            RunStatus::Completed => Ok(serde_json::json!(StageOutcome::from(&run))),
            RunStatus::Cancelled => Err(CiteflowError::Cancelled(format!(
                "{} run {} cancelled",
                self.stage,
                run.id()
            ))),
            _ => Err(CiteflowError::Stage(format!(
                "{} run {} failed: {}",
                self.stage,
                run.id(),
                run.error().unwrap_or("unknown error")
            ))),
        }
    }

    fn describe(&self) -> String {
        format!("stage:{}", self.stage)
    }
}

/// Runs the whole pipeline. Fails only if every stage failed.
pub struct PipelineAction {
    orchestrator: Arc<Orchestrator>,
}

impl PipelineAction {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl TaskAction for PipelineAction {
    async fn run(&self, cancel: CancellationToken) -> Result<serde_json::Value> {
        let report = self
            .orchestrator
            .run_all_until(&SilentProgress, &cancel)
            .await;

        if cancel.is_cancelled() {
            return Err(CiteflowError::Cancelled("pipeline cancelled".into()));
        }
        if report.all_failed() {
            let errors: Vec<String> = report
                .outcomes
                .iter()
                .map(|o| format!("{}: {}", o.stage, o.error.as_deref().unwrap_or("unknown")))
                .collect();
            return Err(CiteflowError::Stage(format!(
                "every pipeline stage failed ({})",
                errors.join("; ")
            )));
        }

        let recommendations: Vec<String> =
            report.recommendations.iter().map(|r| r.to_string()).collect();
        Ok(serde_json::json!({
            "outcomes": report.outcomes,
            "totals": report.totals,
            "recommendations": recommendations,
        }))
    }

    fn describe(&self) -> String {
        "pipeline".into()
    }
}

/// Resolve a task definition's `action` string (`pipeline` or `stage:<name>`).
pub fn action_from_name(
    name: &str,
    orchestrator: &Arc<Orchestrator>,
) -> Result<Arc<dyn TaskAction>> {
    if name == "pipeline" {
        return Ok(Arc::new(PipelineAction::new(orchestrator.clone())));
    }
    match name.strip_prefix("stage:") {
        Some(stage) => Ok(Arc::new(StageAction::new(
            orchestrator.clone(),
            stage.parse()?,
        ))),
        None => Err(CiteflowError::config(format!(
            "unknown task action '{name}' (expected 'pipeline' or 'stage:<name>')"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationPolicy {
    pub on_success: bool,
    pub on_failure: bool,
}

impl Default for NotificationPolicy {
    fn default() -> Self {
        Self {
            on_success: false,
            on_failure: true,
        }
    }
}

/// A schedulable unit owned by the [`Scheduler`].
pub struct ScheduledTask {
    id: String,
    trigger: Trigger,
    action: Arc<dyn TaskAction>,
    enabled: bool,
    max_failures: u32,
    timeout: Duration,
    retry_delay: Duration,
    notify: NotificationPolicy,
    last_run: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
    run_count: u64,
    failure_count: u32,
    last_error: Option<String>,
}

impl ScheduledTask {
    /// An enabled task with the default scheduler limits.
    pub fn new(id: impl Into<String>, trigger: Trigger, action: Arc<dyn TaskAction>) -> Self {
        let defaults = SchedulerConfig::default();
        Self {
            id: id.into(),
            trigger,
            action,
            enabled: true,
            max_failures: defaults.default_max_failures.max(1),
            timeout: defaults.default_timeout,
            retry_delay: defaults.default_retry_delay,
            notify: NotificationPolicy::default(),
            last_run: None,
            next_run: None,
            run_count: 0,
            failure_count: 0,
            last_error: None,
        }
    }

    /// Build a task from a `[[tasks]]` entry, filling unset limits from `defaults`.
    pub fn from_definition(
        def: &TaskDefinition,
        defaults: &SchedulerConfig,
        action: Arc<dyn TaskAction>,
    ) -> Result<Self> {
        let kind: TriggerKind = def.trigger.parse()?;
        let trigger = Trigger::parse(kind, &def.schedule).map_err(|e| {
            CiteflowError::schedule(format!("task '{}': {e}", def.id))
        })?;

        let mut task = Self::new(def.id.clone(), trigger, action)
            .with_max_failures(def.max_failures.unwrap_or(defaults.default_max_failures))
            .with_timeout(
                def.timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.default_timeout),
            )
            .with_retry_delay(
                def.retry_delay_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.default_retry_delay),
            )
            .with_notification_policy(NotificationPolicy {
                on_success: def.notify_on_success,
                on_failure: def.notify_on_failure,
            });
        task.enabled = def.enabled;
        Ok(task)
    }

    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_notification_policy(mut self, policy: NotificationPolicy) -> Self {
        self.notify = policy;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run.is_some_and(|at| at <= now)
    }

    fn state(&self, running: bool, now: DateTime<Utc>) -> TaskState {
        TaskState {
            id: self.id.clone(),
            action: self.action.describe(),
            trigger_kind: self.trigger.kind(),
            trigger_expr: self.trigger.expression(),
            enabled: self.enabled,
            running,
            last_run: self.last_run,
            next_run: self.next_run,
            run_count: self.run_count,
            failure_count: self.failure_count,
            max_failures: self.max_failures,
            last_error: self.last_error.clone(),
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

/// Result of one task execution, as returned by [`Scheduler::run_now`].
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Consecutive failures after this execution.
    pub failure_count: u32,
    /// Whether the task is disabled after this execution.
    pub disabled: bool,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Succeeded
    }
}

enum Execution {
    Succeeded(serde_json::Value),
    Failed(String),
    TimedOut(Duration),
    Cancelled,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Cheap to clone; clones share the same task set.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    store: Option<Arc<dyn Store>>,
    tasks: RwLock<HashMap<String, ScheduledTask>>,
    /// Task id → cancellation token of its in-flight execution.
    running: Mutex<HashMap<String, CancellationToken>>,
    executions: Mutex<Vec<JoinHandle<()>>>,
    is_running: AtomicBool,
    coordinator: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

pub struct SchedulerBuilder {
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    store: Option<Arc<dyn Store>>,
}

impl SchedulerBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Persist task state snapshots after every launch and completion.
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Scheduler {
        Scheduler {
            inner: Arc::new(Inner {
                config: self.config,
                clock: self.clock,
                notifier: self.notifier,
                store: self.store,
                tasks: RwLock::new(HashMap::new()),
                running: Mutex::new(HashMap::new()),
                executions: Mutex::new(Vec::new()),
                is_running: AtomicBool::new(false),
                coordinator: Mutex::new(None),
            }),
        }
    }
}

impl Scheduler {
    /// System clock, log notifier, no persistence unless configured.
    pub fn builder(config: SchedulerConfig) -> SchedulerBuilder {
        SchedulerBuilder {
            config,
            clock: Arc::new(SystemClock),
            notifier: Arc::new(LogNotifier),
            store: None,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running.load(Ordering::SeqCst)
    }

    // --- Task management ---------------------------------------------------

    pub async fn add_task(&self, mut task: ScheduledTask) -> Result<()> {
        let now = self.inner.clock.now();
        let state = {
            let mut tasks = self.inner.tasks.write().await;
            if tasks.contains_key(&task.id) {
                return Err(CiteflowError::validation(format!(
                    "task '{}' already exists",
                    task.id
                )));
            }
            if task.enabled {
                task.next_run = task.trigger.initial_run(now);
            }
            info!(
                task_id = %task.id,
                trigger = %task.trigger,
                enabled = task.enabled,
                next_run = ?task.next_run,
                "task added"
            );
            let state = task.state(false, now);
            tasks.insert(task.id.clone(), task);
            state
        };
        self.inner.save(&state).await;
        Ok(())
    }

    /// Register every `[[tasks]]` entry against `orchestrator`.
    pub async fn add_definitions(
        &self,
        definitions: &[TaskDefinition],
        orchestrator: &Arc<Orchestrator>,
    ) -> Result<()> {
        for def in definitions {
            let action = action_from_name(&def.action, orchestrator)?;
            let task = ScheduledTask::from_definition(def, &self.inner.config, action)?;
            self.add_task(task).await?;
        }
        Ok(())
    }

    /// Carry persisted counters over to registered tasks with the same id.
    ///
    /// A task whose restored failure count already reached its limit stays
    /// disabled. Returns how many tasks were restored.
    pub async fn restore(&self, states: &[TaskState]) -> usize {
        let mut tasks = self.inner.tasks.write().await;
        let mut restored = 0;
        for state in states {
            let Some(task) = tasks.get_mut(&state.id) else {
                debug!(task_id = %state.id, "persisted state has no registered task");
                continue;
            };
            task.last_run = state.last_run;
            task.run_count = state.run_count;
            task.failure_count = state.failure_count;
            task.last_error = state.last_error.clone();
            if task.failure_count >= task.max_failures {
                task.enabled = false;
                task.next_run = None;
            } else if task.enabled && state.next_run.is_some() {
                // keeps a pending retry delay or cron slot across restarts
                task.next_run = state.next_run;
            }
            restored += 1;
        }
        if restored > 0 {
            info!(restored, "restored persisted task state");
        }
        restored
    }

    /// Remove a task, cancelling its in-flight execution if any.
    pub async fn remove_task(&self, id: &str) -> Result<()> {
        let mut tasks = self.inner.tasks.write().await;
        let running = self.inner.running.lock().await;
        if tasks.remove(id).is_none() {
            return Err(CiteflowError::TaskNotFound(id.to_string()));
        }
        if let Some(token) = running.get(id) {
            token.cancel();
        }
        info!(task_id = %id, "task removed");
        Ok(())
    }

    /// Enable a task and clear its failure count.
    pub async fn enable_task(&self, id: &str) -> Result<()> {
        let now = self.inner.clock.now();
        let state = {
            let mut tasks = self.inner.tasks.write().await;
            let running = self.inner.running.lock().await;
            let task = tasks
                .get_mut(id)
                .ok_or_else(|| CiteflowError::TaskNotFound(id.to_string()))?;
            task.enabled = true;
            task.failure_count = 0;
            if task.next_run.is_none() {
                task.next_run = task.trigger.initial_run(now);
            }
            info!(task_id = %id, next_run = ?task.next_run, "task enabled");
            task.state(running.contains_key(id), now)
        };
        self.inner.save(&state).await;
        Ok(())
    }

    /// Disable a task. An in-flight execution is left to finish.
    pub async fn disable_task(&self, id: &str) -> Result<()> {
        let now = self.inner.clock.now();
        let state = {
            let mut tasks = self.inner.tasks.write().await;
            let running = self.inner.running.lock().await;
            let task = tasks
                .get_mut(id)
                .ok_or_else(|| CiteflowError::TaskNotFound(id.to_string()))?;
            task.enabled = false;
            info!(task_id = %id, "task disabled");
            task.state(running.contains_key(id), now)
        };
        self.inner.save(&state).await;
        Ok(())
    }

    // --- Snapshots ---------------------------------------------------------

    /// Cloned state of every task, sorted by id.
    pub async fn snapshot(&self) -> Vec<TaskStatus> {
        let now = self.inner.clock.now();
        let tasks = self.inner.tasks.read().await;
        let running = self.inner.running.lock().await;
        let mut states: Vec<TaskStatus> = tasks
            .values()
            .map(|t| t.state(running.contains_key(&t.id), now))
            .collect();
        states.sort_by(|a, b| a.id.cmp(&b.id));
        states
    }

    pub async fn task(&self, id: &str) -> Option<TaskStatus> {
        let now = self.inner.clock.now();
        let tasks = self.inner.tasks.read().await;
        let running = self.inner.running.lock().await;
        tasks
            .get(id)
            .map(|t| t.state(running.contains_key(id), now))
    }

    /// Ids of tasks with an execution in flight.
    pub async fn running_tasks(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.running.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    // --- Execution ---------------------------------------------------------

    /// Launch every enabled, idle task whose `next_run` has passed.
    /// Returns the launched ids.
    pub async fn tick(&self) -> Vec<String> {
        let now = self.inner.clock.now();
        let mut launched = Vec::new();
        let mut states = Vec::new();
        {
            let mut tasks = self.inner.tasks.write().await;
            let mut running = self.inner.running.lock().await;

            let mut due: Vec<String> = tasks
                .values()
                .filter(|t| t.is_due(now) && !running.contains_key(&t.id))
                .map(|t| t.id.clone())
                .collect();
            due.sort();

            for id in due {
                if let Some(task) = tasks.get_mut(&id) {
                    self.launch(task, now, &mut running, None).await;
                    states.push(task.state(true, now));
                    launched.push(id);
                }
            }
        }
        for state in &states {
            self.inner.save(state).await;
        }
        launched
    }

    /// Launch a task immediately and wait for its outcome.
    ///
    /// Works on disabled tasks too; fails if the task is already running.
    pub async fn run_now(&self, id: &str) -> Result<TaskOutcome> {
        let now = self.inner.clock.now();
        let (reply, state) = {
            let mut tasks = self.inner.tasks.write().await;
            let mut running = self.inner.running.lock().await;
            let task = tasks
                .get_mut(id)
                .ok_or_else(|| CiteflowError::TaskNotFound(id.to_string()))?;
            if running.contains_key(id) {
                return Err(CiteflowError::validation(format!(
                    "task '{id}' is already running"
                )));
            }
            let (tx, rx) = oneshot::channel();
            self.launch(task, now, &mut running, Some(tx)).await;
            (rx, task.state(true, now))
        };
        self.inner.save(&state).await;
        info!(task_id = %id, "manual run launched");

        reply
            .await
            .map_err(|_| CiteflowError::Cancelled(format!("task '{id}' execution was dropped")))
    }

    /// Record the launch on `task` and spawn its execution.
    async fn launch(
        &self,
        task: &mut ScheduledTask,
        now: DateTime<Utc>,
        running: &mut HashMap<String, CancellationToken>,
        reply: Option<oneshot::Sender<TaskOutcome>>,
    ) {
        task.last_run = Some(now);
        task.run_count += 1;
        task.next_run = task.trigger.next_after(now);

        let token = CancellationToken::new();
        running.insert(task.id.clone(), token.clone());
        debug!(task_id = %task.id, run_count = task.run_count, next_run = ?task.next_run, "launching task");

        let inner = self.inner.clone();
        let id = task.id.clone();
        let action = task.action.clone();
        let timeout = task.timeout;
        let handle = tokio::spawn(async move {
            let outcome = inner.execute(id, action, timeout, token, now).await;
            if let Some(reply) = reply {
                let _ = reply.send(outcome);
            }
        });

        let mut executions = self.inner.executions.lock().await;
        executions.retain(|h| !h.is_finished());
        executions.push(handle);
    }

    // --- Lifecycle ---------------------------------------------------------

    /// Start the coordinating loop. The first tick happens immediately.
    pub async fn start(&self) -> Result<()> {
        let mut coordinator = self.inner.coordinator.lock().await;
        if coordinator.is_some() {
            return Err(CiteflowError::validation("scheduler is already running"));
        }

        let token = CancellationToken::new();
        let poll = self.inner.config.poll_interval.max(Duration::from_millis(1));
        let scheduler = self.clone();
        let shutdown = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let launched = scheduler.tick().await;
                        if !launched.is_empty() {
                            debug!(?launched, "launched due tasks");
                        }
                    }
                }
            }
            debug!("coordinating loop exited");
        });

        *coordinator = Some((token, handle));
        self.inner.is_running.store(true, Ordering::SeqCst);
        info!(poll_interval = ?poll, "scheduler started");
        Ok(())
    }

    /// Stop the loop, cancel every in-flight execution and wait for them.
    pub async fn stop(&self) {
        self.inner.is_running.store(false, Ordering::SeqCst);

        let coordinator = self.inner.coordinator.lock().await.take();
        if let Some((token, handle)) = coordinator {
            token.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "coordinating loop ended abnormally");
            }
        }

        let in_flight = {
            let running = self.inner.running.lock().await;
            for token in running.values() {
                token.cancel();
            }
            running.len()
        };

        let executions = std::mem::take(&mut *self.inner.executions.lock().await);
        for result in join_all(executions).await {
            if let Err(e) = result {
                warn!(error = %e, "task execution ended abnormally");
            }
        }

        self.inner.running.lock().await.clear();
        info!(cancelled = in_flight, "scheduler stopped");
    }
}

impl Inner {
    #[instrument(skip_all, fields(task_id = %id))]
    async fn execute(
        self: Arc<Self>,
        id: String,
        action: Arc<dyn TaskAction>,
        timeout: Duration,
        token: CancellationToken,
        started_at: DateTime<Utc>,
    ) -> TaskOutcome {
        info!(action = %action.describe(), "task started");
        let execution = run_guarded(action.as_ref(), timeout, &token).await;
        self.complete(&id, execution, started_at).await
    }

    /// Apply an execution result to the task and notify.
    async fn complete(
        &self,
        id: &str,
        execution: Execution,
        started_at: DateTime<Utc>,
    ) -> TaskOutcome {
        let finished_at = self.clock.now();
        let mut notification = None;

        let (status, payload, error) = match execution {
            Execution::Succeeded(payload) => (ExecutionStatus::Succeeded, payload, None),
            Execution::Failed(message) => {
                (ExecutionStatus::Failed, serde_json::Value::Null, Some(message))
            }
            Execution::TimedOut(after) => (
                ExecutionStatus::TimedOut,
                serde_json::Value::Null,
                Some(format!("timed out after {after:?}")),
            ),
            Execution::Cancelled => (
                ExecutionStatus::Cancelled,
                serde_json::Value::Null,
                Some("cancelled".to_string()),
            ),
        };

        let mut outcome = TaskOutcome {
            task_id: id.to_string(),
            status,
            started_at,
            finished_at,
            payload,
            error,
            failure_count: 0,
            disabled: false,
        };

        let state = {
            let mut tasks = self.tasks.write().await;
            let mut running = self.running.lock().await;
            running.remove(id);

            match tasks.get_mut(id) {
                None => {
                    debug!("task was removed while running");
                    None
                }
                Some(task) => {
                    match status {
                        ExecutionStatus::Succeeded => {
                            task.failure_count = 0;
                            task.last_error = None;
                            info!(run_count = task.run_count, "task succeeded");
                            if task.notify.on_success {
                                notification = Some(Notification::new(
                                    id,
                                    NotificationStatus::Success,
                                    serde_json::json!({
                                        "run_count": task.run_count,
                                        "result": outcome.payload.clone(),
                                    }),
                                ));
                            }
                        }
                        ExecutionStatus::Cancelled => {
                            info!("task cancelled");
                        }
                        ExecutionStatus::Failed | ExecutionStatus::TimedOut => {
                            let message = outcome.error.clone().unwrap_or_default();
                            task.failure_count += 1;
                            task.last_error = Some(message.clone());
                            let payload = serde_json::json!({
                                "error": message,
                                "failure_count": task.failure_count,
                                "max_failures": task.max_failures,
                            });

                            if task.failure_count >= task.max_failures {
                                task.enabled = false;
                                task.next_run = None;
                                error!(
                                    failure_count = task.failure_count,
                                    error = %message,
                                    "task disabled after repeated failures"
                                );
                                notification = Some(Notification::new(
                                    id,
                                    NotificationStatus::CriticalFailure,
                                    payload,
                                ));
                            } else {
                                task.next_run = chrono::Duration::from_std(task.retry_delay)
                                    .ok()
                                    .and_then(|delay| finished_at.checked_add_signed(delay));
                                warn!(
                                    failure_count = task.failure_count,
                                    retry_at = ?task.next_run,
                                    error = %message,
                                    "task failed, retry scheduled"
                                );
                                if task.notify.on_failure {
                                    notification = Some(Notification::new(
                                        id,
                                        NotificationStatus::Failure,
                                        payload,
                                    ));
                                }
                            }
                        }
                    }
                    outcome.failure_count = task.failure_count;
                    outcome.disabled = !task.enabled;
                    Some(task.state(false, finished_at))
                }
            }
        };

        if let Some(state) = state {
            self.save(&state).await;
        }
        if let Some(notification) = notification {
            notify::dispatch(self.notifier.clone(), notification);
        }
        outcome
    }

    async fn save(&self, state: &TaskState) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_task_state(state).await {
                warn!(task_id = %state.id, error = %e, "failed to persist task state");
            }
        }
    }
}

/// Run `action` under `timeout`, honouring `token`. On timeout or
/// cancellation the action's own token fires and it gets [`CANCEL_GRACE`]
/// to wind down before it is dropped.
async fn run_guarded(
    action: &dyn TaskAction,
    timeout: Duration,
    token: &CancellationToken,
) -> Execution {
    let action_token = token.child_token();
    let mut run = AssertUnwindSafe(action.run(action_token.clone())).catch_unwind();

    tokio::select! {
        biased;
        _ = token.cancelled() => {
            wind_down(&mut run).await;
            Execution::Cancelled
        }
        result = tokio::time::timeout(timeout, &mut run) => match result {
            Ok(Ok(Ok(payload))) => Execution::Succeeded(payload),
            Ok(Ok(Err(CiteflowError::Cancelled(_)))) if token.is_cancelled() => Execution::Cancelled,
            Ok(Ok(Err(e))) => Execution::Failed(e.to_string()),
            Ok(Err(panic)) => {
                Execution::Failed(format!("task action panicked: {}", panic_message(&*panic)))
            }
            Err(_) => {
                action_token.cancel();
                wind_down(&mut run).await;
                Execution::TimedOut(timeout)
            }
        },
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

async fn wind_down<F: std::future::Future + Unpin>(run: F) {
    if tokio::time::timeout(CANCEL_GRACE, run).await.is_err() {
        warn!("task action ignored cancellation, dropping it");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use chrono::TimeZone;
    use citeflow_storage::MemoryStore;

    use crate::notify::RecordingNotifier;
    use crate::pipeline::test_support;

    // -----------------------------------------------------------------------
    // Test doubles
    // -----------------------------------------------------------------------

    enum Behavior {
        Succeeds,
        Fails,
        Sleeps(Duration),
        WaitsForCancel,
        Panics,
    }

    struct TestAction {
        behavior: Behavior,
        calls: AtomicUsize,
    }

    impl TestAction {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TaskAction for TestAction {
        async fn run(&self, cancel: CancellationToken) -> Result<serde_json::Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Succeeds => Ok(serde_json::json!({ "ok": true })),
                Behavior::Fails => Err(CiteflowError::Stage("upstream unavailable".into())),
                Behavior::Sleeps(d) => {
                    tokio::time::sleep(*d).await;
                    Ok(serde_json::Value::Null)
                }
                Behavior::WaitsForCancel => {
                    cancel.cancelled().await;
                    Err(CiteflowError::Cancelled("stopped".into()))
                }
                Behavior::Panics => panic!("action exploded"),
            }
        }

        fn describe(&self) -> String {
            "test".into()
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    struct Harness {
        scheduler: Scheduler,
        clock: Arc<ManualClock>,
        notifier: Arc<RecordingNotifier>,
        store: Arc<MemoryStore>,
    }

    fn harness() -> Harness {
        harness_at(t0())
    }

    fn harness_at(start: DateTime<Utc>) -> Harness {
        let clock = Arc::new(ManualClock::new(start));
        let notifier = Arc::new(RecordingNotifier::default());
        let store = Arc::new(MemoryStore::new());
        let scheduler = Scheduler::builder(SchedulerConfig::default())
            .clock(clock.clone())
            .notifier(notifier.clone())
            .store(store.clone())
            .build();
        Harness {
            scheduler,
            clock,
            notifier,
            store,
        }
    }

    fn interval(expr: &str) -> Trigger {
        Trigger::parse(TriggerKind::Interval, expr).unwrap()
    }

    async fn wait_idle(scheduler: &Scheduler) {
        while !scheduler.running_tasks().await.is_empty() {
            tokio::task::yield_now().await;
        }
    }

    async fn wait_for_call(action: &TestAction) {
        while action.calls() == 0 {
            tokio::task::yield_now().await;
        }
    }

    /// Let spawned notification deliveries run.
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    // -----------------------------------------------------------------------
    // Triggering
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn interval_task_next_run_after_one_run() {
        let h = harness();
        let action = TestAction::new(Behavior::Succeeds);
        h.scheduler
            .add_task(ScheduledTask::new("scores", interval("6h"), action.clone()))
            .await
            .unwrap();
        assert_eq!(h.scheduler.task("scores").await.unwrap().next_run, Some(t0()));

        assert_eq!(h.scheduler.tick().await, vec!["scores".to_string()]);
        wait_idle(&h.scheduler).await;

        let state = h.scheduler.task("scores").await.unwrap();
        assert_eq!(
            state.next_run,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 6, 0, 0).unwrap())
        );
        assert_eq!(state.last_run, Some(t0()));
        assert_eq!(state.run_count, 1);
        assert_eq!(state.failure_count, 0);
        assert_eq!(action.calls(), 1);

        // not due again until 06:00
        h.clock.advance(chrono::Duration::hours(5));
        assert!(h.scheduler.tick().await.is_empty());
        h.clock.advance(chrono::Duration::hours(1));
        assert_eq!(h.scheduler.tick().await.len(), 1);
        wait_idle(&h.scheduler).await;
        assert_eq!(action.calls(), 2);
    }

    #[tokio::test]
    async fn cron_task_runs_at_matching_minutes() {
        let h = harness_at(Utc.with_ymd_and_hms(2024, 3, 10, 5, 59, 0).unwrap());
        let trigger = Trigger::parse(TriggerKind::Cron, "0 6,18 * * *").unwrap();
        h.scheduler
            .add_task(ScheduledTask::new("quality", trigger, TestAction::new(Behavior::Succeeds)))
            .await
            .unwrap();

        let six = Utc.with_ymd_and_hms(2024, 3, 10, 6, 0, 0).unwrap();
        assert_eq!(h.scheduler.task("quality").await.unwrap().next_run, Some(six));
        assert!(h.scheduler.tick().await.is_empty());

        h.clock.set(six);
        assert_eq!(h.scheduler.tick().await.len(), 1);
        wait_idle(&h.scheduler).await;
        assert_eq!(
            h.scheduler.task("quality").await.unwrap().next_run,
            Some(Utc.with_ymd_and_hms(2024, 3, 10, 18, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn past_one_time_task_never_runs() {
        let h = harness();
        let trigger = Trigger::parse(TriggerKind::OneTime, "2023-12-31T00:00:00Z").unwrap();
        let action = TestAction::new(Behavior::Succeeds);
        h.scheduler
            .add_task(ScheduledTask::new("backfill", trigger, action.clone()))
            .await
            .unwrap();

        assert_eq!(h.scheduler.task("backfill").await.unwrap().next_run, None);
        h.clock.advance(chrono::Duration::days(30));
        assert!(h.scheduler.tick().await.is_empty());
        assert_eq!(action.calls(), 0);
    }

    #[tokio::test]
    async fn disabled_task_is_not_launched() {
        let h = harness();
        let action = TestAction::new(Behavior::Succeeds);
        h.scheduler
            .add_task(ScheduledTask::new("scores", interval("1h"), action.clone()).disabled())
            .await
            .unwrap();
        assert!(h.scheduler.tick().await.is_empty());

        h.scheduler.enable_task("scores").await.unwrap();
        assert_eq!(h.scheduler.tick().await.len(), 1);
        wait_idle(&h.scheduler).await;

        h.scheduler.disable_task("scores").await.unwrap();
        h.clock.advance(chrono::Duration::hours(2));
        assert!(h.scheduler.tick().await.is_empty());
        assert_eq!(action.calls(), 1);
    }

    // -----------------------------------------------------------------------
    // Failure handling
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn repeated_failures_disable_with_one_critical_notification() {
        let h = harness();
        h.scheduler
            .add_task(
                ScheduledTask::new("flaky", interval("1h"), TestAction::new(Behavior::Fails))
                    .with_max_failures(3)
                    .with_retry_delay(Duration::from_secs(300)),
            )
            .await
            .unwrap();

        let first = h.scheduler.run_now("flaky").await.unwrap();
        assert_eq!(first.status, ExecutionStatus::Failed);
        assert_eq!(first.failure_count, 1);
        assert!(!first.disabled);
        let state = h.scheduler.task("flaky").await.unwrap();
        assert!(state.enabled);
        assert_eq!(state.next_run, Some(t0() + chrono::Duration::minutes(5)));
        assert_eq!(state.last_error.as_deref(), Some("stage error: upstream unavailable"));

        h.scheduler.run_now("flaky").await.unwrap();
        let third = h.scheduler.run_now("flaky").await.unwrap();
        assert_eq!(third.failure_count, 3);
        assert!(third.disabled);

        let state = h.scheduler.task("flaky").await.unwrap();
        assert!(!state.enabled);
        assert!(state.failure_count >= state.max_failures);

        settle().await;
        assert_eq!(h.notifier.count(NotificationStatus::CriticalFailure), 1);
        assert_eq!(h.notifier.count(NotificationStatus::Failure), 2);

        h.clock.advance(chrono::Duration::days(1));
        assert!(h.scheduler.tick().await.is_empty());
    }

    #[tokio::test]
    async fn panicking_action_is_recorded_as_failure() {
        let h = harness();
        let action = TestAction::new(Behavior::Panics);
        h.scheduler
            .add_task(
                ScheduledTask::new("fragile", interval("1h"), action.clone())
                    .with_max_failures(2)
                    .with_retry_delay(Duration::from_secs(60)),
            )
            .await
            .unwrap();

        let outcome = h.scheduler.run_now("fragile").await.unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert_eq!(outcome.failure_count, 1);
        assert!(h.scheduler.running_tasks().await.is_empty());
        let state = h.scheduler.task("fragile").await.unwrap();
        assert!(!state.running);
        assert!(state.last_error.as_deref().unwrap().contains("action exploded"));

        // the scheduled path clears its running entry too
        h.clock.advance(chrono::Duration::minutes(1));
        assert_eq!(h.scheduler.tick().await, vec!["fragile".to_string()]);
        wait_idle(&h.scheduler).await;

        let state = h.scheduler.task("fragile").await.unwrap();
        assert_eq!(state.failure_count, 2);
        assert!(!state.enabled);
        assert_eq!(action.calls(), 2);
    }

    #[tokio::test]
    async fn enabling_resets_failure_count() {
        let h = harness();
        h.scheduler
            .add_task(
                ScheduledTask::new("flaky", interval("1h"), TestAction::new(Behavior::Fails))
                    .with_max_failures(1),
            )
            .await
            .unwrap();
        let outcome = h.scheduler.run_now("flaky").await.unwrap();
        assert!(outcome.disabled);

        h.scheduler.enable_task("flaky").await.unwrap();
        let state = h.scheduler.task("flaky").await.unwrap();
        assert!(state.enabled);
        assert_eq!(state.failure_count, 0);
        assert_eq!(state.next_run, Some(t0()));
    }

    #[tokio::test]
    async fn success_resets_failures_and_notifies_when_asked() {
        let h = harness();
        h.scheduler
            .add_task(
                ScheduledTask::new("daily", interval("1d"), TestAction::new(Behavior::Succeeds))
                    .with_notification_policy(NotificationPolicy {
                        on_success: true,
                        on_failure: false,
                    }),
            )
            .await
            .unwrap();

        let outcome = h.scheduler.run_now("daily").await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.payload["ok"], true);

        settle().await;
        assert_eq!(h.notifier.statuses(), vec![NotificationStatus::Success]);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_failure() {
        let h = harness();
        h.scheduler
            .add_task(
                ScheduledTask::new(
                    "slow",
                    interval("1h"),
                    TestAction::new(Behavior::Sleeps(Duration::from_secs(3600))),
                )
                .with_timeout(Duration::from_millis(50)),
            )
            .await
            .unwrap();

        let outcome = h.scheduler.run_now("slow").await.unwrap();
        assert_eq!(outcome.status, ExecutionStatus::TimedOut);
        assert_eq!(outcome.failure_count, 1);
        assert!(outcome.error.unwrap().contains("timed out"));
        assert!(h.scheduler.running_tasks().await.is_empty());
    }

    // -----------------------------------------------------------------------
    // Concurrency and lifecycle
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn running_task_is_never_relaunched() {
        let h = harness();
        let action = TestAction::new(Behavior::WaitsForCancel);
        h.scheduler
            .add_task(ScheduledTask::new("crawl", interval("1m"), action.clone()))
            .await
            .unwrap();

        assert_eq!(h.scheduler.tick().await.len(), 1);
        wait_for_call(&action).await;
        h.clock.advance(chrono::Duration::minutes(10));
        assert!(h.scheduler.tick().await.is_empty());
        let err = h.scheduler.run_now("crawl").await.unwrap_err();
        assert!(err.to_string().contains("already running"));
        assert!(h.scheduler.task("crawl").await.unwrap().running);

        h.scheduler.stop().await;
        assert!(h.scheduler.running_tasks().await.is_empty());
        let state = h.scheduler.task("crawl").await.unwrap();
        assert!(!state.running);
        assert_eq!(state.failure_count, 0);
        assert_eq!(action.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn start_launches_due_tasks_and_stop_cancels_them() {
        let h = harness();
        let action = TestAction::new(Behavior::WaitsForCancel);
        h.scheduler
            .add_task(ScheduledTask::new("crawl", interval("6h"), action.clone()))
            .await
            .unwrap();

        h.scheduler.start().await.unwrap();
        assert!(h.scheduler.is_running());
        assert!(h.scheduler.start().await.is_err());

        wait_for_call(&action).await;

        h.scheduler.stop().await;
        assert!(!h.scheduler.is_running());
        assert!(h.scheduler.running_tasks().await.is_empty());
        let state = h.scheduler.task("crawl").await.unwrap();
        assert_eq!(state.run_count, 1);
        assert_eq!(state.failure_count, 0);
        assert!(state.enabled);
        assert_eq!(action.calls(), 1);
    }

    #[tokio::test]
    async fn removing_a_running_task_cancels_it() {
        let h = harness();
        h.scheduler
            .add_task(ScheduledTask::new(
                "crawl",
                interval("1h"),
                TestAction::new(Behavior::WaitsForCancel),
            ))
            .await
            .unwrap();
        h.scheduler.tick().await;

        h.scheduler.remove_task("crawl").await.unwrap();
        wait_idle(&h.scheduler).await;
        assert!(h.scheduler.task("crawl").await.is_none());
        assert!(matches!(
            h.scheduler.run_now("crawl").await.unwrap_err(),
            CiteflowError::TaskNotFound(_)
        ));
        assert!(matches!(
            h.scheduler.remove_task("crawl").await.unwrap_err(),
            CiteflowError::TaskNotFound(_)
        ));
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let h = harness();
        let task = || ScheduledTask::new("a", interval("1h"), TestAction::new(Behavior::Succeeds));
        h.scheduler.add_task(task()).await.unwrap();
        assert!(h.scheduler.add_task(task()).await.is_err());
    }

    #[tokio::test]
    async fn task_state_is_persisted() {
        let h = harness();
        h.scheduler
            .add_task(ScheduledTask::new("daily", interval("1d"), TestAction::new(Behavior::Succeeds)))
            .await
            .unwrap();
        h.scheduler.run_now("daily").await.unwrap();

        let states = h.store.list_task_states().await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].id, "daily");
        assert_eq!(states[0].run_count, 1);
        assert!(!states[0].running);
        assert_eq!(states[0].trigger_expr, "1d");
    }

    #[tokio::test]
    async fn restore_keeps_exhausted_tasks_disabled() {
        let h = harness();
        for id in ["healthy", "exhausted"] {
            h.scheduler
                .add_task(
                    ScheduledTask::new(id, interval("1h"), TestAction::new(Behavior::Succeeds))
                        .with_max_failures(2),
                )
                .await
                .unwrap();
        }

        let mut healthy = h.scheduler.task("healthy").await.unwrap();
        healthy.run_count = 7;
        healthy.failure_count = 1;
        let mut exhausted = h.scheduler.task("exhausted").await.unwrap();
        exhausted.failure_count = 2;
        exhausted.last_error = Some("boom".into());
        let mut orphan = healthy.clone();
        orphan.id = "gone".into();

        assert_eq!(h.scheduler.restore(&[healthy, exhausted, orphan]).await, 2);

        let healthy = h.scheduler.task("healthy").await.unwrap();
        assert_eq!(healthy.run_count, 7);
        assert!(healthy.enabled);
        let exhausted = h.scheduler.task("exhausted").await.unwrap();
        assert!(!exhausted.enabled);
        assert_eq!(exhausted.next_run, None);
        assert_eq!(h.scheduler.tick().await, vec!["healthy".to_string()]);
    }

    #[tokio::test]
    async fn restore_keeps_pending_retry_time() {
        let flaky = || {
            ScheduledTask::new("flaky", interval("6h"), TestAction::new(Behavior::Fails))
                .with_max_failures(3)
                .with_retry_delay(Duration::from_secs(3600))
        };
        let h = harness();
        h.scheduler.add_task(flaky()).await.unwrap();
        h.scheduler.run_now("flaky").await.unwrap();
        let retry_at = t0() + chrono::Duration::hours(1);
        assert_eq!(h.scheduler.task("flaky").await.unwrap().next_run, Some(retry_at));

        // restart ten minutes later
        let restarted = harness_at(t0() + chrono::Duration::minutes(10));
        restarted.scheduler.add_task(flaky()).await.unwrap();
        let states = h.store.list_task_states().await.unwrap();
        assert_eq!(restarted.scheduler.restore(&states).await, 1);

        let state = restarted.scheduler.task("flaky").await.unwrap();
        assert_eq!(state.next_run, Some(retry_at));
        assert_eq!(state.failure_count, 1);
        assert!(restarted.scheduler.tick().await.is_empty());

        restarted.clock.advance(chrono::Duration::minutes(50));
        assert_eq!(restarted.scheduler.tick().await, vec!["flaky".to_string()]);
        wait_idle(&restarted.scheduler).await;
    }

    #[tokio::test]
    async fn snapshot_is_sorted_and_detached() {
        let h = harness();
        for id in ["c", "a", "b"] {
            h.scheduler
                .add_task(ScheduledTask::new(id, interval("1h"), TestAction::new(Behavior::Succeeds)))
                .await
                .unwrap();
        }
        let mut snapshot = h.scheduler.snapshot().await;
        let ids: Vec<&str> = snapshot.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        snapshot[0].enabled = false;
        assert!(h.scheduler.task("a").await.unwrap().enabled);
    }

    // -----------------------------------------------------------------------
    // Definitions and orchestrator actions
    // -----------------------------------------------------------------------

    fn definition(action: &str, trigger: &str, schedule: &str) -> TaskDefinition {
        TaskDefinition {
            id: "t".into(),
            action: action.into(),
            trigger: trigger.into(),
            schedule: schedule.into(),
            enabled: true,
            max_failures: Some(5),
            timeout_secs: None,
            retry_delay_secs: Some(60),
            notify_on_success: true,
            notify_on_failure: true,
        }
    }

    #[test]
    fn definitions_are_validated() {
        let orch = Arc::new(test_support::orchestrator(Arc::new(MemoryStore::new())));
        let defaults = SchedulerConfig::default();

        let action = action_from_name("stage:data_quality", &orch).unwrap();
        assert_eq!(action.describe(), "stage:data_quality");
        assert_eq!(action_from_name("pipeline", &orch).unwrap().describe(), "pipeline");
        assert!(action_from_name("stage:bogus", &orch).is_err());
        assert!(action_from_name("email", &orch).is_err());

        let task = ScheduledTask::from_definition(
            &definition("pipeline", "cron", "0 2 * * 1"),
            &defaults,
            action.clone(),
        )
        .unwrap();
        assert_eq!(task.max_failures, 5);
        assert_eq!(task.retry_delay, Duration::from_secs(60));
        assert_eq!(task.timeout, defaults.default_timeout);
        assert!(task.notify.on_success);

        let err = ScheduledTask::from_definition(
            &definition("pipeline", "cron", "0 25 * * *"),
            &defaults,
            action.clone(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, CiteflowError::Schedule { .. }));
        assert!(err.to_string().contains("task 't'"));

        assert!(
            ScheduledTask::from_definition(&definition("pipeline", "weekly", "1"), &defaults, action)
                .is_err()
        );
    }

    #[tokio::test]
    async fn stage_action_reflects_run_status() {
        let orch = Arc::new(test_support::orchestrator(Arc::new(MemoryStore::new())));

        let ok = StageAction::new(orch.clone(), Stage::CitationSampling)
            .run(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ok["status"], "COMPLETED");
        assert_eq!(ok["counts"]["created"], 4);

        let err = StageAction::new(orch, Stage::ScoreCalculation)
            .run(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("scorer crashed"));
    }

    #[tokio::test]
    async fn pipeline_action_fails_only_when_every_stage_fails() {
        let partial = Arc::new(test_support::orchestrator(Arc::new(MemoryStore::new())));
        let payload = PipelineAction::new(partial)
            .run(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(payload["outcomes"].as_array().unwrap().len(), 4);
        assert_eq!(payload["totals"]["processed"], 14);

        let empty = Arc::new(Orchestrator::new(Arc::new(MemoryStore::new())));
        let err = PipelineAction::new(empty)
            .run(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("every pipeline stage failed"));
    }

    #[tokio::test]
    async fn scheduled_stage_failure_counts_against_task() {
        let h = harness();
        let orch = Arc::new(test_support::orchestrator(Arc::new(MemoryStore::new())));
        h.scheduler
            .add_definitions(
                &[TaskDefinition {
                    id: "scores".into(),
                    ..definition("stage:score_calculation", "interval", "6h")
                }],
                &orch,
            )
            .await
            .unwrap();

        let outcome = h.scheduler.run_now("scores").await.unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert_eq!(outcome.failure_count, 1);
        let state = h.scheduler.task("scores").await.unwrap();
        assert_eq!(state.action, "stage:score_calculation");
        assert_eq!(state.next_run, Some(t0() + chrono::Duration::seconds(60)));
    }
}
