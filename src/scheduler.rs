//! The orchestration engine: WorkOrder fan-out, the scheduler tick, and all
//! job control actions.
//!
//! The tick (`process_jobs`) is the only place runners advance. It never
//! blocks on executor I/O; remote work is harvested as [`Task`]s and results
//! come back through `job_results` / `job_error`. Every mutation of a job
//! happens under that job's exclusive lock, so a tick and an out-of-band
//! result can never interleave on the same runner.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info};

use crate::capability::ParamMap;
use crate::error::{OrderError, OrderErrorCode, RunnerError};
use crate::parts::PartClient;
use crate::runner::{ReceiveOutcome, Runner, RunnerStatus, Task};
use crate::script;
use crate::drawing::Drawing;
use crate::store::{NewDrawing, NewJob, NewWorkOrder, Store};
use crate::value::ScriptValue;
use crate::workorder::{ExecutionStyle, Job, JobState, WorkOrder, MAX_TARGET_PARTS};

/// Hard cap on tasks handed out in one pull.
pub const MAX_JOBS_PER_PULL: usize = 100;

/// Engine fault: either a coded domain error for the caller or an
/// infrastructure failure.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Order(#[from] OrderError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    fn order(code: OrderErrorCode, message: impl Into<String>) -> Self {
        EngineError::Order(OrderError::new(code, message))
    }
}

/// Request to cut a new WorkOrder from a Drawing.
#[derive(Debug, Clone)]
pub struct WorkOrderRequest {
    pub user: String,
    pub drawing_id: i64,
    pub execution_style: ExecutionStyle,
    pub part_query: Option<String>,
    pub options: serde_json::Value,
}

/// Per-part outcome row for a WorkOrder.
#[derive(Debug, Clone, Serialize)]
pub struct JobResultRow {
    pub job_id: i64,
    pub part: String,
    pub state: JobState,
    pub message: String,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Aggregate job counts across all orders.
#[derive(Debug, Clone, Serialize)]
pub struct JobCounts {
    /// Jobs still moving: waiting or queued.
    pub running: usize,
    pub paused: usize,
    pub error: usize,
}

/// Operator-facing snapshot of one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobStats {
    pub job_id: i64,
    pub workorder_id: i64,
    pub part: String,
    pub state: JobState,
    pub message: String,
    pub runner: RunnerStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Registry of per-job exclusive locks.
#[derive(Default)]
struct JobLocks {
    inner: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl JobLocks {
    async fn acquire(&self, job_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.inner.lock().await;
            locks
                .entry(job_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

pub struct Engine {
    store: Arc<dyn Store>,
    parts: Arc<dyn PartClient>,
    locks: JobLocks,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>, parts: Arc<dyn PartClient>) -> Self {
        Self {
            store,
            parts,
            locks: JobLocks::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    // ---- Drawing admission ----

    /// Admit a new drawing as a template. The script must lint.
    pub async fn create_drawing(&self, drawing: NewDrawing) -> Result<Drawing, EngineError> {
        Drawing::validate_script(&drawing.name, &drawing.script)?;
        let drawing = self.store.insert_drawing(drawing).await?;
        info!(drawing_id = drawing.id, name = %drawing.name, "drawing admitted");
        Ok(drawing)
    }

    pub async fn get_drawing(&self, id: i64) -> Result<Drawing, EngineError> {
        self.store.get_drawing(id).await?.ok_or_else(|| {
            EngineError::order(OrderErrorCode::DrawingNotFound, format!("no drawing {}", id))
        })
    }

    // ---- WorkOrder lifecycle ----

    /// Cut a WorkOrder: resolve the effective part query, fan out one job
    /// per matched part. Nothing is created when any check fails.
    pub async fn create_workorder(
        &self,
        request: WorkOrderRequest,
    ) -> Result<WorkOrder, EngineError> {
        let drawing = self
            .store
            .get_drawing(request.drawing_id)
            .await?
            .ok_or_else(|| {
                EngineError::order(
                    OrderErrorCode::DrawingNotFound,
                    format!("no drawing {}", request.drawing_id),
                )
            })?;

        let query = match (&drawing.part_query, &request.part_query) {
            (Some(_), Some(_)) => {
                return Err(EngineError::order(
                    OrderErrorCode::QueryNotAllowed,
                    format!("drawing '{}' fixes its part query", drawing.name),
                ));
            }
            (Some(fixed), None) => fixed.clone(),
            (None, Some(given)) => given.clone(),
            (None, None) => {
                return Err(EngineError::order(
                    OrderErrorCode::QueryRequired,
                    format!("drawing '{}' needs a part query", drawing.name),
                ));
            }
        };

        // Fetch one past the cap so an oversized match is detectable.
        let parts = self
            .parts
            .find_parts(&query, MAX_TARGET_PARTS + 1)
            .await?;
        if parts.len() > MAX_TARGET_PARTS {
            return Err(EngineError::order(
                OrderErrorCode::TooManyParts,
                format!("query matches more than {} parts", MAX_TARGET_PARTS),
            ));
        }

        let program = script::compile(&drawing.script).map_err(|e| {
            EngineError::order(OrderErrorCode::ScriptInvalid, e.to_string())
        })?;

        let order = self
            .store
            .insert_workorder(NewWorkOrder {
                user: request.user.clone(),
                drawing_id: drawing.id,
                execution_style: request.execution_style,
                part_query: Some(query),
                options: request.options.clone(),
            })
            .await?;

        for part in &parts {
            let mut part_bindings = part.values.clone();
            part_bindings
                .entry("name".to_string())
                .or_insert_with(|| ScriptValue::Str(part.name.clone()));

            let mut order_bindings = HashMap::new();
            order_bindings.insert("id".to_string(), ScriptValue::Int(order.id));
            order_bindings.insert(
                "user".to_string(),
                ScriptValue::Str(request.user.clone()),
            );
            order_bindings.insert(
                "options".to_string(),
                ScriptValue::from_json(&request.options),
            );

            let mut module_values = HashMap::new();
            module_values.insert("part".to_string(), part_bindings);
            module_values.insert("workorder".to_string(), order_bindings);

            let runner = Runner::new(program.clone(), module_values);
            let checkpoint = runner
                .checkpoint()
                .map_err(|e| anyhow::anyhow!("checkpoint failed: {}", e))?;

            self.store
                .insert_job(NewJob {
                    workorder_id: order.id,
                    part: part.name.clone(),
                    checkpoint,
                    message: "created".to_string(),
                })
                .await?;
        }

        info!(
            workorder_id = order.id,
            jobs = parts.len(),
            "workorder created"
        );
        Ok(order)
    }

    /// Release the order's jobs to the scheduler. Idempotent.
    pub async fn start_workorder(&self, id: i64) -> Result<WorkOrder, EngineError> {
        let mut order = self.load_workorder(id).await?;
        if order.started_at.is_none() {
            order.started_at = Some(Utc::now());
            self.store.update_workorder(&order).await?;
        }
        for job in self.store.jobs_for_workorder(id).await? {
            if job.state == JobState::New {
                let _guard = self.locks.acquire(job.id).await;
                let mut job = self.reload_job(job.id).await?;
                if job.state == JobState::New {
                    job.state = JobState::Waiting;
                    self.store.update_job(&job).await?;
                }
            }
        }
        info!(workorder_id = id, "workorder started");
        Ok(order)
    }

    /// Pause every job of the order that is still moving. Idempotent.
    pub async fn pause_workorder(&self, id: i64) -> Result<(), EngineError> {
        self.load_workorder(id).await?;
        for job in self.store.jobs_for_workorder(id).await? {
            let _guard = self.locks.acquire(job.id).await;
            let mut job = self.reload_job(job.id).await?;
            if job.ensure_pauseable().is_ok() {
                job.state = JobState::Paused;
                self.store.update_job(&job).await?;
            }
        }
        Ok(())
    }

    /// Resume every paused job of the order. Idempotent.
    pub async fn resume_workorder(&self, id: i64) -> Result<(), EngineError> {
        self.load_workorder(id).await?;
        for job in self.store.jobs_for_workorder(id).await? {
            let _guard = self.locks.acquire(job.id).await;
            let mut job = self.reload_job(job.id).await?;
            if job.state == JobState::Paused {
                job.state = JobState::Queued;
                self.store.update_job(&job).await?;
            }
        }
        Ok(())
    }

    /// Abort every non-terminal job of the order. Valid before `start`;
    /// the order is stamped finished either way. Idempotent.
    pub async fn abort_workorder(&self, id: i64) -> Result<(), EngineError> {
        let mut order = self.load_workorder(id).await?;
        for job in self.store.jobs_for_workorder(id).await? {
            let _guard = self.locks.acquire(job.id).await;
            let mut job = self.reload_job(job.id).await?;
            if !job.state.is_terminal() {
                job.state = JobState::Aborted;
                job.set_message("aborted by operator");
                job.finished_at = Some(Utc::now());
                self.store.update_job(&job).await?;
            }
        }
        if !order.is_finished() {
            let jobs = self.store.jobs_for_workorder(id).await?;
            let done = jobs.iter().filter(|j| j.state == JobState::Done).count();
            order.finished_at = Some(Utc::now());
            order.set_message(&format!("{} done, {} aborted", done, jobs.len() - done));
            self.store.update_workorder(&order).await?;
        }
        info!(workorder_id = id, "workorder aborted");
        Ok(())
    }

    /// Per-part outcome summary.
    pub async fn get_results(&self, id: i64) -> Result<Vec<JobResultRow>, EngineError> {
        self.load_workorder(id).await?;
        let jobs = self.store.jobs_for_workorder(id).await?;
        Ok(jobs
            .into_iter()
            .map(|job| JobResultRow {
                job_id: job.id,
                part: job.part,
                state: job.state,
                message: job.message,
                finished_at: job.finished_at,
            })
            .collect())
    }

    /// Stamp `finished_at` once every owned job is terminal and the order
    /// had started.
    async fn check_finished(&self, id: i64) -> Result<(), EngineError> {
        let mut order = self.load_workorder(id).await?;
        if !order.is_started() || order.is_finished() {
            return Ok(());
        }
        let jobs = self.store.jobs_for_workorder(id).await?;
        if jobs.iter().any(|job| !job.state.is_terminal()) {
            return Ok(());
        }
        let done = jobs.iter().filter(|j| j.state == JobState::Done).count();
        let aborted = jobs.len() - done;
        order.finished_at = Some(Utc::now());
        order.set_message(&format!("{} done, {} aborted", done, aborted));
        self.store.update_workorder(&order).await?;
        info!(workorder_id = id, done, aborted, "workorder finished");
        Ok(())
    }

    // ---- Scheduler tick ----

    /// Advance every pending job one step and harvest dispatchable tasks
    /// for the requested modules. Faults inside one job never escape the
    /// batch.
    pub async fn process_jobs(
        &self,
        module_list: &[String],
        max_jobs: usize,
    ) -> Result<Vec<Task>, EngineError> {
        let max_jobs = max_jobs.min(MAX_JOBS_PER_PULL);
        let mut tasks = Vec::new();

        // Phase 1: release waiting jobs.
        for job in self.store.jobs_in_state(JobState::Waiting).await? {
            let _guard = self.locks.acquire(job.id).await;
            let mut job = self.reload_job(job.id).await?;
            if job.state == JobState::Waiting {
                job.state = JobState::Queued;
                job.started_at.get_or_insert_with(Utc::now);
                self.store.update_job(&job).await?;
            }
        }

        // Phase 2: finalize freshly done jobs and their orders.
        for job in self.store.jobs_in_state(JobState::Done).await? {
            if job.finished_at.is_some() {
                continue;
            }
            let _guard = self.locks.acquire(job.id).await;
            let mut job = self.reload_job(job.id).await?;
            if job.finished_at.is_none() {
                job.finished_at = Some(Utc::now());
                self.store.update_job(&job).await?;
            }
            self.check_finished(job.workorder_id).await?;
        }

        // Phase 3: tick queued jobs, least-recently-updated first. Jobs past
        // the cap are not visited this tick; they keep their place in line.
        let mut orders: HashMap<i64, WorkOrder> = HashMap::new();
        for job in self.store.jobs_in_state(JobState::Queued).await? {
            if tasks.len() >= max_jobs {
                break;
            }
            if !orders.contains_key(&job.workorder_id) {
                let order = self.load_workorder(job.workorder_id).await?;
                orders.insert(job.workorder_id, order);
            }
            let order = &orders[&job.workorder_id];

            if order.execution_style == ExecutionStyle::Serial
                && !self.is_oldest_pending(&job).await?
            {
                continue;
            }

            match self.tick_job(job.id, module_list).await {
                Ok(Some(task)) => tasks.push(task),
                Ok(None) => {}
                Err(err) => {
                    error!(job_id = job.id, %err, "tick failed for job");
                }
            }
        }

        Ok(tasks)
    }

    /// A serial order runs its jobs strictly in creation order.
    async fn is_oldest_pending(&self, job: &Job) -> Result<bool, EngineError> {
        let siblings = self.store.jobs_for_workorder(job.workorder_id).await?;
        for sibling in &siblings {
            if sibling.id == job.id {
                return Ok(true);
            }
            if !sibling.state.is_terminal() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Advance one queued job under its lock, collecting a task if one is
    /// dispatchable.
    async fn tick_job(
        &self,
        job_id: i64,
        module_list: &[String],
    ) -> Result<Option<Task>, EngineError> {
        let _guard = self.locks.acquire(job_id).await;
        let mut job = self.reload_job(job_id).await?;
        if job.state != JobState::Queued {
            return Ok(None);
        }

        let mut runner = match Runner::restore(&job.checkpoint) {
            Ok(runner) => runner,
            Err(err) => {
                job.state = JobState::Aborted;
                job.set_message(&err.to_string());
                job.finished_at = Some(Utc::now());
                self.store.update_job(&job).await?;
                self.check_finished(job.workorder_id).await?;
                return Ok(None);
            }
        };

        if runner.is_done() {
            job.state = JobState::Done;
            self.store.update_job(&job).await?;
            return Ok(None);
        }
        if runner.is_aborted() {
            job.state = JobState::Aborted;
            job.finished_at = Some(Utc::now());
            self.store.update_job(&job).await?;
            self.check_finished(job.workorder_id).await?;
            return Ok(None);
        }

        match runner.run() {
            Ok(Some(message)) => {
                job.set_message(&message);
            }
            Ok(None) => {}
            Err(RunnerError::Pause(message)) => {
                job.state = JobState::Paused;
                job.set_message(&message);
                debug!(job_id, "job paused by script");
            }
            Err(RunnerError::Execution(message)) => {
                job.state = JobState::Error;
                job.set_message(&message);
                debug!(job_id, "job errored");
            }
            Err(err) => {
                job.state = JobState::Aborted;
                job.set_message(&err.to_string());
                job.finished_at = Some(Utc::now());
            }
        }
        if job.state == JobState::Queued && runner.is_done() {
            job.state = JobState::Done;
        }

        let mut task = None;
        if job.state == JobState::Queued {
            if let Some(mut dispatch) = runner.dispatchable(module_list) {
                dispatch.job_id = job.id;
                task = Some(dispatch);
            }
        }

        match runner.checkpoint() {
            Ok(blob) => job.checkpoint = blob,
            Err(err) => {
                job.state = JobState::Aborted;
                job.set_message(&err.to_string());
                job.finished_at = Some(Utc::now());
                task = None;
            }
        }
        self.store.update_job(&job).await?;
        if job.state == JobState::Aborted {
            self.check_finished(job.workorder_id).await?;
        }

        Ok(task)
    }

    // ---- Result reconciliation ----

    /// Deliver an executor result. Persisted only when the runner accepts
    /// it; a stale cookie or malformed payload changes nothing.
    pub async fn job_results(
        &self,
        job_id: i64,
        cookie: &str,
        data: &ParamMap,
    ) -> Result<(), EngineError> {
        let _guard = self.locks.acquire(job_id).await;
        let mut job = self.reload_job(job_id).await?;
        if job.state != JobState::Queued {
            return Err(EngineError::order(
                OrderErrorCode::InvalidResult,
                format!("job {} is {}, not accepting results", job_id, job.state),
            ));
        }
        let mut runner = self.restore_runner(&job)?;
        match runner.receive_result(cookie, data) {
            (ReceiveOutcome::Accepted, message) => {
                if let Some(message) = message {
                    job.set_message(&message);
                }
                job.checkpoint = self.checkpoint(&runner)?;
                self.store.update_job(&job).await?;
                debug!(job_id, "result accepted");
                Ok(())
            }
            (ReceiveOutcome::Rejected, reason) => Err(EngineError::order(
                OrderErrorCode::InvalidResult,
                reason.unwrap_or_else(|| "stale or unknown cookie".to_string()),
            )),
        }
    }

    /// Executor-reported failure: cookie is validated locally, then the job
    /// moves to `error` with the executor's message.
    pub async fn job_error(
        &self,
        job_id: i64,
        cookie: &str,
        message: &str,
    ) -> Result<(), EngineError> {
        let _guard = self.locks.acquire(job_id).await;
        let mut job = self.reload_job(job_id).await?;
        let mut runner = self.restore_runner(&job)?;
        if !runner.cookie_matches(cookie) {
            return Err(EngineError::order(
                OrderErrorCode::BadCookie,
                format!("cookie does not match job {}", job_id),
            ));
        }
        runner.clear_dispatched();
        job.state = JobState::Error;
        job.set_message(message);
        job.checkpoint = self.checkpoint(&runner)?;
        self.store.update_job(&job).await?;
        debug!(job_id, "executor reported failure");
        Ok(())
    }

    // ---- Job control actions ----

    pub async fn pause_job(&self, job_id: i64) -> Result<(), EngineError> {
        let _guard = self.locks.acquire(job_id).await;
        let mut job = self.reload_job(job_id).await?;
        job.ensure_pauseable()?;
        job.state = JobState::Paused;
        self.store.update_job(&job).await?;
        Ok(())
    }

    pub async fn resume_job(&self, job_id: i64) -> Result<(), EngineError> {
        let _guard = self.locks.acquire(job_id).await;
        let mut job = self.reload_job(job_id).await?;
        job.ensure_paused()?;
        job.state = JobState::Queued;
        self.store.update_job(&job).await?;
        Ok(())
    }

    /// Re-queue an errored job to retry its failed step. The outstanding
    /// cookie is invalidated so the step dispatches afresh.
    pub async fn reset_job(&self, job_id: i64) -> Result<(), EngineError> {
        let _guard = self.locks.acquire(job_id).await;
        let mut job = self.reload_job(job_id).await?;
        job.ensure_errored()?;
        let mut runner = self.restore_runner(&job)?;
        runner.clear_dispatched();
        job.state = JobState::Queued;
        job.set_message("reset by operator");
        job.checkpoint = self.checkpoint(&runner)?;
        self.store.update_job(&job).await?;
        Ok(())
    }

    /// Undo an errored job's completed invocations and restart it from the
    /// top. A non-undoable step fails the whole action without persisting.
    pub async fn rollback_job(&self, job_id: i64) -> Result<(), EngineError> {
        let _guard = self.locks.acquire(job_id).await;
        let mut job = self.reload_job(job_id).await?;
        job.ensure_errored()?;
        let mut runner = self.restore_runner(&job)?;
        if let Err(reason) = runner.rollback() {
            return Err(EngineError::order(OrderErrorCode::RollbackFailed, reason));
        }
        job.state = JobState::Queued;
        job.set_message("rolled back");
        job.checkpoint = self.checkpoint(&runner)?;
        self.store.update_job(&job).await?;
        info!(job_id, "job rolled back");
        Ok(())
    }

    /// Invalidate the outstanding dispatch so the step is handed out again.
    pub async fn clear_dispatched(&self, job_id: i64) -> Result<(), EngineError> {
        let _guard = self.locks.acquire(job_id).await;
        let mut job = self.reload_job(job_id).await?;
        job.ensure_queued()?;
        let mut runner = self.restore_runner(&job)?;
        runner.clear_dispatched();
        job.checkpoint = self.checkpoint(&runner)?;
        self.store.update_job(&job).await?;
        Ok(())
    }

    /// Deliver an out-of-band completion signal to the waiting capability.
    pub async fn signal_complete(&self, job_id: i64, cookie: &str) -> Result<(), EngineError> {
        let _guard = self.locks.acquire(job_id).await;
        let mut job = self.reload_job(job_id).await?;
        let mut runner = self.restore_runner(&job)?;
        match runner.signal(cookie) {
            Some(result) if result == "Accepted" => {
                job.checkpoint = self.checkpoint(&runner)?;
                self.store.update_job(&job).await?;
                Ok(())
            }
            _ => Err(EngineError::order(
                OrderErrorCode::BadCookie,
                format!("signal cookie does not match job {}", job_id),
            )),
        }
    }

    /// Out-of-band alert: flags a moving job as `error` with the message so
    /// an operator has to look at it.
    pub async fn signal_alert(&self, job_id: i64, message: &str) -> Result<(), EngineError> {
        let _guard = self.locks.acquire(job_id).await;
        let mut job = self.reload_job(job_id).await?;
        if matches!(job.state, JobState::Queued | JobState::Paused) {
            job.state = JobState::Error;
        }
        job.set_message(message);
        self.store.update_job(&job).await?;
        info!(job_id, "alert raised on job");
        Ok(())
    }

    /// Operator note on the job; no state change.
    pub async fn post_message(&self, job_id: i64, message: &str) -> Result<(), EngineError> {
        let _guard = self.locks.acquire(job_id).await;
        let mut job = self.reload_job(job_id).await?;
        job.set_message(message);
        self.store.update_job(&job).await?;
        Ok(())
    }

    // ---- Introspection ----

    /// Aggregate counts over every job the engine knows about.
    pub async fn job_counts(&self) -> Result<JobCounts, EngineError> {
        let mut running = 0;
        for state in [JobState::Waiting, JobState::Queued] {
            running += self.store.jobs_in_state(state).await?.len();
        }
        Ok(JobCounts {
            running,
            paused: self.store.jobs_in_state(JobState::Paused).await?.len(),
            error: self.store.jobs_in_state(JobState::Error).await?.len(),
        })
    }

    pub async fn job_stats(&self, job_id: i64) -> Result<JobStats, EngineError> {
        let job = self.reload_job(job_id).await?;
        let runner = self.restore_runner(&job)?;
        Ok(JobStats {
            job_id: job.id,
            workorder_id: job.workorder_id,
            part: job.part,
            state: job.state,
            message: job.message,
            runner: runner.status(),
            created_at: job.created_at,
            updated_at: job.updated_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
        })
    }

    pub async fn job_runner_variables(
        &self,
        job_id: i64,
    ) -> Result<HashMap<String, ScriptValue>, EngineError> {
        let job = self.reload_job(job_id).await?;
        let runner = self.restore_runner(&job)?;
        Ok(runner.variables().clone())
    }

    pub async fn job_runner_state(&self, job_id: i64) -> Result<String, EngineError> {
        let job = self.reload_job(job_id).await?;
        let runner = self.restore_runner(&job)?;
        Ok(runner.state_name())
    }

    pub async fn get_workorder(&self, id: i64) -> Result<WorkOrder, EngineError> {
        self.load_workorder(id).await
    }

    // ---- Helpers ----

    async fn load_workorder(&self, id: i64) -> Result<WorkOrder, EngineError> {
        self.store.get_workorder(id).await?.ok_or_else(|| {
            EngineError::order(
                OrderErrorCode::WorkOrderNotFound,
                format!("no workorder {}", id),
            )
        })
    }

    async fn reload_job(&self, job_id: i64) -> Result<Job, EngineError> {
        self.store.get_job(job_id).await?.ok_or_else(|| {
            EngineError::order(OrderErrorCode::JobNotFound, format!("no job {}", job_id))
        })
    }

    fn restore_runner(&self, job: &Job) -> Result<Runner, EngineError> {
        Runner::restore(&job.checkpoint).map_err(|err| {
            EngineError::order(
                OrderErrorCode::BadCheckpoint,
                format!("job {}: {}", job.id, err),
            )
        })
    }

    fn checkpoint(&self, runner: &Runner) -> Result<String, EngineError> {
        runner.checkpoint().map_err(|err| {
            EngineError::Internal(anyhow::anyhow!("checkpoint failed: {}", err))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MAX_MESSAGE_LEN;
    use crate::parts::{MemoryPartClient, Part};
    use crate::store::{MemoryStore, NewDrawing};

    const BURN_IN: &str =
        "rc = ssh.exec( host=part.hostname, cmd=\"burn-in\" )\nif rc != 0:\n    fail( msg=\"burn-in failed\" )\nmessage( msg=\"passed\" )";

    struct Rig {
        engine: Engine,
        parts: Arc<MemoryPartClient>,
    }

    async fn rig() -> Rig {
        let store = Arc::new(MemoryStore::new());
        let parts = Arc::new(MemoryPartClient::new());
        Rig {
            engine: Engine::new(store, parts.clone()),
            parts,
        }
    }

    async fn seed_parts(rig: &Rig, count: usize) {
        for i in 0..count {
            let mut values = HashMap::new();
            values.insert(
                "hostname".to_string(),
                ScriptValue::Str(format!("unit-{}.factory", i)),
            );
            rig.parts
                .add_part(Part {
                    name: format!("unit-{}", i),
                    values,
                })
                .await;
        }
    }

    async fn seed_drawing(rig: &Rig, script: &str, part_query: Option<&str>) -> i64 {
        rig.engine
            .store()
            .insert_drawing(NewDrawing {
                name: "burn-in".to_string(),
                description: String::new(),
                part_query: part_query.map(str::to_string),
                script: script.to_string(),
            })
            .await
            .unwrap()
            .id
    }

    fn request(drawing_id: i64, style: ExecutionStyle, query: Option<&str>) -> WorkOrderRequest {
        WorkOrderRequest {
            user: "inspector".to_string(),
            drawing_id,
            execution_style: style,
            part_query: query.map(str::to_string),
            options: serde_json::json!({"cycles": 1}),
        }
    }

    fn ssh() -> Vec<String> {
        vec!["ssh".to_string()]
    }

    fn order_code(err: EngineError) -> OrderErrorCode {
        match err {
            EngineError::Order(e) => e.code,
            EngineError::Internal(e) => panic!("unexpected internal error: {}", e),
        }
    }

    fn rc_data(rc: i64) -> ParamMap {
        let mut data = ParamMap::new();
        data.insert("rc".to_string(), ScriptValue::Int(rc));
        data
    }

    #[tokio::test]
    async fn query_resolution_rules() {
        let r = rig().await;
        seed_parts(&r, 1).await;
        let fixed = seed_drawing(&r, BURN_IN, Some("*")).await;
        let open = seed_drawing(&r, BURN_IN, None).await;

        let err = r
            .engine
            .create_workorder(request(fixed, ExecutionStyle::Parallel, Some("*")))
            .await
            .unwrap_err();
        assert_eq!(order_code(err), OrderErrorCode::QueryNotAllowed);

        let err = r
            .engine
            .create_workorder(request(open, ExecutionStyle::Parallel, None))
            .await
            .unwrap_err();
        assert_eq!(order_code(err), OrderErrorCode::QueryRequired);

        assert!(r
            .engine
            .create_workorder(request(fixed, ExecutionStyle::Parallel, None))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn oversized_match_creates_nothing() {
        let r = rig().await;
        seed_parts(&r, MAX_TARGET_PARTS + 1).await;
        let drawing = seed_drawing(&r, BURN_IN, None).await;
        let err = r
            .engine
            .create_workorder(request(drawing, ExecutionStyle::Parallel, Some("*")))
            .await
            .unwrap_err();
        assert_eq!(order_code(err), OrderErrorCode::TooManyParts);
    }

    #[tokio::test]
    async fn broken_script_is_rejected_at_order_time() {
        let r = rig().await;
        seed_parts(&r, 1).await;
        let drawing = seed_drawing(&r, "goto nowhere", None).await;
        let err = r
            .engine
            .create_workorder(request(drawing, ExecutionStyle::Parallel, Some("*")))
            .await
            .unwrap_err();
        assert_eq!(order_code(err), OrderErrorCode::ScriptInvalid);
    }

    #[tokio::test]
    async fn parallel_order_runs_end_to_end() {
        let r = rig().await;
        seed_parts(&r, 3).await;
        let drawing = seed_drawing(&r, BURN_IN, None).await;
        let order = r
            .engine
            .create_workorder(request(drawing, ExecutionStyle::Parallel, Some("*")))
            .await
            .unwrap();
        r.engine.start_workorder(order.id).await.unwrap();

        let tasks = r.engine.process_jobs(&ssh(), 10).await.unwrap();
        assert_eq!(tasks.len(), 3);
        let mut cookies: Vec<&str> = tasks.iter().map(|t| t.cookie.as_str()).collect();
        cookies.sort();
        cookies.dedup();
        assert_eq!(cookies.len(), 3, "cookies must be distinct");

        for task in &tasks {
            r.engine
                .job_results(task.job_id, &task.cookie, &rc_data(0))
                .await
                .unwrap();
        }

        // Absorbed results, final message, completion, order finalization.
        r.engine.process_jobs(&ssh(), 10).await.unwrap();
        r.engine.process_jobs(&ssh(), 10).await.unwrap();
        r.engine.process_jobs(&ssh(), 10).await.unwrap();

        let order = r.engine.get_workorder(order.id).await.unwrap();
        assert!(order.is_finished());
        for row in r.engine.get_results(order.id).await.unwrap() {
            assert_eq!(row.state, JobState::Done);
            assert_eq!(row.message, "passed");
        }
    }

    #[tokio::test]
    async fn serial_order_dispatches_one_at_a_time() {
        let r = rig().await;
        seed_parts(&r, 2).await;
        let drawing = seed_drawing(&r, BURN_IN, None).await;
        let order = r
            .engine
            .create_workorder(request(drawing, ExecutionStyle::Serial, Some("*")))
            .await
            .unwrap();
        r.engine.start_workorder(order.id).await.unwrap();

        let tasks = r.engine.process_jobs(&ssh(), 10).await.unwrap();
        assert_eq!(tasks.len(), 1);

        // Finish the first job; the second is released afterwards.
        let first = &tasks[0];
        r.engine
            .job_results(first.job_id, &first.cookie, &rc_data(0))
            .await
            .unwrap();
        r.engine.process_jobs(&ssh(), 10).await.unwrap();
        let tasks = r.engine.process_jobs(&ssh(), 10).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_ne!(tasks[0].job_id, first.job_id);
    }

    #[tokio::test]
    async fn failing_result_moves_job_to_error_and_reset_retries() {
        let r = rig().await;
        seed_parts(&r, 1).await;
        let drawing = seed_drawing(&r, BURN_IN, None).await;
        let order = r
            .engine
            .create_workorder(request(drawing, ExecutionStyle::Parallel, Some("*")))
            .await
            .unwrap();
        r.engine.start_workorder(order.id).await.unwrap();

        let tasks = r.engine.process_jobs(&ssh(), 10).await.unwrap();
        let task = &tasks[0];
        r.engine
            .job_results(task.job_id, &task.cookie, &rc_data(1))
            .await
            .unwrap();
        r.engine.process_jobs(&ssh(), 10).await.unwrap();

        let stats = r.engine.job_stats(task.job_id).await.unwrap();
        assert_eq!(stats.state, JobState::Error);
        assert_eq!(stats.message, "burn-in failed");

        r.engine.reset_job(task.job_id).await.unwrap();
        let stats = r.engine.job_stats(task.job_id).await.unwrap();
        assert_eq!(stats.state, JobState::Queued);
    }

    #[tokio::test]
    async fn executor_error_requires_matching_cookie() {
        let r = rig().await;
        seed_parts(&r, 1).await;
        let drawing = seed_drawing(&r, BURN_IN, None).await;
        let order = r
            .engine
            .create_workorder(request(drawing, ExecutionStyle::Parallel, Some("*")))
            .await
            .unwrap();
        r.engine.start_workorder(order.id).await.unwrap();
        let tasks = r.engine.process_jobs(&ssh(), 10).await.unwrap();
        let task = &tasks[0];

        let err = r
            .engine
            .job_error(task.job_id, "forged", "host on fire")
            .await
            .unwrap_err();
        assert_eq!(order_code(err), OrderErrorCode::BadCookie);

        r.engine
            .job_error(task.job_id, &task.cookie, &"h".repeat(5000))
            .await
            .unwrap();
        let stats = r.engine.job_stats(task.job_id).await.unwrap();
        assert_eq!(stats.state, JobState::Error);
        assert_eq!(stats.message.chars().count(), MAX_MESSAGE_LEN);
    }

    #[tokio::test]
    async fn stale_cookie_result_is_a_noop() {
        let r = rig().await;
        seed_parts(&r, 1).await;
        let drawing = seed_drawing(&r, BURN_IN, None).await;
        let order = r
            .engine
            .create_workorder(request(drawing, ExecutionStyle::Parallel, Some("*")))
            .await
            .unwrap();
        r.engine.start_workorder(order.id).await.unwrap();
        let tasks = r.engine.process_jobs(&ssh(), 10).await.unwrap();
        let task = &tasks[0];

        r.engine.clear_dispatched(task.job_id).await.unwrap();
        let err = r
            .engine
            .job_results(task.job_id, &task.cookie, &rc_data(0))
            .await
            .unwrap_err();
        assert_eq!(order_code(err), OrderErrorCode::InvalidResult);

        // Re-dispatch hands out a fresh cookie that works.
        let tasks = r.engine.process_jobs(&ssh(), 10).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_ne!(tasks[0].cookie, task.cookie);
        r.engine
            .job_results(tasks[0].job_id, &tasks[0].cookie, &rc_data(0))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn pull_cap_is_enforced() {
        let r = rig().await;
        seed_parts(&r, 5).await;
        let drawing = seed_drawing(&r, BURN_IN, None).await;
        let order = r
            .engine
            .create_workorder(request(drawing, ExecutionStyle::Parallel, Some("*")))
            .await
            .unwrap();
        r.engine.start_workorder(order.id).await.unwrap();

        let tasks = r.engine.process_jobs(&ssh(), 2).await.unwrap();
        assert_eq!(tasks.len(), 2);
        // Jobs past the cap were not visited this tick.
        let rows = r.engine.get_results(order.id).await.unwrap();
        let untouched = rows.iter().filter(|row| row.message == "created").count();
        assert_eq!(untouched, 3);
        // They dispatch on the next pull; outstanding cookies do not.
        let tasks = r.engine.process_jobs(&ssh(), 10).await.unwrap();
        assert_eq!(tasks.len(), 3);
    }

    #[tokio::test]
    async fn pause_and_resume_workorder() {
        let r = rig().await;
        seed_parts(&r, 2).await;
        let drawing = seed_drawing(&r, BURN_IN, None).await;
        let order = r
            .engine
            .create_workorder(request(drawing, ExecutionStyle::Parallel, Some("*")))
            .await
            .unwrap();
        r.engine.start_workorder(order.id).await.unwrap();
        r.engine.pause_workorder(order.id).await.unwrap();

        assert!(r.engine.process_jobs(&ssh(), 10).await.unwrap().is_empty());

        r.engine.resume_workorder(order.id).await.unwrap();
        assert_eq!(r.engine.process_jobs(&ssh(), 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn abort_finishes_the_order() {
        let r = rig().await;
        seed_parts(&r, 2).await;
        let drawing = seed_drawing(&r, BURN_IN, None).await;
        let order = r
            .engine
            .create_workorder(request(drawing, ExecutionStyle::Parallel, Some("*")))
            .await
            .unwrap();
        r.engine.start_workorder(order.id).await.unwrap();
        r.engine.abort_workorder(order.id).await.unwrap();

        let order = r.engine.get_workorder(order.id).await.unwrap();
        assert!(order.is_finished());
        assert_eq!(order.message, "0 done, 2 aborted");
    }

    #[tokio::test]
    async fn script_pause_is_resumable() {
        let r = rig().await;
        seed_parts(&r, 1).await;
        let script = "pause( msg=\"load fixture\" )\nmessage( msg=\"running\" )";
        let drawing = seed_drawing(&r, script, None).await;
        let order = r
            .engine
            .create_workorder(request(drawing, ExecutionStyle::Parallel, Some("*")))
            .await
            .unwrap();
        r.engine.start_workorder(order.id).await.unwrap();
        r.engine.process_jobs(&ssh(), 10).await.unwrap();

        let jobs = r.engine.get_results(order.id).await.unwrap();
        assert_eq!(jobs[0].state, JobState::Paused);
        assert_eq!(jobs[0].message, "load fixture");

        let err = r.engine.pause_job(jobs[0].job_id).await.unwrap_err();
        assert_eq!(order_code(err), OrderErrorCode::NotPauseable);

        r.engine.resume_job(jobs[0].job_id).await.unwrap();
        r.engine.process_jobs(&ssh(), 10).await.unwrap();
        let jobs = r.engine.get_results(order.id).await.unwrap();
        assert_eq!(jobs[0].message, "running");
    }

    #[tokio::test]
    async fn signal_wait_round_trip() {
        let r = rig().await;
        seed_parts(&r, 1).await;
        let script = "ok = signal.wait( cookie=\"gate-7\" )\nmessage( msg=\"released\" )";
        let drawing = seed_drawing(&r, script, None).await;
        let order = r
            .engine
            .create_workorder(request(drawing, ExecutionStyle::Parallel, Some("*")))
            .await
            .unwrap();
        r.engine.start_workorder(order.id).await.unwrap();
        r.engine.process_jobs(&ssh(), 10).await.unwrap();
        let jobs = r.engine.get_results(order.id).await.unwrap();
        let job_id = jobs[0].job_id;

        let err = r.engine.signal_complete(job_id, "wrong").await.unwrap_err();
        assert_eq!(order_code(err), OrderErrorCode::BadCookie);

        r.engine.signal_complete(job_id, "gate-7").await.unwrap();
        r.engine.process_jobs(&ssh(), 10).await.unwrap();
        let jobs = r.engine.get_results(order.id).await.unwrap();
        assert_eq!(jobs[0].message, "released");
    }

    #[tokio::test]
    async fn unknown_job_is_coded() {
        let r = rig().await;
        let err = r.engine.pause_job(404).await.unwrap_err();
        assert_eq!(order_code(err), OrderErrorCode::JobNotFound);
    }

    #[tokio::test]
    async fn abort_before_start_still_finishes_the_order() {
        let r = rig().await;
        seed_parts(&r, 2).await;
        let drawing = seed_drawing(&r, BURN_IN, None).await;
        let order = r
            .engine
            .create_workorder(request(drawing, ExecutionStyle::Parallel, Some("*")))
            .await
            .unwrap();
        r.engine.abort_workorder(order.id).await.unwrap();

        let order = r.engine.get_workorder(order.id).await.unwrap();
        assert!(order.is_finished());
        assert_eq!(order.message, "0 done, 2 aborted");
        for row in r.engine.get_results(order.id).await.unwrap() {
            assert_eq!(row.state, JobState::Aborted);
            assert!(row.finished_at.is_some());
        }
    }

    #[tokio::test]
    async fn arithmetic_overflow_errors_the_job_not_the_batch() {
        let r = rig().await;
        seed_parts(&r, 1).await;
        let broken = seed_drawing(&r, "x = 9223372036854775807\ny = x + 1", None).await;
        let fine = seed_drawing(&r, BURN_IN, None).await;

        let bad = r
            .engine
            .create_workorder(request(broken, ExecutionStyle::Parallel, Some("*")))
            .await
            .unwrap();
        r.engine.start_workorder(bad.id).await.unwrap();
        let good = r
            .engine
            .create_workorder(request(fine, ExecutionStyle::Parallel, Some("*")))
            .await
            .unwrap();
        r.engine.start_workorder(good.id).await.unwrap();

        // The overflowing job faults; the healthy one still dispatches.
        let tasks = r.engine.process_jobs(&ssh(), 10).await.unwrap();
        assert_eq!(tasks.len(), 1);
        let rows = r.engine.get_results(bad.id).await.unwrap();
        assert_eq!(rows[0].state, JobState::Error);
        assert_eq!(rows[0].message, "integer overflow");
    }

    #[tokio::test]
    async fn reset_after_script_fail_does_not_skip_the_failure() {
        let r = rig().await;
        seed_parts(&r, 1).await;
        let drawing = seed_drawing(&r, BURN_IN, None).await;
        let order = r
            .engine
            .create_workorder(request(drawing, ExecutionStyle::Parallel, Some("*")))
            .await
            .unwrap();
        r.engine.start_workorder(order.id).await.unwrap();

        let tasks = r.engine.process_jobs(&ssh(), 10).await.unwrap();
        let task = &tasks[0];
        r.engine
            .job_results(task.job_id, &task.cookie, &rc_data(1))
            .await
            .unwrap();
        r.engine.process_jobs(&ssh(), 10).await.unwrap();
        let stats = r.engine.job_stats(task.job_id).await.unwrap();
        assert_eq!(stats.state, JobState::Error);

        // Reset retries the failed step; it must not slide past it.
        r.engine.reset_job(task.job_id).await.unwrap();
        r.engine.process_jobs(&ssh(), 10).await.unwrap();
        let stats = r.engine.job_stats(task.job_id).await.unwrap();
        assert_eq!(stats.state, JobState::Error);
        assert_eq!(stats.message, "burn-in failed");
    }

    #[tokio::test]
    async fn signal_alert_errors_a_moving_job() {
        let r = rig().await;
        seed_parts(&r, 1).await;
        let drawing = seed_drawing(&r, BURN_IN, None).await;
        let order = r
            .engine
            .create_workorder(request(drawing, ExecutionStyle::Parallel, Some("*")))
            .await
            .unwrap();
        r.engine.start_workorder(order.id).await.unwrap();
        let tasks = r.engine.process_jobs(&ssh(), 10).await.unwrap();
        let job_id = tasks[0].job_id;

        r.engine.signal_alert(job_id, "fixture jammed").await.unwrap();
        let stats = r.engine.job_stats(job_id).await.unwrap();
        assert_eq!(stats.state, JobState::Error);
        assert_eq!(stats.message, "fixture jammed");

        // The usual error recovery applies.
        r.engine.reset_job(job_id).await.unwrap();
        let stats = r.engine.job_stats(job_id).await.unwrap();
        assert_eq!(stats.state, JobState::Queued);
    }

    #[tokio::test]
    async fn aggregate_counts_cover_all_jobs() {
        let r = rig().await;
        seed_parts(&r, 2).await;
        let drawing = seed_drawing(&r, BURN_IN, None).await;
        let order = r
            .engine
            .create_workorder(request(drawing, ExecutionStyle::Parallel, Some("*")))
            .await
            .unwrap();
        r.engine.start_workorder(order.id).await.unwrap();

        let tasks = r.engine.process_jobs(&ssh(), 10).await.unwrap();
        let counts = r.engine.job_counts().await.unwrap();
        assert_eq!(counts.running, 2);
        assert_eq!(counts.error, 0);

        r.engine
            .job_results(tasks[0].job_id, &tasks[0].cookie, &rc_data(1))
            .await
            .unwrap();
        r.engine.process_jobs(&ssh(), 10).await.unwrap();
        r.engine.pause_job(tasks[1].job_id).await.unwrap();

        let counts = r.engine.job_counts().await.unwrap();
        assert_eq!(counts.running, 0);
        assert_eq!(counts.paused, 1);
        assert_eq!(counts.error, 1);
    }

    #[tokio::test]
    async fn drawing_admission_lints_the_script() {
        let r = rig().await;
        let err = r
            .engine
            .create_drawing(NewDrawing {
                name: "broken".to_string(),
                description: String::new(),
                part_query: None,
                script: "goto nowhere".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(order_code(err), OrderErrorCode::ScriptInvalid);

        let drawing = r
            .engine
            .create_drawing(NewDrawing {
                name: "burn-in".to_string(),
                description: String::new(),
                part_query: None,
                script: BURN_IN.to_string(),
            })
            .await
            .unwrap();
        assert!(r.engine.get_drawing(drawing.id).await.is_ok());
    }
}
