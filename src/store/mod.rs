//! Persistence layer for orchestration state.
//!
//! The [`Store`] trait is deliberately plain CRUD: ids are store-issued
//! `i64`s, checkpoints are opaque JSON blobs, and all concurrency discipline
//! (per-job locks, tick ordering) lives in the scheduler, not here.
//! Infrastructure faults surface as `anyhow` errors; missing records are
//! `Ok(None)`.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use anyhow::Result;
use async_trait::async_trait;

use crate::drawing::Drawing;
use crate::workorder::{ExecutionStyle, Job, JobState, WorkOrder};

/// Fields for a drawing not yet persisted.
#[derive(Debug, Clone)]
pub struct NewDrawing {
    pub name: String,
    pub description: String,
    pub part_query: Option<String>,
    pub script: String,
}

/// Fields for a work order not yet persisted.
#[derive(Debug, Clone)]
pub struct NewWorkOrder {
    pub user: String,
    pub drawing_id: i64,
    pub execution_style: ExecutionStyle,
    pub part_query: Option<String>,
    pub options: serde_json::Value,
}

/// Fields for a job not yet persisted. Jobs start in `new`.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub workorder_id: i64,
    pub part: String,
    pub checkpoint: String,
    pub message: String,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_drawing(&self, drawing: NewDrawing) -> Result<Drawing>;
    async fn get_drawing(&self, id: i64) -> Result<Option<Drawing>>;

    async fn insert_workorder(&self, order: NewWorkOrder) -> Result<WorkOrder>;
    async fn get_workorder(&self, id: i64) -> Result<Option<WorkOrder>>;
    async fn update_workorder(&self, order: &WorkOrder) -> Result<()>;

    async fn insert_job(&self, job: NewJob) -> Result<Job>;
    async fn get_job(&self, id: i64) -> Result<Option<Job>>;
    /// Persists the job and stamps `updated_at`.
    async fn update_job(&self, job: &Job) -> Result<()>;
    /// Jobs of one order, oldest-created-first.
    async fn jobs_for_workorder(&self, workorder_id: i64) -> Result<Vec<Job>>;
    /// Jobs in `state` across all orders, least-recently-updated first.
    async fn jobs_in_state(&self, state: JobState) -> Result<Vec<Job>>;
}
