//! In-memory store backend: the default for tests and single-process runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{NewDrawing, NewJob, NewWorkOrder, Store};
use crate::drawing::Drawing;
use crate::workorder::{Job, JobState, WorkOrder};

#[derive(Default)]
pub struct MemoryStore {
    next_id: AtomicI64,
    drawings: RwLock<HashMap<i64, Drawing>>,
    workorders: RwLock<HashMap<i64, WorkOrder>>,
    jobs: RwLock<HashMap<i64, Job>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            ..Self::default()
        }
    }

    fn issue_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_drawing(&self, drawing: NewDrawing) -> Result<Drawing> {
        let record = Drawing {
            id: self.issue_id(),
            name: drawing.name,
            description: drawing.description,
            part_query: drawing.part_query,
            script: drawing.script,
            created_at: Utc::now(),
        };
        self.drawings.write().await.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_drawing(&self, id: i64) -> Result<Option<Drawing>> {
        Ok(self.drawings.read().await.get(&id).cloned())
    }

    async fn insert_workorder(&self, order: NewWorkOrder) -> Result<WorkOrder> {
        let record = WorkOrder {
            id: self.issue_id(),
            user: order.user,
            drawing_id: order.drawing_id,
            execution_style: order.execution_style,
            part_query: order.part_query,
            options: order.options,
            message: String::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        self.workorders
            .write()
            .await
            .insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_workorder(&self, id: i64) -> Result<Option<WorkOrder>> {
        Ok(self.workorders.read().await.get(&id).cloned())
    }

    async fn update_workorder(&self, order: &WorkOrder) -> Result<()> {
        self.workorders.write().await.insert(order.id, order.clone());
        Ok(())
    }

    async fn insert_job(&self, job: NewJob) -> Result<Job> {
        let now = Utc::now();
        let record = Job {
            id: self.issue_id(),
            workorder_id: job.workorder_id,
            part: job.part,
            state: JobState::New,
            message: job.message,
            checkpoint: job.checkpoint,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        };
        self.jobs.write().await.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_job(&self, id: i64) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        let mut stamped = job.clone();
        stamped.updated_at = Utc::now();
        self.jobs.write().await.insert(stamped.id, stamped);
        Ok(())
    }

    async fn jobs_for_workorder(&self, workorder_id: i64) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().await;
        let mut matched: Vec<Job> = jobs
            .values()
            .filter(|job| job.workorder_id == workorder_id)
            .cloned()
            .collect();
        matched.sort_by_key(|job| (job.created_at, job.id));
        Ok(matched)
    }

    async fn jobs_in_state(&self, state: JobState) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().await;
        let mut matched: Vec<Job> = jobs
            .values()
            .filter(|job| job.state == state)
            .cloned()
            .collect();
        matched.sort_by_key(|job| (job.updated_at, job.id));
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_job(workorder_id: i64, part: &str) -> NewJob {
        NewJob {
            workorder_id,
            part: part.to_string(),
            checkpoint: String::new(),
            message: String::new(),
        }
    }

    #[tokio::test]
    async fn ids_are_unique_and_monotonic() {
        let store = MemoryStore::new();
        let a = store
            .insert_job(new_job(1, "unit-a"))
            .await
            .unwrap();
        let b = store
            .insert_job(new_job(1, "unit-b"))
            .await
            .unwrap();
        assert!(b.id > a.id);
    }

    #[tokio::test]
    async fn update_stamps_updated_at() {
        let store = MemoryStore::new();
        let mut job = store.insert_job(new_job(1, "unit-a")).await.unwrap();
        let before = job.updated_at;
        job.state = JobState::Waiting;
        store.update_job(&job).await.unwrap();
        let loaded = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Waiting);
        assert!(loaded.updated_at >= before);
    }

    #[tokio::test]
    async fn jobs_in_state_orders_least_recently_updated_first() {
        let store = MemoryStore::new();
        let mut a = store.insert_job(new_job(1, "unit-a")).await.unwrap();
        let mut b = store.insert_job(new_job(1, "unit-b")).await.unwrap();
        a.state = JobState::Queued;
        b.state = JobState::Queued;
        store.update_job(&b).await.unwrap();
        store.update_job(&a).await.unwrap();

        let queued = store.jobs_in_state(JobState::Queued).await.unwrap();
        let ids: Vec<i64> = queued.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![b.id, a.id]);
    }

    #[tokio::test]
    async fn missing_records_are_none() {
        let store = MemoryStore::new();
        assert!(store.get_job(404).await.unwrap().is_none());
        assert!(store.get_workorder(404).await.unwrap().is_none());
        assert!(store.get_drawing(404).await.unwrap().is_none());
    }
}
