//! Postgres store backend.
//!
//! State follows the same shape as the in-memory backend: records are plain
//! rows, checkpoints and options are JSON serialized into TEXT columns so
//! they round-trip byte-for-byte.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};

use super::{NewDrawing, NewJob, NewWorkOrder, Store};
use crate::drawing::Drawing;
use crate::workorder::{ExecutionStyle, Job, JobState, WorkOrder};

pub struct PgStore {
    pool: Pool<Postgres>,
}

impl PgStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Initialize database schema
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS drawings (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                part_query TEXT,
                script TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            CREATE TABLE IF NOT EXISTS workorders (
                id BIGSERIAL PRIMARY KEY,
                user_name TEXT NOT NULL,
                drawing_id BIGINT NOT NULL REFERENCES drawings(id),
                execution_style TEXT NOT NULL,
                part_query TEXT,
                options TEXT NOT NULL DEFAULT 'null',
                message TEXT NOT NULL DEFAULT '',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                started_at TIMESTAMPTZ,
                finished_at TIMESTAMPTZ
            );

            CREATE TABLE IF NOT EXISTS jobs (
                id BIGSERIAL PRIMARY KEY,
                workorder_id BIGINT NOT NULL REFERENCES workorders(id),
                part TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'new',
                message TEXT NOT NULL DEFAULT '',
                checkpoint TEXT NOT NULL DEFAULT '',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                started_at TIMESTAMPTZ,
                finished_at TIMESTAMPTZ
            );

            -- Index for the tick's state scans
            CREATE INDEX IF NOT EXISTS idx_jobs_state
                ON jobs(state, updated_at);

            CREATE INDEX IF NOT EXISTS idx_jobs_workorder
                ON jobs(workorder_id);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize schema")?;

        Ok(())
    }
}

fn drawing_from_row(row: &PgRow) -> Result<Drawing> {
    Ok(Drawing {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        part_query: row.get("part_query"),
        script: row.get("script"),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
    })
}

fn workorder_from_row(row: &PgRow) -> Result<WorkOrder> {
    let execution_style: String = row.get("execution_style");
    let options: String = row.get("options");
    Ok(WorkOrder {
        id: row.get("id"),
        user: row.get("user_name"),
        drawing_id: row.get("drawing_id"),
        execution_style: execution_style
            .parse::<ExecutionStyle>()
            .map_err(anyhow::Error::msg)?,
        part_query: row.get("part_query"),
        options: serde_json::from_str(&options).context("Failed to decode options")?,
        message: row.get("message"),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
    })
}

fn job_from_row(row: &PgRow) -> Result<Job> {
    let state: String = row.get("state");
    Ok(Job {
        id: row.get("id"),
        workorder_id: row.get("workorder_id"),
        part: row.get("part"),
        state: state.parse::<JobState>().map_err(anyhow::Error::msg)?,
        message: row.get("message"),
        checkpoint: row.get("checkpoint"),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
    })
}

#[async_trait]
impl Store for PgStore {
    async fn insert_drawing(&self, drawing: NewDrawing) -> Result<Drawing> {
        let row = sqlx::query(
            r#"
            INSERT INTO drawings (name, description, part_query, script)
            VALUES ($1, $2, $3, $4)
            RETURNING id, name, description, part_query, script, created_at
            "#,
        )
        .bind(&drawing.name)
        .bind(&drawing.description)
        .bind(&drawing.part_query)
        .bind(&drawing.script)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert drawing")?;

        drawing_from_row(&row)
    }

    async fn get_drawing(&self, id: i64) -> Result<Option<Drawing>> {
        let row = sqlx::query(
            "SELECT id, name, description, part_query, script, created_at \
             FROM drawings WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load drawing")?;

        row.as_ref().map(drawing_from_row).transpose()
    }

    async fn insert_workorder(&self, order: NewWorkOrder) -> Result<WorkOrder> {
        let options =
            serde_json::to_string(&order.options).context("Failed to encode options")?;
        let row = sqlx::query(
            r#"
            INSERT INTO workorders (user_name, drawing_id, execution_style, part_query, options)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, user_name, drawing_id, execution_style, part_query, options,
                      message, created_at, started_at, finished_at
            "#,
        )
        .bind(&order.user)
        .bind(order.drawing_id)
        .bind(order.execution_style.as_str())
        .bind(&order.part_query)
        .bind(&options)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert workorder")?;

        workorder_from_row(&row)
    }

    async fn get_workorder(&self, id: i64) -> Result<Option<WorkOrder>> {
        let row = sqlx::query(
            "SELECT id, user_name, drawing_id, execution_style, part_query, options, \
             message, created_at, started_at, finished_at \
             FROM workorders WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load workorder")?;

        row.as_ref().map(workorder_from_row).transpose()
    }

    async fn update_workorder(&self, order: &WorkOrder) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE workorders
            SET message = $2, started_at = $3, finished_at = $4
            WHERE id = $1
            "#,
        )
        .bind(order.id)
        .bind(&order.message)
        .bind(order.started_at)
        .bind(order.finished_at)
        .execute(&self.pool)
        .await
        .context("Failed to update workorder")?;

        Ok(())
    }

    async fn insert_job(&self, job: NewJob) -> Result<Job> {
        let row = sqlx::query(
            r#"
            INSERT INTO jobs (workorder_id, part, message, checkpoint)
            VALUES ($1, $2, $3, $4)
            RETURNING id, workorder_id, part, state, message, checkpoint,
                      created_at, updated_at, started_at, finished_at
            "#,
        )
        .bind(job.workorder_id)
        .bind(&job.part)
        .bind(&job.message)
        .bind(&job.checkpoint)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert job")?;

        job_from_row(&row)
    }

    async fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let row = sqlx::query(
            "SELECT id, workorder_id, part, state, message, checkpoint, \
             created_at, updated_at, started_at, finished_at \
             FROM jobs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load job")?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET state = $2, message = $3, checkpoint = $4, updated_at = NOW(),
                started_at = $5, finished_at = $6
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(job.state.as_str())
        .bind(&job.message)
        .bind(&job.checkpoint)
        .bind(job.started_at)
        .bind(job.finished_at)
        .execute(&self.pool)
        .await
        .context("Failed to update job")?;

        Ok(())
    }

    async fn jobs_for_workorder(&self, workorder_id: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT id, workorder_id, part, state, message, checkpoint, \
             created_at, updated_at, started_at, finished_at \
             FROM jobs WHERE workorder_id = $1 \
             ORDER BY created_at, id",
        )
        .bind(workorder_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list workorder jobs")?;

        rows.iter().map(job_from_row).collect()
    }

    async fn jobs_in_state(&self, state: JobState) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT id, workorder_id, part, state, message, checkpoint, \
             created_at, updated_at, started_at, finished_at \
             FROM jobs WHERE state = $1 \
             ORDER BY updated_at, id",
        )
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list jobs by state")?;

        rows.iter().map(job_from_row).collect()
    }
}
