use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{PgConnection, PgPool};

/// One execution attempt. Rows are insert-only.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct JobRun {
    pub id: i64,
    pub job_id: i64,
    pub workspace_id: String,
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
}

pub(crate) struct NewRun<'a> {
    pub job_id: i64,
    pub workspace_id: &'a str,
    pub worker_id: &'a str,
    pub started_at: DateTime<Utc>,
    pub outcome: RunOutcome<'a>,
}

pub(crate) enum RunOutcome<'a> {
    Succeeded(Option<&'a Value>),
    Failed(&'a str),
}

/// Appends a run row on the caller's connection so it commits together with
/// the job transition that produced it.
pub(crate) async fn record_run(conn: &mut PgConnection, run: NewRun<'_>) -> anyhow::Result<i64> {
    let (success, result, error) = match run.outcome {
        RunOutcome::Succeeded(result) => (true, result, None),
        RunOutcome::Failed(error) => (false, None, Some(error)),
    };

    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO engine_job_runs
            (job_id, workspace_id, worker_id, started_at, finished_at, success, result, error)
        VALUES ($1, $2, $3, $4, now(), $5, $6, $7)
        RETURNING id
        "#,
    )
    .bind(run.job_id)
    .bind(run.workspace_id)
    .bind(run.worker_id)
    .bind(run.started_at)
    .bind(success)
    .bind(result)
    .bind(error)
    .fetch_one(&mut *conn)
    .await?;

    Ok(id)
}

#[derive(Clone)]
pub struct RunsRepo {
    pool: PgPool,
}

impl RunsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn list_for_job(&self, job_id: i64) -> anyhow::Result<Vec<JobRun>> {
        let rows = sqlx::query_as::<_, JobRun>(
            r#"
            SELECT *
            FROM engine_job_runs
            WHERE job_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Newest failed runs first, optionally for one workspace.
    pub async fn recent_failures(
        &self,
        workspace_id: Option<&str>,
        limit: i64,
    ) -> anyhow::Result<Vec<JobRun>> {
        let limit = limit.clamp(1, 500);

        let rows = sqlx::query_as::<_, JobRun>(
            r#"
            SELECT *
            FROM engine_job_runs
            WHERE success = false
              AND ($1::text IS NULL OR workspace_id = $1)
            ORDER BY id DESC
            LIMIT $2
            "#,
        )
        .bind(workspace_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
