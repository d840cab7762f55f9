// crates/enginejobs/src/jobs/repo.rs

use crate::jobs::model::{
    truncate_error, EnqueueResult, Job, JobStatus, NewJob, ReportOutcome, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_PRIORITY,
};
use crate::jobs::retry::effective_retry_delay_secs;
use crate::jobs::runs::{record_run, NewRun, RunOutcome};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Clone)]
pub struct JobsRepo {
    pool: PgPool,
}

/// Row locked by a `complete`/`fail` report before it transitions.
#[derive(sqlx::FromRow)]
struct OwnedClaim {
    workspace_id: String,
    job_type: String,
    attempts: i32,
    max_attempts: i32,
    locked_at: DateTime<Utc>,
}

impl JobsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ----------------------------
    // Enqueue
    // ----------------------------

    /// Insert a pending job unless a live job with the same
    /// `(workspace_id, dedupe_key)` already exists.
    ///
    /// The partial unique index makes this atomic: of two racing enqueues
    /// with the same key exactly one row is created.
    pub async fn enqueue(&self, job: NewJob) -> anyhow::Result<EnqueueResult> {
        job.validate()?;

        let priority = job.priority.unwrap_or(DEFAULT_PRIORITY);
        let max_attempts = job.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);

        let id: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO engine_jobs
                (workspace_id, job_type, status, payload, dedupe_key, priority, run_after, max_attempts)
            VALUES (
                $1, $2, $3, $4, $5, $6,
                COALESCE($7, now() + (COALESCE($9::bigint, 0) * interval '1 second')),
                $8
            )
            ON CONFLICT (workspace_id, dedupe_key)
                WHERE dedupe_key IS NOT NULL AND status IN ('pending', 'processing')
                DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&job.workspace_id)
        .bind(&job.job_type)
        .bind(JobStatus::Pending.as_str())
        .bind(&job.payload)
        .bind(&job.dedupe_key)
        .bind(priority)
        .bind(job.run_after)
        .bind(max_attempts)
        .bind(job.delay_secs)
        .fetch_optional(&self.pool)
        .await?;

        match id {
            Some(id) => {
                tracing::debug!(
                    job_id = id,
                    workspace_id = %job.workspace_id,
                    job_type = %job.job_type,
                    "enqueued job"
                );
                Ok(EnqueueResult::inserted(id))
            }
            None => {
                tracing::debug!(
                    workspace_id = %job.workspace_id,
                    job_type = %job.job_type,
                    dedupe_key = ?job.dedupe_key,
                    "enqueue skipped, live job with same dedupe key"
                );
                Ok(EnqueueResult::deduplicated())
            }
        }
    }

    pub async fn enqueue_now(
        &self,
        workspace_id: &str,
        job_type: &str,
        payload: Value,
    ) -> anyhow::Result<EnqueueResult> {
        self.enqueue(NewJob::new(workspace_id, job_type).payload(payload))
            .await
    }

    pub async fn enqueue_in(
        &self,
        workspace_id: &str,
        job_type: &str,
        payload: Value,
        delay_secs: i64,
    ) -> anyhow::Result<EnqueueResult> {
        self.enqueue(
            NewJob::new(workspace_id, job_type)
                .payload(payload)
                .delay_secs(delay_secs),
        )
        .await
    }

    // ----------------------------
    // Claim
    // ----------------------------

    /// Claim the next eligible job for `worker_id`, or `None` if nothing is
    /// runnable right now.
    ///
    /// Eligible: `pending`, `run_after <= now()`, and `job_type` in
    /// `supported_types` when given. Order is `(priority ASC, id ASC)`.
    ///
    /// Correctness: SELECT ... FOR UPDATE SKIP LOCKED in the same transaction
    /// as the UPDATE, so concurrent claimers step over each other's candidate
    /// instead of waiting on it, and no job is handed out twice.
    pub async fn claim_next(
        &self,
        worker_id: &str,
        supported_types: Option<&[String]>,
    ) -> anyhow::Result<Option<Job>> {
        if matches!(supported_types, Some(types) if types.is_empty()) {
            return Ok(None);
        }
        let types: Option<Vec<String>> = supported_types.map(|t| t.to_vec());

        let mut tx = self.pool.begin().await?;

        let candidate: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT id
            FROM engine_jobs
            WHERE status = 'pending'
              AND run_after <= now()
              AND ($1::text[] IS NULL OR job_type = ANY($1))
            ORDER BY priority ASC, id ASC
            FOR UPDATE SKIP LOCKED
            LIMIT 1
            "#,
        )
        .bind(types)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job_id) = candidate else {
            tx.commit().await?;
            return Ok(None);
        };

        let claimed = sqlx::query_as::<_, Job>(
            r#"
            UPDATE engine_jobs
            SET status = 'processing',
                lock_token = $2,
                locked_at = now(),
                locked_by = $3,
                attempts = attempts + 1,
                updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(Uuid::new_v4())
        .bind(worker_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(
            job_id = claimed.id,
            job_type = %claimed.job_type,
            worker_id,
            attempts = claimed.attempts,
            "claimed job"
        );

        Ok(Some(claimed))
    }

    // ----------------------------
    // Completion / failure
    // ----------------------------

    /// Lock the job row if `worker_id` (and `lock_token`, when given) still
    /// owns its claim.
    async fn lock_owned_claim(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        job_id: i64,
        worker_id: &str,
        lock_token: Option<Uuid>,
    ) -> anyhow::Result<Option<OwnedClaim>> {
        let claim = sqlx::query_as::<_, OwnedClaim>(
            r#"
            SELECT workspace_id, job_type, attempts, max_attempts, locked_at
            FROM engine_jobs
            WHERE id = $1
              AND status = 'processing'
              AND locked_by = $2
              AND ($3::uuid IS NULL OR lock_token = $3)
            FOR UPDATE
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(lock_token)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(claim)
    }

    /// Mark a claimed job completed and append a successful run.
    ///
    /// Returns [`ReportOutcome::Stale`] without writing anything when the
    /// caller no longer owns the claim.
    pub async fn complete(
        &self,
        job_id: i64,
        worker_id: &str,
        lock_token: Option<Uuid>,
        result: Option<&Value>,
    ) -> anyhow::Result<ReportOutcome> {
        let mut tx = self.pool.begin().await?;

        let Some(claim) = Self::lock_owned_claim(&mut tx, job_id, worker_id, lock_token).await?
        else {
            tx.commit().await?;
            tracing::warn!(job_id, worker_id, "ignoring completion for a claim no longer held");
            return Ok(ReportOutcome::Stale);
        };

        sqlx::query(
            r#"
            UPDATE engine_jobs
            SET status = 'completed',
                completed_at = now(),
                lock_token = NULL,
                locked_at = NULL,
                locked_by = NULL,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        record_run(
            &mut *tx,
            NewRun {
                job_id,
                workspace_id: &claim.workspace_id,
                worker_id,
                started_at: claim.locked_at,
                outcome: RunOutcome::Succeeded(result),
            },
        )
        .await?;

        tx.commit().await?;

        tracing::debug!(job_id, job_type = %claim.job_type, worker_id, "completed job");
        Ok(ReportOutcome::Completed)
    }

    /// Record a failed attempt. Re-pends the job after
    /// `max(15s, retry_delay_seconds)` while attempts remain, otherwise
    /// dead-letters it. `run_after` is left alone on the dead path.
    pub async fn fail(
        &self,
        job_id: i64,
        worker_id: &str,
        lock_token: Option<Uuid>,
        error: &str,
        retry_delay_seconds: Option<i64>,
    ) -> anyhow::Result<ReportOutcome> {
        let error = truncate_error(error);
        let mut tx = self.pool.begin().await?;

        let Some(claim) = Self::lock_owned_claim(&mut tx, job_id, worker_id, lock_token).await?
        else {
            tx.commit().await?;
            tracing::warn!(job_id, worker_id, "ignoring failure for a claim no longer held");
            return Ok(ReportOutcome::Stale);
        };

        let outcome = if claim.attempts >= claim.max_attempts {
            sqlx::query(
                r#"
                UPDATE engine_jobs
                SET status = 'dead',
                    lock_token = NULL,
                    locked_at = NULL,
                    locked_by = NULL,
                    last_error = $2,
                    updated_at = now()
                WHERE id = $1
                "#,
            )
            .bind(job_id)
            .bind(&error)
            .execute(&mut *tx)
            .await?;

            ReportOutcome::Dead
        } else {
            let delay_secs = effective_retry_delay_secs(retry_delay_seconds);
            let run_after: DateTime<Utc> = sqlx::query_scalar(
                r#"
                UPDATE engine_jobs
                SET status = 'pending',
                    run_after = now() + ($2::bigint * interval '1 second'),
                    lock_token = NULL,
                    locked_at = NULL,
                    locked_by = NULL,
                    last_error = $3,
                    updated_at = now()
                WHERE id = $1
                RETURNING run_after
                "#,
            )
            .bind(job_id)
            .bind(delay_secs)
            .bind(&error)
            .fetch_one(&mut *tx)
            .await?;

            ReportOutcome::Retrying { run_after }
        };

        record_run(
            &mut *tx,
            NewRun {
                job_id,
                workspace_id: &claim.workspace_id,
                worker_id,
                started_at: claim.locked_at,
                outcome: RunOutcome::Failed(&error),
            },
        )
        .await?;

        tx.commit().await?;

        match outcome {
            ReportOutcome::Dead => tracing::info!(
                job_id,
                job_type = %claim.job_type,
                worker_id,
                attempts = claim.attempts,
                max_attempts = claim.max_attempts,
                "job exhausted its attempts, dead-lettered"
            ),
            ReportOutcome::Retrying { run_after } => tracing::debug!(
                job_id,
                job_type = %claim.job_type,
                worker_id,
                attempts = claim.attempts,
                %run_after,
                "job failed, scheduled for retry"
            ),
            _ => {}
        }

        Ok(outcome)
    }

    // ----------------------------
    // Reaper
    // ----------------------------

    /// Return every `processing` job locked more than `stale_minutes` ago to
    /// `pending`. `attempts` is untouched: a reclaim is not a failed attempt.
    pub async fn requeue_stale(&self, stale_minutes: i64) -> anyhow::Result<u64> {
        let stale_minutes = stale_minutes.max(0);

        let res = sqlx::query(
            r#"
            UPDATE engine_jobs
            SET status = 'pending',
                lock_token = NULL,
                locked_at = NULL,
                locked_by = NULL,
                updated_at = now()
            WHERE status = 'processing'
              AND locked_at < now() - ($1::bigint * interval '1 minute')
            "#,
        )
        .bind(stale_minutes)
        .execute(&self.pool)
        .await?;

        let n = res.rows_affected();
        if n > 0 {
            tracing::info!(requeued = n, stale_minutes, "requeued stale claims");
        }
        Ok(n)
    }

    // ----------------------------
    // Reads
    // ----------------------------

    pub async fn get_job(&self, job_id: i64) -> anyhow::Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM engine_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    /// Keyset-paginated list, newest first. `before_id` is the last id of the
    /// previous page. `limit` is clamped to [1, 500].
    pub async fn list_jobs(
        &self,
        workspace_id: Option<&str>,
        status: Option<JobStatus>,
        limit: i64,
        before_id: Option<i64>,
    ) -> anyhow::Result<Vec<Job>> {
        let limit = limit.clamp(1, 500);

        let rows = sqlx::query_as::<_, Job>(
            r#"
            SELECT *
            FROM engine_jobs
            WHERE ($1::text IS NULL OR workspace_id = $1)
              AND ($2::text IS NULL OR status = $2)
              AND ($3::bigint IS NULL OR id < $3)
            ORDER BY id DESC
            LIMIT $4
            "#,
        )
        .bind(workspace_id)
        .bind(status.map(|s| s.as_str()))
        .bind(before_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn list_dead(
        &self,
        workspace_id: Option<&str>,
        limit: i64,
    ) -> anyhow::Result<Vec<Job>> {
        self.list_jobs(workspace_id, Some(JobStatus::Dead), limit, None)
            .await
    }

    // ----------------------------
    // Replay
    // ----------------------------

    /// Re-run a finished job as a fresh pending copy linked through
    /// `replay_of_job_id`. The source row is not modified.
    ///
    /// Errors if the job does not exist or is still live. If the copy's
    /// dedupe key is held by a live job, nothing is inserted.
    pub async fn replay_job(
        &self,
        job_id: i64,
        run_after: Option<DateTime<Utc>>,
    ) -> anyhow::Result<EnqueueResult> {
        let mut tx = self.pool.begin().await?;

        let src = sqlx::query_as::<_, Job>("SELECT * FROM engine_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| anyhow::anyhow!("JOB_NOT_FOUND: job {job_id} does not exist"))?;

        if !src.is_terminal() {
            anyhow::bail!(
                "JOB_NOT_TERMINAL: job {job_id} is {} and cannot be replayed",
                src.status
            );
        }

        let new_id: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO engine_jobs (
                workspace_id, job_type, status, payload, dedupe_key,
                priority, run_after, max_attempts, replay_of_job_id
            )
            VALUES ($1, $2, 'pending', $3, $4, $5, COALESCE($6, now()), $7, $8)
            ON CONFLICT (workspace_id, dedupe_key)
                WHERE dedupe_key IS NOT NULL AND status IN ('pending', 'processing')
                DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&src.workspace_id)
        .bind(&src.job_type)
        .bind(&src.payload)
        .bind(&src.dedupe_key)
        .bind(src.priority)
        .bind(run_after)
        .bind(src.max_attempts)
        .bind(src.id)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;

        if let Some(id) = new_id {
            tracing::info!(job_id = id, replay_of_job_id = src.id, "replayed job");
        }

        Ok(new_id.map_or_else(EnqueueResult::deduplicated, EnqueueResult::inserted))
    }
}
