use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;

#[derive(Clone)]
pub struct MaintenanceRepo {
    pool: PgPool,
}

impl MaintenanceRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Delete up to `batch` completed jobs finished before `cutoff`.
    /// Their run rows go with them (ON DELETE CASCADE). Dead jobs are kept
    /// for manual inspection. Returns number deleted.
    pub async fn prune_completed_older_than(
        &self,
        cutoff: DateTime<Utc>,
        batch: i64,
    ) -> anyhow::Result<u64> {
        let batch = batch.max(1);

        let deleted = sqlx::query(
            r#"
            WITH candidates AS (
                SELECT id
                FROM engine_jobs
                WHERE status = 'completed'
                  AND completed_at < $1
                ORDER BY completed_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $2
            )
            DELETE FROM engine_jobs j
            USING candidates c
            WHERE j.id = c.id
            "#,
        )
        .bind(cutoff)
        .bind(batch)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if deleted > 0 {
            tracing::info!(deleted, %cutoff, "pruned completed jobs");
        }

        Ok(deleted)
    }

    /// Keep pruning in batches until a pass deletes fewer than `batch` rows.
    pub async fn prune_all_completed_older_than(
        &self,
        cutoff: DateTime<Utc>,
        batch: i64,
    ) -> anyhow::Result<u64> {
        let batch = batch.max(1);
        let mut total = 0;
        loop {
            let n = self.prune_completed_older_than(cutoff, batch).await?;
            total += n;
            if n < batch as u64 {
                return Ok(total);
            }
        }
    }
}

/// Convenience: compute cutoff like "now - N days"
pub fn cutoff_days(days: i64) -> DateTime<Utc> {
    Utc::now() - Duration::days(days)
}
