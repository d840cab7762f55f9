use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;

#[derive(Debug, Clone, Serialize)]
pub struct Metrics {
    pub at: DateTime<Utc>,
    pub workspace_id: Option<String>,

    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub dead: i64,

    /// Pending jobs whose `run_after` has passed.
    pub runnable_depth: i64,
    pub oldest_runnable_age_secs: f64,

    // last 60s window
    pub runs_finished_last_60s: i64,
    pub runs_succeeded_last_60s: i64,
    pub runs_failed_last_60s: i64,
}

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    pending: i64,
    processing: i64,
    completed: i64,
    dead: i64,
    runnable_depth: i64,
    oldest_runnable_age_secs: f64,
    runs_finished: i64,
    runs_succeeded: i64,
}

#[derive(Clone)]
pub struct MetricsRepo {
    pool: PgPool,
}

impl MetricsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn snapshot(&self, workspace_id: Option<&str>) -> anyhow::Result<Metrics> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            r#"
            WITH j AS (
              SELECT status, run_after
              FROM engine_jobs
              WHERE ($1::text IS NULL OR workspace_id = $1)
            ),
            r AS (
              SELECT success
              FROM engine_job_runs
              WHERE ($1::text IS NULL OR workspace_id = $1)
                AND finished_at >= now() - interval '60 seconds'
            )
            SELECT
              (SELECT COUNT(*) FROM j WHERE status = 'pending') AS pending,
              (SELECT COUNT(*) FROM j WHERE status = 'processing') AS processing,
              (SELECT COUNT(*) FROM j WHERE status = 'completed') AS completed,
              (SELECT COUNT(*) FROM j WHERE status = 'dead') AS dead,
              (SELECT COUNT(*) FROM j WHERE status = 'pending' AND run_after <= now()) AS runnable_depth,
              COALESCE(
                (SELECT EXTRACT(EPOCH FROM (now() - MIN(run_after)))::float8
                 FROM j WHERE status = 'pending' AND run_after <= now()),
                0.0
              ) AS oldest_runnable_age_secs,
              (SELECT COUNT(*) FROM r) AS runs_finished,
              (SELECT COUNT(*) FROM r WHERE success) AS runs_succeeded
            "#,
        )
        .bind(workspace_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(Metrics {
            at: Utc::now(),
            workspace_id: workspace_id.map(str::to_string),
            pending: row.pending,
            processing: row.processing,
            completed: row.completed,
            dead: row.dead,
            runnable_depth: row.runnable_depth,
            oldest_runnable_age_secs: row.oldest_runnable_age_secs,
            runs_finished_last_60s: row.runs_finished,
            runs_succeeded_last_60s: row.runs_succeeded,
            runs_failed_last_60s: row.runs_finished - row.runs_succeeded,
        })
    }

    /// Minimal Prometheus text format (no extra crate needed).
    pub async fn render_prometheus(&self) -> anyhow::Result<String> {
        let m = self.snapshot(None).await?;
        Ok(render_prometheus(&m))
    }
}

pub fn render_prometheus(m: &Metrics) -> String {
    let mut out = String::new();
    out.push_str("# HELP engine_jobs_by_status Number of jobs per status\n");
    out.push_str("# TYPE engine_jobs_by_status gauge\n");
    for (status, n) in [
        ("pending", m.pending),
        ("processing", m.processing),
        ("completed", m.completed),
        ("dead", m.dead),
    ] {
        out.push_str(&format!(
            "engine_jobs_by_status{{status=\"{status}\"}} {n}\n"
        ));
    }
    out.push_str(&format!(
        concat!(
            "# HELP engine_jobs_runnable_depth Pending jobs eligible for claim\n",
            "# TYPE engine_jobs_runnable_depth gauge\n",
            "engine_jobs_runnable_depth {}\n",
            "# HELP engine_jobs_oldest_runnable_age_seconds Age of the oldest runnable job\n",
            "# TYPE engine_jobs_oldest_runnable_age_seconds gauge\n",
            "engine_jobs_oldest_runnable_age_seconds {}\n",
            "# HELP engine_job_runs_succeeded_last_60s Successful runs in the last 60s\n",
            "# TYPE engine_job_runs_succeeded_last_60s gauge\n",
            "engine_job_runs_succeeded_last_60s {}\n",
            "# HELP engine_job_runs_failed_last_60s Failed runs in the last 60s\n",
            "# TYPE engine_job_runs_failed_last_60s gauge\n",
            "engine_job_runs_failed_last_60s {}\n",
        ),
        m.runnable_depth,
        m.oldest_runnable_age_secs,
        m.runs_succeeded_last_60s,
        m.runs_failed_last_60s,
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prometheus_output_has_one_line_per_status() {
        let m = Metrics {
            at: Utc::now(),
            workspace_id: None,
            pending: 3,
            processing: 1,
            completed: 9,
            dead: 2,
            runnable_depth: 2,
            oldest_runnable_age_secs: 1.5,
            runs_finished_last_60s: 4,
            runs_succeeded_last_60s: 3,
            runs_failed_last_60s: 1,
        };
        let text = render_prometheus(&m);
        assert!(text.contains("engine_jobs_by_status{status=\"pending\"} 3\n"));
        assert!(text.contains("engine_jobs_by_status{status=\"dead\"} 2\n"));
        assert!(text.contains("engine_jobs_runnable_depth 2\n"));
        assert!(text.contains("engine_job_runs_failed_last_60s 1\n"));
    }
}
