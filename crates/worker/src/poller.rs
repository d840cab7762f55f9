use crate::handlers::{HandlerRegistry, JobContext, JobError};
use enginejobs::jobs::retry::{next_delay_seconds, RetryConfig};
use enginejobs::jobs::{Job, JobsRepo, ReportOutcome};
use rand::{rngs::StdRng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

#[derive(Clone)]
pub struct Poller {
    pub jobs: JobsRepo,
    pub registry: Arc<HandlerRegistry>,
    pub ctx: JobContext,
    pub retry_cfg: RetryConfig,
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,
}

/// Empty claims double the sleep up to `max`.
pub fn next_idle_delay(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

impl Poller {
    /// Claim and run jobs until `shutdown` flips to true. A job already
    /// claimed is always reported before the loop exits.
    pub async fn run(self, slot: usize, mut shutdown: watch::Receiver<bool>) {
        let supported = self.registry.supported_types();
        let worker_id = self.ctx.worker_id.clone();
        let mut idle = self.poll_interval;

        tracing::info!(slot, worker_id = %worker_id, types = ?supported, "poller started");

        while !*shutdown.borrow() {
            let claimed = match self
                .jobs
                .claim_next(&worker_id, Some(supported.as_slice()))
                .await
            {
                Ok(claimed) => claimed,
                Err(e) => {
                    tracing::error!(slot, error = %e, "claim failed");
                    None
                }
            };

            let Some(job) = claimed else {
                tokio::select! {
                    _ = tokio::time::sleep(idle) => {}
                    _ = shutdown.changed() => {}
                }
                idle = next_idle_delay(idle, self.max_poll_interval);
                continue;
            };

            idle = self.poll_interval;

            if let Err(e) = self.process(job).await {
                tracing::error!(slot, error = %e, "reporting job outcome failed");
            }
        }

        tracing::info!(slot, worker_id = %worker_id, "poller stopped");
    }

    async fn process(&self, job: Job) -> anyhow::Result<()> {
        let start = Instant::now();
        let job_id = job.id;
        let job_type = job.job_type.clone();
        let lock_token = job.lock_token;
        let attempts = job.attempts;

        tracing::debug!(job_id, job_type = %job_type, attempts, "running job");

        let result = match self.registry.handler_for(&job.job_type) {
            Some(entry) => {
                let ctx = self.ctx.clone();
                // Own task so a panicking handler becomes a failed attempt.
                match tokio::spawn(async move { entry.run(&job, &ctx).await }).await {
                    Ok(res) => res,
                    Err(join_err) => Err(JobError::new("PANIC", join_err.to_string())),
                }
            }
            None => Err(JobError::new(
                "UNKNOWN_JOB_TYPE",
                format!("no handler for job_type={job_type}"),
            )),
        };

        let worker_id = &self.ctx.worker_id;
        let latency_ms = start.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(value) => {
                self.jobs
                    .complete(job_id, worker_id, lock_token, value.as_ref())
                    .await?
            }
            Err(err) => {
                let delay = err.retry_after_secs.unwrap_or_else(|| {
                    let mut rng = StdRng::from_entropy();
                    next_delay_seconds(attempts, &self.retry_cfg, &mut rng)
                });
                self.jobs
                    .fail(job_id, worker_id, lock_token, &err.to_string(), Some(delay))
                    .await?
            }
        };

        match outcome {
            ReportOutcome::Completed => {
                tracing::info!(job_id, job_type = %job_type, latency_ms, "job completed")
            }
            ReportOutcome::Retrying { run_after } => tracing::warn!(
                job_id,
                job_type = %job_type,
                attempts,
                %run_after,
                latency_ms,
                "job failed, retry scheduled"
            ),
            ReportOutcome::Dead => tracing::error!(
                job_id,
                job_type = %job_type,
                attempts,
                latency_ms,
                "job dead-lettered"
            ),
            ReportOutcome::Stale => tracing::warn!(
                job_id,
                job_type = %job_type,
                latency_ms,
                "claim was lost before the result was reported"
            ),
        }

        Ok(())
    }
}
