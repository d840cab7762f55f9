use enginejobs::jobs::Job;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::PgPool;
use std::{collections::HashMap, pin::Pin, sync::Arc};
use tokio::sync::Semaphore;

pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
pub type HandlerResult = Result<Option<Value>, JobError>;
type HandlerFn = dyn for<'a> Fn(&'a Job, &'a JobContext) -> BoxFuture<'a, HandlerResult> + Send + Sync;

/// A handler's failure report. `retry_after_secs` overrides the worker's
/// backoff policy for this attempt.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct JobError {
    pub code: &'static str,
    pub message: String,
    pub retry_after_secs: Option<i64>,
}

impl JobError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry_after_secs: None,
        }
    }

    pub fn retry_after(mut self, secs: i64) -> Self {
        self.retry_after_secs = Some(secs);
        self
    }
}

#[derive(Clone)]
pub struct JobContext {
    pub db: PgPool,
    pub worker_id: String,
}

#[derive(Clone)]
pub struct HandlerEntry {
    pub handler: Arc<HandlerFn>,
    pub semaphore: Option<Arc<Semaphore>>,
}

/// Static `job_type` -> handler table, assembled once at startup.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, HandlerEntry>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, job_type: &str, handler: F)
    where
        F: for<'a> Fn(&'a Job, &'a JobContext) -> BoxFuture<'a, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        self.insert(job_type, handler, None);
    }

    pub fn register_with_limit<F>(&mut self, job_type: &str, handler: F, max_concurrency: usize)
    where
        F: for<'a> Fn(&'a Job, &'a JobContext) -> BoxFuture<'a, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        self.insert(
            job_type,
            handler,
            Some(Arc::new(Semaphore::new(max_concurrency.max(1)))),
        );
    }

    fn insert<F>(&mut self, job_type: &str, handler: F, semaphore: Option<Arc<Semaphore>>)
    where
        F: for<'a> Fn(&'a Job, &'a JobContext) -> BoxFuture<'a, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(
            job_type.to_string(),
            HandlerEntry {
                handler: Arc::new(handler),
                semaphore,
            },
        );
    }

    pub fn handler_for(&self, job_type: &str) -> Option<HandlerEntry> {
        self.handlers.get(job_type).cloned()
    }

    /// Job types this worker can run, sorted. Passed to `claim_next` so the
    /// worker never claims a job it has no handler for.
    pub fn supported_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

impl HandlerEntry {
    pub async fn run(&self, job: &Job, ctx: &JobContext) -> HandlerResult {
        let _permit = match &self.semaphore {
            Some(sem) => Some(
                sem.clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| JobError::new("WORKER_SHUTDOWN", "handler semaphore closed"))?,
            ),
            None => None,
        };

        (self.handler)(job, ctx).await
    }
}

fn parse_payload<T: for<'de> Deserialize<'de>>(job: &Job) -> Result<T, JobError> {
    serde_json::from_value(job.payload.clone())
        .map_err(|e| JobError::new("BAD_PAYLOAD", e.to_string()))
}

pub(crate) fn boxed<'a, T>(fut: impl std::future::Future<Output = T> + Send + 'a) -> BoxFuture<'a, T> {
    Box::pin(fut)
}

#[derive(Deserialize)]
struct AlertCheckPayload {
    alert_id: i64,
    symbol: String,
}

#[derive(Deserialize)]
struct ForwardTestPayload {
    forward_test_id: i64,
}

#[derive(Deserialize)]
struct SignalLabelPayload {
    signal_id: i64,
    #[serde(default)]
    horizon_bars: Option<u32>,
}

/// Business logic lives with the features that enqueue these jobs; the
/// handlers here validate the payload and acknowledge it.
pub fn build_registry() -> Arc<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();

    registry.register("alert.check", |job, _ctx| {
        boxed(async move {
            let payload: AlertCheckPayload = parse_payload(job)?;
            if payload.symbol.trim().is_empty() {
                return Err(JobError::new("BAD_PAYLOAD", "symbol is empty"));
            }
            Ok(Some(json!({
                "alert_id": payload.alert_id,
                "symbol": payload.symbol,
                "checked": true,
            })))
        })
    });

    registry.register_with_limit(
        "forward_test.update",
        |job, ctx| {
            boxed(async move {
                let payload: ForwardTestPayload = parse_payload(job)?;

                // Updates still queued behind this one for the workspace.
                let queued_behind: i64 = sqlx::query_scalar(
                    r#"
                    SELECT COUNT(*)
                    FROM engine_jobs
                    WHERE workspace_id = $1
                      AND job_type = $2
                      AND status = 'pending'
                    "#,
                )
                .bind(&job.workspace_id)
                .bind(&job.job_type)
                .fetch_one(&ctx.db)
                .await
                .map_err(|e| JobError::new("DB_UNAVAILABLE", e.to_string()).retry_after(30))?;

                Ok(Some(json!({
                    "forward_test_id": payload.forward_test_id,
                    "queued_behind": queued_behind,
                })))
            })
        },
        8,
    );

    registry.register("signal.label", |job, _ctx| {
        boxed(async move {
            let payload: SignalLabelPayload = parse_payload(job)?;
            Ok(Some(json!({
                "signal_id": payload.signal_id,
                "horizon_bars": payload.horizon_bars.unwrap_or(20),
            })))
        })
    });

    Arc::new(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn job(job_type: &str, payload: Value) -> Job {
        let now = Utc::now();
        Job {
            id: 1,
            workspace_id: "ws".into(),
            job_type: job_type.into(),
            status: "processing".into(),
            payload,
            dedupe_key: None,
            priority: 100,
            run_after: now,
            attempts: 1,
            max_attempts: 5,
            lock_token: None,
            locked_at: Some(now),
            locked_by: Some("w".into()),
            last_error: None,
            replay_of_job_id: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    fn ctx() -> JobContext {
        JobContext {
            db: sqlx::postgres::PgPoolOptions::new()
                .connect_lazy("postgres://localhost/unused")
                .unwrap(),
            worker_id: "w".into(),
        }
    }

    #[test]
    fn supported_types_lists_registered_handlers() {
        let registry = build_registry();
        assert_eq!(
            registry.supported_types(),
            vec!["alert.check", "forward_test.update", "signal.label"]
        );
        assert!(registry.handler_for("unknown").is_none());
    }

    #[tokio::test]
    async fn alert_check_acknowledges_valid_payload() {
        let registry = build_registry();
        let entry = registry.handler_for("alert.check").unwrap();
        let out = entry
            .run(&job("alert.check", json!({"alert_id": 7, "symbol": "BTC"})), &ctx())
            .await
            .unwrap();
        assert_eq!(out.unwrap()["alert_id"], 7);
    }

    #[tokio::test]
    async fn bad_payload_is_reported_as_job_error() {
        let registry = build_registry();
        let entry = registry.handler_for("signal.label").unwrap();
        let err = entry
            .run(&job("signal.label", json!({"nope": true})), &ctx())
            .await
            .unwrap_err();
        assert_eq!(err.code, "BAD_PAYLOAD");
        assert!(err.to_string().starts_with("BAD_PAYLOAD: "));
    }

    #[tokio::test]
    async fn unreachable_database_asks_for_a_later_retry() {
        let ctx = JobContext {
            db: sqlx::postgres::PgPoolOptions::new()
                .acquire_timeout(std::time::Duration::from_millis(300))
                .connect_lazy("postgres://nobody@127.0.0.1:1/none")
                .unwrap(),
            worker_id: "w".into(),
        };
        let registry = build_registry();
        let entry = registry.handler_for("forward_test.update").unwrap();
        let err = entry
            .run(
                &job("forward_test.update", json!({"forward_test_id": 3})),
                &ctx,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, "DB_UNAVAILABLE");
        assert_eq!(err.retry_after_secs, Some(30));
    }
}
