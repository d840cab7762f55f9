use crate::config::env_bool;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

/// Connections kept beside the pollers for the reaper, retention and admin API.
const BACKGROUND_CONNECTIONS: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub disable_jit: bool,
}

impl PoolSettings {
    /// Sized for `concurrency` poll tasks. A poller holds at most one
    /// connection at a time (claim, then report), so the pool is
    /// `concurrency` plus the background headroom unless
    /// `ENGINE_JOBS_DB_MAX_CONNECTIONS` says otherwise.
    pub fn for_workers(concurrency: usize) -> Self {
        let sized = u32::try_from(concurrency)
            .unwrap_or(u32::MAX)
            .saturating_add(BACKGROUND_CONNECTIONS);
        Self::from_env(sized)
    }

    /// One-shot operator commands.
    pub fn for_cli() -> Self {
        Self::from_env(2)
    }

    fn from_env(default_max: u32) -> Self {
        let max_connections = std::env::var("ENGINE_JOBS_DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
            .unwrap_or(default_max)
            .clamp(1, 128);

        let acquire_timeout_secs = std::env::var("ENGINE_JOBS_DB_ACQUIRE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(10)
            .clamp(1, 60);

        Self {
            max_connections,
            acquire_timeout: Duration::from_secs(acquire_timeout_secs),
            disable_jit: env_bool("ENGINE_JOBS_DISABLE_JIT").unwrap_or(true),
        }
    }
}

/// Open the shared store handle every repository is built from.
pub async fn connect(database_url: &str, settings: &PoolSettings) -> anyhow::Result<PgPool> {
    let disable_jit = settings.disable_jit;

    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.acquire_timeout)
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                if disable_jit {
                    sqlx::query("SET jit = OFF").execute(&mut *conn).await?;
                }
                Ok(())
            })
        })
        .connect(database_url)
        .await?;

    tracing::debug!(
        max_connections = settings.max_connections,
        acquire_timeout_secs = settings.acquire_timeout.as_secs(),
        disable_jit,
        "database pool ready"
    );

    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    let migrator = sqlx::migrate!("./migrations");
    migrator.run(pool).await?;
    tracing::info!(known = migrator.iter().count(), "migrations applied");
    Ok(())
}
