use enginejobs::api;
use enginejobs::config;
use enginejobs::db;
use enginejobs::logging;

use enginejobs::jobs::maintenance::{cutoff_days, MaintenanceRepo};
use enginejobs::jobs::retry::RetryConfig;
use enginejobs::jobs::{JobsRepo, MetricsRepo, RunsRepo};

use tokio::sync::watch;
use tokio::task::JoinHandle;

mod handlers;
mod poller;
use handlers::{build_registry, JobContext};
use poller::Poller;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::from_env()?;
    logging::init(cfg.log_format);

    let registry = build_registry();

    tracing::info!(
        worker_id = %cfg.worker_id,
        concurrency = cfg.concurrency,
        poll_interval_ms = cfg.poll_interval_ms,
        max_poll_interval_ms = cfg.max_poll_interval_ms,
        stale_minutes = cfg.stale_minutes,
        reap_interval_secs = cfg.reap_interval_secs,
        admin_addr = cfg.admin_addr.as_deref().unwrap_or("disabled"),
        migrate_on_startup = cfg.migrate_on_startup,
        prune_completed_after_days = cfg.prune_completed_after_days,
        job_types = ?registry.supported_types(),
        "engine worker starting"
    );

    let pool_settings = db::PoolSettings::for_workers(cfg.concurrency);
    let pool = db::connect(&cfg.database_url, &pool_settings).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let jobs_repo = JobsRepo::new(pool.clone());
    let runs_repo = RunsRepo::new(pool.clone());
    let metrics_repo = MetricsRepo::new(pool.clone());
    let maintenance_repo = MaintenanceRepo::new(pool.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ---- API task ----
    let api_handle: Option<JoinHandle<anyhow::Result<()>>> = cfg.admin_addr.clone().map(|addr| {
        let app = api::router(api::ApiState {
            jobs: jobs_repo.clone(),
            runs: runs_repo.clone(),
            metrics: metrics_repo.clone(),
        });
        tokio::spawn(async move {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            tracing::info!(%addr, "admin api listening");
            axum::serve(listener, app).await?;
            Ok::<(), anyhow::Error>(())
        })
    });

    // ---- Reaper task ----
    let reaper_handle = {
        let jobs = jobs_repo.clone();
        let stale_minutes = cfg.stale_minutes;
        let mut tick = tokio::time::interval(cfg.reap_interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::spawn(async move {
            loop {
                tick.tick().await;
                if let Err(e) = jobs.requeue_stale(stale_minutes).await {
                    tracing::error!(error = %e, "requeue of stale claims failed");
                }
            }
        })
    };

    // ---- Maintenance task ----
    let maintenance_handle = {
        let maintenance = maintenance_repo.clone();
        let after_days = cfg.prune_completed_after_days;
        let mut tick = tokio::time::interval(cfg.maintenance_interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::spawn(async move {
            loop {
                tick.tick().await;
                if let Err(e) = maintenance
                    .prune_completed_older_than(cutoff_days(after_days), 500)
                    .await
                {
                    tracing::error!(error = %e, "pruning completed jobs failed");
                }
            }
        })
    };

    // ---- Poll tasks ----
    let poller = Poller {
        jobs: jobs_repo.clone(),
        registry: registry.clone(),
        ctx: JobContext {
            db: pool.clone(),
            worker_id: cfg.worker_id.clone(),
        },
        retry_cfg: RetryConfig::default(),
        poll_interval: cfg.poll_interval(),
        max_poll_interval: cfg.max_poll_interval(),
    };

    let poll_handles: Vec<JoinHandle<()>> = (0..cfg.concurrency)
        .map(|slot| tokio::spawn(poller.clone().run(slot, shutdown_rx.clone())))
        .collect();

    let api_failed = async {
        match api_handle {
            Some(handle) => handle.await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            tracing::info!("shutdown requested, finishing in-flight jobs");
        }
        res = api_failed => {
            tracing::error!("admin api stopped, shutting down");
            res??;
        }
    }

    let _ = shutdown_tx.send(true);
    reaper_handle.abort();
    maintenance_handle.abort();

    for handle in poll_handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "poller task panicked");
        }
    }

    tracing::info!("engine worker stopped");
    Ok(())
}
