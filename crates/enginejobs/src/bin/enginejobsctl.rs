use enginejobs::config::LogFormat;
use enginejobs::{db, logging};
use enginejobs::jobs::{cutoff_days, JobStatus, JobsRepo, MaintenanceRepo, MetricsRepo, NewJob, RunsRepo};
use serde_json::json;
use sqlx::PgPool;
use std::env;

const USAGE: &str = "enginejobsctl <command>\n\
Commands:\n\
- migrate\n\
- reset\n\
- seed <n> [workspace_id]\n\
- counts\n\
- runs <job_id>\n\
- requeue-stale <minutes>\n\
- replay <job_id>\n\
- prune <days>\n\
\n\
Uses DATABASE_URL or TEST_DATABASE_URL.\n";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    logging::init(LogFormat::Pretty);
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!("{USAGE}");
        std::process::exit(2);
    }

    let url = env::var("DATABASE_URL")
        .or_else(|_| env::var("TEST_DATABASE_URL"))
        .map_err(|_| anyhow::anyhow!("DATABASE_URL or TEST_DATABASE_URL must be set"))?;

    let pool = db::connect(&url, &db::PoolSettings::for_cli()).await?;

    match args[1].as_str() {
        "migrate" => {
            db::run_migrations(&pool).await?;
            println!("migrations OK");
        }
        "reset" => reset(&pool).await?,
        "seed" => {
            let n: i64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(10);
            let workspace = args.get(3).map(String::as_str).unwrap_or("demo");
            seed(&pool, n, workspace).await?;
        }
        "counts" => show_counts(&pool).await?,
        "runs" => {
            let job_id = parse_job_id(args.get(2), "runs")?;
            print_runs(&pool, job_id).await?;
        }
        "requeue-stale" => {
            let minutes: i64 = args
                .get(2)
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| anyhow::anyhow!("usage: enginejobsctl requeue-stale <minutes>"))?;
            let n = JobsRepo::new(pool.clone()).requeue_stale(minutes).await?;
            println!("requeued {n} stale jobs");
        }
        "replay" => {
            let job_id = parse_job_id(args.get(2), "replay")?;
            let res = JobsRepo::new(pool.clone()).replay_job(job_id, None).await?;
            match res.job_id {
                Some(new_id) => println!("replayed job {job_id} as {new_id}"),
                None => println!("not replayed: a live job holds the same dedupe key"),
            }
        }
        "prune" => {
            let days: i64 = args
                .get(2)
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| anyhow::anyhow!("usage: enginejobsctl prune <days>"))?;
            let n = MaintenanceRepo::new(pool.clone())
                .prune_all_completed_older_than(cutoff_days(days), 500)
                .await?;
            println!("pruned {n} completed jobs");
        }
        other => {
            eprintln!("Unknown command: {other}\n\n{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}

fn parse_job_id(arg: Option<&String>, cmd: &str) -> anyhow::Result<i64> {
    arg.and_then(|s| s.parse().ok())
        .ok_or_else(|| anyhow::anyhow!("usage: enginejobsctl {cmd} <job_id>"))
}

async fn reset(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        TRUNCATE TABLE
            engine_job_runs,
            engine_jobs
        RESTART IDENTITY CASCADE
        "#,
    )
    .execute(pool)
    .await?;

    println!("reset OK");
    Ok(())
}

async fn seed(pool: &PgPool, n: i64, workspace_id: &str) -> anyhow::Result<()> {
    let jobs = JobsRepo::new(pool.clone());

    for i in 0..n {
        let job_type = match i % 3 {
            0 => "alert.check",
            1 => "forward_test.update",
            _ => "signal.label",
        };

        let res = jobs
            .enqueue(
                NewJob::new(workspace_id, job_type)
                    .payload(json!({ "seq": i }))
                    .priority(if i % 5 == 0 { 50 } else { 100 }),
            )
            .await?;

        if let Some(job_id) = res.job_id {
            println!("+ inserted job {job_type} id={job_id}");
        }
    }
    Ok(())
}

async fn show_counts(pool: &PgPool) -> anyhow::Result<()> {
    let m = MetricsRepo::new(pool.clone()).snapshot(None).await?;

    println!(
        "jobs: {}={} {}={} {}={} {}={} runnable={}",
        JobStatus::Pending,
        m.pending,
        JobStatus::Processing,
        m.processing,
        JobStatus::Completed,
        m.completed,
        JobStatus::Dead,
        m.dead,
        m.runnable_depth
    );
    Ok(())
}

async fn print_runs(pool: &PgPool, job_id: i64) -> anyhow::Result<()> {
    let Some(job) = JobsRepo::new(pool.clone()).get_job(job_id).await? else {
        anyhow::bail!("job {job_id} not found");
    };

    println!(
        "JOB: id={} workspace={} type={} status={} attempts={}/{} run_after={} locked_by={:?} last_error={:?}",
        job.id,
        job.workspace_id,
        job.job_type,
        job.status,
        job.attempts,
        job.max_attempts,
        job.run_after,
        job.locked_by,
        job.last_error
    );

    for run in RunsRepo::new(pool.clone()).list_for_job(job_id).await? {
        let outcome = if run.success {
            run.result
                .map(|v| format!("ok {v}"))
                .unwrap_or_else(|| "ok".to_string())
        } else {
            format!("err {}", run.error.unwrap_or_default())
        };
        println!(
            "{} -> {} | {} | {}",
            run.started_at.to_rfc3339(),
            run.finished_at.to_rfc3339(),
            run.worker_id,
            outcome
        );
    }

    Ok(())
}
