// crates/enginejobs/src/api/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::jobs::{Job, JobRun};

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub workspace_id: Option<String>,
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub before_id: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ListJobsResponse {
    pub items: Vec<Job>,
    pub next_before_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct DeadQuery {
    pub workspace_id: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct JobRunsResponse {
    pub job_id: i64,
    pub runs: Vec<JobRun>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReplayRequest {
    pub run_after: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct ReplayResponse {
    pub enqueued: bool,
    pub new_job_id: Option<i64>,
    pub replay_of_job_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct RequeueStaleRequest {
    pub stale_minutes: i64,
}

#[derive(Debug, Serialize)]
pub struct RequeueStaleResponse {
    pub requeued: u64,
}

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    pub workspace_id: Option<String>,
}
