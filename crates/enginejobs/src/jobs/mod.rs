pub mod maintenance;
pub mod metrics;
pub mod model;
pub mod repo;
pub mod retry;
pub mod runs;

pub use maintenance::{cutoff_days, MaintenanceRepo};
pub use metrics::{Metrics, MetricsRepo};
pub use model::{EnqueueResult, Job, JobStatus, NewJob, ReportOutcome};
pub use repo::JobsRepo;
pub use runs::{JobRun, RunsRepo};
