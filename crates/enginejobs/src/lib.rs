//! Durable, multi-worker-safe job queue on PostgreSQL.
//!
//! Producers call [`jobs::JobsRepo::enqueue`]; workers poll
//! [`jobs::JobsRepo::claim_next`] and report back with `complete` or `fail`;
//! an operator-driven sweep calls `requeue_stale` to recover crashed claims.

pub mod api;
pub mod config;
pub mod db;
pub mod jobs;
pub mod logging;
