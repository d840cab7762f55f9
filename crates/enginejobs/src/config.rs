use std::time::Duration;

/// Runtime configuration, loaded from the environment (and `.env` if present).
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub worker_id: String,
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub max_poll_interval_ms: u64,
    pub stale_minutes: i64,
    pub reap_interval_secs: u64,
    pub admin_addr: Option<String>,
    pub migrate_on_startup: bool,
    pub prune_completed_after_days: i64,
    pub maintenance_interval_secs: u64,
    pub log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "pretty" | "text" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is missing"))?;

        let worker_id = env_or_fallback("ENGINE_JOBS_WORKER_ID", "WORKER_ID")
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "worker-1".to_string());

        let concurrency = env_parse("ENGINE_JOBS_CONCURRENCY", "CONCURRENCY")
            .unwrap_or(4usize)
            .clamp(1, 256);

        let poll_interval_ms =
            env_parse("ENGINE_JOBS_POLL_INTERVAL_MS", "POLL_INTERVAL_MS").unwrap_or(250u64);

        let max_poll_interval_ms =
            env_parse("ENGINE_JOBS_MAX_POLL_INTERVAL_MS", "MAX_POLL_INTERVAL_MS")
                .unwrap_or(5_000u64)
                .max(poll_interval_ms);

        let stale_minutes = env_parse("ENGINE_JOBS_STALE_MINUTES", "STALE_MINUTES")
            .unwrap_or(15i64)
            .max(0);

        let reap_interval_secs = env_parse("ENGINE_JOBS_REAP_INTERVAL_SECS", "REAP_INTERVAL_SECS")
            .unwrap_or(60u64)
            .max(1);

        let admin_addr = env_or_fallback("ENGINE_JOBS_ADMIN_ADDR", "ADMIN_ADDR")
            .and_then(|s| normalize_optional_addr(&s));

        let migrate_on_startup = env_bool("ENGINE_JOBS_MIGRATE_ON_STARTUP").unwrap_or(false);

        let prune_completed_after_days = env_parse(
            "ENGINE_JOBS_PRUNE_COMPLETED_AFTER_DAYS",
            "PRUNE_COMPLETED_AFTER_DAYS",
        )
        .unwrap_or(7i64);

        let maintenance_interval_secs = env_parse(
            "ENGINE_JOBS_MAINTENANCE_INTERVAL_SECS",
            "MAINTENANCE_INTERVAL_SECS",
        )
        .unwrap_or(300u64)
        .max(1);

        let log_format = env_or_fallback("ENGINE_JOBS_LOG_FORMAT", "LOG_FORMAT")
            .and_then(|s| LogFormat::parse(&s))
            .unwrap_or(LogFormat::Pretty);

        Ok(Self {
            database_url,
            worker_id,
            concurrency,
            poll_interval_ms,
            max_poll_interval_ms,
            stale_minutes,
            reap_interval_secs,
            admin_addr,
            migrate_on_startup,
            prune_completed_after_days,
            maintenance_interval_secs,
            log_format,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_parse<T: std::str::FromStr>(primary: &str, fallback: &str) -> Option<T> {
    env_or_fallback(primary, fallback).and_then(|s| s.trim().parse().ok())
}

pub(crate) fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|v| parse_bool(&v))
}

fn parse_bool(v: &str) -> bool {
    matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_addr_values_normalize_to_none() {
        for v in ["", "  ", "0", "off", "FALSE", "none"] {
            assert_eq!(normalize_optional_addr(v), None, "value {v:?}");
        }
        assert_eq!(
            normalize_optional_addr(" 127.0.0.1:8080 "),
            Some("127.0.0.1:8080".to_string())
        );
    }

    #[test]
    fn bool_parsing_accepts_common_spellings() {
        assert!(parse_bool("1"));
        assert!(parse_bool("Yes"));
        assert!(parse_bool(" on "));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("nope"));
    }

    #[test]
    fn log_format_parsing() {
        assert_eq!(LogFormat::parse("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse("pretty"), Some(LogFormat::Pretty));
        assert_eq!(LogFormat::parse("xml"), None);
    }
}
