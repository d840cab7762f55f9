use rand::Rng;

/// Floor applied to every retry delay so a misbehaving caller cannot spin a job.
pub const MIN_RETRY_DELAY_SECS: i64 = 15;

/// Delay used when `fail` is called without one.
pub const DEFAULT_RETRY_DELAY_SECS: i64 = 60;

/// Ceiling on a retry delay (about 68 years). Keeps `now() + delay` inside
/// the range of a PostgreSQL timestamp.
pub const MAX_RETRY_DELAY_SECS: i64 = i32::MAX as i64;

/// The delay `fail` actually schedules for a requested one.
pub fn effective_retry_delay_secs(requested: Option<i64>) -> i64 {
    requested
        .unwrap_or(DEFAULT_RETRY_DELAY_SECS)
        .clamp(MIN_RETRY_DELAY_SECS, MAX_RETRY_DELAY_SECS)
}

/// Worker-side backoff policy. The queue only enforces the floor above;
/// how fast to back off is up to the caller.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base_seconds: i64,
    pub max_seconds: i64,
    pub jitter_pct: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_seconds: MIN_RETRY_DELAY_SECS,
            max_seconds: 60 * 60,
            jitter_pct: 0.20,
        }
    }
}

pub fn next_delay_seconds(attempt_no: i32, cfg: &RetryConfig, rng: &mut impl Rng) -> i64 {
    let attempt_no = attempt_no.max(1) as u32;

    let exp = attempt_no.saturating_sub(1);

    // Shifts past bit 62 would go negative; saturate and cap below.
    let pow2 = if exp >= 62 { i64::MAX } else { 1_i64 << exp };

    let delay = cfg.base_seconds.saturating_mul(pow2).min(cfg.max_seconds);

    let jitter_range = (delay as f64) * cfg.jitter_pct;
    if jitter_range <= 0.0 {
        return delay.clamp(0, cfg.max_seconds);
    }
    let jitter = rng.gen_range(-jitter_range..=jitter_range);

    let jittered = (delay as f64 + jitter).round() as i64;
    jittered.clamp(0, cfg.max_seconds)
}
