use std::time::Duration;

use rand::Rng;

/// Default exponential back-off schedule: 200ms → 400ms → 800ms → 1600ms,
/// with ±20% jitter so parallel sessions do not retry in lockstep.
pub(crate) fn backoff(attempt: u64) -> Duration {
    let base_delay_ms = 200u64 * (1u64 << (attempt.saturating_sub(1)).min(16));
    let jitter = rand::rng().random_range(0.8..1.2);
    let delay_ms = (base_delay_ms as f64 * jitter) as u64;
    Duration::from_millis(delay_ms)
}

/// Truncate for log lines and timeline summaries, on a char boundary.
pub(crate) fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max.saturating_sub(1)).collect();
    format!("{cut}…")
}
