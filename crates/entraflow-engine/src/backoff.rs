use std::time::Duration;

use entraflow_core::workflow::BackoffPolicy;

/// Delay before the attempt following failed attempt number `attempt` (1-based).
///
/// `base * multiplier^(attempt-1)`, capped at `max_delay_ms`.
pub fn delay_for(policy: &BackoffPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1) as i32;
    let raw = policy.base_delay_ms as f64 * policy.multiplier.powi(exponent);
    let capped = if raw.is_finite() {
        raw.min(policy.max_delay_ms as f64)
    } else {
        policy.max_delay_ms as f64
    };

    let ms = if policy.jitter {
        // Add jitter: 0.8x to 1.2x
        let jitter = 0.8 + rand::random::<f64>() * 0.4;
        (capped * jitter).min(policy.max_delay_ms as f64)
    } else {
        capped
    };
    Duration::from_millis(ms.max(0.0) as u64)
}
