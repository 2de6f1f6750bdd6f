//! Jittered exponential backoff for reconnection scheduling.

use std::time::Duration;

use rand::Rng;

use crate::config::ResilienceConfig;

/// `initial * multiplier^(attempt-1)`, clamped to `max_delay`, then
/// multiplied by `U(0.75, 1.25)` if jitter is enabled. `attempt` is 1-based.
pub fn next_delay(config: &ResilienceConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1) as i32;
    let raw_secs = config.initial_delay.as_secs_f64() * config.multiplier.powi(exponent);
    let clamped_secs = raw_secs.min(config.max_delay.as_secs_f64());

    let jittered_secs = if config.jitter {
        let factor = rand::thread_rng().gen_range(0.75..=1.25);
        clamped_secs * factor
    } else {
        clamped_secs
    };

    Duration::from_secs_f64(jittered_secs.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ResilienceConfig {
        ResilienceConfig {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(300),
            max_attempts: 10,
            jitter: false,
            min_score_for_retry: 0.1,
            blacklist_duration: Duration::from_secs(86_400),
            janitor_interval: Duration::from_secs(60),
        }
    }

    #[test]
    fn delay_doubles_without_jitter() {
        let cfg = config();
        assert_eq!(next_delay(&cfg, 1), Duration::from_secs(1));
        assert_eq!(next_delay(&cfg, 2), Duration::from_secs(2));
        assert_eq!(next_delay(&cfg, 3), Duration::from_secs(4));
    }

    #[test]
    fn delay_clamps_to_max() {
        let cfg = config();
        assert_eq!(next_delay(&cfg, 20), cfg.max_delay);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut cfg = config();
        cfg.jitter = true;
        for _ in 0..100 {
            let delay = next_delay(&cfg, 3).as_secs_f64();
            assert!(delay >= 4.0 * 0.75 && delay <= 4.0 * 1.25);
        }
    }
}
