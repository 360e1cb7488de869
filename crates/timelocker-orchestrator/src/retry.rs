use std::time::Duration;

use rand::Rng;

/// Retry tuning for the backup loop: exponential backoff with a small
/// jitter so concurrent schedules do not hammer a contended repository in
/// lockstep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    /// Fraction of the delay randomised away (0.0 = deterministic).
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs_f64(1.0),
            backoff_multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetrySettings {
    pub fn from_backup_config(config: &timelocker_config::BackupConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            initial_delay: Duration::from_secs_f64(config.retry_delay_seconds.max(0.0)),
            backoff_multiplier: config.backoff_multiplier.max(1.0),
            jitter: 0.1,
        }
    }

    /// Delay before the given retry (attempt is 1-based; the delay applies
    /// after attempt `attempt` failed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let jittered = if self.jitter > 0.0 {
            let spread = base * self.jitter;
            base - spread + rand::thread_rng().gen_range(0.0..=(2.0 * spread).max(f64::EPSILON))
        } else {
            base
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_policy() {
        let settings = RetrySettings::default();
        assert_eq!(settings.max_attempts, 3);
        assert_eq!(settings.initial_delay, Duration::from_secs(1));
        assert_eq!(settings.backoff_multiplier, 2.0);
    }

    #[test]
    fn backoff_grows_exponentially() {
        let settings = RetrySettings { jitter: 0.0, ..Default::default() };
        assert_eq!(settings.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(settings.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(settings.delay_for_attempt(3), Duration::from_secs(4));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let settings = RetrySettings { jitter: 0.5, ..Default::default() };
        for _ in 0..50 {
            let delay = settings.delay_for_attempt(2).as_secs_f64();
            assert!(delay >= 1.0 - f64::EPSILON);
            assert!(delay <= 3.0 + 1e-6);
        }
    }

    #[test]
    fn config_conversion_clamps_degenerate_values() {
        let mut backup = timelocker_config::BackupConfig::default();
        backup.max_retries = 0;
        backup.backoff_multiplier = 0.5;
        let settings = RetrySettings::from_backup_config(&backup);
        assert_eq!(settings.max_attempts, 1);
        assert_eq!(settings.backoff_multiplier, 1.0);
    }
}
