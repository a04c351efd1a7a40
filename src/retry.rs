//! Retry and backoff (spec §4.8, C8): two independent mechanisms —
//! task-level `backoffPeriod` (a task asking to be re-run later) and
//! message-level re-queue delay (the dispatcher protecting itself from a
//! handler that keeps failing).

use std::time::Duration;

use crate::config::SchedulerConfig;

/// Delay before the dispatcher re-queues a message that failed with a
/// transient error, doubling per attempt and capped, with full jitter to
/// avoid synchronized retries across executions.
pub fn message_retry_delay(config: &SchedulerConfig, attempts: u32) -> Duration {
    let base = config.message_retry_base_delay.as_millis() as u64;
    let shift = attempts.min(32);
    let exp = base.saturating_mul(1u64 << shift.min(20));
    let capped = exp.min(config.message_retry_max_delay.as_millis() as u64);
    let jittered = if capped == 0 {
        0
    } else {
        fastrand::u64(0..=capped)
    };
    Duration::from_millis(jittered)
}

/// Whether the dispatcher should give up re-queuing and emit an Invalid
/// marker instead (spec §4.2).
pub fn exhausted(config: &SchedulerConfig, attempts: u32) -> bool {
    attempts >= config.message_retry_max_attempts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_with_attempts_but_stays_under_cap() {
        let config = SchedulerConfig::default();
        for attempt in [0, 1, 5, 10, 40] {
            let delay = message_retry_delay(&config, attempt);
            assert!(delay <= config.message_retry_max_delay);
        }
    }

    #[test]
    fn exhausted_respects_configured_cap() {
        let config = SchedulerConfig::builder()
            .message_retry_max_attempts(3)
            .build();
        assert!(!exhausted(&config, 2));
        assert!(exhausted(&config, 3));
        assert!(exhausted(&config, 4));
    }
}
