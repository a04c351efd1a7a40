//! Scheduler configuration (spec §4.10, C11): timing knobs layered over
//! sensible defaults via `bon`'s builder, matching how this engine's other
//! service configs are assembled.

use std::time::Duration;

/// Tunables governing retry backoff, dispatcher locking, and default task
/// timeouts. Construct with [`SchedulerConfig::builder`] or
/// [`SchedulerConfig::default`].
#[derive(Debug, Clone, PartialEq, bon::Builder)]
pub struct SchedulerConfig {
    /// Base delay for message-level re-queue backoff (spec §4.8); doubles per
    /// attempt up to a cap, jittered.
    #[builder(default = Duration::from_secs(30))]
    pub message_retry_base_delay: Duration,

    /// Ceiling on message-level backoff, regardless of attempt count.
    #[builder(default = Duration::from_secs(60 * 30))]
    pub message_retry_max_delay: Duration,

    /// Attempts a message may accumulate before the dispatcher converts it
    /// to an Invalid marker instead of re-queuing again (spec §4.2).
    #[builder(default = 1000)]
    pub message_retry_max_attempts: u32,

    /// How long a dispatcher's advisory per-execution lock is held before it
    /// is considered abandoned and reclaimable (spec §4.2 C4).
    #[builder(default = Duration::from_secs(60))]
    pub dispatcher_lock_ttl: Duration,

    /// Applied to a task with no explicit `timeout` set (spec §4.4).
    #[builder(default = Duration::from_secs(60 * 60 * 2))]
    pub default_task_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Human-editable overlay for [`SchedulerConfig`]: every field optional so a
/// TOML file or environment layer only needs to mention what it overrides.
#[derive(Debug, Clone, Default, serde::Deserialize)]
struct RawSchedulerConfig {
    message_retry_base_delay_secs: Option<u64>,
    message_retry_max_delay_secs: Option<u64>,
    message_retry_max_attempts: Option<u32>,
    dispatcher_lock_ttl_secs: Option<u64>,
    default_task_timeout_secs: Option<u64>,
}

impl SchedulerConfig {
    /// Loads config layered the usual way for this engine's services: an
    /// optional TOML file, then environment variables prefixed `SCHEDULER_`
    /// (e.g. `SCHEDULER_MESSAGE_RETRY_MAX_ATTEMPTS`) taking precedence, on top
    /// of [`SchedulerConfig::default`]. `path` is the file stem passed to
    /// [`config::File::with_name`]; a missing file is not an error.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix("SCHEDULER").separator("_"));
        let raw: RawSchedulerConfig = builder.build()?.try_deserialize()?;

        let mut cfg = Self::default();
        if let Some(secs) = raw.message_retry_base_delay_secs {
            cfg.message_retry_base_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = raw.message_retry_max_delay_secs {
            cfg.message_retry_max_delay = Duration::from_secs(secs);
        }
        if let Some(attempts) = raw.message_retry_max_attempts {
            cfg.message_retry_max_attempts = attempts;
        }
        if let Some(secs) = raw.dispatcher_lock_ttl_secs {
            cfg.dispatcher_lock_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = raw.default_task_timeout_secs {
            cfg.default_task_timeout = Duration::from_secs(secs);
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_documented_values() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.message_retry_base_delay, Duration::from_secs(30));
        assert_eq!(cfg.message_retry_max_attempts, 1000);
    }

    #[test]
    fn builder_overrides_individual_fields() {
        let cfg = SchedulerConfig::builder()
            .message_retry_max_attempts(5)
            .build();
        assert_eq!(cfg.message_retry_max_attempts, 5);
        assert_eq!(cfg.message_retry_base_delay, Duration::from_secs(30));
    }

    #[test]
    fn load_falls_back_to_defaults_with_no_file_and_no_env() {
        let cfg = SchedulerConfig::load(Some("nonexistent-scheduler-config")).unwrap();
        assert_eq!(cfg, SchedulerConfig::default());
    }
}
