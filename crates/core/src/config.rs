//! Process-wide configuration, loaded once at startup from `REQUEUE_*`
//! environment variables and read-only afterwards.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const ENV_MAX_ATTEMPTS: &str = "REQUEUE_MAX_ATTEMPTS";
pub const ENV_RETRYABLE_ERRORS: &str = "REQUEUE_RETRYABLE_ERRORS";
pub const ENV_NON_RETRYABLE_ERRORS: &str = "REQUEUE_NON_RETRYABLE_ERRORS";
pub const ENV_SCHEDULER_FREQUENCY_MS: &str = "REQUEUE_SCHEDULER_FREQUENCY_MS";
pub const ENV_BATCH_SIZE: &str = "REQUEUE_BATCH_SIZE";
pub const ENV_POLL_TIMEOUT_MS: &str = "REQUEUE_POLL_TIMEOUT_MS";
pub const ENV_PRIMARY_TOPIC: &str = "REQUEUE_PRIMARY_TOPIC";
pub const ENV_RETRY_TOPIC: &str = "REQUEUE_RETRY_TOPIC";
pub const ENV_DLQ_TOPIC: &str = "REQUEUE_DLQ_TOPIC";
pub const ENV_OVERLAP_POLICY: &str = "REQUEUE_OVERLAP_POLICY";

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_SCHEDULER_FREQUENCY: Duration = Duration::from_secs(60);
const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Tie-break when an error name appears in both the retryable and the
/// non-retryable set.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Permanent failure wins (default).
    #[default]
    NonRetryableWins,
    RetryableWins,
}

impl core::str::FromStr for OverlapPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "non_retryable_wins" => Ok(OverlapPolicy::NonRetryableWins),
            "retryable_wins" => Ok(OverlapPolicy::RetryableWins),
            other => Err(ConfigError::invalid(
                ENV_OVERLAP_POLICY,
                format!("expected non_retryable_wins or retryable_wins, got {other:?}"),
            )),
        }
    }
}

/// Names of the three topics the engine touches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topics {
    pub primary: String,
    pub retry: String,
    pub dlq: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            primary: "requeue.primary".to_string(),
            retry: "requeue.retry".to_string(),
            dlq: "requeue.dlq".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequeueConfig {
    /// Retry count at which a retryable failure is dead-lettered instead.
    pub max_attempts: u32,
    /// Bare types or `namespace:type` composites considered transient.
    pub retryable_errors: HashSet<String>,
    /// Bare types or `namespace:type` composites considered permanent.
    pub non_retryable_errors: HashSet<String>,
    pub scheduler_frequency: Duration,
    /// Upper bound on records drained from the retry topic per tick.
    pub batch_size: usize,
    /// Bound on a single broker poll.
    pub poll_timeout: Duration,
    pub topics: Topics,
    pub overlap_policy: OverlapPolicy,
}

impl Default for RequeueConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retryable_errors: HashSet::new(),
            non_retryable_errors: HashSet::new(),
            scheduler_frequency: DEFAULT_SCHEDULER_FREQUENCY,
            batch_size: DEFAULT_BATCH_SIZE,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            topics: Topics::default(),
            overlap_policy: OverlapPolicy::default(),
        }
    }
}

impl RequeueConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable source. Unset variables keep their default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_MAX_ATTEMPTS) {
            config.max_attempts = parse_number(ENV_MAX_ATTEMPTS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_RETRYABLE_ERRORS) {
            config.retryable_errors = parse_set(&raw);
        }
        if let Some(raw) = lookup(ENV_NON_RETRYABLE_ERRORS) {
            config.non_retryable_errors = parse_set(&raw);
        }
        if let Some(raw) = lookup(ENV_SCHEDULER_FREQUENCY_MS) {
            config.scheduler_frequency =
                Duration::from_millis(parse_number(ENV_SCHEDULER_FREQUENCY_MS, &raw)?);
        }
        if let Some(raw) = lookup(ENV_BATCH_SIZE) {
            config.batch_size = parse_number(ENV_BATCH_SIZE, &raw)?;
        }
        if let Some(raw) = lookup(ENV_POLL_TIMEOUT_MS) {
            config.poll_timeout = Duration::from_millis(parse_number(ENV_POLL_TIMEOUT_MS, &raw)?);
        }
        if let Some(raw) = lookup(ENV_PRIMARY_TOPIC) {
            config.topics.primary = parse_topic(ENV_PRIMARY_TOPIC, &raw)?;
        }
        if let Some(raw) = lookup(ENV_RETRY_TOPIC) {
            config.topics.retry = parse_topic(ENV_RETRY_TOPIC, &raw)?;
        }
        if let Some(raw) = lookup(ENV_DLQ_TOPIC) {
            config.topics.dlq = parse_topic(ENV_DLQ_TOPIC, &raw)?;
        }
        if let Some(raw) = lookup(ENV_OVERLAP_POLICY) {
            config.overlap_policy = raw.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_retryable<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable_errors.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn with_non_retryable<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.non_retryable_errors
            .extend(names.into_iter().map(Into::into));
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn with_scheduler_frequency(mut self, frequency: Duration) -> Self {
        self.scheduler_frequency = frequency;
        self
    }

    pub fn with_topics(mut self, topics: Topics) -> Self {
        self.topics = topics;
        self
    }

    pub fn with_overlap_policy(mut self, policy: OverlapPolicy) -> Self {
        self.overlap_policy = policy;
        self
    }

    /// Check the invariants the engine relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::not_positive(ENV_MAX_ATTEMPTS));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::not_positive(ENV_BATCH_SIZE));
        }
        if self.scheduler_frequency.is_zero() {
            return Err(ConfigError::not_positive(ENV_SCHEDULER_FREQUENCY_MS));
        }
        if self.poll_timeout.is_zero() {
            return Err(ConfigError::not_positive(ENV_POLL_TIMEOUT_MS));
        }

        let t = &self.topics;
        if t.primary == t.retry || t.primary == t.dlq || t.retry == t.dlq {
            return Err(ConfigError::conflict(format!(
                "primary ({}), retry ({}) and dlq ({}) topics must be distinct",
                t.primary, t.retry, t.dlq
            )));
        }

        Ok(())
    }
}

fn parse_number<T>(name: &str, raw: &str) -> Result<T, ConfigError>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::invalid(name, format!("{raw:?}: {e}")))
}

fn parse_set(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_topic(name: &str, raw: &str) -> Result<String, ConfigError> {
    let topic = raw.trim();
    if topic.is_empty() {
        return Err(ConfigError::invalid(name, "topic name is empty"));
    }
    Ok(topic.to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = RequeueConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, RequeueConfig::default());
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.overlap_policy, OverlapPolicy::NonRetryableWins);
    }

    #[test]
    fn parses_full_option_set() {
        let config = RequeueConfig::from_lookup(lookup_from(&[
            (ENV_MAX_ATTEMPTS, "5"),
            (ENV_RETRYABLE_ERRORS, "SERVICE_UNAVAILABLE, HTTP:TIMEOUT,,"),
            (ENV_NON_RETRYABLE_ERRORS, "VALIDATION"),
            (ENV_SCHEDULER_FREQUENCY_MS, "30000"),
            (ENV_BATCH_SIZE, "10"),
            (ENV_POLL_TIMEOUT_MS, "250"),
            (ENV_RETRY_TOPIC, "orders.retry"),
            (ENV_OVERLAP_POLICY, "retryable_wins"),
        ]))
        .unwrap();

        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.retryable_errors.len(), 2);
        assert!(config.retryable_errors.contains("HTTP:TIMEOUT"));
        assert!(config.non_retryable_errors.contains("VALIDATION"));
        assert_eq!(config.scheduler_frequency, Duration::from_secs(30));
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.poll_timeout, Duration::from_millis(250));
        assert_eq!(config.topics.retry, "orders.retry");
        assert_eq!(config.overlap_policy, OverlapPolicy::RetryableWins);
    }

    #[test]
    fn malformed_max_attempts_is_fatal() {
        let err = RequeueConfig::from_lookup(lookup_from(&[(ENV_MAX_ATTEMPTS, "three")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref name, .. } if name == ENV_MAX_ATTEMPTS));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let err = RequeueConfig::from_lookup(lookup_from(&[(ENV_BATCH_SIZE, "0")])).unwrap_err();
        assert_eq!(err, ConfigError::not_positive(ENV_BATCH_SIZE));
    }

    #[test]
    fn topics_must_be_distinct() {
        let err = RequeueConfig::from_lookup(lookup_from(&[(ENV_DLQ_TOPIC, "requeue.retry")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Conflict(_)));
    }

    #[test]
    fn unknown_overlap_policy_is_rejected() {
        let err = RequeueConfig::from_lookup(lookup_from(&[(ENV_OVERLAP_POLICY, "coin_flip")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}
