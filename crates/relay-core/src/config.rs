//! Process configuration.
//!
//! Defaults cover local development; `RELAY_*` environment variables
//! override individual values. A variable that is present but unparsable is
//! an error, never silently ignored.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::queue::{BackoffKind, BackoffPolicy, QueueOptions};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Logical name of the submit job queue.
    pub queue_name: String,

    /// Attempt ceiling per submit job.
    pub submit_attempts: u32,

    /// Backoff between failed submit attempts.
    pub submit_backoff: BackoffPolicy,

    /// How many completed jobs are retained for status queries.
    pub max_completed_jobs: usize,

    /// How many failed jobs are retained for status queries.
    pub max_failed_jobs: usize,

    /// How many submit jobs may be processed in parallel.
    pub submit_concurrency: usize,

    /// Whether this process runs a queue scheduler. At least one instance
    /// cluster-wide must, or retries never leave the delayed state.
    pub scheduler_enabled: bool,

    /// Scheduler pass interval.
    pub scheduler_tick: Duration,

    /// How long a delivery may stay active before it is considered stalled.
    pub lease_timeout: Duration,

    /// Deadline for read-only evaluate calls.
    pub evaluate_timeout: Duration,

    /// Deadline for the endorsement phase of a submit.
    pub submit_timeout: Duration,

    /// Deadline for commit notification after a submit.
    pub commit_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_name: "submit".to_string(),
            submit_attempts: 5,
            submit_backoff: BackoffPolicy::fixed(Duration::from_millis(3000)),
            max_completed_jobs: 1000,
            max_failed_jobs: 1000,
            submit_concurrency: 5,
            scheduler_enabled: true,
            scheduler_tick: Duration::from_millis(500),
            lease_timeout: Duration::from_secs(30),
            evaluate_timeout: Duration::from_secs(3),
            submit_timeout: Duration::from_secs(30),
            commit_timeout: Duration::from_secs(300),
        }
    }
}

impl Config {
    /// Build the configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(|name| env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source. Empty
    /// values are treated as unset.
    pub fn from_env_with<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| get(name).filter(|value| !value.is_empty());
        let mut config = Self::default();

        if let Some(name) = get("RELAY_QUEUE_NAME") {
            config.queue_name = name;
        }
        if let Some(attempts) = parse_var("RELAY_SUBMIT_ATTEMPTS", &get)? {
            config.submit_attempts = attempts;
        }
        if let Some(kind) = get("RELAY_SUBMIT_BACKOFF_TYPE") {
            config.submit_backoff.kind = match kind.as_str() {
                "fixed" => BackoffKind::Fixed,
                "exponential" => BackoffKind::Exponential,
                _ => {
                    return Err(ConfigError::Invalid {
                        name: "RELAY_SUBMIT_BACKOFF_TYPE",
                        value: kind,
                    });
                }
            };
        }
        if let Some(delay) = parse_var("RELAY_SUBMIT_BACKOFF_DELAY_MS", &get)? {
            config.submit_backoff.delay = Duration::from_millis(delay);
        }
        if let Some(keep) = parse_var("RELAY_MAX_COMPLETED_JOBS", &get)? {
            config.max_completed_jobs = keep;
        }
        if let Some(keep) = parse_var("RELAY_MAX_FAILED_JOBS", &get)? {
            config.max_failed_jobs = keep;
        }
        if let Some(concurrency) = parse_var("RELAY_SUBMIT_CONCURRENCY", &get)? {
            config.submit_concurrency = concurrency;
        }
        if let Some(enabled) = parse_var("RELAY_QUEUE_SCHEDULER", &get)? {
            config.scheduler_enabled = enabled;
        }
        if let Some(tick) = parse_var("RELAY_SCHEDULER_TICK_MS", &get)? {
            config.scheduler_tick = Duration::from_millis(tick);
        }
        if let Some(timeout) = parse_var("RELAY_LEASE_TIMEOUT_MS", &get)? {
            config.lease_timeout = Duration::from_millis(timeout);
        }
        if let Some(timeout) = parse_var("RELAY_EVALUATE_TIMEOUT_MS", &get)? {
            config.evaluate_timeout = Duration::from_millis(timeout);
        }
        if let Some(timeout) = parse_var("RELAY_SUBMIT_TIMEOUT_MS", &get)? {
            config.submit_timeout = Duration::from_millis(timeout);
        }
        if let Some(timeout) = parse_var("RELAY_COMMIT_TIMEOUT_MS", &get)? {
            config.commit_timeout = Duration::from_millis(timeout);
        }

        Ok(config)
    }

    /// Queue options derived from this configuration.
    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            attempts: self.submit_attempts,
            backoff: self.submit_backoff,
            keep_completed: self.max_completed_jobs,
            keep_failed: self.max_failed_jobs,
            lease_timeout: self.lease_timeout,
        }
    }
}

fn parse_var<T, F>(name: &'static str, get: &F) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match get(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
    }
}
