//! Application configuration.
//!
//! Loaded from environment variables via figment. Duration-valued settings
//! accept either a bare number (seconds) or a string with units ("30s",
//! "2m", "1500ms").

use fundu::{DurationParser, TimeUnit};
use serde::{Deserialize, Deserializer};
use std::time::Duration;

use crate::scheduler::SchedulerConfig;

#[derive(Deserialize)]
pub struct Config {
    /// Log level applied to this crate's target ("trace" through "error").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Postgres connection URL.
    pub database_url: String,

    /// Size of the HTTP worker pool.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Submissions queued ahead of the running attempts before the pool
    /// refuses.
    #[serde(default = "default_worker_backlog")]
    pub worker_backlog: usize,

    /// Per-attempt HTTP timeout.
    #[serde(
        default = "default_request_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub request_timeout: Duration,

    /// Additional attempts after the first failure of an occurrence.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Interval between reconciliations with the job table.
    #[serde(
        default = "default_refresh_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub refresh_interval: Duration,

    /// Clamp on the exponential retry backoff.
    #[serde(
        default = "default_backoff_cap",
        deserialize_with = "deserialize_duration"
    )]
    pub backoff_cap: Duration,

    /// How much of a failure response body is kept as the error message.
    #[serde(default = "default_response_capture_bytes")]
    pub response_capture_bytes: usize,

    /// Grace period for shutting all services down.
    #[serde(
        default = "default_shutdown_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub shutdown_timeout: Duration,

    /// Whether shutdown waits for in-flight attempts instead of cancelling
    /// them.
    #[serde(default = "default_shutdown_drain")]
    pub shutdown_drain: bool,
}

impl Config {
    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_workers: self.max_workers,
            worker_backlog: self.worker_backlog,
            request_timeout: self.request_timeout,
            max_retries: self.max_retries,
            refresh_interval: self.refresh_interval,
            backoff_cap: self.backoff_cap,
            response_capture_bytes: self.response_capture_bytes,
            drain_on_shutdown: self.shutdown_drain,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_workers() -> usize {
    20
}

fn default_worker_backlog() -> usize {
    40
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_retries() -> u32 {
    3
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_cap() -> Duration {
    Duration::from_secs(64)
}

fn default_response_capture_bytes() -> usize {
    4096
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(8)
}

fn default_shutdown_drain() -> bool {
    true
}

/// Accepts seconds, milliseconds, and minutes; bare numbers mean seconds.
/// Multiple units are summed ("1m 30s" = 90 seconds).
const DURATION_PARSER: DurationParser<'static> = DurationParser::builder()
    .time_units(&[TimeUnit::Second, TimeUnit::MilliSecond, TimeUnit::Minute])
    .parse_multiple(None)
    .allow_time_unit_delimiter()
    .disable_infinity()
    .disable_fraction()
    .disable_exponent()
    .default_unit(TimeUnit::Second)
    .build();

/// Deserialize a duration from either a number (seconds) or a unit string.
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Visitor;

    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a duration string or number of seconds")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            DURATION_PARSER
                .parse(value)
                .map_err(|e| {
                    serde::de::Error::custom(format!(
                        "invalid duration '{value}': {e}; examples: '5', '1500ms', '30s', '2m'"
                    ))
                })?
                .try_into()
                .map_err(|e| serde::de::Error::custom(format!("duration conversion error: {e}")))
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(Duration::from_secs(value))
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            if value < 0 {
                return Err(serde::de::Error::custom("duration cannot be negative"));
            }
            Ok(Duration::from_secs(value as u64))
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}
