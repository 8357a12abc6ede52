//! Configuration types for segment-dl

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// HTTP client settings for the remote side of a transfer
///
/// Each downloader builds its own client from these settings, so two
/// downloaders never share a pool. Open connections are bounded by
/// [`Config::max_concurrent_blocks`], not by anything here.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Idle connections kept in the pool per host for reuse (default: 16)
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,

    /// Timeout for establishing a connection (default: 30 seconds)
    #[serde(default = "default_connect_timeout", with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Overall timeout for one range request including the body (default: none)
    ///
    /// Leave unset for large blocks on slow links; a stalled block is better
    /// handled by suspending and resuming than by a hard deadline.
    #[serde(default, with = "optional_duration_serde")]
    pub request_timeout: Option<Duration>,

    /// User-Agent header sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: default_max_idle_per_host(),
            connect_timeout: default_connect_timeout(),
            request_timeout: None,
            user_agent: default_user_agent(),
        }
    }
}

/// Retry configuration for transient block failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts per block (default: 5, 0 disables retry)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// A policy that never retries
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Reject a backoff that would shrink or is not a number
    pub fn validate(&self) -> Result<()> {
        let multiplier = self.backoff_multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(Error::config(
                "retry.backoff_multiplier",
                "must be a finite number of at least 1.0",
            ));
        }
        Ok(())
    }
}

/// Main configuration for a [`Downloader`](crate::Downloader)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Size of the buffer each block copies through (default: 128 KiB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Number of blocks to split a transfer into (default: 8)
    #[serde(default = "default_block_count")]
    pub block_count: usize,

    /// Smallest block the planner will produce, except for a tiny resource (default: 1 MiB)
    #[serde(default = "default_min_block_size")]
    pub min_block_size: u64,

    /// Maximum blocks copying at the same time (default: 8)
    #[serde(default = "default_max_concurrent_blocks")]
    pub max_concurrent_blocks: usize,

    /// Capacity of each block's progress channel (default: 64)
    ///
    /// A block whose channel is full waits before copying its next chunk.
    #[serde(default = "default_progress_buffer")]
    pub progress_buffer: usize,

    /// Capacity of the broadcast channels collaborators subscribe to (default: 1024)
    ///
    /// Subscribers that fall behind skip the oldest events instead of slowing the copy.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Speed limit in bytes per second across all blocks (None = unlimited)
    #[serde(default)]
    pub speed_limit_bps: Option<u64>,

    /// HTTP client settings
    #[serde(default)]
    pub http: HttpConfig,

    /// Retry behavior for failed blocks
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            block_count: default_block_count(),
            min_block_size: default_min_block_size(),
            max_concurrent_blocks: default_max_concurrent_blocks(),
            progress_buffer: default_progress_buffer(),
            event_buffer: default_event_buffer(),
            speed_limit_bps: None,
            http: HttpConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl Config {
    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::config("chunk_size", "must be greater than zero"));
        }
        if self.block_count == 0 {
            return Err(Error::config("block_count", "must be greater than zero"));
        }
        if u32::try_from(self.block_count).is_err() {
            return Err(Error::config("block_count", "must fit in a 32-bit block id"));
        }
        if self.max_concurrent_blocks == 0 {
            return Err(Error::config(
                "max_concurrent_blocks",
                "must be greater than zero",
            ));
        }
        if self.progress_buffer == 0 {
            return Err(Error::config("progress_buffer", "must be greater than zero"));
        }
        if self.event_buffer == 0 {
            return Err(Error::config("event_buffer", "must be greater than zero"));
        }
        if self.speed_limit_bps == Some(0) {
            return Err(Error::config(
                "speed_limit_bps",
                "use None for unlimited instead of 0",
            ));
        }
        self.retry.validate()
    }
}

fn default_chunk_size() -> usize {
    128 * 1024
}

fn default_block_count() -> usize {
    8
}

fn default_min_block_size() -> u64 {
    1024 * 1024
}

fn default_max_concurrent_blocks() -> usize {
    8
}

fn default_progress_buffer() -> usize {
    64
}

fn default_event_buffer() -> usize {
    1024
}

fn default_max_idle_per_host() -> usize {
    16
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_user_agent() -> String {
    concat!("segment-dl/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Optional Duration serialization helper
mod optional_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.chunk_size, 128 * 1024);
        assert_eq!(config.block_count, 8);
    }

    #[test]
    fn empty_json_yields_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();

        assert_eq!(config.chunk_size, 128 * 1024);
        assert_eq!(config.max_concurrent_blocks, 8);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_delay, Duration::from_secs(1));
        assert_eq!(config.http.connect_timeout, Duration::from_secs(30));
        assert!(config.http.request_timeout.is_none());
        assert!(config.speed_limit_bps.is_none());
    }

    #[test]
    fn durations_serialize_as_seconds() {
        let config = Config {
            http: HttpConfig {
                request_timeout: Some(Duration::from_secs(90)),
                ..HttpConfig::default()
            },
            ..Config::default()
        };

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["retry"]["max_delay"], 60);
        assert_eq!(json["http"]["request_timeout"], 90);
    }

    #[test]
    fn partial_nested_sections_keep_other_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"retry": {"max_attempts": 2}, "block_count": 4}"#).unwrap();

        assert_eq!(config.block_count, 4);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.backoff_multiplier, 2.0);
        assert!(config.retry.jitter);
    }

    #[test]
    fn validate_rejects_zero_values() {
        let cases = [
            (
                Config {
                    chunk_size: 0,
                    ..Config::default()
                },
                "chunk_size",
            ),
            (
                Config {
                    block_count: 0,
                    ..Config::default()
                },
                "block_count",
            ),
            (
                Config {
                    max_concurrent_blocks: 0,
                    ..Config::default()
                },
                "max_concurrent_blocks",
            ),
            (
                Config {
                    speed_limit_bps: Some(0),
                    ..Config::default()
                },
                "speed_limit_bps",
            ),
        ];

        for (config, expected_key) in cases {
            match config.validate() {
                Err(Error::Config { key, .. }) => assert_eq!(key.as_deref(), Some(expected_key)),
                other => panic!("expected config error for {expected_key}, got {other:?}"),
            }
        }
    }

    #[test]
    fn validate_rejects_shrinking_or_non_numeric_backoff() {
        for multiplier in [-2.0, 0.5, f64::NAN, f64::INFINITY] {
            let config = Config {
                retry: RetryConfig {
                    backoff_multiplier: multiplier,
                    ..RetryConfig::default()
                },
                ..Config::default()
            };
            match config.validate() {
                Err(Error::Config { key, .. }) => {
                    assert_eq!(key.as_deref(), Some("retry.backoff_multiplier"))
                }
                other => panic!("expected config error for {multiplier}, got {other:?}"),
            }
        }
        RetryConfig::default().validate().unwrap();
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn validate_rejects_block_count_beyond_block_ids() {
        let config = Config {
            block_count: u32::MAX as usize + 1,
            ..Config::default()
        };
        match config.validate() {
            Err(Error::Config { key, .. }) => assert_eq!(key.as_deref(), Some("block_count")),
            other => panic!("expected block_count error, got {other:?}"),
        }
    }

    #[test]
    fn disabled_retry_has_no_attempts() {
        assert_eq!(RetryConfig::disabled().max_attempts, 0);
    }
}
