//! Client configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry::ExponentialBackoffRetry;

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Comma-separated `host:port` list. `None` when an ensemble provider
    /// supplies it instead.
    pub connect_string: Option<String>,
    /// Session timeout negotiated with the ensemble.
    #[serde(with = "millis_serde", default = "default_session_timeout")]
    pub session_timeout: Duration,
    /// How long an operation may wait for a connection before failing.
    #[serde(with = "millis_serde", default = "default_connection_timeout")]
    pub connection_timeout: Duration,
    /// Accept read-only connections to a partitioned ensemble.
    #[serde(default)]
    pub can_be_read_only: bool,
    /// Base sleep of the default exponential backoff.
    #[serde(with = "millis_serde", default = "default_retry_base_sleep")]
    pub retry_base_sleep: Duration,
    /// Retry budget of the default exponential backoff.
    #[serde(default = "default_retry_max_retries")]
    pub retry_max_retries: u32,
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_retry_base_sleep() -> Duration {
    Duration::from_millis(100)
}

fn default_retry_max_retries() -> u32 {
    3
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_string: None,
            session_timeout: default_session_timeout(),
            connection_timeout: default_connection_timeout(),
            can_be_read_only: false,
            retry_base_sleep: default_retry_base_sleep(),
            retry_max_retries: default_retry_max_retries(),
        }
    }
}

impl ClientConfig {
    /// Create a configuration for a fixed ensemble.
    pub fn new(connect_string: impl Into<String>) -> Self {
        Self {
            connect_string: Some(connect_string.into()),
            ..Default::default()
        }
    }

    /// Create a builder.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> ClientConfigBuilder {
        let mut builder = ClientConfigBuilder::new();

        if let Ok(connect_string) = std::env::var("TRELLIS_CONNECT_STRING") {
            builder = builder.connect_string(connect_string);
        }

        if let Ok(value) = std::env::var("TRELLIS_SESSION_TIMEOUT_MS")
            && let Ok(ms) = value.parse() {
                builder = builder.session_timeout(Duration::from_millis(ms));
            }

        if let Ok(value) = std::env::var("TRELLIS_CONNECTION_TIMEOUT_MS")
            && let Ok(ms) = value.parse() {
                builder = builder.connection_timeout(Duration::from_millis(ms));
            }

        if let Ok(value) = std::env::var("TRELLIS_CAN_BE_READ_ONLY") {
            builder = builder.can_be_read_only(matches!(value.as_str(), "1" | "true" | "yes"));
        }

        if let Ok(value) = std::env::var("TRELLIS_RETRY_BASE_SLEEP_MS")
            && let Ok(ms) = value.parse() {
                builder = builder.retry_base_sleep(Duration::from_millis(ms));
            }

        if let Ok(value) = std::env::var("TRELLIS_RETRY_MAX_RETRIES")
            && let Ok(retries) = value.parse() {
                builder = builder.retry_max_retries(retries);
            }

        builder
    }

    /// The default retry policy described by this configuration.
    pub fn retry_policy(&self) -> ExponentialBackoffRetry {
        ExponentialBackoffRetry::new(self.retry_base_sleep, self.retry_max_retries)
    }
}

/// Builder for client configuration.
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    /// Set the connect string.
    pub fn connect_string(mut self, connect_string: impl Into<String>) -> Self {
        self.config.connect_string = Some(connect_string.into());
        self
    }

    /// Set the session timeout.
    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.config.session_timeout = timeout;
        self
    }

    /// Set the connection timeout.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    /// Allow read-only connections.
    pub fn can_be_read_only(mut self, enabled: bool) -> Self {
        self.config.can_be_read_only = enabled;
        self
    }

    /// Set the base sleep of the default retry policy.
    pub fn retry_base_sleep(mut self, sleep: Duration) -> Self {
        self.config.retry_base_sleep = sleep;
        self
    }

    /// Set the retry budget of the default retry policy.
    pub fn retry_max_retries(mut self, retries: u32) -> Self {
        self.config.retry_max_retries = retries;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ClientConfig {
        self.config
    }
}

mod millis_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
