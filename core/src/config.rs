//! Broker configuration.
//!
//! [`BrokerConfig`] is the single construction-time input of a gateway: broker
//! addresses, TLS, producer acknowledgments and consumer-group settings. It is
//! immutable once a gateway has been built from it.
//!
//! # Example
//!
//! ```
//! use fluxgate_core::config::{Acks, BrokerConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BrokerConfig::builder()
//!     .brokers(["localhost:9092", "localhost:9093"])
//!     .acks(Acks::All)
//!     .group_id("order-service")
//!     .auto_commit(false)
//!     .build()?;
//!
//! assert_eq!(config.bootstrap_servers(), "localhost:9092,localhost:9093");
//! # Ok(())
//! # }
//! ```
//!
//! # Environment
//!
//! [`BrokerConfig::from_env`] reads:
//!
//! | variable | meaning | default |
//! |---|---|---|
//! | `FLUXGATE_KAFKA_BROKERS` | comma-separated broker list | required |
//! | `FLUXGATE_KAFKA_TLS` | `true` / `false` | `false` |
//! | `FLUXGATE_KAFKA_ACKS` | `none`, `leader`, `all` (or `0`, `1`) | `leader` |
//! | `FLUXGATE_KAFKA_GROUP_ID` | consumer group id | unset (producer only) |
//! | `FLUXGATE_KAFKA_AUTO_COMMIT` | `true` / `false` | `false` |
//! | `FLUXGATE_KAFKA_OFFSET_RESET` | `earliest` / `latest` | `earliest` |
//! | `FLUXGATE_KAFKA_CLIENT_ID` | client id reported to the broker | unset |

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Environment variable holding the broker list.
pub const ENV_BROKERS: &str = "FLUXGATE_KAFKA_BROKERS";
/// Environment variable toggling TLS.
pub const ENV_TLS: &str = "FLUXGATE_KAFKA_TLS";
/// Environment variable holding the producer acknowledgment policy.
pub const ENV_ACKS: &str = "FLUXGATE_KAFKA_ACKS";
/// Environment variable holding the consumer group id.
pub const ENV_GROUP_ID: &str = "FLUXGATE_KAFKA_GROUP_ID";
/// Environment variable toggling broker-side auto commit.
pub const ENV_AUTO_COMMIT: &str = "FLUXGATE_KAFKA_AUTO_COMMIT";
/// Environment variable holding the auto offset reset policy.
pub const ENV_OFFSET_RESET: &str = "FLUXGATE_KAFKA_OFFSET_RESET";
/// Environment variable holding the client id.
pub const ENV_CLIENT_ID: &str = "FLUXGATE_KAFKA_CLIENT_ID";

/// Errors raised while building or loading a [`BrokerConfig`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required environment variable is missing
    #[error("Environment variable not set: {0}")]
    EnvVarNotSet(String),

    /// A value could not be parsed
    #[error("Invalid value for {field}: {value}")]
    InvalidValue {
        /// Field or variable name
        field: String,
        /// The rejected value
        value: String,
    },

    /// The configuration is structurally invalid
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Producer acknowledgment policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Acks {
    /// Fire and forget, the broker does not acknowledge
    None,
    /// The partition leader acknowledges
    #[default]
    Leader,
    /// All in-sync replicas acknowledge
    All,
}

impl Acks {
    /// Value of the Kafka `acks` client property.
    #[must_use]
    pub const fn as_kafka_value(self) -> &'static str {
        match self {
            Self::None => "0",
            Self::Leader => "1",
            Self::All => "all",
        }
    }
}

impl FromStr for Acks {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" | "0" => Ok(Self::None),
            "leader" | "1" => Ok(Self::Leader),
            "all" | "-1" => Ok(Self::All),
            _ => Err(ConfigError::InvalidValue {
                field: "acks".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for Acks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Leader => write!(f, "leader"),
            Self::All => write!(f, "all"),
        }
    }
}

/// Where a consumer group starts when it has no committed offset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    /// Start from the beginning of each partition
    #[default]
    Earliest,
    /// Only read messages produced after the group joined
    Latest,
}

impl OffsetReset {
    /// Value of the Kafka `auto.offset.reset` client property.
    #[must_use]
    pub const fn as_kafka_value(self) -> &'static str {
        match self {
            Self::Earliest => "earliest",
            Self::Latest => "latest",
        }
    }
}

impl FromStr for OffsetReset {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "earliest" | "beginning" | "smallest" => Ok(Self::Earliest),
            "latest" | "end" | "largest" => Ok(Self::Latest),
            _ => Err(ConfigError::InvalidValue {
                field: "auto_offset_reset".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Producer-side settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Acknowledgment policy
    pub acks: Acks,
    /// How long a send may wait for the broker, in milliseconds
    pub send_timeout_ms: u64,
}

impl ProducerConfig {
    /// Send timeout as a [`Duration`].
    #[must_use]
    pub const fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            acks: Acks::Leader,
            send_timeout_ms: 5_000,
        }
    }
}

/// Consumer-group settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Consumer group id, must not be empty
    pub group_id: String,
    /// Let the broker client commit offsets on its own schedule.
    ///
    /// Leave this off to commit only after a handler succeeds.
    pub auto_commit: bool,
    /// Starting position for a group without committed offsets
    pub auto_offset_reset: OffsetReset,
    /// Group session timeout, in milliseconds
    pub session_timeout_ms: u64,
}

impl ConsumerConfig {
    /// Create consumer settings for `group_id` with defaults elsewhere.
    #[must_use]
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            auto_commit: false,
            auto_offset_reset: OffsetReset::Earliest,
            session_timeout_ms: 6_000,
        }
    }
}

/// Connection settings for one broker cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Bootstrap broker addresses, in order
    pub brokers: Vec<String>,
    /// Connect over TLS
    pub tls: bool,
    /// Optional client id
    pub client_id: Option<String>,
    /// Producer settings
    pub producer: ProducerConfig,
    /// Consumer-group settings; `None` means producer-only
    pub consumer: Option<ConsumerConfig>,
}

impl BrokerConfig {
    /// Start building a configuration.
    #[must_use]
    pub fn builder() -> BrokerConfigBuilder {
        BrokerConfigBuilder::default()
    }

    /// Broker list joined the way Kafka clients expect (`host:port,host:port`).
    #[must_use]
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }

    /// Check structural invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] when the broker list is empty,
    /// contains a blank address, the group id is blank, or a timeout is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.brokers.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one broker is required".to_string(),
            ));
        }
        if self.brokers.iter().any(|b| b.trim().is_empty()) {
            return Err(ConfigError::ValidationError(
                "broker addresses cannot be empty".to_string(),
            ));
        }
        if self.producer.send_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "send_timeout_ms must be > 0".to_string(),
            ));
        }
        if let Some(consumer) = &self.consumer {
            if consumer.group_id.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "consumer group id cannot be empty".to_string(),
                ));
            }
            if consumer.session_timeout_ms == 0 {
                return Err(ConfigError::ValidationError(
                    "session_timeout_ms must be > 0".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Load configuration from `FLUXGATE_KAFKA_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EnvVarNotSet`] when the broker list is missing,
    /// [`ConfigError::InvalidValue`] for unparsable values, and any
    /// validation error from [`BrokerConfig::validate`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// [`BrokerConfig::from_env`] delegates here; tests pass a map instead of
    /// touching the process environment.
    ///
    /// # Errors
    ///
    /// Same as [`BrokerConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let brokers = lookup(ENV_BROKERS)
            .ok_or_else(|| ConfigError::EnvVarNotSet(ENV_BROKERS.to_string()))?;

        let mut builder = Self::builder().brokers(
            brokers
                .split(',')
                .map(str::trim)
                .filter(|b| !b.is_empty()),
        );

        if let Some(tls) = lookup(ENV_TLS) {
            builder = builder.tls(parse_bool(ENV_TLS, &tls)?);
        }
        if let Some(acks) = lookup(ENV_ACKS) {
            builder = builder.acks(acks.parse()?);
        }
        if let Some(client_id) = lookup(ENV_CLIENT_ID) {
            builder = builder.client_id(client_id);
        }
        if let Some(group_id) = lookup(ENV_GROUP_ID) {
            builder = builder.group_id(group_id);
            if let Some(auto_commit) = lookup(ENV_AUTO_COMMIT) {
                builder = builder.auto_commit(parse_bool(ENV_AUTO_COMMIT, &auto_commit)?);
            }
            if let Some(reset) = lookup(ENV_OFFSET_RESET) {
                builder = builder.auto_offset_reset(reset.parse()?);
            }
        }

        builder.build()
    }
}

fn parse_bool(field: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Builder for [`BrokerConfig`].
///
/// Consumer settings are only materialized once a group id is set; the other
/// consumer setters are remembered and applied at that point.
#[derive(Debug, Default)]
pub struct BrokerConfigBuilder {
    brokers: Vec<String>,
    tls: bool,
    client_id: Option<String>,
    acks: Option<Acks>,
    send_timeout: Option<Duration>,
    group_id: Option<String>,
    auto_commit: Option<bool>,
    auto_offset_reset: Option<OffsetReset>,
    session_timeout: Option<Duration>,
}

impl BrokerConfigBuilder {
    /// Set the broker addresses, replacing any previously set.
    #[must_use]
    pub fn brokers<I, S>(mut self, brokers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.brokers = brokers.into_iter().map(Into::into).collect();
        self
    }

    /// Append one broker address.
    #[must_use]
    pub fn broker(mut self, broker: impl Into<String>) -> Self {
        self.brokers.push(broker.into());
        self
    }

    /// Enable or disable TLS.
    #[must_use]
    pub const fn tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Set the client id.
    #[must_use]
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Set the producer acknowledgment policy.
    ///
    /// Default: [`Acks::Leader`]
    #[must_use]
    pub const fn acks(mut self, acks: Acks) -> Self {
        self.acks = Some(acks);
        self
    }

    /// Set the producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    /// Set the consumer group id. Without it the config is producer-only.
    #[must_use]
    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Enable or disable broker-side auto commit.
    ///
    /// Default: `false`
    #[must_use]
    pub const fn auto_commit(mut self, enabled: bool) -> Self {
        self.auto_commit = Some(enabled);
        self
    }

    /// Set the auto offset reset policy.
    ///
    /// Default: [`OffsetReset::Earliest`]
    #[must_use]
    pub const fn auto_offset_reset(mut self, policy: OffsetReset) -> Self {
        self.auto_offset_reset = Some(policy);
        self
    }

    /// Set the consumer-group session timeout.
    ///
    /// Default: 6 seconds
    #[must_use]
    pub const fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Build and validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns any error from [`BrokerConfig::validate`].
    pub fn build(self) -> Result<BrokerConfig, ConfigError> {
        let producer = ProducerConfig {
            acks: self.acks.unwrap_or_default(),
            send_timeout_ms: self
                .send_timeout
                .map_or(5_000, |t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
        };

        let consumer = self.group_id.map(|group_id| {
            let mut consumer = ConsumerConfig::new(group_id);
            if let Some(auto_commit) = self.auto_commit {
                consumer.auto_commit = auto_commit;
            }
            if let Some(reset) = self.auto_offset_reset {
                consumer.auto_offset_reset = reset;
            }
            if let Some(timeout) = self.session_timeout {
                consumer.session_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
            }
            consumer
        });

        let config = BrokerConfig {
            brokers: self.brokers,
            tls: self.tls,
            client_id: self.client_id,
            producer,
            consumer,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn builder_defaults() {
        let config = BrokerConfig::builder().broker("localhost:9092").build().unwrap();

        assert_eq!(config.brokers, vec!["localhost:9092"]);
        assert!(!config.tls);
        assert_eq!(config.producer.acks, Acks::Leader);
        assert_eq!(config.producer.send_timeout(), Duration::from_secs(5));
        assert!(config.consumer.is_none());
    }

    #[test]
    fn builder_applies_consumer_settings_once_group_is_set() {
        let config = BrokerConfig::builder()
            .brokers(["a:9092", "b:9092"])
            .auto_commit(true)
            .auto_offset_reset(OffsetReset::Latest)
            .group_id("orders")
            .build()
            .unwrap();

        let consumer = config.consumer.clone().unwrap();
        assert_eq!(consumer.group_id, "orders");
        assert!(consumer.auto_commit);
        assert_eq!(consumer.auto_offset_reset, OffsetReset::Latest);
        assert_eq!(config.bootstrap_servers(), "a:9092,b:9092");
    }

    #[test]
    fn empty_broker_list_is_rejected() {
        let err = BrokerConfig::builder().build().unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn blank_group_id_is_rejected() {
        let err = BrokerConfig::builder()
            .broker("localhost:9092")
            .group_id("  ")
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn acks_parse_names_and_numbers() {
        assert_eq!("none".parse::<Acks>().unwrap(), Acks::None);
        assert_eq!("1".parse::<Acks>().unwrap(), Acks::Leader);
        assert_eq!("ALL".parse::<Acks>().unwrap(), Acks::All);
        assert!("most".parse::<Acks>().is_err());
        assert_eq!(Acks::All.as_kafka_value(), "all");
        assert_eq!(Acks::None.as_kafka_value(), "0");
    }

    #[test]
    fn from_lookup_reads_all_variables() {
        let config = BrokerConfig::from_lookup(lookup(&[
            (ENV_BROKERS, "k1:9092, k2:9092"),
            (ENV_TLS, "true"),
            (ENV_ACKS, "all"),
            (ENV_GROUP_ID, "billing"),
            (ENV_AUTO_COMMIT, "false"),
            (ENV_OFFSET_RESET, "latest"),
            (ENV_CLIENT_ID, "billing-1"),
        ]))
        .unwrap();

        assert_eq!(config.brokers, vec!["k1:9092", "k2:9092"]);
        assert!(config.tls);
        assert_eq!(config.producer.acks, Acks::All);
        assert_eq!(config.client_id.as_deref(), Some("billing-1"));
        let consumer = config.consumer.unwrap();
        assert_eq!(consumer.group_id, "billing");
        assert!(!consumer.auto_commit);
        assert_eq!(consumer.auto_offset_reset, OffsetReset::Latest);
    }

    #[test]
    fn from_lookup_requires_brokers() {
        let err = BrokerConfig::from_lookup(lookup(&[])).unwrap_err();
        assert_eq!(err, ConfigError::EnvVarNotSet(ENV_BROKERS.to_string()));
    }

    #[test]
    fn from_lookup_rejects_bad_bool() {
        let err = BrokerConfig::from_lookup(lookup(&[
            (ENV_BROKERS, "localhost:9092"),
            (ENV_TLS, "maybe"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = BrokerConfig::builder()
            .broker("localhost:9092")
            .acks(Acks::All)
            .group_id("g")
            .build()
            .unwrap();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"acks\":\"all\""));
        let back: BrokerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
