//! Configuration for broker access and RPC tuning.
//!
//! Broker settings are mandatory and validated when they are built, so a missing credential
//! is reported before any network I/O takes place. RPC tuning is optional and falls back to
//! the documented defaults.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default |
//! |---|---|---|
//! | `RABBITMQ_USER` | yes | |
//! | `RABBITMQ_PASS` | yes | |
//! | `RABBITMQ_HOSTNAME` | yes | |
//! | `RABBITMQ_PORT` | yes | |
//! | `RABBITMQ_EXCHANGE` | yes | |
//! | `RPC_ORIGIN` (or `BB_ORIGIN`) | yes | |
//! | `RABBITMQ_HEARTBEAT_SECS` | no | 60 |
//! | `RABBITMQ_CONNECT_TIMEOUT_MS` | no | 20000 |
//! | `RPC_CALL_TIMEOUT_SECS` | no | 60 |
//! | `RPC_PUBLISH_CONCURRENCY` | no | 1 |
//! | `RPC_PUBLISH_PACING_MS` | no | 1500 |
//! | `RPC_RECONNECT_DELAY_SECS` | no | 5 |
//! | `RPC_RECONNECT_ATTEMPTS` | no | 5 |
//!
//! # Example
//!
//! ```no_run
//! use brokered_rpc_core::config::{BrokerSettings, RpcSettings};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = BrokerSettings::from_env()?;
//! let rpc = RpcSettings::from_env()?;
//! println!("exchange {} with {:?} call timeout", broker.exchange, rpc.call_timeout);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Broker user name.
pub const ENV_USER: &str = "RABBITMQ_USER";
/// Broker password.
pub const ENV_PASS: &str = "RABBITMQ_PASS";
/// Broker host.
pub const ENV_HOST: &str = "RABBITMQ_HOSTNAME";
/// Broker port.
pub const ENV_PORT: &str = "RABBITMQ_PORT";
/// Exchange shared by all domains.
pub const ENV_EXCHANGE: &str = "RABBITMQ_EXCHANGE";
/// Origin tag stamped on every request.
pub const ENV_ORIGIN: &str = "RPC_ORIGIN";
/// Older name of [`ENV_ORIGIN`], read when the former is absent.
pub const ENV_ORIGIN_FALLBACK: &str = "BB_ORIGIN";

/// Configuration error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// One or more required settings are absent or empty
    #[error("missing required settings: {}", .0.join(", "))]
    Missing(Vec<String>),

    /// A setting is present but cannot be used
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        /// Setting name
        key: String,
        /// Offending value
        value: String,
        /// Why it was rejected
        reason: String,
    },
}

/// Connection settings for the broker.
///
/// The password is kept out of `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    /// Broker user name
    pub username: String,
    password: String,
    /// Broker host name
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Exchange every domain declares and publishes to
    pub exchange: String,
    /// Origin tag stamped on outgoing requests
    pub origin_tag: String,
    /// Heartbeat interval negotiated with the broker
    pub heartbeat: Duration,
    /// Timeout for establishing the TCP + AMQP handshake
    pub connect_timeout: Duration,
}

impl BrokerSettings {
    /// Default heartbeat interval.
    pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(60);
    /// Default connection timeout.
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

    /// Create a new builder.
    #[must_use]
    pub fn builder() -> BrokerSettingsBuilder {
        BrokerSettingsBuilder::default()
    }

    /// Load settings from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] listing every absent required variable, or
    /// [`ConfigError::Invalid`] for unparsable values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`BrokerSettings::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = Self::builder();
        builder.username = lookup(ENV_USER);
        builder.password = lookup(ENV_PASS);
        builder.host = lookup(ENV_HOST);
        builder.exchange = lookup(ENV_EXCHANGE);
        builder.origin_tag = lookup(ENV_ORIGIN).or_else(|| lookup(ENV_ORIGIN_FALLBACK));
        builder.port = lookup(ENV_PORT);

        if let Some(secs) = parse_optional::<u64, _>(&lookup, "RABBITMQ_HEARTBEAT_SECS")? {
            builder = builder.heartbeat(Duration::from_secs(secs));
        }
        if let Some(ms) = parse_optional::<u64, _>(&lookup, "RABBITMQ_CONNECT_TIMEOUT_MS")? {
            builder = builder.connect_timeout(Duration::from_millis(ms));
        }

        builder.build()
    }

    /// The broker password.
    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for BrokerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerSettings")
            .field("username", &self.username)
            .field("password", &"***")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("exchange", &self.exchange)
            .field("origin_tag", &self.origin_tag)
            .field("heartbeat", &self.heartbeat)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// Builder for [`BrokerSettings`].
#[derive(Default)]
pub struct BrokerSettingsBuilder {
    username: Option<String>,
    password: Option<String>,
    host: Option<String>,
    port: Option<String>,
    exchange: Option<String>,
    origin_tag: Option<String>,
    heartbeat: Option<Duration>,
    connect_timeout: Option<Duration>,
}

impl BrokerSettingsBuilder {
    /// Set the user name.
    #[must_use]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Set the password.
    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the host.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port.to_string());
        self
    }

    /// Set the exchange name.
    #[must_use]
    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    /// Set the origin tag.
    #[must_use]
    pub fn origin_tag(mut self, origin_tag: impl Into<String>) -> Self {
        self.origin_tag = Some(origin_tag.into());
        self
    }

    /// Set the heartbeat interval.
    ///
    /// Default: 60 seconds
    #[must_use]
    pub const fn heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    /// Set the connection timeout.
    ///
    /// Default: 20 seconds
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Build the settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] naming every absent or blank required setting, or
    /// [`ConfigError::Invalid`] if the port is not a valid TCP port.
    pub fn build(self) -> Result<BrokerSettings, ConfigError> {
        let required = [
            (ENV_USER, &self.username),
            (ENV_PASS, &self.password),
            (ENV_HOST, &self.host),
            (ENV_PORT, &self.port),
            (ENV_EXCHANGE, &self.exchange),
            (ENV_ORIGIN, &self.origin_tag),
        ];
        let missing: Vec<String> = required
            .iter()
            .filter(|(_, value)| value.as_deref().is_none_or(|v| v.trim().is_empty()))
            .map(|(key, _)| (*key).to_string())
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        let port_value = self.port.unwrap_or_default();
        let port = parse_value::<u16>(ENV_PORT, &port_value)?;
        if port == 0 {
            return Err(ConfigError::Invalid {
                key: ENV_PORT.to_string(),
                value: port_value,
                reason: "port must be non-zero".to_string(),
            });
        }

        Ok(BrokerSettings {
            username: self.username.unwrap_or_default(),
            password: self.password.unwrap_or_default(),
            host: self.host.unwrap_or_default(),
            port,
            exchange: self.exchange.unwrap_or_default(),
            origin_tag: self.origin_tag.unwrap_or_default(),
            heartbeat: self.heartbeat.unwrap_or(BrokerSettings::DEFAULT_HEARTBEAT),
            connect_timeout: self
                .connect_timeout
                .unwrap_or(BrokerSettings::DEFAULT_CONNECT_TIMEOUT),
        })
    }
}

/// Tuning knobs for the RPC runtime.
///
/// # Default Values
///
/// - `call_timeout`: 60 seconds
/// - `publish_concurrency`: 1
/// - `publish_pacing`: 1.5 seconds between a publish and the next one
/// - `reconnect_delay`: 5 seconds
/// - `reconnect_attempts`: 5
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcSettings {
    /// Deadline for a response once the request is published
    pub call_timeout: Duration,
    /// Publishes allowed in flight per domain
    pub publish_concurrency: usize,
    /// Minimum gap between a publish permit release and the next grant
    pub publish_pacing: Duration,
    /// Fixed delay between connection attempts
    pub reconnect_delay: Duration,
    /// Connection attempts before the session is declared fatal
    pub reconnect_attempts: usize,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(60),
            publish_concurrency: 1,
            publish_pacing: Duration::from_millis(1500),
            reconnect_delay: Duration::from_secs(5),
            reconnect_attempts: 5,
        }
    }
}

impl RpcSettings {
    /// Load tuning from process environment variables, keeping defaults for absent ones.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for unparsable or out-of-range values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load tuning through an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`RpcSettings::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let settings = Self {
            call_timeout: parse_optional::<u64, _>(&lookup, "RPC_CALL_TIMEOUT_SECS")?
                .map_or(defaults.call_timeout, Duration::from_secs),
            publish_concurrency: parse_optional(&lookup, "RPC_PUBLISH_CONCURRENCY")?
                .unwrap_or(defaults.publish_concurrency),
            publish_pacing: parse_optional::<u64, _>(&lookup, "RPC_PUBLISH_PACING_MS")?
                .map_or(defaults.publish_pacing, Duration::from_millis),
            reconnect_delay: parse_optional::<u64, _>(&lookup, "RPC_RECONNECT_DELAY_SECS")?
                .map_or(defaults.reconnect_delay, Duration::from_secs),
            reconnect_attempts: parse_optional(&lookup, "RPC_RECONNECT_ATTEMPTS")?
                .unwrap_or(defaults.reconnect_attempts),
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Set the call timeout.
    #[must_use]
    pub const fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Set the publish concurrency.
    #[must_use]
    pub const fn with_publish_concurrency(mut self, concurrency: usize) -> Self {
        self.publish_concurrency = concurrency;
        self
    }

    /// Set the publish pacing. `Duration::ZERO` disables pacing.
    #[must_use]
    pub const fn with_publish_pacing(mut self, pacing: Duration) -> Self {
        self.publish_pacing = pacing;
        self
    }

    /// Set the reconnect delay.
    #[must_use]
    pub const fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the reconnect attempt budget.
    #[must_use]
    pub const fn with_reconnect_attempts(mut self, attempts: usize) -> Self {
        self.reconnect_attempts = attempts;
        self
    }

    /// Check ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the concurrency or attempt budget is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.publish_concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "RPC_PUBLISH_CONCURRENCY".to_string(),
                value: "0".to_string(),
                reason: "at least one publish must be allowed".to_string(),
            });
        }
        if self.reconnect_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "RPC_RECONNECT_ATTEMPTS".to_string(),
                value: "0".to_string(),
                reason: "at least one connection attempt is required".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_optional<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => parse_value(key, &value).map(Some),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    fn complete_env() -> Vec<(&'static str, &'static str)> {
        vec![
            (ENV_USER, "guest"),
            (ENV_PASS, "secret"),
            (ENV_HOST, "broker.local"),
            (ENV_PORT, "5672"),
            (ENV_EXCHANGE, "storefront"),
            (ENV_ORIGIN, "shop"),
        ]
    }

    #[test]
    fn loads_complete_settings_with_defaults() {
        let settings = BrokerSettings::from_lookup(lookup_from(&complete_env())).unwrap();
        assert_eq!(settings.host, "broker.local");
        assert_eq!(settings.port, 5672);
        assert_eq!(settings.password(), "secret");
        assert_eq!(settings.heartbeat, Duration::from_secs(60));
        assert_eq!(settings.connect_timeout, Duration::from_secs(20));
    }

    #[test]
    fn reports_every_missing_setting() {
        let err = BrokerSettings::from_lookup(lookup_from(&[(ENV_USER, "guest"), (ENV_HOST, "  ")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Missing(vec![
                ENV_PASS.to_string(),
                ENV_HOST.to_string(),
                ENV_PORT.to_string(),
                ENV_EXCHANGE.to_string(),
                ENV_ORIGIN.to_string(),
            ])
        );
    }

    #[test]
    fn origin_falls_back_to_older_variable() {
        let mut env = complete_env();
        env.retain(|(k, _)| *k != ENV_ORIGIN);
        env.push((ENV_ORIGIN_FALLBACK, "backoffice"));
        let settings = BrokerSettings::from_lookup(lookup_from(&env)).unwrap();
        assert_eq!(settings.origin_tag, "backoffice");

        env.push((ENV_ORIGIN, "shop"));
        let settings = BrokerSettings::from_lookup(lookup_from(&env)).unwrap();
        assert_eq!(settings.origin_tag, "shop");
    }

    #[test]
    fn rejects_unparsable_port() {
        let mut env = complete_env();
        env.retain(|(k, _)| *k != ENV_PORT);
        env.push((ENV_PORT, "amqp"));
        let err = BrokerSettings::from_lookup(lookup_from(&env)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == ENV_PORT));
    }

    #[test]
    fn debug_output_redacts_password() {
        let settings = BrokerSettings::from_lookup(lookup_from(&complete_env())).unwrap();
        let rendered = format!("{settings:?}");
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("***"));
    }

    #[test]
    fn rpc_settings_default_when_absent() {
        let settings = RpcSettings::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(settings, RpcSettings::default());
        assert_eq!(settings.publish_pacing, Duration::from_millis(1500));
    }

    #[test]
    fn rpc_settings_override_and_validate() {
        let settings = RpcSettings::from_lookup(lookup_from(&[
            ("RPC_CALL_TIMEOUT_SECS", "2"),
            ("RPC_PUBLISH_PACING_MS", "0"),
            ("RPC_RECONNECT_ATTEMPTS", "3"),
        ]))
        .unwrap();
        assert_eq!(settings.call_timeout, Duration::from_secs(2));
        assert_eq!(settings.publish_pacing, Duration::ZERO);
        assert_eq!(settings.reconnect_attempts, 3);

        let err = RpcSettings::from_lookup(lookup_from(&[("RPC_PUBLISH_CONCURRENCY", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}
