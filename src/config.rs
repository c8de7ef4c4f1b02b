use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::dialect::ProtocolDialect;

/// Which protocol dialect the adapter is allowed to negotiate.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolPreference {
    Auto,
    V5,
    V311,
}

impl ProtocolPreference {
    /// Dialects to try, in order.
    pub fn candidates(self) -> &'static [ProtocolDialect] {
        match self {
            ProtocolPreference::Auto => &[ProtocolDialect::V5, ProtocolDialect::V311],
            ProtocolPreference::V5 => &[ProtocolDialect::V5],
            ProtocolPreference::V311 => &[ProtocolDialect::V311],
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_client_id: String,
    pub mqtt_username: String,
    pub mqtt_password: String,
    pub mqtt_keep_alive_secs: u64,
    pub mqtt_protocol: ProtocolPreference,
    pub mqtt_connect_attempts: usize,
    pub mqtt_connect_timeout_ms: u64,
    pub mqtt_max_retries: i32,
    pub mqtt_retry_interval_ms: u64,

    pub sensor_topic: String,
    pub actuator_topic: String,

    pub read_timeout_secs: f64,
    pub max_read_timeout_secs: f64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

impl Config {
    /// Validate timeout values and other critical configurations.
    fn validate_timeouts(&self) -> Result<(), ConfigError> {
        const MIN_TIMEOUT: u64 = 100;
        const MAX_TIMEOUT: u64 = 1_000_000;
        const MAX_READ_TIMEOUT_SECS: f64 = 3600.0;

        if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&self.mqtt_retry_interval_ms) {
            return Err(ConfigError::ParsingError(format!(
                "MQTT_RETRY_INTERVAL_MS must be between {} and {} ms",
                MIN_TIMEOUT, MAX_TIMEOUT
            )));
        }

        if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&self.mqtt_connect_timeout_ms) {
            return Err(ConfigError::ParsingError(format!(
                "MQTT_CONNECT_TIMEOUT_MS must be between {} and {} ms",
                MIN_TIMEOUT, MAX_TIMEOUT
            )));
        }

        // rumqttc refuses keep-alive intervals below 5 s
        if !(5..=u16::MAX as u64).contains(&self.mqtt_keep_alive_secs) {
            return Err(ConfigError::ParsingError(
                "MQTT_KEEP_ALIVE_SECS must be between 5 and 65535".to_string(),
            ));
        }

        if !(1..=20).contains(&self.mqtt_connect_attempts) {
            return Err(ConfigError::ParsingError(
                "MQTT_CONNECT_ATTEMPTS must be between 1 and 20".to_string(),
            ));
        }

        let read_timeouts_ok = self.read_timeout_secs.is_finite()
            && self.max_read_timeout_secs.is_finite()
            && self.read_timeout_secs >= 0.0
            && self.read_timeout_secs <= self.max_read_timeout_secs
            && self.max_read_timeout_secs <= MAX_READ_TIMEOUT_SECS;
        if !read_timeouts_ok {
            return Err(ConfigError::ParsingError(format!(
                "READ_TIMEOUT_SECS must be between 0 and MAX_READ_TIMEOUT_SECS (at most {} s)",
                MAX_READ_TIMEOUT_SECS
            )));
        }

        Ok(())
    }

    fn validate_topics(&self) -> Result<(), ConfigError> {
        for (name, topic) in [
            ("MQTT_SENSOR_TOPIC", &self.sensor_topic),
            ("MQTT_ACTUATOR_TOPIC", &self.actuator_topic),
        ] {
            if topic.is_empty() || topic.contains(['+', '#']) {
                return Err(ConfigError::MissingOrInvalid(name.to_string()));
            }
        }
        if self.sensor_topic == self.actuator_topic {
            return Err(ConfigError::ParsingError(
                "sensor and actuator topics must differ".to_string(),
            ));
        }
        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var_or = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        fn parse<T: std::str::FromStr>(key: &str, raw: String, what: &str) -> Result<T, ConfigError> {
            raw.trim()
                .parse::<T>()
                .map_err(|_| ConfigError::ParsingError(format!("{} must be {}", key, what)))
        }

        // Helper to prepend root topic if available
        let prepend_root_topic = |root: &str, topic: &str| {
            if !root.is_empty() {
                format!("{}/{}", root.trim_end_matches('/'), topic.trim_start_matches('/'))
            } else {
                topic.to_string()
            }
        };

        let mqtt_root_topic = var_or("MQTT_ROOT_TOPIC", "ucb/test/topic");

        let mqtt_protocol = match var_or("MQTT_PROTOCOL", "auto").trim().to_lowercase().as_str() {
            "auto" => ProtocolPreference::Auto,
            "v5" | "5" => ProtocolPreference::V5,
            "v311" | "3.1.1" | "4" => ProtocolPreference::V311,
            _ => return Err(ConfigError::MissingOrInvalid("MQTT_PROTOCOL".to_string())),
        };

        let mqtt_client_id = lookup("MQTT_CLIENT_ID")
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("mqtt_bridge_{}", Uuid::new_v4()));

        let config = Self {
            // MQTT Configuration
            mqtt_host: var_or("MQTT_HOST", "broker.hivemq.com"),
            mqtt_port: parse("MQTT_PORT", var_or("MQTT_PORT", "1883"), "a valid port number")?,
            mqtt_client_id,
            mqtt_username: var_or("MQTT_USERNAME", ""), // Default to empty
            mqtt_password: var_or("MQTT_PASSWORD", ""), // Default to empty
            mqtt_keep_alive_secs: parse(
                "MQTT_KEEP_ALIVE_SECS",
                var_or("MQTT_KEEP_ALIVE_SECS", "60"),
                "a number of seconds",
            )?,
            mqtt_protocol,
            mqtt_connect_attempts: parse(
                "MQTT_CONNECT_ATTEMPTS",
                var_or("MQTT_CONNECT_ATTEMPTS", "3"),
                "a positive integer",
            )?,
            mqtt_connect_timeout_ms: parse(
                "MQTT_CONNECT_TIMEOUT_MS",
                var_or("MQTT_CONNECT_TIMEOUT_MS", "10000"),
                "a valid number",
            )?,
            mqtt_max_retries: parse(
                "MQTT_MAX_RETRIES",
                var_or("MQTT_MAX_RETRIES", "-1"),
                "an integer",
            )?,
            mqtt_retry_interval_ms: parse(
                "MQTT_RETRY_INTERVAL_MS",
                var_or("MQTT_RETRY_INTERVAL_MS", "5000"),
                "a valid number",
            )?,

            // MQTT Topics
            sensor_topic: prepend_root_topic(&mqtt_root_topic, &var_or("MQTT_SENSOR_TOPIC", "distance")),
            actuator_topic: prepend_root_topic(&mqtt_root_topic, &var_or("MQTT_ACTUATOR_TOPIC", "led")),

            read_timeout_secs: parse(
                "READ_TIMEOUT_SECS",
                var_or("READ_TIMEOUT_SECS", "2.0"),
                "a number of seconds",
            )?,
            max_read_timeout_secs: parse(
                "MAX_READ_TIMEOUT_SECS",
                var_or("MAX_READ_TIMEOUT_SECS", "30.0"),
                "a number of seconds",
            )?,
        };

        // Validate timeouts after constructing the configuration
        config.validate_timeouts()?;
        config.validate_topics()?;

        Ok(config)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keep_alive_secs)
    }

    pub fn credentials(&self) -> Option<(&str, &str)> {
        if !self.mqtt_username.is_empty() && !self.mqtt_password.is_empty() {
            Some((&self.mqtt_username, &self.mqtt_password))
        } else {
            None
        }
    }
}
