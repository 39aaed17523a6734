// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::str::FromStr;

use crate::errors::ConfigError;

const DEFAULT_SYSLOG_PORT: u16 = 8601;
const DEFAULT_GELF_PORT: u16 = 12201;
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration for the relay server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host both listeners bind to
    pub host: String,
    /// UDP port of the syslog listener
    pub syslog_port: u16,
    /// UDP port of the GELF listener
    pub gelf_port: u16,
    /// Topic used for messages without a service
    pub default_topic: String,
    /// Prepended to every topic, separated by a dot
    pub topic_prefix: String,
    /// Added to messages as `server_ip` when set
    pub server_ip: Option<String>,
    /// Partitioning key, the hostname when unset
    pub partition_key: Option<String>,
    /// Partition count of every topic
    pub partitions: i32,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
    /// Capacity of the channel between the listeners and the router
    pub channel_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            syslog_port: DEFAULT_SYSLOG_PORT,
            gelf_port: DEFAULT_GELF_PORT,
            default_topic: "unknown".to_string(),
            topic_prefix: "service".to_string(),
            server_ip: None,
            partition_key: None,
            partitions: 1,
            log_level: "info".to_string(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl ServerConfig {
    /// Create configuration from `LOG_RELAY_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`ServerConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            host: lookup("LOG_RELAY_HOST").unwrap_or(defaults.host),
            syslog_port: parse_var(lookup("LOG_RELAY_SYSLOG_PORT")).unwrap_or(defaults.syslog_port),
            gelf_port: parse_var(lookup("LOG_RELAY_GELF_PORT")).unwrap_or(defaults.gelf_port),
            default_topic: lookup("LOG_RELAY_DEFAULT_TOPIC").unwrap_or(defaults.default_topic),
            topic_prefix: lookup("LOG_RELAY_TOPIC_PREFIX").unwrap_or(defaults.topic_prefix),
            server_ip: lookup("LOG_RELAY_SERVER_IP").filter(|ip| !ip.is_empty()),
            partition_key: lookup("LOG_RELAY_PARTITION_KEY"),
            partitions: parse_var(lookup("LOG_RELAY_PARTITIONS")).unwrap_or(defaults.partitions),
            log_level: lookup("LOG_RELAY_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
            channel_capacity: parse_var(lookup("LOG_RELAY_CHANNEL_CAPACITY"))
                .unwrap_or(defaults.channel_capacity),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.syslog_port == 0 || self.gelf_port == 0 {
            return Err(ConfigError::InvalidConfig(
                "listener ports must be greater than 0".to_string(),
            ));
        }
        if self.syslog_port == self.gelf_port {
            return Err(ConfigError::InvalidConfig(format!(
                "syslog and GELF listeners cannot share port {}",
                self.syslog_port
            )));
        }
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }
        if self.partitions <= 0 {
            return Err(ConfigError::InvalidConfig(format!(
                "partition count must be positive, got {}",
                self.partitions
            )));
        }
        if self.topic_prefix.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "LOG_RELAY_TOPIC_PREFIX cannot be empty".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "channel capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|val| val.trim().parse().ok())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_vars(vars: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(ServerConfig::default().validate().is_ok());
        assert_eq!(from_vars(&[]).unwrap(), ServerConfig::default());
    }

    #[test]
    fn test_from_vars() {
        let config = from_vars(&[
            ("LOG_RELAY_HOST", "127.0.0.1"),
            ("LOG_RELAY_SYSLOG_PORT", "5514"),
            ("LOG_RELAY_GELF_PORT", "5515"),
            ("LOG_RELAY_DEFAULT_TOPIC", "orphans"),
            ("LOG_RELAY_TOPIC_PREFIX", "logs"),
            ("LOG_RELAY_SERVER_IP", "10.1.2.3"),
            ("LOG_RELAY_PARTITION_KEY", "relay-a"),
            ("LOG_RELAY_PARTITIONS", "12"),
            ("LOG_RELAY_LOG_LEVEL", "DEBUG"),
            ("LOG_RELAY_CHANNEL_CAPACITY", "64"),
        ])
        .unwrap();

        assert_eq!(
            config,
            ServerConfig {
                host: "127.0.0.1".to_string(),
                syslog_port: 5514,
                gelf_port: 5515,
                default_topic: "orphans".to_string(),
                topic_prefix: "logs".to_string(),
                server_ip: Some("10.1.2.3".to_string()),
                partition_key: Some("relay-a".to_string()),
                partitions: 12,
                log_level: "debug".to_string(),
                channel_capacity: 64,
            }
        );
    }

    #[test]
    fn test_unparseable_numbers_fall_back_to_defaults() {
        let config = from_vars(&[
            ("LOG_RELAY_SYSLOG_PORT", "not-a-port"),
            ("LOG_RELAY_PARTITIONS", "many"),
        ])
        .unwrap();
        assert_eq!(config.syslog_port, 8601);
        assert_eq!(config.partitions, 1);
    }

    #[test]
    fn test_validate_invalid_port() {
        let config = ServerConfig {
            gelf_port: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_shared_port() {
        assert!(from_vars(&[("LOG_RELAY_GELF_PORT", "8601")]).is_err());
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let config = ServerConfig {
            log_level: "verbose".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_invalid_partitions() {
        assert!(from_vars(&[("LOG_RELAY_PARTITIONS", "0")]).is_err());
        assert!(from_vars(&[("LOG_RELAY_PARTITIONS", "-3")]).is_err());
    }

    #[test]
    fn test_validate_empty_prefix() {
        let err = from_vars(&[("LOG_RELAY_TOPIC_PREFIX", "  ")]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid configuration: LOG_RELAY_TOPIC_PREFIX cannot be empty"
        );
    }
}
