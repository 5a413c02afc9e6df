//! Configuration for the Qingping bridge.
//!
//! Values come from an optional JSON5 file, then from environment variables
//! (which win over the file), then from CLI flags applied in `main`.

use airsight_common::DeviceTopics;
use airsight_common::config::{LogFormat, LoggingConfig, MqttConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::keepalive::KeepaliveCommand;
use crate::mapping::DEFAULT_PREFIX;

/// Upper bound for `update_interval_secs` and `duration_secs`.
///
/// Keeps `2 × interval` and timer deadlines far from `Duration`/`Instant`
/// overflow.
pub const MAX_PERIOD_SECS: u64 = u32::MAX as u64;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// MQTT broker connection settings.
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// The device this bridge keeps reporting.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Prometheus endpoint settings.
    #[serde(default)]
    pub prometheus: PrometheusConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Device settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// MAC address used in the device topics (required).
    #[serde(default)]
    pub mac: String,

    /// Identity used as the `device` label.
    #[serde(default = "default_device_name")]
    pub name: String,

    /// Topic prefix (`<prefix>/<mac>/up|down`).
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    /// Seconds between readings requested from the device.
    #[serde(default = "default_update_interval")]
    pub update_interval_secs: u64,

    /// How long the device keeps reporting after each command (seconds).
    #[serde(default = "default_duration")]
    pub duration_secs: u64,
}

fn default_device_name() -> String {
    "living_room".to_string()
}

fn default_topic_prefix() -> String {
    airsight_common::TOPIC_PREFIX.to_string()
}

fn default_update_interval() -> u64 {
    60
}

fn default_duration() -> u64 {
    21600 // 6 hours
}

impl DeviceConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    /// Topics of this device.
    pub fn topics(&self) -> DeviceTopics {
        DeviceTopics::with_prefix(&self.topic_prefix, &self.mac)
    }

    /// Report-interval command sent to this device.
    pub fn keepalive_command(&self) -> KeepaliveCommand {
        KeepaliveCommand::new(self.update_interval_secs, self.duration_secs)
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            mac: String::new(),
            name: default_device_name(),
            topic_prefix: default_topic_prefix(),
            update_interval_secs: default_update_interval(),
            duration_secs: default_duration(),
        }
    }
}

/// Prometheus HTTP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    /// Address to listen on (default: "0.0.0.0:9273").
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path for metrics endpoint (default: "/metrics").
    #[serde(default = "default_path")]
    pub path: String,

    /// Metric name prefix (default: "qingping").
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_listen() -> String {
    "0.0.0.0:9273".to_string()
}

fn default_path() -> String {
    "/metrics".to_string()
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_path(),
            prefix: default_prefix(),
        }
    }
}

/// An environment value that could not be parsed and was ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnoredEnv {
    pub key: &'static str,
    pub value: String,
}

impl BridgeConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string.
    ///
    /// Does not validate: the device MAC is usually supplied by the
    /// environment afterwards.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(json5::from_str(content)?)
    }

    /// Overlay values from the process environment.
    pub fn apply_env(&mut self) -> Vec<IgnoredEnv> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Overlay values from an environment lookup.
    ///
    /// Unparseable values keep the current setting and are returned so they
    /// can be reported once logging is up.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Vec<IgnoredEnv> {
        let mut ignored = Vec::new();
        let mut overlay = EnvOverlay {
            lookup: &lookup,
            ignored: &mut ignored,
        };

        overlay.string("MQTT_BROKER", &mut self.mqtt.host);
        overlay.parsed("MQTT_PORT", &mut self.mqtt.port);
        overlay.optional("MQTT_USERNAME", &mut self.mqtt.username);
        overlay.optional("MQTT_PASSWORD", &mut self.mqtt.password);
        overlay.string("MQTT_CLIENT_ID", &mut self.mqtt.client_id);
        overlay.string("DEVICE_MAC", &mut self.device.mac);
        overlay.string("DEVICE_NAME", &mut self.device.name);
        overlay.string("TOPIC_PREFIX", &mut self.device.topic_prefix);
        overlay.parsed("UPDATE_INTERVAL", &mut self.device.update_interval_secs);
        overlay.parsed("DURATION", &mut self.device.duration_secs);
        overlay.string("LOG_LEVEL", &mut self.logging.level);
        overlay.parsed::<LogFormat>("LOG_FORMAT", &mut self.logging.format);

        let mut port: Option<u16> = None;
        overlay.parsed_optional("METRICS_PORT", &mut port);
        if let Some(port) = port {
            self.prometheus.listen = with_port(&self.prometheus.listen, port);
        }

        ignored
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.mac.trim().is_empty() {
            return Err(ConfigError::Validation(
                "device MAC is required (set DEVICE_MAC or device.mac)".to_string(),
            ));
        }

        if self.device.name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "device name must not be empty".to_string(),
            ));
        }

        if self.device.update_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "update_interval_secs must be > 0".to_string(),
            ));
        }

        if self.device.duration_secs == 0 {
            return Err(ConfigError::Validation(
                "duration_secs must be > 0".to_string(),
            ));
        }

        if self.device.update_interval_secs > MAX_PERIOD_SECS {
            return Err(ConfigError::Validation(format!(
                "update_interval_secs must be <= {}",
                MAX_PERIOD_SECS
            )));
        }

        if self.device.duration_secs > MAX_PERIOD_SECS {
            return Err(ConfigError::Validation(format!(
                "duration_secs must be <= {}",
                MAX_PERIOD_SECS
            )));
        }

        if self.mqtt.host.trim().is_empty() {
            return Err(ConfigError::Validation(
                "MQTT host must not be empty".to_string(),
            ));
        }

        if self.mqtt.client_id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "MQTT client id must not be empty".to_string(),
            ));
        }

        if self.mqtt.keep_alive_secs == 0 {
            return Err(ConfigError::Validation(
                "keep_alive_secs must be > 0".to_string(),
            ));
        }

        if self.listen_addr().is_err() {
            return Err(ConfigError::Validation(format!(
                "Invalid listen address: {}",
                self.prometheus.listen
            )));
        }

        if !self.prometheus.path.starts_with('/') {
            return Err(ConfigError::Validation(
                "Metrics path must start with /".to_string(),
            ));
        }

        Ok(())
    }

    /// Parsed HTTP listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.prometheus.listen.parse()
    }
}

struct EnvOverlay<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
    ignored: &'a mut Vec<IgnoredEnv>,
}

impl<F: Fn(&str) -> Option<String>> EnvOverlay<'_, F> {
    fn string(&mut self, key: &'static str, target: &mut String) {
        if let Some(value) = (self.lookup)(key) {
            *target = value;
        }
    }

    fn optional(&mut self, key: &'static str, target: &mut Option<String>) {
        if let Some(value) = (self.lookup)(key) {
            *target = if value.is_empty() { None } else { Some(value) };
        }
    }

    fn parsed<T: FromStr>(&mut self, key: &'static str, target: &mut T) {
        let mut parsed = None;
        self.parsed_optional(key, &mut parsed);
        if let Some(value) = parsed {
            *target = value;
        }
    }

    fn parsed_optional<T: FromStr>(&mut self, key: &'static str, target: &mut Option<T>) {
        if let Some(value) = (self.lookup)(key) {
            match value.trim().parse() {
                Ok(parsed) => *target = Some(parsed),
                Err(_) => self.ignored.push(IgnoredEnv { key, value }),
            }
        }
    }
}

/// Replace the port of a `host:port` listen address.
fn with_port(listen: &str, port: u16) -> String {
    match listen.parse::<SocketAddr>() {
        Ok(mut addr) => {
            addr.set_port(port);
            addr.to_string()
        }
        Err(_) => format!("0.0.0.0:{}", port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = BridgeConfig::parse("{}").unwrap();

        assert_eq!(config.mqtt.host, "mosquitto");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.device.name, "living_room");
        assert_eq!(config.device.topic_prefix, "qingping");
        assert_eq!(config.device.update_interval_secs, 60);
        assert_eq!(config.device.duration_secs, 21600);
        assert_eq!(config.prometheus.listen, "0.0.0.0:9273");
        assert_eq!(config.prometheus.path, "/metrics");
        assert_eq!(config.prometheus.prefix, "qingping");
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            mqtt: {
                host: "broker.lan",
                port: 1884,
                username: "collector",
                password: "secret",
            },
            device: {
                mac: "582D34123456",
                name: "bedroom",
                update_interval_secs: 30,
                duration_secs: 3600,
            },
            prometheus: {
                listen: "127.0.0.1:9274",
                path: "/prometheus/metrics",
                prefix: "air",
            },
            logging: {
                level: "debug",
                format: "json"
            }
        }"#;

        let config = BridgeConfig::parse(json).unwrap();
        config.validate().unwrap();

        assert_eq!(config.mqtt.host, "broker.lan");
        assert_eq!(config.mqtt.username.as_deref(), Some("collector"));
        assert_eq!(config.device.mac, "582D34123456");
        assert_eq!(config.device.name, "bedroom");
        assert_eq!(config.device.update_interval(), Duration::from_secs(30));
        assert_eq!(config.device.duration_secs, 3600);
        assert_eq!(config.prometheus.path, "/prometheus/metrics");
        assert_eq!(config.prometheus.prefix, "air");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.device.topics().up(), "qingping/582D34123456/up");
        assert_eq!(
            config.device.keepalive_command(),
            KeepaliveCommand::new(30, 3600)
        );
    }

    #[test]
    fn test_env_overrides() {
        let mut config = BridgeConfig::parse(r#"{ device: { mac: "FILE" } }"#).unwrap();
        let ignored = config.apply_env_from(env(&[
            ("MQTT_BROKER", "10.0.0.2"),
            ("MQTT_PORT", "1884"),
            ("MQTT_USERNAME", "u"),
            ("MQTT_PASSWORD", "p"),
            ("DEVICE_MAC", "582D34123456"),
            ("DEVICE_NAME", "office"),
            ("UPDATE_INTERVAL", "30"),
            ("DURATION", "7200"),
            ("METRICS_PORT", "9999"),
            ("LOG_FORMAT", "json"),
        ]));

        assert!(ignored.is_empty());
        assert_eq!(config.mqtt.host, "10.0.0.2");
        assert_eq!(config.mqtt.port, 1884);
        assert_eq!(config.mqtt.username.as_deref(), Some("u"));
        assert_eq!(config.mqtt.password.as_deref(), Some("p"));
        assert_eq!(config.device.mac, "582D34123456");
        assert_eq!(config.device.name, "office");
        assert_eq!(config.device.update_interval_secs, 30);
        assert_eq!(config.device.duration_secs, 7200);
        assert_eq!(config.prometheus.listen, "0.0.0.0:9999");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_env_invalid_numbers_keep_defaults() {
        let mut config = BridgeConfig::default();
        let ignored = config.apply_env_from(env(&[
            ("UPDATE_INTERVAL", "soon"),
            ("METRICS_PORT", "99999"),
        ]));

        assert_eq!(config.device.update_interval_secs, 60);
        assert_eq!(config.prometheus.listen, "0.0.0.0:9273");
        assert_eq!(ignored.len(), 2);
        assert_eq!(ignored[0].key, "UPDATE_INTERVAL");
        assert_eq!(ignored[1].key, "METRICS_PORT");
    }

    #[test]
    fn test_empty_username_clears_credentials() {
        let mut config = BridgeConfig::default();
        config.mqtt.username = Some("file-user".to_string());
        config.apply_env_from(env(&[("MQTT_USERNAME", "")]));
        assert!(config.mqtt.username.is_none());
    }

    #[test]
    fn test_validate_requires_mac() {
        let config = BridgeConfig::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("device MAC is required"));
    }

    #[test]
    fn test_validate_zero_interval() {
        let mut config = BridgeConfig::default();
        config.device.mac = "582D34123456".to_string();
        config.device.update_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_huge_periods() {
        let mut config = BridgeConfig::default();
        let ignored = config.apply_env_from(env(&[
            ("DEVICE_MAC", "582D34123456"),
            ("UPDATE_INTERVAL", "10000000000000000000"),
        ]));

        assert!(ignored.is_empty());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("update_interval_secs must be <="));

        config.device.update_interval_secs = MAX_PERIOD_SECS;
        config.validate().unwrap();

        config.device.duration_secs = MAX_PERIOD_SECS + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_invalid_listen() {
        let json = r#"{
            device: { mac: "582D34123456" },
            prometheus: { listen: "not-an-address" }
        }"#;

        let result = BridgeConfig::parse(json).unwrap().validate();
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Invalid listen address")
        );
    }

    #[test]
    fn test_validate_invalid_path() {
        let json = r#"{
            device: { mac: "582D34123456" },
            prometheus: { path: "no-leading-slash" }
        }"#;

        let result = BridgeConfig::parse(json).unwrap().validate();
        assert!(result.unwrap_err().to_string().contains("must start with /"));
    }

    #[test]
    fn test_with_port() {
        assert_eq!(with_port("127.0.0.1:9273", 8080), "127.0.0.1:8080");
        assert_eq!(with_port("garbage", 8080), "0.0.0.0:8080");
    }
}
