// MIT License - Copyright (c) 2026 Peter Wright
// Gateway configuration file and environment overrides

use std::path::{Path, PathBuf};
use std::time::Duration;

use rumqttc::QoS;
use serde::Deserialize;

use crate::devices::KeypadDefaults;
use crate::error::{GatewayError, Result};

/// Top-level TOML configuration. Every section is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub bridge: BridgeConfig,
    /// Gateway-wide keypad timer defaults
    #[serde(default)]
    pub keypad: KeypadDefaults,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub clean_session: bool,
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
    #[serde(default)]
    pub qos: u8,
    /// Retain state topics.
    #[serde(default = "default_true")]
    pub retain: bool,
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_client_id() -> String {
    "wyzesense2mqtt".to_string()
}
fn default_keepalive() -> u64 {
    60
}
fn default_true() -> bool {
    true
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            username: None,
            password: None,
            client_id: default_client_id(),
            clean_session: false,
            keepalive_secs: default_keepalive(),
            qos: 0,
            retain: true,
        }
    }
}

impl MqttConfig {
    pub fn qos(&self) -> QoS {
        match self.qos {
            2 => QoS::ExactlyOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::AtMostOnce,
        }
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySettings {
    #[serde(default = "default_self_topic_root")]
    pub self_topic_root: String,
    #[serde(default = "default_hass_topic_root")]
    pub hass_topic_root: String,
    #[serde(default = "default_true")]
    pub hass_discovery: bool,
    #[serde(default = "default_sensors_file")]
    pub sensors_file: PathBuf,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

fn default_self_topic_root() -> String {
    "wyzesense2mqtt".to_string()
}
fn default_hass_topic_root() -> String {
    "homeassistant".to_string()
}
fn default_sensors_file() -> PathBuf {
    PathBuf::from("sensors.toml")
}
fn default_state_file() -> PathBuf {
    PathBuf::from("state.toml")
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            self_topic_root: default_self_topic_root(),
            hass_topic_root: default_hass_topic_root(),
            hass_discovery: true,
            sensors_file: default_sensors_file(),
            state_file: default_state_file(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// How long the bridge stays in pairing mode.
    #[serde(default = "default_scan_timeout")]
    pub scan_timeout_secs: u64,
    /// Deadline for every other bridge request.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

fn default_scan_timeout() -> u64 {
    60
}
fn default_command_timeout() -> u64 {
    5
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            scan_timeout_secs: default_scan_timeout(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

impl BridgeConfig {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl Config {
    /// Read and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| GatewayError::Persistence {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }

    pub fn parse(text: &str, path: &Path) -> Result<Self> {
        let config: Config = toml::from_str(text).map_err(|e| GatewayError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        config.validate(path)?;
        Ok(config)
    }

    /// Override file values from environment variables named after the
    /// config keys.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            match key.as_str() {
                "MQTT_HOST" => self.mqtt.host = value,
                "MQTT_PORT" => self.mqtt.port = parse_env(&key, &value)?,
                "MQTT_USERNAME" => self.mqtt.username = Some(value),
                "MQTT_PASSWORD" => self.mqtt.password = Some(value),
                "MQTT_CLIENT_ID" => self.mqtt.client_id = value,
                "MQTT_QOS" => self.mqtt.qos = parse_env(&key, &value)?,
                "SELF_TOPIC_ROOT" => self.gateway.self_topic_root = value,
                "HASS_TOPIC_ROOT" => self.gateway.hass_topic_root = value,
                "HASS_DISCOVERY" => self.gateway.hass_discovery = parse_bool(&key, &value)?,
                _ => {}
            }
        }
        self.validate(Path::new("environment"))
    }

    fn validate(&self, path: &Path) -> Result<()> {
        let invalid = |reason: String| GatewayError::Parse {
            path: path.to_path_buf(),
            reason,
        };
        if self.mqtt.qos > 2 {
            return Err(invalid(format!("mqtt.qos must be 0, 1 or 2, got {}", self.mqtt.qos)));
        }
        let root = &self.gateway.self_topic_root;
        if root.is_empty() || root.contains(['+', '#']) {
            return Err(invalid(format!("invalid self_topic_root {root:?}")));
        }
        let hass_root = &self.gateway.hass_topic_root;
        if hass_root.is_empty() || hass_root.contains(['+', '#']) {
            return Err(invalid(format!("invalid hass_topic_root {hass_root:?}")));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| GatewayError::Parse {
        path: PathBuf::from(key),
        reason: format!("invalid value {value:?}"),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(GatewayError::Parse {
            path: PathBuf::from(key),
            reason: format!("invalid boolean {value:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_empty_config_defaults() {
        let config = Config::parse("", Path::new("config.toml")).unwrap();
        assert_eq!(config.mqtt.host, "localhost");
        assert_eq!(config.mqtt.port, 1883);
        assert!(!config.mqtt.clean_session);
        assert!(config.mqtt.retain);
        assert_eq!(config.mqtt.qos(), QoS::AtMostOnce);
        assert_eq!(config.gateway.self_topic_root, "wyzesense2mqtt");
        assert_eq!(config.gateway.hass_topic_root, "homeassistant");
        assert!(config.gateway.hass_discovery);
        assert_eq!(config.bridge.scan_timeout(), Duration::from_secs(60));
        assert_eq!(config.bridge.command_timeout(), Duration::from_secs(5));
        assert_eq!(config.keypad, KeypadDefaults::default());
    }

    #[test]
    fn test_config_file_values() {
        let text = r#"
[mqtt]
host = "broker.lan"
username = "wyze"
qos = 1

[gateway]
self_topic_root = "wyze"
hass_discovery = false
sensors_file = "/var/lib/wyzesense2mqtt/sensors.toml"

[keypad]
arming_time = 45
disarm_after_trigger = true
"#;
        let config = Config::parse(text, Path::new("config.toml")).unwrap();
        assert_eq!(config.mqtt.host, "broker.lan");
        assert_eq!(config.mqtt.username.as_deref(), Some("wyze"));
        assert_eq!(config.mqtt.qos(), QoS::AtLeastOnce);
        assert_eq!(config.gateway.self_topic_root, "wyze");
        assert!(!config.gateway.hass_discovery);
        assert_eq!(
            config.gateway.sensors_file,
            PathBuf::from("/var/lib/wyzesense2mqtt/sensors.toml")
        );
        assert_eq!(config.keypad.arming_time, 45);
        assert_eq!(config.keypad.delay_time, 60);
        assert!(config.keypad.disarm_after_trigger);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = Config::parse("[mqtt]\nhost = \"broker.lan\"\n", Path::new("config.toml")).unwrap();
        config
            .apply_env(env(&[
                ("MQTT_HOST", "10.0.0.2"),
                ("MQTT_PORT", "8883"),
                ("HASS_DISCOVERY", "False"),
                ("SELF_TOPIC_ROOT", "wyze"),
                ("PATH", "/usr/bin"),
            ]))
            .unwrap();
        assert_eq!(config.mqtt.host, "10.0.0.2");
        assert_eq!(config.mqtt.port, 8883);
        assert!(!config.gateway.hass_discovery);
        assert_eq!(config.gateway.self_topic_root, "wyze");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(Config::parse("[mqtt]\nqos = 3\n", Path::new("config.toml")).is_err());
        assert!(Config::parse("[gateway]\nself_topic_root = \"a/#\"\n", Path::new("config.toml")).is_err());

        let mut config = Config::default();
        assert!(config.apply_env(env(&[("MQTT_PORT", "lots")])).is_err());
        assert!(config.apply_env(env(&[("HASS_DISCOVERY", "maybe")])).is_err());
    }
}
