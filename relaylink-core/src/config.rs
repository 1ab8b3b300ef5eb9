use crate::command::TimerPolicy;
use crate::error::{ConfigError, ConnectionError};
use crate::session::{Backoff, SessionSettings};
use crate::threshold::{TriggerMode, DEFAULT_THRESHOLD, MAX_THRESHOLD, MIN_THRESHOLD};
use crate::transport::{BrokerAddress, MqttSettings, MQTT_MAX_REMAINING_LENGTH};
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

pub const CONFIG_ENV: &str = "RELAYLINK_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "relaylink.yaml";

/// Room left above the payload for the topic and MQTT headers
pub const PACKET_HEADROOM: usize = 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    pub mqtt: MqttConf,
    pub reconnect: ReconnectConf,
    pub device: DeviceConf,
    pub policy: PolicyConf,
    pub telemetry: TelemetryConf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConf {
    pub broker: String, // ex: "tcp://broker.hivemq.com:1883"
    pub client_id_prefix: String,
    pub keep_alive_secs: u64,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub connect_timeout_secs: u64,
    pub max_payload_bytes: usize,
    pub qos: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConf {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub max_attempts: u32,
    pub connect_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConf {
    pub name: String,
    /// Overrides `<name>/relay/control`
    pub control_topic: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConf {
    pub threshold: u8,
    pub trigger: TriggerMode,
    pub timer: TimerPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConf {
    /// ex: /sys/class/power_supply/BAT0/capacity
    pub sysfs_path: Option<PathBuf>,
    pub poll_secs: u64,
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            broker: "tcp://broker.hivemq.com:1883".into(),
            client_id_prefix: "relaylink-panel".into(),
            keep_alive_secs: 30,
            username: None,
            password: None,
            connect_timeout_secs: 10,
            max_payload_bytes: 1024,
            qos: 1,
        }
    }
}

impl Default for ReconnectConf {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            cap_ms: 30_000,
            max_attempts: 10,
            connect_retries: 0,
        }
    }
}

impl Default for DeviceConf {
    fn default() -> Self {
        Self {
            name: "deepanshu_esp32".into(),
            control_topic: None,
        }
    }
}

impl Default for PolicyConf {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            trigger: TriggerMode::Level,
            timer: TimerPolicy::Verbatim,
        }
    }
}

impl Default for TelemetryConf {
    fn default() -> Self {
        Self {
            sysfs_path: None,
            poll_secs: 30,
        }
    }
}

impl PanelConfig {
    pub fn control_topic(&self) -> String {
        self.device
            .control_topic
            .clone()
            .unwrap_or_else(|| format!("{}/relay/control", self.device.name))
    }

    pub fn broker_address(&self) -> Result<BrokerAddress, ConnectionError> {
        BrokerAddress::parse(&self.mqtt.broker)
    }

    /// `<prefix>-<uuid>`: unique per session, like a generated MQTT client id
    pub fn client_id(&self) -> String {
        format!("{}-{}", self.mqtt.client_id_prefix, uuid::Uuid::new_v4().simple())
    }

    pub fn qos(&self) -> Result<QoS, ConfigError> {
        match self.mqtt.qos {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(ConfigError::Invalid(format!("mqtt.qos must be 0, 1 or 2, got {other}"))),
        }
    }

    pub fn session_settings(&self) -> Result<SessionSettings, ConfigError> {
        Ok(SessionSettings {
            qos: self.qos()?,
            max_payload_bytes: self.mqtt.max_payload_bytes,
            max_packet_bytes: self.max_packet_bytes(),
            backoff: Backoff::new(
                Duration::from_millis(self.reconnect.base_ms),
                Duration::from_millis(self.reconnect.cap_ms),
            ),
            max_reconnect_attempts: self.reconnect.max_attempts,
            connect_retries: self.reconnect.connect_retries,
            ..SessionSettings::default()
        })
    }

    pub fn mqtt_settings(&self) -> MqttSettings {
        let credentials = match (&self.mqtt.username, &self.mqtt.password) {
            (Some(user), password) => Some((user.clone(), password.clone().unwrap_or_default())),
            (None, _) => None,
        };
        MqttSettings {
            keep_alive: Duration::from_secs(self.mqtt.keep_alive_secs),
            credentials,
            connect_timeout: Duration::from_secs(self.mqtt.connect_timeout_secs),
            max_packet_size: self.max_packet_bytes(),
            ..MqttSettings::default()
        }
    }

    /// Packet limit shared by the transport and the session's local check
    pub fn max_packet_bytes(&self) -> usize {
        self.mqtt.max_payload_bytes.saturating_add(PACKET_HEADROOM)
    }

    /// Applies `RELAYLINK_*` overrides found through `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(broker) = lookup("RELAYLINK_BROKER") {
            self.mqtt.broker = broker;
        }
        if let Some(device) = lookup("RELAYLINK_DEVICE") {
            self.device.name = device;
        }
        if let Some(user) = lookup("RELAYLINK_USERNAME") {
            self.mqtt.username = Some(user);
        }
        if let Some(password) = lookup("RELAYLINK_PASSWORD") {
            self.mqtt.password = Some(password);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker_address()
            .map_err(|e| ConfigError::Invalid(format!("mqtt.broker: {e}")))?;
        self.qos()?;

        if !(MIN_THRESHOLD..=MAX_THRESHOLD).contains(&self.policy.threshold) {
            return Err(ConfigError::Invalid(format!(
                "policy.threshold must be within {MIN_THRESHOLD}..={MAX_THRESHOLD}, got {}",
                self.policy.threshold
            )));
        }
        if self.mqtt.client_id_prefix.is_empty() || self.mqtt.client_id_prefix.starts_with(' ') {
            return Err(ConfigError::Invalid("mqtt.client_id_prefix must not be empty or start with a space".into()));
        }
        let max_payload = MQTT_MAX_REMAINING_LENGTH - PACKET_HEADROOM;
        if !(1..=max_payload).contains(&self.mqtt.max_payload_bytes) {
            return Err(ConfigError::Invalid(format!(
                "mqtt.max_payload_bytes must be within 1..={max_payload}, got {}",
                self.mqtt.max_payload_bytes
            )));
        }
        if self.mqtt.keep_alive_secs == 0 {
            return Err(ConfigError::Invalid("mqtt.keep_alive_secs must be at least 1".into()));
        }
        if self.reconnect.base_ms > self.reconnect.cap_ms {
            return Err(ConfigError::Invalid(format!(
                "reconnect.base_ms ({}) exceeds reconnect.cap_ms ({})",
                self.reconnect.base_ms, self.reconnect.cap_ms
            )));
        }
        if self.telemetry.poll_secs == 0 {
            return Err(ConfigError::Invalid("telemetry.poll_secs must be at least 1".into()));
        }
        if self.device.name.is_empty() && self.device.control_topic.is_none() {
            return Err(ConfigError::Invalid("device.name or device.control_topic is required".into()));
        }
        crate::session::validate_topic(&self.control_topic())
            .map_err(|e| ConfigError::Invalid(format!("control topic: {e}")))?;
        Ok(())
    }
}

/// Lit le YAML à `path`. Fichier absent ou vide : config par défaut.
pub async fn load_config_from(path: &Path) -> Result<PanelConfig, ConfigError> {
    if !path.exists() {
        warn!("no {} found, using default configuration", path.display());
        return Ok(PanelConfig::default());
    }
    let txt = fs::read_to_string(path).await?;
    if txt.trim().is_empty() {
        return Ok(PanelConfig::default());
    }
    let config: PanelConfig = serde_yaml::from_str(&txt)?;
    info!("configuration loaded from {}", path.display());
    Ok(config)
}

/// Path from `RELAYLINK_CONFIG` (default `relaylink.yaml`), then env overrides, then validation
pub async fn load_config() -> Result<PanelConfig, ConfigError> {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let mut config = load_config_from(Path::new(&path)).await?;
    config.apply_overrides(|key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_targets_public_broker() {
        let config = PanelConfig::default();
        assert_eq!(config.control_topic(), "deepanshu_esp32/relay/control");
        assert_eq!(config.broker_address().unwrap(), BrokerAddress::new("broker.hivemq.com", 1883));
        assert_eq!(config.policy.threshold, 100);
        assert_eq!(config.policy.trigger, TriggerMode::Level);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_client_ids_are_unique() {
        let config = PanelConfig::default();
        let a = config.client_id();
        let b = config.client_id();
        assert!(a.starts_with("relaylink-panel-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = "
device:
  name: garage_esp32
policy:
  threshold: 80
  trigger: edge
  timer: seconds
reconnect:
  max_attempts: 3
";
        let config: PanelConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.control_topic(), "garage_esp32/relay/control");
        assert_eq!(config.policy.threshold, 80);
        assert_eq!(config.policy.trigger, TriggerMode::Edge);
        assert_eq!(config.policy.timer, TimerPolicy::Seconds);
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.reconnect.cap_ms, 30_000);
        assert_eq!(config.mqtt.keep_alive_secs, 30);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = PanelConfig::default();
        config.policy.threshold = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = PanelConfig::default();
        config.reconnect.base_ms = 60_000;
        assert!(config.validate().is_err());

        let mut config = PanelConfig::default();
        config.mqtt.broker = "http://nope".into();
        assert!(config.validate().is_err());

        let mut config = PanelConfig::default();
        config.mqtt.qos = 3;
        assert!(config.validate().is_err());

        let mut config = PanelConfig::default();
        config.device.control_topic = Some("esp/+/control".into());
        assert!(config.validate().is_err());

        let mut config = PanelConfig::default();
        config.mqtt.max_payload_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_huge_payload_limit_is_rejected_without_overflow() {
        let mut config = PanelConfig::default();
        config.mqtt.max_payload_bytes = usize::MAX;
        assert_eq!(config.max_packet_bytes(), usize::MAX);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_packet_limit_is_shared_by_session_and_transport() {
        let config = PanelConfig::default();
        let settings = config.session_settings().unwrap();
        assert_eq!(settings.max_packet_bytes, 2048);
        assert_eq!(config.mqtt_settings().max_packet_size, 2048);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("RELAYLINK_BROKER", "mqtts://secure.example"),
            ("RELAYLINK_DEVICE", "pump"),
            ("RELAYLINK_USERNAME", "panel"),
            ("RELAYLINK_PASSWORD", "secret"),
        ]
        .into_iter()
        .collect();

        let mut config = PanelConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert!(config.broker_address().unwrap().tls);
        assert_eq!(config.control_topic(), "pump/relay/control");
        assert_eq!(
            config.mqtt_settings().credentials,
            Some(("panel".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn test_session_settings_mapping() {
        let mut config = PanelConfig::default();
        config.mqtt.qos = 0;
        config.reconnect.connect_retries = 2;
        let settings = config.session_settings().unwrap();
        assert_eq!(settings.qos, QoS::AtMostOnce);
        assert_eq!(settings.connect_retries, 2);
        assert_eq!(settings.backoff.cap, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_load_missing_and_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.yaml");
        let config = load_config_from(&missing).await.unwrap();
        assert_eq!(config.policy.threshold, 100);

        let empty = dir.path().join("empty.yaml");
        std::fs::write(&empty, "  \n").unwrap();
        assert!(load_config_from(&empty).await.is_ok());
    }

    #[tokio::test]
    async fn test_load_rejects_invalid_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "policy: [not, a, map]\n").unwrap();
        assert!(matches!(load_config_from(&path).await, Err(ConfigError::Yaml(_))));
    }
}
