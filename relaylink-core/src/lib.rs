//! RelayLink core - MQTT command/telemetry session for a remote relay
//!
//! - `session`: connection lifecycle, publish to the control topic, observer dispatch
//! - `threshold`: automatic shutoff when the battery reaches the configured level
//! - `transport`: broker seam (rumqttc in production, in-memory broker in tests)
//! - `controller`: panel glue turning every action into a status line
//! - `config`: YAML + env configuration

pub mod command;
pub mod config;
pub mod controller;
pub mod error;
pub mod session;
pub mod telemetry;
pub mod threshold;
pub mod transport;

pub use command::{Command, TimerPolicy};
pub use config::{load_config, PanelConfig};
pub use controller::{ConnectionMonitor, Controller, StatusEvent};
pub use error::{
    ConfigError, ConnectionError, ControlError, PublishError, SubscribeError, TelemetryError,
    ValidationError,
};
pub use session::{Observer, SessionManager, SessionSettings, SessionState, SubscriptionId};
pub use telemetry::{TelemetryReading, TelemetrySample};
pub use threshold::{ThresholdConfig, TriggerMode};
pub use transport::{BrokerAddress, Link, LinkEvent, LinkHandle, Transport};

pub use rumqttc::QoS;
