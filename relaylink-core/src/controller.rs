//! Panel controller.
//!
//! Glue between the panel's inputs (buttons, threshold field, battery
//! telemetry) and the session manager. Every outcome, good or bad, becomes a
//! [`StatusEvent`] for the status line; errors are also returned to the caller.

use crate::command::{Command, TimerPolicy};
use crate::config::PanelConfig;
use crate::error::{ConnectionError, ControlError, PublishError, SubscribeError, ValidationError};
use crate::session::{SessionManager, SessionState};
use crate::telemetry::{TelemetryReading, TelemetrySample};
use crate::threshold::{ShutoffGate, ThresholdConfig, TriggerMode};
use crate::transport::BrokerAddress;
use parking_lot::Mutex;
use std::fmt;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Une ligne de statut pour l'utilisateur
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    Connected,
    ConnectionFailed(String),
    MessageReceived(String),
    MessageSent(String),
    SendFailed(String),
    ThresholdSet(u8),
    InvalidThreshold,
    TimerMissing,
    InvalidTimer(String),
    BatteryLevel(TelemetryReading),
    InvalidReading(String),
    ThresholdReached,
    /// Waiting before reconnect attempt `n`
    Reconnecting(u32),
    Reconnected,
    /// The session ended without a stop request
    ConnectionLost,
    Stopped,
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusEvent::Connected => write!(f, "MQTT Connected"),
            StatusEvent::ConnectionFailed(e) => write!(f, "MQTT Connection error: {e}"),
            StatusEvent::MessageReceived(payload) => write!(f, "Message received: {payload}"),
            StatusEvent::MessageSent(payload) => write!(f, "Message sent: {payload}"),
            StatusEvent::SendFailed(e) => write!(f, "Error sending message: {e}"),
            StatusEvent::ThresholdSet(value) => write!(f, "Battery threshold set to {value}%"),
            StatusEvent::InvalidThreshold => {
                write!(f, "Invalid threshold. Enter a number between 1 and 100.")
            }
            StatusEvent::TimerMissing => write!(f, "Please enter a timer duration."),
            StatusEvent::InvalidTimer(e) => write!(f, "Invalid timer duration: {e}"),
            StatusEvent::BatteryLevel(reading) => write!(f, "Battery Level: {reading}"),
            StatusEvent::InvalidReading(e) => write!(f, "Ignored battery reading: {e}"),
            StatusEvent::ThresholdReached => {
                write!(f, "Battery threshold reached. Sending OFF signal.")
            }
            StatusEvent::Reconnecting(attempt) => write!(f, "MQTT Reconnecting (attempt {attempt})..."),
            StatusEvent::Reconnected => write!(f, "MQTT Reconnected"),
            StatusEvent::ConnectionLost => write!(f, "MQTT Connection lost"),
            StatusEvent::Stopped => write!(f, "MQTT Disconnected"),
        }
    }
}

pub struct Controller {
    session: SessionManager,
    threshold: ThresholdConfig,
    gate: Mutex<ShutoffGate>,
    control_topic: String,
    timer_policy: TimerPolicy,
    status: mpsc::UnboundedSender<StatusEvent>,
}

impl Controller {
    pub fn new(
        session: SessionManager,
        config: &PanelConfig,
        status: mpsc::UnboundedSender<StatusEvent>,
    ) -> Result<Self, ValidationError> {
        Ok(Self {
            session,
            threshold: ThresholdConfig::new(config.policy.threshold)?,
            gate: Mutex::new(ShutoffGate::new(config.policy.trigger)),
            control_topic: config.control_topic(),
            timer_policy: config.policy.timer,
            status,
        })
    }

    /// Starts the session and listens on the control topic, so the panel sees
    /// what the device receives.
    pub async fn connect(&self, broker: BrokerAddress, client_id: String) -> Result<(), ControlError> {
        if let Err(e) = self.session.start(broker, client_id).await {
            self.emit(StatusEvent::ConnectionFailed(e.to_string()));
            return Err(e.into());
        }
        self.emit(StatusEvent::Connected);

        let status = self.status.clone();
        let echo = move |_topic: &str, payload: &[u8]| -> anyhow::Result<()> {
            let text = String::from_utf8_lossy(payload).into_owned();
            status
                .send(StatusEvent::MessageReceived(text))
                .map_err(|_| anyhow::anyhow!("status channel closed"))
        };
        if let Err(e) = self.session.subscribe(self.control_topic.clone(), echo).await {
            warn!("subscribe to {} failed: {}", self.control_topic, e);
            self.emit(StatusEvent::ConnectionFailed(e.to_string()));
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn turn_on(&self) -> Result<(), ControlError> {
        self.send(Command::turn_on(&self.control_topic)).await
    }

    pub async fn turn_off(&self) -> Result<(), ControlError> {
        self.send(Command::turn_off(&self.control_topic)).await
    }

    pub async fn set_timer(&self, duration: &str) -> Result<(), ControlError> {
        let command = match Command::timer(&self.control_topic, duration, self.timer_policy) {
            Ok(command) => command,
            Err(e) => {
                self.emit(match &e {
                    ValidationError::EmptyTimer => StatusEvent::TimerMissing,
                    other => StatusEvent::InvalidTimer(other.to_string()),
                });
                return Err(e.into());
            }
        };
        self.send(command).await
    }

    pub fn set_threshold(&self, input: &str) -> Result<u8, ControlError> {
        match self.threshold.set_threshold(input) {
            Ok(value) => {
                info!("battery threshold set to {}%", value);
                self.emit(StatusEvent::ThresholdSet(value));
                Ok(value)
            }
            Err(e) => {
                self.emit(StatusEvent::InvalidThreshold);
                Err(e.into())
            }
        }
    }

    /// Shows the reading, then sends `TURN_OFF` if the policy fires.
    /// Returns whether a shutoff was sent.
    pub async fn on_battery(&self, sample: TelemetrySample) -> Result<bool, ControlError> {
        let reading = match TelemetryReading::try_from(sample) {
            Ok(reading) => reading,
            Err(e) => {
                warn!("ignoring battery sample {:?}: {}", sample, e);
                self.emit(StatusEvent::InvalidReading(e.to_string()));
                return Err(e.into());
            }
        };
        self.emit(StatusEvent::BatteryLevel(reading));

        // une seule lecture du seuil pour la décision et le gate
        let threshold = self.threshold.get();
        let decision = crate::threshold::evaluate(&reading, threshold, &self.control_topic);
        let Some(shutoff) = self.gate.lock().filter(threshold, decision) else {
            return Ok(false);
        };

        info!("battery at {} reached threshold {}%, sending shutoff", reading, threshold);
        self.emit(StatusEvent::ThresholdReached);
        self.send(shutoff).await?;
        Ok(true)
    }

    pub async fn shutdown(&self) {
        self.session.stop().await;
        self.emit(StatusEvent::Stopped);
    }

    pub fn threshold(&self) -> u8 {
        self.threshold.get()
    }

    pub fn trigger_mode(&self) -> TriggerMode {
        self.gate.lock().mode()
    }

    pub fn control_topic(&self) -> &str {
        &self.control_topic
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    async fn send(&self, command: Command) -> Result<(), ControlError> {
        let payload = command.payload().to_string();
        match self.session.send(command).await {
            Ok(()) => {
                self.emit(StatusEvent::MessageSent(payload));
                Ok(())
            }
            Err(e) => {
                self.emit(StatusEvent::SendFailed(e.to_string()));
                Err(e.into())
            }
        }
    }

    fn emit(&self, event: StatusEvent) {
        // le panneau peut être fermé avant nous
        let _ = self.status.send(event);
    }
}

/// Tells an offline send (no session to carry it) from a real failure
pub fn is_offline(error: &ControlError) -> bool {
    matches!(
        error,
        ControlError::Publish(PublishError::NotConnected)
            | ControlError::Subscribe(SubscribeError::NotConnected)
            | ControlError::Connection(ConnectionError::Cancelled)
    )
}

/// Turns session state changes into status lines. Only reports what the
/// controller does not already report itself: the initial connect and the
/// user's stop are announced by `connect` and `shutdown`.
#[derive(Debug)]
pub struct ConnectionMonitor {
    last: SessionState,
    recovering: bool,
}

impl ConnectionMonitor {
    pub fn new(initial: SessionState) -> Self {
        Self {
            last: initial,
            recovering: false,
        }
    }

    pub fn observe(&mut self, state: SessionState) -> Option<StatusEvent> {
        let previous = std::mem::replace(&mut self.last, state);
        if previous == state {
            return None;
        }
        match state {
            SessionState::Reconnecting { attempt } => {
                self.recovering = true;
                Some(StatusEvent::Reconnecting(attempt))
            }
            SessionState::Connected if self.recovering => {
                self.recovering = false;
                Some(StatusEvent::Reconnected)
            }
            SessionState::Disconnected if self.recovering || previous == SessionState::Connected => {
                self.recovering = false;
                Some(StatusEvent::ConnectionLost)
            }
            _ => None,
        }
    }
}
