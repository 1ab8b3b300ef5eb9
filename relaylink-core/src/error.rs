use std::time::Duration;

/// Erreurs du cycle de vie de la connexion broker (start, reconnexion)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("invalid broker address: {0}")]
    InvalidAddress(String),
    #[error("broker unreachable: {0}")]
    Unreachable(String),
    #[error("broker refused the connection: {0}")]
    Refused(String),
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid client id: '{0}'")]
    InvalidClientId(String),
    #[error("a session is already active")]
    AlreadyActive,
    #[error("connect cancelled by stop")]
    Cancelled,
    #[error("session manager is shut down")]
    ManagerClosed,
}

/// Erreurs de publication d'une commande
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error("not connected to the broker")]
    NotConnected,
    #[error("invalid topic: {0}")]
    InvalidTopic(String),
    #[error("payload too large: {size} bytes (limit {limit})")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("packet too large: {size} bytes with topic and headers (limit {limit})")]
    PacketTooLarge { size: usize, limit: usize },
    #[error("broker rejected the publish: {0}")]
    Rejected(String),
    #[error("session manager is shut down")]
    ManagerClosed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscribeError {
    #[error("not connected to the broker")]
    NotConnected,
    #[error("invalid topic filter: {0}")]
    InvalidFilter(String),
    #[error("broker rejected the subscription: {0}")]
    Rejected(String),
    #[error("session manager is shut down")]
    ManagerClosed,
}

/// Saisie utilisateur invalide (seuil, durée du timer)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("threshold is not a number: '{0}'")]
    NotANumber(String),
    #[error("threshold {0} is outside 1..=100")]
    ThresholdOutOfRange(i64),
    #[error("timer duration is empty")]
    EmptyTimer,
    #[error("timer duration must be a positive number of seconds: '{0}'")]
    InvalidTimer(String),
}

/// Lecture batterie inutilisable pour la politique de seuil
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TelemetryError {
    #[error("battery scale must be positive, got {0}")]
    InvalidScale(i32),
    #[error("battery level missing or negative: {0}")]
    MissingLevel(i32),
    #[error("battery level {level} exceeds scale {scale}")]
    LevelAboveScale { level: i32, scale: i32 },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Erreur remontée par le contrôleur du panneau, toutes sources confondues
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error(transparent)]
    Subscribe(#[from] SubscribeError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
}
