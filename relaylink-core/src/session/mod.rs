/**
 * SESSION MANAGER - Cycle de vie d'une connexion broker unique
 *
 * ROLE : start/stop de la session, publication des commandes sur le topic de
 * contrôle, dispatch des messages entrants vers les observers enregistrés.
 *
 * ARCHITECTURE : `SessionManager` est un handle clonable ; toutes les opérations
 * passent par une file de requêtes consommée par une seule tâche (l'acteur),
 * qui est la seule à muter l'état. Les messages entrants arrivent sur la même
 * tâche : envois, réceptions et changements d'état sont donc sérialisés.
 *
 * États : Disconnected -> Connecting -> Connected -> Disconnected
 *         Connected --(perte)--> Reconnecting{n} -> Connecting -> Connected
 */

mod actor;
pub mod backoff;
pub mod observer;
pub mod topics;

use crate::command::Command;
use crate::error::{ConnectionError, PublishError, SubscribeError};
use crate::transport::{BrokerAddress, Transport, DEFAULT_MAX_PACKET_SIZE};
use actor::{Request, SessionActor};
use rumqttc::QoS;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

pub use backoff::Backoff;
pub use observer::{Observer, SubscriptionId};
pub use topics::{topic_matches, validate_filter, validate_topic};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting before reconnect attempt `attempt` (1-based)
    Reconnecting { attempt: u32 },
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub qos: QoS,
    pub max_payload_bytes: usize,
    /// Must match the transport's packet limit: a PUBLISH above it would
    /// kill the connection instead of failing the send
    pub max_packet_bytes: usize,
    pub backoff: Backoff,
    /// 0 disables reconnection: a lost connection ends the session
    pub max_reconnect_attempts: u32,
    /// Extra attempts made by `start` before reporting the failure
    pub connect_retries: u32,
    pub queue_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            qos: QoS::AtLeastOnce,
            max_payload_bytes: 1024,
            max_packet_bytes: DEFAULT_MAX_PACKET_SIZE,
            backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(30)),
            max_reconnect_attempts: 10,
            connect_retries: 0,
            queue_capacity: 64,
        }
    }
}

/// Handle to the session task. Cheap to clone; the task ends (and closes
/// any open connection) once every handle is dropped.
#[derive(Clone)]
pub struct SessionManager {
    requests: mpsc::Sender<Request>,
    state: watch::Receiver<SessionState>,
}

impl SessionManager {
    /// Spawns the session task. Must be called inside a Tokio runtime.
    pub fn new(transport: Arc<dyn Transport>, settings: SessionSettings) -> Self {
        let (requests, inbox) = mpsc::channel(settings.queue_capacity.max(1));
        let (state_tx, state) = watch::channel(SessionState::Disconnected);
        tokio::spawn(SessionActor::new(transport, settings, inbox, state_tx).run());
        Self { requests, state }
    }

    /// Connects and waits for the broker's acknowledgement.
    pub async fn start(
        &self,
        broker: BrokerAddress,
        client_id: impl Into<String>,
    ) -> Result<(), ConnectionError> {
        let client_id = client_id.into();
        self.call(|reply| Request::Start { broker, client_id, reply })
            .await
            .unwrap_or(Err(ConnectionError::ManagerClosed))
    }

    pub async fn subscribe<O: Observer>(
        &self,
        filter: impl Into<String>,
        observer: O,
    ) -> Result<SubscriptionId, SubscribeError> {
        let filter = filter.into();
        let observer: Arc<dyn Observer> = Arc::new(observer);
        self.call(|reply| Request::Subscribe { filter, observer, reply })
            .await
            .unwrap_or(Err(SubscribeError::ManagerClosed))
    }

    /// Returns false when the id is unknown (already removed, or the session ended)
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.call(|reply| Request::Unsubscribe { id, reply })
            .await
            .unwrap_or(false)
    }

    pub async fn send(&self, command: Command) -> Result<(), PublishError> {
        self.call(|reply| Request::Send { command, reply })
            .await
            .unwrap_or(Err(PublishError::ManagerClosed))
    }

    /// Back to `Disconnected` from any state. Idempotent; when it returns no
    /// observer of the closed session will be called again.
    pub async fn stop(&self) {
        let _ = self.call(|reply| Request::Stop { reply }).await;
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    async fn call<T>(&self, request: impl FnOnce(oneshot::Sender<T>) -> Request) -> Option<T> {
        let (reply, response) = oneshot::channel();
        self.requests.send(request(reply)).await.ok()?;
        response.await.ok()
    }
}
