use super::observer::{Observer, ObserverRegistry, SubscriptionId};
use super::topics::{validate_filter, validate_topic};
use super::{SessionSettings, SessionState};
use crate::command::Command;
use crate::error::{ConnectionError, PublishError, SubscribeError};
use crate::transport::{publish_packet_size, BrokerAddress, Link, LinkEvent, LinkHandle, Transport};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub(crate) enum Request {
    Start {
        broker: BrokerAddress,
        client_id: String,
        reply: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Subscribe {
        filter: String,
        observer: Arc<dyn Observer>,
        reply: oneshot::Sender<Result<SubscriptionId, SubscribeError>>,
    },
    Unsubscribe {
        id: SubscriptionId,
        reply: oneshot::Sender<bool>,
    },
    Send {
        command: Command,
        reply: oneshot::Sender<Result<(), PublishError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

struct Session {
    broker: BrokerAddress,
    client_id: String,
    /// None while the connection is lost
    link: Option<Box<dyn LinkHandle>>,
    events: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    observers: ObserverRegistry,
    reconnect: Option<PendingReconnect>,
}

struct PendingReconnect {
    attempt: u32,
    due: Instant,
}

enum Activity {
    Link(LinkEvent),
    ReconnectDue(u32),
}

/// Result of waiting on network work while still serving the request queue
enum Interrupted<T> {
    Done(T),
    Stopped(oneshot::Sender<()>),
    Closed,
}

pub(crate) struct SessionActor {
    transport: Arc<dyn Transport>,
    settings: SessionSettings,
    requests: mpsc::Receiver<Request>,
    state: watch::Sender<SessionState>,
    session: Option<Session>,
}

impl SessionActor {
    pub fn new(
        transport: Arc<dyn Transport>,
        settings: SessionSettings,
        requests: mpsc::Receiver<Request>,
        state: watch::Sender<SessionState>,
    ) -> Self {
        Self {
            transport,
            settings,
            requests,
            state,
            session: None,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => break,
                },
                activity = session_activity(&mut self.session) => match activity {
                    Activity::Link(LinkEvent::Message { topic, payload }) => self.dispatch(&topic, &payload),
                    Activity::Link(LinkEvent::Dropped { reason }) => self.connection_lost(reason).await,
                    Activity::ReconnectDue(attempt) => self.reconnect(attempt).await,
                },
            }
        }
        self.end_session("session manager dropped").await;
    }

    async fn handle(&mut self, request: Request) {
        match request {
            Request::Start { broker, client_id, reply } => {
                let result = self.start(broker, client_id).await;
                let _ = reply.send(result);
            }
            Request::Subscribe { filter, observer, reply } => {
                let result = self.subscribe(filter, observer).await;
                let _ = reply.send(result);
            }
            Request::Unsubscribe { id, reply } => {
                let removed = self.unsubscribe(id).await;
                let _ = reply.send(removed);
            }
            Request::Send { command, reply } => {
                let result = self.publish(&command).await;
                let _ = reply.send(result);
            }
            Request::Stop { reply } => {
                self.end_session("stop requested").await;
                let _ = reply.send(());
            }
        }
    }

    async fn start(&mut self, broker: BrokerAddress, client_id: String) -> Result<(), ConnectionError> {
        if self.session.is_some() {
            return Err(ConnectionError::AlreadyActive);
        }
        // rumqttc panique sur un client id vide ou commençant par un espace
        if client_id.is_empty() || client_id.starts_with(' ') {
            return Err(ConnectionError::InvalidClientId(client_id));
        }

        let mut attempt = 0;
        loop {
            self.set_state(SessionState::Connecting);
            let connect = connect_once(self.transport.clone(), broker.clone(), client_id.clone());

            let error = match self.interruptible(connect).await {
                Interrupted::Done(Ok(link)) => {
                    info!("session started on {} as {}", broker, client_id);
                    self.session = Some(Session {
                        broker,
                        client_id,
                        link: Some(link.handle),
                        events: Some(link.events),
                        observers: ObserverRegistry::default(),
                        reconnect: None,
                    });
                    self.set_state(SessionState::Connected);
                    return Ok(());
                }
                Interrupted::Done(Err(e)) => e,
                Interrupted::Stopped(stop) => {
                    self.set_state(SessionState::Disconnected);
                    let _ = stop.send(());
                    return Err(ConnectionError::Cancelled);
                }
                Interrupted::Closed => {
                    self.set_state(SessionState::Disconnected);
                    return Err(ConnectionError::Cancelled);
                }
            };

            if attempt >= self.settings.connect_retries {
                warn!("connect to {} failed: {}", broker, error);
                self.set_state(SessionState::Disconnected);
                return Err(error);
            }

            let delay = self.settings.backoff.delay(attempt);
            attempt += 1;
            warn!(
                "connect to {} failed ({}), retry {}/{} in {:?}",
                broker, error, attempt, self.settings.connect_retries, delay
            );
            match self.interruptible(tokio::time::sleep(delay)).await {
                Interrupted::Done(()) => {}
                Interrupted::Stopped(stop) => {
                    self.set_state(SessionState::Disconnected);
                    let _ = stop.send(());
                    return Err(ConnectionError::Cancelled);
                }
                Interrupted::Closed => {
                    self.set_state(SessionState::Disconnected);
                    return Err(ConnectionError::Cancelled);
                }
            }
        }
    }

    async fn subscribe(
        &mut self,
        filter: String,
        observer: Arc<dyn Observer>,
    ) -> Result<SubscriptionId, SubscribeError> {
        let qos = self.settings.qos;
        let session = self.session.as_mut().ok_or(SubscribeError::NotConnected)?;
        let link = session.link.as_ref().ok_or(SubscribeError::NotConnected)?;
        validate_filter(&filter).map_err(SubscribeError::InvalidFilter)?;

        // un seul SUBSCRIBE broker par filtre, quel que soit le nombre d'observers
        if !session.observers.has_filter(&filter) {
            link.subscribe(&filter, qos).await?;
            debug!("subscribed to {}", filter);
        }
        Ok(session.observers.insert(filter, observer))
    }

    async fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        match session.observers.remove(id) {
            Some((filter, true)) => {
                if let Some(link) = &session.link {
                    if let Err(e) = link.unsubscribe(&filter).await {
                        warn!("unsubscribe from {} failed: {}", filter, e);
                    }
                }
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    async fn publish(&self, command: &Command) -> Result<(), PublishError> {
        let link = self
            .session
            .as_ref()
            .and_then(|s| s.link.as_ref())
            .ok_or(PublishError::NotConnected)?;
        validate_topic(command.topic()).map_err(PublishError::InvalidTopic)?;

        let size = command.payload().len();
        let limit = self.settings.max_payload_bytes;
        if size > limit {
            return Err(PublishError::PayloadTooLarge { size, limit });
        }
        let packet = publish_packet_size(command.topic(), size, self.settings.qos);
        let limit = self.settings.max_packet_bytes;
        if packet > limit {
            return Err(PublishError::PacketTooLarge { size: packet, limit });
        }

        link.publish(command.topic(), command.payload().as_bytes().to_vec(), self.settings.qos)
            .await?;
        debug!("published {}", command);
        Ok(())
    }

    fn dispatch(&self, topic: &str, payload: &[u8]) {
        if let Some(session) = &self.session {
            let delivered = session.observers.dispatch(topic, payload);
            debug!("message on {} delivered to {} observer(s)", topic, delivered);
        }
    }

    async fn connection_lost(&mut self, reason: String) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        warn!("connection to {} lost: {}", session.broker, reason);
        session.events = None;
        if let Some(link) = session.link.take() {
            link.close().await;
        }

        if self.settings.max_reconnect_attempts == 0 {
            self.end_session("connection lost, reconnection disabled").await;
        } else {
            self.schedule_reconnect(1);
        }
    }

    fn schedule_reconnect(&mut self, attempt: u32) {
        let delay = self.settings.backoff.delay(attempt - 1);
        if let Some(session) = self.session.as_mut() {
            info!("reconnect attempt {} to {} in {:?}", attempt, session.broker, delay);
            session.reconnect = Some(PendingReconnect {
                attempt,
                due: Instant::now() + delay,
            });
        }
        self.set_state(SessionState::Reconnecting { attempt });
    }

    async fn reconnect(&mut self, attempt: u32) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.reconnect = None;
        let broker = session.broker.clone();
        let client_id = session.client_id.clone();

        self.set_state(SessionState::Connecting);
        let connect = connect_once(self.transport.clone(), broker.clone(), client_id);
        match self.interruptible(connect).await {
            Interrupted::Done(Ok(link)) => self.resume(link).await,
            Interrupted::Done(Err(e)) if attempt >= self.settings.max_reconnect_attempts => {
                warn!("giving up on {} after {} attempts: {}", broker, attempt, e);
                self.end_session("reconnection failed").await;
            }
            Interrupted::Done(Err(e)) => {
                warn!("reconnect attempt {} to {} failed: {}", attempt, broker, e);
                self.schedule_reconnect(attempt + 1);
            }
            Interrupted::Stopped(stop) => {
                self.end_session("stop requested").await;
                let _ = stop.send(());
            }
            Interrupted::Closed => self.end_session("session manager dropped").await,
        }
    }

    /// Fresh link after a reconnect: every filter still observed is subscribed again
    async fn resume(&mut self, link: Link) {
        let qos = self.settings.qos;
        let Some(session) = self.session.as_mut() else {
            link.handle.close().await;
            return;
        };
        for filter in session.observers.filters() {
            if let Err(e) = link.handle.subscribe(&filter, qos).await {
                warn!("re-subscribe to {} failed: {}", filter, e);
            }
        }
        session.link = Some(link.handle);
        session.events = Some(link.events);
        info!("session resumed on {}", session.broker);
        self.set_state(SessionState::Connected);
    }

    /// Drops the session (observers included) and closes its link. No-op when idle.
    async fn end_session(&mut self, reason: &str) {
        if let Some(mut session) = self.session.take() {
            info!(
                "session on {} ended: {} ({} observer(s) released)",
                session.broker,
                reason,
                session.observers.len()
            );
            session.events = None;
            if let Some(link) = session.link.take() {
                link.close().await;
            }
        }
        self.set_state(SessionState::Disconnected);
    }

    /// Waits for `work` while answering queued requests: a stop interrupts,
    /// anything needing a live connection is refused.
    async fn interruptible<F: Future>(&mut self, work: F) -> Interrupted<F::Output> {
        tokio::pin!(work);
        loop {
            tokio::select! {
                output = &mut work => return Interrupted::Done(output),
                request = self.requests.recv() => match request {
                    None => return Interrupted::Closed,
                    Some(request) => {
                        if let Some(stop) = self.refuse_while_busy(request) {
                            return Interrupted::Stopped(stop);
                        }
                    }
                },
            }
        }
    }

    fn refuse_while_busy(&mut self, request: Request) -> Option<oneshot::Sender<()>> {
        match request {
            Request::Stop { reply } => return Some(reply),
            Request::Start { reply, .. } => {
                let _ = reply.send(Err(ConnectionError::AlreadyActive));
            }
            Request::Subscribe { reply, .. } => {
                let _ = reply.send(Err(SubscribeError::NotConnected));
            }
            Request::Send { reply, .. } => {
                let _ = reply.send(Err(PublishError::NotConnected));
            }
            Request::Unsubscribe { id, reply } => {
                let removed = self
                    .session
                    .as_mut()
                    .and_then(|s| s.observers.remove(id))
                    .is_some();
                let _ = reply.send(removed);
            }
        }
        None
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("session state: {} -> {}", previous, state);
        }
    }
}

async fn connect_once(
    transport: Arc<dyn Transport>,
    broker: BrokerAddress,
    client_id: String,
) -> Result<Link, ConnectionError> {
    transport.connect(&broker, &client_id).await
}

async fn session_activity(session: &mut Option<Session>) -> Activity {
    let Some(session) = session else {
        return std::future::pending().await;
    };
    if let Some(pending) = &session.reconnect {
        tokio::time::sleep_until(pending.due).await;
        return Activity::ReconnectDue(pending.attempt);
    }
    match session.events.as_mut() {
        Some(events) => match events.recv().await {
            Some(event) => Activity::Link(event),
            None => Activity::Link(LinkEvent::Dropped {
                reason: "link event stream closed".into(),
            }),
        },
        None => std::future::pending().await,
    }
}
