use super::{BrokerAddress, Link, LinkEvent, LinkHandle, Transport, DEFAULT_MAX_PACKET_SIZE};
use crate::error::{ConnectionError, PublishError, SubscribeError};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS,
    SubAck, SubscribeReasonCode,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Délai laissé au DISCONNECT pour partir avant d'arrêter la boucle réseau
const CLOSE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub keep_alive: Duration,
    pub credentials: Option<(String, String)>,
    pub connect_timeout: Duration,
    pub max_packet_size: usize,
    /// Capacity of the rumqttc request channel
    pub channel_capacity: usize,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(30),
            credentials: None,
            connect_timeout: Duration::from_secs(10),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            channel_capacity: 10,
        }
    }
}

/// MQTT 3.1.1 over TCP or TLS, clean session
pub struct MqttTransport {
    settings: MqttSettings,
}

impl MqttTransport {
    pub fn new(settings: MqttSettings) -> Self {
        Self { settings }
    }

    fn options(&self, broker: &BrokerAddress, client_id: &str) -> MqttOptions {
        let mut opts = MqttOptions::new(client_id, &broker.host, broker.port);
        opts.set_keep_alive(self.settings.keep_alive);
        opts.set_clean_session(true);
        opts.set_max_packet_size(self.settings.max_packet_size, self.settings.max_packet_size);
        if let Some((user, password)) = &self.settings.credentials {
            opts.set_credentials(user, password);
        }
        if broker.tls {
            opts.set_transport(rumqttc::Transport::tls_with_default_config());
        }
        opts
    }
}

impl Transport for MqttTransport {
    fn connect<'a>(
        &'a self,
        broker: &'a BrokerAddress,
        client_id: &'a str,
    ) -> BoxFuture<'a, Result<Link, ConnectionError>> {
        async move {
            let opts = self.options(broker, client_id);
            let (client, mut eventloop) = AsyncClient::new(opts, self.settings.channel_capacity);

            let timeout = self.settings.connect_timeout;
            match tokio::time::timeout(timeout, handshake(&mut eventloop)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(ConnectionError::Timeout(timeout)),
            }
            info!("MQTT connected to {} as {}", broker, client_id);

            let (tx, events) = mpsc::unbounded_channel();
            let subacks = Arc::new(Mutex::new(SubAckTracker::default()));
            let pump = tokio::spawn(pump_events(eventloop, tx, subacks.clone()));

            Ok(Link {
                handle: Box::new(MqttLink {
                    client,
                    pump,
                    subacks,
                    ack_timeout: timeout,
                }),
                events,
            })
        }
        .boxed()
    }
}

/// Poll jusqu'au CONNACK
async fn handshake(eventloop: &mut EventLoop) -> Result<(), ConnectionError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(ConnectionError::Refused(format!("{code:?}"))),
                };
            }
            Ok(_) => {}
            Err(rumqttc::ConnectionError::ConnectionRefused(code)) => {
                return Err(ConnectionError::Refused(format!("{code:?}")));
            }
            Err(e) => return Err(ConnectionError::Unreachable(e.to_string())),
        }
    }
}

type SubAckReply = oneshot::Sender<Result<(), SubscribeError>>;

/// Pairs SUBSCRIBE requests with their SUBACK. rumqttc sends requests in call
/// order, so the oldest queued waiter owns the next outgoing packet id.
#[derive(Default)]
struct SubAckTracker {
    queued: VecDeque<SubAckReply>,
    in_flight: HashMap<u16, SubAckReply>,
}

impl SubAckTracker {
    fn queue(&mut self) -> oneshot::Receiver<Result<(), SubscribeError>> {
        let (reply, ack) = oneshot::channel();
        self.queued.push_back(reply);
        ack
    }

    /// The client refused the request before it reached the event loop
    fn cancel_last(&mut self) {
        self.queued.pop_back();
    }

    fn sent(&mut self, pkid: u16) {
        if let Some(reply) = self.queued.pop_front() {
            self.in_flight.insert(pkid, reply);
        }
    }

    fn acked(&mut self, ack: &SubAck) {
        let Some(reply) = self.in_flight.remove(&ack.pkid) else {
            return;
        };
        let refused = ack
            .return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure));
        let result = if refused {
            Err(SubscribeError::Rejected("broker refused the subscription (SUBACK failure)".into()))
        } else {
            Ok(())
        };
        let _ = reply.send(result);
    }

    /// Every pending waiter sees a closed channel
    fn abandon(&mut self) {
        self.queued.clear();
        self.in_flight.clear();
    }
}

/// Forwards inbound publishes until the connection breaks or we disconnect.
/// rumqttc would reconnect on the next poll; the session manager owns that
/// decision, so the pump stops at the first error.
async fn pump_events(
    mut eventloop: EventLoop,
    tx: mpsc::UnboundedSender<LinkEvent>,
    subacks: Arc<Mutex<SubAckTracker>>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => subacks.lock().sent(pkid),
            Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                if ack.return_codes.iter().any(|c| matches!(c, SubscribeReasonCode::Failure)) {
                    warn!("MQTT SUBACK {} refused by broker", ack.pkid);
                }
                subacks.lock().acked(&ack);
            }
            Ok(Event::Incoming(Incoming::Publish(p))) => {
                debug!("MQTT message on {} ({} bytes)", p.topic, p.payload.len());
                let event = LinkEvent::Message {
                    topic: p.topic.clone(),
                    payload: p.payload.to_vec(),
                };
                if tx.send(event).is_err() {
                    break;
                }
            }
            Ok(Event::Incoming(Incoming::Disconnect)) => {
                let _ = tx.send(LinkEvent::Dropped {
                    reason: "broker sent DISCONNECT".into(),
                });
                break;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("MQTT connection error: {}", e);
                let _ = tx.send(LinkEvent::Dropped { reason: e.to_string() });
                break;
            }
        }
    }
    subacks.lock().abandon();
}

struct MqttLink {
    client: AsyncClient,
    pump: JoinHandle<()>,
    subacks: Arc<Mutex<SubAckTracker>>,
    ack_timeout: Duration,
}

impl LinkHandle for MqttLink {
    fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> BoxFuture<'_, Result<(), PublishError>> {
        let topic = topic.to_string();
        async move {
            self.client
                .publish(topic, qos, false, payload)
                .await
                .map_err(|e| PublishError::Rejected(e.to_string()))
        }
        .boxed()
    }

    /// Resolves once the broker has answered the SUBSCRIBE
    fn subscribe(&self, filter: &str, qos: QoS) -> BoxFuture<'_, Result<(), SubscribeError>> {
        let filter = filter.to_string();
        async move {
            let ack = self.subacks.lock().queue();
            if let Err(e) = self.client.subscribe(filter, qos).await {
                self.subacks.lock().cancel_last();
                return Err(SubscribeError::Rejected(e.to_string()));
            }
            match tokio::time::timeout(self.ack_timeout, ack).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(SubscribeError::Rejected("connection closed before SUBACK".into())),
                Err(_) => Err(SubscribeError::Rejected(format!(
                    "no SUBACK within {:?}",
                    self.ack_timeout
                ))),
            }
        }
        .boxed()
    }

    fn unsubscribe(&self, filter: &str) -> BoxFuture<'_, Result<(), SubscribeError>> {
        let filter = filter.to_string();
        async move {
            self.client
                .unsubscribe(filter)
                .await
                .map_err(|e| SubscribeError::Rejected(e.to_string()))
        }
        .boxed()
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
        async move {
            let mut link = self;
            if link.client.try_disconnect().is_ok()
                && tokio::time::timeout(CLOSE_GRACE, &mut link.pump).await.is_err()
            {
                debug!("MQTT event loop did not stop in time, aborting");
            }
            // Drop aborts the pump if it is still running
        }
        .boxed()
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suback(pkid: u16, code: SubscribeReasonCode) -> SubAck {
        SubAck {
            pkid,
            return_codes: vec![code],
        }
    }

    #[test]
    fn test_suback_failure_rejects_the_matching_subscribe() {
        let mut tracker = SubAckTracker::default();
        let mut first = tracker.queue();
        let mut second = tracker.queue();
        tracker.sent(1);
        tracker.sent(2);

        tracker.acked(&suback(2, SubscribeReasonCode::Failure));
        tracker.acked(&suback(1, SubscribeReasonCode::Success(QoS::AtLeastOnce)));

        assert_eq!(first.try_recv().unwrap(), Ok(()));
        assert!(matches!(second.try_recv().unwrap(), Err(SubscribeError::Rejected(_))));
    }

    #[test]
    fn test_unknown_suback_is_ignored() {
        let mut tracker = SubAckTracker::default();
        let mut ack = tracker.queue();
        tracker.acked(&suback(9, SubscribeReasonCode::Failure));
        assert!(ack.try_recv().is_err());
        assert_eq!(tracker.queued.len(), 1);
    }

    #[test]
    fn test_abandon_closes_pending_waiters() {
        let mut tracker = SubAckTracker::default();
        let mut queued = tracker.queue();
        let mut sent = tracker.queue();
        tracker.sent(4);
        tracker.abandon();
        assert!(matches!(queued.try_recv(), Err(oneshot::error::TryRecvError::Closed)));
        assert!(matches!(sent.try_recv(), Err(oneshot::error::TryRecvError::Closed)));
    }

    #[test]
    fn test_cancelled_request_does_not_steal_packet_id() {
        let mut tracker = SubAckTracker::default();
        let mut kept = tracker.queue();
        let _refused = tracker.queue();
        tracker.cancel_last();
        tracker.sent(3);
        tracker.acked(&suback(3, SubscribeReasonCode::Success(QoS::AtMostOnce)));
        assert_eq!(kept.try_recv().unwrap(), Ok(()));
    }
}
