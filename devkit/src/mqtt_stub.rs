/*!
Broker MQTT en mémoire pour tester sans broker réel

Implémente `relaylink_core::Transport` : le session manager s'y connecte comme
à un vrai broker. Enregistre tous les messages publiés, route les publications
vers les abonnements actifs (écho du topic de contrôle) et permet de simuler
les pannes : refus de connexion, coupure réseau, publication rejetée.
*/

use futures::future::{self, BoxFuture, FutureExt};
use relaylink_core::session::topic_matches;
use relaylink_core::{
    BrokerAddress, ConnectionError, Link, LinkEvent, LinkHandle, PublishError, QoS,
    SubscribeError, Transport,
};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

impl MockMessage {
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

struct ActiveLink {
    generation: u64,
    tx: mpsc::UnboundedSender<LinkEvent>,
}

#[derive(Default)]
struct BrokerState {
    published: Vec<MockMessage>,
    subscriptions: Vec<String>,
    connects: Vec<(BrokerAddress, String)>,
    refuse_all: bool,
    refuse_next: u32,
    reject_publishes: bool,
    refuse_subscriptions: bool,
    connect_delay: Option<Duration>,
    link: Option<ActiveLink>,
    generation: u64,
}

impl BrokerState {
    fn is_current(&self, generation: u64) -> bool {
        self.link.as_ref().is_some_and(|l| l.generation == generation)
    }

    /// Livre un message au client connecté s'il est abonné
    fn route(&self, topic: &str, payload: &[u8]) -> bool {
        let Some(link) = &self.link else {
            return false;
        };
        if !self.subscriptions.iter().any(|f| topic_matches(f, topic)) {
            return false;
        }
        link.tx
            .send(LinkEvent::Message {
                topic: topic.to_string(),
                payload: payload.to_vec(),
            })
            .is_ok()
    }
}

/// Mock broker; clones share the same state
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }

    /// Refuse toutes les connexions (CONNACK négatif)
    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_all = refuse;
    }

    /// Les `n` prochaines connexions échouent comme un broker injoignable
    pub fn fail_next_connects(&self, n: u32) {
        self.lock().refuse_next = n;
    }

    pub fn reject_publishes(&self, reject: bool) {
        self.lock().reject_publishes = reject;
    }

    /// Répond aux SUBSCRIBE par un SUBACK en échec (ACL du broker)
    pub fn refuse_subscriptions(&self, refuse: bool) {
        self.lock().refuse_subscriptions = refuse;
    }

    /// Délai avant la réponse au CONNECT (pour tester l'annulation)
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.lock().connect_delay = delay;
    }

    /// Simule un message publié par un autre client (l'ESP32 par exemple).
    /// Retourne false si le client n'est pas connecté ou pas abonné.
    pub fn simulate_incoming<S, V>(&self, topic: S, payload: V) -> bool
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let topic = topic.into();
        let delivered = self.lock().route(&topic, &payload.into());
        log::info!("📨 [MOCK] Simulated incoming on {}: delivered={}", topic, delivered);
        delivered
    }

    /// Coupe la connexion côté broker, comme une panne réseau
    pub fn drop_connection(&self, reason: &str) -> bool {
        let mut st = self.lock();
        st.subscriptions.clear();
        match st.link.take() {
            Some(link) => {
                log::info!("🔌 [MOCK] Dropping connection: {}", reason);
                link.tx
                    .send(LinkEvent::Dropped {
                        reason: reason.to_string(),
                    })
                    .is_ok()
            }
            None => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.lock().link.is_some()
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects.len()
    }

    pub fn last_client_id(&self) -> Option<String> {
        self.lock().connects.last().map(|(_, id)| id.clone())
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.lock().published.clone()
    }

    pub fn get_subscriptions(&self) -> Vec<String> {
        self.lock().subscriptions.clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.lock()
            .published
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Payloads publiés sur un topic, dans l'ordre
    pub fn payloads_on(&self, topic: &str) -> Vec<String> {
        self.find_messages_by_topic(topic)
            .iter()
            .map(MockMessage::payload_str)
            .collect()
    }

    /// Reset des messages enregistrés (la connexion reste ouverte)
    pub fn clear(&self) {
        let mut st = self.lock();
        st.published.clear();
        st.connects.clear();
    }
}

impl Transport for MockBroker {
    fn connect<'a>(
        &'a self,
        broker: &'a BrokerAddress,
        client_id: &'a str,
    ) -> BoxFuture<'a, Result<Link, ConnectionError>> {
        async move {
            let delay = self.lock().connect_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let mut st = self.lock();
            st.connects.push((broker.clone(), client_id.to_string()));
            if st.refuse_all {
                return Err(ConnectionError::Refused("NotAuthorized".into()));
            }
            if st.refuse_next > 0 {
                st.refuse_next -= 1;
                return Err(ConnectionError::Unreachable("connection refused (os error 111)".into()));
            }

            // clean session : aucun abonnement ne survit à une reconnexion
            st.generation += 1;
            st.subscriptions.clear();
            let generation = st.generation;
            let (tx, events) = mpsc::unbounded_channel();
            st.link = Some(ActiveLink { generation, tx });
            log::info!("🔗 [MOCK] {} connected to {}", client_id, broker);

            Ok(Link {
                handle: Box::new(MockLink {
                    state: self.state.clone(),
                    generation,
                }),
                events,
            })
        }
        .boxed()
    }
}

struct MockLink {
    state: Arc<Mutex<BrokerState>>,
    generation: u64,
}

impl MockLink {
    fn publish_now(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), PublishError> {
        let mut st = self.state.lock().unwrap();
        if !st.is_current(self.generation) {
            return Err(PublishError::Rejected("connection closed".into()));
        }
        if st.reject_publishes {
            return Err(PublishError::Rejected("mock broker rejects publishes".into()));
        }
        log::info!("📤 [MOCK] Published to {}: {} bytes", topic, payload.len());
        st.route(topic, &payload);
        st.published.push(MockMessage {
            topic: topic.to_string(),
            payload,
            qos,
        });
        Ok(())
    }

    fn subscribe_now(&self, filter: &str) -> Result<(), SubscribeError> {
        let mut st = self.state.lock().unwrap();
        if !st.is_current(self.generation) {
            return Err(SubscribeError::Rejected("connection closed".into()));
        }
        if st.refuse_subscriptions {
            log::info!("⛔ [MOCK] SUBACK failure for {}", filter);
            return Err(SubscribeError::Rejected("broker refused the subscription (SUBACK failure)".into()));
        }
        if !st.subscriptions.iter().any(|f| f == filter) {
            st.subscriptions.push(filter.to_string());
        }
        log::info!("📥 [MOCK] Subscribed to {}", filter);
        Ok(())
    }
}

impl LinkHandle for MockLink {
    fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> BoxFuture<'_, Result<(), PublishError>> {
        future::ready(self.publish_now(topic, payload, qos)).boxed()
    }

    fn subscribe(&self, filter: &str, _qos: QoS) -> BoxFuture<'_, Result<(), SubscribeError>> {
        future::ready(self.subscribe_now(filter)).boxed()
    }

    fn unsubscribe(&self, filter: &str) -> BoxFuture<'_, Result<(), SubscribeError>> {
        let mut st = self.state.lock().unwrap();
        if st.is_current(self.generation) {
            st.subscriptions.retain(|f| f != filter);
        }
        future::ready(Ok(())).boxed()
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
        let mut st = self.state.lock().unwrap();
        if st.is_current(self.generation) {
            st.link = None;
            st.subscriptions.clear();
            log::info!("👋 [MOCK] Client disconnected");
        }
        future::ready(()).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_broker_routes_to_subscribers() {
        let broker = MockBroker::new();
        let addr = BrokerAddress::new("mock", 1883);
        let mut link = broker.connect(&addr, "client-1").await.unwrap();

        link.handle.subscribe("esp/relay/control", QoS::AtLeastOnce).await.unwrap();
        assert_eq!(broker.get_subscriptions(), vec!["esp/relay/control"]);

        link.handle
            .publish("esp/relay/control", b"TURN_ON".to_vec(), QoS::AtLeastOnce)
            .await
            .unwrap();
        assert_eq!(broker.payloads_on("esp/relay/control"), vec!["TURN_ON"]);
        assert_eq!(
            link.events.recv().await,
            Some(LinkEvent::Message {
                topic: "esp/relay/control".into(),
                payload: b"TURN_ON".to_vec(),
            })
        );

        assert!(!broker.simulate_incoming("other/topic", "x"));
        assert!(broker.simulate_incoming("esp/relay/control", "TIMER:30"));

        broker.refuse_subscriptions(true);
        assert!(matches!(
            link.handle.subscribe("esp/battery", QoS::AtLeastOnce).await,
            Err(SubscribeError::Rejected(_))
        ));
        assert_eq!(broker.get_subscriptions(), vec!["esp/relay/control"]);
    }

    #[tokio::test]
    async fn test_mock_broker_failures() {
        let broker = MockBroker::new();
        let addr = BrokerAddress::new("mock", 1883);

        broker.refuse_connections(true);
        assert!(matches!(
            broker.connect(&addr, "c").await,
            Err(ConnectionError::Refused(_))
        ));
        broker.refuse_connections(false);

        broker.fail_next_connects(1);
        assert!(matches!(
            broker.connect(&addr, "c").await,
            Err(ConnectionError::Unreachable(_))
        ));
        let mut link = broker.connect(&addr, "c").await.unwrap();
        assert_eq!(broker.connect_count(), 3);

        assert!(broker.drop_connection("cable pulled"));
        assert!(matches!(link.events.recv().await, Some(LinkEvent::Dropped { .. })));
        assert!(link
            .handle
            .publish("t", b"x".to_vec(), QoS::AtMostOnce)
            .await
            .is_err());
    }
}
