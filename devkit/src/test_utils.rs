/*!
Test Harness pour le session manager RelayLink

Facilite l'écriture de tests avec:
- Setup automatique du broker mock et d'un session manager rapide
- Assertions sur les commandes publiées
- Observer d'enregistrement pour les messages reçus
*/

use crate::mqtt_stub::{MockBroker, MockMessage};
use anyhow::Result;
use relaylink_core::session::Backoff;
use relaylink_core::{BrokerAddress, SessionManager, SessionSettings, SessionState};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Réglages courts pour que les reconnexions ne ralentissent pas les tests
pub fn fast_settings() -> SessionSettings {
    SessionSettings {
        backoff: Backoff::new(Duration::from_millis(5), Duration::from_millis(20)),
        max_reconnect_attempts: 5,
        ..SessionSettings::default()
    }
}

pub fn mock_address() -> BrokerAddress {
    BrokerAddress::new("mock.broker", 1883)
}

/// Attend qu'une condition devienne vraie (polling)
pub async fn wait_until<F: FnMut() -> bool>(mut condition: F, timeout_ms: u64) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    condition()
}

/// Harness de test: broker mock + session manager branché dessus
pub struct TestHarness {
    pub broker: MockBroker,
    pub session: SessionManager,
    expectations: Vec<Expectation>,
}

#[derive(Debug)]
struct Expectation {
    topic: String,
    expected_count: usize,
}

impl TestHarness {
    /// Doit être appelé dans un runtime Tokio
    pub fn new() -> Self {
        Self::with_settings(fast_settings())
    }

    pub fn with_settings(settings: SessionSettings) -> Self {
        env_logger::try_init().ok(); // Init logging pour tests

        let broker = MockBroker::new();
        let session = SessionManager::new(Arc::new(broker.clone()), settings);
        Self {
            broker,
            session,
            expectations: Vec::new(),
        }
    }

    /// Démarre la session sur le broker mock
    pub async fn started(self) -> Result<Self> {
        self.session.start(mock_address(), "test-client").await?;
        log::info!("🔗 Test session connected");
        Ok(self)
    }

    /// Ajoute une expectation: on s'attend à N messages publiés sur un topic
    pub fn expect_messages(&mut self, topic: &str, count: usize) -> &mut Self {
        self.expectations.push(Expectation {
            topic: topic.to_string(),
            expected_count: count,
        });
        self
    }

    /// Attend qu'un message soit publié sur un topic
    pub async fn wait_for_publish(&self, topic: &str, timeout_ms: u64) -> Option<MockMessage> {
        let found = wait_until(|| !self.broker.find_messages_by_topic(topic).is_empty(), timeout_ms).await;
        if !found {
            log::warn!("⏰ Timeout waiting for message on {}", topic);
            return None;
        }
        self.broker.find_messages_by_topic(topic).pop()
    }

    pub async fn wait_for_state(&self, expected: SessionState, timeout_ms: u64) -> bool {
        let mut rx = self.session.watch_state();
        let reached = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            rx.wait_for(|state| *state == expected),
        )
        .await;
        matches!(reached, Ok(Ok(_)))
    }

    /// Vérifie toutes les expectations configurées
    pub fn verify_expectations(&self) -> Result<()> {
        log::info!("🔍 Verifying {} expectations...", self.expectations.len());

        for expectation in &self.expectations {
            let actual_count = self.broker.find_messages_by_topic(&expectation.topic).len();
            if actual_count != expectation.expected_count {
                anyhow::bail!(
                    "Expectation failed for topic '{}': expected {} messages, got {}",
                    expectation.topic,
                    expectation.expected_count,
                    actual_count
                );
            }
            log::info!("✅ Topic '{}': {} messages as expected", expectation.topic, actual_count);
        }
        Ok(())
    }

    /// Assert qu'un payload précis a été publié sur le topic
    pub fn assert_payload_sent(&self, topic: &str, expected: &str) -> Result<()> {
        let payloads = self.broker.payloads_on(topic);
        if payloads.iter().any(|p| p == expected) {
            Ok(())
        } else {
            anyhow::bail!("'{}' never published on '{}' (got {:?})", expected, topic, payloads)
        }
    }

    pub fn get_stats(&self) -> TestStats {
        let published = self.broker.get_published_messages();
        let mut messages_by_topic = HashMap::new();
        for msg in &published {
            *messages_by_topic.entry(msg.topic.clone()).or_insert(0) += 1;
        }
        TestStats {
            total_messages: published.len(),
            messages_by_topic,
            connects: self.broker.connect_count(),
            subscriptions: self.broker.get_subscriptions().len(),
        }
    }
}

#[derive(Debug)]
pub struct TestStats {
    pub total_messages: usize,
    pub messages_by_topic: HashMap<String, usize>,
    pub connects: usize,
    pub subscriptions: usize,
}

/// Observer qui enregistre chaque message reçu
#[derive(Clone, Default)]
pub struct RecordingObserver {
    seen: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(String, Vec<u8>)> {
        self.seen.lock().unwrap().clone()
    }

    pub fn payloads(&self) -> Vec<String> {
        self.messages()
            .iter()
            .map(|(_, payload)| String::from_utf8_lossy(payload).into_owned())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    /// Attend au moins `n` messages
    pub async fn wait_for(&self, n: usize, timeout_ms: u64) -> bool {
        wait_until(|| self.count() >= n, timeout_ms).await
    }
}

impl relaylink_core::Observer for RecordingObserver {
    fn on_message(&self, topic: &str, payload: &[u8]) -> anyhow::Result<()> {
        self.seen
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaylink_core::Command;

    #[tokio::test]
    async fn test_harness_basic() {
        let mut harness = TestHarness::new().started().await.unwrap();
        harness.expect_messages("dev/relay/control", 1);

        harness
            .session
            .send(Command::turn_on("dev/relay/control"))
            .await
            .unwrap();

        assert!(harness.wait_for_publish("dev/relay/control", 500).await.is_some());
        harness.verify_expectations().unwrap();
        harness.assert_payload_sent("dev/relay/control", "TURN_ON").unwrap();

        let stats = harness.get_stats();
        assert_eq!(stats.total_messages, 1);
        assert_eq!(stats.messages_by_topic["dev/relay/control"], 1);
        assert_eq!(stats.connects, 1);
        assert_eq!(stats.subscriptions, 0);
    }
}
