/*!
# RelayLink DevKit - Stubs et Utilitaires pour Tests

Bibliothèque facilitant le test du session manager et du panneau avec:
- Broker MQTT en mémoire (implémente `Transport`)
- Harness de test avec expectations sur les commandes publiées
- Observer d'enregistrement des messages reçus
*/

pub mod mqtt_stub;
pub mod test_utils;

pub use mqtt_stub::{MockBroker, MockMessage};
pub use test_utils::{fast_settings, mock_address, wait_until, RecordingObserver, TestHarness, TestStats};
