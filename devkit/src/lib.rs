/*!
# DLT DevKit - Stubs et Utilitaires pour Développement

Bibliothèque facilitant le test du kernel et des workers sans broker :
- Stub MQTT qui enregistre les commandes publiées
- Builders de heartbeats `ng_update` et de `node_updates` encodés
- Harness de test avec assertions sur les commandes envoyées
*/

pub mod mqtt_stub;
pub mod payloads;
pub mod test_utils;

pub use mqtt_stub::MockMqttClient;
pub use payloads::{HeartbeatBuilder, NodeResultsBuilder};
pub use test_utils::TestHarness;
