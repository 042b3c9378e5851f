/*!
Test Harness pour le kernel DLT

- Mock MQTT prêt à l'emploi (receiver de heartbeats branché)
- Envoi de heartbeats simulés sur le topic manager
- Assertions sur les commandes start/stop publiées vers les node groups
*/

use crate::mqtt_stub::{MockMessage, MockMqttClient};
use crate::payloads::HeartbeatBuilder;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use anyhow::Result;

pub const DEFAULT_HEARTBEAT_TOPIC: &str = "manager";

pub struct TestHarness {
    pub mqtt_client: MockMqttClient,
    heartbeat_topic: String,
    heartbeats: Option<mpsc::UnboundedReceiver<MockMessage>>,
    expectations: Vec<Expectation>,
}

#[derive(Debug)]
struct Expectation {
    topic: String,
    expected_count: usize,
}

impl TestHarness {
    pub fn new() -> Self {
        env_logger::try_init().ok();

        let mqtt_client = MockMqttClient::new();
        let heartbeats = Some(mqtt_client.setup_receiver());
        Self {
            mqtt_client,
            heartbeat_topic: DEFAULT_HEARTBEAT_TOPIC.to_string(),
            heartbeats,
            expectations: Vec::new(),
        }
    }

    pub fn with_heartbeat_topic(mut self, topic: &str) -> Self {
        self.heartbeat_topic = topic.to_string();
        self
    }

    /// Récupère le flux des heartbeats simulés (une seule fois)
    pub fn take_heartbeats(&mut self) -> Option<mpsc::UnboundedReceiver<MockMessage>> {
        self.heartbeats.take()
    }

    /// On s'attend à exactement N commandes sur ce topic
    pub fn expect_commands(&mut self, topic: &str, count: usize) -> &mut Self {
        self.expectations.push(Expectation {
            topic: topic.to_string(),
            expected_count: count,
        });
        self
    }

    pub async fn send_heartbeat(&self, heartbeat: HeartbeatBuilder) -> Result<()> {
        let payload = heartbeat.to_bytes();
        self.mqtt_client
            .simulate_incoming(self.heartbeat_topic.clone(), payload)
            .await?;
        log::info!("💓 Sent heartbeat on {}", self.heartbeat_topic);
        Ok(())
    }

    /// Attend qu'une commande soit publiée sur un topic
    pub async fn wait_for_command(&self, topic: &str, timeout_ms: u64) -> Result<Option<Value>> {
        let start = std::time::Instant::now();

        while start.elapsed() < Duration::from_millis(timeout_ms) {
            if let Some(msg) = self.mqtt_client.get_last_json_message::<Value>(topic)? {
                return Ok(Some(msg));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        log::warn!("⏰ Timeout waiting for command on {}", topic);
        Ok(None)
    }

    pub fn verify_expectations(&self) -> Result<()> {
        for expectation in &self.expectations {
            let actual_count = self.mqtt_client.find_messages_by_topic(&expectation.topic).len();
            if actual_count != expectation.expected_count {
                anyhow::bail!(
                    "Expectation failed for topic '{}': expected {} commands, got {}",
                    expectation.topic, expectation.expected_count, actual_count
                );
            }
        }
        Ok(())
    }

    /// Assert que la dernière commande du topic porte cette action
    pub fn assert_last_action(&self, topic: &str, action: &str) -> Result<()> {
        match self.mqtt_client.get_last_json_message::<Value>(topic)? {
            Some(msg) if msg["action"] == action => Ok(()),
            Some(msg) => anyhow::bail!("Last command on {} is {:?}, expected {}", topic, msg["action"], action),
            None => anyhow::bail!("No command published on {}", topic),
        }
    }

    pub fn get_stats(&self) -> TestStats {
        let messages = self.mqtt_client.get_published_messages();
        let mut topic_counts = HashMap::new();
        for msg in &messages {
            *topic_counts.entry(msg.topic.clone()).or_insert(0) += 1;
        }
        TestStats {
            total_messages: messages.len(),
            topic_counts,
        }
    }

    pub fn reset(&mut self) {
        self.mqtt_client.clear();
        self.expectations.clear();
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct TestStats {
    pub total_messages: usize,
    pub topic_counts: HashMap<String, usize>,
}
