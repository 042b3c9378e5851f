/**
 * COMMAND DISPATCHER - Fan-out start/stop vers les node groups
 *
 * - Une publication par topic de node group connu, émises en parallèle
 * - Fire-and-forget : pas d'ack attendu, la confirmation vient des heartbeats
 * - Un échec de publication est loggé et compté, jamais bloquant pour les autres
 */

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;

use crate::error::{KernelResult, TransportError};
use crate::models::{NodeGroup, NodeGroupCommand};
use crate::store::{bounded, SharedStore, StoreTimeouts};

/// Côté publication du transport
#[async_trait]
pub trait CommandPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;
}

pub type SharedPublisher = Arc<dyn CommandPublisher>;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub action: String,
    pub published: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: usize,
}

#[derive(Clone)]
pub struct CommandDispatcher {
    store: SharedStore,
    publisher: SharedPublisher,
    timeouts: StoreTimeouts,
}

impl CommandDispatcher {
    pub fn new(store: SharedStore, publisher: SharedPublisher, timeouts: StoreTimeouts) -> Self {
        Self {
            store,
            publisher,
            timeouts,
        }
    }

    /// Publie la commande vers tous les node groups actuellement connus
    pub async fn dispatch(&self, command: &NodeGroupCommand) -> KernelResult<DispatchReport> {
        let node_groups = bounded(
            "list_node_groups",
            self.timeouts.scan,
            self.store.list_node_groups(),
        )
        .await?;
        self.dispatch_to(&node_groups, command).await
    }

    pub async fn dispatch_to(
        &self,
        node_groups: &[NodeGroup],
        command: &NodeGroupCommand,
    ) -> KernelResult<DispatchReport> {
        let payload = serde_json::to_vec(command).map_err(TransportError::Serialization)?;
        let mut report = DispatchReport {
            action: command.action().to_string(),
            ..DispatchReport::default()
        };

        let mut topics = Vec::with_capacity(node_groups.len());
        for ng in node_groups {
            let topic = ng.topic.trim();
            if topic.is_empty() {
                tracing::warn!(ng_id = %ng.id, "node group has no topic, skipping");
                report.skipped += 1;
            } else {
                topics.push(topic.to_string());
            }
        }

        let publishes = topics.iter().map(|topic| {
            let publisher = self.publisher.clone();
            let payload = payload.clone();
            async move { publisher.publish(topic, payload).await }
        });
        let results = join_all(publishes).await;

        for (topic, result) in topics.into_iter().zip(results) {
            match result {
                Ok(()) => report.published.push(topic),
                Err(e) => {
                    tracing::error!(topic = %topic, action = %report.action, error = %e, "command publish failed");
                    report.failed.push(topic);
                }
            }
        }

        tracing::info!(
            action = %report.action,
            published = report.published.len(),
            failed = report.failed.len(),
            skipped = report.skipped,
            "command dispatched"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LoadTest, LoadTestStatus, NewNodeGroup};
    use crate::store::{JsonStore, Store};
    use dlt_devkit::MockMqttClient;
    use rumqttc::QoS;
    use serde_json::Value;
    use time::OffsetDateTime;

    #[async_trait]
    impl CommandPublisher for MockMqttClient {
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
            MockMqttClient::publish(self, topic, QoS::AtLeastOnce, false, payload)
                .await
                .map_err(|e| TransportError::Publish {
                    topic: topic.to_string(),
                    message: e.to_string(),
                })
        }
    }

    async fn setup(topics: &[&str]) -> (CommandDispatcher, MockMqttClient) {
        let store: SharedStore = Arc::new(JsonStore::in_memory());
        for topic in topics {
            store
                .create_node_group(NewNodeGroup {
                    topic: topic.to_string(),
                    nodes: vec![],
                })
                .await
                .unwrap();
        }
        let mock = MockMqttClient::new();
        let dispatcher = CommandDispatcher::new(store, Arc::new(mock.clone()), StoreTimeouts::default());
        (dispatcher, mock)
    }

    fn load_test() -> LoadTest {
        LoadTest {
            id: "lt-1".into(),
            description: "checkout".into(),
            tps: 10.0,
            duration: 30,
            logic: "GET /checkout".into(),
            created_by: "ops".into(),
            start_time: OffsetDateTime::now_utc(),
            end_time: None,
            status: LoadTestStatus::Created,
        }
    }

    #[tokio::test]
    async fn test_start_reaches_every_node_group() {
        let (dispatcher, mock) = setup(&["ng/a", "ng/b", "ng/c"]).await;
        let report = dispatcher.dispatch(&NodeGroupCommand::start(&load_test())).await.unwrap();

        assert_eq!(report.action, "start_loadtest");
        assert_eq!(report.published.len(), 3);
        assert!(report.failed.is_empty());
        for topic in ["ng/a", "ng/b", "ng/c"] {
            let sent: Value = mock.get_last_json_message(topic).unwrap().unwrap();
            assert_eq!(sent["action"], "start_loadtest");
            assert_eq!(sent["load_test_id"], "lt-1");
            assert_eq!(sent["plugin_data"], "GET /checkout");
            assert_eq!(sent["duration"], 30);
            assert_eq!(sent["tps"], 10.0);
        }
    }

    #[tokio::test]
    async fn test_failing_topic_does_not_block_others() {
        let (dispatcher, mock) = setup(&["ng/a", "ng/down", "ng/c"]).await;
        mock.fail_topic("ng/down");

        let stop = NodeGroupCommand::StopLoadTest { load_test_id: None };
        let report = dispatcher.dispatch(&stop).await.unwrap();

        assert_eq!(report.failed, vec!["ng/down".to_string()]);
        assert_eq!(report.published.len(), 2);
        assert_eq!(mock.find_messages_by_topic("ng/a").len(), 1);
        assert_eq!(mock.find_messages_by_topic("ng/c").len(), 1);
    }

    #[tokio::test]
    async fn test_node_group_without_topic_is_skipped() {
        let (dispatcher, mock) = setup(&["ng/a", "  "]).await;
        let report = dispatcher
            .dispatch(&NodeGroupCommand::StopLoadTest { load_test_id: Some("lt-1".into()) })
            .await
            .unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.published, vec!["ng/a".to_string()]);
        assert_eq!(mock.get_published_messages().len(), 1);
    }

    #[tokio::test]
    async fn test_no_node_groups_publishes_nothing() {
        let (dispatcher, mock) = setup(&[]).await;
        let report = dispatcher
            .dispatch(&NodeGroupCommand::StopLoadTest { load_test_id: None })
            .await
            .unwrap();
        assert!(report.published.is_empty());
        assert!(mock.get_published_messages().is_empty());
    }
}
