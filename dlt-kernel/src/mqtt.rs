use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, Publish, QoS};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};

use crate::config::MqttConf;
use crate::dispatcher::CommandPublisher;
use crate::error::TransportError;
use crate::health::HealthTracker;
use crate::router::SharedRouter;

const RETRY_DELAY: Duration = Duration::from_secs(2);

pub fn create_client(conf: &MqttConf) -> (AsyncClient, EventLoop) {
    let mut opts = MqttOptions::new(conf.client_id.clone(), conf.host.clone(), conf.port);
    opts.set_keep_alive(Duration::from_secs(conf.keep_alive_secs.max(5)));
    AsyncClient::new(opts, 64)
}

#[async_trait]
impl CommandPublisher for AsyncClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        AsyncClient::publish(self, topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                message: e.to_string(),
            })
    }
}

/// Boucle d'événements MQTT : (ré)abonnement au topic heartbeat à chaque
/// ConnAck, heartbeats traités dans l'ordre de réception par node group.
pub fn spawn_heartbeat_listener(
    client: AsyncClient,
    mut eventloop: EventLoop,
    heartbeat_topic: String,
    router: SharedRouter,
    health: HealthTracker,
) -> JoinHandle<()> {
    task::spawn(async move {
        let mut queues = HeartbeatQueues::new(router);
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    health.mark_mqtt_connected();
                    tracing::info!(topic = %heartbeat_topic, "mqtt connected, subscribing");
                    if let Err(e) = client.subscribe(heartbeat_topic.as_str(), QoS::AtLeastOnce).await {
                        tracing::error!(topic = %heartbeat_topic, error = %e, "mqtt subscribe failed");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    queues.route(&heartbeat_topic, publish);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(error = %e, "mqtt event loop error, retrying");
                    health.increment_reconnects();
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    })
}

#[derive(Deserialize)]
struct Sender {
    #[serde(default)]
    ng_id: String,
}

/// Une file et un worker par node group : les heartbeats d'un même sender
/// passent au router dans l'ordre, ceux de senders différents en parallèle.
pub struct HeartbeatQueues {
    router: SharedRouter,
    workers: HashMap<String, (mpsc::UnboundedSender<Publish>, JoinHandle<()>)>,
}

impl HeartbeatQueues {
    pub fn new(router: SharedRouter) -> Self {
        Self {
            router,
            workers: HashMap::new(),
        }
    }

    /// Met le publish en file pour son sender ; false si le topic est ignoré
    pub fn route(&mut self, heartbeat_topic: &str, publish: Publish) -> bool {
        if publish.topic != heartbeat_topic {
            tracing::debug!(topic = %publish.topic, "ignoring publish on unexpected topic");
            return false;
        }
        // payload illisible : file "" partagée, le router le rejettera
        let sender = serde_json::from_slice::<Sender>(&publish.payload)
            .map(|s| s.ng_id)
            .unwrap_or_default();

        let publish = match self.workers.get(&sender) {
            Some((queue, _)) => match queue.send(publish) {
                Ok(()) => return true,
                Err(mpsc::error::SendError(publish)) => publish,
            },
            None => publish,
        };

        let (queue, mut rx) = mpsc::unbounded_channel::<Publish>();
        let router = self.router.clone();
        let worker = task::spawn(async move {
            while let Some(publish) = rx.recv().await {
                router.handle_payload(&publish.payload).await;
            }
        });
        if queue.send(publish).is_err() {
            tracing::error!(ng_id = %sender, "heartbeat worker closed, dropping heartbeat");
        }
        self.workers.insert(sender, (queue, worker));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::ResultAggregator;
    use crate::health::NodeGroupHealthTracker;
    use crate::lifecycle::LifecycleController;
    use crate::router::HeartbeatRouter;
    use crate::models::NewLoadTest;
    use crate::store::{JsonStore, SharedStore, Store, StoreTimeouts};
    use dlt_devkit::{HeartbeatBuilder, NodeResultsBuilder, TestHarness};
    use std::sync::Arc;

    fn router() -> (SharedRouter, SharedStore) {
        let store: SharedStore = Arc::new(JsonStore::in_memory());
        let timeouts = StoreTimeouts::default();
        let aggregator = ResultAggregator::new(store.clone(), timeouts);
        let router = Arc::new(HeartbeatRouter::new(
            NodeGroupHealthTracker::new(store.clone(), timeouts),
            LifecycleController::new(store.clone(), timeouts, aggregator),
        ));
        (router, store)
    }

    /// Ferme les files et attend que chaque worker ait tout traité
    async fn drain(queues: HeartbeatQueues) {
        for (_, (queue, worker)) in queues.workers {
            drop(queue);
            worker.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_heartbeats_are_routed_from_the_manager_topic_only() {
        let (router, _store) = router();
        let mut queues = HeartbeatQueues::new(router.clone());
        let mut harness = TestHarness::new();
        let mut incoming = harness.take_heartbeats().unwrap();

        harness.send_heartbeat(HeartbeatBuilder::new("ng-1")).await.unwrap();
        harness
            .send_heartbeat(HeartbeatBuilder::new("ng-1").action("ng_register"))
            .await
            .unwrap();

        for _ in 0..2 {
            let msg = incoming.recv().await.unwrap();
            let publish = Publish::new(msg.topic, QoS::AtLeastOnce, msg.payload);
            assert!(queues.route("manager", publish));
        }
        let stray = Publish::new("ng/a", QoS::AtLeastOnce, b"{}".to_vec());
        assert!(!queues.route("manager", stray));
        drain(queues).await;

        assert_eq!(router.stats().processed(), 1);
        assert_eq!(router.stats().ignored(), 1);
    }

    #[tokio::test]
    async fn test_heartbeats_from_one_group_are_handled_in_order() {
        let (router, store) = router();
        let lt = store
            .create_load_test(NewLoadTest {
                description: String::new(),
                tps: 10.0,
                duration: 30,
                logic: String::new(),
                created_by: String::new(),
            })
            .await
            .unwrap()
            .id;
        let mut queues = HeartbeatQueues::new(router.clone());

        for round in 0..5u64 {
            let results = NodeResultsBuilder::new().node("n1").success(10 + round).build();
            let active = HeartbeatBuilder::new("ng-1").active(&lt).node_updates(results);
            queues.route("manager", Publish::new("manager", QoS::AtLeastOnce, active.to_bytes()));
        }
        let stop = HeartbeatBuilder::new("ng-1");
        queues.route("manager", Publish::new("manager", QoS::AtLeastOnce, stop.to_bytes()));
        queues.route("manager", Publish::new("manager", QoS::AtLeastOnce, b"{oops".to_vec()));
        assert_eq!(queues.workers.len(), 2);
        drain(queues).await;

        let summary = store.get_summary(&lt).await.unwrap().unwrap();
        assert_eq!(summary.total_requests, 5);
        assert_eq!(router.stats().rejected(), 1);
    }

    #[tokio::test]
    async fn test_client_options_from_config() {
        let conf = MqttConf {
            host: "broker".into(),
            port: 1884,
            ..MqttConf::default()
        };
        // ne se connecte qu'au premier poll
        let (_client, eventloop) = create_client(&conf);
        assert_eq!(eventloop.mqtt_options.broker_address(), ("broker".to_string(), 1884));
    }
}
