use std::sync::Arc;

use crate::aggregator::ResultAggregator;
use crate::config::KernelConfig;
use crate::dispatcher::{CommandDispatcher, SharedPublisher};
use crate::error::StoreError;
use crate::health::{HealthTracker, NodeGroupHealthTracker};
use crate::http::AppState;
use crate::lifecycle::LifecycleController;
use crate::router::{HeartbeatRouter, SharedRouter};
use crate::store::{JsonStore, SharedStore, StoreTimeouts};

/// Composants du kernel, construits une fois au démarrage et partagés par
/// handle entre le listener MQTT et l'API HTTP.
#[derive(Clone)]
pub struct KernelState {
    pub store: SharedStore,
    pub timeouts: StoreTimeouts,
    pub router: SharedRouter,
    pub dispatcher: CommandDispatcher,
    pub aggregator: ResultAggregator,
    pub health_tracker: HealthTracker,
}

impl KernelState {
    pub fn new(store: SharedStore, timeouts: StoreTimeouts, publisher: SharedPublisher) -> Self {
        let aggregator = ResultAggregator::new(store.clone(), timeouts);
        let lifecycle = LifecycleController::new(store.clone(), timeouts, aggregator.clone());
        let node_groups = NodeGroupHealthTracker::new(store.clone(), timeouts);
        let router = Arc::new(HeartbeatRouter::new(node_groups, lifecycle));
        let dispatcher = CommandDispatcher::new(store.clone(), publisher, timeouts);
        Self {
            store,
            timeouts,
            router,
            dispatcher,
            aggregator,
            health_tracker: HealthTracker::new(),
        }
    }

    /// Ouvre le store décrit par la config (fichier ou mémoire)
    pub async fn from_config(config: &KernelConfig, publisher: SharedPublisher) -> Result<Self, StoreError> {
        let store: SharedStore = match &config.store.data_file {
            Some(path) => Arc::new(JsonStore::open(path).await?),
            None => {
                tracing::warn!("no store.data_file configured, state is kept in memory only");
                Arc::new(JsonStore::in_memory())
            }
        };
        Ok(Self::new(store, config.store_timeouts(), publisher))
    }

    pub fn app_state(&self, api_key: Option<String>) -> AppState {
        AppState {
            store: self.store.clone(),
            timeouts: self.timeouts,
            router: self.router.clone(),
            dispatcher: self.dispatcher.clone(),
            aggregator: self.aggregator.clone(),
            health_tracker: self.health_tracker.clone(),
            api_key: api_key.map(Arc::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConf;
    use crate::models::NewNodeGroup;
    use crate::store::Store;
    use dlt_devkit::{HeartbeatBuilder, MockMqttClient};

    #[tokio::test]
    async fn test_file_backed_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = KernelConfig {
            store: StoreConf {
                data_file: Some(dir.path().join("dlt.json")),
            },
            ..KernelConfig::default()
        };

        let first = KernelState::from_config(&config, Arc::new(MockMqttClient::new())).await.unwrap();
        let ng = first
            .store
            .create_node_group(NewNodeGroup { topic: "ng/a".into(), nodes: vec![] })
            .await
            .unwrap();
        first
            .router
            .handle_payload(&HeartbeatBuilder::new(&ng.id).nodes(&["n1"]).to_bytes())
            .await;

        let second = KernelState::from_config(&config, Arc::new(MockMqttClient::new())).await.unwrap();
        let reloaded = second.store.get_node_group(&ng.id).await.unwrap().unwrap();
        assert!(reloaded.is_healthy);
        assert_eq!(reloaded.nodes, vec!["n1".to_string()]);
    }

    #[test]
    fn test_app_state_shares_router() {
        let state = KernelState::new(
            Arc::new(JsonStore::in_memory()),
            StoreTimeouts::default(),
            Arc::new(MockMqttClient::new()),
        );
        let app = state.app_state(Some("k".into()));
        assert!(Arc::ptr_eq(&app.router, &state.router));
        assert_eq!(app.api_key.as_deref(), Some("k"));
    }
}
