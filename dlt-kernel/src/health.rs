use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;

use crate::error::StoreError;
use crate::models::NodeGroupPatch;
use crate::router::RouterStats;
use crate::store::{bounded, SharedStore, StoreTimeouts};

/// Santé et membership des node groups, alimentées par les heartbeats
#[derive(Clone)]
pub struct NodeGroupHealthTracker {
    store: SharedStore,
    timeouts: StoreTimeouts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthUpdate {
    Updated { membership_replaced: bool },
    /// Heartbeat d'un node group supprimé ou jamais créé
    UnknownNodeGroup,
}

impl NodeGroupHealthTracker {
    pub fn new(store: SharedStore, timeouts: StoreTimeouts) -> Self {
        Self { store, timeouts }
    }

    /// Enregistre santé + timestamp ; remplace la membership seulement si healthy.
    /// Un groupe unhealthy garde sa dernière membership connue.
    pub async fn record(
        &self,
        node_group_id: &str,
        is_healthy: bool,
        nodes: Option<Vec<String>>,
    ) -> Result<HealthUpdate, StoreError> {
        let now = OffsetDateTime::now_utc();
        let known = bounded(
            "update_node_group_health",
            self.timeouts.point,
            self.store.update_node_group_health(node_group_id, is_healthy, now),
        )
        .await?;

        if !known {
            tracing::warn!(ng_id = node_group_id, "heartbeat from unknown node group, ignoring");
            return Ok(HealthUpdate::UnknownNodeGroup);
        }

        let Some(nodes) = nodes.filter(|_| is_healthy) else {
            return Ok(HealthUpdate::Updated { membership_replaced: false });
        };

        let member_count = nodes.len();
        let patch = NodeGroupPatch {
            nodes: Some(nodes),
            is_healthy: None,
        };
        let replaced = bounded(
            "update_node_group",
            self.timeouts.point,
            self.store.update_node_group(node_group_id, patch),
        )
        .await?
        .is_some();

        tracing::debug!(ng_id = node_group_id, members = member_count, "node group membership refreshed");
        Ok(HealthUpdate::Updated { membership_replaced: replaced })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
    pub heartbeats_processed: u64,
    pub heartbeats_ignored: u64,
    pub heartbeats_rejected: u64,
    pub node_groups_tracked: u32,
    pub load_tests_in_flight: u32,
}

/// Santé du kernel lui-même (connexion MQTT, uptime)
#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Arc<parking_lot::Mutex<String>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: Arc::new(parking_lot::Mutex::new("connecting".to_string())),
        }
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn mqtt_status(&self) -> String {
        self.mqtt_status.lock().clone()
    }

    pub fn get_health(
        &self,
        stats: &RouterStats,
        node_groups: usize,
        in_flight: usize,
    ) -> KernelHealth {
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            mqtt_status: self.mqtt_status(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
            heartbeats_processed: stats.processed(),
            heartbeats_ignored: stats.ignored(),
            heartbeats_rejected: stats.rejected(),
            node_groups_tracked: u32::try_from(node_groups).unwrap_or(u32::MAX),
            load_tests_in_flight: u32::try_from(in_flight).unwrap_or(u32::MAX),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewNodeGroup;
    use crate::store::{JsonStore, Store};

    async fn tracker_with_group(nodes: Vec<&str>) -> (NodeGroupHealthTracker, SharedStore, String) {
        let store: SharedStore = Arc::new(JsonStore::in_memory());
        let ng = store
            .create_node_group(NewNodeGroup {
                topic: "ng/a".into(),
                nodes: nodes.into_iter().map(String::from).collect(),
            })
            .await
            .unwrap();
        let tracker = NodeGroupHealthTracker::new(store.clone(), StoreTimeouts::default());
        (tracker, store, ng.id)
    }

    #[tokio::test]
    async fn test_healthy_heartbeat_replaces_membership() {
        let (tracker, store, id) = tracker_with_group(vec!["old"]).await;
        let update = tracker
            .record(&id, true, Some(vec!["n1".into(), "n2".into()]))
            .await
            .unwrap();
        assert_eq!(update, HealthUpdate::Updated { membership_replaced: true });

        let ng = store.get_node_group(&id).await.unwrap().unwrap();
        assert!(ng.is_healthy);
        assert_eq!(ng.nodes, vec!["n1".to_string(), "n2".to_string()]);
    }

    #[tokio::test]
    async fn test_unhealthy_heartbeat_keeps_membership() {
        let (tracker, store, id) = tracker_with_group(vec!["n1", "n2"]).await;
        tracker.record(&id, true, Some(vec!["n1".into(), "n2".into()])).await.unwrap();
        let before = store.get_node_group(&id).await.unwrap().unwrap();

        let update = tracker.record(&id, false, Some(vec![])).await.unwrap();
        assert_eq!(update, HealthUpdate::Updated { membership_replaced: false });

        let after = store.get_node_group(&id).await.unwrap().unwrap();
        assert!(!after.is_healthy);
        assert_eq!(after.nodes, before.nodes);
        assert!(after.last_health_check >= before.last_health_check);
    }

    #[tokio::test]
    async fn test_healthy_without_nodes_field_keeps_membership() {
        let (tracker, store, id) = tracker_with_group(vec!["n1"]).await;
        tracker.record(&id, true, None).await.unwrap();
        let ng = store.get_node_group(&id).await.unwrap().unwrap();
        assert_eq!(ng.nodes, vec!["n1".to_string()]);
        assert!(ng.is_healthy);
    }

    #[tokio::test]
    async fn test_unknown_node_group_is_tolerated() {
        let (tracker, _store, _id) = tracker_with_group(vec![]).await;
        let update = tracker.record("deleted", true, Some(vec!["x".into()])).await.unwrap();
        assert_eq!(update, HealthUpdate::UnknownNodeGroup);
    }

    #[test]
    fn test_kernel_health_reflects_mqtt_state() {
        let tracker = HealthTracker::new();
        assert_eq!(tracker.mqtt_status(), "connecting");
        tracker.increment_reconnects();
        tracker.mark_mqtt_connected();
        let health = tracker.get_health(&RouterStats::default(), 3, 1);
        assert_eq!(health.mqtt_status, "connected");
        assert_eq!(health.mqtt_reconnects, 1);
        assert_eq!(health.node_groups_tracked, 3);
        assert_eq!(health.load_tests_in_flight, 1);
    }
}
