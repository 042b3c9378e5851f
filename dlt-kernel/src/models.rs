use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;

/// Action des heartbeats de node group, la seule que le kernel traite
pub const NG_UPDATE_ACTION: &str = "ng_update";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeGroup {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub nodes: Vec<String>,
    pub topic: String,
    #[serde(default)]
    pub is_healthy: bool,
    #[serde(rename = "last_health_time", with = "time::serde::rfc3339")]
    pub last_health_check: OffsetDateTime,
}

/// Payload admin pour créer un node group (id et horodatage générés par le store)
#[derive(Debug, Clone, Deserialize)]
pub struct NewNodeGroup {
    pub topic: String,
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// Mise à jour partielle d'un node group. Le topic n'en fait pas partie.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeGroupPatch {
    pub nodes: Option<Vec<String>>,
    pub is_healthy: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadTestStatus {
    Created,
    Running,
    Complete,
}

impl LoadTestStatus {
    /// Les transitions ne vont que vers l'avant : created → running → complete
    pub fn can_advance_to(self, next: LoadTestStatus) -> bool {
        matches!(
            (self, next),
            (LoadTestStatus::Created, LoadTestStatus::Running)
                | (LoadTestStatus::Created, LoadTestStatus::Complete)
                | (LoadTestStatus::Running, LoadTestStatus::Complete)
        )
    }
}

impl std::fmt::Display for LoadTestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LoadTestStatus::Created => "created",
            LoadTestStatus::Running => "running",
            LoadTestStatus::Complete => "complete",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadTest {
    #[serde(rename = "_id")]
    pub id: String,
    pub description: String,
    pub tps: f64,
    pub duration: u64,
    /// Logique de test opaque, interprétée uniquement par les workers
    pub logic: String,
    pub created_by: String,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub end_time: Option<OffsetDateTime>,
    pub status: LoadTestStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewLoadTest {
    #[serde(default)]
    pub description: String,
    pub tps: f64,
    pub duration: u64,
    #[serde(default)]
    pub logic: String,
    #[serde(default)]
    pub created_by: String,
}

/// Champs modifiables via l'API admin ; le statut reste au lifecycle controller
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoadTestPatch {
    pub description: Option<String>,
    pub created_by: Option<String>,
}

// Message MQTT entrant (node group → kernel), topic "manager" par défaut
#[derive(Debug, Clone, Deserialize)]
pub struct Heartbeat {
    pub action: String,
    #[serde(rename = "ng_status", default)]
    pub node_group_status: String,
    #[serde(rename = "ng_id", default)]
    pub node_group_id: String,
    pub nodes: Option<Vec<String>>,
    #[serde(rename = "isLoadTestActive", default)]
    pub is_load_test_active: bool,
    #[serde(default)]
    pub node_updates: Option<String>,
    #[serde(default)]
    pub load_test_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl Heartbeat {
    pub fn is_healthy(&self) -> bool {
        self.node_group_status.trim().eq_ignore_ascii_case("healthy")
    }

    /// Id de load test non vide porté par le heartbeat
    pub fn load_test_id(&self) -> Option<&str> {
        self.load_test_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub load_test_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(rename = "isSuccess")]
    pub is_success: bool,
    #[serde(rename = "latencyMs")]
    pub latency_ms: u64,
    #[serde(rename = "statusCode")]
    pub status_code: String,
    pub response: String,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadTestSummary {
    #[serde(rename = "_id")]
    pub id: String,
    pub load_test_id: String,
    #[serde(rename = "startTime", with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(rename = "endTime", with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
    pub duration: u64,
    pub tps: f64,
    #[serde(rename = "totalRequests")]
    pub total_requests: u64,
    #[serde(rename = "successCount")]
    pub success_count: u64,
    #[serde(rename = "failureCount")]
    pub failure_count: u64,
    #[serde(rename = "successPercent")]
    pub success_percent: f64,
    #[serde(rename = "avgLatencyMs")]
    pub avg_latency_ms: f64,
    /// status code (tel que reçu) → une réponse d'échec représentative (la dernière vue)
    #[serde(rename = "topFailures")]
    pub top_failures: BTreeMap<String, String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

// Commandes MQTT sortantes (kernel → node groups)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum NodeGroupCommand {
    #[serde(rename = "start_loadtest")]
    StartLoadTest {
        load_test_id: String,
        plugin_data: String,
        duration: u64,
        tps: f64,
    },
    #[serde(rename = "stop_loadtest")]
    StopLoadTest {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        load_test_id: Option<String>,
    },
}

impl NodeGroupCommand {
    pub fn start(load_test: &LoadTest) -> Self {
        NodeGroupCommand::StartLoadTest {
            load_test_id: load_test.id.clone(),
            plugin_data: load_test.logic.clone(),
            duration: load_test.duration,
            tps: load_test.tps,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            NodeGroupCommand::StartLoadTest { .. } => "start_loadtest",
            NodeGroupCommand::StopLoadTest { .. } => "stop_loadtest",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_wire_shape() {
        let payload = r#"{
            "action": "ng_update",
            "ng_status": "healthy",
            "ng_id": "ng-a",
            "nodes": ["n1", "n2"],
            "isLoadTestActive": true,
            "node_updates": "[]",
            "load_test_id": "lt-1",
            "timestamp": "2024-01-01T00:00:00Z"
        }"#;
        let hb: Heartbeat = serde_json::from_str(payload).unwrap();
        assert!(hb.is_healthy());
        assert!(hb.is_load_test_active);
        assert_eq!(hb.node_group_id, "ng-a");
        assert_eq!(hb.nodes.as_deref(), Some(&["n1".to_string(), "n2".to_string()][..]));
        assert_eq!(hb.load_test_id(), Some("lt-1"));
    }

    #[test]
    fn test_heartbeat_blank_load_test_id_is_none() {
        let hb: Heartbeat = serde_json::from_str(
            r#"{"action":"ng_update","ng_status":"UNHEALTHY","ng_id":"x","isLoadTestActive":false,"load_test_id":"  "}"#,
        )
        .unwrap();
        assert!(!hb.is_healthy());
        assert_eq!(hb.load_test_id(), None);
        assert!(hb.nodes.is_none());
    }

    #[test]
    fn test_start_command_wire_shape() {
        let cmd = NodeGroupCommand::StartLoadTest {
            load_test_id: "lt-1".into(),
            plugin_data: "logic".into(),
            duration: 30,
            tps: 10.0,
        };
        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(value["action"], "start_loadtest");
        assert_eq!(value["load_test_id"], "lt-1");
        assert_eq!(value["plugin_data"], "logic");
        assert_eq!(value["duration"], 30);
        assert_eq!(value["tps"], 10.0);
    }

    #[test]
    fn test_stop_command_omits_missing_id() {
        let value = serde_json::to_value(NodeGroupCommand::StopLoadTest { load_test_id: None }).unwrap();
        assert_eq!(value, serde_json::json!({"action": "stop_loadtest"}));
    }

    #[test]
    fn test_status_only_moves_forward() {
        assert!(LoadTestStatus::Created.can_advance_to(LoadTestStatus::Running));
        assert!(LoadTestStatus::Running.can_advance_to(LoadTestStatus::Complete));
        assert!(!LoadTestStatus::Complete.can_advance_to(LoadTestStatus::Running));
        assert!(!LoadTestStatus::Running.can_advance_to(LoadTestStatus::Running));
        assert!(!LoadTestStatus::Complete.can_advance_to(LoadTestStatus::Complete));
    }
}
