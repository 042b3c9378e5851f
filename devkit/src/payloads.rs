/*!
Builders de payloads au format des workers

- `HeartbeatBuilder` : heartbeat `ng_update` publié sur le topic manager
- `NodeResultsBuilder` : champ `node_updates` (JSON → base64 → liste de
  chaînes JSON), valeurs en string comme les workers les envoient
*/

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Map, Value};

pub struct HeartbeatBuilder {
    action: String,
    node_group_id: String,
    status: String,
    nodes: Option<Vec<String>>,
    active: bool,
    load_test_id: Option<String>,
    node_updates: Option<String>,
}

impl HeartbeatBuilder {
    /// Heartbeat `ng_update` healthy et inactif
    pub fn new<S: Into<String>>(node_group_id: S) -> Self {
        Self {
            action: "ng_update".to_string(),
            node_group_id: node_group_id.into(),
            status: "healthy".to_string(),
            nodes: None,
            active: false,
            load_test_id: None,
            node_updates: None,
        }
    }

    pub fn action(mut self, action: &str) -> Self {
        self.action = action.to_string();
        self
    }

    pub fn unhealthy(mut self) -> Self {
        self.status = "unhealthy".to_string();
        self
    }

    pub fn nodes(mut self, nodes: &[&str]) -> Self {
        self.nodes = Some(nodes.iter().map(|n| n.to_string()).collect());
        self
    }

    /// Marque le heartbeat actif pour ce load test
    pub fn active(mut self, load_test_id: &str) -> Self {
        self.active = true;
        self.load_test_id = Some(load_test_id.to_string());
        self
    }

    /// Id explicite sans changer l'état actif (heartbeat de fin ciblé)
    pub fn load_test_id(mut self, load_test_id: &str) -> Self {
        self.load_test_id = Some(load_test_id.to_string());
        self
    }

    pub fn node_updates(mut self, node_updates: String) -> Self {
        self.node_updates = Some(node_updates);
        self
    }

    pub fn build(&self) -> Value {
        let mut heartbeat = json!({
            "action": self.action,
            "ng_id": self.node_group_id,
            "ng_status": self.status,
            "isLoadTestActive": self.active,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        if let Some(nodes) = &self.nodes {
            heartbeat["nodes"] = json!(nodes);
        }
        if let Some(id) = &self.load_test_id {
            heartbeat["load_test_id"] = json!(id);
        }
        if let Some(updates) = &self.node_updates {
            heartbeat["node_updates"] = json!(updates);
        }
        heartbeat
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.build().to_string().into_bytes()
    }
}

struct NodeEntry {
    node_id: String,
    lines: Vec<String>,
    corrupt: bool,
}

/// Résultats par node, encodés comme dans `node_updates`
#[derive(Default)]
pub struct NodeResultsBuilder {
    nodes: Vec<NodeEntry>,
}

impl NodeResultsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Les résultats suivants sont rattachés à ce node
    pub fn node(mut self, node_id: &str) -> Self {
        self.nodes.push(NodeEntry {
            node_id: node_id.to_string(),
            lines: Vec::new(),
            corrupt: false,
        });
        self
    }

    pub fn success(self, latency_ms: u64) -> Self {
        let line = json!({
            "isSuccess": "true",
            "latencyMs": latency_ms.to_string(),
            "statusCode": "200",
            "response": "OK",
        });
        self.raw(&line.to_string())
    }

    pub fn failure(self, status_code: u16, response: &str) -> Self {
        let line = json!({
            "isSuccess": "false",
            "latencyMs": "0",
            "statusCode": status_code.to_string(),
            "response": response,
        });
        self.raw(&line.to_string())
    }

    /// Ligne brute, valide ou non
    pub fn raw(mut self, line: &str) -> Self {
        self.current().lines.push(line.to_string());
        self
    }

    /// load_test_results du node courant devient du base64 invalide
    pub fn corrupt(mut self) -> Self {
        self.current().corrupt = true;
        self
    }

    fn current(&mut self) -> &mut NodeEntry {
        if self.nodes.is_empty() {
            self.nodes.push(NodeEntry {
                node_id: "node-0".to_string(),
                lines: Vec::new(),
                corrupt: false,
            });
        }
        let last = self.nodes.len() - 1;
        &mut self.nodes[last]
    }

    /// Chaîne JSON `{node_id: [{node_id, load_test_results}]}`
    pub fn build(&self) -> String {
        let mut by_node = Map::new();
        for node in &self.nodes {
            let encoded = if node.corrupt {
                "not base64!!".to_string()
            } else {
                STANDARD.encode(Value::from(node.lines.clone()).to_string())
            };
            let update = json!({
                "node_id": node.node_id,
                "load_test_results": encoded,
            });
            if let Some(updates) = by_node
                .entry(node.node_id.clone())
                .or_insert_with(|| Value::Array(Vec::new()))
                .as_array_mut()
            {
                updates.push(update);
            }
        }
        Value::Object(by_node).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_shape() {
        let hb = HeartbeatBuilder::new("ng-1").nodes(&["a", "b"]).active("lt-1").build();
        assert_eq!(hb["action"], "ng_update");
        assert_eq!(hb["ng_id"], "ng-1");
        assert_eq!(hb["ng_status"], "healthy");
        assert_eq!(hb["isLoadTestActive"], true);
        assert_eq!(hb["load_test_id"], "lt-1");
        assert_eq!(hb["nodes"], json!(["a", "b"]));
        assert!(hb.get("node_updates").is_none());
    }

    #[test]
    fn test_node_results_encoding() {
        let encoded = NodeResultsBuilder::new().node("n1").success(50).failure(500, "boom").build();
        let parsed: Value = serde_json::from_str(&encoded).unwrap();
        let update = &parsed["n1"][0];
        assert_eq!(update["node_id"], "n1");

        let raw = STANDARD.decode(update["load_test_results"].as_str().unwrap()).unwrap();
        let lines: Vec<String> = serde_json::from_slice(&raw).unwrap();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(first["isSuccess"], "true");
        assert_eq!(first["latencyMs"], "50");
        let second: Value = serde_json::from_str(&lines[1]).unwrap();
        assert_eq!(second["statusCode"], "500");
        assert_eq!(second["response"], "boom");
    }
}
