/**
 * RESULT DECODER - node_updates → OutcomeRecord
 *
 * FORMAT ENTRANT (imbriqué, faiblement typé) :
 * - node_updates : chaîne JSON, soit {node_id: [update, ...]} soit [update, ...]
 * - update.load_test_results : base64 d'un tableau JSON de chaînes
 * - chaque chaîne : objet JSON {isSuccess, latencyMs, statusCode, response}
 *   où booléens et nombres arrivent souvent en string
 *
 * Transformation pure : aucune écriture, la persistance est à l'appelant.
 * Un node mal formé donne zéro record sans bloquer ses voisins ; un outcome
 * mal formé est sauté sans bloquer ses voisins.
 */

use crate::models::OutcomeRecord;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use serde::Deserialize;
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

/// Alphabet standard, padding optionnel (certains workers le tronquent)
const RESULTS_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("node_updates is not valid JSON: {0}")]
    NodeUpdates(#[source] serde_json::Error),
    #[error("{0} is not a JSON object")]
    NotAnObject(&'static str),
    #[error("updates of node {0} are not a JSON array")]
    NotAnArray(String),
    #[error("invalid node update: {0}")]
    NodeUpdate(#[source] serde_json::Error),
    #[error("load_test_results is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("load_test_results is not a JSON array of strings: {0}")]
    ResultList(#[source] serde_json::Error),
    #[error("invalid outcome: {0}")]
    Outcome(#[source] serde_json::Error),
}

#[derive(Deserialize)]
struct NodeUpdate {
    #[serde(default)]
    node_id: Option<String>,
    #[serde(default)]
    load_test_results: Option<String>,
}

#[derive(Deserialize)]
struct RawOutcome {
    #[serde(rename = "isSuccess", default)]
    is_success: Value,
    #[serde(rename = "latencyMs", default)]
    latency_ms: Value,
    #[serde(rename = "statusCode", default)]
    status_code: Value,
    #[serde(default)]
    response: Value,
}

/// Résultat du décodage d'un lot node_updates complet
#[derive(Debug, Default)]
pub struct DecodedBatch {
    pub records: Vec<OutcomeRecord>,
    pub nodes_seen: usize,
    pub nodes_rejected: usize,
    pub outcomes_skipped: usize,
}

/// Résultat pour un seul node
#[derive(Debug, Default)]
pub struct NodeResults {
    pub records: Vec<OutcomeRecord>,
    pub skipped: usize,
}

/// Décode le champ node_updates d'un heartbeat actif en outcome records
/// rattachés à `load_test_id`.
pub fn decode_node_updates(load_test_id: &str, node_updates: &str) -> DecodedBatch {
    let mut batch = DecodedBatch::default();
    if node_updates.trim().is_empty() {
        return batch;
    }

    let updates = match serde_json::from_str::<Value>(node_updates) {
        Ok(updates) => updates,
        Err(e) => {
            tracing::warn!(load_test_id, error = %DecodeError::NodeUpdates(e), "dropping node_updates batch");
            return batch;
        }
    };

    // chaque node est validé séparément : une entrée invalide ne coûte que ses résultats
    let mut entries: Vec<(Option<String>, Value)> = Vec::new();
    match updates {
        Value::Object(by_node) => {
            for (node_id, values) in by_node {
                match values {
                    Value::Array(values) => {
                        entries.extend(values.into_iter().map(|v| (Some(node_id.clone()), v)));
                    }
                    _ => {
                        batch.nodes_seen += 1;
                        batch.nodes_rejected += 1;
                        tracing::warn!(load_test_id, error = %DecodeError::NotAnArray(node_id), "skipping node results");
                    }
                }
            }
        }
        Value::Array(values) => entries.extend(values.into_iter().map(|v| (None, v))),
        _ => {
            tracing::warn!(load_test_id, "node_updates is neither an object nor an array, dropping batch");
            return batch;
        }
    }

    for (key_node_id, value) in entries {
        batch.nodes_seen += 1;
        match decode_node_update(load_test_id, key_node_id, value) {
            Ok(node) => {
                batch.outcomes_skipped += node.skipped;
                batch.records.extend(node.records);
            }
            Err(e) => {
                batch.nodes_rejected += 1;
                tracing::warn!(load_test_id, error = %e, "skipping node results");
            }
        }
    }

    batch
}

fn decode_node_update(
    load_test_id: &str,
    key_node_id: Option<String>,
    value: Value,
) -> Result<NodeResults, DecodeError> {
    if !value.is_object() {
        return Err(DecodeError::NotAnObject("node update"));
    }
    let update: NodeUpdate = serde_json::from_value(value).map_err(DecodeError::NodeUpdate)?;
    let node_id = update.node_id.or(key_node_id);
    match update.load_test_results {
        Some(encoded) => decode_node_results(load_test_id, node_id.as_deref(), &encoded),
        None => Ok(NodeResults::default()),
    }
}

/// Décode le champ load_test_results d'un node (base64 → [string] → objets)
pub fn decode_node_results(
    load_test_id: &str,
    node_id: Option<&str>,
    encoded: &str,
) -> Result<NodeResults, DecodeError> {
    let encoded = encoded.trim();
    if encoded.is_empty() {
        return Ok(NodeResults::default());
    }

    let bytes = RESULTS_ENGINE.decode(encoded)?;
    let lines: Vec<String> = serde_json::from_slice(&bytes).map_err(DecodeError::ResultList)?;

    let recorded_at = OffsetDateTime::now_utc();
    let mut results = NodeResults::default();
    for line in lines {
        match parse_outcome(&line) {
            Ok(raw) => results.records.push(OutcomeRecord {
                id: Uuid::new_v4().to_string(),
                load_test_id: load_test_id.to_string(),
                node_id: node_id.map(str::to_string),
                is_success: coerce_bool(&raw.is_success),
                latency_ms: coerce_latency_ms(&raw.latency_ms),
                status_code: coerce_status_code(&raw.status_code),
                response: coerce_text(raw.response),
                recorded_at,
            }),
            Err(e) => {
                results.skipped += 1;
                tracing::debug!(load_test_id, ?node_id, error = %e, "skipping malformed outcome");
            }
        }
    }
    Ok(results)
}

fn parse_outcome(line: &str) -> Result<RawOutcome, DecodeError> {
    let value: Value = serde_json::from_str(line).map_err(DecodeError::Outcome)?;
    if !value.is_object() {
        return Err(DecodeError::NotAnObject("outcome"));
    }
    serde_json::from_value(value).map_err(DecodeError::Outcome)
}

fn coerce_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s.trim().eq_ignore_ascii_case("true"),
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => false,
    }
}

fn coerce_latency_ms(value: &Value) -> u64 {
    let raw = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match raw {
        Some(ms) if ms.is_finite() && ms >= 0.0 => ms.trunc() as u64,
        _ => 0,
    }
}

/// Gardé tel que reçu : "timeout" et "ECONNRESET" restent distincts
fn coerce_status_code(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

fn coerce_text(value: Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s,
        other => other.to_string(),
    }
}
