/**
 * JSON STORE - Persistance mémoire + snapshot fichier
 *
 * FONCTIONNEMENT :
 * - Toutes les collections vivent en mémoire derrière un parking_lot::Mutex
 * - Si data_file est fourni : snapshot JSON (node groups, load tests,
 *   summaries) après chaque mutation, rechargé au démarrage
 * - Outcomes : journal append-only à côté du snapshot (une ligne JSON par
 *   record), compacté seulement quand un load test est supprimé
 * - Outcomes indexés par load_test_id pour la lecture en stream
 */

use super::Store;
use crate::error::StoreError;
use crate::models::{
    LoadTest, LoadTestPatch, LoadTestStatus, LoadTestSummary, NewLoadTest, NewNodeGroup, NodeGroup,
    NodeGroupPatch, OutcomeRecord,
};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Collections {
    #[serde(default)]
    node_groups: BTreeMap<String, NodeGroup>,
    #[serde(default)]
    load_tests: BTreeMap<String, LoadTest>,
    /// Anciens snapshots : les outcomes y étaient inclus
    #[serde(default, skip_serializing)]
    outcomes: HashMap<String, Vec<OutcomeRecord>>,
    #[serde(default)]
    summaries: HashMap<String, LoadTestSummary>,
}

pub struct JsonStore {
    collections: Mutex<Collections>,
    data_file: Option<PathBuf>,
    /// Sérialise les écritures disque : le dernier writer écrit l'état le plus récent
    persist_lock: tokio::sync::Mutex<()>,
}

impl JsonStore {
    /// Store purement mémoire (tests, mode éphémère)
    pub fn in_memory() -> Self {
        Self {
            collections: Mutex::new(Collections::default()),
            data_file: None,
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Ouvre (ou crée) un store adossé à un fichier JSON
    pub async fn open<P: AsRef<Path>>(data_file: P) -> Result<Self, StoreError> {
        let path = data_file.as_ref().to_path_buf();
        let mut collections: Collections = if path.exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            if content.trim().is_empty() {
                Collections::default()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            Collections::default()
        };

        let log = outcome_log_path(&path);
        let legacy = !collections.outcomes.is_empty();
        if log.exists() {
            let content = tokio::fs::read_to_string(&log).await?;
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<OutcomeRecord>(line) {
                    Ok(record) => collections
                        .outcomes
                        .entry(record.load_test_id.clone())
                        .or_default()
                        .push(record),
                    // dernière ligne tronquée par un arrêt brutal
                    Err(e) => tracing::warn!(path = %log.display(), error = %e, "skipping unreadable outcome line"),
                }
            }
        }
        let Collections { load_tests, outcomes, .. } = &mut collections;
        outcomes.retain(|load_test_id, _| load_tests.contains_key(load_test_id));

        tracing::info!(
            path = %path.display(),
            node_groups = collections.node_groups.len(),
            load_tests = collections.load_tests.len(),
            outcomes = collections.outcomes.values().map(Vec::len).sum::<usize>(),
            summaries = collections.summaries.len(),
            "store loaded"
        );

        let store = Self {
            collections: Mutex::new(collections),
            data_file: Some(path),
            persist_lock: tokio::sync::Mutex::new(()),
        };
        if legacy {
            // migre les outcomes hors du snapshot
            store.compact_outcome_log().await?;
            store.persist().await?;
        }
        Ok(store)
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let Some(path) = &self.data_file else {
            return Ok(());
        };
        let _guard = self.persist_lock.lock().await;
        let content = {
            let collections = self.collections.lock();
            serde_json::to_string(&*collections)?
        };
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Ajoute les records au journal, sans réécrire l'existant
    async fn append_outcomes(&self, lines: String) -> Result<(), StoreError> {
        let Some(path) = &self.data_file else {
            return Ok(());
        };
        let _guard = self.persist_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(outcome_log_path(path))
            .await?;
        file.write_all(lines.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Réécrit le journal depuis la mémoire (après suppression d'un load test)
    async fn compact_outcome_log(&self) -> Result<(), StoreError> {
        let Some(path) = &self.data_file else {
            return Ok(());
        };
        let _guard = self.persist_lock.lock().await;
        let content = {
            let collections = self.collections.lock();
            encode_lines(collections.outcomes.values().flatten())?
        };
        let log = outcome_log_path(path);
        let tmp = log.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &log).await?;
        Ok(())
    }
}

fn outcome_log_path(data_file: &Path) -> PathBuf {
    data_file.with_extension("outcomes.jsonl")
}

fn encode_lines<'a>(records: impl Iterator<Item = &'a OutcomeRecord>) -> Result<String, StoreError> {
    let mut lines = String::new();
    for record in records {
        lines.push_str(&serde_json::to_string(record)?);
        lines.push('\n');
    }
    Ok(lines)
}

#[async_trait]
impl Store for JsonStore {
    async fn create_node_group(&self, new: NewNodeGroup) -> Result<NodeGroup, StoreError> {
        let node_group = NodeGroup {
            id: Uuid::new_v4().to_string(),
            nodes: new.nodes,
            topic: new.topic,
            is_healthy: false,
            last_health_check: OffsetDateTime::now_utc(),
        };
        self.collections
            .lock()
            .node_groups
            .insert(node_group.id.clone(), node_group.clone());
        self.persist().await?;
        Ok(node_group)
    }

    async fn get_node_group(&self, id: &str) -> Result<Option<NodeGroup>, StoreError> {
        Ok(self.collections.lock().node_groups.get(id).cloned())
    }

    async fn update_node_group(
        &self,
        id: &str,
        patch: NodeGroupPatch,
    ) -> Result<Option<NodeGroup>, StoreError> {
        let updated = {
            let mut collections = self.collections.lock();
            let Some(node_group) = collections.node_groups.get_mut(id) else {
                return Ok(None);
            };
            if let Some(nodes) = patch.nodes {
                node_group.nodes = nodes;
            }
            if let Some(is_healthy) = patch.is_healthy {
                node_group.is_healthy = is_healthy;
            }
            node_group.clone()
        };
        self.persist().await?;
        Ok(Some(updated))
    }

    async fn delete_node_group(&self, id: &str) -> Result<bool, StoreError> {
        let removed = self.collections.lock().node_groups.remove(id).is_some();
        if removed {
            self.persist().await?;
        }
        Ok(removed)
    }

    async fn list_node_groups(&self) -> Result<Vec<NodeGroup>, StoreError> {
        Ok(self.collections.lock().node_groups.values().cloned().collect())
    }

    async fn update_node_group_health(
        &self,
        id: &str,
        is_healthy: bool,
        at: OffsetDateTime,
    ) -> Result<bool, StoreError> {
        {
            let mut collections = self.collections.lock();
            let Some(node_group) = collections.node_groups.get_mut(id) else {
                return Ok(false);
            };
            node_group.is_healthy = is_healthy;
            node_group.last_health_check = at;
        }
        self.persist().await?;
        Ok(true)
    }

    async fn create_load_test(&self, new: NewLoadTest) -> Result<LoadTest, StoreError> {
        let load_test = LoadTest {
            id: Uuid::new_v4().to_string(),
            description: new.description,
            tps: new.tps,
            duration: new.duration,
            logic: new.logic,
            created_by: new.created_by,
            start_time: OffsetDateTime::now_utc(),
            end_time: None,
            status: LoadTestStatus::Created,
        };
        self.collections
            .lock()
            .load_tests
            .insert(load_test.id.clone(), load_test.clone());
        self.persist().await?;
        Ok(load_test)
    }

    async fn get_load_test(&self, id: &str) -> Result<Option<LoadTest>, StoreError> {
        Ok(self.collections.lock().load_tests.get(id).cloned())
    }

    async fn update_load_test(
        &self,
        id: &str,
        patch: LoadTestPatch,
    ) -> Result<Option<LoadTest>, StoreError> {
        let updated = {
            let mut collections = self.collections.lock();
            let Some(load_test) = collections.load_tests.get_mut(id) else {
                return Ok(None);
            };
            if let Some(description) = patch.description {
                load_test.description = description;
            }
            if let Some(created_by) = patch.created_by {
                load_test.created_by = created_by;
            }
            load_test.clone()
        };
        self.persist().await?;
        Ok(Some(updated))
    }

    async fn update_load_test_status(
        &self,
        id: &str,
        status: LoadTestStatus,
        end_time: Option<OffsetDateTime>,
    ) -> Result<Option<LoadTest>, StoreError> {
        let updated = {
            let mut collections = self.collections.lock();
            let Some(load_test) = collections.load_tests.get_mut(id) else {
                return Ok(None);
            };
            if !load_test.status.can_advance_to(status) {
                return Err(StoreError::InvalidTransition {
                    id: id.to_string(),
                    from: load_test.status,
                    to: status,
                });
            }
            load_test.status = status;
            if end_time.is_some() {
                load_test.end_time = end_time;
            }
            load_test.clone()
        };
        self.persist().await?;
        Ok(Some(updated))
    }

    async fn delete_load_test(&self, id: &str) -> Result<bool, StoreError> {
        let (removed, had_outcomes) = {
            let mut collections = self.collections.lock();
            let removed = collections.load_tests.remove(id).is_some();
            collections.summaries.remove(id);
            (removed, collections.outcomes.remove(id).is_some())
        };
        if removed {
            self.persist().await?;
        }
        if had_outcomes {
            self.compact_outcome_log().await?;
        }
        Ok(removed)
    }

    async fn list_load_tests(&self) -> Result<Vec<LoadTest>, StoreError> {
        let mut load_tests: Vec<LoadTest> =
            self.collections.lock().load_tests.values().cloned().collect();
        load_tests.sort_by_key(|lt| lt.start_time);
        Ok(load_tests)
    }

    async fn insert_outcomes(&self, records: Vec<OutcomeRecord>) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let count = records.len();
        let lines = match self.data_file {
            Some(_) => encode_lines(records.iter())?,
            None => String::new(),
        };
        {
            let mut collections = self.collections.lock();
            for record in records {
                collections
                    .outcomes
                    .entry(record.load_test_id.clone())
                    .or_default()
                    .push(record);
            }
        }
        self.append_outcomes(lines).await?;
        Ok(count)
    }

    fn stream_outcomes<'a>(
        &'a self,
        load_test_id: &'a str,
    ) -> BoxStream<'a, Result<OutcomeRecord, StoreError>> {
        // curseur : un record cloné à la fois, jamais la collection entière
        stream::unfold(0usize, move |cursor| async move {
            let record = self
                .collections
                .lock()
                .outcomes
                .get(load_test_id)
                .and_then(|records| records.get(cursor))
                .cloned()?;
            Some((Ok(record), cursor + 1))
        })
        .boxed()
    }

    async fn insert_summary(
        &self,
        summary: LoadTestSummary,
    ) -> Result<LoadTestSummary, StoreError> {
        {
            let mut collections = self.collections.lock();
            if collections.summaries.contains_key(&summary.load_test_id) {
                return Err(StoreError::SummaryExists(summary.load_test_id));
            }
            collections
                .summaries
                .insert(summary.load_test_id.clone(), summary.clone());
        }
        self.persist().await?;
        Ok(summary)
    }

    async fn get_summary(
        &self,
        load_test_id: &str,
    ) -> Result<Option<LoadTestSummary>, StoreError> {
        Ok(self.collections.lock().summaries.get(load_test_id).cloned())
    }
}
