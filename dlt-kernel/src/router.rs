/**
 * HEARTBEAT ROUTER - Point d'entrée de chaque heartbeat MQTT
 *
 * ORDRE FIXE pour "ng_update" :
 * 1. Health tracker (toujours)
 * 2. Heartbeat actif   → lifecycle.record_results(load_test_id)
 *    Heartbeat inactif → lifecycle.finalize(id résolu) → aggregator
 *
 * ÉTAT PARTAGÉ :
 * - active_by_group : node group → dernier load test actif qu'il a signalé.
 *   Un heartbeat inactif sans load_test_id finalise uniquement le test de
 *   SON sender, jamais celui d'un autre groupe. L'entrée n'est retirée
 *   qu'après une finalisation réussie : un échec est retenté au heartbeat
 *   inactif suivant.
 * - finalize_locks : un verrou async par load test id, les finalisations d'un
 *   même test sont sérialisées, celles de tests différents restent parallèles.
 *
 * Aucune erreur ne remonte : tout est loggé et compté, le process continue.
 */

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::HeartbeatError;
use crate::health::{HealthUpdate, NodeGroupHealthTracker};
use crate::lifecycle::{FinalizeOutcome, LifecycleController, RecordOutcome};
use crate::models::{Heartbeat, NG_UPDATE_ACTION};

#[derive(Debug, Default)]
pub struct RouterStats {
    processed: AtomicU64,
    ignored: AtomicU64,
    rejected: AtomicU64,
}

impl RouterStats {
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn ignored(&self) -> u64 {
        self.ignored.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    /// Action inconnue, ignorée sans erreur
    Ignored,
    Rejected,
    Recorded(Option<RecordOutcome>),
    Finalized(FinalizeOutcome),
    /// Heartbeat inactif sans test actif suivi pour ce sender
    NothingToFinalize,
    /// Erreur store/agrégation pendant la finalisation, loggée
    FinalizeFailed,
}

pub struct HeartbeatRouter {
    health: NodeGroupHealthTracker,
    lifecycle: LifecycleController,
    active_by_group: Mutex<HashMap<String, String>>,
    finalize_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    stats: RouterStats,
}

pub type SharedRouter = Arc<HeartbeatRouter>;

impl HeartbeatRouter {
    pub fn new(health: NodeGroupHealthTracker, lifecycle: LifecycleController) -> Self {
        Self {
            health,
            lifecycle,
            active_by_group: Mutex::new(HashMap::new()),
            finalize_locks: Mutex::new(HashMap::new()),
            stats: RouterStats::default(),
        }
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    /// Load tests actuellement signalés actifs par au moins un node group
    pub fn in_flight(&self) -> Vec<String> {
        let active = self.active_by_group.lock();
        let ids: HashSet<&String> = active.values().collect();
        let mut ids: Vec<String> = ids.into_iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Dernier load test actif signalé par ce node group
    pub fn last_active_for(&self, node_group_id: &str) -> Option<String> {
        self.active_by_group.lock().get(node_group_id).cloned()
    }

    /// Traite un payload brut tel que reçu du transport
    pub async fn handle_payload(&self, payload: &[u8]) -> RouteOutcome {
        match parse_heartbeat(payload) {
            Ok(heartbeat) => self.handle(heartbeat).await,
            Err(e) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, bytes = payload.len(), "rejecting heartbeat payload");
                RouteOutcome::Rejected
            }
        }
    }

    pub async fn handle(&self, heartbeat: Heartbeat) -> RouteOutcome {
        if heartbeat.action != NG_UPDATE_ACTION {
            self.stats.ignored.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(action = %heartbeat.action, "ignoring heartbeat action");
            return RouteOutcome::Ignored;
        }
        if heartbeat.node_group_id.trim().is_empty() {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(error = %HeartbeatError::MissingNodeGroupId, "rejecting heartbeat");
            return RouteOutcome::Rejected;
        }

        tracing::debug!(
            ng_id = %heartbeat.node_group_id,
            active = heartbeat.is_load_test_active,
            "processing ng_update"
        );

        let ng_id = heartbeat.node_group_id.clone();
        let is_healthy = heartbeat.is_healthy();
        match self.health.record(&ng_id, is_healthy, heartbeat.nodes.clone()).await {
            Ok(HealthUpdate::Updated { .. }) | Ok(HealthUpdate::UnknownNodeGroup) => {}
            Err(e) => tracing::error!(ng_id = %ng_id, error = %e, "node group health update failed"),
        }

        let outcome = if heartbeat.is_load_test_active {
            self.on_active(&ng_id, &heartbeat).await
        } else {
            self.on_inactive(&ng_id, &heartbeat).await
        };
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    async fn on_active(&self, ng_id: &str, heartbeat: &Heartbeat) -> RouteOutcome {
        let Some(load_test_id) = heartbeat.load_test_id() else {
            tracing::warn!(ng_id, "active heartbeat without load_test_id, results dropped");
            return RouteOutcome::Recorded(None);
        };

        self.active_by_group
            .lock()
            .insert(ng_id.to_string(), load_test_id.to_string());

        match self
            .lifecycle
            .record_results(load_test_id, heartbeat.node_updates.as_deref())
            .await
        {
            Ok(record) => {
                if matches!(record, RecordOutcome::UnknownLoadTest | RecordOutcome::AlreadyComplete) {
                    self.forget_group(ng_id, load_test_id);
                }
                RouteOutcome::Recorded(Some(record))
            }
            Err(e) => {
                tracing::error!(ng_id, load_test_id, error = %e, "recording results failed");
                RouteOutcome::Recorded(None)
            }
        }
    }

    async fn on_inactive(&self, ng_id: &str, heartbeat: &Heartbeat) -> RouteOutcome {
        let tracked = self.last_active_for(ng_id);
        let Some(load_test_id) = heartbeat.load_test_id().map(str::to_string).or(tracked) else {
            tracing::debug!(ng_id, "inactive heartbeat, nothing to finalize");
            return RouteOutcome::NothingToFinalize;
        };

        let lock = self.finalize_lock(&load_test_id);
        let outcome = {
            let _guard = lock.lock().await;
            match self.lifecycle.finalize(&load_test_id).await {
                Ok(finalized) => {
                    self.forget_group(ng_id, &load_test_id);
                    RouteOutcome::Finalized(finalized)
                }
                Err(e) => {
                    tracing::error!(ng_id, load_test_id = %load_test_id, error = %e, "finalize failed, kept for retry");
                    RouteOutcome::FinalizeFailed
                }
            }
        };
        self.release_finalize_lock(&load_test_id, lock);
        outcome
    }

    fn forget_group(&self, ng_id: &str, load_test_id: &str) {
        let mut active = self.active_by_group.lock();
        if active.get(ng_id).map(String::as_str) == Some(load_test_id) {
            active.remove(ng_id);
        }
    }

    fn finalize_lock(&self, load_test_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.finalize_locks
            .lock()
            .entry(load_test_id.to_string())
            .or_default()
            .clone()
    }

    fn release_finalize_lock(&self, load_test_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.finalize_locks.lock();
        // 2 = la map + notre clone : personne d'autre n'attend ce verrou
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(load_test_id);
        }
    }
}

fn parse_heartbeat(payload: &[u8]) -> Result<Heartbeat, HeartbeatError> {
    let text = std::str::from_utf8(payload)?;
    Ok(serde_json::from_str(text)?)
}
