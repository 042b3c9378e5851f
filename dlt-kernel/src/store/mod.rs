/**
 * STORE - Contrat de persistance du control plane
 *
 * RÔLE :
 * Définit les opérations dont le pipeline heartbeat et l'API admin ont besoin
 * sur les node groups, load tests, outcome records et summaries.
 *
 * FONCTIONNEMENT :
 * - Store trait = interface commune (CRUD + requêtes par load test id)
 * - JsonStore = implémentation mémoire avec snapshot JSON optionnel
 * - bounded() = borne chaque appel par un timeout (point ou scan)
 *
 * Les ids inconnus ne sont pas des erreurs : Ok(None) / Ok(false), l'appelant
 * décide (heartbeat tardif = log + ignore).
 */

mod json;

pub use json::JsonStore;

use crate::error::StoreError;
use crate::models::{
    LoadTest, LoadTestPatch, LoadTestStatus, LoadTestSummary, NewLoadTest, NewNodeGroup, NodeGroup,
    NodeGroupPatch, OutcomeRecord,
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

pub type SharedStore = Arc<dyn Store>;

#[async_trait]
pub trait Store: Send + Sync {
    async fn create_node_group(&self, new: NewNodeGroup) -> Result<NodeGroup, StoreError>;
    async fn get_node_group(&self, id: &str) -> Result<Option<NodeGroup>, StoreError>;
    async fn update_node_group(
        &self,
        id: &str,
        patch: NodeGroupPatch,
    ) -> Result<Option<NodeGroup>, StoreError>;
    async fn delete_node_group(&self, id: &str) -> Result<bool, StoreError>;
    async fn list_node_groups(&self) -> Result<Vec<NodeGroup>, StoreError>;
    /// Met à jour is_healthy + last_health_time. Retourne false si l'id est inconnu.
    async fn update_node_group_health(
        &self,
        id: &str,
        is_healthy: bool,
        at: OffsetDateTime,
    ) -> Result<bool, StoreError>;

    async fn create_load_test(&self, new: NewLoadTest) -> Result<LoadTest, StoreError>;
    async fn get_load_test(&self, id: &str) -> Result<Option<LoadTest>, StoreError>;
    async fn update_load_test(
        &self,
        id: &str,
        patch: LoadTestPatch,
    ) -> Result<Option<LoadTest>, StoreError>;
    /// Transition de statut vers l'avant uniquement, sinon InvalidTransition
    async fn update_load_test_status(
        &self,
        id: &str,
        status: LoadTestStatus,
        end_time: Option<OffsetDateTime>,
    ) -> Result<Option<LoadTest>, StoreError>;
    async fn delete_load_test(&self, id: &str) -> Result<bool, StoreError>;
    async fn list_load_tests(&self) -> Result<Vec<LoadTest>, StoreError>;

    async fn insert_outcomes(&self, records: Vec<OutcomeRecord>) -> Result<usize, StoreError>;
    /// Outcome records d'un load test, dans l'ordre d'insertion
    fn stream_outcomes<'a>(
        &'a self,
        load_test_id: &'a str,
    ) -> BoxStream<'a, Result<OutcomeRecord, StoreError>>;

    /// Échoue avec SummaryExists si un summary existe déjà pour ce load test
    async fn insert_summary(&self, summary: LoadTestSummary)
        -> Result<LoadTestSummary, StoreError>;
    async fn get_summary(&self, load_test_id: &str)
        -> Result<Option<LoadTestSummary>, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreTimeouts {
    pub point: Duration,
    pub scan: Duration,
}

impl Default for StoreTimeouts {
    fn default() -> Self {
        Self {
            point: Duration::from_secs(10),
            scan: Duration::from_secs(60),
        }
    }
}

/// Borne une opération store ; un dépassement devient StoreError::Timeout
pub async fn bounded<T, F>(operation: &'static str, limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout { operation, limit }),
    }
}
