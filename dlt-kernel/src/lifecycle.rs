/**
 * LOAD TEST LIFECYCLE - created → running → complete
 *
 * RÔLE :
 * - Heartbeat actif : décode les résultats des nodes et les persiste pour le
 *   load test référencé ; le premier passe le test en running
 * - Finalisation : running → complete + end_time, puis agrégation (une fois).
 *   Un test encore created n'a jamais démarré : il n'est pas touché
 *
 * Ne choisit pas QUEL test finaliser : c'est le router qui résout l'id et
 * sérialise les finalisations concurrentes d'un même test.
 */

use time::OffsetDateTime;

use crate::aggregator::{ResultAggregator, Summarized};
use crate::decoder::decode_node_updates;
use crate::error::{KernelResult, StoreError};
use crate::models::{LoadTest, LoadTestStatus};
use crate::store::{bounded, SharedStore, StoreTimeouts};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded {
        records: usize,
        nodes_rejected: usize,
        outcomes_skipped: usize,
    },
    /// Load test inconnu : message tardif ou id invalide
    UnknownLoadTest,
    /// Résultats arrivés après la finalisation, ignorés
    AlreadyComplete,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FinalizeOutcome {
    Completed(Summarized),
    /// Le test était déjà complete ; aucun second summary n'est écrit
    AlreadyComplete(Summarized),
    /// Test encore created : aucun node ne l'a exécuté, rien n'est écrit
    NotStarted,
    UnknownLoadTest,
}

#[derive(Clone)]
pub struct LifecycleController {
    store: SharedStore,
    timeouts: StoreTimeouts,
    aggregator: ResultAggregator,
}

impl LifecycleController {
    pub fn new(store: SharedStore, timeouts: StoreTimeouts, aggregator: ResultAggregator) -> Self {
        Self {
            store,
            timeouts,
            aggregator,
        }
    }

    async fn load(&self, load_test_id: &str) -> Result<Option<LoadTest>, StoreError> {
        bounded(
            "get_load_test",
            self.timeouts.point,
            self.store.get_load_test(load_test_id),
        )
        .await
    }

    /// Persiste les résultats d'un heartbeat actif pour `load_test_id`
    pub async fn record_results(
        &self,
        load_test_id: &str,
        node_updates: Option<&str>,
    ) -> KernelResult<RecordOutcome> {
        let Some(load_test) = self.load(load_test_id).await? else {
            tracing::warn!(load_test_id, "results for unknown load test, dropping");
            return Ok(RecordOutcome::UnknownLoadTest);
        };

        match load_test.status {
            LoadTestStatus::Complete => {
                tracing::warn!(load_test_id, "results after completion, dropping");
                return Ok(RecordOutcome::AlreadyComplete);
            }
            LoadTestStatus::Created => self.mark_running(load_test_id).await?,
            LoadTestStatus::Running => {}
        }

        let Some(node_updates) = node_updates else {
            return Ok(RecordOutcome::Recorded {
                records: 0,
                nodes_rejected: 0,
                outcomes_skipped: 0,
            });
        };

        let batch = decode_node_updates(load_test_id, node_updates);
        let nodes_rejected = batch.nodes_rejected;
        let outcomes_skipped = batch.outcomes_skipped;
        let records = bounded(
            "insert_outcomes",
            self.timeouts.point,
            self.store.insert_outcomes(batch.records),
        )
        .await?;

        tracing::debug!(load_test_id, records, nodes_rejected, outcomes_skipped, "results recorded");
        Ok(RecordOutcome::Recorded {
            records,
            nodes_rejected,
            outcomes_skipped,
        })
    }

    async fn mark_running(&self, load_test_id: &str) -> Result<(), StoreError> {
        let result = bounded(
            "update_load_test_status",
            self.timeouts.point,
            self.store
                .update_load_test_status(load_test_id, LoadTestStatus::Running, None),
        )
        .await;
        match result {
            Ok(_) => {
                tracing::info!(load_test_id, "load test running");
                Ok(())
            }
            // un autre heartbeat l'a déjà fait avancer
            Err(StoreError::InvalidTransition { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Passe un test running en complete puis produit son summary
    pub async fn finalize(&self, load_test_id: &str) -> KernelResult<FinalizeOutcome> {
        let Some(load_test) = self.load(load_test_id).await? else {
            tracing::warn!(load_test_id, "finalize for unknown load test, ignoring");
            return Ok(FinalizeOutcome::UnknownLoadTest);
        };

        if load_test.status == LoadTestStatus::Complete {
            let summarized = self.aggregator.summarize(load_test_id).await?;
            if matches!(summarized, Summarized::Created(_)) {
                tracing::warn!(load_test_id, "summary was missing for complete load test, recovered");
            }
            return Ok(FinalizeOutcome::AlreadyComplete(summarized));
        }
        if load_test.status == LoadTestStatus::Created {
            tracing::warn!(load_test_id, "finalize for load test that never ran, ignoring");
            return Ok(FinalizeOutcome::NotStarted);
        }

        bounded(
            "update_load_test_status",
            self.timeouts.point,
            self.store.update_load_test_status(
                load_test_id,
                LoadTestStatus::Complete,
                Some(OffsetDateTime::now_utc()),
            ),
        )
        .await?;
        tracing::info!(load_test_id, "load test complete");

        let summarized = self.aggregator.summarize(load_test_id).await?;
        Ok(FinalizeOutcome::Completed(summarized))
    }
}
