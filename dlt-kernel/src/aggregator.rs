/**
 * RESULT AGGREGATOR - Outcome records → LoadTestSummary
 *
 * FONCTIONNEMENT :
 * - Lit les outcome records d'un load test en stream (mémoire bornée)
 * - Accumule total / succès / échecs / somme des latences / top failures
 * - Compose le summary avec les paramètres du load test et le persiste
 *
 * Un seul summary par load test : si un summary existe déjà il est renvoyé
 * tel quel. La sérialisation des finalisations concurrentes est faite par le
 * router (verrou par load test id).
 */

use futures::StreamExt;
use std::collections::BTreeMap;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{KernelError, KernelResult, StoreError};
use crate::models::{LoadTest, LoadTestSummary, OutcomeRecord};
use crate::store::{bounded, SharedStore, StoreTimeouts};

#[derive(Debug, Default, Clone)]
pub struct SummaryAccumulator {
    total: u64,
    success: u64,
    failure: u64,
    latency_sum_ms: u128,
    top_failures: BTreeMap<String, String>,
}

impl SummaryAccumulator {
    pub fn record(&mut self, outcome: &OutcomeRecord) {
        self.total = self.total.saturating_add(1);
        self.latency_sum_ms = self
            .latency_sum_ms
            .saturating_add(u128::from(outcome.latency_ms));
        if outcome.is_success {
            self.success = self.success.saturating_add(1);
        } else {
            self.failure = self.failure.saturating_add(1);
            // dernière réponse vue pour ce code
            self.top_failures
                .insert(outcome.status_code.clone(), outcome.response.clone());
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Fraction de succès dans [0, 1], 0 sans requêtes
    pub fn success_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.success as f64 / self.total as f64
    }

    pub fn avg_latency_ms(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.latency_sum_ms as f64 / self.total as f64
    }

    pub fn into_summary(self, load_test: &LoadTest, created_at: OffsetDateTime) -> LoadTestSummary {
        let success_percent = self.success_percent();
        let avg_latency_ms = self.avg_latency_ms();
        LoadTestSummary {
            id: Uuid::new_v4().to_string(),
            load_test_id: load_test.id.clone(),
            start_time: load_test.start_time,
            end_time: load_test.end_time,
            duration: load_test.duration,
            tps: load_test.tps,
            total_requests: self.total,
            success_count: self.success,
            failure_count: self.failure,
            success_percent,
            avg_latency_ms,
            top_failures: self.top_failures,
            created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Summarized {
    Created(LoadTestSummary),
    /// Un summary existait déjà, rien n'a été écrit
    Existing(LoadTestSummary),
}

impl Summarized {
    pub fn summary(&self) -> &LoadTestSummary {
        match self {
            Summarized::Created(summary) | Summarized::Existing(summary) => summary,
        }
    }
}

#[derive(Clone)]
pub struct ResultAggregator {
    store: SharedStore,
    timeouts: StoreTimeouts,
}

impl ResultAggregator {
    pub fn new(store: SharedStore, timeouts: StoreTimeouts) -> Self {
        Self { store, timeouts }
    }

    /// Parcourt les outcome records du load test en stream
    pub async fn accumulate(&self, load_test_id: &str) -> Result<SummaryAccumulator, StoreError> {
        bounded("stream_outcomes", self.timeouts.scan, async {
            let mut acc = SummaryAccumulator::default();
            let mut outcomes = self.store.stream_outcomes(load_test_id);
            while let Some(outcome) = outcomes.next().await {
                acc.record(&outcome?);
            }
            Ok(acc)
        })
        .await
    }

    /// Summary calculé à la volée, non persisté (load test encore en cours)
    pub async fn preview(&self, load_test: &LoadTest) -> Result<LoadTestSummary, StoreError> {
        let acc = self.accumulate(&load_test.id).await?;
        Ok(acc.into_summary(load_test, OffsetDateTime::now_utc()))
    }

    /// Consolide les résultats d'un load test et persiste le summary (une seule fois)
    pub async fn summarize(&self, load_test_id: &str) -> KernelResult<Summarized> {
        if let Some(existing) = self.existing(load_test_id).await? {
            return Ok(Summarized::Existing(existing));
        }

        let load_test = bounded(
            "get_load_test",
            self.timeouts.point,
            self.store.get_load_test(load_test_id),
        )
        .await?
        .ok_or_else(|| KernelError::NotFound {
            kind: "load test",
            id: load_test_id.to_string(),
        })?;

        let acc = self.accumulate(load_test_id).await?;
        let summary = acc.into_summary(&load_test, OffsetDateTime::now_utc());

        match bounded(
            "insert_summary",
            self.timeouts.point,
            self.store.insert_summary(summary),
        )
        .await
        {
            Ok(created) => {
                tracing::info!(
                    load_test_id,
                    total = created.total_requests,
                    success = created.success_count,
                    failure = created.failure_count,
                    avg_latency_ms = created.avg_latency_ms,
                    "load test summary created"
                );
                Ok(Summarized::Created(created))
            }
            Err(StoreError::SummaryExists(_)) => {
                let existing = self.existing(load_test_id).await?.ok_or_else(|| {
                    KernelError::NotFound {
                        kind: "summary",
                        id: load_test_id.to_string(),
                    }
                })?;
                Ok(Summarized::Existing(existing))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn existing(&self, load_test_id: &str) -> Result<Option<LoadTestSummary>, StoreError> {
        bounded(
            "get_summary",
            self.timeouts.point,
            self.store.get_summary(load_test_id),
        )
        .await
    }
}
