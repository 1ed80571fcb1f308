//! Anomaly detection client.

use super::client::{
    note_fallback, MlError, MlHttpClient, MlTransaction, ResultSource, TrainResponse,
    TrainingOutcome, TrainingStatus,
};
use super::config_store::{keys, CategoryConfig, MlConfigCategory, MlConfigStore};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

const CATEGORY: MlConfigCategory = MlConfigCategory::Anomaly;
const SERVICE: &str = "anomaly";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub transaction_id: Uuid,
    /// In `[0, 1]`.
    pub score: f64,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyReport {
    pub anomalies: Vec<Anomaly>,
    pub source: ResultSource,
}

#[derive(Serialize)]
struct DetectRequest<'a> {
    company_id: Uuid,
    sensitivity: f64,
    transactions: &'a [MlTransaction],
}

#[derive(Deserialize)]
struct DetectResponse {
    #[serde(default)]
    anomalies: Vec<RawAnomaly>,
}

#[derive(Deserialize)]
struct RawAnomaly {
    transaction_id: Uuid,
    score: f64,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Serialize)]
struct TrainRequest<'a> {
    company_id: Uuid,
    transactions: &'a [MlTransaction],
}

#[derive(Clone)]
pub struct AnomalyClient {
    http: MlHttpClient,
    store: Arc<MlConfigStore>,
}

impl AnomalyClient {
    pub fn new(http: MlHttpClient, store: Arc<MlConfigStore>) -> Self {
        Self { http, store }
    }

    pub async fn config(&self) -> Arc<CategoryConfig> {
        self.store.get(CATEGORY).await
    }

    /// Score `transactions`; only those at or above `score_threshold` are
    /// returned, highest first.
    #[tracing::instrument(skip(self, transactions), fields(count = transactions.len()))]
    pub async fn detect(
        &self,
        company_id: Uuid,
        transactions: &[MlTransaction],
    ) -> Result<AnomalyReport, MlError> {
        let fallback = AnomalyReport {
            anomalies: Vec::new(),
            source: ResultSource::Fallback,
        };

        let config = self.config().await;
        if !config.enabled() {
            note_fallback(SERVICE, &MlError::Disabled);
            return Ok(fallback);
        }
        if transactions.is_empty() {
            return Ok(AnomalyReport {
                anomalies: Vec::new(),
                source: ResultSource::Model,
            });
        }

        let url = format!("{}/detect", config.service_url());
        let request = DetectRequest {
            company_id,
            sensitivity: config.get_f64(keys::SENSITIVITY),
            transactions,
        };

        match self
            .http
            .post_json::<_, DetectResponse>(SERVICE, &url, &request, config.timeout())
            .await
        {
            Ok(response) => Ok(AnomalyReport {
                anomalies: shape_anomalies(
                    transactions,
                    response.anomalies,
                    config.get_f64(keys::SCORE_THRESHOLD),
                ),
                source: ResultSource::Model,
            }),
            Err(e) if e.is_fallback() => {
                note_fallback(SERVICE, &e);
                Ok(fallback)
            }
            Err(e) => Err(e),
        }
    }

    #[tracing::instrument(skip(self, transactions), fields(count = transactions.len()))]
    pub async fn train(
        &self,
        company_id: Uuid,
        transactions: &[MlTransaction],
    ) -> Result<TrainingOutcome, MlError> {
        let config = self.config().await;
        if !config.enabled() {
            return Ok(TrainingOutcome::without_call(
                TrainingStatus::Disabled,
                transactions.len(),
            ));
        }
        if transactions.is_empty() {
            return Ok(TrainingOutcome::without_call(TrainingStatus::Skipped, 0));
        }

        let url = format!("{}/train", config.service_url());
        let request = TrainRequest {
            company_id,
            transactions,
        };
        match self
            .http
            .post_json::<_, TrainResponse>(SERVICE, &url, &request, config.timeout())
            .await
        {
            Ok(response) => Ok(TrainingOutcome {
                status: TrainingStatus::Trained,
                samples: transactions.len(),
                model_version: response.model_version,
            }),
            Err(e) if e.is_fallback() => {
                note_fallback(SERVICE, &e);
                Ok(TrainingOutcome::without_call(
                    TrainingStatus::Unavailable,
                    transactions.len(),
                ))
            }
            Err(e) => Err(e),
        }
    }
}

fn shape_anomalies(sent: &[MlTransaction], raw: Vec<RawAnomaly>, threshold: f64) -> Vec<Anomaly> {
    let known: HashSet<Uuid> = sent.iter().map(|t| t.id).collect();
    let mut seen = HashSet::new();

    let mut anomalies: Vec<Anomaly> = raw
        .into_iter()
        .filter(|a| a.score.is_finite() && known.contains(&a.transaction_id))
        .map(|a| Anomaly {
            transaction_id: a.transaction_id,
            score: a.score.clamp(0.0, 1.0),
            reason: a.reason,
        })
        .filter(|a| a.score >= threshold)
        .filter(|a| seen.insert(a.transaction_id))
        .collect();

    anomalies.sort_by(|a, b| b.score.total_cmp(&a.score));
    anomalies
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn txn(id: Uuid) -> MlTransaction {
        MlTransaction {
            id,
            account_id: Uuid::new_v4(),
            category_id: None,
            kind: "debit".into(),
            amount: 9_999.0,
            description: "Wire transfer".into(),
            occurred_on: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
        }
    }

    fn raw(id: Uuid, score: f64) -> RawAnomaly {
        RawAnomaly {
            transaction_id: id,
            score,
            reason: None,
        }
    }

    #[test]
    fn scores_are_clamped_filtered_and_sorted() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let sent = [txn(a), txn(b), txn(c)];

        let shaped = shape_anomalies(
            &sent,
            vec![raw(a, 0.85), raw(b, 1.7), raw(c, 0.2)],
            0.8,
        );

        assert_eq!(shaped.len(), 2);
        assert_eq!(shaped[0].transaction_id, b);
        assert_eq!(shaped[0].score, 1.0);
        assert_eq!(shaped[1].transaction_id, a);
    }

    #[test]
    fn unknown_ids_and_nan_scores_are_ignored() {
        let a = Uuid::new_v4();
        let shaped = shape_anomalies(
            &[txn(a)],
            vec![raw(Uuid::new_v4(), 0.99), raw(a, f64::NAN)],
            0.5,
        );
        assert!(shaped.is_empty());
    }
}
