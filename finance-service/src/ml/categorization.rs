//! Transaction categorization client.

use super::client::{
    note_fallback, MlError, MlHttpClient, MlTransaction, ResultSource, TrainResponse,
    TrainingOutcome, TrainingStatus,
};
use super::config_store::{keys, CategoryConfig, MlConfigCategory, MlConfigStore};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

const CATEGORY: MlConfigCategory = MlConfigCategory::Categorization;
const SERVICE: &str = "categorization";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorySuggestion {
    pub transaction_id: Uuid,
    pub category_id: Uuid,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Categorization {
    pub suggestions: Vec<CategorySuggestion>,
    pub source: ResultSource,
}

impl Categorization {
    fn fallback() -> Self {
        Self {
            suggestions: Vec::new(),
            source: ResultSource::Fallback,
        }
    }

    /// Highest-confidence suggestion for one transaction.
    pub fn best_for(&self, transaction_id: Uuid) -> Option<&CategorySuggestion> {
        self.suggestions
            .iter()
            .filter(|s| s.transaction_id == transaction_id)
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
    }
}

/// A labelled transaction used to train the categorizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSample {
    pub description: String,
    pub amount: f64,
    pub kind: String,
    pub category_id: Uuid,
}

#[derive(Serialize)]
struct CategorizeRequest<'a> {
    company_id: Uuid,
    transactions: &'a [MlTransaction],
}

#[derive(Deserialize)]
struct CategorizeResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Deserialize)]
struct Prediction {
    transaction_id: Uuid,
    category_id: Option<Uuid>,
    confidence: f64,
}

#[derive(Serialize)]
struct TrainRequest<'a> {
    company_id: Uuid,
    samples: &'a [TrainingSample],
}

#[derive(Clone)]
pub struct CategorizationClient {
    http: MlHttpClient,
    store: Arc<MlConfigStore>,
}

impl CategorizationClient {
    pub fn new(http: MlHttpClient, store: Arc<MlConfigStore>) -> Self {
        Self { http, store }
    }

    pub async fn config(&self) -> Arc<CategoryConfig> {
        self.store.get(CATEGORY).await
    }

    /// Suggest categories for `transactions`, sent in `batch_size` chunks.
    /// Suggestions under `min_confidence` are dropped.
    #[tracing::instrument(skip(self, transactions), fields(count = transactions.len()))]
    pub async fn categorize(
        &self,
        company_id: Uuid,
        transactions: &[MlTransaction],
    ) -> Result<Categorization, MlError> {
        let config = self.config().await;
        if !config.enabled() {
            note_fallback(SERVICE, &MlError::Disabled);
            return Ok(Categorization::fallback());
        }
        if transactions.is_empty() {
            return Ok(Categorization {
                suggestions: Vec::new(),
                source: ResultSource::Model,
            });
        }

        let url = format!("{}/categorize", config.service_url());
        let min_confidence = config.get_f64(keys::MIN_CONFIDENCE);
        let batch_size = config.get_u64(keys::BATCH_SIZE).max(1) as usize;

        let mut suggestions = Vec::new();
        for chunk in transactions.chunks(batch_size) {
            let request = CategorizeRequest {
                company_id,
                transactions: chunk,
            };
            let response: CategorizeResponse = match self
                .http
                .post_json(SERVICE, &url, &request, config.timeout())
                .await
            {
                Ok(response) => response,
                Err(e) if e.is_fallback() => {
                    note_fallback(SERVICE, &e);
                    return Ok(Categorization::fallback());
                }
                Err(e) => return Err(e),
            };
            suggestions.extend(shape_predictions(chunk, response.predictions, min_confidence));
        }

        Ok(Categorization {
            suggestions,
            source: ResultSource::Model,
        })
    }

    /// Train the company's categorizer. Skipped below `min_training_samples`.
    #[tracing::instrument(skip(self, samples), fields(count = samples.len()))]
    pub async fn train(
        &self,
        company_id: Uuid,
        samples: &[TrainingSample],
    ) -> Result<TrainingOutcome, MlError> {
        let config = self.config().await;
        if !config.enabled() {
            return Ok(TrainingOutcome::without_call(
                TrainingStatus::Disabled,
                samples.len(),
            ));
        }

        let min_samples = config.get_u64(keys::MIN_TRAINING_SAMPLES) as usize;
        if samples.len() < min_samples {
            tracing::debug!(min_samples, "Not enough samples to train categorizer");
            return Ok(TrainingOutcome::without_call(
                TrainingStatus::Skipped,
                samples.len(),
            ));
        }

        let url = format!("{}/train", config.service_url());
        let request = TrainRequest {
            company_id,
            samples,
        };
        match self
            .http
            .post_json::<_, TrainResponse>(SERVICE, &url, &request, config.timeout())
            .await
        {
            Ok(response) => Ok(TrainingOutcome {
                status: TrainingStatus::Trained,
                samples: samples.len(),
                model_version: response.model_version,
            }),
            Err(e) if e.is_fallback() => {
                note_fallback(SERVICE, &e);
                Ok(TrainingOutcome::without_call(
                    TrainingStatus::Unavailable,
                    samples.len(),
                ))
            }
            Err(e) => Err(e),
        }
    }
}

fn shape_predictions(
    sent: &[MlTransaction],
    predictions: Vec<Prediction>,
    min_confidence: f64,
) -> Vec<CategorySuggestion> {
    let known: HashSet<Uuid> = sent.iter().map(|t| t.id).collect();
    predictions
        .into_iter()
        .filter(|p| known.contains(&p.transaction_id))
        .filter(|p| p.confidence.is_finite() && p.confidence >= min_confidence)
        .filter_map(|p| {
            p.category_id.map(|category_id| CategorySuggestion {
                transaction_id: p.transaction_id,
                category_id,
                confidence: p.confidence.min(1.0),
            })
        })
        .collect()
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
            amount: 42.0,
            description: "Coffee".into(),
            occurred_on: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
        }
    }

    #[test]
    fn drops_low_confidence_unknown_and_uncategorized_predictions() {
        let known = Uuid::new_v4();
        let category = Uuid::new_v4();
        let predictions = vec![
            Prediction {
                transaction_id: known,
                category_id: Some(category),
                confidence: 0.9,
            },
            Prediction {
                transaction_id: known,
                category_id: Some(Uuid::new_v4()),
                confidence: 0.3,
            },
            Prediction {
                transaction_id: Uuid::new_v4(),
                category_id: Some(category),
                confidence: 0.99,
            },
            Prediction {
                transaction_id: known,
                category_id: None,
                confidence: 0.95,
            },
        ];

        let shaped = shape_predictions(&[txn(known)], predictions, 0.6);
        assert_eq!(
            shaped,
            vec![CategorySuggestion {
                transaction_id: known,
                category_id: category,
                confidence: 0.9,
            }]
        );
    }

    #[test]
    fn best_for_picks_highest_confidence() {
        let id = Uuid::new_v4();
        let winner = Uuid::new_v4();
        let result = Categorization {
            suggestions: vec![
                CategorySuggestion {
                    transaction_id: id,
                    category_id: Uuid::new_v4(),
                    confidence: 0.7,
                },
                CategorySuggestion {
                    transaction_id: id,
                    category_id: winner,
                    confidence: 0.8,
                },
            ],
            source: ResultSource::Model,
        };
        assert_eq!(result.best_for(id).map(|s| s.category_id), Some(winner));
        assert!(result.best_for(Uuid::new_v4()).is_none());
    }
}
