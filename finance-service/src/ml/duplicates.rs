//! Duplicate transaction detection client.

use super::client::{note_fallback, MlError, MlHttpClient, MlTransaction, ResultSource};
use super::config_store::{keys, CategoryConfig, MlConfigCategory, MlConfigStore};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

const CATEGORY: MlConfigCategory = MlConfigCategory::Duplicates;
const SERVICE: &str = "duplicates";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub transaction_ids: Vec<Uuid>,
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateReport {
    pub groups: Vec<DuplicateGroup>,
    pub source: ResultSource,
}

#[derive(Serialize)]
struct FindDuplicatesRequest<'a> {
    company_id: Uuid,
    similarity_threshold: f64,
    window_days: u64,
    transactions: &'a [MlTransaction],
}

#[derive(Deserialize)]
struct FindDuplicatesResponse {
    #[serde(default)]
    groups: Vec<DuplicateGroup>,
}

#[derive(Clone)]
pub struct DuplicatesClient {
    http: MlHttpClient,
    store: Arc<MlConfigStore>,
}

impl DuplicatesClient {
    pub fn new(http: MlHttpClient, store: Arc<MlConfigStore>) -> Self {
        Self { http, store }
    }

    pub async fn config(&self) -> Arc<CategoryConfig> {
        self.store.get(CATEGORY).await
    }

    #[tracing::instrument(skip(self, transactions), fields(count = transactions.len()))]
    pub async fn find_duplicates(
        &self,
        company_id: Uuid,
        transactions: &[MlTransaction],
    ) -> Result<DuplicateReport, MlError> {
        let fallback = DuplicateReport {
            groups: Vec::new(),
            source: ResultSource::Fallback,
        };

        let config = self.config().await;
        if !config.enabled() {
            note_fallback(SERVICE, &MlError::Disabled);
            return Ok(fallback);
        }
        // A single transaction cannot have a duplicate.
        if transactions.len() < 2 {
            return Ok(DuplicateReport {
                groups: Vec::new(),
                source: ResultSource::Model,
            });
        }

        let url = format!("{}/find-duplicates", config.service_url());
        let request = FindDuplicatesRequest {
            company_id,
            similarity_threshold: config.get_f64(keys::SIMILARITY_THRESHOLD),
            window_days: config.get_u64(keys::WINDOW_DAYS),
            transactions,
        };

        match self
            .http
            .post_json::<_, FindDuplicatesResponse>(SERVICE, &url, &request, config.timeout())
            .await
        {
            Ok(response) => Ok(DuplicateReport {
                groups: shape_groups(transactions, response.groups),
                source: ResultSource::Model,
            }),
            Err(e) if e.is_fallback() => {
                note_fallback(SERVICE, &e);
                Ok(fallback)
            }
            Err(e) => Err(e),
        }
    }
}

/// Keep groups of at least two distinct ids, all of which were sent.
fn shape_groups(sent: &[MlTransaction], groups: Vec<DuplicateGroup>) -> Vec<DuplicateGroup> {
    let known: HashSet<Uuid> = sent.iter().map(|t| t.id).collect();

    groups
        .into_iter()
        .filter_map(|group| {
            let mut seen = HashSet::new();
            let ids: Vec<Uuid> = group
                .transaction_ids
                .into_iter()
                .filter(|id| seen.insert(*id))
                .collect();

            if ids.len() < 2 || !ids.iter().all(|id| known.contains(id)) {
                return None;
            }
            Some(DuplicateGroup {
                transaction_ids: ids,
                similarity: if group.similarity.is_finite() {
                    group.similarity.clamp(0.0, 1.0)
                } else {
                    0.0
                },
            })
        })
        .collect()
}
