use crate::ml::{Anomaly, CategorySuggestion, ResultSource};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Default, Deserialize, Validate)]
pub struct CategorizeRequest {
    /// Defaults to the company's uncategorized transactions.
    #[validate(length(min = 1, max = 1000))]
    pub transaction_ids: Option<Vec<Uuid>>,
    /// Persist suggestions with source `ml`.
    #[serde(default)]
    pub apply: bool,
}

#[derive(Debug, Serialize)]
pub struct CategorizeResponse {
    pub suggestions: Vec<CategorySuggestion>,
    pub source: ResultSource,
    pub applied: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct DateRangeRequest {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    /// Anomalies only: flag matching transactions.
    #[serde(default)]
    pub persist: bool,
}

#[derive(Debug, Serialize)]
pub struct AnomaliesResponse {
    pub anomalies: Vec<Anomaly>,
    pub source: ResultSource,
    pub flagged: u64,
    pub from: NaiveDate,
    pub to: NaiveDate,
}
