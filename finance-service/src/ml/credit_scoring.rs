//! Customer credit scoring client.

use super::client::{decimal_to_f64, note_fallback, MlError, MlHttpClient};
use super::config_store::{keys, CategoryConfig, MlConfigCategory, MlConfigStore};
use crate::models::{CreditAssessment, CustomerFeatures};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

const CATEGORY: MlConfigCategory = MlConfigCategory::CreditScoring;
const SERVICE: &str = "credit_scoring";

pub const MIN_SCORE: i32 = 300;
pub const MAX_SCORE: i32 = 850;

#[derive(Serialize)]
struct ScoreRequest {
    company_id: Uuid,
    customer_id: Uuid,
    features: FeaturePayload,
}

#[derive(Serialize)]
struct FeaturePayload {
    invoice_count: i64,
    paid_count: i64,
    overdue_count: i64,
    total_invoiced: f64,
    total_outstanding: f64,
    avg_days_to_pay: Option<f64>,
    customer_age_days: i64,
}

impl From<&CustomerFeatures> for FeaturePayload {
    fn from(f: &CustomerFeatures) -> Self {
        Self {
            invoice_count: f.invoice_count,
            paid_count: f.paid_count,
            overdue_count: f.overdue_count,
            total_invoiced: decimal_to_f64(f.total_invoiced),
            total_outstanding: decimal_to_f64(f.total_outstanding),
            avg_days_to_pay: f.avg_days_to_pay,
            customer_age_days: f.customer_age_days,
        }
    }
}

#[derive(Deserialize)]
struct ScoreResponse {
    score: f64,
    #[serde(default)]
    risk_level: Option<String>,
}

#[derive(Clone)]
pub struct CreditScoringClient {
    http: MlHttpClient,
    store: Arc<MlConfigStore>,
}

impl CreditScoringClient {
    pub fn new(http: MlHttpClient, store: Arc<MlConfigStore>) -> Self {
        Self { http, store }
    }

    pub async fn config(&self) -> Arc<CategoryConfig> {
        self.store.get(CATEGORY).await
    }

    /// Days after which a stored score is refreshed.
    pub async fn refresh_days(&self) -> i64 {
        self.config().await.get_u64(keys::REFRESH_DAYS).min(3650) as i64
    }

    /// Score one customer. `None` means the service was unreachable or
    /// disabled and the customer stays unscored.
    #[tracing::instrument(skip(self, features))]
    pub async fn score_customer(
        &self,
        company_id: Uuid,
        customer_id: Uuid,
        features: &CustomerFeatures,
    ) -> Result<Option<CreditAssessment>, MlError> {
        let config = self.config().await;
        if !config.enabled() {
            note_fallback(SERVICE, &MlError::Disabled);
            return Ok(None);
        }

        let url = format!("{}/score-customer", config.service_url());
        let request = ScoreRequest {
            company_id,
            customer_id,
            features: features.into(),
        };

        match self
            .http
            .post_json::<_, ScoreResponse>(SERVICE, &url, &request, config.timeout())
            .await
        {
            Ok(response) => assess(response.score, response.risk_level.as_deref()).map(Some),
            Err(e) if e.is_fallback() => {
                note_fallback(SERVICE, &e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

fn assess(raw_score: f64, risk_level: Option<&str>) -> Result<CreditAssessment, MlError> {
    if !raw_score.is_finite() {
        return Err(MlError::Decode(format!("score {} is not a number", raw_score)));
    }
    let score = (raw_score.round() as i64).clamp(MIN_SCORE as i64, MAX_SCORE as i64) as i32;

    let risk_level = risk_level
        .map(|r| r.trim().to_ascii_lowercase())
        .filter(|r| matches!(r.as_str(), "low" | "medium" | "high"))
        .unwrap_or_else(|| risk_for_score(score).to_string());

    Ok(CreditAssessment { score, risk_level })
}

pub fn risk_for_score(score: i32) -> &'static str {
    match score {
        s if s >= 700 => "low",
        s if s >= 600 => "medium",
        _ => "high",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scores_are_clamped_to_range() {
        assert_eq!(assess(120.0, None).unwrap().score, MIN_SCORE);
        assert_eq!(assess(990.4, None).unwrap().score, MAX_SCORE);
        assert_eq!(assess(712.6, None).unwrap().score, 713);
    }

    #[test]
    fn risk_derived_when_missing_or_unknown() {
        assert_eq!(assess(720.0, None).unwrap().risk_level, "low");
        assert_eq!(assess(650.0, Some("spicy")).unwrap().risk_level, "medium");
        assert_eq!(assess(500.0, None).unwrap().risk_level, "high");
    }

    #[test]
    fn service_risk_level_wins() {
        assert_eq!(assess(800.0, Some("HIGH")).unwrap().risk_level, "high");
    }

    #[test]
    fn non_numeric_score_is_a_decode_error() {
        assert!(matches!(assess(f64::NAN, None), Err(MlError::Decode(_))));
    }

    #[test]
    fn risk_boundaries() {
        assert_eq!(risk_for_score(700), "low");
        assert_eq!(risk_for_score(699), "medium");
        assert_eq!(risk_for_score(600), "medium");
        assert_eq!(risk_for_score(599), "high");
    }
}
