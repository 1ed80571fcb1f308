//! Budget recommendation client.

use super::client::{decimal_to_f64, note_fallback, MlError, MlHttpClient, ResultSource};
use super::config_store::{keys, CategoryConfig, MlConfigCategory, MlConfigStore};
use crate::models::MonthlySpend;
use chrono::NaiveDate;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

const CATEGORY: MlConfigCategory = MlConfigCategory::Budget;
const SERVICE: &str = "budget";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetRecommendation {
    pub category_id: Uuid,
    pub amount: Decimal,
    pub history_months: usize,
    pub source: ResultSource,
}

#[derive(Serialize)]
struct RecommendRequest {
    company_id: Uuid,
    category_id: Uuid,
    buffer_pct: f64,
    history: Vec<HistoryPoint>,
}

#[derive(Serialize)]
struct HistoryPoint {
    month: NaiveDate,
    amount: f64,
}

#[derive(Deserialize)]
struct RecommendResponse {
    recommended_amount: f64,
}

#[derive(Clone)]
pub struct BudgetClient {
    http: MlHttpClient,
    store: Arc<MlConfigStore>,
}

impl BudgetClient {
    pub fn new(http: MlHttpClient, store: Arc<MlConfigStore>) -> Self {
        Self { http, store }
    }

    pub async fn config(&self) -> Arc<CategoryConfig> {
        self.store.get(CATEGORY).await
    }

    /// How many months of spend history to send.
    pub async fn history_months(&self) -> u32 {
        self.config()
            .await
            .get_u64(keys::HISTORY_MONTHS)
            .clamp(1, 120) as u32
    }

    #[tracing::instrument(skip(self, history), fields(months = history.len()))]
    pub async fn recommend_budget(
        &self,
        company_id: Uuid,
        category_id: Uuid,
        history: &[MonthlySpend],
    ) -> Result<BudgetRecommendation, MlError> {
        let config = self.config().await;
        let buffer_pct = config.get_f64(keys::BUFFER_PCT);

        let fallback = |err: &MlError| {
            note_fallback(SERVICE, err);
            BudgetRecommendation {
                category_id,
                amount: fallback_amount(history, buffer_pct),
                history_months: history.len(),
                source: ResultSource::Fallback,
            }
        };

        if !config.enabled() {
            return Ok(fallback(&MlError::Disabled));
        }

        let url = format!("{}/recommend-budget", config.service_url());
        let request = RecommendRequest {
            company_id,
            category_id,
            buffer_pct,
            history: history
                .iter()
                .map(|m| HistoryPoint {
                    month: m.month,
                    amount: decimal_to_f64(m.amount),
                })
                .collect(),
        };

        match self
            .http
            .post_json::<_, RecommendResponse>(SERVICE, &url, &request, config.timeout())
            .await
        {
            Ok(response) => {
                let amount = Decimal::from_f64(response.recommended_amount).ok_or_else(|| {
                    MlError::Decode(format!(
                        "recommended_amount {} is not a number",
                        response.recommended_amount
                    ))
                })?;
                Ok(BudgetRecommendation {
                    category_id,
                    amount: normalize(amount),
                    history_months: history.len(),
                    source: ResultSource::Model,
                })
            }
            Err(e) if e.is_fallback() => Ok(fallback(&e)),
            Err(e) => Err(e),
        }
    }
}

/// Mean monthly spend plus the buffer; zero without history.
pub fn fallback_amount(history: &[MonthlySpend], buffer_pct: f64) -> Decimal {
    if history.is_empty() {
        return Decimal::ZERO;
    }
    let total: Decimal = history.iter().map(|m| m.amount).sum();
    let mean = total / Decimal::from(history.len());
    let buffer = Decimal::from_f64(buffer_pct).unwrap_or(Decimal::ZERO);
    normalize(mean * (Decimal::ONE + buffer))
}

fn normalize(amount: Decimal) -> Decimal {
    amount.round_dp(2).max(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spend(month: u32, amount: i64) -> MonthlySpend {
        MonthlySpend {
            month: NaiveDate::from_ymd_opt(2025, month, 1).unwrap(),
            amount: Decimal::new(amount, 2),
        }
    }

    #[test]
    fn fallback_is_buffered_mean() {
        let history = [spend(1, 10_000), spend(2, 20_000)];
        // mean 150.00 * 1.1
        assert_eq!(fallback_amount(&history, 0.1), Decimal::new(16_500, 2));
    }

    #[test]
    fn fallback_without_history_is_zero() {
        assert_eq!(fallback_amount(&[], 0.1), Decimal::ZERO);
    }

    #[test]
    fn amounts_round_and_never_go_negative() {
        assert_eq!(normalize(Decimal::new(123_456, 3)), Decimal::new(12_346, 2));
        assert_eq!(normalize(Decimal::new(-500, 2)), Decimal::ZERO);
    }
}
