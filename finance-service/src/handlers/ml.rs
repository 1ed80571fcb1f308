use crate::dtos::ml::{AnomaliesResponse, CategorizeRequest, CategorizeResponse, DateRangeRequest};
use crate::middleware::AuthContext;
use crate::ml::config_store::keys;
use crate::ml::{MlTransaction, ResultSource};
use crate::models::CategorySource;
use crate::startup::AppState;
use axum::{extract::State, response::IntoResponse, Json};
use chrono::{Duration, NaiveDate, Utc};
use service_core::error::AppError;
use std::collections::HashSet;
use validator::Validate;

/// Uncategorized transactions picked up when no ids are given.
const UNCATEGORIZED_LIMIT: i64 = 500;
/// Cap on transactions sent for anomaly or duplicate detection.
const WINDOW_LIMIT: i64 = 5_000;

/// Resolve an optional date range, defaulting to the last `days` days.
fn resolve_range(
    req: &DateRangeRequest,
    days: u64,
) -> Result<(NaiveDate, NaiveDate), AppError> {
    let to = req.to.unwrap_or_else(|| Utc::now().date_naive());
    let from = match req.from {
        Some(from) => from,
        None => to
            .checked_sub_signed(Duration::days(days.clamp(1, 3650) as i64))
            .ok_or_else(|| AppError::bad_request("to is out of range"))?,
    };
    if from > to {
        return Err(AppError::bad_request("from must not be after to"));
    }
    Ok((from, to))
}

pub async fn categorize(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CategorizeRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;

    let transactions = match &req.transaction_ids {
        Some(ids) => state.db.transactions_by_ids(auth.company_id, ids).await?,
        None => {
            state
                .db
                .list_uncategorized(auth.company_id, UNCATEGORIZED_LIMIT)
                .await?
        }
    };
    let probes: Vec<MlTransaction> = transactions.iter().map(MlTransaction::from).collect();

    let mut result = state
        .ml
        .categorization
        .categorize(auth.company_id, &probes)
        .await?;

    // The model may answer with categories this company does not own.
    let owned: HashSet<_> = state
        .db
        .list_categories(auth.company_id)
        .await?
        .into_iter()
        .map(|c| c.id)
        .collect();
    result.suggestions.retain(|s| owned.contains(&s.category_id));

    let mut applied = 0;
    if req.apply && result.source == ResultSource::Model {
        for suggestion in &result.suggestions {
            let updated = state
                .db
                .set_transaction_category(
                    auth.company_id,
                    suggestion.transaction_id,
                    Some(suggestion.category_id),
                    CategorySource::Ml,
                    Some(suggestion.confidence),
                )
                .await?;
            if updated.is_some() {
                applied += 1;
            }
        }
        tracing::info!(company_id = %auth.company_id, applied, "Applied category suggestions");
    }

    Ok(Json(CategorizeResponse {
        suggestions: result.suggestions,
        source: result.source,
        applied,
    }))
}

pub async fn detect_anomalies(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<DateRangeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let lookback = state.ml.anomaly.config().await.get_u64(keys::LOOKBACK_DAYS);
    let (from, to) = resolve_range(&req, lookback)?;

    let probes: Vec<MlTransaction> = state
        .db
        .transactions_between(auth.company_id, from, to, WINDOW_LIMIT)
        .await?
        .iter()
        .map(MlTransaction::from)
        .collect();

    let report = state.ml.anomaly.detect(auth.company_id, &probes).await?;

    let mut flagged = 0;
    if req.persist && report.source == ResultSource::Model {
        let scores: Vec<_> = report
            .anomalies
            .iter()
            .map(|a| (a.transaction_id, a.score))
            .collect();
        flagged = state.db.mark_anomalies(auth.company_id, &scores).await?;
    }

    Ok(Json(AnomaliesResponse {
        anomalies: report.anomalies,
        source: report.source,
        flagged,
        from,
        to,
    }))
}

pub async fn find_duplicates(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<DateRangeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let window = state.ml.duplicates.config().await.get_u64(keys::WINDOW_DAYS);
    let (from, to) = resolve_range(&req, window)?;

    let probes: Vec<MlTransaction> = state
        .db
        .transactions_between(auth.company_id, from, to, WINDOW_LIMIT)
        .await?
        .iter()
        .map(MlTransaction::from)
        .collect();

    let report = state
        .ml
        .duplicates
        .find_duplicates(auth.company_id, &probes)
        .await?;
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn range_defaults_to_window_before_to() {
        let req = DateRangeRequest {
            to: Some(date(2025, 3, 31)),
            ..Default::default()
        };
        let (from, to) = resolve_range(&req, 30).unwrap();
        assert_eq!(from, date(2025, 3, 1));
        assert_eq!(to, date(2025, 3, 31));
    }

    #[test]
    fn inverted_range_is_rejected() {
        let req = DateRangeRequest {
            from: Some(date(2025, 4, 2)),
            to: Some(date(2025, 4, 1)),
            persist: false,
        };
        assert!(matches!(
            resolve_range(&req, 30),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn window_before_earliest_date_is_rejected() {
        let req = DateRangeRequest {
            to: Some(NaiveDate::MIN),
            ..Default::default()
        };
        assert!(matches!(
            resolve_range(&req, 30),
            Err(AppError::BadRequest(_))
        ));
    }
}
