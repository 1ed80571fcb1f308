use crate::dtos::billing::{
    BudgetListParams, RecommendationParams, RecommendationResponse, UpsertBudgetRequest,
};
use crate::middleware::AuthContext;
use crate::models::{BudgetSource, UpsertBudget};
use crate::startup::AppState;
use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use chrono::{Datelike, Months, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;

/// First day of the month containing `date`.
pub fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

pub async fn list_budgets(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(params): Query<BudgetListParams>,
) -> Result<impl IntoResponse, AppError> {
    let budgets = state
        .db
        .list_budgets(auth.company_id, params.month.map(month_start))
        .await?;
    Ok(Json(budgets))
}

pub async fn upsert_budget(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<UpsertBudgetRequest>,
) -> Result<impl IntoResponse, AppError> {
    if req.amount < Decimal::ZERO {
        return Err(AppError::bad_request("amount must not be negative"));
    }

    let budget = state
        .db
        .upsert_budget(&UpsertBudget {
            company_id: auth.company_id,
            category_id: req.category_id,
            month: month_start(req.month),
            amount: req.amount.round_dp(2),
            source: BudgetSource::Manual,
        })
        .await?;
    Ok(Json(budget))
}

/// Recommend next month's budget for one category from its spend history.
pub async fn recommend_budget(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(params): Query<RecommendationParams>,
) -> Result<impl IntoResponse, AppError> {
    state
        .db
        .get_category(auth.company_id, params.category_id)
        .await?
        .ok_or_else(|| AppError::not_found("Category"))?;

    let this_month = month_start(Utc::now().date_naive());
    let months = state.ml.budget.history_months().await;
    let since = this_month
        .checked_sub_months(Months::new(months))
        .unwrap_or(this_month);

    // Only complete months count as history.
    let history: Vec<_> = state
        .db
        .monthly_spend(auth.company_id, params.category_id, since)
        .await?
        .into_iter()
        .filter(|m| m.month < this_month)
        .collect();

    let recommendation = state
        .ml
        .budget
        .recommend_budget(auth.company_id, params.category_id, &history)
        .await?;

    Ok(Json(RecommendationResponse {
        recommendation,
        month: this_month
            .checked_add_months(Months::new(1))
            .unwrap_or(this_month),
    }))
}
