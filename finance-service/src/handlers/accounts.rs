use crate::dtos::accounts::{
    AccountListParams, CreateAccountRequest, CreateCategoryRequest, UpdateAccountRequest,
};
use crate::dtos::{currency_code, Page, Pagination};
use crate::middleware::AuthContext;
use crate::models::{CreateAccount, CreateCategory};
use crate::startup::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use rust_decimal::Decimal;
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

pub async fn list_accounts(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(params): Query<AccountListParams>,
) -> Result<impl IntoResponse, AppError> {
    let pagination = Pagination::new(params.page, params.page_size)?;
    let (accounts, total) = state
        .db
        .list_accounts(
            auth.company_id,
            params.include_archived,
            pagination.limit(),
            pagination.offset(),
        )
        .await?;
    Ok(Json(Page::new(accounts, pagination, total)))
}

pub async fn create_account(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateAccountRequest>,
) -> Result<impl IntoResponse, AppError> {
    auth.require_admin()?;
    req.validate()?;

    let account = state
        .db
        .create_account(&CreateAccount {
            company_id: auth.company_id,
            name: req.name.trim().to_string(),
            account_type: req.account_type,
            currency: currency_code(&req.currency)?,
            opening_balance: req.opening_balance.unwrap_or(Decimal::ZERO),
        })
        .await?;

    Ok((StatusCode::CREATED, Json(account)))
}

pub async fn get_account(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(account_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let account = state
        .db
        .get_account(auth.company_id, account_id)
        .await?
        .ok_or_else(|| AppError::not_found("Account"))?;
    Ok(Json(account))
}

pub async fn update_account(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(account_id): Path<Uuid>,
    Json(req): Json<UpdateAccountRequest>,
) -> Result<impl IntoResponse, AppError> {
    auth.require_admin()?;
    req.validate()?;

    let account = state
        .db
        .rename_account(auth.company_id, account_id, req.name.trim())
        .await?
        .ok_or_else(|| AppError::not_found("Account"))?;
    Ok(Json(account))
}

/// Archives the account; its transactions stay.
pub async fn archive_account(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(account_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    auth.require_admin()?;

    let account = state
        .db
        .archive_account(auth.company_id, account_id)
        .await?
        .ok_or_else(|| AppError::not_found("Account"))?;
    tracing::info!(account_id = %account.id, "Account archived");
    Ok(Json(account))
}

pub async fn list_categories(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<impl IntoResponse, AppError> {
    let categories = state.db.list_categories(auth.company_id).await?;
    Ok(Json(categories))
}

pub async fn create_category(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateCategoryRequest>,
) -> Result<impl IntoResponse, AppError> {
    auth.require_admin()?;
    req.validate()?;

    let category = state
        .db
        .create_category(&CreateCategory {
            company_id: auth.company_id,
            name: req.name.trim().to_string(),
            kind: req.kind,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(category)))
}
