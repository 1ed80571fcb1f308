use crate::dtos::billing::{CreateCustomerRequest, CreditScoreResponse, UpdateCustomerRequest};
use crate::dtos::{Page, Pagination};
use crate::middleware::AuthContext;
use crate::ml::ResultSource;
use crate::models::{CreateCustomer, UpdateCustomer};
use crate::startup::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Default, Deserialize)]
pub struct CustomerListParams {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

pub async fn list_customers(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(params): Query<CustomerListParams>,
) -> Result<impl IntoResponse, AppError> {
    let pagination = Pagination::new(params.page, params.page_size)?;
    let (customers, total) = state
        .db
        .list_customers(auth.company_id, pagination.limit(), pagination.offset())
        .await?;
    Ok(Json(Page::new(customers, pagination, total)))
}

pub async fn create_customer(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateCustomerRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    let customer = state
        .db
        .create_customer(&CreateCustomer {
            company_id: auth.company_id,
            name: req.name.trim().to_string(),
            email: req.email,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(customer)))
}

pub async fn get_customer(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(customer_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let customer = state
        .db
        .get_customer(auth.company_id, customer_id)
        .await?
        .ok_or_else(|| AppError::not_found("Customer"))?;
    Ok(Json(customer))
}

pub async fn update_customer(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(customer_id): Path<Uuid>,
    Json(req): Json<UpdateCustomerRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    let customer = state
        .db
        .update_customer(
            auth.company_id,
            customer_id,
            &UpdateCustomer {
                name: req.name.map(|n| n.trim().to_string()),
                email: req.email,
            },
        )
        .await?
        .ok_or_else(|| AppError::not_found("Customer"))?;
    Ok(Json(customer))
}

/// Score a customer from its invoice history and store the result.
pub async fn score_customer(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(customer_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let features = state
        .db
        .customer_features(auth.company_id, customer_id)
        .await?
        .ok_or_else(|| AppError::not_found("Customer"))?;

    let assessment = state
        .ml
        .credit_scoring
        .score_customer(auth.company_id, customer_id, &features)
        .await?
        .ok_or_else(|| {
            AppError::ServiceUnavailable("Credit scoring is currently unavailable".to_string())
        })?;

    let customer = state
        .db
        .record_credit_score(auth.company_id, customer_id, &assessment)
        .await?
        .ok_or_else(|| AppError::not_found("Customer"))?;

    tracing::info!(customer_id = %customer_id, score = assessment.score, risk = %assessment.risk_level, "Customer scored");
    Ok(Json(CreditScoreResponse {
        customer,
        assessment,
        source: ResultSource::Model,
    }))
}
