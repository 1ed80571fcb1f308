use crate::dtos::billing::{CreateInvoiceRequest, InvoiceListParams, UpdateInvoiceStatusRequest};
use crate::dtos::{currency_code, positive_amount, Page, Pagination};
use crate::middleware::AuthContext;
use crate::models::CreateInvoice;
use crate::startup::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

pub async fn list_invoices(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(params): Query<InvoiceListParams>,
) -> Result<impl IntoResponse, AppError> {
    let pagination = Pagination::new(params.page, params.page_size)?;
    let (invoices, total) = state
        .db
        .list_invoices(
            auth.company_id,
            params.status,
            pagination.limit(),
            pagination.offset(),
        )
        .await?;
    Ok(Json(Page::new(invoices, pagination, total)))
}

pub async fn create_invoice(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateInvoiceRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    let amount = positive_amount(req.amount)?;
    let currency = currency_code(&req.currency)?;
    if req.due_date < req.issue_date {
        return Err(AppError::bad_request("due_date must not be before issue_date"));
    }

    let invoice = state
        .db
        .create_invoice(&CreateInvoice {
            company_id: auth.company_id,
            customer_id: req.customer_id,
            number: req.number.trim().to_string(),
            amount,
            currency,
            issue_date: req.issue_date,
            due_date: req.due_date,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(invoice)))
}

pub async fn get_invoice(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(invoice_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let invoice = state
        .db
        .get_invoice(auth.company_id, invoice_id)
        .await?
        .ok_or_else(|| AppError::not_found("Invoice"))?;
    Ok(Json(invoice))
}

pub async fn update_invoice_status(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(invoice_id): Path<Uuid>,
    Json(req): Json<UpdateInvoiceStatusRequest>,
) -> Result<impl IntoResponse, AppError> {
    let invoice = state
        .db
        .update_invoice_status(auth.company_id, invoice_id, req.status)
        .await?;
    Ok(Json(invoice))
}
