use crate::dtos::transactions::{
    CreateTransactionRequest, TransactionCreated, TransactionListParams,
    UpdateTransactionRequest,
};
use crate::dtos::{positive_amount, Page, Pagination};
use crate::middleware::AuthContext;
use crate::ml::{CategorySuggestion, MlTransaction};
use crate::models::{CategorySource, CreateTransaction, ListTransactionsFilter, TransactionChanges};
use crate::services::metrics::record_transaction_created;
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

pub async fn list_transactions(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(params): Query<TransactionListParams>,
) -> Result<impl IntoResponse, AppError> {
    let pagination = Pagination::new(params.page, params.page_size)?;
    if let (Some(from), Some(to)) = (params.from, params.to) {
        if from > to {
            return Err(AppError::bad_request("from must not be after to"));
        }
    }

    let filter = ListTransactionsFilter {
        account_id: params.account_id,
        category_id: params.category_id,
        from: params.from,
        to: params.to,
        flagged: params.flagged,
        limit: pagination.limit(),
        offset: pagination.offset(),
    };
    let (transactions, total) = state.db.list_transactions(auth.company_id, &filter).await?;
    Ok(Json(Page::new(transactions, pagination, total)))
}

/// Book a transaction. Without a category, the categorizer is asked for one
/// and its best suggestion is applied.
pub async fn create_transaction(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateTransactionRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    let amount = positive_amount(req.amount)?;

    let mut input = CreateTransaction {
        company_id: auth.company_id,
        account_id: req.account_id,
        category_id: req.category_id,
        category_source: if req.category_id.is_some() {
            CategorySource::Manual
        } else {
            CategorySource::None
        },
        category_confidence: None,
        kind: req.kind,
        amount,
        description: req.description.trim().to_string(),
        occurred_on: req.occurred_on,
    };

    let applied_suggestion = if input.category_id.is_none() {
        suggest_category(&state, &input).await
    } else {
        None
    };
    if let Some(suggestion) = &applied_suggestion {
        input.category_id = Some(suggestion.category_id);
        input.category_source = CategorySource::Ml;
        input.category_confidence = Some(suggestion.confidence);
    }

    let transaction = state.db.create_transaction(&input).await?;
    record_transaction_created(input.kind.as_str());

    Ok((
        StatusCode::CREATED,
        Json(TransactionCreated {
            transaction,
            applied_suggestion,
        }),
    ))
}

/// Best categorizer suggestion for a transaction about to be created. Any
/// failure only means the transaction stays uncategorized.
async fn suggest_category(
    state: &AppState,
    input: &CreateTransaction,
) -> Option<CategorySuggestion> {
    if !state.ml.categorization.config().await.enabled() {
        return None;
    }

    // Not persisted yet; the id only correlates the prediction.
    let probe_id = Uuid::new_v4();
    let probe = MlTransaction {
        id: probe_id,
        account_id: input.account_id,
        category_id: None,
        kind: input.kind.as_str().to_string(),
        amount: crate::ml::client::decimal_to_f64(input.amount),
        description: input.description.clone(),
        occurred_on: input.occurred_on,
    };

    let result = match state
        .ml
        .categorization
        .categorize(input.company_id, std::slice::from_ref(&probe))
        .await
    {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!(error = %e, "Auto-categorization failed, leaving uncategorized");
            return None;
        }
    };
    let suggestion = result.best_for(probe_id)?.clone();

    // The model may only know categories this company has.
    match state
        .db
        .get_category(input.company_id, suggestion.category_id)
        .await
    {
        Ok(Some(_)) => Some(suggestion),
        Ok(None) => {
            tracing::warn!(category_id = %suggestion.category_id, "Categorizer suggested an unknown category");
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, "Could not verify suggested category");
            None
        }
    }
}

pub async fn get_transaction(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(transaction_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let transaction = state
        .db
        .get_transaction(auth.company_id, transaction_id)
        .await?
        .ok_or_else(|| AppError::not_found("Transaction"))?;
    Ok(Json(transaction))
}

pub async fn update_transaction(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(transaction_id): Path<Uuid>,
    Json(req): Json<UpdateTransactionRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    if req.clear_category && req.category_id.is_some() {
        return Err(AppError::bad_request(
            "category_id and clear_category are mutually exclusive",
        ));
    }

    let changes = TransactionChanges {
        description: req.description.as_deref().map(|d| d.trim().to_string()),
        occurred_on: req.occurred_on,
        category: if req.clear_category {
            Some(None)
        } else {
            req.category_id.map(Some)
        },
    };

    let transaction = state
        .db
        .update_transaction(auth.company_id, transaction_id, &changes)
        .await?
        .ok_or_else(|| AppError::not_found("Transaction"))?;

    Ok(Json(transaction))
}

pub async fn delete_transaction(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(transaction_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    if !state
        .db
        .delete_transaction(auth.company_id, transaction_id)
        .await?
    {
        return Err(AppError::not_found("Transaction"));
    }
    Ok(StatusCode::NO_CONTENT)
}
