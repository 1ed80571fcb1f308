use crate::models::{Transaction, TransactionKind};
use crate::ml::CategorySuggestion;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateTransactionRequest {
    pub account_id: Uuid,
    pub category_id: Option<Uuid>,
    pub kind: TransactionKind,
    pub amount: Decimal,
    #[validate(length(min = 1, max = 500, message = "Description is required"))]
    pub description: String,
    pub occurred_on: NaiveDate,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct UpdateTransactionRequest {
    #[validate(length(min = 1, max = 500))]
    pub description: Option<String>,
    pub occurred_on: Option<NaiveDate>,
    /// Assign a category manually.
    pub category_id: Option<Uuid>,
    /// Remove the current category.
    #[serde(default)]
    pub clear_category: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct TransactionListParams {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    pub account_id: Option<Uuid>,
    pub category_id: Option<Uuid>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub flagged: Option<bool>,
}

/// A created transaction and, when it was auto-categorized, the suggestion
/// that was applied.
#[derive(Debug, Serialize)]
pub struct TransactionCreated {
    #[serde(flatten)]
    pub transaction: Transaction,
    pub applied_suggestion: Option<CategorySuggestion>,
}
