//! Transaction model.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Direction of money movement relative to the account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Credit,
    Debit,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Credit => "credit",
            Self::Debit => "debit",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "credit" => Self::Credit,
            _ => Self::Debit,
        }
    }

    /// Effect of `amount` on the account balance.
    pub fn balance_delta(&self, amount: Decimal) -> Decimal {
        match self {
            Self::Credit => amount,
            Self::Debit => -amount,
        }
    }
}

/// Who assigned the category of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CategorySource {
    None,
    Manual,
    Ml,
}

impl CategorySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Manual => "manual",
            Self::Ml => "ml",
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub company_id: Uuid,
    pub account_id: Uuid,
    pub category_id: Option<Uuid>,
    pub kind: String,
    pub amount: Decimal,
    pub description: String,
    pub occurred_on: NaiveDate,
    pub category_source: String,
    pub category_confidence: Option<f64>,
    pub anomaly_score: Option<f64>,
    pub flagged: bool,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn parsed_kind(&self) -> TransactionKind {
        TransactionKind::from_string(&self.kind)
    }

    /// Amount with sign: positive for credits, negative for debits.
    pub fn signed_amount(&self) -> Decimal {
        self.parsed_kind().balance_delta(self.amount)
    }
}

#[derive(Debug, Clone)]
pub struct CreateTransaction {
    pub company_id: Uuid,
    pub account_id: Uuid,
    pub category_id: Option<Uuid>,
    pub category_source: CategorySource,
    pub category_confidence: Option<f64>,
    pub kind: TransactionKind,
    pub amount: Decimal,
    pub description: String,
    pub occurred_on: NaiveDate,
}

/// Edits to a booked transaction. `category` is `Some` when the category
/// changes; `Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct TransactionChanges {
    pub description: Option<String>,
    pub occurred_on: Option<NaiveDate>,
    pub category: Option<Option<Uuid>>,
}

#[derive(Debug, Clone, Default)]
pub struct ListTransactionsFilter {
    pub account_id: Option<Uuid>,
    pub category_id: Option<Uuid>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub flagged: Option<bool>,
    pub limit: i64,
    pub offset: i64,
}
