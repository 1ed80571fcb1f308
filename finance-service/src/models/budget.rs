//! Monthly budget per category.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetSource {
    Manual,
    Recommended,
}

impl BudgetSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Recommended => "recommended",
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Budget {
    pub id: Uuid,
    pub company_id: Uuid,
    pub category_id: Uuid,
    pub month: NaiveDate,
    pub amount: Decimal,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct UpsertBudget {
    pub company_id: Uuid,
    pub category_id: Uuid,
    /// Always the first day of the month.
    pub month: NaiveDate,
    pub amount: Decimal,
    pub source: BudgetSource,
}

/// Total spend of one category in one calendar month.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct MonthlySpend {
    pub month: NaiveDate,
    pub amount: Decimal,
}
