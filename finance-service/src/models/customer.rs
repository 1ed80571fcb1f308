//! Customer model and the payment-history features used for credit scoring.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Customer {
    pub id: Uuid,
    pub company_id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub credit_score: Option<i32>,
    pub risk_level: Option<String>,
    pub scored_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateCustomer {
    pub company_id: Uuid,
    pub name: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateCustomer {
    pub name: Option<String>,
    pub email: Option<String>,
}

/// Aggregated invoice history of one customer.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct CustomerFeatures {
    pub invoice_count: i64,
    pub paid_count: i64,
    pub overdue_count: i64,
    pub total_invoiced: Decimal,
    pub total_outstanding: Decimal,
    pub avg_days_to_pay: Option<f64>,
    pub customer_age_days: i64,
}

/// Result of a credit scoring run, ready to persist.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreditAssessment {
    pub score: i32,
    pub risk_level: String,
}
