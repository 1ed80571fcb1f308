use crate::ml::{BudgetRecommendation, ResultSource};
use crate::models::{CreditAssessment, Customer, InvoiceStatus};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateCustomerRequest {
    #[validate(length(min = 1, max = 255, message = "Customer name is required"))]
    pub name: String,
    #[validate(email)]
    pub email: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateCustomerRequest {
    #[validate(length(min = 1, max = 255))]
    pub name: Option<String>,
    #[validate(email)]
    pub email: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreditScoreResponse {
    pub customer: Customer,
    pub assessment: CreditAssessment,
    pub source: ResultSource,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateInvoiceRequest {
    pub customer_id: Uuid,
    #[validate(length(min = 1, max = 64, message = "Invoice number is required"))]
    pub number: String,
    pub amount: Decimal,
    pub currency: String,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
}

#[derive(Debug, Deserialize)]
pub struct UpdateInvoiceStatusRequest {
    pub status: InvoiceStatus,
}

#[derive(Debug, Default, Deserialize)]
pub struct InvoiceListParams {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    pub status: Option<InvoiceStatus>,
}

#[derive(Debug, Deserialize)]
pub struct UpsertBudgetRequest {
    pub category_id: Uuid,
    /// Any day of the month; stored as the first.
    pub month: NaiveDate,
    pub amount: Decimal,
}

#[derive(Debug, Default, Deserialize)]
pub struct BudgetListParams {
    pub month: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
pub struct RecommendationParams {
    pub category_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct RecommendationResponse {
    #[serde(flatten)]
    pub recommendation: BudgetRecommendation,
    pub month: NaiveDate,
}
