use crate::models::{AccountType, CategoryKind};
use rust_decimal::Decimal;
use serde::Deserialize;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateAccountRequest {
    #[validate(length(min = 1, max = 255, message = "Account name is required"))]
    pub name: String,
    pub account_type: AccountType,
    pub currency: String,
    #[serde(default)]
    pub opening_balance: Option<Decimal>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateAccountRequest {
    #[validate(length(min = 1, max = 255, message = "Account name is required"))]
    pub name: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct AccountListParams {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    #[serde(default)]
    pub include_archived: bool,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateCategoryRequest {
    #[validate(length(min = 1, max = 255, message = "Category name is required"))]
    pub name: String,
    pub kind: CategoryKind,
}
