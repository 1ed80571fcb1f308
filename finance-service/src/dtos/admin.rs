use crate::models::MlConfigEntry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct UpsertMlConfigRequest {
    #[validate(length(min = 1, max = 1024, message = "Value is required"))]
    pub value: String,
    #[validate(length(max = 500))]
    pub description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct InvalidateRequest {
    /// Category to drop; everything when absent.
    pub category: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MlConfigCategoryResponse {
    pub category: String,
    pub effective: BTreeMap<String, String>,
    pub overrides: Vec<MlConfigEntry>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateCompanyRequest {
    #[validate(length(min = 1, max = 255, message = "Company name is required"))]
    pub name: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CompanyListParams {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}
