use crate::dtos::admin::{
    CompanyListParams, CreateCompanyRequest, InvalidateRequest, MlConfigCategoryResponse,
    UpsertMlConfigRequest,
};
use crate::dtos::{Page, Pagination};
use crate::middleware::AuthContext;
use crate::ml::{ConfigEvent, MlConfigCategory};
use crate::models::CreateCompany;
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

fn parse_category(raw: &str) -> Result<MlConfigCategory, AppError> {
    MlConfigCategory::from_string(raw).ok_or_else(|| AppError::not_found(format!("ML config category '{}'", raw)))
}

async fn category_view(
    state: &AppState,
    category: MlConfigCategory,
) -> Result<MlConfigCategoryResponse, AppError> {
    let overrides = state.db.list_ml_config(Some(category.as_str())).await?;
    Ok(MlConfigCategoryResponse {
        category: category.as_str().to_string(),
        effective: state.ml.config.get(category).await.effective(),
        overrides,
    })
}

/// Drop this instance's cache right away, then tell the others.
async fn publish_invalidation(state: &AppState, category: Option<MlConfigCategory>) {
    state.ml.config.invalidate(category);
    state
        .events
        .publish(ConfigEvent::Invalidated { category })
        .await;
}

pub async fn list_ml_config(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<impl IntoResponse, AppError> {
    auth.require_super_admin()?;
    let mut categories = Vec::with_capacity(MlConfigCategory::ALL.len());
    for category in MlConfigCategory::ALL {
        categories.push(category_view(&state, category).await?);
    }
    Ok(Json(categories))
}

pub async fn get_ml_config(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(category): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    auth.require_super_admin()?;
    let category = parse_category(&category)?;
    Ok(Json(category_view(&state, category).await?))
}

pub async fn upsert_ml_config(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((category, key)): Path<(String, String)>,
    Json(req): Json<UpsertMlConfigRequest>,
) -> Result<impl IntoResponse, AppError> {
    auth.require_super_admin()?;
    req.validate()?;
    let category = parse_category(&category)?;

    let defaults = state.ml.config.defaults(category);
    if !defaults.knows(&key) {
        return Err(AppError::bad_request(format!(
            "Unknown key '{}' for {}",
            key, category
        )));
    }
    let value = req.value.trim();
    if !defaults.accepts(&key, value) {
        return Err(AppError::bad_request(format!(
            "Invalid value '{}' for {}.{}",
            value, category, key
        )));
    }

    let entry = state
        .db
        .upsert_ml_config(category.as_str(), &key, value, req.description.as_deref())
        .await?;
    publish_invalidation(&state, Some(category)).await;

    tracing::info!(user_id = %auth.user_id, category = %category, key = %key, "ML config override set");
    Ok(Json(entry))
}

pub async fn delete_ml_config(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((category, key)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    auth.require_super_admin()?;
    let category = parse_category(&category)?;

    if !state.db.delete_ml_config(category.as_str(), &key).await? {
        return Err(AppError::not_found(format!("ML config {}.{}", category, key)));
    }
    publish_invalidation(&state, Some(category)).await;

    tracing::info!(user_id = %auth.user_id, category = %category, key = %key, "ML config override removed");
    Ok(StatusCode::NO_CONTENT)
}

/// Drop cached config on every instance, for one category or all of them.
pub async fn invalidate_ml_config(
    State(state): State<AppState>,
    auth: AuthContext,
    body: Option<Json<InvalidateRequest>>,
) -> Result<impl IntoResponse, AppError> {
    auth.require_super_admin()?;
    let category = match body.and_then(|Json(req)| req.category) {
        Some(raw) => Some(parse_category(&raw)?),
        None => None,
    };

    publish_invalidation(&state, category).await;
    Ok(StatusCode::ACCEPTED)
}

pub async fn list_companies(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(params): Query<CompanyListParams>,
) -> Result<impl IntoResponse, AppError> {
    auth.require_super_admin()?;
    let pagination = Pagination::new(params.page, params.page_size)?;
    let (companies, total) = state
        .db
        .list_companies(false, pagination.limit(), pagination.offset())
        .await?;
    Ok(Json(Page::new(companies, pagination, total)))
}

pub async fn create_company(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateCompanyRequest>,
) -> Result<impl IntoResponse, AppError> {
    auth.require_super_admin()?;
    req.validate()?;
    let company = state
        .db
        .create_company(&CreateCompany {
            name: req.name.trim().to_string(),
        })
        .await?;
    Ok((StatusCode::CREATED, Json(company)))
}

pub async fn get_company(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    auth.require_super_admin()?;
    let company = state
        .db
        .get_company(id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("Company {}", id)))?;
    Ok(Json(company))
}

pub async fn run_job(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    auth.require_super_admin()?;
    tracing::info!(user_id = %auth.user_id, job = %name, "Job triggered manually");
    let report = state.jobs.run_job_now(&name).await?;
    Ok(Json(report))
}
