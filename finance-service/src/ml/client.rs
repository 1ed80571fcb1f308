//! HTTP plumbing shared by the ML service clients.

use crate::models::Transaction;
use crate::services::metrics::{record_ml_fallback, record_ml_request};
use chrono::NaiveDate;
use reqwest::Client;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use service_core::observability::TracedClientExt;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

/// Largest upstream error body kept for logs and error messages.
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Error)]
pub enum MlError {
    /// Connection refused, DNS failure or timeout.
    #[error("ML service unavailable: {0}")]
    Unavailable(String),

    #[error("ML service returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Invalid ML service response: {0}")]
    Decode(String),

    #[error("ML service disabled")]
    Disabled,
}

impl MlError {
    /// Errors after which callers degrade to their fallback result.
    pub fn is_fallback(&self) -> bool {
        matches!(self, MlError::Unavailable(_) | MlError::Disabled)
    }
}

impl From<MlError> for AppError {
    fn from(err: MlError) -> Self {
        match err {
            MlError::Unavailable(_) | MlError::Disabled => {
                AppError::ServiceUnavailable(err.to_string())
            }
            MlError::Upstream { .. } | MlError::Decode(_) => AppError::BadGateway(err.to_string()),
        }
    }
}

/// Whether a result came from the model or from the local fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultSource {
    Model,
    Fallback,
}

/// Transaction as sent to the ML services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlTransaction {
    pub id: Uuid,
    pub account_id: Uuid,
    pub category_id: Option<Uuid>,
    pub kind: String,
    pub amount: f64,
    pub description: String,
    pub occurred_on: NaiveDate,
}

impl From<&Transaction> for MlTransaction {
    fn from(t: &Transaction) -> Self {
        Self {
            id: t.id,
            account_id: t.account_id,
            category_id: t.category_id,
            kind: t.kind.clone(),
            amount: decimal_to_f64(t.amount),
            description: t.description.clone(),
            occurred_on: t.occurred_on,
        }
    }
}

pub(crate) fn decimal_to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingStatus {
    Trained,
    /// Not enough samples to train on.
    Skipped,
    Disabled,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingOutcome {
    pub status: TrainingStatus,
    pub samples: usize,
    pub model_version: Option<String>,
}

impl TrainingOutcome {
    pub(crate) fn without_call(status: TrainingStatus, samples: usize) -> Self {
        Self {
            status,
            samples,
            model_version: None,
        }
    }
}

/// Reply of the `/train` endpoints. Services may add fields.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct TrainResponse {
    #[serde(default)]
    pub model_version: Option<String>,
}

/// One pooled HTTP client for every ML service.
#[derive(Clone)]
pub struct MlHttpClient {
    client: Client,
}

impl MlHttpClient {
    pub fn new() -> Result<Self, AppError> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// POST `body` as JSON and decode the JSON reply. Single attempt, no
    /// retries.
    pub async fn post_json<Req, Resp>(
        &self,
        service: &'static str,
        url: &str,
        body: &Req,
        timeout: Duration,
    ) -> Result<Resp, MlError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let started = Instant::now();
        let result = self.send(url, body, timeout).await;
        let elapsed = started.elapsed().as_secs_f64();

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) if e.is_fallback() => "unavailable",
            Err(_) => "error",
        };
        record_ml_request(service, outcome, elapsed);

        match &result {
            Ok(_) => tracing::debug!(service, url, elapsed_secs = elapsed, "ML call succeeded"),
            Err(e) => tracing::warn!(service, url, error = %e, "ML call failed"),
        }

        result
    }

    async fn send<Req, Resp>(&self, url: &str, body: &Req, timeout: Duration) -> Result<Resp, MlError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let response = self
            .client
            .traced_post(url)
            .json(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        let text = response.text().await.map_err(classify)?;

        if !status.is_success() {
            let mut body = text;
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(MlError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&text).map_err(|e| MlError::Decode(e.to_string()))
    }
}

fn classify(err: reqwest::Error) -> MlError {
    if err.is_decode() {
        MlError::Decode(err.to_string())
    } else {
        // connect, timeout, request and body errors all mean the service
        // could not be reached in time
        MlError::Unavailable(err.to_string())
    }
}

/// Log and count a degraded result.
pub(crate) fn note_fallback(service: &'static str, err: &MlError) {
    record_ml_fallback(service);
    tracing::info!(service, reason = %err, "Using ML fallback");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn fallback_errors_map_to_503() {
        let err: AppError = MlError::Unavailable("connection refused".into()).into();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let err: AppError = MlError::Disabled.into();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn upstream_errors_map_to_502() {
        let err: AppError = MlError::Upstream {
            status: 500,
            body: "boom".into(),
        }
        .into();
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);

        let err: AppError = MlError::Decode("expected value".into()).into();
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn only_unavailable_and_disabled_fall_back() {
        assert!(MlError::Disabled.is_fallback());
        assert!(MlError::Unavailable(String::new()).is_fallback());
        assert!(!MlError::Decode(String::new()).is_fallback());
    }
}
