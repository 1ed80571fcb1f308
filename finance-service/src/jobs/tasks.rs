//! Per-company work of each job.

use super::store::JobStore;
use crate::ml::categorization::TrainingSample;
use crate::ml::client::decimal_to_f64;
use crate::ml::config_store::keys;
use crate::ml::{
    AnomalyClient, CategorizationClient, CreditScoringClient, MlTransaction, ResultSource,
    TrainingStatus,
};
use chrono::{Duration, Utc};
use service_core::error::AppError;
use uuid::Uuid;

/// Labelled samples taken per category.
const SAMPLES_PER_CATEGORY: i64 = 500;
/// Transactions sent per anomaly request.
const ANOMALY_WINDOW_LIMIT: i64 = 5_000;
/// Customers re-scored per company per run.
const SCORING_BATCH: i64 = 200;

fn unavailable(service: &str) -> AppError {
    AppError::ServiceUnavailable(format!("{} service unavailable", service))
}

pub(super) async fn train_categorizer(
    store: &dyn JobStore,
    client: &CategorizationClient,
    company_id: Uuid,
) -> Result<u64, AppError> {
    let mut samples = Vec::new();
    for category in store.list_categories(company_id).await? {
        let labelled = store
            .categorized_samples(company_id, category.id, SAMPLES_PER_CATEGORY)
            .await?;
        samples.extend(labelled.into_iter().map(|t| TrainingSample {
            amount: decimal_to_f64(t.amount),
            kind: t.kind,
            description: t.description,
            category_id: category.id,
        }));
    }

    let outcome = client.train(company_id, &samples).await?;
    tracing::debug!(company_id = %company_id, status = ?outcome.status, samples = outcome.samples, "Categorizer training");

    match outcome.status {
        TrainingStatus::Trained => Ok(1),
        TrainingStatus::Skipped | TrainingStatus::Disabled => Ok(0),
        TrainingStatus::Unavailable => Err(unavailable("categorization")),
    }
}

pub(super) async fn train_anomaly_model(
    store: &dyn JobStore,
    client: &AnomalyClient,
    company_id: Uuid,
) -> Result<u64, AppError> {
    let lookback = client.config().await.get_u64(keys::LOOKBACK_DAYS).clamp(1, 3650) as i64;
    let to = Utc::now().date_naive();
    let from = to - Duration::days(lookback);

    let transactions: Vec<MlTransaction> = store
        .transactions_between(company_id, from, to, ANOMALY_WINDOW_LIMIT)
        .await?
        .iter()
        .map(MlTransaction::from)
        .collect();

    let outcome = client.train(company_id, &transactions).await?;
    match outcome.status {
        TrainingStatus::Trained => Ok(1),
        TrainingStatus::Skipped | TrainingStatus::Disabled => Ok(0),
        TrainingStatus::Unavailable => Err(unavailable("anomaly")),
    }
}

pub(super) async fn scan_anomalies(
    store: &dyn JobStore,
    client: &AnomalyClient,
    company_id: Uuid,
) -> Result<u64, AppError> {
    let lookback = client.config().await.get_u64(keys::LOOKBACK_DAYS).clamp(1, 3650) as i64;
    let to = Utc::now().date_naive();
    let from = to - Duration::days(lookback);

    let transactions: Vec<MlTransaction> = store
        .transactions_between(company_id, from, to, ANOMALY_WINDOW_LIMIT)
        .await?
        .iter()
        .map(MlTransaction::from)
        .collect();
    if transactions.is_empty() {
        return Ok(0);
    }

    let report = client.detect(company_id, &transactions).await?;
    if report.source == ResultSource::Fallback {
        return Err(unavailable("anomaly"));
    }

    let scores: Vec<(Uuid, f64)> = report
        .anomalies
        .iter()
        .map(|a| (a.transaction_id, a.score))
        .collect();
    store.mark_anomalies(company_id, &scores).await
}

pub(super) async fn refresh_credit_scores(
    store: &dyn JobStore,
    client: &CreditScoringClient,
    company_id: Uuid,
) -> Result<u64, AppError> {
    let scored_before = Utc::now() - Duration::days(client.refresh_days().await);
    let customers = store
        .customers_due_for_scoring(company_id, scored_before, SCORING_BATCH)
        .await?;

    let mut scored = 0;
    for customer in customers {
        let Some(features) = store.customer_features(company_id, customer.id).await? else {
            continue;
        };
        match client.score_customer(company_id, customer.id, &features).await? {
            Some(assessment) => {
                store
                    .record_credit_score(company_id, customer.id, &assessment)
                    .await?;
                scored += 1;
            }
            // Service went away mid-run; the rest would fall back too.
            None => return Err(unavailable("credit scoring")),
        }
    }
    Ok(scored)
}

pub(super) async fn sweep_overdue_invoices(
    store: &dyn JobStore,
    company_id: Uuid,
) -> Result<u64, AppError> {
    let marked = store
        .mark_overdue_invoices(company_id, Utc::now().date_naive())
        .await?;
    if marked > 0 {
        tracing::info!(company_id = %company_id, marked, "Invoices marked overdue");
    }
    Ok(marked)
}
