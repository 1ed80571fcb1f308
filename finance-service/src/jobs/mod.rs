//! Scheduled batch jobs.
//!
//! Every job walks the active companies page by page and does its work per
//! company. A failing company is logged and counted; the job carries on with
//! the next one.

mod runner;
mod store;
mod tasks;

pub use runner::JobRunner;
pub use store::JobStore;

use crate::ml::MlClients;
use crate::services::metrics::record_job_run;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    CategorizationTraining,
    AnomalyTraining,
    AnomalyScan,
    CreditScoringRefresh,
    InvoiceOverdueSweep,
}

impl JobKind {
    pub const ALL: [JobKind; 5] = [
        Self::CategorizationTraining,
        Self::AnomalyTraining,
        Self::AnomalyScan,
        Self::CreditScoringRefresh,
        Self::InvoiceOverdueSweep,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CategorizationTraining => "categorization_training",
            Self::AnomalyTraining => "anomaly_training",
            Self::AnomalyScan => "anomaly_scan",
            Self::CreditScoringRefresh => "credit_scoring_refresh",
            Self::InvoiceOverdueSweep => "invoice_overdue_sweep",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub job: JobKind,
    pub companies: usize,
    /// Items handled: models trained, transactions flagged, customers
    /// scored or invoices marked overdue.
    pub processed: u64,
    pub failures: usize,
    /// The job's ML category is disabled; nothing ran.
    pub skipped: bool,
}

impl JobReport {
    fn new(job: JobKind) -> Self {
        Self {
            job,
            companies: 0,
            processed: 0,
            failures: 0,
            skipped: false,
        }
    }
}

/// Executes jobs on demand. [`JobRunner`] drives it on a schedule.
pub struct Jobs {
    store: Arc<dyn JobStore>,
    ml: MlClients,
    page_size: i64,
    running: Mutex<HashSet<JobKind>>,
}

/// Marks a job as running until dropped.
struct RunningGuard<'a> {
    running: &'a Mutex<HashSet<JobKind>>,
    kind: JobKind,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(&self.kind);
        }
    }
}

impl Jobs {
    pub fn new(store: Arc<dyn JobStore>, ml: MlClients, page_size: i64) -> Self {
        Self {
            store,
            ml,
            page_size: page_size.max(1),
            running: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_running(&self, kind: JobKind) -> bool {
        self.running
            .lock()
            .map(|running| running.contains(&kind))
            .unwrap_or(false)
    }

    fn try_start(&self, kind: JobKind) -> Option<RunningGuard<'_>> {
        let mut running = self.running.lock().ok()?;
        if !running.insert(kind) {
            return None;
        }
        Some(RunningGuard {
            running: &self.running,
            kind,
        })
    }

    /// Run one job by name, for the admin endpoint.
    pub async fn run_job_now(&self, name: &str) -> Result<JobReport, AppError> {
        let kind = JobKind::from_string(name).ok_or_else(|| AppError::not_found(format!("Job '{}'", name)))?;
        self.run(kind).await
    }

    /// Run `kind` once across all active companies. Fails with `Conflict`
    /// when the job is already running.
    #[tracing::instrument(skip(self), fields(job = %kind))]
    pub async fn run(&self, kind: JobKind) -> Result<JobReport, AppError> {
        let _guard = self.try_start(kind).ok_or_else(|| {
            AppError::Conflict(anyhow::anyhow!("Job {} is already running", kind))
        })?;

        let started = Instant::now();
        let result = self.run_all_companies(kind).await;
        let elapsed = started.elapsed().as_secs_f64();

        let outcome = match &result {
            Ok(report) if report.skipped => "skipped",
            Ok(report) if report.failures > 0 => "partial",
            Ok(_) => "success",
            Err(_) => "error",
        };
        record_job_run(kind.as_str(), outcome, elapsed);

        match &result {
            Ok(report) => tracing::info!(
                companies = report.companies,
                processed = report.processed,
                failures = report.failures,
                skipped = report.skipped,
                elapsed_secs = elapsed,
                "Job finished"
            ),
            Err(e) => tracing::error!(error = %e, "Job aborted"),
        }

        result
    }

    async fn run_all_companies(&self, kind: JobKind) -> Result<JobReport, AppError> {
        let mut report = JobReport::new(kind);

        if !self.category_enabled(kind).await {
            tracing::info!("ML category disabled, skipping job");
            report.skipped = true;
            return Ok(report);
        }

        let mut offset = 0;
        loop {
            let companies = self
                .store
                .list_active_companies(self.page_size, offset)
                .await?;

            for company in &companies {
                report.companies += 1;
                match self.run_for_company(kind, company.id).await {
                    Ok(processed) => report.processed += processed,
                    Err(e) => {
                        report.failures += 1;
                        tracing::warn!(company_id = %company.id, error = %e, "Job failed for company");
                    }
                }
            }

            if (companies.len() as i64) < self.page_size {
                break;
            }
            offset += self.page_size;
        }

        Ok(report)
    }

    async fn category_enabled(&self, kind: JobKind) -> bool {
        match kind {
            JobKind::CategorizationTraining => self.ml.categorization.config().await.enabled(),
            JobKind::AnomalyTraining | JobKind::AnomalyScan => {
                self.ml.anomaly.config().await.enabled()
            }
            JobKind::CreditScoringRefresh => self.ml.credit_scoring.config().await.enabled(),
            JobKind::InvoiceOverdueSweep => true,
        }
    }

    async fn run_for_company(&self, kind: JobKind, company_id: Uuid) -> Result<u64, AppError> {
        let store = self.store.as_ref();
        match kind {
            JobKind::CategorizationTraining => {
                tasks::train_categorizer(store, &self.ml.categorization, company_id).await
            }
            JobKind::AnomalyTraining => {
                tasks::train_anomaly_model(store, &self.ml.anomaly, company_id).await
            }
            JobKind::AnomalyScan => tasks::scan_anomalies(store, &self.ml.anomaly, company_id).await,
            JobKind::CreditScoringRefresh => {
                tasks::refresh_credit_scores(store, &self.ml.credit_scoring, company_id).await
            }
            JobKind::InvoiceOverdueSweep => tasks::sweep_overdue_invoices(store, company_id).await,
        }
    }
}
