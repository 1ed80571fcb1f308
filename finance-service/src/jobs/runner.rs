use super::{JobKind, Jobs};
use crate::config::JobsConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Runs every job on its own interval until shutdown.
pub struct JobRunner {
    jobs: Arc<Jobs>,
    schedule: Vec<(JobKind, Duration)>,
}

impl JobRunner {
    pub fn new(jobs: Arc<Jobs>, config: &JobsConfig) -> Self {
        Self {
            jobs,
            schedule: vec![
                (
                    JobKind::CategorizationTraining,
                    config.categorization_training_interval,
                ),
                (JobKind::AnomalyTraining, config.anomaly_training_interval),
                (JobKind::AnomalyScan, config.anomaly_scan_interval),
                (JobKind::CreditScoringRefresh, config.credit_scoring_interval),
                (JobKind::InvoiceOverdueSweep, config.invoice_overdue_interval),
            ],
        }
    }

    /// Spawn one loop per job. Each loop exits when `shutdown` flips to
    /// true, after waiting for a run in progress.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.schedule
            .into_iter()
            .map(|(kind, period)| {
                let jobs = Arc::clone(&self.jobs);
                let shutdown = shutdown.clone();
                tokio::spawn(run_loop(jobs, kind, period, shutdown))
            })
            .collect()
    }
}

async fn run_loop(
    jobs: Arc<Jobs>,
    kind: JobKind,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; jobs start one period after boot.
    interval.tick().await;

    tracing::info!(job = %kind, period_secs = period.as_secs(), "Job scheduled");

    let mut current: Option<JoinHandle<()>> = None;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if jobs.is_running(kind) {
                    tracing::warn!(job = %kind, "Previous run still in progress, skipping tick");
                    continue;
                }
                let jobs = Arc::clone(&jobs);
                current = Some(tokio::spawn(async move {
                    // Errors are logged and counted inside `run`.
                    let _ = jobs.run(kind).await;
                }));
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    if let Some(run) = current {
        if !run.is_finished() {
            tracing::info!(job = %kind, "Waiting for in-flight run before shutdown");
        }
        let _ = run.await;
    }
    tracing::info!(job = %kind, "Job loop stopped");
}
