//! Batch job tests over an in-memory store and mocked ML services.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use finance_service::config::{JobsConfig, MlServicesConfig};
use finance_service::jobs::{JobKind, JobRunner, JobStore, Jobs};
use finance_service::ml::config_store::keys;
use finance_service::ml::{
    InMemoryConfigSource, MlClients, MlConfigCategory, MlConfigStore, MlHttpClient,
};
use finance_service::models::{
    Category, Company, CreditAssessment, Customer, CustomerFeatures, Transaction,
};
use rust_decimal::Decimal;
use serde_json::json;
use service_core::error::AppError;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DEAD_URL: &str = "http://127.0.0.1:1";

#[derive(Default)]
struct MemoryStore {
    companies: Vec<Company>,
    failing: HashSet<Uuid>,
    overdue_per_company: u64,
    transactions: HashMap<Uuid, Vec<Transaction>>,
    customers: HashMap<Uuid, Vec<Customer>>,
    pages: Mutex<Vec<i64>>,
    flagged: Mutex<Vec<(Uuid, Uuid, f64)>>,
    scored: Mutex<Vec<(Uuid, CreditAssessment)>>,
    sweeps: AtomicUsize,
    /// When set, every overdue sweep waits for a permit.
    sweep_gate: Option<Arc<Semaphore>>,
}

impl MemoryStore {
    fn with_companies(count: usize) -> Self {
        Self {
            companies: (0..count)
                .map(|i| Company {
                    id: Uuid::new_v4(),
                    name: format!("Company {}", i),
                    active: true,
                    created_at: Utc::now(),
                })
                .collect(),
            ..Default::default()
        }
    }

    fn check(&self, company_id: Uuid) -> Result<(), AppError> {
        if self.failing.contains(&company_id) {
            return Err(AppError::DatabaseError(anyhow::anyhow!("connection reset")));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn list_active_companies(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Company>, AppError> {
        self.pages.lock().unwrap().push(offset);
        Ok(self
            .companies
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn list_categories(&self, company_id: Uuid) -> Result<Vec<Category>, AppError> {
        self.check(company_id)?;
        Ok(Vec::new())
    }

    async fn categorized_samples(
        &self,
        company_id: Uuid,
        _category_id: Uuid,
        _limit: i64,
    ) -> Result<Vec<Transaction>, AppError> {
        self.check(company_id)?;
        Ok(Vec::new())
    }

    async fn transactions_between(
        &self,
        company_id: Uuid,
        _from: NaiveDate,
        _to: NaiveDate,
        _limit: i64,
    ) -> Result<Vec<Transaction>, AppError> {
        self.check(company_id)?;
        Ok(self.transactions.get(&company_id).cloned().unwrap_or_default())
    }

    async fn mark_anomalies(
        &self,
        company_id: Uuid,
        scores: &[(Uuid, f64)],
    ) -> Result<u64, AppError> {
        let mut flagged = self.flagged.lock().unwrap();
        for (id, score) in scores {
            flagged.push((company_id, *id, *score));
        }
        Ok(scores.len() as u64)
    }

    async fn customers_due_for_scoring(
        &self,
        company_id: Uuid,
        _scored_before: DateTime<Utc>,
        _limit: i64,
    ) -> Result<Vec<Customer>, AppError> {
        self.check(company_id)?;
        Ok(self.customers.get(&company_id).cloned().unwrap_or_default())
    }

    async fn customer_features(
        &self,
        _company_id: Uuid,
        _customer_id: Uuid,
    ) -> Result<Option<CustomerFeatures>, AppError> {
        Ok(Some(CustomerFeatures {
            invoice_count: 4,
            paid_count: 4,
            overdue_count: 0,
            total_invoiced: Decimal::new(400_000, 2),
            total_outstanding: Decimal::ZERO,
            avg_days_to_pay: Some(12.0),
            customer_age_days: 200,
        }))
    }

    async fn record_credit_score(
        &self,
        _company_id: Uuid,
        customer_id: Uuid,
        assessment: &CreditAssessment,
    ) -> Result<(), AppError> {
        self.scored
            .lock()
            .unwrap()
            .push((customer_id, assessment.clone()));
        Ok(())
    }

    async fn mark_overdue_invoices(
        &self,
        company_id: Uuid,
        _today: NaiveDate,
    ) -> Result<u64, AppError> {
        self.check(company_id)?;
        self.sweeps.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.sweep_gate {
            let _permit = gate.acquire().await.unwrap();
        }
        Ok(self.overdue_per_company)
    }
}

fn transaction(company_id: Uuid) -> Transaction {
    Transaction {
        id: Uuid::new_v4(),
        company_id,
        account_id: Uuid::new_v4(),
        category_id: None,
        kind: "debit".to_string(),
        amount: Decimal::new(99_900, 2),
        description: "Wire transfer".to_string(),
        occurred_on: Utc::now().date_naive(),
        category_source: "none".to_string(),
        category_confidence: None,
        anomaly_score: None,
        flagged: false,
        created_at: Utc::now(),
    }
}

fn customer(company_id: Uuid) -> Customer {
    Customer {
        id: Uuid::new_v4(),
        company_id,
        name: "Acme Ltd".to_string(),
        email: None,
        credit_score: None,
        risk_level: None,
        scored_at: None,
        created_at: Utc::now(),
    }
}

fn jobs_with(
    store: Arc<MemoryStore>,
    base_url: &str,
    source: Arc<InMemoryConfigSource>,
    page_size: i64,
) -> Jobs {
    let urls = MlServicesConfig {
        categorization_url: base_url.to_string(),
        anomaly_url: base_url.to_string(),
        duplicates_url: base_url.to_string(),
        budget_url: base_url.to_string(),
        credit_scoring_url: base_url.to_string(),
        config_cache_ttl: Duration::from_secs(60),
    };
    let config = Arc::new(MlConfigStore::new(source, urls));
    let ml = MlClients::new(MlHttpClient::new().unwrap(), config);
    Jobs::new(store, ml, page_size)
}

#[tokio::test]
async fn overdue_sweep_pages_through_every_company() {
    let store = Arc::new(MemoryStore {
        overdue_per_company: 3,
        ..MemoryStore::with_companies(5)
    });
    let jobs = jobs_with(store.clone(), DEAD_URL, Arc::new(InMemoryConfigSource::new()), 2);

    let report = jobs.run(JobKind::InvoiceOverdueSweep).await.unwrap();

    assert_eq!(report.companies, 5);
    assert_eq!(report.processed, 15);
    assert_eq!(report.failures, 0);
    assert!(!report.skipped);
    assert_eq!(*store.pages.lock().unwrap(), vec![0, 2, 4]);
}

#[tokio::test]
async fn exact_multiple_of_page_size_asks_for_one_empty_page() {
    let store = Arc::new(MemoryStore {
        overdue_per_company: 1,
        ..MemoryStore::with_companies(4)
    });
    let jobs = jobs_with(store.clone(), DEAD_URL, Arc::new(InMemoryConfigSource::new()), 2);

    let report = jobs.run(JobKind::InvoiceOverdueSweep).await.unwrap();

    assert_eq!(report.companies, 4);
    assert_eq!(*store.pages.lock().unwrap(), vec![0, 2, 4]);
}

#[tokio::test]
async fn failing_company_does_not_stop_the_job() {
    let mut store = MemoryStore {
        overdue_per_company: 2,
        ..MemoryStore::with_companies(4)
    };
    store.failing.insert(store.companies[1].id);
    let jobs = jobs_with(Arc::new(store), DEAD_URL, Arc::new(InMemoryConfigSource::new()), 10);

    let report = jobs.run(JobKind::InvoiceOverdueSweep).await.unwrap();

    assert_eq!(report.companies, 4);
    assert_eq!(report.failures, 1);
    assert_eq!(report.processed, 6);
}

#[tokio::test]
async fn disabled_category_skips_the_job() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "anomalies": [] })))
        .expect(0)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::with_companies(3));
    let source = Arc::new(InMemoryConfigSource::new());
    source.set(MlConfigCategory::Anomaly, keys::ENABLED, "false");
    let jobs = jobs_with(store.clone(), &server.uri(), source, 10);

    let report = jobs.run(JobKind::AnomalyScan).await.unwrap();

    assert!(report.skipped);
    assert_eq!(report.companies, 0);
    assert!(store.pages.lock().unwrap().is_empty());
}

#[tokio::test]
async fn anomaly_scan_flags_scored_transactions() {
    let server = MockServer::start().await;
    let mut store = MemoryStore::with_companies(1);
    let company_id = store.companies[0].id;
    let suspicious = transaction(company_id);
    let ordinary = transaction(company_id);

    Mock::given(method("POST"))
        .and(path("/detect"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "anomalies": [
                { "transaction_id": suspicious.id, "score": 0.93 },
                { "transaction_id": ordinary.id, "score": 0.2 }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    store
        .transactions
        .insert(company_id, vec![suspicious.clone(), ordinary]);
    let store = Arc::new(store);
    let jobs = jobs_with(store.clone(), &server.uri(), Arc::new(InMemoryConfigSource::new()), 10);

    let report = jobs.run(JobKind::AnomalyScan).await.unwrap();

    assert_eq!(report.processed, 1);
    assert_eq!(report.failures, 0);
    assert_eq!(
        *store.flagged.lock().unwrap(),
        vec![(company_id, suspicious.id, 0.93)]
    );
}

#[tokio::test]
async fn unreachable_service_counts_as_company_failure() {
    let mut store = MemoryStore::with_companies(2);
    for company in store.companies.clone() {
        store
            .transactions
            .insert(company.id, vec![transaction(company.id)]);
    }
    let store = Arc::new(store);
    let jobs = jobs_with(store.clone(), DEAD_URL, Arc::new(InMemoryConfigSource::new()), 10);

    let report = jobs.run(JobKind::AnomalyScan).await.unwrap();

    assert_eq!(report.companies, 2);
    assert_eq!(report.failures, 2);
    assert!(store.flagged.lock().unwrap().is_empty());
}

#[tokio::test]
async fn credit_refresh_persists_assessments() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/score-customer"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "score": 640.2 })))
        .expect(2)
        .mount(&server)
        .await;

    let mut store = MemoryStore::with_companies(1);
    let company_id = store.companies[0].id;
    store.customers.insert(
        company_id,
        vec![customer(company_id), customer(company_id)],
    );
    let store = Arc::new(store);
    let jobs = jobs_with(store.clone(), &server.uri(), Arc::new(InMemoryConfigSource::new()), 10);

    let report = jobs.run(JobKind::CreditScoringRefresh).await.unwrap();

    assert_eq!(report.processed, 2);
    let scored = store.scored.lock().unwrap();
    assert_eq!(scored.len(), 2);
    assert!(scored
        .iter()
        .all(|(_, a)| a.score == 640 && a.risk_level == "medium"));
}

#[tokio::test]
async fn categorizer_training_without_labels_trains_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/train"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(0)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::with_companies(2));
    let jobs = jobs_with(store, &server.uri(), Arc::new(InMemoryConfigSource::new()), 10);

    let report = jobs.run(JobKind::CategorizationTraining).await.unwrap();
    assert_eq!(report.companies, 2);
    assert_eq!(report.processed, 0);
    assert_eq!(report.failures, 0);
}

#[tokio::test]
async fn unknown_job_name_is_not_found() {
    let jobs = jobs_with(
        Arc::new(MemoryStore::default()),
        DEAD_URL,
        Arc::new(InMemoryConfigSource::new()),
        10,
    );
    assert!(matches!(
        jobs.run_job_now("nightly_backup").await,
        Err(AppError::NotFound(_))
    ));
    assert!(jobs.run_job_now("invoice_overdue_sweep").await.is_ok());
}

#[tokio::test]
async fn overlapping_run_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/detect"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "anomalies": [] }))
                .set_delay(Duration::from_millis(400)),
        )
        .mount(&server)
        .await;

    let mut store = MemoryStore::with_companies(1);
    let company_id = store.companies[0].id;
    store
        .transactions
        .insert(company_id, vec![transaction(company_id)]);
    let jobs = Arc::new(jobs_with(
        Arc::new(store),
        &server.uri(),
        Arc::new(InMemoryConfigSource::new()),
        10,
    ));

    let first = tokio::spawn({
        let jobs = jobs.clone();
        async move { jobs.run(JobKind::AnomalyScan).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(jobs.is_running(JobKind::AnomalyScan));
    assert!(matches!(
        jobs.run(JobKind::AnomalyScan).await,
        Err(AppError::Conflict(_))
    ));

    let report = first.await.unwrap().unwrap();
    assert_eq!(report.failures, 0);
    assert!(!jobs.is_running(JobKind::AnomalyScan));
}

#[tokio::test(start_paused = true)]
async fn runner_skips_busy_ticks_and_stops_on_shutdown() {
    let gate = Arc::new(Semaphore::new(0));
    let store = Arc::new(MemoryStore {
        overdue_per_company: 1,
        sweep_gate: Some(gate.clone()),
        ..MemoryStore::with_companies(1)
    });
    let jobs = Arc::new(jobs_with(
        store.clone(),
        DEAD_URL,
        Arc::new(InMemoryConfigSource::new()),
        10,
    ));
    let day = Duration::from_secs(24 * 60 * 60);
    let config = JobsConfig {
        enabled: true,
        company_page_size: 10,
        categorization_training_interval: day,
        anomaly_training_interval: day,
        anomaly_scan_interval: day,
        credit_scoring_interval: day,
        invoice_overdue_interval: Duration::from_secs(10),
    };
    let (stop, shutdown) = watch::channel(false);
    let handles = JobRunner::new(jobs.clone(), &config).spawn(shutdown);

    // The run started at 10s is stuck; the ticks at 20s and 30s find it busy.
    tokio::time::sleep(Duration::from_secs(35)).await;
    assert!(jobs.is_running(JobKind::InvoiceOverdueSweep));
    assert_eq!(store.sweeps.load(Ordering::SeqCst), 1);

    // Unblocked, the ticks at 40s and 50s each run once.
    gate.add_permits(100);
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(!jobs.is_running(JobKind::InvoiceOverdueSweep));
    assert_eq!(store.sweeps.load(Ordering::SeqCst), 3);

    stop.send(true).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(store.sweeps.load(Ordering::SeqCst), 3);
}
