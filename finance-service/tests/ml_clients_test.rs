//! ML client tests against mocked services.

use chrono::NaiveDate;
use finance_service::config::MlServicesConfig;
use finance_service::ml::config_store::keys;
use finance_service::ml::{
    InMemoryConfigSource, MlClients, MlConfigCategory, MlConfigStore, MlError, MlHttpClient,
    MlTransaction, ResultSource, TrainingSample, TrainingStatus,
};
use finance_service::models::{CustomerFeatures, MonthlySpend};
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Port 1 is never listening.
const DEAD_URL: &str = "http://127.0.0.1:1";

fn clients_for(base_url: &str, source: Arc<InMemoryConfigSource>) -> MlClients {
    let urls = MlServicesConfig {
        categorization_url: base_url.to_string(),
        anomaly_url: base_url.to_string(),
        duplicates_url: base_url.to_string(),
        budget_url: base_url.to_string(),
        credit_scoring_url: base_url.to_string(),
        config_cache_ttl: Duration::from_secs(60),
    };
    let store = Arc::new(MlConfigStore::new(source, urls));
    MlClients::new(MlHttpClient::new().unwrap(), store)
}

fn txn(id: Uuid) -> MlTransaction {
    MlTransaction {
        id,
        account_id: Uuid::new_v4(),
        category_id: None,
        kind: "debit".to_string(),
        amount: 18.5,
        description: "Taxi to airport".to_string(),
        occurred_on: NaiveDate::from_ymd_opt(2025, 5, 12).unwrap(),
    }
}

fn features() -> CustomerFeatures {
    CustomerFeatures {
        invoice_count: 12,
        paid_count: 10,
        overdue_count: 1,
        total_invoiced: Decimal::new(1_250_000, 2),
        total_outstanding: Decimal::new(120_000, 2),
        avg_days_to_pay: Some(21.5),
        customer_age_days: 400,
    }
}

#[tokio::test]
async fn categorize_keeps_confident_predictions_for_sent_transactions() {
    let server = MockServer::start().await;
    let company = Uuid::new_v4();
    let (t1, t2) = (Uuid::new_v4(), Uuid::new_v4());
    let category = Uuid::new_v4();

    Mock::given(method("POST"))
        .and(path("/categorize"))
        .and(body_partial_json(json!({ "company_id": company })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "predictions": [
                { "transaction_id": t1, "category_id": category, "confidence": 0.92 },
                { "transaction_id": t2, "category_id": category, "confidence": 0.31 },
                { "transaction_id": Uuid::new_v4(), "category_id": category, "confidence": 0.99 }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let ml = clients_for(&server.uri(), Arc::new(InMemoryConfigSource::new()));
    let result = ml
        .categorization
        .categorize(company, &[txn(t1), txn(t2)])
        .await
        .unwrap();

    assert_eq!(result.source, ResultSource::Model);
    assert_eq!(result.suggestions.len(), 1);
    assert_eq!(result.suggestions[0].transaction_id, t1);
    assert_eq!(result.suggestions[0].category_id, category);
}

#[tokio::test]
async fn categorize_sends_batch_size_chunks() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/categorize"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "predictions": [] })))
        .expect(2)
        .mount(&server)
        .await;

    let source = Arc::new(InMemoryConfigSource::new());
    source.set(MlConfigCategory::Categorization, keys::BATCH_SIZE, "2");
    let ml = clients_for(&server.uri(), source);

    let batch: Vec<_> = (0..3).map(|_| txn(Uuid::new_v4())).collect();
    let result = ml
        .categorization
        .categorize(Uuid::new_v4(), &batch)
        .await
        .unwrap();
    assert_eq!(result.source, ResultSource::Model);
    assert!(result.suggestions.is_empty());
}

#[tokio::test]
async fn categorize_falls_back_when_service_is_down() {
    let ml = clients_for(DEAD_URL, Arc::new(InMemoryConfigSource::new()));
    let result = ml
        .categorization
        .categorize(Uuid::new_v4(), &[txn(Uuid::new_v4())])
        .await
        .unwrap();

    assert_eq!(result.source, ResultSource::Fallback);
    assert!(result.suggestions.is_empty());
}

#[tokio::test]
async fn training_below_min_samples_is_skipped_without_a_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/train"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(0)
        .mount(&server)
        .await;

    let ml = clients_for(&server.uri(), Arc::new(InMemoryConfigSource::new()));
    let samples = vec![TrainingSample {
        description: "Office rent".to_string(),
        amount: 1500.0,
        kind: "debit".to_string(),
        category_id: Uuid::new_v4(),
    }];

    let outcome = ml
        .categorization
        .train(Uuid::new_v4(), &samples)
        .await
        .unwrap();
    assert_eq!(outcome.status, TrainingStatus::Skipped);
    assert_eq!(outcome.samples, 1);
}

#[tokio::test]
async fn anomalies_below_threshold_are_dropped_and_sorted() {
    let server = MockServer::start().await;
    let (t1, t2, t3) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

    Mock::given(method("POST"))
        .and(path("/detect"))
        .and(body_partial_json(json!({ "sensitivity": 0.95 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "anomalies": [
                { "transaction_id": t1, "score": 0.85, "reason": "amount spike" },
                { "transaction_id": t2, "score": 0.4 },
                { "transaction_id": t3, "score": 1.7 }
            ]
        })))
        .mount(&server)
        .await;

    let ml = clients_for(&server.uri(), Arc::new(InMemoryConfigSource::new()));
    let report = ml
        .anomaly
        .detect(Uuid::new_v4(), &[txn(t1), txn(t2), txn(t3)])
        .await
        .unwrap();

    assert_eq!(report.source, ResultSource::Model);
    let ids: Vec<_> = report.anomalies.iter().map(|a| a.transaction_id).collect();
    assert_eq!(ids, vec![t3, t1]);
    assert_eq!(report.anomalies[0].score, 1.0);
    assert_eq!(report.anomalies[1].reason.as_deref(), Some("amount spike"));
}

#[tokio::test]
async fn anomaly_threshold_override_applies() {
    let server = MockServer::start().await;
    let t1 = Uuid::new_v4();
    Mock::given(method("POST"))
        .and(path("/detect"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "anomalies": [{ "transaction_id": t1, "score": 0.5 }]
        })))
        .mount(&server)
        .await;

    let source = Arc::new(InMemoryConfigSource::new());
    source.set(MlConfigCategory::Anomaly, keys::SCORE_THRESHOLD, "0.5");
    let ml = clients_for(&server.uri(), source);

    let report = ml.anomaly.detect(Uuid::new_v4(), &[txn(t1)]).await.unwrap();
    assert_eq!(report.anomalies.len(), 1);
}

#[tokio::test]
async fn slow_service_times_out_into_fallback() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/detect"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "anomalies": [] }))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let source = Arc::new(InMemoryConfigSource::new());
    source.set(MlConfigCategory::Anomaly, keys::TIMEOUT_MS, "50");
    let ml = clients_for(&server.uri(), source);

    let report = ml
        .anomaly
        .detect(Uuid::new_v4(), &[txn(Uuid::new_v4())])
        .await
        .unwrap();
    assert_eq!(report.source, ResultSource::Fallback);
    assert!(report.anomalies.is_empty());
}

#[tokio::test]
async fn upstream_server_error_is_not_a_fallback() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/find-duplicates"))
        .respond_with(ResponseTemplate::new(500).set_body_string("model exploded"))
        .mount(&server)
        .await;

    let ml = clients_for(&server.uri(), Arc::new(InMemoryConfigSource::new()));
    let err = ml
        .duplicates
        .find_duplicates(Uuid::new_v4(), &[txn(Uuid::new_v4()), txn(Uuid::new_v4())])
        .await
        .unwrap_err();

    match err {
        MlError::Upstream { status, body } => {
            assert_eq!(status, 500);
            assert!(body.contains("model exploded"));
        }
        other => panic!("expected upstream error, got {:?}", other),
    }
}

#[tokio::test]
async fn duplicate_groups_need_two_known_ids() {
    let server = MockServer::start().await;
    let (t1, t2) = (Uuid::new_v4(), Uuid::new_v4());
    Mock::given(method("POST"))
        .and(path("/find-duplicates"))
        .and(body_partial_json(json!({ "window_days": 7 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "groups": [
                { "transaction_ids": [t1, t2], "similarity": 0.97 },
                { "transaction_ids": [t1, t1], "similarity": 0.99 },
                { "transaction_ids": [t2, Uuid::new_v4()], "similarity": 0.9 }
            ]
        })))
        .mount(&server)
        .await;

    let ml = clients_for(&server.uri(), Arc::new(InMemoryConfigSource::new()));
    let report = ml
        .duplicates
        .find_duplicates(Uuid::new_v4(), &[txn(t1), txn(t2)])
        .await
        .unwrap();

    assert_eq!(report.source, ResultSource::Model);
    assert_eq!(report.groups.len(), 1);
    assert_eq!(report.groups[0].transaction_ids, vec![t1, t2]);
}

#[tokio::test]
async fn budget_recommendation_is_rounded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/recommend-budget"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "recommended_amount": 812.456 })),
        )
        .mount(&server)
        .await;

    let ml = clients_for(&server.uri(), Arc::new(InMemoryConfigSource::new()));
    let history = [MonthlySpend {
        month: NaiveDate::from_ymd_opt(2025, 4, 1).unwrap(),
        amount: Decimal::new(75_000, 2),
    }];
    let category = Uuid::new_v4();

    let recommendation = ml
        .budget
        .recommend_budget(Uuid::new_v4(), category, &history)
        .await
        .unwrap();
    assert_eq!(recommendation.source, ResultSource::Model);
    assert_eq!(recommendation.category_id, category);
    assert_eq!(recommendation.amount, Decimal::new(81_246, 2));
    assert_eq!(recommendation.history_months, 1);
}

#[tokio::test]
async fn budget_falls_back_to_buffered_mean_when_down() {
    let ml = clients_for(DEAD_URL, Arc::new(InMemoryConfigSource::new()));
    let history = [
        MonthlySpend {
            month: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            amount: Decimal::new(10_000, 2),
        },
        MonthlySpend {
            month: NaiveDate::from_ymd_opt(2025, 4, 1).unwrap(),
            amount: Decimal::new(30_000, 2),
        },
    ];

    let recommendation = ml
        .budget
        .recommend_budget(Uuid::new_v4(), Uuid::new_v4(), &history)
        .await
        .unwrap();
    assert_eq!(recommendation.source, ResultSource::Fallback);
    // mean 200.00 plus the default 10% buffer
    assert_eq!(recommendation.amount, Decimal::new(22_000, 2));
}

#[tokio::test]
async fn credit_score_is_clamped_and_risk_derived() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/score-customer"))
        .and(body_partial_json(json!({ "features": { "invoice_count": 12 } })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "score": 712.4 })))
        .mount(&server)
        .await;

    let ml = clients_for(&server.uri(), Arc::new(InMemoryConfigSource::new()));
    let assessment = ml
        .credit_scoring
        .score_customer(Uuid::new_v4(), Uuid::new_v4(), &features())
        .await
        .unwrap()
        .expect("service answered");

    assert_eq!(assessment.score, 712);
    assert_eq!(assessment.risk_level, "low");
}

#[tokio::test]
async fn disabled_category_never_calls_the_service() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "score": 700 })))
        .expect(0)
        .mount(&server)
        .await;

    let source = Arc::new(InMemoryConfigSource::new());
    source.set(MlConfigCategory::CreditScoring, keys::ENABLED, "false");
    source.set(MlConfigCategory::Anomaly, keys::ENABLED, "off");
    let ml = clients_for(&server.uri(), source);

    let scored = ml
        .credit_scoring
        .score_customer(Uuid::new_v4(), Uuid::new_v4(), &features())
        .await
        .unwrap();
    assert!(scored.is_none());

    let report = ml
        .anomaly
        .detect(Uuid::new_v4(), &[txn(Uuid::new_v4())])
        .await
        .unwrap();
    assert_eq!(report.source, ResultSource::Fallback);

    let outcome = ml.anomaly.train(Uuid::new_v4(), &[txn(Uuid::new_v4())]).await.unwrap();
    assert_eq!(outcome.status, TrainingStatus::Disabled);
}

#[tokio::test]
async fn config_overrides_can_repoint_a_service() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/score-customer"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "score": 580, "risk_level": "HIGH" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let source = Arc::new(InMemoryConfigSource::new());
    source.set(
        MlConfigCategory::CreditScoring,
        keys::SERVICE_URL,
        &format!("{}/", server.uri()),
    );
    let ml = clients_for(DEAD_URL, source);

    let assessment = ml
        .credit_scoring
        .score_customer(Uuid::new_v4(), Uuid::new_v4(), &features())
        .await
        .unwrap()
        .expect("service answered");
    assert_eq!(assessment.score, 580);
    assert_eq!(assessment.risk_level, "high");
}
