//! Data access needed by the batch jobs.

use crate::models::{
    Category, Company, CreditAssessment, Customer, CustomerFeatures, Transaction,
};
use crate::services::Database;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use service_core::error::AppError;
use uuid::Uuid;

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn list_active_companies(&self, limit: i64, offset: i64)
        -> Result<Vec<Company>, AppError>;

    async fn list_categories(&self, company_id: Uuid) -> Result<Vec<Category>, AppError>;

    async fn categorized_samples(
        &self,
        company_id: Uuid,
        category_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Transaction>, AppError>;

    async fn transactions_between(
        &self,
        company_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
        limit: i64,
    ) -> Result<Vec<Transaction>, AppError>;

    async fn mark_anomalies(&self, company_id: Uuid, scores: &[(Uuid, f64)])
        -> Result<u64, AppError>;

    async fn customers_due_for_scoring(
        &self,
        company_id: Uuid,
        scored_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Customer>, AppError>;

    async fn customer_features(
        &self,
        company_id: Uuid,
        customer_id: Uuid,
    ) -> Result<Option<CustomerFeatures>, AppError>;

    async fn record_credit_score(
        &self,
        company_id: Uuid,
        customer_id: Uuid,
        assessment: &CreditAssessment,
    ) -> Result<(), AppError>;

    async fn mark_overdue_invoices(&self, company_id: Uuid, today: NaiveDate)
        -> Result<u64, AppError>;
}

#[async_trait]
impl JobStore for Database {
    async fn list_active_companies(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Company>, AppError> {
        let (companies, _) = self.list_companies(true, limit, offset).await?;
        Ok(companies)
    }

    async fn list_categories(&self, company_id: Uuid) -> Result<Vec<Category>, AppError> {
        Database::list_categories(self, company_id).await
    }

    async fn categorized_samples(
        &self,
        company_id: Uuid,
        category_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Transaction>, AppError> {
        Database::categorized_samples(self, company_id, category_id, limit).await
    }

    async fn transactions_between(
        &self,
        company_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
        limit: i64,
    ) -> Result<Vec<Transaction>, AppError> {
        Database::transactions_between(self, company_id, from, to, limit).await
    }

    async fn mark_anomalies(
        &self,
        company_id: Uuid,
        scores: &[(Uuid, f64)],
    ) -> Result<u64, AppError> {
        Database::mark_anomalies(self, company_id, scores).await
    }

    async fn customers_due_for_scoring(
        &self,
        company_id: Uuid,
        scored_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Customer>, AppError> {
        Database::customers_due_for_scoring(self, company_id, scored_before, limit).await
    }

    async fn customer_features(
        &self,
        company_id: Uuid,
        customer_id: Uuid,
    ) -> Result<Option<CustomerFeatures>, AppError> {
        Database::customer_features(self, company_id, customer_id).await
    }

    async fn record_credit_score(
        &self,
        company_id: Uuid,
        customer_id: Uuid,
        assessment: &CreditAssessment,
    ) -> Result<(), AppError> {
        Database::record_credit_score(self, company_id, customer_id, assessment).await?;
        Ok(())
    }

    async fn mark_overdue_invoices(
        &self,
        company_id: Uuid,
        today: NaiveDate,
    ) -> Result<u64, AppError> {
        Database::mark_overdue_invoices(self, company_id, today).await
    }
}
