//! Database service for finance-service.
//!
//! Every tenant-facing query takes the caller's `company_id` and binds it in
//! the WHERE clause; ids belonging to another company behave as missing rows.

use crate::models::{
    Account, Budget, Category, CategorySource, Company, CreateAccount, CreateCategory,
    CreateCompany, CreateCustomer, CreateInvoice, CreateTransaction, CreditAssessment, Customer,
    CustomerFeatures, Invoice, InvoiceStatus, ListTransactionsFilter, MlConfigEntry,
    MonthlySpend, Transaction, TransactionChanges, UpdateCustomer, UpsertBudget,
};
use crate::services::metrics::DbTimer;
use chrono::{DateTime, NaiveDate, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction as DbTransaction};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const TRANSACTION_COLUMNS: &str = "id, company_id, account_id, category_id, kind, amount, description, occurred_on, category_source, category_confidence, anomaly_score, flagged, created_at";
const ACCOUNT_COLUMNS: &str =
    "id, company_id, name, account_type, currency, balance, archived, created_at, updated_at";
const CUSTOMER_COLUMNS: &str =
    "id, company_id, name, email, credit_score, risk_level, scored_at, created_at";
const INVOICE_COLUMNS: &str = "id, company_id, customer_id, number, amount, currency, status, issue_date, due_date, paid_at, created_at";
const BUDGET_COLUMNS: &str =
    "id, company_id, category_id, month, amount, source, created_at, updated_at";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "finance-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Companies
    // -------------------------------------------------------------------------

    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create_company(&self, input: &CreateCompany) -> Result<Company, AppError> {
        let timer = DbTimer::start("create_company");
        let company = sqlx::query_as::<_, Company>(
            r#"
            INSERT INTO companies (id, name)
            VALUES ($1, $2)
            RETURNING id, name, active, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&input.name)
        .fetch_one(&self.pool)
        .await?;
        timer.observe_duration();

        info!(company_id = %company.id, "Company created");
        Ok(company)
    }

    pub async fn get_company(&self, company_id: Uuid) -> Result<Option<Company>, AppError> {
        let company = sqlx::query_as::<_, Company>(
            "SELECT id, name, active, created_at FROM companies WHERE id = $1",
        )
        .bind(company_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(company)
    }

    /// Companies in creation order. With `active_only`, deactivated tenants
    /// are skipped (batch jobs use this).
    pub async fn list_companies(
        &self,
        active_only: bool,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Company>, i64), AppError> {
        let timer = DbTimer::start("list_companies");
        let companies = sqlx::query_as::<_, Company>(
            r#"
            SELECT id, name, active, created_at
            FROM companies
            WHERE ($1 = FALSE OR active)
            ORDER BY created_at, id
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(active_only)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM companies WHERE ($1 = FALSE OR active)")
                .bind(active_only)
                .fetch_one(&self.pool)
                .await?;
        timer.observe_duration();

        Ok((companies, total))
    }

    // -------------------------------------------------------------------------
    // Accounts
    // -------------------------------------------------------------------------

    #[instrument(skip(self, input), fields(company_id = %input.company_id))]
    pub async fn create_account(&self, input: &CreateAccount) -> Result<Account, AppError> {
        let timer = DbTimer::start("create_account");
        let account = sqlx::query_as::<_, Account>(&format!(
            r#"
            INSERT INTO accounts (id, company_id, name, account_type, currency, balance)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(input.company_id)
        .bind(&input.name)
        .bind(input.account_type.as_str())
        .bind(&input.currency)
        .bind(input.opening_balance)
        .fetch_one(&self.pool)
        .await?;
        timer.observe_duration();

        info!(account_id = %account.id, account_type = %account.account_type, "Account created");
        Ok(account)
    }

    pub async fn get_account(
        &self,
        company_id: Uuid,
        account_id: Uuid,
    ) -> Result<Option<Account>, AppError> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE company_id = $1 AND id = $2"
        ))
        .bind(company_id)
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    pub async fn list_accounts(
        &self,
        company_id: Uuid,
        include_archived: bool,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Account>, i64), AppError> {
        let timer = DbTimer::start("list_accounts");
        let accounts = sqlx::query_as::<_, Account>(&format!(
            r#"
            SELECT {ACCOUNT_COLUMNS}
            FROM accounts
            WHERE company_id = $1 AND ($2 OR NOT archived)
            ORDER BY name, id
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(company_id)
        .bind(include_archived)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM accounts WHERE company_id = $1 AND ($2 OR NOT archived)",
        )
        .bind(company_id)
        .bind(include_archived)
        .fetch_one(&self.pool)
        .await?;
        timer.observe_duration();

        Ok((accounts, total))
    }

    pub async fn rename_account(
        &self,
        company_id: Uuid,
        account_id: Uuid,
        name: &str,
    ) -> Result<Option<Account>, AppError> {
        let account = sqlx::query_as::<_, Account>(&format!(
            r#"
            UPDATE accounts SET name = $3, updated_at = NOW()
            WHERE company_id = $1 AND id = $2
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(company_id)
        .bind(account_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    /// Archive instead of delete: transactions keep pointing at the account.
    pub async fn archive_account(
        &self,
        company_id: Uuid,
        account_id: Uuid,
    ) -> Result<Option<Account>, AppError> {
        let account = sqlx::query_as::<_, Account>(&format!(
            r#"
            UPDATE accounts SET archived = TRUE, updated_at = NOW()
            WHERE company_id = $1 AND id = $2
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(company_id)
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    // -------------------------------------------------------------------------
    // Categories
    // -------------------------------------------------------------------------

    pub async fn create_category(&self, input: &CreateCategory) -> Result<Category, AppError> {
        let category = sqlx::query_as::<_, Category>(
            r#"
            INSERT INTO categories (id, company_id, name, kind)
            VALUES ($1, $2, $3, $4)
            RETURNING id, company_id, name, kind, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(input.company_id)
        .bind(&input.name)
        .bind(input.kind.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(category)
    }

    pub async fn list_categories(&self, company_id: Uuid) -> Result<Vec<Category>, AppError> {
        let categories = sqlx::query_as::<_, Category>(
            r#"
            SELECT id, company_id, name, kind, created_at
            FROM categories
            WHERE company_id = $1
            ORDER BY name
            "#,
        )
        .bind(company_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(categories)
    }

    pub async fn get_category(
        &self,
        company_id: Uuid,
        category_id: Uuid,
    ) -> Result<Option<Category>, AppError> {
        let category = sqlx::query_as::<_, Category>(
            "SELECT id, company_id, name, kind, created_at FROM categories WHERE company_id = $1 AND id = $2",
        )
        .bind(company_id)
        .bind(category_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(category)
    }

    // -------------------------------------------------------------------------
    // Transactions
    // -------------------------------------------------------------------------

    /// Insert a transaction and apply it to the account balance atomically.
    #[instrument(skip(self, input), fields(company_id = %input.company_id, account_id = %input.account_id))]
    pub async fn create_transaction(
        &self,
        input: &CreateTransaction,
    ) -> Result<Transaction, AppError> {
        let timer = DbTimer::start("create_transaction");
        let mut tx = self.pool.begin().await?;

        let archived: Option<bool> = sqlx::query_scalar(
            "SELECT archived FROM accounts WHERE company_id = $1 AND id = $2 FOR UPDATE",
        )
        .bind(input.company_id)
        .bind(input.account_id)
        .fetch_optional(&mut *tx)
        .await?;

        match archived {
            None => return Err(AppError::not_found("Account")),
            Some(true) => return Err(AppError::bad_request("Account is archived")),
            Some(false) => {}
        }

        if let Some(category_id) = input.category_id {
            ensure_category(&mut tx, input.company_id, category_id).await?;
        }

        let transaction = sqlx::query_as::<_, Transaction>(&format!(
            r#"
            INSERT INTO transactions
                (id, company_id, account_id, category_id, kind, amount, description, occurred_on,
                 category_source, category_confidence)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {TRANSACTION_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(input.company_id)
        .bind(input.account_id)
        .bind(input.category_id)
        .bind(input.kind.as_str())
        .bind(input.amount)
        .bind(&input.description)
        .bind(input.occurred_on)
        .bind(input.category_source.as_str())
        .bind(input.category_confidence)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE accounts SET balance = balance + $3, updated_at = NOW() WHERE company_id = $1 AND id = $2",
        )
        .bind(input.company_id)
        .bind(input.account_id)
        .bind(input.kind.balance_delta(input.amount))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        timer.observe_duration();

        info!(transaction_id = %transaction.id, kind = %transaction.kind, "Transaction created");
        Ok(transaction)
    }

    pub async fn get_transaction(
        &self,
        company_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<Option<Transaction>, AppError> {
        let transaction = sqlx::query_as::<_, Transaction>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE company_id = $1 AND id = $2"
        ))
        .bind(company_id)
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(transaction)
    }

    pub async fn list_transactions(
        &self,
        company_id: Uuid,
        filter: &ListTransactionsFilter,
    ) -> Result<(Vec<Transaction>, i64), AppError> {
        let timer = DbTimer::start("list_transactions");
        const WHERE: &str = r#"
            WHERE company_id = $1
              AND ($2::uuid IS NULL OR account_id = $2)
              AND ($3::uuid IS NULL OR category_id = $3)
              AND ($4::date IS NULL OR occurred_on >= $4)
              AND ($5::date IS NULL OR occurred_on <= $5)
              AND ($6::boolean IS NULL OR flagged = $6)
        "#;

        let transactions = sqlx::query_as::<_, Transaction>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions {WHERE} ORDER BY occurred_on DESC, created_at DESC LIMIT $7 OFFSET $8"
        ))
        .bind(company_id)
        .bind(filter.account_id)
        .bind(filter.category_id)
        .bind(filter.from)
        .bind(filter.to)
        .bind(filter.flagged)
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM transactions {WHERE}"))
            .bind(company_id)
            .bind(filter.account_id)
            .bind(filter.category_id)
            .bind(filter.from)
            .bind(filter.to)
            .bind(filter.flagged)
            .fetch_one(&self.pool)
            .await?;
        timer.observe_duration();

        Ok((transactions, total))
    }

    /// Fetch the given ids, silently dropping ids of other companies.
    pub async fn transactions_by_ids(
        &self,
        company_id: Uuid,
        ids: &[Uuid],
    ) -> Result<Vec<Transaction>, AppError> {
        let transactions = sqlx::query_as::<_, Transaction>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE company_id = $1 AND id = ANY($2) ORDER BY occurred_on DESC"
        ))
        .bind(company_id)
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(transactions)
    }

    pub async fn list_uncategorized(
        &self,
        company_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Transaction>, AppError> {
        let transactions = sqlx::query_as::<_, Transaction>(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS} FROM transactions
            WHERE company_id = $1 AND category_id IS NULL
            ORDER BY occurred_on DESC
            LIMIT $2
            "#
        ))
        .bind(company_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(transactions)
    }

    /// Transactions in `[from, to]`, newest first.
    pub async fn transactions_between(
        &self,
        company_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
        limit: i64,
    ) -> Result<Vec<Transaction>, AppError> {
        let timer = DbTimer::start("transactions_between");
        let transactions = sqlx::query_as::<_, Transaction>(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS} FROM transactions
            WHERE company_id = $1 AND occurred_on BETWEEN $2 AND $3
            ORDER BY occurred_on DESC, created_at DESC
            LIMIT $4
            "#
        ))
        .bind(company_id)
        .bind(from)
        .bind(to)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        timer.observe_duration();
        Ok(transactions)
    }

    /// Update the editable fields of a transaction. Amount, kind and account
    /// are fixed once booked; delete and re-create to change them.
    /// Apply field edits and a manual category change in one DB transaction.
    /// An unknown category aborts the whole edit.
    #[instrument(skip(self, changes), fields(company_id = %company_id, transaction_id = %transaction_id))]
    pub async fn update_transaction(
        &self,
        company_id: Uuid,
        transaction_id: Uuid,
        changes: &TransactionChanges,
    ) -> Result<Option<Transaction>, AppError> {
        let timer = DbTimer::start("update_transaction");
        let mut tx = self.pool.begin().await?;

        if let Some(Some(category_id)) = changes.category {
            ensure_category(&mut tx, company_id, category_id).await?;
        }
        let category_id = changes.category.flatten();
        let source = match changes.category {
            Some(Some(_)) => CategorySource::Manual,
            _ => CategorySource::None,
        };

        let transaction = sqlx::query_as::<_, Transaction>(&format!(
            r#"
            UPDATE transactions
            SET description = COALESCE($3, description),
                occurred_on = COALESCE($4, occurred_on),
                category_id = CASE WHEN $5 THEN $6 ELSE category_id END,
                category_source = CASE WHEN $5 THEN $7 ELSE category_source END,
                category_confidence = CASE WHEN $5 THEN NULL ELSE category_confidence END
            WHERE company_id = $1 AND id = $2
            RETURNING {TRANSACTION_COLUMNS}
            "#
        ))
        .bind(company_id)
        .bind(transaction_id)
        .bind(changes.description.as_deref())
        .bind(changes.occurred_on)
        .bind(changes.category.is_some())
        .bind(category_id)
        .bind(source.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;
        timer.observe_duration();
        Ok(transaction)
    }

    /// Assign (or clear) the category of a transaction. An `Ml` assignment
    /// never replaces a manual one; such rows come back as `None`.
    pub async fn set_transaction_category(
        &self,
        company_id: Uuid,
        transaction_id: Uuid,
        category_id: Option<Uuid>,
        source: CategorySource,
        confidence: Option<f64>,
    ) -> Result<Option<Transaction>, AppError> {
        let mut tx = self.pool.begin().await?;
        if let Some(category_id) = category_id {
            ensure_category(&mut tx, company_id, category_id).await?;
        }

        let transaction = sqlx::query_as::<_, Transaction>(&format!(
            r#"
            UPDATE transactions
            SET category_id = $3, category_source = $4, category_confidence = $5
            WHERE company_id = $1 AND id = $2
              AND ($4 <> 'ml' OR category_source <> 'manual')
            RETURNING {TRANSACTION_COLUMNS}
            "#
        ))
        .bind(company_id)
        .bind(transaction_id)
        .bind(category_id)
        .bind(source.as_str())
        .bind(confidence)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(transaction)
    }

    /// Delete a transaction and reverse its balance effect atomically.
    #[instrument(skip(self), fields(company_id = %company_id, transaction_id = %transaction_id))]
    pub async fn delete_transaction(
        &self,
        company_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<bool, AppError> {
        let timer = DbTimer::start("delete_transaction");
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query_as::<_, Transaction>(&format!(
            "DELETE FROM transactions WHERE company_id = $1 AND id = $2 RETURNING {TRANSACTION_COLUMNS}"
        ))
        .bind(company_id)
        .bind(transaction_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(deleted) = deleted else {
            return Ok(false);
        };

        sqlx::query(
            "UPDATE accounts SET balance = balance - $3, updated_at = NOW() WHERE company_id = $1 AND id = $2",
        )
        .bind(company_id)
        .bind(deleted.account_id)
        .bind(deleted.signed_amount())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        timer.observe_duration();

        info!("Transaction deleted");
        Ok(true)
    }

    /// Flag transactions the anomaly service scored above threshold.
    pub async fn mark_anomalies(
        &self,
        company_id: Uuid,
        scores: &[(Uuid, f64)],
    ) -> Result<u64, AppError> {
        if scores.is_empty() {
            return Ok(0);
        }

        let timer = DbTimer::start("mark_anomalies");
        let mut tx = self.pool.begin().await?;
        let mut updated = 0;
        for (transaction_id, score) in scores {
            updated += sqlx::query(
                "UPDATE transactions SET anomaly_score = $3, flagged = TRUE WHERE company_id = $1 AND id = $2",
            )
            .bind(company_id)
            .bind(transaction_id)
            .bind(score)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        timer.observe_duration();

        Ok(updated)
    }

    /// Manually categorized transactions of one category, used as training
    /// labels. ML-assigned categories are left out so the model never trains
    /// on its own guesses.
    pub async fn categorized_samples(
        &self,
        company_id: Uuid,
        category_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Transaction>, AppError> {
        let transactions = sqlx::query_as::<_, Transaction>(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS} FROM transactions
            WHERE company_id = $1 AND category_id = $2 AND category_source = 'manual'
            ORDER BY occurred_on DESC
            LIMIT $3
            "#
        ))
        .bind(company_id)
        .bind(category_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(transactions)
    }

    /// Net amount per calendar month for one category since `since`, in the
    /// category's direction: debits minus refunds for expenses, credits minus
    /// reversals for income. Never negative.
    pub async fn monthly_spend(
        &self,
        company_id: Uuid,
        category_id: Uuid,
        since: NaiveDate,
    ) -> Result<Vec<MonthlySpend>, AppError> {
        let spend = sqlx::query_as::<_, MonthlySpend>(
            r#"
            SELECT date_trunc('month', t.occurred_on)::date AS month,
                   GREATEST(
                       SUM(CASE WHEN (t.kind = 'debit') = (c.kind = 'expense')
                                THEN t.amount ELSE -t.amount END),
                       0
                   ) AS amount
            FROM transactions t
            JOIN categories c ON c.company_id = t.company_id AND c.id = t.category_id
            WHERE t.company_id = $1 AND t.category_id = $2 AND t.occurred_on >= $3
            GROUP BY 1
            ORDER BY 1
            "#,
        )
        .bind(company_id)
        .bind(category_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(spend)
    }

    // -------------------------------------------------------------------------
    // Customers
    // -------------------------------------------------------------------------

    pub async fn create_customer(&self, input: &CreateCustomer) -> Result<Customer, AppError> {
        let customer = sqlx::query_as::<_, Customer>(&format!(
            r#"
            INSERT INTO customers (id, company_id, name, email)
            VALUES ($1, $2, $3, $4)
            RETURNING {CUSTOMER_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(input.company_id)
        .bind(&input.name)
        .bind(&input.email)
        .fetch_one(&self.pool)
        .await?;
        Ok(customer)
    }

    pub async fn get_customer(
        &self,
        company_id: Uuid,
        customer_id: Uuid,
    ) -> Result<Option<Customer>, AppError> {
        let customer = sqlx::query_as::<_, Customer>(&format!(
            "SELECT {CUSTOMER_COLUMNS} FROM customers WHERE company_id = $1 AND id = $2"
        ))
        .bind(company_id)
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(customer)
    }

    pub async fn list_customers(
        &self,
        company_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Customer>, i64), AppError> {
        let customers = sqlx::query_as::<_, Customer>(&format!(
            "SELECT {CUSTOMER_COLUMNS} FROM customers WHERE company_id = $1 ORDER BY name, id LIMIT $2 OFFSET $3"
        ))
        .bind(company_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM customers WHERE company_id = $1")
            .bind(company_id)
            .fetch_one(&self.pool)
            .await?;

        Ok((customers, total))
    }

    pub async fn update_customer(
        &self,
        company_id: Uuid,
        customer_id: Uuid,
        input: &UpdateCustomer,
    ) -> Result<Option<Customer>, AppError> {
        let customer = sqlx::query_as::<_, Customer>(&format!(
            r#"
            UPDATE customers
            SET name = COALESCE($3, name), email = COALESCE($4, email)
            WHERE company_id = $1 AND id = $2
            RETURNING {CUSTOMER_COLUMNS}
            "#
        ))
        .bind(company_id)
        .bind(customer_id)
        .bind(&input.name)
        .bind(&input.email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(customer)
    }

    /// Invoice history aggregates for one customer.
    pub async fn customer_features(
        &self,
        company_id: Uuid,
        customer_id: Uuid,
    ) -> Result<Option<CustomerFeatures>, AppError> {
        let timer = DbTimer::start("customer_features");
        let features = sqlx::query_as::<_, CustomerFeatures>(
            r#"
            SELECT
                COUNT(i.id) AS invoice_count,
                COUNT(i.id) FILTER (WHERE i.status = 'paid') AS paid_count,
                COUNT(i.id) FILTER (WHERE i.status = 'overdue') AS overdue_count,
                COALESCE(SUM(i.amount) FILTER (WHERE i.status <> 'cancelled'), 0) AS total_invoiced,
                COALESCE(SUM(i.amount) FILTER (WHERE i.status IN ('sent', 'overdue')), 0) AS total_outstanding,
                (AVG(EXTRACT(EPOCH FROM (i.paid_at - i.issue_date::timestamptz)) / 86400.0)
                    FILTER (WHERE i.paid_at IS NOT NULL))::float8 AS avg_days_to_pay,
                (CURRENT_DATE - c.created_at::date)::bigint AS customer_age_days
            FROM customers c
            LEFT JOIN invoices i ON i.customer_id = c.id AND i.company_id = c.company_id
            WHERE c.company_id = $1 AND c.id = $2
            GROUP BY c.id, c.created_at
            "#,
        )
        .bind(company_id)
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;
        timer.observe_duration();
        Ok(features)
    }

    /// Customers never scored or last scored before `scored_before`.
    pub async fn customers_due_for_scoring(
        &self,
        company_id: Uuid,
        scored_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Customer>, AppError> {
        let customers = sqlx::query_as::<_, Customer>(&format!(
            r#"
            SELECT {CUSTOMER_COLUMNS} FROM customers
            WHERE company_id = $1 AND (scored_at IS NULL OR scored_at < $2)
            ORDER BY scored_at NULLS FIRST, id
            LIMIT $3
            "#
        ))
        .bind(company_id)
        .bind(scored_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(customers)
    }

    pub async fn record_credit_score(
        &self,
        company_id: Uuid,
        customer_id: Uuid,
        assessment: &CreditAssessment,
    ) -> Result<Option<Customer>, AppError> {
        let customer = sqlx::query_as::<_, Customer>(&format!(
            r#"
            UPDATE customers
            SET credit_score = $3, risk_level = $4, scored_at = NOW()
            WHERE company_id = $1 AND id = $2
            RETURNING {CUSTOMER_COLUMNS}
            "#
        ))
        .bind(company_id)
        .bind(customer_id)
        .bind(assessment.score)
        .bind(&assessment.risk_level)
        .fetch_optional(&self.pool)
        .await?;
        Ok(customer)
    }

    // -------------------------------------------------------------------------
    // Invoices
    // -------------------------------------------------------------------------

    #[instrument(skip(self, input), fields(company_id = %input.company_id, number = %input.number))]
    pub async fn create_invoice(&self, input: &CreateInvoice) -> Result<Invoice, AppError> {
        let timer = DbTimer::start("create_invoice");
        let mut tx = self.pool.begin().await?;

        let customer_exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM customers WHERE company_id = $1 AND id = $2)",
        )
        .bind(input.company_id)
        .bind(input.customer_id)
        .fetch_one(&mut *tx)
        .await?;
        if !customer_exists {
            return Err(AppError::not_found("Customer"));
        }

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            INSERT INTO invoices (id, company_id, customer_id, number, amount, currency, issue_date, due_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {INVOICE_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(input.company_id)
        .bind(input.customer_id)
        .bind(&input.number)
        .bind(input.amount)
        .bind(&input.currency)
        .bind(input.issue_date)
        .bind(input.due_date)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(anyhow::anyhow!(
                    "Invoice number '{}' already exists",
                    input.number
                ))
            }
            other => AppError::from(other),
        })?;

        tx.commit().await?;
        timer.observe_duration();

        info!(invoice_id = %invoice.id, "Invoice created");
        Ok(invoice)
    }

    pub async fn get_invoice(
        &self,
        company_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, AppError> {
        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE company_id = $1 AND id = $2"
        ))
        .bind(company_id)
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(invoice)
    }

    pub async fn list_invoices(
        &self,
        company_id: Uuid,
        status: Option<InvoiceStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Invoice>, i64), AppError> {
        let status = status.map(|s| s.as_str());
        let invoices = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            SELECT {INVOICE_COLUMNS} FROM invoices
            WHERE company_id = $1 AND ($2::varchar IS NULL OR status = $2)
            ORDER BY issue_date DESC, number DESC
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(company_id)
        .bind(status)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM invoices WHERE company_id = $1 AND ($2::varchar IS NULL OR status = $2)",
        )
        .bind(company_id)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        Ok((invoices, total))
    }

    /// Move an invoice to `next`, rejecting transitions the lifecycle forbids.
    #[instrument(skip(self), fields(company_id = %company_id, invoice_id = %invoice_id, next = %next))]
    pub async fn update_invoice_status(
        &self,
        company_id: Uuid,
        invoice_id: Uuid,
        next: InvoiceStatus,
    ) -> Result<Invoice, AppError> {
        let mut tx = self.pool.begin().await?;

        let current: Option<String> = sqlx::query_scalar(
            "SELECT status FROM invoices WHERE company_id = $1 AND id = $2 FOR UPDATE",
        )
        .bind(company_id)
        .bind(invoice_id)
        .fetch_optional(&mut *tx)
        .await?;

        let current = current.ok_or_else(|| AppError::not_found("Invoice"))?;
        let current = InvoiceStatus::from_string(&current).ok_or_else(|| {
            AppError::InternalError(anyhow::anyhow!("Unknown invoice status '{}'", current))
        })?;

        if !current.can_transition_to(next) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Cannot move invoice from {} to {}",
                current,
                next
            )));
        }

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            UPDATE invoices
            SET status = $3,
                paid_at = CASE WHEN $3 = 'paid' THEN NOW() ELSE paid_at END
            WHERE company_id = $1 AND id = $2
            RETURNING {INVOICE_COLUMNS}
            "#
        ))
        .bind(company_id)
        .bind(invoice_id)
        .bind(next.as_str())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(from = %current, "Invoice status updated");
        Ok(invoice)
    }

    /// Mark sent invoices past their due date as overdue.
    pub async fn mark_overdue_invoices(
        &self,
        company_id: Uuid,
        today: NaiveDate,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            "UPDATE invoices SET status = 'overdue' WHERE company_id = $1 AND status = 'sent' AND due_date < $2",
        )
        .bind(company_id)
        .bind(today)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // -------------------------------------------------------------------------
    // Budgets
    // -------------------------------------------------------------------------

    pub async fn upsert_budget(&self, input: &UpsertBudget) -> Result<Budget, AppError> {
        let mut tx = self.pool.begin().await?;
        ensure_category(&mut tx, input.company_id, input.category_id).await?;

        let budget = sqlx::query_as::<_, Budget>(&format!(
            r#"
            INSERT INTO budgets (id, company_id, category_id, month, amount, source)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (company_id, category_id, month)
            DO UPDATE SET amount = EXCLUDED.amount, source = EXCLUDED.source, updated_at = NOW()
            RETURNING {BUDGET_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(input.company_id)
        .bind(input.category_id)
        .bind(input.month)
        .bind(input.amount)
        .bind(input.source.as_str())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(budget)
    }

    pub async fn list_budgets(
        &self,
        company_id: Uuid,
        month: Option<NaiveDate>,
    ) -> Result<Vec<Budget>, AppError> {
        let budgets = sqlx::query_as::<_, Budget>(&format!(
            r#"
            SELECT {BUDGET_COLUMNS} FROM budgets
            WHERE company_id = $1 AND ($2::date IS NULL OR month = $2)
            ORDER BY month DESC, category_id
            "#
        ))
        .bind(company_id)
        .bind(month)
        .fetch_all(&self.pool)
        .await?;
        Ok(budgets)
    }

    // -------------------------------------------------------------------------
    // ML configuration
    // -------------------------------------------------------------------------

    pub async fn list_ml_config(
        &self,
        category: Option<&str>,
    ) -> Result<Vec<MlConfigEntry>, AppError> {
        let timer = DbTimer::start("list_ml_config");
        let entries = sqlx::query_as::<_, MlConfigEntry>(
            r#"
            SELECT category, key, value, description, updated_at
            FROM ml_config
            WHERE ($1::varchar IS NULL OR category = $1)
            ORDER BY category, key
            "#,
        )
        .bind(category)
        .fetch_all(&self.pool)
        .await?;
        timer.observe_duration();
        Ok(entries)
    }

    pub async fn upsert_ml_config(
        &self,
        category: &str,
        key: &str,
        value: &str,
        description: Option<&str>,
    ) -> Result<MlConfigEntry, AppError> {
        let entry = sqlx::query_as::<_, MlConfigEntry>(
            r#"
            INSERT INTO ml_config (category, key, value, description)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (category, key)
            DO UPDATE SET value = EXCLUDED.value,
                          description = COALESCE(EXCLUDED.description, ml_config.description),
                          updated_at = NOW()
            RETURNING category, key, value, description, updated_at
            "#,
        )
        .bind(category)
        .bind(key)
        .bind(value)
        .bind(description)
        .fetch_one(&self.pool)
        .await?;

        info!(category = %category, key = %key, "ML config updated");
        Ok(entry)
    }

    pub async fn delete_ml_config(&self, category: &str, key: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM ml_config WHERE category = $1 AND key = $2")
            .bind(category)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Fail with 404 unless the category belongs to the company.
async fn ensure_category(
    tx: &mut DbTransaction<'_, Postgres>,
    company_id: Uuid,
    category_id: Uuid,
) -> Result<(), AppError> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM categories WHERE company_id = $1 AND id = $2)",
    )
    .bind(company_id)
    .bind(category_id)
    .fetch_one(&mut **tx)
    .await?;

    if exists {
        Ok(())
    } else {
        Err(AppError::not_found("Category"))
    }
}
