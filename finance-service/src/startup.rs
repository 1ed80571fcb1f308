//! Application startup and lifecycle management.

use crate::config::FinanceConfig;
use crate::handlers;
use crate::jobs::{JobRunner, JobStore, Jobs};
use crate::middleware::auth_middleware;
use crate::ml::{ConfigEventBus, ConfigSource, MlClients, MlConfigStore, MlHttpClient};
use crate::services::{init_metrics, Database, TokenService};
use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, patch, post, put},
    Router,
};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::middleware::{
    metrics_middleware, request_id_middleware, security_headers_middleware, REQUEST_ID_HEADER,
};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: FinanceConfig,
    pub db: Arc<Database>,
    pub ml: MlClients,
    pub events: ConfigEventBus,
    pub jobs: Arc<Jobs>,
    pub tokens: TokenService,
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: FinanceConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: FinanceConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: FinanceConfig, run_migrations: bool) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            config.database.url.expose_secret(),
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let db = Arc::new(db);
        let events = build_event_bus(&config).await;

        let config_source: Arc<dyn ConfigSource> = db.clone();
        let config_store = Arc::new(MlConfigStore::new(config_source, config.ml.clone()));
        config_store.spawn_invalidation_listener(&events);

        let ml = MlClients::new(MlHttpClient::new()?, config_store);

        let job_store: Arc<dyn JobStore> = db.clone();
        let jobs = Arc::new(Jobs::new(
            job_store,
            ml.clone(),
            config.jobs.company_page_size,
        ));

        let state = AppState {
            tokens: TokenService::new(&config.auth.jwt_secret),
            config: config.clone(),
            db,
            ml,
            events,
            jobs,
        };

        let addr = config.common.bind_address();
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "Finance service listener bound");

        Ok(Self {
            http_port,
            listener,
            state,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.state.db
    }

    /// Serve until `shutdown` resolves, then stop the job loops and wait for
    /// runs in progress.
    pub async fn run_until_stopped<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (stop_jobs, jobs_shutdown) = watch::channel(false);
        let job_handles = if self.state.config.jobs.enabled {
            JobRunner::new(self.state.jobs.clone(), &self.state.config.jobs).spawn(jobs_shutdown)
        } else {
            tracing::info!("Scheduled jobs disabled");
            Vec::new()
        };

        let router = build_router(self.state);

        tracing::info!(
            service = "finance-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            "Service ready to accept connections"
        );

        let served = axum::serve(self.listener, router)
            .with_graceful_shutdown(shutdown)
            .await;

        let _ = stop_jobs.send(true);
        for handle in job_handles {
            let _ = handle.await;
        }

        served.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}

/// Redis-bridged bus when Redis is configured and reachable, local otherwise.
async fn build_event_bus(config: &FinanceConfig) -> ConfigEventBus {
    let Some(redis) = &config.redis else {
        return ConfigEventBus::new();
    };

    let bridged = match redis::Client::open(redis.url.expose_secret().as_str()) {
        Ok(client) => ConfigEventBus::with_redis(client).await,
        Err(e) => Err(AppError::RedisError(e)),
    };
    bridged.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Redis unavailable, config events stay in-process");
        ConfigEventBus::new()
    })
}

fn api_routes(state: &AppState) -> Router<AppState> {
    Router::new()
        .route(
            "/accounts",
            get(handlers::accounts::list_accounts).post(handlers::accounts::create_account),
        )
        .route(
            "/accounts/:id",
            get(handlers::accounts::get_account)
                .patch(handlers::accounts::update_account)
                .delete(handlers::accounts::archive_account),
        )
        .route(
            "/categories",
            get(handlers::accounts::list_categories).post(handlers::accounts::create_category),
        )
        .route(
            "/transactions",
            get(handlers::transactions::list_transactions)
                .post(handlers::transactions::create_transaction),
        )
        .route(
            "/transactions/:id",
            get(handlers::transactions::get_transaction)
                .patch(handlers::transactions::update_transaction)
                .delete(handlers::transactions::delete_transaction),
        )
        .route(
            "/customers",
            get(handlers::customers::list_customers).post(handlers::customers::create_customer),
        )
        .route(
            "/customers/:id",
            get(handlers::customers::get_customer).patch(handlers::customers::update_customer),
        )
        .route(
            "/customers/:id/credit-score",
            post(handlers::customers::score_customer),
        )
        .route(
            "/invoices",
            get(handlers::invoices::list_invoices).post(handlers::invoices::create_invoice),
        )
        .route("/invoices/:id", get(handlers::invoices::get_invoice))
        .route(
            "/invoices/:id/status",
            patch(handlers::invoices::update_invoice_status),
        )
        .route(
            "/budgets",
            get(handlers::budgets::list_budgets).post(handlers::budgets::upsert_budget),
        )
        .route(
            "/budgets/recommendation",
            get(handlers::budgets::recommend_budget),
        )
        .route("/ml/categorize", post(handlers::ml::categorize))
        .route("/ml/anomalies", post(handlers::ml::detect_anomalies))
        .route("/ml/duplicates", post(handlers::ml::find_duplicates))
        .route("/admin/ml-config", get(handlers::admin::list_ml_config))
        .route(
            "/admin/ml-config/invalidate",
            post(handlers::admin::invalidate_ml_config),
        )
        .route(
            "/admin/ml-config/:category",
            get(handlers::admin::get_ml_config),
        )
        .route(
            "/admin/ml-config/:category/:key",
            put(handlers::admin::upsert_ml_config).delete(handlers::admin::delete_ml_config),
        )
        .route(
            "/admin/companies",
            get(handlers::admin::list_companies).post(handlers::admin::create_company),
        )
        .route("/admin/companies/:id", get(handlers::admin::get_company))
        .route("/admin/jobs/:name/run", post(handlers::admin::run_job))
        .route_layer(from_fn_with_state(state.tokens.clone(), auth_middleware))
}

/// Full HTTP router: probes at the root, the tenant API under `/api`.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check))
        .route("/metrics", get(handlers::health::metrics_handler))
        .nest("/api", api_routes(&state))
        .with_state(state)
        .layer(from_fn(security_headers_middleware))
        .layer(from_fn(metrics_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                )
            }),
        )
        .layer(from_fn(request_id_middleware))
}
