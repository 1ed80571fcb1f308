//! Configuration module for finance-service.

use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct FinanceConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub redis: Option<RedisConfig>,
    pub auth: AuthConfig,
    pub ml: MlServicesConfig,
    pub jobs: JobsConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: Secret<String>,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: Secret<String>,
}

/// Default base URLs of the ML services. Rows in `ml_config` override them at
/// runtime.
#[derive(Debug, Clone)]
pub struct MlServicesConfig {
    pub categorization_url: String,
    pub anomaly_url: String,
    pub duplicates_url: String,
    pub budget_url: String,
    pub credit_scoring_url: String,
    pub config_cache_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct JobsConfig {
    pub enabled: bool,
    pub company_page_size: i64,
    pub categorization_training_interval: Duration,
    pub anomaly_training_interval: Duration,
    pub anomaly_scan_interval: Duration,
    pub credit_scoring_interval: Duration,
    pub invoice_overdue_interval: Duration,
}

impl Default for MlServicesConfig {
    fn default() -> Self {
        Self {
            categorization_url: "http://localhost:8001".to_string(),
            anomaly_url: "http://localhost:8002".to_string(),
            duplicates_url: "http://localhost:8003".to_string(),
            budget_url: "http://localhost:8004".to_string(),
            credit_scoring_url: "http://localhost:8005".to_string(),
            config_cache_ttl: Duration::from_secs(300),
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            company_page_size: 50,
            categorization_training_interval: Duration::from_secs(24 * 60 * 60),
            anomaly_training_interval: Duration::from_secs(24 * 60 * 60),
            anomaly_scan_interval: Duration::from_secs(60 * 60),
            credit_scoring_interval: Duration::from_secs(6 * 60 * 60),
            invoice_overdue_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl FinanceConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let ml_defaults = MlServicesConfig::default();
        let job_defaults = JobsConfig::default();

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "finance-service".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database: DatabaseConfig {
                url: Secret::new(env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?),
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", 2),
            },
            redis: env::var("REDIS_URL")
                .ok()
                .filter(|s| !s.is_empty())
                .map(|url| RedisConfig {
                    url: Secret::new(url),
                }),
            auth: AuthConfig {
                jwt_secret: Secret::new(env::var("JWT_SECRET").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("JWT_SECRET is required"))
                })?),
            },
            ml: MlServicesConfig {
                categorization_url: env::var("ML_CATEGORIZATION_URL")
                    .unwrap_or(ml_defaults.categorization_url),
                anomaly_url: env::var("ML_ANOMALY_URL").unwrap_or(ml_defaults.anomaly_url),
                duplicates_url: env::var("ML_DUPLICATES_URL")
                    .unwrap_or(ml_defaults.duplicates_url),
                budget_url: env::var("ML_BUDGET_URL").unwrap_or(ml_defaults.budget_url),
                credit_scoring_url: env::var("ML_CREDIT_SCORING_URL")
                    .unwrap_or(ml_defaults.credit_scoring_url),
                config_cache_ttl: Duration::from_secs(parse_env(
                    "ML_CONFIG_CACHE_TTL_SECS",
                    ml_defaults.config_cache_ttl.as_secs(),
                )),
            },
            jobs: JobsConfig {
                enabled: parse_env("JOBS_ENABLED", job_defaults.enabled),
                company_page_size: parse_env(
                    "JOBS_COMPANY_PAGE_SIZE",
                    job_defaults.company_page_size,
                )
                .max(1),
                categorization_training_interval: parse_secs(
                    "JOBS_CATEGORIZATION_TRAINING_INTERVAL_SECS",
                    job_defaults.categorization_training_interval,
                ),
                anomaly_training_interval: parse_secs(
                    "JOBS_ANOMALY_TRAINING_INTERVAL_SECS",
                    job_defaults.anomaly_training_interval,
                ),
                anomaly_scan_interval: parse_secs(
                    "JOBS_ANOMALY_SCAN_INTERVAL_SECS",
                    job_defaults.anomaly_scan_interval,
                ),
                credit_scoring_interval: parse_secs(
                    "JOBS_CREDIT_SCORING_INTERVAL_SECS",
                    job_defaults.credit_scoring_interval,
                ),
                invoice_overdue_interval: parse_secs(
                    "JOBS_INVOICE_OVERDUE_INTERVAL_SECS",
                    job_defaults.invoice_overdue_interval,
                ),
            },
        })
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn parse_secs(key: &str, default: Duration) -> Duration {
    // A zero period would make tokio's interval panic.
    Duration::from_secs(parse_env(key, default.as_secs()).max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_env_falls_back_on_garbage() {
        std::env::set_var("FINANCE_TEST_GARBAGE_NUMBER", "not-a-number");
        assert_eq!(parse_env("FINANCE_TEST_GARBAGE_NUMBER", 7u32), 7);
    }

    #[test]
    fn parse_secs_never_returns_zero() {
        std::env::set_var("FINANCE_TEST_ZERO_INTERVAL", "0");
        assert_eq!(
            parse_secs("FINANCE_TEST_ZERO_INTERVAL", Duration::from_secs(60)),
            Duration::from_secs(1)
        );
    }
}
