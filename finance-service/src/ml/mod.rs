//! Clients for the external ML services and the config they run with.

pub mod anomaly;
pub mod budget;
pub mod categorization;
pub mod client;
pub mod config_store;
pub mod credit_scoring;
pub mod duplicates;
pub mod events;

pub use anomaly::{Anomaly, AnomalyClient, AnomalyReport};
pub use budget::{BudgetClient, BudgetRecommendation};
pub use categorization::{
    CategorizationClient, Categorization, CategorySuggestion, TrainingSample,
};
pub use client::{
    MlError, MlHttpClient, MlTransaction, ResultSource, TrainingOutcome, TrainingStatus,
};
pub use config_store::{
    CategoryConfig, ConfigSource, InMemoryConfigSource, MlConfigCategory, MlConfigStore,
};
pub use credit_scoring::CreditScoringClient;
pub use duplicates::{DuplicateGroup, DuplicateReport, DuplicatesClient};
pub use events::{ConfigEvent, ConfigEventBus};

use std::sync::Arc;

/// Every ML client, sharing one HTTP pool and one config store.
#[derive(Clone)]
pub struct MlClients {
    pub categorization: CategorizationClient,
    pub anomaly: AnomalyClient,
    pub duplicates: DuplicatesClient,
    pub budget: BudgetClient,
    pub credit_scoring: CreditScoringClient,
    pub config: Arc<MlConfigStore>,
}

impl MlClients {
    pub fn new(http: MlHttpClient, config: Arc<MlConfigStore>) -> Self {
        Self {
            categorization: CategorizationClient::new(http.clone(), config.clone()),
            anomaly: AnomalyClient::new(http.clone(), config.clone()),
            duplicates: DuplicatesClient::new(http.clone(), config.clone()),
            budget: BudgetClient::new(http.clone(), config.clone()),
            credit_scoring: CreditScoringClient::new(http, config.clone()),
            config,
        }
    }
}
