use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use thiserror::Error;

use billflow_core::{Clock, SystemClock};
use billflow_infra::{
    AppConfig, BillingService, InMemoryBillingStore, PostgresBillingStore, SharedStore,
    StoreError,
};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to connect to Postgres: {0}")]
    Connect(#[from] sqlx::Error),

    #[error("failed to apply schema: {0}")]
    Migrate(#[from] StoreError),
}

/// Application services shared by all handlers.
#[derive(Debug, Clone)]
pub struct AppServices {
    pub billing: BillingService,
}

impl AppServices {
    pub fn new(store: SharedStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            billing: BillingService::new(store, clock),
        }
    }

    /// In-memory wiring (dev/test).
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self::new(Arc::new(InMemoryBillingStore::new()), clock)
    }
}

/// Pick the store from configuration: Postgres when `DATABASE_URL` is set,
/// otherwise in-memory.
pub async fn build_services(config: &AppConfig) -> Result<AppServices, StartupError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let Some(database_url) = config.database_url.as_deref() else {
        tracing::warn!("DATABASE_URL not set; using in-memory store");
        return Ok(AppServices::in_memory(clock));
    };

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(database_url)
        .await?;

    let store = PostgresBillingStore::new(pool);
    store.migrate().await?;
    tracing::info!(max_connections = config.db_max_connections, "using Postgres store");

    Ok(AppServices::new(Arc::new(store), clock))
}
