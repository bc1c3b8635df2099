// Strand worker library
// Decision: The binary stays thin; store selection and pool wiring live here so tests can use them

pub mod programs;
pub mod settings;

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use strand_engine::engine::StrandClient;
use strand_engine::persistence::{InMemoryStrandStore, PostgresStrandStore, StrandStore};
use strand_engine::worker::WorkerPool;
use tracing::{info, warn};

pub use settings::{SettingsError, WorkerSettings};

/// Open the store selected by the settings, migrating PostgreSQL
pub async fn connect_store(settings: &WorkerSettings) -> Result<Arc<dyn StrandStore>> {
    let Some(database_url) = &settings.database_url else {
        warn!("DATABASE_URL not set, strands are kept in memory only");
        return Ok(Arc::new(InMemoryStrandStore::new()));
    };

    let pool = PgPoolOptions::new()
        .max_connections(settings.db_max_connections)
        .connect(database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;

    let store = PostgresStrandStore::new(pool);
    store
        .migrate()
        .await
        .context("Failed to run strand migrations")?;

    info!("Connected to PostgreSQL strand store");
    Ok(Arc::new(store))
}

/// Worker process: a pool driving the built-in programs
pub struct StrandWorker {
    pool: WorkerPool,
    client: StrandClient,
}

impl StrandWorker {
    /// Wire the pool and client over an already opened store
    pub fn new(store: Arc<dyn StrandStore>, settings: &WorkerSettings) -> Result<Self> {
        let registry = Arc::new(programs::registry().context("Invalid built-in programs")?);
        let client = StrandClient::new(Arc::clone(&store), Arc::clone(&registry));
        let pool = WorkerPool::new(store, registry, settings.pool_config());
        Ok(Self { pool, client })
    }

    /// Connect the configured store and wire the worker
    pub async fn connect(settings: &WorkerSettings) -> Result<Self> {
        let store = connect_store(settings).await?;
        Self::new(store, settings)
    }

    /// Client for creating and signalling strands
    pub fn client(&self) -> &StrandClient {
        &self.client
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Start polling and deadline monitoring
    pub async fn start(&self) -> Result<()> {
        self.pool.start().await?;
        Ok(())
    }

    /// Stop gracefully, letting running steps commit
    pub async fn shutdown(&self) -> Result<()> {
        self.pool.shutdown().await?;
        Ok(())
    }
}
