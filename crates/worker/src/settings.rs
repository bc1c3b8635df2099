// Worker settings loaded from the environment
// Decision: DATABASE_URL absent means the in-memory store (local runs, demos)

use std::time::Duration;

use strand_engine::engine::DispatcherConfig;
use strand_engine::reliability::DeadlineConfig;
use strand_engine::worker::WorkerPoolConfig;
use uuid::Uuid;

/// Invalid environment value
#[derive(Debug, thiserror::Error)]
#[error("invalid value for {var}: {value:?}")]
pub struct SettingsError {
    pub var: &'static str,
    pub value: String,
}

/// Configuration for the worker process
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    /// PostgreSQL connection string; `None` selects the in-memory store
    pub database_url: Option<String>,
    /// Worker id, the prefix of this process's lease tokens
    pub worker_id: String,
    /// Maximum concurrent steps
    pub max_concurrency: usize,
    pub lease_ttl: Duration,
    pub deadline_check_interval: Duration,
    pub db_max_connections: u32,
    /// Assemble a `Fanout` strand with this many children at startup
    pub demo_fanout: Option<u32>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            database_url: None,
            worker_id: format!("worker-{}", Uuid::now_v7()),
            max_concurrency: 10,
            lease_ttl: Duration::from_secs(120),
            deadline_check_interval: Duration::from_secs(5),
            db_max_connections: 10,
            demo_fanout: None,
        }
    }
}

impl WorkerSettings {
    /// Create settings from environment variables
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Create settings from any variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());
        let worker_id = lookup("STRAND_WORKER_ID").unwrap_or(defaults.worker_id);

        let max_concurrency = parse(&lookup, "STRAND_MAX_CONCURRENCY")?
            .unwrap_or(defaults.max_concurrency);
        let lease_ttl = parse(&lookup, "STRAND_LEASE_TTL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.lease_ttl);
        let deadline_check_interval = parse(&lookup, "STRAND_DEADLINE_CHECK_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.deadline_check_interval);
        let db_max_connections = parse(&lookup, "STRAND_DB_MAX_CONNECTIONS")?
            .unwrap_or(defaults.db_max_connections);
        let demo_fanout = parse(&lookup, "STRAND_DEMO_FANOUT")?;

        if max_concurrency == 0 {
            return Err(SettingsError {
                var: "STRAND_MAX_CONCURRENCY",
                value: "0".to_string(),
            });
        }
        if lease_ttl.is_zero() {
            return Err(SettingsError {
                var: "STRAND_LEASE_TTL_SECS",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            database_url,
            worker_id,
            max_concurrency,
            lease_ttl,
            deadline_check_interval,
            db_max_connections,
            demo_fanout,
        })
    }

    /// Worker pool configuration derived from these settings
    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::new()
            .with_worker_id(self.worker_id.clone())
            .with_max_concurrency(self.max_concurrency)
            .with_dispatcher(DispatcherConfig::new().with_lease_ttl(self.lease_ttl))
            .with_deadline(DeadlineConfig::new().with_check_interval(self.deadline_check_interval))
    }
}

fn parse<F, T>(lookup: &F, var: &'static str) -> Result<Option<T>, SettingsError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| SettingsError { var, value }),
    }
}
