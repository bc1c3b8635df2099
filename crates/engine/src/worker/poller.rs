//! Runnable-strand polling with exponential backoff
//!
//! Finds strands due to run with adaptive polling intervals: back off while
//! the store is idle, snap back to the minimum as soon as work shows up.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, instrument, trace};
use uuid::Uuid;

use crate::persistence::{StoreError, StrandStore};
use crate::time::duration_millis;

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Minimum poll interval (when strands are runnable)
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Maximum poll interval (when idle)
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier when nothing is runnable
    pub backoff_multiplier: f64,

    /// Maximum strands returned per poll
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            batch_size: 10,
        }
    }
}

impl PollerConfig {
    /// Create a new poller configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set minimum poll interval
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Set maximum poll interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Set batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Strand poller with adaptive backoff
///
/// Only lists candidates; leasing happens in the dispatcher, so a strand
/// returned here may still be skipped.
pub struct StrandPoller {
    store: Arc<dyn StrandStore>,
    config: PollerConfig,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl StrandPoller {
    /// Create a new strand poller
    pub fn new(
        store: Arc<dyn StrandStore>,
        config: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            current_interval: config.min_interval,
            config,
            shutdown_rx,
        }
    }

    /// Poll for runnable strands, at most `max_strands`
    ///
    /// Updates the backoff state from the result.
    #[instrument(skip(self))]
    pub async fn poll(&mut self, max_strands: usize) -> Result<Vec<Uuid>, PollerError> {
        if *self.shutdown_rx.borrow() {
            return Err(PollerError::Shutdown);
        }

        let limit = max_strands.min(self.config.batch_size);
        if limit == 0 {
            return Ok(vec![]);
        }

        let runnable = self.store.list_runnable(Utc::now(), limit).await?;

        if runnable.is_empty() {
            self.increase_backoff();
            trace!(
                interval_ms = self.current_interval.as_millis() as u64,
                "nothing runnable, backing off"
            );
        } else {
            self.reset_backoff();
            debug!(count = runnable.len(), "found runnable strands");
        }

        Ok(runnable)
    }

    /// Wait for the current backoff interval
    ///
    /// Returns `true` if shutdown was signalled during the wait.
    pub async fn wait(&mut self) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            _ = shutdown_rx.changed() => {
                debug!("shutdown signal received during wait");
                true
            }
        }
    }

    /// Get the current poll interval
    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase_backoff(&mut self) {
        let next = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = next.min(self.config.max_interval);
    }
}

/// Poller errors
#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Worker shutdown
    #[error("worker is shutting down")]
    Shutdown,
}
