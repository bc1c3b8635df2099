//! Deadline monitoring
//!
//! A step registers the expectation that its strand reaches a label within a
//! time bound. The monitor never changes strand state: an overdue deadline
//! is reported once, as a warning and as a [`DeadlineExceeded`] value.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::persistence::{StoreError, StrandStore};
use crate::time::duration_millis;

/// Deadline monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeadlineConfig {
    /// How often the worker runs the monitor
    #[serde(with = "duration_millis")]
    pub check_interval: Duration,

    /// Maximum deadlines examined per check
    pub batch_size: usize,
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            batch_size: 100,
        }
    }
}

impl DeadlineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

/// Alarm raised when a strand misses a registered deadline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlineExceeded {
    pub strand_id: Uuid,
    pub program: String,
    pub target_label: String,
    pub current_label: String,
    pub deadline_at: DateTime<Utc>,
    pub detected_at: DateTime<Utc>,
}

impl DeadlineExceeded {
    /// How long past the deadline the alarm was detected
    pub fn overdue_by(&self) -> Duration {
        self.detected_at
            .signed_duration_since(self.deadline_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Scans open deadlines and fires each overdue one exactly once
///
/// # Example
///
/// ```ignore
/// use strand_engine::reliability::DeadlineMonitor;
///
/// let monitor = DeadlineMonitor::new(store);
///
/// for alarm in monitor.check().await? {
///     page_operator(&alarm);
/// }
/// ```
pub struct DeadlineMonitor {
    store: Arc<dyn StrandStore>,
    config: DeadlineConfig,
}

impl DeadlineMonitor {
    /// Create a new monitor with default configuration
    pub fn new(store: Arc<dyn StrandStore>) -> Self {
        Self::with_config(store, DeadlineConfig::default())
    }

    pub fn with_config(store: Arc<dyn StrandStore>, config: DeadlineConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &DeadlineConfig {
        &self.config
    }

    /// Check deadlines against the current time
    pub async fn check(&self) -> Result<Vec<DeadlineExceeded>, StoreError> {
        self.check_at(Utc::now()).await
    }

    /// Check deadlines against `now`
    #[instrument(skip(self))]
    pub async fn check_at(&self, now: DateTime<Utc>) -> Result<Vec<DeadlineExceeded>, StoreError> {
        let overdue = self
            .store
            .overdue_deadlines(now, self.config.batch_size)
            .await?;

        let mut alarms = Vec::with_capacity(overdue.len());
        for due in overdue {
            let record = due.record;

            // Another monitor may have fired this registration already
            if !self
                .store
                .mark_deadline_alarmed(record.strand_id, record.deadline_at)
                .await?
            {
                debug!(strand_id = %record.strand_id, "deadline already alarmed");
                continue;
            }

            let alarm = DeadlineExceeded {
                strand_id: record.strand_id,
                program: due.program,
                target_label: record.target_label,
                current_label: due.current_label,
                deadline_at: record.deadline_at,
                detected_at: now,
            };

            warn!(
                strand_id = %alarm.strand_id,
                program = %alarm.program,
                target_label = %alarm.target_label,
                current_label = %alarm.current_label,
                overdue_ms = alarm.overdue_by().as_millis() as u64,
                "strand missed deadline"
            );
            alarms.push(alarm);
        }

        Ok(alarms)
    }
}
