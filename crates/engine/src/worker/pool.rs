//! Worker pool for strand execution
//!
//! Runs many strands concurrently under a permit limit, checks deadlines on
//! a fixed cadence and shuts down gracefully.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use super::poller::{PollerConfig, PollerError, StrandPoller};
use crate::engine::{Dispatcher, DispatcherConfig};
use crate::persistence::{StoreError, StrandStore};
use crate::program::ProgramRegistry;
use crate::reliability::{DeadlineConfig, DeadlineMonitor};
use crate::time::duration_millis;

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Unique worker ID, also the prefix of its lease tokens
    pub worker_id: String,

    /// Maximum strands executing a step at once
    pub max_concurrency: usize,

    /// Poller configuration
    pub poller: PollerConfig,

    /// Dispatcher configuration (its worker id follows the pool's)
    pub dispatcher: DispatcherConfig,

    /// Deadline monitor configuration
    pub deadline: DeadlineConfig,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        let worker_id = format!("worker-{}", Uuid::now_v7());
        Self {
            dispatcher: DispatcherConfig::default().with_worker_id(worker_id.clone()),
            worker_id,
            max_concurrency: 10,
            poller: PollerConfig::default(),
            deadline: DeadlineConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Create a new worker pool configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker ID
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self.dispatcher.worker_id = self.worker_id.clone();
        self
    }

    /// Set maximum concurrency
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Set poller configuration
    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    /// Set dispatcher configuration
    pub fn with_dispatcher(mut self, config: DispatcherConfig) -> Self {
        self.dispatcher = config.with_worker_id(self.worker_id.clone());
        self
    }

    /// Set deadline monitor configuration
    pub fn with_deadline(mut self, config: DeadlineConfig) -> Self {
        self.deadline = config;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Worker is running and dispatching strands
    Running,
    /// Worker is draining (finishing current steps, not starting new ones)
    Draining,
    /// Worker has stopped
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Poller error
    #[error("poller error: {0}")]
    Poller(#[from] PollerError),

    /// Worker already running
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// Shutdown timeout
    #[error("graceful shutdown timed out with {0} steps still running")]
    ShutdownTimeout(usize),
}

/// Worker pool driving strands through the dispatcher
///
/// # Example
///
/// ```ignore
/// use strand_engine::worker::{WorkerPool, WorkerPoolConfig};
///
/// let config = WorkerPoolConfig::new()
///     .with_worker_id("worker-1")
///     .with_max_concurrency(20);
///
/// let pool = WorkerPool::new(store, registry, config);
/// pool.start().await?;
///
/// // ... later, graceful shutdown
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool {
    store: Arc<dyn StrandStore>,
    dispatcher: Arc<Dispatcher>,
    config: WorkerPoolConfig,
    shutdown_tx: watch::Sender<bool>,
    status: RwLock<WorkerPoolStatus>,
    active_steps: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    deadline_alarms: Arc<AtomicU64>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
    deadline_handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a new worker pool
    pub fn new(
        store: Arc<dyn StrandStore>,
        registry: Arc<ProgramRegistry>,
        config: WorkerPoolConfig,
    ) -> Self {
        let dispatcher_config = config
            .dispatcher
            .clone()
            .with_worker_id(config.worker_id.clone());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            registry,
            dispatcher_config,
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            store,
            dispatcher,
            active_steps: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            shutdown_tx,
            status: RwLock::new(WorkerPoolStatus::Stopped),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            deadline_alarms: Arc::new(AtomicU64::new(0)),
            poll_handle: Mutex::new(None),
            deadline_handle: Mutex::new(None),
        }
    }

    /// Start the worker pool
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status != WorkerPoolStatus::Stopped {
                return Err(WorkerPoolError::AlreadyRunning);
            }
            *status = WorkerPoolStatus::Running;
        }

        info!(
            worker_id = %self.config.worker_id,
            max_concurrency = self.config.max_concurrency,
            lease_ttl_ms = self.config.dispatcher.lease_ttl.as_millis() as u64,
            "starting worker pool"
        );

        self.shutdown_tx.send_replace(false);
        self.start_poll_loop();
        self.start_deadline_loop();

        Ok(())
    }

    /// Shutdown the worker pool gracefully
    ///
    /// Steps already running finish and commit; strands still leased after
    /// the timeout are picked up elsewhere once their lease expires.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status != WorkerPoolStatus::Running {
                return Ok(());
            }
            *status = WorkerPoolStatus::Draining;
        }

        info!(worker_id = %self.config.worker_id, "initiating graceful shutdown");
        self.shutdown_tx.send_replace(true);

        let poll_handle = self.poll_handle.lock().take();
        let deadline_handle = self.deadline_handle.lock().take();
        for handle in [poll_handle, deadline_handle].into_iter().flatten() {
            if let Err(e) = handle.await {
                warn!(error = %e, "background loop ended abnormally");
            }
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            let running = self.running_steps();
            if running == 0 {
                debug!("all steps completed");
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(remaining_steps = running, "shutdown timeout reached");
                *self.status.write() = WorkerPoolStatus::Stopped;
                return Err(WorkerPoolError::ShutdownTimeout(running));
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        *self.status.write() = WorkerPoolStatus::Stopped;
        info!(worker_id = %self.config.worker_id, "worker pool stopped");
        Ok(())
    }

    /// Get current status
    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    /// Get the worker ID
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// The dispatcher the pool drives
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn store(&self) -> &Arc<dyn StrandStore> {
        &self.store
    }

    /// Number of steps executing right now
    pub fn running_steps(&self) -> usize {
        self.config.max_concurrency - self.active_steps.available_permits()
    }

    /// Deadline alarms raised since the pool was created
    pub fn deadline_alarms(&self) -> u64 {
        self.deadline_alarms.load(Ordering::Relaxed)
    }

    /// Start the polling loop
    fn start_poll_loop(&self) {
        let store = Arc::clone(&self.store);
        let dispatcher = Arc::clone(&self.dispatcher);
        let config = self.config.poller.clone();
        let active_steps = Arc::clone(&self.active_steps);
        let in_flight = Arc::clone(&self.in_flight);
        let shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut poller = StrandPoller::new(store, config, shutdown_rx);

            loop {
                if poller.is_shutdown() {
                    debug!("poll loop: shutdown requested");
                    break;
                }

                let free = active_steps.available_permits();
                if free == 0 {
                    if poller.wait().await {
                        break;
                    }
                    continue;
                }

                match poller.poll(free).await {
                    Ok(strand_ids) => {
                        for strand_id in strand_ids {
                            // Listed again before its lease was taken
                            if !in_flight.lock().insert(strand_id) {
                                continue;
                            }

                            let permit = match Arc::clone(&active_steps).try_acquire_owned() {
                                Ok(p) => p,
                                Err(_) => {
                                    in_flight.lock().remove(&strand_id);
                                    debug!("no permits available");
                                    break;
                                }
                            };

                            let dispatcher = Arc::clone(&dispatcher);
                            let in_flight = Arc::clone(&in_flight);

                            tokio::spawn(async move {
                                match dispatcher.run_strand(strand_id).await {
                                    Ok(outcome) => {
                                        trace!(%strand_id, ?outcome, "strand dispatched")
                                    }
                                    Err(e) => {
                                        error!(%strand_id, error = %e, "dispatch failed")
                                    }
                                }

                                in_flight.lock().remove(&strand_id);
                                drop(permit);
                            });
                        }
                    }
                    Err(PollerError::Shutdown) => break,
                    Err(e) => {
                        error!(error = %e, "poll failed");
                    }
                }

                if poller.wait().await {
                    break;
                }
            }

            debug!("poll loop exited");
        });

        *self.poll_handle.lock() = Some(handle);
    }

    /// Start the deadline monitor loop
    fn start_deadline_loop(&self) {
        let monitor = DeadlineMonitor::with_config(
            Arc::clone(&self.store),
            self.config.deadline.clone(),
        );
        let interval = self.config.deadline.check_interval;
        let alarms = Arc::clone(&self.deadline_alarms);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match monitor.check().await {
                            Ok(exceeded) => {
                                if !exceeded.is_empty() {
                                    alarms.fetch_add(exceeded.len() as u64, Ordering::Relaxed);
                                }
                            }
                            Err(e) => {
                                error!(error = %e, "deadline check failed");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("deadline loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("deadline loop exited");
        });

        *self.deadline_handle.lock() = Some(handle);
    }
}
