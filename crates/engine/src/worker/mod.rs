//! Worker pool for strand execution
//!
//! This module provides:
//! - [`WorkerPool`] - Concurrent strand dispatch with graceful shutdown
//! - [`StrandPoller`] - Runnable-strand polling with exponential backoff
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                             │
//! │  ┌─────────────────┐            ┌───────────────────────┐   │
//! │  │  StrandPoller   │            │   DeadlineMonitor     │   │
//! │  │ (adaptive poll) │            │       (5s)            │   │
//! │  └────────┬────────┘            └───────────────────────┘   │
//! │           │ runnable ids                                     │
//! │           ▼                                                  │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │      Dispatcher (Semaphore-limited, one task each)   │    │
//! │  │  [lease → step → commit] ... [lease → step → commit] │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use strand_engine::worker::{WorkerPool, WorkerPoolConfig};
//!
//! let config = WorkerPoolConfig::new()
//!     .with_worker_id("worker-1")
//!     .with_max_concurrency(20);
//!
//! let pool = WorkerPool::new(store, registry, config);
//! pool.start().await?;
//!
//! // Graceful shutdown
//! pool.shutdown().await?;
//! ```

mod poller;
mod pool;

pub use poller::{PollerConfig, PollerError, StrandPoller};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
