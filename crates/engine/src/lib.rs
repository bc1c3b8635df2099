//! # Strand Execution Engine
//!
//! A PostgreSQL-backed engine for long-running, hierarchical operational
//! workflows (provisioning, teardown, restarts) that must survive process
//! restarts.
//!
//! ## Features
//!
//! - **Durable strands**: program, label and a stack of frames persisted after every step
//! - **Lease-based exclusion**: a strand is executed by at most one worker at a time
//! - **Explicit step outcomes**: transition, return, suspend, push, yield to children
//! - **Parent/child strands**: spawn, wait with `is_leaf`, collect and reap results
//! - **Semaphores**: durable counters for cooperative cancellation (`destroy`)
//! - **Deadlines**: one-shot alarms for strands stuck before a target label
//! - **Automatic retries**: exponential backoff with jitter for retryable failures
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                             │
//! │  (polls runnable strands, runs the deadline monitor)        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Dispatcher                             │
//! │  (lease → before_run hooks → step → atomic commit)          │
//! └─────────────────────────────────────────────────────────────┘
//!               │                               │
//!               ▼                               ▼
//! ┌───────────────────────────┐   ┌───────────────────────────┐
//! │     ProgramRegistry       │   │       StrandStore         │
//! │  (program, label) → step  │   │  (strands, semaphores,    │
//! │                           │   │   deadlines)              │
//! └───────────────────────────┘   └───────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use strand_engine::prelude::*;
//!
//! fn start(ctx: &mut StepContext) -> BoxFuture<'_, StepResult> {
//!     Box::pin(async move {
//!         let n: u64 = ctx.frame().fetch("n")?;
//!         ctx.frame_mut().set("n", n + 1)?;
//!         if n + 1 < 3 {
//!             Ok(StepOutcome::transition("start"))
//!         } else {
//!             Ok(StepOutcome::returning(n + 1))
//!         }
//!     })
//! }
//!
//! let program = Program::builder("Example").step_fn("start", start).build()?;
//! let registry = Arc::new(ProgramRegistry::new().with(program)?);
//!
//! let client = StrandClient::new(store.clone(), registry.clone());
//! client.assemble("Example", Frame::new().with("n", 0)).await?;
//!
//! let pool = WorkerPool::new(store, registry, WorkerPoolConfig::default());
//! pool.start().await?;
//! ```

pub mod engine;
pub mod persistence;
pub mod program;
pub mod reliability;
pub mod strand;
mod time;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::engine::{
        DispatchOutcome, Dispatcher, DispatcherConfig, EngineError, ResourceState, StrandClient,
    };
    pub use crate::persistence::{
        InMemoryStrandStore, NewStrand, PostgresStrandStore, StoreError, StrandStore,
    };
    pub use crate::program::{
        CollectedChild, Program, ProgramBuilder, ProgramRegistry, RegistryError, Step,
        StepContext,
    };
    pub use crate::reliability::{DeadlineConfig, DeadlineExceeded, DeadlineMonitor, RetryPolicy};
    pub use crate::strand::{
        semaphore, Frame, StepError, StepOutcome, StepResult, Strand, StrandStatus,
    };
    pub use crate::worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
    pub use futures::future::BoxFuture;
    pub use std::sync::Arc;
}

// Re-export key types at crate root
pub use engine::{Dispatcher, DispatcherConfig, EngineError, StrandClient};
pub use persistence::{InMemoryStrandStore, PostgresStrandStore, StoreError, StrandStore};
pub use program::{Program, ProgramRegistry, Step, StepContext};
pub use reliability::{DeadlineMonitor, RetryPolicy};
pub use strand::{Frame, StepError, StepOutcome, StepResult, Strand, StrandStatus};
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
