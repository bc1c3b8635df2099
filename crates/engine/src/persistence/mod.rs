//! Persistence layer for strands
//!
//! This module provides:
//! - [`StrandStore`] trait for strand, semaphore and deadline persistence
//! - [`InMemoryStrandStore`] for testing and local runs
//! - [`PostgresStrandStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryStrandStore;
pub use postgres::PostgresStrandStore;
pub use store::{
    ChildDisposal, ChildSummary, DeadlineChange, DeadlineRecord, NewStrand, OverdueDeadline,
    StoreError, StrandCommit, StrandStore, StrandUpdate,
};
