//! Strand execution engine
//!
//! The engine module provides the `Dispatcher`, which leases strands and
//! runs one step at a time, and the `StrandClient` facade used by external
//! callers to create, signal and inspect strands.

mod client;
mod dispatcher;
mod status;

pub use client::{EngineError, StrandClient};
pub use dispatcher::{DispatchError, DispatchOutcome, Dispatcher, DispatcherConfig, PassReport};
pub use status::ResourceState;
