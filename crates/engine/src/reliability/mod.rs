//! Reliability patterns for durable execution
//!
//! This module provides:
//! - [`RetryPolicy`] - Backoff for retryable step failures
//! - [`DeadlineMonitor`] - Alarms for strands that miss a registered deadline

mod deadline;
mod retry;

pub use deadline::{DeadlineConfig, DeadlineExceeded, DeadlineMonitor};
pub use retry::RetryPolicy;
