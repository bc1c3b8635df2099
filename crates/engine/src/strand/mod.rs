//! Strand abstractions and types
//!
//! This module contains the core execution primitives:
//! - [`Strand`] and [`Frame`], the durable state of one workflow instance
//! - [`StepOutcome`], the explicit signal a step returns
//! - [`StepError`], the failure taxonomy of a step
//! - [`semaphore`] names used for cooperative signaling

mod definition;
mod error;
mod outcome;
pub mod semaphore;

pub use definition::{FailureKind, Frame, Lease, Link, Strand, StrandFailure, StrandStatus};
pub use error::{StepError, StepResult};
pub use outcome::StepOutcome;
