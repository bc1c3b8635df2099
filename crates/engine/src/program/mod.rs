//! Programs: named tables of labelled steps
//!
//! - [`Program`] / [`ProgramBuilder`] define the steps of one program
//! - [`ProgramRegistry`] resolves `(program, label)` at dispatch time
//! - [`StepContext`] is what a step sees while it runs

mod context;
mod registry;

pub use context::{CollectedChild, StepContext};
pub use registry::{
    BeforeRun, DestroyGuard, FnStep, FrameValidator, Program, ProgramBuilder, ProgramRegistry,
    RegistryError, Step,
};
