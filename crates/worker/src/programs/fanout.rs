//! `Fanout`: run several `Example` counters as children and sum them
//!
//! ```text
//! start ──spawn N──▶ wait ──(leaf)──▶ done
//!                     │ ▲
//!                     └─┘ yield_to_children
//! ```
//!
//! A deadline guards `wait`; `destroy` tears the children down.

use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::json;
use strand_engine::program::{Program, RegistryError, StepContext};
use strand_engine::strand::{semaphore, Frame, StepError, StepOutcome, StepResult};
use tracing::{info, warn};

use super::example;

pub const NAME: &str = "Fanout";

const MAX_CHILDREN: u64 = 100;
const DEFAULT_DEADLINE_SECS: u64 = 300;

pub fn program() -> Result<Program, RegistryError> {
    Program::builder(NAME)
        .step_fn("start", start)
        .step_fn("wait", wait)
        .step_fn("done", done)
        .step_fn("destroy", destroy)
        .teardown("destroy")
        .steady(["done"])
        .validate_with(validate)
        .build()
}

/// Initial frame for `children` counters
pub fn frame(children: u64) -> Frame {
    Frame::new().with("children", children)
}

fn validate(frame: &Frame) -> Result<(), StepError> {
    let children: u64 = frame
        .fetch("children")
        .map_err(|_| StepError::validation("children must be a positive integer"))?;
    if children == 0 || children > MAX_CHILDREN {
        return Err(StepError::validation(format!(
            "children must be between 1 and {}",
            MAX_CHILDREN
        )));
    }
    Ok(())
}

fn start(ctx: &mut StepContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        let children: u64 = ctx.frame().fetch("children")?;
        let deadline_secs: u64 = ctx.frame().fetch_or("deadline_secs", DEFAULT_DEADLINE_SECS)?;

        for i in 0..children {
            ctx.spawn_program(example::NAME, example::frame(i))?;
        }
        ctx.register_deadline("done", Duration::from_secs(deadline_secs))?;

        info!(strand_id = %ctx.id(), children, "spawned counters");
        Ok(StepOutcome::transition("wait"))
    })
}

fn wait(ctx: &mut StepContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        let mut sum: u64 = ctx.frame().fetch_or("sum", 0)?;
        let mut failed: u64 = ctx.frame().fetch_or("failed", 0)?;

        for child in ctx.collect_finished_children().await? {
            match child.result {
                Ok(value) => sum += value.as_u64().unwrap_or(0),
                Err(failure) => {
                    warn!(child_id = %child.id, error = %failure, "counter failed");
                    failed += 1;
                }
            }
        }

        ctx.frame_mut().set("sum", sum)?;
        ctx.frame_mut().set("failed", failed)?;

        if ctx.is_leaf().await? {
            Ok(StepOutcome::transition("done"))
        } else {
            Ok(StepOutcome::yield_to_children())
        }
    })
}

fn done(ctx: &mut StepContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        let sum: u64 = ctx.frame().fetch_or("sum", 0)?;
        let failed: u64 = ctx.frame().fetch_or("failed", 0)?;
        Ok(StepOutcome::returning(json!({ "sum": sum, "failed": failed })))
    })
}

fn destroy(ctx: &mut StepContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        ctx.destroy_children();
        ctx.consume(semaphore::DESTROY).await?;
        info!(strand_id = %ctx.id(), "fanout destroyed");
        Ok(StepOutcome::returning("destroyed"))
    })
}
