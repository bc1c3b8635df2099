//! `Example`: count `n` up to three, one step per pass

use futures::future::BoxFuture;
use strand_engine::program::{Program, RegistryError, StepContext};
use strand_engine::strand::{Frame, StepError, StepOutcome, StepResult};

pub const NAME: &str = "Example";

/// Value at which the counter returns
const LIMIT: u64 = 3;

pub fn program() -> Result<Program, RegistryError> {
    Program::builder(NAME)
        .step_fn("start", count)
        .step_fn("loop", count)
        .validate_with(validate)
        .build()
}

/// Initial frame for a counter starting at `n`
pub fn frame(n: u64) -> Frame {
    Frame::new().with("n", n)
}

fn validate(frame: &Frame) -> Result<(), StepError> {
    frame
        .fetch::<u64>("n")
        .map(|_| ())
        .map_err(|_| StepError::validation("n must be a non-negative integer"))
}

fn count(ctx: &mut StepContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        let n: u64 = ctx.frame().fetch("n")?;
        let n = n + 1;
        ctx.frame_mut().set("n", n)?;

        if n < LIMIT {
            Ok(StepOutcome::transition("loop"))
        } else {
            Ok(StepOutcome::returning(n))
        }
    })
}
