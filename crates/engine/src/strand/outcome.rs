//! Step outcomes
//!
//! Every step ends by returning exactly one [`StepOutcome`]; the dispatcher
//! persists it and releases the lease.

use std::time::Duration;

use serde_json::Value;

use super::Frame;

/// What a step asks the engine to do next
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Continue at another label of the same program, stack unchanged
    Transition { label: String },

    /// Pop the current frame, handing `value` to the caller (or finishing the strand)
    Return { value: Value },

    /// Stay on the current label and retry no earlier than `delay` from now
    Suspend { delay: Duration },

    /// Enter a same-strand sub-call; the caller's step re-runs when it returns
    Push {
        program: String,
        label: String,
        frame: Frame,
    },

    /// Let children make progress before this strand is reconsidered
    YieldToChildren,
}

impl StepOutcome {
    /// Transition to `label`
    pub fn transition(label: impl Into<String>) -> Self {
        Self::Transition {
            label: label.into(),
        }
    }

    /// Return `value` to the caller
    pub fn returning(value: impl Into<Value>) -> Self {
        Self::Return {
            value: value.into(),
        }
    }

    /// Suspend for `delay`
    pub fn suspend(delay: Duration) -> Self {
        Self::Suspend { delay }
    }

    /// Suspend for `secs` seconds
    pub fn suspend_secs(secs: u64) -> Self {
        Self::Suspend {
            delay: Duration::from_secs(secs),
        }
    }

    /// Push a sub-call
    pub fn push(program: impl Into<String>, label: impl Into<String>, frame: Frame) -> Self {
        Self::Push {
            program: program.into(),
            label: label.into(),
            frame,
        }
    }

    /// Yield to children
    pub fn yield_to_children() -> Self {
        Self::YieldToChildren
    }

    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transition { .. } => "transition",
            Self::Return { .. } => "return",
            Self::Suspend { .. } => "suspend",
            Self::Push { .. } => "push",
            Self::YieldToChildren => "yield_to_children",
        }
    }
}
