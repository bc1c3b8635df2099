//! Execution context handed to a step
//!
//! The context owns the strand snapshot taken at lease acquisition. Spawns,
//! reaps, child disposal and deadline changes are buffered here and written
//! by the dispatcher in the same commit that releases the lease, so a step
//! that fails or whose executor dies leaves no partial effects behind.
//! Semaphore calls go straight to the store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::registry::ProgramRegistry;
use crate::persistence::{ChildDisposal, DeadlineChange, DeadlineRecord, NewStrand, StrandStore};
use crate::strand::{FailureKind, Frame, StepError, Strand, StrandFailure, StrandStatus};
use crate::time;

/// A finished child returned by [`StepContext::collect_finished_children`]
#[derive(Debug, Clone, PartialEq)]
pub struct CollectedChild {
    pub id: Uuid,
    pub program: String,

    /// `exitval` on success, the halt record on failure
    pub result: Result<Value, StrandFailure>,
}

impl CollectedChild {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Effects requested by a step, applied atomically on commit
#[derive(Debug, Default)]
pub(crate) struct Effects {
    pub spawned: Vec<NewStrand>,
    pub reaped: Vec<Uuid>,
    pub children: ChildDisposal,
    pub deadline: DeadlineChange,
}

/// Context for one step execution
pub struct StepContext {
    /// Snapshot with the top frame split off into `frame`
    strand: Strand,
    frame: Frame,
    store: Arc<dyn StrandStore>,
    registry: Arc<ProgramRegistry>,
    now: DateTime<Utc>,
    deadline: Option<DeadlineRecord>,
    effects: Effects,
}

impl StepContext {
    /// Build a context from a leased strand
    ///
    /// Fails if the strand has no frame to run.
    pub(crate) fn new(
        mut strand: Strand,
        store: Arc<dyn StrandStore>,
        registry: Arc<ProgramRegistry>,
        now: DateTime<Utc>,
        deadline: Option<DeadlineRecord>,
    ) -> Result<Self, StepError> {
        let frame = strand
            .stack
            .pop()
            .ok_or_else(|| StepError::fatal(format!("strand {} has an empty stack", strand.id)))?;

        Ok(Self {
            strand,
            frame,
            store,
            registry,
            now,
            deadline,
            effects: Effects::default(),
        })
    }

    /// Split back into (caller frames, top frame, buffered effects)
    pub(crate) fn into_parts(self) -> (Vec<Frame>, Frame, Effects) {
        (self.strand.stack, self.frame, self.effects)
    }

    // =========================================================================
    // Strand state
    // =========================================================================

    pub fn id(&self) -> Uuid {
        self.strand.id
    }

    pub fn program(&self) -> &str {
        &self.strand.program
    }

    pub fn label(&self) -> &str {
        &self.strand.label
    }

    /// Stack depth, 1 for the outermost frame
    pub fn depth(&self) -> usize {
        self.strand.stack.len() + 1
    }

    pub fn parent_id(&self) -> Option<Uuid> {
        self.strand.parent_id
    }

    /// Dispatch time
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Consecutive retryable failures of this label so far
    pub fn attempts(&self) -> u32 {
        self.strand.attempts
    }

    /// Value returned by the last pushed sub-call, if any
    pub fn retval(&self) -> Option<&Value> {
        self.strand.retval.as_ref()
    }

    /// The top frame's parameters
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn frame_mut(&mut self) -> &mut Frame {
        &mut self.frame
    }

    /// Open deadline, including one registered earlier in this step
    pub fn deadline(&self) -> Option<(&str, DateTime<Utc>)> {
        match &self.effects.deadline {
            DeadlineChange::Register {
                target_label,
                deadline_at,
                ..
            } => Some((target_label.as_str(), *deadline_at)),
            DeadlineChange::Retire => None,
            DeadlineChange::Keep => self
                .deadline
                .as_ref()
                .map(|d| (d.target_label.as_str(), d.deadline_at)),
        }
    }

    // =========================================================================
    // Children
    // =========================================================================

    /// Create a child strand, returning its id
    ///
    /// The child becomes visible and runnable when this step commits.
    pub fn spawn(
        &mut self,
        program: &str,
        label: &str,
        frame: Frame,
    ) -> Result<Uuid, StepError> {
        self.registry
            .resolve(program, label)
            .map_err(|e| StepError::fatal(format!("cannot spawn: {}", e)))?;

        let child = NewStrand::new(program, label, frame)
            .with_parent(self.id())
            .with_not_before(self.now);
        let id = child.id;
        self.effects.spawned.push(child);
        Ok(id)
    }

    /// Spawn a child at its program's start label
    pub fn spawn_program(&mut self, program: &str, frame: Frame) -> Result<Uuid, StepError> {
        let label = self
            .registry
            .get(program)
            .map(|p| p.start_label().to_string())
            .ok_or_else(|| StepError::fatal(format!("cannot spawn: unknown program {}", program)))?;
        self.spawn(program, &label, frame)
    }

    /// Detach and return every child that terminated since the last collection
    ///
    /// Collecting twice returns each child once; unfinished children are
    /// left alone.
    pub async fn collect_finished_children(&mut self) -> Result<Vec<CollectedChild>, StepError> {
        if self.effects.children != ChildDisposal::Keep {
            return Ok(vec![]);
        }

        let children = self.store.list_children(self.id()).await?;
        let mut collected = Vec::new();
        for child in children {
            if !child.is_finished() || self.effects.reaped.contains(&child.id) {
                continue;
            }

            let result = match child.status {
                StrandStatus::Completed => Ok(child.exitval.unwrap_or(Value::Null)),
                _ => Err(child.failure.unwrap_or_else(|| StrandFailure {
                    kind: FailureKind::Fatal,
                    message: "child halted".to_string(),
                    label: child.label.clone(),
                    at: self.now,
                })),
            };

            self.effects.reaped.push(child.id);
            collected.push(CollectedChild {
                id: child.id,
                program: child.program,
                result,
            });
        }
        Ok(collected)
    }

    /// True when no child remains, finished or not, that is still uncollected
    pub async fn is_leaf(&self) -> Result<bool, StepError> {
        if !self.effects.spawned.is_empty() {
            return Ok(false);
        }
        if self.effects.children != ChildDisposal::Keep {
            return Ok(true);
        }

        let children = self.store.list_children(self.id()).await?;
        Ok(children
            .iter()
            .all(|c| self.effects.reaped.contains(&c.id)))
    }

    /// Delete every existing child on commit
    pub fn destroy_children(&mut self) {
        self.effects.children = ChildDisposal::Destroy;
    }

    /// Let existing children run on as independent strands
    pub fn abandon_children(&mut self) {
        self.effects.children = ChildDisposal::Abandon;
    }

    // =========================================================================
    // Semaphores
    // =========================================================================

    /// Peek at one of this strand's semaphores
    pub async fn is_raised(&self, name: &str) -> Result<bool, StepError> {
        Ok(self.store.semaphore_count(self.id(), name).await? > 0)
    }

    /// Decrement one of this strand's semaphores; returns whether it fired
    pub async fn consume(&self, name: &str) -> Result<bool, StepError> {
        Ok(self.store.consume_semaphore(self.id(), name).await?)
    }

    /// Raise a semaphore on another strand (typically a child)
    pub async fn raise_on(&self, strand_id: Uuid, name: &str) -> Result<u32, StepError> {
        Ok(self.store.raise_semaphore(strand_id, name, self.now).await?)
    }

    // =========================================================================
    // Deadlines
    // =========================================================================

    /// Expect this strand to reach `target_label` within `ttl`
    ///
    /// Replaces any open deadline. Retired when the strand transitions into
    /// the target, when this frame returns, or when the strand completes.
    pub fn register_deadline(
        &mut self,
        target_label: &str,
        ttl: Duration,
    ) -> Result<(), StepError> {
        let program = self.registry.get(self.program()).ok_or_else(|| {
            StepError::fatal(format!("unknown program {}", self.program()))
        })?;
        if !program.has_label(target_label) {
            return Err(StepError::fatal(format!(
                "deadline target {} is not a label of {}",
                target_label,
                program.name()
            )));
        }

        self.effects.deadline = DeadlineChange::Register {
            target_label: target_label.to_string(),
            deadline_at: time::after(self.now, ttl),
            frame_depth: self.depth(),
        };
        Ok(())
    }
}
