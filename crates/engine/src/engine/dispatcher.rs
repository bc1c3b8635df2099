//! Strand dispatcher
//!
//! The `Dispatcher` is responsible for:
//! - Leasing a runnable strand (compare-and-swap, so one executor per strand)
//! - Running the program's before-run hooks, then the step for the label
//! - Interpreting the step outcome and committing it atomically with the
//!   lease release
//! - Converting retryable failures into backoff and halting on fatal ones

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::persistence::{
    ChildDisposal, DeadlineChange, DeadlineRecord, StoreError, StrandCommit, StrandStore,
    StrandUpdate,
};
use crate::program::{Program, ProgramRegistry, Step, StepContext};
use crate::reliability::RetryPolicy;
use crate::strand::{
    FailureKind, Link, StepError, StepOutcome, StepResult, Strand, StrandFailure, StrandStatus,
};
use crate::time::{self, duration_millis};

/// Configuration for the dispatcher
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatcherConfig {
    /// Prefix of the lease token written to leased strands
    pub worker_id: String,

    /// How long a lease protects a strand; must exceed the longest step
    #[serde(with = "duration_millis")]
    pub lease_ttl: Duration,

    /// How long a strand stays away after yielding to its children
    #[serde(with = "duration_millis")]
    pub yield_delay: Duration,

    /// Backoff for retryable step failures
    pub retry_policy: RetryPolicy,

    /// Maximum strands dispatched per pass
    pub batch_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("dispatcher-{}", Uuid::now_v7()),
            lease_ttl: Duration::from_secs(120),
            yield_delay: Duration::ZERO,
            retry_policy: RetryPolicy::default(),
            batch_size: 100,
        }
    }
}

impl DispatcherConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the lease token prefix
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Set the lease duration
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Set the yield-to-children delay
    pub fn with_yield_delay(mut self, delay: Duration) -> Self {
        self.yield_delay = delay;
        self
    }

    /// Set the retry policy
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the per-pass batch size
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

/// Errors from dispatcher operations
///
/// Step failures are never reported here; they become backoff or a halt.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// What one dispatch did to a strand
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Not runnable, or another executor holds the lease
    Skipped,

    /// The lease expired and was taken over before commit; nothing was written
    LeaseLost,

    Transitioned { label: String },

    Suspended { until: DateTime<Utc> },

    Pushed { program: String, label: String },

    /// A sub-call returned to its caller
    Returned { program: String, label: String },

    /// The outermost frame returned
    Completed { exitval: Value },

    Yielded,

    /// Retryable failure; the label runs again after backoff
    Retrying { attempt: u32, until: DateTime<Utc> },

    Halted { failure: StrandFailure },
}

impl DispatchOutcome {
    /// Whether a step ran and its result was committed
    pub fn is_dispatched(&self) -> bool {
        !matches!(self, Self::Skipped | Self::LeaseLost)
    }
}

/// Tally of one scheduling pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Runnable strands listed
    pub examined: usize,

    /// Strands whose step ran and committed
    pub dispatched: usize,

    pub skipped: usize,
    pub lease_lost: usize,
    pub completed: usize,
    pub halted: usize,
}

/// Why a dispatch ended in a halt instead of an outcome
enum Halt {
    Step(StepError),
    Contract(String),
    Panic(String),
}

impl Halt {
    fn into_failure(self, label: &str, at: DateTime<Utc>) -> StrandFailure {
        let (kind, message) = match self {
            Halt::Step(e) => (FailureKind::Fatal, e.to_string()),
            Halt::Contract(message) => (FailureKind::ContractViolation, message),
            Halt::Panic(message) => (FailureKind::Panicked, message),
        };
        StrandFailure {
            kind,
            message,
            label: label.to_string(),
            at,
        }
    }
}

/// Strand dispatcher
///
/// Runs exactly one step per leased strand. Any number of dispatchers, in
/// one process or many, may share a store.
///
/// # Example
///
/// ```ignore
/// use strand_engine::prelude::*;
///
/// let dispatcher = Dispatcher::new(store, registry, DispatcherConfig::default());
///
/// // One scheduling pass over everything runnable now
/// let report = dispatcher.run_pass().await?;
///
/// // Or drive a single strand
/// let outcome = dispatcher.run_strand(strand_id).await?;
/// ```
pub struct Dispatcher {
    store: Arc<dyn StrandStore>,
    registry: Arc<ProgramRegistry>,
    config: DispatcherConfig,
}

impl Dispatcher {
    /// Create a new dispatcher
    pub fn new(
        store: Arc<dyn StrandStore>,
        registry: Arc<ProgramRegistry>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    /// Get a reference to the store
    pub fn store(&self) -> &Arc<dyn StrandStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ProgramRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Dispatch every strand runnable now, up to the batch size
    pub async fn run_pass(&self) -> Result<PassReport, DispatchError> {
        self.run_pass_at(Utc::now()).await
    }

    /// Dispatch every strand runnable at `now`, up to the batch size
    #[instrument(skip(self))]
    pub async fn run_pass_at(&self, now: DateTime<Utc>) -> Result<PassReport, DispatchError> {
        let runnable = self
            .store
            .list_runnable(now, self.config.batch_size)
            .await?;

        let mut report = PassReport {
            examined: runnable.len(),
            ..PassReport::default()
        };

        for strand_id in runnable {
            match self.run_strand_at(strand_id, now).await? {
                DispatchOutcome::Skipped => report.skipped += 1,
                DispatchOutcome::LeaseLost => report.lease_lost += 1,
                outcome => {
                    report.dispatched += 1;
                    match outcome {
                        DispatchOutcome::Completed { .. } => report.completed += 1,
                        DispatchOutcome::Halted { .. } => report.halted += 1,
                        _ => {}
                    }
                }
            }
        }

        if report.examined > 0 {
            debug!(
                examined = report.examined,
                dispatched = report.dispatched,
                skipped = report.skipped,
                "pass finished"
            );
        }
        Ok(report)
    }

    /// Run one step of a strand now
    pub async fn run_strand(&self, strand_id: Uuid) -> Result<DispatchOutcome, DispatchError> {
        self.run_strand_at(strand_id, Utc::now()).await
    }

    /// Run one step of a strand as of `now`
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn run_strand_at(
        &self,
        strand_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, DispatchError> {
        // One token per acquisition; commit and release are fenced on it
        let token = format!("{}:{}", self.config.worker_id, Uuid::now_v7());
        let owner = token.as_str();

        let strand = match self
            .store
            .acquire_lease(strand_id, owner, now, self.config.lease_ttl)
            .await
        {
            Ok(Some(strand)) => strand,
            Ok(None) | Err(StoreError::StrandNotFound(_)) => {
                debug!(%strand_id, "strand not leasable, skipping");
                return Ok(DispatchOutcome::Skipped);
            }
            Err(e) => return Err(e.into()),
        };

        let (commit, outcome) = match self.execute(&strand, now).await {
            Ok(result) => result,
            Err(e) => {
                // Give the strand back so another pass can retry right away
                if let Err(release_err) = self.store.release_lease(strand_id, owner).await {
                    warn!(%strand_id, error = %release_err, "failed to release lease");
                }
                return Err(e.into());
            }
        };

        match self.store.commit(strand_id, owner, commit).await {
            Ok(()) => {}
            Err(StoreError::LeaseLost { .. }) => {
                warn!(%strand_id, program = %strand.program, label = %strand.label,
                    "lease lost before commit, step result discarded");
                return Ok(DispatchOutcome::LeaseLost);
            }
            Err(StoreError::StrandNotFound(_)) => {
                warn!(%strand_id, "strand deleted while running, step result discarded");
                return Ok(DispatchOutcome::LeaseLost);
            }
            Err(e) => {
                if let Err(release_err) = self.store.release_lease(strand_id, owner).await {
                    warn!(%strand_id, error = %release_err, "failed to release lease");
                }
                return Err(e.into());
            }
        }

        self.log_outcome(&strand, &outcome);
        Ok(outcome)
    }

    /// Run hooks and step, producing the commit for a leased strand
    async fn execute(
        &self,
        strand: &Strand,
        now: DateTime<Utc>,
    ) -> Result<(StrandCommit, DispatchOutcome), StoreError> {
        let Some(program) = self.registry.get(&strand.program) else {
            let halt = Halt::Contract(format!("unknown program {}", strand.program));
            return Ok(self.halt(strand, halt, now));
        };
        let Some(step) = program.step(&strand.label) else {
            let halt = Halt::Contract(format!(
                "program {} has no label {}",
                strand.program, strand.label
            ));
            return Ok(self.halt(strand, halt, now));
        };

        let deadline = self.store.load_deadline(strand.id).await?;
        let mut ctx = match StepContext::new(
            strand.clone(),
            self.store.clone(),
            self.registry.clone(),
            now,
            deadline.clone(),
        ) {
            Ok(ctx) => ctx,
            Err(e) => return Ok(self.halt(strand, Halt::Contract(e.to_string()), now)),
        };

        let result = AssertUnwindSafe(run_step(&program, step.as_ref(), &mut ctx))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(outcome)) => {
                debug!(strand_id = %strand.id, outcome = outcome.kind(), "step finished");
                self.apply(strand, &program, ctx, deadline.as_ref(), outcome, now)
                    .await
                    .map(|applied| {
                        applied.unwrap_or_else(|halt| self.halt(strand, halt, now))
                    })
            }
            Ok(Err(StepError::Retryable { message, backoff })) => {
                Ok(self.retry(strand, message, backoff, now))
            }
            Ok(Err(e)) => Ok(self.halt(strand, Halt::Step(e), now)),
            Err(payload) => Ok(self.halt(strand, Halt::Panic(panic_message(payload)), now)),
        }
    }

    /// Turn a step outcome into the commit that persists it
    ///
    /// The outer `Result` carries store failures, the inner one contract
    /// violations that halt the strand.
    async fn apply(
        &self,
        strand: &Strand,
        program: &Program,
        ctx: StepContext,
        deadline: Option<&DeadlineRecord>,
        outcome: StepOutcome,
        now: DateTime<Utc>,
    ) -> Result<Result<(StrandCommit, DispatchOutcome), Halt>, StoreError> {
        let (mut stack, frame, effects) = ctx.into_parts();
        let mut update = StrandUpdate::from(strand);
        update.attempts = 0;
        update.not_before = now;
        let mut deadline_change = effects.deadline;

        let dispatched = match outcome {
            StepOutcome::Transition { label } => {
                if !program.has_label(&label) {
                    return Ok(Err(Halt::Contract(format!(
                        "transition to unknown label {} of {}",
                        label,
                        program.name()
                    ))));
                }
                if open_deadline(&deadline_change, deadline).is_some_and(|(target, _)| target == label) {
                    deadline_change = DeadlineChange::Retire;
                }
                stack.push(frame);
                update.label = label.clone();
                DispatchOutcome::Transitioned { label }
            }
            StepOutcome::Suspend { delay } => {
                stack.push(frame);
                update.not_before = time::after(now, delay);
                DispatchOutcome::Suspended {
                    until: update.not_before,
                }
            }
            StepOutcome::YieldToChildren => {
                stack.push(frame);
                update.not_before = time::after(now, self.config.yield_delay);
                DispatchOutcome::Yielded
            }
            StepOutcome::Push {
                program: target,
                label,
                frame: mut callee,
            } => {
                if let Err(e) = self.registry.resolve(&target, &label) {
                    return Ok(Err(Halt::Contract(format!("cannot push: {}", e))));
                }
                stack.push(frame);
                callee.link = Some(Link {
                    program: update.program.clone(),
                    label: update.label.clone(),
                });
                stack.push(callee);
                update.program = target.clone();
                update.label = label.clone();
                update.retval = None;
                DispatchOutcome::Pushed {
                    program: target,
                    label,
                }
            }
            StepOutcome::Return { value } if !stack.is_empty() => {
                let Some(link) = frame.link else {
                    return Ok(Err(Halt::Contract(
                        "sub-call frame has no return link".to_string(),
                    )));
                };
                if open_deadline(&deadline_change, deadline)
                    .is_some_and(|(_, depth)| depth > stack.len())
                {
                    deadline_change = DeadlineChange::Retire;
                }
                update.program = link.program.clone();
                update.label = link.label.clone();
                update.retval = Some(value);
                DispatchOutcome::Returned {
                    program: link.program,
                    label: link.label,
                }
            }
            StepOutcome::Return { value } => {
                if effects.children == ChildDisposal::Keep {
                    let unresolved = !effects.spawned.is_empty()
                        || self
                            .store
                            .list_children(strand.id)
                            .await?
                            .iter()
                            .any(|c| !effects.reaped.contains(&c.id));
                    if unresolved {
                        return Ok(Err(Halt::Contract(
                            "outermost frame returned with unresolved children; collect, \
                             destroy or abandon them first"
                                .to_string(),
                        )));
                    }
                }
                deadline_change = DeadlineChange::Retire;
                update.status = StrandStatus::Completed;
                update.exitval = Some(value.clone());
                update.retval = None;
                DispatchOutcome::Completed { exitval: value }
            }
        };

        update.stack = stack;
        let commit = StrandCommit {
            update,
            spawned: effects.spawned,
            reaped: effects.reaped,
            children: effects.children,
            deadline: deadline_change,
        };
        Ok(Ok((commit, dispatched)))
    }

    /// Back off and re-run the same label, or halt when the policy is spent
    fn retry(
        &self,
        strand: &Strand,
        message: String,
        backoff: Option<Duration>,
        now: DateTime<Utc>,
    ) -> (StrandCommit, DispatchOutcome) {
        let attempt = strand.attempts.saturating_add(1);
        let Some(policy_delay) = self.config.retry_policy.next_delay(attempt) else {
            let failure = StrandFailure {
                kind: FailureKind::RetriesExhausted,
                message: format!("gave up after {} attempts: {}", attempt, message),
                label: strand.label.clone(),
                at: now,
            };
            return self.halted(strand, failure);
        };

        let mut update = StrandUpdate::from(strand);
        update.attempts = attempt;
        update.not_before = time::after(now, backoff.unwrap_or(policy_delay));

        info!(
            strand_id = %strand.id,
            program = %strand.program,
            label = %strand.label,
            attempt,
            error = %message,
            "step failed, retrying"
        );

        let until = update.not_before;
        (
            StrandCommit::update_only(update),
            DispatchOutcome::Retrying { attempt, until },
        )
    }

    fn halt(&self, strand: &Strand, halt: Halt, now: DateTime<Utc>) -> (StrandCommit, DispatchOutcome) {
        let failure = halt.into_failure(&strand.label, now);
        self.halted(strand, failure)
    }

    /// Stop scheduling the strand, keeping label and stack for diagnosis
    fn halted(&self, strand: &Strand, failure: StrandFailure) -> (StrandCommit, DispatchOutcome) {
        error!(
            strand_id = %strand.id,
            program = %strand.program,
            label = %strand.label,
            kind = ?failure.kind,
            error = %failure.message,
            "strand halted"
        );

        let mut update = StrandUpdate::from(strand);
        update.status = StrandStatus::Halted;
        update.failure = Some(failure.clone());
        (
            StrandCommit::update_only(update),
            DispatchOutcome::Halted { failure },
        )
    }

    fn log_outcome(&self, strand: &Strand, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Completed { .. } => {
                info!(strand_id = %strand.id, program = %strand.program, "strand completed");
            }
            DispatchOutcome::Transitioned { label } => {
                debug!(strand_id = %strand.id, from = %strand.label, to = %label, "transitioned");
            }
            DispatchOutcome::Suspended { until } => {
                debug!(strand_id = %strand.id, label = %strand.label, %until, "suspended");
            }
            _ => {}
        }
    }
}

async fn run_step(program: &Program, step: &dyn Step, ctx: &mut StepContext) -> StepResult {
    if let Some(outcome) = program.before_run(ctx).await? {
        return Ok(outcome);
    }
    step.run(ctx).await
}

/// Deadline in effect after the step: (target label, registering depth)
fn open_deadline<'a>(
    change: &'a DeadlineChange,
    existing: Option<&'a DeadlineRecord>,
) -> Option<(&'a str, usize)> {
    match change {
        DeadlineChange::Register {
            target_label,
            frame_depth,
            ..
        } => Some((target_label.as_str(), *frame_depth)),
        DeadlineChange::Retire => None,
        DeadlineChange::Keep => existing.map(|d| (d.target_label.as_str(), d.frame_depth)),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("step panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("step panicked: {}", s)
    } else {
        "step panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InMemoryStrandStore, NewStrand};
    use crate::strand::Frame;
    use async_trait::async_trait;
    use serde_json::json;

    struct Bump;

    #[async_trait]
    impl Step for Bump {
        async fn run(&self, ctx: &mut StepContext) -> StepResult {
            let n: i64 = ctx.frame().fetch("n")?;
            ctx.frame_mut().set("n", n + 1)?;
            Ok(StepOutcome::transition("done"))
        }
    }

    struct Finish;

    #[async_trait]
    impl Step for Finish {
        async fn run(&self, ctx: &mut StepContext) -> StepResult {
            Ok(StepOutcome::Return {
                value: ctx.frame().get("n").cloned().unwrap_or(Value::Null),
            })
        }
    }

    struct Flaky;

    #[async_trait]
    impl Step for Flaky {
        async fn run(&self, _ctx: &mut StepContext) -> StepResult {
            Err(StepError::retryable("remote timed out"))
        }
    }

    struct Broken;

    #[async_trait]
    impl Step for Broken {
        async fn run(&self, _ctx: &mut StepContext) -> StepResult {
            Err(StepError::fatal("disk gone"))
        }
    }

    struct Panics;

    #[async_trait]
    impl Step for Panics {
        async fn run(&self, _ctx: &mut StepContext) -> StepResult {
            panic!("boom")
        }
    }

    struct Lost;

    #[async_trait]
    impl Step for Lost {
        async fn run(&self, _ctx: &mut StepContext) -> StepResult {
            Ok(StepOutcome::transition("nowhere"))
        }
    }

    fn setup(policy: RetryPolicy) -> (Arc<InMemoryStrandStore>, Dispatcher) {
        let program = Program::builder("Test")
            .step("start", Bump)
            .step("done", Finish)
            .step("flaky", Flaky)
            .step("broken", Broken)
            .step("panics", Panics)
            .step("lost", Lost)
            .build()
            .unwrap();
        let registry = Arc::new(ProgramRegistry::new().with(program).unwrap());
        let store = Arc::new(InMemoryStrandStore::new());
        let config = DispatcherConfig::new()
            .with_worker_id("test-worker")
            .with_retry_policy(policy);
        let dispatcher = Dispatcher::new(store.clone(), registry, config);
        (store, dispatcher)
    }

    async fn create(store: &InMemoryStrandStore, label: &str) -> Uuid {
        let new = NewStrand::new("Test", label, Frame::new().with("n", 1));
        let id = new.id;
        store.create_strand(new).await.unwrap();
        id
    }

    #[test]
    fn test_config_builder() {
        let config = DispatcherConfig::new()
            .with_worker_id("w1")
            .with_lease_ttl(Duration::from_secs(10))
            .with_yield_delay(Duration::from_millis(50))
            .with_batch_size(0);

        assert_eq!(config.worker_id, "w1");
        assert_eq!(config.lease_ttl, Duration::from_secs(10));
        assert_eq!(config.yield_delay, Duration::from_millis(50));
        assert_eq!(config.batch_size, 1);
    }

    #[test]
    fn test_config_serialization() {
        let config = DispatcherConfig::new().with_worker_id("w1");
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["lease_ttl"], json!(120_000));

        let parsed: DispatcherConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);
    }

    #[tokio::test]
    async fn test_transition_then_complete() {
        let (store, dispatcher) = setup(RetryPolicy::default());
        let id = create(&store, "start").await;

        let outcome = dispatcher.run_strand(id).await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Transitioned {
                label: "done".into()
            }
        );

        let strand = store.load_strand(id).await.unwrap();
        assert_eq!(strand.label, "done");
        assert_eq!(strand.depth(), 1);
        assert_eq!(strand.top_frame().unwrap().get("n"), Some(&json!(2)));
        assert!(strand.lease.is_none());

        let outcome = dispatcher.run_strand(id).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Completed { exitval: json!(2) });

        let strand = store.load_strand(id).await.unwrap();
        assert_eq!(strand.status, StrandStatus::Completed);
        assert_eq!(strand.exitval, Some(json!(2)));
        assert_eq!(strand.depth(), 0);

        assert_eq!(dispatcher.run_strand(id).await.unwrap(), DispatchOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_skips_leased_strand() {
        let (store, dispatcher) = setup(RetryPolicy::default());
        let id = create(&store, "start").await;

        store
            .acquire_lease(id, "someone-else", Utc::now(), Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(dispatcher.run_strand(id).await.unwrap(), DispatchOutcome::Skipped);
        assert_eq!(store.load_strand(id).await.unwrap().label, "start");
    }

    #[tokio::test]
    async fn test_retryable_failure_backs_off() {
        let policy = RetryPolicy::fixed(Duration::from_secs(10), 3);
        let (store, dispatcher) = setup(policy);
        let id = create(&store, "flaky").await;
        let now = Utc::now();

        let outcome = dispatcher.run_strand_at(id, now).await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Retrying {
                attempt: 1,
                until: now + chrono::Duration::seconds(10)
            }
        );

        let strand = store.load_strand(id).await.unwrap();
        assert_eq!(strand.attempts, 1);
        assert_eq!(strand.label, "flaky");
        assert!(store.list_runnable(now, 10).await.unwrap().is_empty());

        let later = now + chrono::Duration::seconds(10);
        assert!(matches!(
            dispatcher.run_strand_at(id, later).await.unwrap(),
            DispatchOutcome::Retrying { attempt: 2, .. }
        ));

        let outcome = dispatcher
            .run_strand_at(id, later + chrono::Duration::seconds(10))
            .await
            .unwrap();
        let DispatchOutcome::Halted { failure } = outcome else {
            panic!("expected halt, got {:?}", outcome);
        };
        assert_eq!(failure.kind, FailureKind::RetriesExhausted);

        let strand = store.load_strand(id).await.unwrap();
        assert_eq!(strand.status, StrandStatus::Halted);
        assert_eq!(strand.label, "flaky");
    }

    #[tokio::test]
    async fn test_fatal_failure_halts() {
        let (store, dispatcher) = setup(RetryPolicy::default());
        let id = create(&store, "broken").await;

        let outcome = dispatcher.run_strand(id).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Halted { ref failure } if failure.kind == FailureKind::Fatal));

        let strand = store.load_strand(id).await.unwrap();
        assert_eq!(strand.status, StrandStatus::Halted);
        assert_eq!(strand.depth(), 1);
        assert!(strand.failure.unwrap().message.contains("disk gone"));
        assert!(store.list_runnable(Utc::now(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_panic_halts() {
        let (store, dispatcher) = setup(RetryPolicy::default());
        let id = create(&store, "panics").await;

        let outcome = dispatcher.run_strand(id).await.unwrap();
        let DispatchOutcome::Halted { failure } = outcome else {
            panic!("expected halt");
        };
        assert_eq!(failure.kind, FailureKind::Panicked);
        assert!(failure.message.contains("boom"));
        assert!(store.load_strand(id).await.unwrap().lease.is_none());
    }

    #[tokio::test]
    async fn test_unknown_transition_target_halts() {
        let (store, dispatcher) = setup(RetryPolicy::default());
        let id = create(&store, "lost").await;

        let outcome = dispatcher.run_strand(id).await.unwrap();
        assert!(matches!(
            outcome,
            DispatchOutcome::Halted { ref failure } if failure.kind == FailureKind::ContractViolation
        ));
        assert_eq!(store.load_strand(id).await.unwrap().label, "lost");
    }

    #[tokio::test]
    async fn test_unknown_program_halts() {
        let (store, dispatcher) = setup(RetryPolicy::default());
        let new = NewStrand::new("Gone", "start", Frame::new());
        let id = new.id;
        store.create_strand(new).await.unwrap();

        assert!(matches!(
            dispatcher.run_strand(id).await.unwrap(),
            DispatchOutcome::Halted { .. }
        ));
    }

    #[tokio::test]
    async fn test_run_pass() {
        let (store, dispatcher) = setup(RetryPolicy::default());
        for _ in 0..3 {
            create(&store, "done").await;
        }
        create(&store, "broken").await;

        let report = dispatcher.run_pass().await.unwrap();
        assert_eq!(report.examined, 4);
        assert_eq!(report.dispatched, 4);
        assert_eq!(report.completed, 3);
        assert_eq!(report.halted, 1);

        let report = dispatcher.run_pass().await.unwrap();
        assert_eq!(report, PassReport::default());
    }

    #[tokio::test]
    async fn test_missing_strand_is_skipped() {
        let (_store, dispatcher) = setup(RetryPolicy::default());
        assert_eq!(
            dispatcher.run_strand(Uuid::now_v7()).await.unwrap(),
            DispatchOutcome::Skipped
        );
    }
}
