//! StrandStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::strand::{Frame, Strand, StrandFailure, StrandStatus};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Strand not found
    #[error("strand not found: {0}")]
    StrandNotFound(Uuid),

    /// A strand with this id already exists
    #[error("strand already exists: {0}")]
    DuplicateStrand(Uuid),

    /// The caller no longer holds the strand's lease
    #[error("lease on strand {strand_id} is not held by {owner}")]
    LeaseLost { strand_id: Uuid, owner: String },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Definition of a strand to be created
#[derive(Debug, Clone)]
pub struct NewStrand {
    pub id: Uuid,
    pub program: String,
    pub label: String,
    pub frame: Frame,
    pub parent_id: Option<Uuid>,
    pub not_before: DateTime<Utc>,
}

impl NewStrand {
    /// New top-level strand, runnable immediately
    pub fn new(program: impl Into<String>, label: impl Into<String>, frame: Frame) -> Self {
        Self {
            id: Uuid::now_v7(),
            program: program.into(),
            label: label.into(),
            frame,
            parent_id: None,
            not_before: Utc::now(),
        }
    }

    /// Reuse an existing id (typically the managed resource's id)
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_not_before(mut self, not_before: DateTime<Utc>) -> Self {
        self.not_before = not_before;
        self
    }

    /// Materialize the strand row
    pub fn into_strand(self, now: DateTime<Utc>) -> Strand {
        Strand {
            id: self.id,
            program: self.program,
            label: self.label,
            stack: vec![self.frame],
            parent_id: self.parent_id,
            lease: None,
            not_before: self.not_before,
            status: StrandStatus::Running,
            exitval: None,
            retval: None,
            failure: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Full image of the mutable strand columns written on commit
#[derive(Debug, Clone, PartialEq)]
pub struct StrandUpdate {
    pub program: String,
    pub label: String,
    pub stack: Vec<Frame>,
    pub not_before: DateTime<Utc>,
    pub status: StrandStatus,
    pub exitval: Option<Value>,
    pub retval: Option<Value>,
    pub failure: Option<StrandFailure>,
    pub attempts: u32,
}

impl From<&Strand> for StrandUpdate {
    fn from(strand: &Strand) -> Self {
        Self {
            program: strand.program.clone(),
            label: strand.label.clone(),
            stack: strand.stack.clone(),
            not_before: strand.not_before,
            status: strand.status,
            exitval: strand.exitval.clone(),
            retval: strand.retval.clone(),
            failure: strand.failure.clone(),
            attempts: strand.attempts,
        }
    }
}

/// What happens to the strand's deadline on commit
#[derive(Debug, Clone, Default, PartialEq)]
pub enum DeadlineChange {
    #[default]
    Keep,

    /// Replace any open deadline and re-arm the alarm
    Register {
        target_label: String,
        deadline_at: DateTime<Utc>,
        frame_depth: usize,
    },

    Retire,
}

/// What happens to the strand's existing children on commit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChildDisposal {
    #[default]
    Keep,

    /// Delete every child strand
    Destroy,

    /// Clear the children's parent link so they run on independently
    Abandon,
}

/// Everything a step produced, applied atomically with lease release
#[derive(Debug, Clone)]
pub struct StrandCommit {
    pub update: StrandUpdate,

    /// Children spawned during the step
    pub spawned: Vec<NewStrand>,

    /// Finished children collected during the step
    pub reaped: Vec<Uuid>,

    pub children: ChildDisposal,
    pub deadline: DeadlineChange,
}

impl StrandCommit {
    /// Commit that only rewrites the strand row
    pub fn update_only(update: StrandUpdate) -> Self {
        Self {
            update,
            spawned: vec![],
            reaped: vec![],
            children: ChildDisposal::Keep,
            deadline: DeadlineChange::Keep,
        }
    }
}

/// Child strand as seen by its parent
#[derive(Debug, Clone, PartialEq)]
pub struct ChildSummary {
    pub id: Uuid,
    pub program: String,
    pub label: String,
    pub status: StrandStatus,
    pub exitval: Option<Value>,
    pub failure: Option<StrandFailure>,
}

impl ChildSummary {
    /// Whether the child has terminated (successfully or not)
    pub fn is_finished(&self) -> bool {
        self.status != StrandStatus::Running
    }
}

impl From<&Strand> for ChildSummary {
    fn from(strand: &Strand) -> Self {
        Self {
            id: strand.id,
            program: strand.program.clone(),
            label: strand.label.clone(),
            status: strand.status,
            exitval: strand.exitval.clone(),
            failure: strand.failure.clone(),
        }
    }
}

/// Registered expectation that a strand reaches a label in time
#[derive(Debug, Clone, PartialEq)]
pub struct DeadlineRecord {
    pub strand_id: Uuid,
    pub target_label: String,
    pub deadline_at: DateTime<Utc>,

    /// Stack depth of the frame that registered the deadline
    pub frame_depth: usize,

    /// Whether the alarm already fired for this registration
    pub alarmed: bool,
}

/// Open deadline past due, joined with the strand's current position
#[derive(Debug, Clone, PartialEq)]
pub struct OverdueDeadline {
    pub record: DeadlineRecord,
    pub program: String,
    pub current_label: String,
}

/// Durable store for strands, semaphores and deadlines
///
/// Every method is independently atomic. Implementations must be
/// thread-safe and support concurrent access from many executors.
#[async_trait]
pub trait StrandStore: Send + Sync + 'static {
    // =========================================================================
    // Strand Operations
    // =========================================================================

    /// Create a strand
    async fn create_strand(&self, strand: NewStrand) -> Result<(), StoreError>;

    /// Load the current state of a strand
    async fn load_strand(&self, strand_id: Uuid) -> Result<Strand, StoreError>;

    /// Delete a strand with its semaphores and deadline
    ///
    /// Children are detached, not deleted.
    async fn delete_strand(&self, strand_id: Uuid) -> Result<(), StoreError>;

    /// Ids of strands that may be dispatched at `now`
    ///
    /// Running, `not_before <= now`, lease absent or expired. Ordered by
    /// `not_before` then id.
    async fn list_runnable(&self, now: DateTime<Utc>, limit: usize)
        -> Result<Vec<Uuid>, StoreError>;

    /// Compare-and-swap lease acquisition
    ///
    /// Returns the leased strand, or `None` when it is not runnable at `now`
    /// (another owner holds a live lease, it is suspended or finished).
    async fn acquire_lease(
        &self,
        strand_id: Uuid,
        owner: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<Strand>, StoreError>;

    /// Give the lease back without changing state
    async fn release_lease(&self, strand_id: Uuid, owner: &str) -> Result<(), StoreError>;

    /// Persist a step's result and release the lease in one atomic write
    ///
    /// Fails with [`StoreError::LeaseLost`] if `owner` no longer holds the lease.
    async fn commit(
        &self,
        strand_id: Uuid,
        owner: &str,
        commit: StrandCommit,
    ) -> Result<(), StoreError>;

    /// Put a halted strand back into scheduling
    ///
    /// Returns false when the strand was not halted.
    async fn resume_strand(&self, strand_id: Uuid, now: DateTime<Utc>)
        -> Result<bool, StoreError>;

    /// Children of a strand
    async fn list_children(&self, parent_id: Uuid) -> Result<Vec<ChildSummary>, StoreError>;

    // =========================================================================
    // Semaphore Operations
    // =========================================================================

    /// Increment a semaphore and wake the strand
    ///
    /// Returns the new count. Does not require the strand's lease.
    async fn raise_semaphore(
        &self,
        strand_id: Uuid,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError>;

    /// Decrement if positive; returns whether it fired
    async fn consume_semaphore(&self, strand_id: Uuid, name: &str) -> Result<bool, StoreError>;

    /// Current count (0 when never raised)
    async fn semaphore_count(&self, strand_id: Uuid, name: &str) -> Result<u32, StoreError>;

    // =========================================================================
    // Deadline Operations
    // =========================================================================

    /// Open deadline of a strand, if any
    async fn load_deadline(&self, strand_id: Uuid) -> Result<Option<DeadlineRecord>, StoreError>;

    /// Deadlines past due whose alarm has not fired
    ///
    /// Only strands that are unfinished and not sitting on the target label
    /// are included; a strand on its target label has reached it.
    async fn overdue_deadlines(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OverdueDeadline>, StoreError>;

    /// Mark a deadline alarmed
    ///
    /// Only succeeds for the registration identified by `deadline_at` and
    /// only once, so concurrent monitors report each overdue deadline once.
    async fn mark_deadline_alarmed(
        &self,
        strand_id: Uuid,
        deadline_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}
