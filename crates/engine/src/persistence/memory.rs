//! In-memory implementation of StrandStore for testing

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::strand::{Lease, Strand, StrandStatus};
use crate::time;

/// Everything behind one lock, so each trait call is atomic
#[derive(Default)]
struct MemoryState {
    strands: HashMap<Uuid, Strand>,
    semaphores: HashMap<(Uuid, String), u32>,
    deadlines: HashMap<Uuid, DeadlineRecord>,
}

impl MemoryState {
    /// Remove a strand with its semaphores and deadline, detaching its children
    fn remove_strand(&mut self, strand_id: Uuid) -> Option<Strand> {
        for child in self.strands.values_mut() {
            if child.parent_id == Some(strand_id) {
                child.parent_id = None;
            }
        }
        self.semaphores.retain(|(id, _), _| *id != strand_id);
        self.deadlines.remove(&strand_id);
        self.strands.remove(&strand_id)
    }

    fn child_ids(&self, parent_id: Uuid) -> Vec<Uuid> {
        self.strands
            .values()
            .filter(|s| s.parent_id == Some(parent_id))
            .map(|s| s.id)
            .collect()
    }
}

/// In-memory implementation of StrandStore
///
/// This is primarily for testing. It stores all data in memory and
/// provides the same semantics as the PostgreSQL implementation.
///
/// # Example
///
/// ```
/// use strand_engine::InMemoryStrandStore;
///
/// let store = InMemoryStrandStore::new();
/// assert_eq!(store.strand_count(), 0);
/// ```
pub struct InMemoryStrandStore {
    state: RwLock<MemoryState>,
}

impl InMemoryStrandStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
        }
    }

    /// Get the number of strands
    pub fn strand_count(&self) -> usize {
        self.state.read().strands.len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.strands.clear();
        state.semaphores.clear();
        state.deadlines.clear();
    }
}

impl Default for InMemoryStrandStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StrandStore for InMemoryStrandStore {
    async fn create_strand(&self, strand: NewStrand) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if state.strands.contains_key(&strand.id) {
            return Err(StoreError::DuplicateStrand(strand.id));
        }
        let strand = strand.into_strand(Utc::now());
        state.strands.insert(strand.id, strand);
        Ok(())
    }

    async fn load_strand(&self, strand_id: Uuid) -> Result<Strand, StoreError> {
        self.state
            .read()
            .strands
            .get(&strand_id)
            .cloned()
            .ok_or(StoreError::StrandNotFound(strand_id))
    }

    async fn delete_strand(&self, strand_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if !state.strands.contains_key(&strand_id) {
            return Err(StoreError::StrandNotFound(strand_id));
        }
        state.remove_strand(strand_id);
        Ok(())
    }

    async fn list_runnable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Uuid>, StoreError> {
        let state = self.state.read();
        let mut runnable: Vec<_> = state
            .strands
            .values()
            .filter(|s| s.is_runnable(now))
            .map(|s| (s.not_before, s.id))
            .collect();

        runnable.sort();
        Ok(runnable.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    async fn acquire_lease(
        &self,
        strand_id: Uuid,
        owner: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<Strand>, StoreError> {
        let mut state = self.state.write();
        let strand = state
            .strands
            .get_mut(&strand_id)
            .ok_or(StoreError::StrandNotFound(strand_id))?;

        if !strand.is_runnable(now) {
            return Ok(None);
        }

        strand.lease = Some(Lease {
            owner: owner.to_string(),
            expires_at: time::after(now, ttl),
        });
        strand.updated_at = now;
        Ok(Some(strand.clone()))
    }

    async fn release_lease(&self, strand_id: Uuid, owner: &str) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let strand = state
            .strands
            .get_mut(&strand_id)
            .ok_or(StoreError::StrandNotFound(strand_id))?;

        if strand.lease.as_ref().is_some_and(|l| l.owner == owner) {
            strand.lease = None;
        }
        Ok(())
    }

    async fn commit(
        &self,
        strand_id: Uuid,
        owner: &str,
        commit: StrandCommit,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();

        // Validate everything before mutating so a failed commit changes nothing
        let strand = state
            .strands
            .get(&strand_id)
            .ok_or(StoreError::StrandNotFound(strand_id))?;
        if !strand.lease.as_ref().is_some_and(|l| l.owner == owner) {
            return Err(StoreError::LeaseLost {
                strand_id,
                owner: owner.to_string(),
            });
        }
        if let Some(dup) = commit
            .spawned
            .iter()
            .find(|s| state.strands.contains_key(&s.id))
        {
            return Err(StoreError::DuplicateStrand(dup.id));
        }

        match commit.children {
            ChildDisposal::Keep => {}
            ChildDisposal::Destroy => {
                for child_id in state.child_ids(strand_id) {
                    state.remove_strand(child_id);
                }
            }
            ChildDisposal::Abandon => {
                for child in state.strands.values_mut() {
                    if child.parent_id == Some(strand_id) {
                        child.parent_id = None;
                    }
                }
            }
        }

        for child_id in commit.reaped {
            let reapable = state
                .strands
                .get(&child_id)
                .is_some_and(|c| c.parent_id == Some(strand_id) && c.is_finished());
            if reapable {
                state.remove_strand(child_id);
            }
        }

        let now = Utc::now();
        for child in commit.spawned {
            let child = child.into_strand(now);
            state.strands.insert(child.id, child);
        }

        match commit.deadline {
            DeadlineChange::Keep => {}
            DeadlineChange::Register {
                target_label,
                deadline_at,
                frame_depth,
            } => {
                state.deadlines.insert(
                    strand_id,
                    DeadlineRecord {
                        strand_id,
                        target_label,
                        deadline_at,
                        frame_depth,
                        alarmed: false,
                    },
                );
            }
            DeadlineChange::Retire => {
                state.deadlines.remove(&strand_id);
            }
        }

        let update = commit.update;
        if let Some(strand) = state.strands.get_mut(&strand_id) {
            strand.program = update.program;
            strand.label = update.label;
            strand.stack = update.stack;
            strand.not_before = update.not_before;
            strand.status = update.status;
            strand.exitval = update.exitval;
            strand.retval = update.retval;
            strand.failure = update.failure;
            strand.attempts = update.attempts;
            strand.lease = None;
            strand.updated_at = now;
        }
        Ok(())
    }

    async fn resume_strand(
        &self,
        strand_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        let strand = state
            .strands
            .get_mut(&strand_id)
            .ok_or(StoreError::StrandNotFound(strand_id))?;

        if strand.status != StrandStatus::Halted {
            return Ok(false);
        }
        strand.status = StrandStatus::Running;
        strand.failure = None;
        strand.attempts = 0;
        strand.lease = None;
        strand.not_before = now;
        strand.updated_at = now;
        Ok(true)
    }

    async fn list_children(&self, parent_id: Uuid) -> Result<Vec<ChildSummary>, StoreError> {
        let state = self.state.read();
        let mut children: Vec<_> = state
            .strands
            .values()
            .filter(|s| s.parent_id == Some(parent_id))
            .map(ChildSummary::from)
            .collect();
        children.sort_by_key(|c| c.id);
        Ok(children)
    }

    async fn raise_semaphore(
        &self,
        strand_id: Uuid,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let mut state = self.state.write();
        let strand = state
            .strands
            .get_mut(&strand_id)
            .ok_or(StoreError::StrandNotFound(strand_id))?;

        if strand.not_before > now {
            strand.not_before = now;
        }

        let count = state
            .semaphores
            .entry((strand_id, name.to_string()))
            .or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn consume_semaphore(&self, strand_id: Uuid, name: &str) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        match state.semaphores.get_mut(&(strand_id, name.to_string())) {
            Some(count) if *count > 0 => {
                *count -= 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn semaphore_count(&self, strand_id: Uuid, name: &str) -> Result<u32, StoreError> {
        Ok(self
            .state
            .read()
            .semaphores
            .get(&(strand_id, name.to_string()))
            .copied()
            .unwrap_or(0))
    }

    async fn load_deadline(&self, strand_id: Uuid) -> Result<Option<DeadlineRecord>, StoreError> {
        Ok(self.state.read().deadlines.get(&strand_id).cloned())
    }

    async fn overdue_deadlines(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OverdueDeadline>, StoreError> {
        let state = self.state.read();
        let mut overdue: Vec<_> = state
            .deadlines
            .values()
            .filter(|d| !d.alarmed && d.deadline_at <= now)
            .filter_map(|d| {
                let strand = state.strands.get(&d.strand_id)?;
                let pending =
                    strand.status != StrandStatus::Completed && strand.label != d.target_label;
                pending.then(|| OverdueDeadline {
                    record: d.clone(),
                    program: strand.program.clone(),
                    current_label: strand.label.clone(),
                })
            })
            .collect();

        overdue.sort_by_key(|o| o.record.deadline_at);
        overdue.truncate(limit);
        Ok(overdue)
    }

    async fn mark_deadline_alarmed(
        &self,
        strand_id: Uuid,
        deadline_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        match state.deadlines.get_mut(&strand_id) {
            Some(d) if !d.alarmed && d.deadline_at == deadline_at => {
                d.alarmed = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
