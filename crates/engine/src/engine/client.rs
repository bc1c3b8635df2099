//! Facade for external callers
//!
//! HTTP handlers and other services create strands with `assemble`, signal
//! them with `raise` and read their status. Everything else happens inside
//! steps.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument};
use uuid::Uuid;

use super::status::ResourceState;
use crate::persistence::{ChildSummary, NewStrand, StoreError, StrandStore};
use crate::program::{ProgramRegistry, RegistryError};
use crate::strand::{semaphore, Frame, StepError, Strand};

/// Errors from client operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// The initial frame was rejected; no strand was created
    #[error("validation failed: {0}")]
    Validation(String),

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Client for creating, signalling and inspecting strands
///
/// # Example
///
/// ```ignore
/// let client = StrandClient::new(store, registry);
///
/// let id = client.assemble("Example", Frame::new().with("n", 0)).await?;
/// client.raise(id, semaphore::DESTROY).await?;
/// ```
#[derive(Clone)]
pub struct StrandClient {
    store: Arc<dyn StrandStore>,
    registry: Arc<ProgramRegistry>,
}

impl StrandClient {
    pub fn new(store: Arc<dyn StrandStore>, registry: Arc<ProgramRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &Arc<dyn StrandStore> {
        &self.store
    }

    /// Validate the frame and create a strand at the program's start label
    pub async fn assemble(&self, program: &str, frame: Frame) -> Result<Uuid, EngineError> {
        self.assemble_with_id(Uuid::now_v7(), program, frame).await
    }

    /// Like [`assemble`](Self::assemble), reusing the managed resource's id
    #[instrument(skip(self, frame))]
    pub async fn assemble_with_id(
        &self,
        id: Uuid,
        program: &str,
        frame: Frame,
    ) -> Result<Uuid, EngineError> {
        let found = self
            .registry
            .get(program)
            .ok_or_else(|| RegistryError::UnknownProgram(program.to_string()))?;

        found.validate(&frame).map_err(|e| match e {
            StepError::Validation(message) => EngineError::Validation(message),
            other => EngineError::Validation(other.to_string()),
        })?;

        let strand = NewStrand::new(program, found.start_label(), frame).with_id(id);
        self.store.create_strand(strand).await?;

        info!(strand_id = %id, %program, "assembled strand");
        Ok(id)
    }

    /// Increment a semaphore on a strand and wake it
    pub async fn raise(&self, strand_id: Uuid, name: &str) -> Result<u32, EngineError> {
        Ok(self
            .store
            .raise_semaphore(strand_id, name, Utc::now())
            .await?)
    }

    /// Ask the strand to tear down its resource
    pub async fn destroy(&self, strand_id: Uuid) -> Result<u32, EngineError> {
        self.raise(strand_id, semaphore::DESTROY).await
    }

    /// Peek at a semaphore without consuming it
    pub async fn is_raised(&self, strand_id: Uuid, name: &str) -> Result<bool, EngineError> {
        Ok(self.store.semaphore_count(strand_id, name).await? > 0)
    }

    /// Current strand state (eventually consistent with running steps)
    pub async fn status(&self, strand_id: Uuid) -> Result<Strand, EngineError> {
        Ok(self.store.load_strand(strand_id).await?)
    }

    /// Display state of the managed resource
    pub async fn resource_state(&self, strand_id: Uuid) -> Result<ResourceState, EngineError> {
        let strand = self.store.load_strand(strand_id).await?;
        let destroy_raised = self
            .store
            .semaphore_count(strand_id, semaphore::DESTROY)
            .await?
            > 0;
        let program = self.registry.get(&strand.program);
        Ok(ResourceState::derive(
            &strand,
            program.as_deref(),
            destroy_raised,
        ))
    }

    pub async fn children(&self, strand_id: Uuid) -> Result<Vec<ChildSummary>, EngineError> {
        Ok(self.store.list_children(strand_id).await?)
    }

    /// Remove a strand with its semaphores and deadline
    #[instrument(skip(self))]
    pub async fn delete(&self, strand_id: Uuid) -> Result<(), EngineError> {
        self.store.delete_strand(strand_id).await?;
        info!(%strand_id, "deleted strand");
        Ok(())
    }

    /// Put a halted strand back into scheduling
    #[instrument(skip(self))]
    pub async fn resume(&self, strand_id: Uuid) -> Result<bool, EngineError> {
        let resumed = self.store.resume_strand(strand_id, Utc::now()).await?;
        if resumed {
            info!(%strand_id, "resumed halted strand");
        }
        Ok(resumed)
    }
}
