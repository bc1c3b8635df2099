//! PostgreSQL implementation of StrandStore
//!
//! Production persistence using PostgreSQL with:
//! - Lease acquisition as a single conditional UPDATE (compare-and-swap)
//! - Step commits applied in one transaction, guarded by lease ownership
//! - Semaphore and deadline rows cascading with their strand

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::strand::{Frame, Lease, Strand, StrandFailure, StrandStatus};
use crate::time;

const STRAND_COLUMNS: &str = "id, program, label, stack, parent_id, lease_owner, \
     lease_expires_at, not_before, status, exitval, retval, failure, attempts, \
     created_at, updated_at";

/// PostgreSQL implementation of StrandStore
///
/// Uses a connection pool; every trait method is one statement or one
/// transaction, so many executors can share the same database.
///
/// # Example
///
/// ```ignore
/// use strand_engine::PostgresStrandStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/strands").await?;
/// let store = PostgresStrandStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresStrandStore {
    pool: PgPool,
}

impl PostgresStrandStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Database(e.to_string())
            })
    }

    async fn strand_exists(&self, strand_id: Uuid) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM strands WHERE id = $1")
            .bind(strand_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl StrandStore for PostgresStrandStore {
    #[instrument(skip(self, strand), fields(strand_id = %strand.id, program = %strand.program))]
    async fn create_strand(&self, strand: NewStrand) -> Result<(), StoreError> {
        let id = strand.id;
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        insert_strand(&mut tx, strand, Utc::now()).await?;
        tx.commit().await.map_err(db_error)?;

        debug!(strand_id = %id, "created strand");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_strand(&self, strand_id: Uuid) -> Result<Strand, StoreError> {
        let row = sqlx::query(&format!("SELECT {STRAND_COLUMNS} FROM strands WHERE id = $1"))
            .bind(strand_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to load strand: {}", e);
                StoreError::Database(e.to_string())
            })?
            .ok_or(StoreError::StrandNotFound(strand_id))?;

        strand_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn delete_strand(&self, strand_id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        sqlx::query("UPDATE strands SET parent_id = NULL WHERE parent_id = $1")
            .bind(strand_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        let result = sqlx::query("DELETE FROM strands WHERE id = $1")
            .bind(strand_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::StrandNotFound(strand_id));
        }

        tx.commit().await.map_err(db_error)?;
        debug!(%strand_id, "deleted strand");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_runnable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM strands
            WHERE status = 'running'
              AND not_before <= $1
              AND (lease_owner IS NULL OR lease_expires_at <= $1)
            ORDER BY not_before, id
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list runnable strands: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(rows.iter().map(|row| row.get("id")).collect())
    }

    #[instrument(skip(self))]
    async fn acquire_lease(
        &self,
        strand_id: Uuid,
        owner: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<Strand>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE strands
            SET lease_owner = $2, lease_expires_at = $3, updated_at = $4
            WHERE id = $1
              AND status = 'running'
              AND not_before <= $4
              AND (lease_owner IS NULL OR lease_expires_at <= $4)
            RETURNING {STRAND_COLUMNS}
            "#
        ))
        .bind(strand_id)
        .bind(owner)
        .bind(time::after(now, ttl))
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to acquire lease: {}", e);
            StoreError::Database(e.to_string())
        })?;

        match row {
            Some(row) => strand_from_row(&row).map(Some),
            None if self.strand_exists(strand_id).await? => Ok(None),
            None => Err(StoreError::StrandNotFound(strand_id)),
        }
    }

    #[instrument(skip(self))]
    async fn release_lease(&self, strand_id: Uuid, owner: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE strands
            SET lease_owner = NULL, lease_expires_at = NULL
            WHERE id = $1 AND lease_owner = $2
            "#,
        )
        .bind(strand_id)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 && !self.strand_exists(strand_id).await? {
            return Err(StoreError::StrandNotFound(strand_id));
        }
        Ok(())
    }

    #[instrument(skip(self, commit), fields(spawned = commit.spawned.len(), reaped = commit.reaped.len()))]
    async fn commit(
        &self,
        strand_id: Uuid,
        owner: &str,
        commit: StrandCommit,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let update = commit.update;
        let stack = serde_json::to_value(&update.stack)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let failure = update
            .failure
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let result = sqlx::query(
            r#"
            UPDATE strands
            SET program = $3, label = $4, stack = $5, not_before = $6, status = $7,
                exitval = $8, retval = $9, failure = $10, attempts = $11,
                lease_owner = NULL, lease_expires_at = NULL, updated_at = $12
            WHERE id = $1 AND lease_owner = $2
            "#,
        )
        .bind(strand_id)
        .bind(owner)
        .bind(&update.program)
        .bind(&update.label)
        .bind(&stack)
        .bind(update.not_before)
        .bind(update.status.as_str())
        .bind(&update.exitval)
        .bind(&update.retval)
        .bind(&failure)
        .bind(update.attempts as i32)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to commit strand: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() == 0 {
            drop(tx);
            return Err(if self.strand_exists(strand_id).await? {
                StoreError::LeaseLost {
                    strand_id,
                    owner: owner.to_string(),
                }
            } else {
                StoreError::StrandNotFound(strand_id)
            });
        }

        match commit.children {
            ChildDisposal::Keep => {}
            ChildDisposal::Destroy => {
                // Grandchildren are detached, like children of a deleted strand
                sqlx::query(
                    r#"
                    WITH destroyed AS (
                        DELETE FROM strands WHERE parent_id = $1 RETURNING id
                    )
                    UPDATE strands SET parent_id = NULL
                    WHERE parent_id IN (SELECT id FROM destroyed)
                    "#,
                )
                .bind(strand_id)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
            }
            ChildDisposal::Abandon => {
                sqlx::query("UPDATE strands SET parent_id = NULL WHERE parent_id = $1")
                    .bind(strand_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_error)?;
            }
        }

        if !commit.reaped.is_empty() {
            sqlx::query(
                r#"
                WITH reaped AS (
                    DELETE FROM strands
                    WHERE id = ANY($1) AND parent_id = $2 AND status <> 'running'
                    RETURNING id
                )
                UPDATE strands SET parent_id = NULL
                WHERE parent_id IN (SELECT id FROM reaped)
                "#,
            )
            .bind(&commit.reaped)
            .bind(strand_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        }

        for child in commit.spawned {
            insert_strand(&mut tx, child, now).await?;
        }

        match commit.deadline {
            DeadlineChange::Keep => {}
            DeadlineChange::Register {
                target_label,
                deadline_at,
                frame_depth,
            } => {
                sqlx::query(
                    r#"
                    INSERT INTO strand_deadlines (strand_id, target_label, deadline_at, frame_depth, alarmed)
                    VALUES ($1, $2, $3, $4, FALSE)
                    ON CONFLICT (strand_id) DO UPDATE
                    SET target_label = EXCLUDED.target_label,
                        deadline_at = EXCLUDED.deadline_at,
                        frame_depth = EXCLUDED.frame_depth,
                        alarmed = FALSE
                    "#,
                )
                .bind(strand_id)
                .bind(&target_label)
                .bind(deadline_at)
                .bind(frame_depth as i32)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
            }
            DeadlineChange::Retire => {
                sqlx::query("DELETE FROM strand_deadlines WHERE strand_id = $1")
                    .bind(strand_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_error)?;
            }
        }

        tx.commit().await.map_err(db_error)?;

        debug!(%strand_id, label = %update.label, status = %update.status, "committed strand");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn resume_strand(
        &self,
        strand_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE strands
            SET status = 'running', failure = NULL, attempts = 0,
                lease_owner = NULL, lease_expires_at = NULL,
                not_before = $2, updated_at = $2
            WHERE id = $1 AND status = 'halted'
            "#,
        )
        .bind(strand_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        if self.strand_exists(strand_id).await? {
            Ok(false)
        } else {
            Err(StoreError::StrandNotFound(strand_id))
        }
    }

    #[instrument(skip(self))]
    async fn list_children(&self, parent_id: Uuid) -> Result<Vec<ChildSummary>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, program, label, status, exitval, failure
            FROM strands
            WHERE parent_id = $1
            ORDER BY id
            "#,
        )
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list children: {}", e);
            StoreError::Database(e.to_string())
        })?;

        rows.iter()
            .map(|row| {
                Ok(ChildSummary {
                    id: row.get("id"),
                    program: row.get("program"),
                    label: row.get("label"),
                    status: parse_status(row.get("status"))?,
                    exitval: row.get("exitval"),
                    failure: parse_failure(row.get("failure"))?,
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn raise_semaphore(
        &self,
        strand_id: Uuid,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        // Wake the strand so the signal is observed promptly
        let woken = sqlx::query(
            r#"
            UPDATE strands
            SET not_before = LEAST(not_before, $2)
            WHERE id = $1
            "#,
        )
        .bind(strand_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        if woken.rows_affected() == 0 {
            return Err(StoreError::StrandNotFound(strand_id));
        }

        let row = sqlx::query(
            r#"
            INSERT INTO strand_semaphores (strand_id, name, count)
            VALUES ($1, $2, 1)
            ON CONFLICT (strand_id, name) DO UPDATE
            SET count = strand_semaphores.count + 1
            RETURNING count
            "#,
        )
        .bind(strand_id)
        .bind(name)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to raise semaphore: {}", e);
            StoreError::Database(e.to_string())
        })?;

        tx.commit().await.map_err(db_error)?;

        let count: i32 = row.get("count");
        debug!(%strand_id, %name, count, "raised semaphore");
        Ok(count as u32)
    }

    #[instrument(skip(self))]
    async fn consume_semaphore(&self, strand_id: Uuid, name: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE strand_semaphores
            SET count = count - 1
            WHERE strand_id = $1 AND name = $2 AND count > 0
            "#,
        )
        .bind(strand_id)
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn semaphore_count(&self, strand_id: Uuid, name: &str) -> Result<u32, StoreError> {
        let count: Option<i32> = sqlx::query_scalar(
            "SELECT count FROM strand_semaphores WHERE strand_id = $1 AND name = $2",
        )
        .bind(strand_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(count.unwrap_or(0) as u32)
    }

    #[instrument(skip(self))]
    async fn load_deadline(&self, strand_id: Uuid) -> Result<Option<DeadlineRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT strand_id, target_label, deadline_at, frame_depth, alarmed
            FROM strand_deadlines
            WHERE strand_id = $1
            "#,
        )
        .bind(strand_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.as_ref().map(deadline_from_row))
    }

    #[instrument(skip(self))]
    async fn overdue_deadlines(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OverdueDeadline>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT d.strand_id, d.target_label, d.deadline_at, d.frame_depth, d.alarmed,
                   s.program, s.label
            FROM strand_deadlines d
            JOIN strands s ON s.id = d.strand_id
            WHERE NOT d.alarmed
              AND d.deadline_at <= $1
              AND s.status <> 'completed'
              AND s.label <> d.target_label
            ORDER BY d.deadline_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to query overdue deadlines: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(rows
            .iter()
            .map(|row| OverdueDeadline {
                record: deadline_from_row(row),
                program: row.get("program"),
                current_label: row.get("label"),
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn mark_deadline_alarmed(
        &self,
        strand_id: Uuid,
        deadline_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE strand_deadlines
            SET alarmed = TRUE
            WHERE strand_id = $1 AND deadline_at = $2 AND NOT alarmed
            "#,
        )
        .bind(strand_id)
        .bind(deadline_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }
}

// =============================================================================
// Helper functions
// =============================================================================

fn db_error(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

async fn insert_strand(
    tx: &mut Transaction<'_, Postgres>,
    strand: NewStrand,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let id = strand.id;
    let stack = serde_json::to_value(vec![strand.frame])
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    sqlx::query(
        r#"
        INSERT INTO strands (id, program, label, stack, parent_id, not_before, status, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, 'running', $7, $7)
        "#,
    )
    .bind(id)
    .bind(&strand.program)
    .bind(&strand.label)
    .bind(&stack)
    .bind(strand.parent_id)
    .bind(strand.not_before)
    .bind(now)
    .execute(&mut **tx)
    .await
    .map_err(|e| match e.as_database_error() {
        Some(db) if db.is_unique_violation() => StoreError::DuplicateStrand(id),
        _ => {
            error!("Failed to insert strand: {}", e);
            StoreError::Database(e.to_string())
        }
    })?;

    Ok(())
}

fn strand_from_row(row: &PgRow) -> Result<Strand, StoreError> {
    let stack: serde_json::Value = row.get("stack");
    let stack: Vec<Frame> =
        serde_json::from_value(stack).map_err(|e| StoreError::Serialization(e.to_string()))?;

    let lease_owner: Option<String> = row.get("lease_owner");
    let lease_expires_at: Option<DateTime<Utc>> = row.get("lease_expires_at");
    let lease = match (lease_owner, lease_expires_at) {
        (Some(owner), Some(expires_at)) => Some(Lease { owner, expires_at }),
        _ => None,
    };

    let attempts: i32 = row.get("attempts");

    Ok(Strand {
        id: row.get("id"),
        program: row.get("program"),
        label: row.get("label"),
        stack,
        parent_id: row.get("parent_id"),
        lease,
        not_before: row.get("not_before"),
        status: parse_status(row.get("status"))?,
        exitval: row.get("exitval"),
        retval: row.get("retval"),
        failure: parse_failure(row.get("failure"))?,
        attempts: attempts.max(0) as u32,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn deadline_from_row(row: &PgRow) -> DeadlineRecord {
    let frame_depth: i32 = row.get("frame_depth");
    DeadlineRecord {
        strand_id: row.get("strand_id"),
        target_label: row.get("target_label"),
        deadline_at: row.get("deadline_at"),
        frame_depth: frame_depth.max(1) as usize,
        alarmed: row.get("alarmed"),
    }
}

fn parse_status(s: &str) -> Result<StrandStatus, StoreError> {
    StrandStatus::parse(s)
        .ok_or_else(|| StoreError::Serialization(format!("unknown strand status: {}", s)))
}

fn parse_failure(value: Option<serde_json::Value>) -> Result<Option<StrandFailure>, StoreError> {
    value
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| StoreError::Serialization(e.to_string()))
}
