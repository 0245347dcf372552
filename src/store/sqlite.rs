/// SQLite persistence adapter
///
/// Definition sources, instance trees and job bodies are stored as JSON
/// columns. The columns the store filters on (version, lease owner and expiry,
/// due date, job flags) are kept next to the JSON so claims and version checks
/// are single guarded UPDATE statements. Timestamps used for ordering are
/// integer milliseconds.

use crate::error::StoreError;
use crate::job::Job;
use crate::runtime::instance::WorkflowInstance;
use crate::store::{ClaimToken, Commit, InstanceWrite, PersistenceStore};
use crate::workflow::ids::{InstanceId, JobId, WorkflowId};
use crate::workflow::types::WorkflowSource;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database at `url` and initialise the schema
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // every connection to an in-memory database is a different database,
        // so it gets exactly one that is never recycled
        let pool = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        }
        .connect_with(options)
        .await?;

        let store = Self::new(pool);
        store.init_schema().await?;
        tracing::info!("🗄️ SQLite store ready at {}", url);
        Ok(store)
    }

    /// Private in-memory database
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:").await
    }

    /// Create tables and indexes. Safe to call multiple times.
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                definition JSON NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_instances (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                state TEXT NOT NULL,
                version INTEGER NOT NULL,
                body JSON NOT NULL,
                lock_owner TEXT,
                lock_until INTEGER,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                instance_id TEXT,
                job_type TEXT NOT NULL,
                due_at INTEGER NOT NULL,
                done INTEGER NOT NULL DEFAULT 0,
                dead INTEGER NOT NULL DEFAULT 0,
                body JSON NOT NULL,
                lock_owner TEXT,
                lock_until INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs(done, dead, due_at, id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_instance ON jobs(instance_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn instance_exists(tx: &mut Transaction<'_, Sqlite>, id: &InstanceId) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM workflow_instances WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&mut **tx)
            .await?;
        Ok(row.is_some())
    }

    async fn insert_job(tx: &mut Transaction<'_, Sqlite>, job: &Job) -> Result<(), StoreError> {
        let body = serde_json::to_string(job)?;
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (id, instance_id, job_type, due_at, done, dead, body)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(job.id.as_str())
        .bind(job.instance_id.as_ref().map(|id| id.as_str()))
        .bind(&job.job_type)
        .bind(millis(job.due_at))
        .bind(job.done)
        .bind(job.dead)
        .bind(&body)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Duplicate { entity: "job", id: job.id.to_string() });
        }
        Ok(())
    }

    async fn write_instance(tx: &mut Transaction<'_, Sqlite>, write: &InstanceWrite) -> Result<(), StoreError> {
        match write {
            InstanceWrite::Insert(instance) => {
                let body = serde_json::to_string(instance)?;
                let result = sqlx::query(
                    r#"
                    INSERT INTO workflow_instances (id, workflow_id, state, version, body)
                    VALUES (?, ?, ?, ?, ?)
                    ON CONFLICT(id) DO NOTHING
                    "#,
                )
                .bind(instance.id.as_str())
                .bind(instance.workflow_id.as_str())
                .bind(instance.state.as_str())
                .bind(instance.version as i64)
                .bind(&body)
                .execute(&mut **tx)
                .await?;

                if result.rows_affected() == 0 {
                    return Err(StoreError::Duplicate { entity: "instance", id: instance.id.to_string() });
                }
            }
            InstanceWrite::Update { instance, token } => {
                let mut stored = instance.clone();
                stored.version += 1;
                let body = serde_json::to_string(&stored)?;
                let result = sqlx::query(
                    r#"
                    UPDATE workflow_instances
                    SET state = ?, version = ?, body = ?, lock_owner = NULL, lock_until = NULL,
                        updated_at = CURRENT_TIMESTAMP
                    WHERE id = ? AND version = ? AND lock_owner = ?
                    "#,
                )
                .bind(stored.state.as_str())
                .bind(stored.version as i64)
                .bind(&body)
                .bind(instance.id.as_str())
                .bind(instance.version as i64)
                .bind(token.as_str())
                .execute(&mut **tx)
                .await?;

                if result.rows_affected() == 0 {
                    if !Self::instance_exists(tx, &instance.id).await? {
                        return Err(StoreError::NotFound { entity: "instance", id: instance.id.to_string() });
                    }
                    return Err(StoreError::instance_contention(
                        &instance.id,
                        format!("lease lost or version {} is stale", instance.version),
                    ));
                }
            }
            InstanceWrite::Release { instance_id, token } => {
                sqlx::query(
                    "UPDATE workflow_instances SET lock_owner = NULL, lock_until = NULL WHERE id = ? AND lock_owner = ?",
                )
                .bind(instance_id.as_str())
                .bind(token.as_str())
                .execute(&mut **tx)
                .await?;
            }
        }
        Ok(())
    }

    async fn write_claimed_job(tx: &mut Transaction<'_, Sqlite>, job: &Job, token: &ClaimToken) -> Result<(), StoreError> {
        let result = if job.done {
            sqlx::query("DELETE FROM jobs WHERE id = ? AND lock_owner = ?")
                .bind(job.id.as_str())
                .bind(token.as_str())
                .execute(&mut **tx)
                .await?
        } else {
            let body = serde_json::to_string(job)?;
            sqlx::query(
                r#"
                UPDATE jobs
                SET due_at = ?, done = ?, dead = ?, body = ?, lock_owner = NULL, lock_until = NULL
                WHERE id = ? AND lock_owner = ?
                "#,
            )
            .bind(millis(job.due_at))
            .bind(job.done)
            .bind(job.dead)
            .bind(&body)
            .bind(job.id.as_str())
            .bind(token.as_str())
            .execute(&mut **tx)
            .await?
        };

        if result.rows_affected() == 0 {
            return Err(StoreError::job_contention(&job.id, "job lease was lost"));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceStore for SqliteStore {
    async fn save_workflow_source(&self, source: &WorkflowSource) -> Result<(), StoreError> {
        let definition = serde_json::to_string(source)?;

        sqlx::query(
            r#"
            INSERT INTO workflows (id, name, definition, updated_at)
            VALUES (?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                definition = excluded.definition,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(source.id.as_str())
        .bind(&source.name)
        .bind(&definition)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_workflow_sources(&self) -> Result<Vec<WorkflowSource>, StoreError> {
        let rows = sqlx::query("SELECT definition FROM workflows ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        let mut sources = Vec::with_capacity(rows.len());
        for row in rows {
            let definition: String = row.try_get("definition")?;
            sources.push(serde_json::from_str(&definition)?);
        }
        Ok(sources)
    }

    async fn delete_workflow_source(&self, id: &WorkflowId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn load_instance(&self, id: &InstanceId) -> Result<WorkflowInstance, StoreError> {
        let row = sqlx::query("SELECT body FROM workflow_instances WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound { entity: "instance", id: id.to_string() })?;

        let body: String = row.try_get("body")?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn lock_instance(
        &self,
        id: &InstanceId,
        token: &ClaimToken,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<WorkflowInstance, StoreError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE workflow_instances SET lock_owner = ?, lock_until = ?
            WHERE id = ? AND (lock_owner IS NULL OR lock_until <= ?)
            "#,
        )
        .bind(token.as_str())
        .bind(millis(lease_until))
        .bind(id.as_str())
        .bind(millis(now))
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            if !Self::instance_exists(&mut tx, id).await? {
                return Err(StoreError::NotFound { entity: "instance", id: id.to_string() });
            }
            return Err(StoreError::instance_contention(id, "instance is locked by another operation"));
        }

        let row = sqlx::query("SELECT body FROM workflow_instances WHERE id = ?")
            .bind(id.as_str())
            .fetch_one(&mut *tx)
            .await?;
        let body: String = row.try_get("body")?;
        let instance = serde_json::from_str(&body)?;

        tx.commit().await?;
        Ok(instance)
    }

    async fn unlock_instance(&self, id: &InstanceId, token: &ClaimToken) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE workflow_instances SET lock_owner = NULL, lock_until = NULL WHERE id = ? AND lock_owner = ?",
        )
        .bind(id.as_str())
        .bind(token.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn commit(&self, commit: Commit) -> Result<(), StoreError> {
        // dropping the transaction on an early return rolls everything back
        let mut tx = self.pool.begin().await?;

        if let Some(write) = &commit.instance {
            Self::write_instance(&mut tx, write).await?;
        }
        for (job, token) in &commit.claimed_jobs {
            Self::write_claimed_job(&mut tx, job, token).await?;
        }
        if let Some(instance_id) = &commit.cancel_pending_jobs_of {
            let result = sqlx::query("DELETE FROM jobs WHERE instance_id = ? AND done = 0 AND dead = 0")
                .bind(instance_id.as_str())
                .execute(&mut *tx)
                .await?;
            tracing::debug!("🗑️ Deleted {} pending job(s) of instance {}", result.rows_affected(), instance_id);
        }
        for job in &commit.new_jobs {
            Self::insert_job(&mut tx, job).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn schedule_job(&self, job: Job) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        Self::insert_job(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn load_job(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query("SELECT body FROM jobs WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let body: String = row.try_get("body")?;
                Ok(Some(serde_json::from_str(&body)?))
            }
            None => Ok(None),
        }
    }

    async fn claim_due_jobs(
        &self,
        now: DateTime<Utc>,
        token: &ClaimToken,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE jobs SET lock_owner = ?, lock_until = ?
            WHERE id IN (
                SELECT id FROM jobs
                WHERE done = 0 AND dead = 0 AND due_at <= ?
                  AND (lock_owner IS NULL OR lock_until <= ?)
                ORDER BY due_at, id
                LIMIT ?
            )
            RETURNING body
            "#,
        )
        .bind(token.as_str())
        .bind(millis(lease_until))
        .bind(millis(now))
        .bind(millis(now))
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let body: String = row.try_get("body")?;
            jobs.push(serde_json::from_str::<Job>(&body)?);
        }
        jobs.sort_by(|a, b| (a.due_at, &a.id).cmp(&(b.due_at, &b.id)));
        Ok(jobs)
    }

    async fn release_job(&self, id: &JobId, token: &ClaimToken) -> Result<(), StoreError> {
        sqlx::query("UPDATE jobs SET lock_owner = NULL, lock_until = NULL WHERE id = ? AND lock_owner = ?")
            .bind(id.as_str())
            .bind(token.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn jobs_for_instance(&self, id: &InstanceId) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query("SELECT body FROM jobs WHERE instance_id = ? ORDER BY due_at, id")
            .bind(id.as_str())
            .fetch_all(&self.pool)
            .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let body: String = row.try_get("body")?;
            jobs.push(serde_json::from_str(&body)?);
        }
        Ok(jobs)
    }
}
