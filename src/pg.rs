//! Postgres implementations of the storage, event and config seams.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, types::Json, PgPool, Postgres, Row, Transaction};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::config::ConfigSource;
use crate::error::StoreError;
use crate::events::{trace_event, EventSink};
use crate::store::{JobStore, MappingStore, RetryOutcome};
use crate::types::{IdentityMapping, Job, JobEvent, JobFilter, JobStatus, MappingPatch};

const JOB_COLUMNS: &str =
    "id, user_id, status, scheduled_for, content, attempts, last_error, created_at, updated_at";

const MAPPING_COLUMNS: &str =
    "user_id, ai_conversation_id, blocked, display_name, created_at, updated_at";

pub async fn connect(database_url: &str) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

/// Serialises job writes for one user until the transaction ends. The partial
/// unique index alone cannot order a retry against a concurrent enqueue.
async fn lock_user(tx: &mut Transaction<'_, Postgres>, user_id: &str) -> Result<(), StoreError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(user_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn attempts_param(attempts: u32) -> i32 {
    i32::try_from(attempts).unwrap_or(i32::MAX)
}

fn parse_job_row(row: &sqlx::postgres::PgRow) -> Result<Job, StoreError> {
    let status = row
        .try_get::<String, _>("status")?
        .parse::<JobStatus>()
        .map_err(StoreError::Mapping)?;
    let attempts = u32::try_from(row.try_get::<i32, _>("attempts")?)
        .map_err(|e| StoreError::Mapping(e.to_string()))?;
    Ok(Job {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        status,
        scheduled_for: row.try_get("scheduled_for")?,
        content: row.try_get("content")?,
        attempts,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_mapping_row(row: &sqlx::postgres::PgRow) -> Result<IdentityMapping, StoreError> {
    Ok(IdentityMapping {
        user_id: row.try_get("user_id")?,
        ai_conversation_id: row.try_get("ai_conversation_id")?,
        blocked: row.try_get("blocked")?,
        display_name: row.try_get("display_name")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    #[instrument(skip(self, fragment))]
    async fn enqueue(
        &self,
        user_id: &str,
        fragment: &str,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        // Relies on the partial unique index jobs_one_pending_per_user.
        let mut tx = self.pool.begin().await?;
        lock_user(&mut tx, user_id).await?;
        let row = sqlx::query(&format!(
            "INSERT INTO jobs \
             (id, user_id, status, scheduled_for, content, attempts, last_error, created_at, updated_at) \
             VALUES ($1, $2, 'pending', $3, $4, 0, NULL, $5, $5) \
             ON CONFLICT (user_id) WHERE status = 'pending' DO UPDATE SET \
               content = CASE \
                 WHEN jobs.content = '' THEN EXCLUDED.content \
                 WHEN EXCLUDED.content = '' THEN jobs.content \
                 ELSE jobs.content || chr(10) || EXCLUDED.content END, \
               scheduled_for = EXCLUDED.scheduled_for, \
               updated_at = EXCLUDED.updated_at \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(scheduled_for)
        .bind(fragment)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        parse_job_row(&row)
    }

    async fn find_pending(&self, user_id: &str) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE user_id = $1 AND status = 'pending' LIMIT 1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_job_row).transpose()
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(parse_job_row).transpose()
    }

    #[instrument(skip(self))]
    async fn ready(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE status = 'pending' AND scheduled_for <= $1 \
             ORDER BY scheduled_for ASC, created_at ASC \
             LIMIT $2"
        ))
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_job_row).collect()
    }

    #[instrument(skip(self))]
    async fn claim(&self, id: &str, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE jobs SET status = 'processing', updated_at = $2 \
             WHERE id = $1 AND status = 'pending' AND scheduled_for <= $2 \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_job_row).transpose()
    }

    #[instrument(skip(self))]
    async fn skip(&self, id: &str, reason: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'skipped', last_error = $2, updated_at = $3 \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .bind(reason)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn complete(&self, id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'completed', updated_at = $2 \
             WHERE id = $1 AND status = 'processing'",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, error))]
    async fn fail(
        &self,
        id: &str,
        attempts: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'failed', attempts = $2, last_error = $3, updated_at = $4 \
             WHERE id = $1 AND status = 'processing'",
        )
        .bind(id)
        .bind(attempts_param(attempts))
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, error))]
    async fn retry(
        &self,
        id: &str,
        attempts: u32,
        error: &str,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<RetryOutcome>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let user_id = sqlx::query_scalar::<_, String>("SELECT user_id FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(user_id) = user_id else {
            return Ok(None);
        };
        lock_user(&mut tx, &user_id).await?;

        let content = sqlx::query_scalar::<_, String>(
            "SELECT content FROM jobs WHERE id = $1 AND status = 'processing' FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(content) = content else {
            return Ok(None);
        };

        let pending_id = sqlx::query_scalar::<_, String>(
            "SELECT id FROM jobs WHERE user_id = $1 AND status = 'pending' FOR UPDATE",
        )
        .bind(&user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = if let Some(pending_id) = pending_id {
            sqlx::query(
                "UPDATE jobs SET \
                   content = CASE \
                     WHEN $2::text = '' THEN content \
                     WHEN content = '' THEN $2 \
                     ELSE $2 || chr(10) || content END, \
                   attempts = GREATEST(attempts, $3), \
                   last_error = $4, \
                   scheduled_for = GREATEST(scheduled_for, $5), \
                   updated_at = $6 \
                 WHERE id = $1",
            )
            .bind(&pending_id)
            .bind(&content)
            .bind(attempts_param(attempts))
            .bind(error)
            .bind(scheduled_for)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "UPDATE jobs SET status = 'skipped', attempts = $2, last_error = $3, updated_at = $4 \
                 WHERE id = $1",
            )
            .bind(id)
            .bind(attempts_param(attempts))
            .bind(format!("Merged into job {pending_id}"))
            .bind(now)
            .execute(&mut *tx)
            .await?;
            RetryOutcome::MergedInto(pending_id)
        } else {
            sqlx::query(
                "UPDATE jobs SET status = 'pending', attempts = $2, last_error = $3, \
                 scheduled_for = $4, updated_at = $5 WHERE id = $1",
            )
            .bind(id)
            .bind(attempts_param(attempts))
            .bind(error)
            .bind(scheduled_for)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            RetryOutcome::Rescheduled
        };

        tx.commit().await?;
        Ok(Some(outcome))
    }

    #[instrument(skip(self))]
    async fn stale_processing(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE status = 'processing' AND updated_at <= $1 \
             ORDER BY updated_at ASC"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_job_row).collect()
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE ($1::text IS NULL OR status = $1) \
               AND ($2::text IS NULL OR user_id = $2) \
             ORDER BY created_at DESC \
             LIMIT $3"
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.user_id.as_deref())
        .bind(filter.effective_limit())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_job_row).collect()
    }
}

#[derive(Clone)]
pub struct PgMappingStore {
    pool: PgPool,
}

impl PgMappingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MappingStore for PgMappingStore {
    async fn get(&self, user_id: &str) -> Result<Option<IdentityMapping>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {MAPPING_COLUMNS} FROM identity_mappings WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_mapping_row).transpose()
    }

    #[instrument(skip(self))]
    async fn upsert(
        &self,
        user_id: &str,
        patch: &MappingPatch,
    ) -> Result<IdentityMapping, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO identity_mappings \
             (user_id, ai_conversation_id, blocked, display_name, created_at, updated_at) \
             VALUES ($1, $2, COALESCE($3, false), $4, $5, $5) \
             ON CONFLICT (user_id) DO UPDATE SET \
               ai_conversation_id = COALESCE(EXCLUDED.ai_conversation_id, identity_mappings.ai_conversation_id), \
               blocked = COALESCE($3, identity_mappings.blocked), \
               display_name = COALESCE(EXCLUDED.display_name, identity_mappings.display_name), \
               updated_at = EXCLUDED.updated_at \
             RETURNING {MAPPING_COLUMNS}"
        ))
        .bind(user_id)
        .bind(patch.ai_conversation_id.as_deref())
        .bind(patch.blocked)
        .bind(patch.display_name.as_deref())
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        parse_mapping_row(&row)
    }
}

#[derive(Clone)]
pub struct PgEventLog {
    pool: PgPool,
}

impl PgEventLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventSink for PgEventLog {
    async fn record(&self, event: JobEvent) {
        trace_event(&event);
        let inserted = sqlx::query(
            "INSERT INTO event_logs (id, event_type, user_id, job_id, payload, error, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(event.event_type.as_str())
        .bind(&event.user_id)
        .bind(&event.job_id)
        .bind(Json(&event.payload))
        .bind(event.error.as_deref())
        .bind(Utc::now())
        .execute(&self.pool)
        .await;
        if let Err(err) = inserted {
            warn!(job_id = %event.job_id, error = %err, "failed to persist event log entry");
        }
    }
}

/// The `settings` key/value table.
#[derive(Clone)]
pub struct PgConfigStore {
    pool: PgPool,
}

impl PgConfigStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConfigSource for PgConfigStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }
}
