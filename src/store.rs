//! Storage seams for jobs and identity mappings.
//!
//! Every mutation that changes a job's status is conditional on the status the
//! caller expects, so a job that was re-debounced, reaped or finished by
//! someone else is left alone and the caller sees `None`/`false`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::types::{
    append_fragment, IdentityMapping, Job, JobFilter, JobStatus, MappingPatch,
};

/// Where a retried job ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    Rescheduled,
    /// Another pending job for the same user absorbed the retried content.
    MergedInto(String),
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Appends to the user's pending job or creates one, pushing
    /// `scheduled_for` forward either way. Must be atomic per user.
    async fn enqueue(
        &self,
        user_id: &str,
        fragment: &str,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError>;

    async fn find_pending(&self, user_id: &str) -> Result<Option<Job>, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Job>, StoreError>;

    /// Pending jobs due at `now`, oldest deadline first.
    async fn ready(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Pending and due -> Processing. Returns the fresh row.
    async fn claim(&self, id: &str, now: DateTime<Utc>) -> Result<Option<Job>, StoreError>;

    /// Pending -> Skipped.
    async fn skip(&self, id: &str, reason: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Processing -> Completed.
    async fn complete(&self, id: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Processing -> Failed.
    async fn fail(
        &self,
        id: &str,
        attempts: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Processing -> Pending at `scheduled_for`, or folded into the user's
    /// newer pending job when one exists.
    async fn retry(
        &self,
        id: &str,
        attempts: u32,
        error: &str,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<RetryOutcome>, StoreError>;

    /// Processing jobs not touched since `cutoff`.
    async fn stale_processing(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;
}

#[async_trait]
pub trait MappingStore: Send + Sync {
    async fn get(&self, user_id: &str) -> Result<Option<IdentityMapping>, StoreError>;

    /// Merge-upsert: only fields present in `patch` change.
    async fn upsert(
        &self,
        user_id: &str,
        patch: &MappingPatch,
    ) -> Result<IdentityMapping, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a row in an arbitrary state.
    #[cfg(test)]
    pub async fn insert(&self, job: Job) {
        self.jobs.write().await.insert(job.id.clone(), job);
    }
}

fn pending_for<'a>(jobs: &'a HashMap<String, Job>, user_id: &str) -> Option<&'a Job> {
    jobs.values()
        .find(|job| job.user_id == user_id && job.status == JobStatus::Pending)
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(
        &self,
        user_id: &str,
        fragment: &str,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.write().await;
        if let Some(id) = pending_for(&jobs, user_id).map(|job| job.id.clone()) {
            if let Some(job) = jobs.get_mut(&id) {
                job.content = append_fragment(&job.content, fragment);
                job.scheduled_for = scheduled_for;
                job.updated_at = now;
                return Ok(job.clone());
            }
        }
        let job = Job::new_pending(user_id, fragment, scheduled_for, now);
        jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn find_pending(&self, user_id: &str) -> Result<Option<Job>, StoreError> {
        let jobs = self.jobs.read().await;
        Ok(pending_for(&jobs, user_id).cloned())
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn ready(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut due = jobs
            .values()
            .filter(|job| job.is_due(now))
            .cloned()
            .collect::<Vec<_>>();
        due.sort_by(|a, b| {
            a.scheduled_for
                .cmp(&b.scheduled_for)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn claim(&self, id: &str, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(id) else {
            return Ok(None);
        };
        if !job.is_due(now) {
            return Ok(None);
        }
        job.status = JobStatus::Processing;
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn skip(&self, id: &str, reason: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::Skipped;
                job.last_error = Some(reason.to_string());
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(&self, id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(id) {
            Some(job) if job.status == JobStatus::Processing => {
                job.status = JobStatus::Completed;
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail(
        &self,
        id: &str,
        attempts: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(id) {
            Some(job) if job.status == JobStatus::Processing => {
                job.status = JobStatus::Failed;
                job.attempts = attempts;
                job.last_error = Some(error.to_string());
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn retry(
        &self,
        id: &str,
        attempts: u32,
        error: &str,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<RetryOutcome>, StoreError> {
        let mut jobs = self.jobs.write().await;
        let Some(retried) = jobs.get(id).cloned() else {
            return Ok(None);
        };
        if retried.status != JobStatus::Processing {
            return Ok(None);
        }

        let newer_pending = pending_for(&jobs, &retried.user_id).map(|job| job.id.clone());
        if let Some(pending_id) = newer_pending {
            if let Some(pending) = jobs.get_mut(&pending_id) {
                pending.content = append_fragment(&retried.content, &pending.content);
                pending.attempts = pending.attempts.max(attempts);
                pending.last_error = Some(error.to_string());
                pending.scheduled_for = pending.scheduled_for.max(scheduled_for);
                pending.updated_at = now;
            }
            if let Some(job) = jobs.get_mut(id) {
                job.status = JobStatus::Skipped;
                job.attempts = attempts;
                job.last_error = Some(format!("Merged into job {pending_id}"));
                job.updated_at = now;
            }
            return Ok(Some(RetryOutcome::MergedInto(pending_id)));
        }

        if let Some(job) = jobs.get_mut(id) {
            job.status = JobStatus::Pending;
            job.attempts = attempts;
            job.last_error = Some(error.to_string());
            job.scheduled_for = scheduled_for;
            job.updated_at = now;
        }
        Ok(Some(RetryOutcome::Rescheduled))
    }

    async fn stale_processing(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .values()
            .filter(|job| job.status == JobStatus::Processing && job.updated_at <= cutoff)
            .cloned()
            .collect())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut items = jobs
            .values()
            .filter(|job| filter.status.map_or(true, |status| job.status == status))
            .filter(|job| {
                filter
                    .user_id
                    .as_deref()
                    .map_or(true, |user_id| job.user_id == user_id)
            })
            .cloned()
            .collect::<Vec<_>>();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        items.truncate(filter.effective_limit() as usize);
        Ok(items)
    }
}

#[derive(Debug, Default)]
pub struct MemoryMappingStore {
    mappings: RwLock<HashMap<String, IdentityMapping>>,
}

impl MemoryMappingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MappingStore for MemoryMappingStore {
    async fn get(&self, user_id: &str) -> Result<Option<IdentityMapping>, StoreError> {
        Ok(self.mappings.read().await.get(user_id).cloned())
    }

    async fn upsert(
        &self,
        user_id: &str,
        patch: &MappingPatch,
    ) -> Result<IdentityMapping, StoreError> {
        let now = Utc::now();
        let mut mappings = self.mappings.write().await;
        let mapping = mappings
            .entry(user_id.to_string())
            .or_insert_with(|| IdentityMapping {
                user_id: user_id.to_string(),
                ai_conversation_id: None,
                blocked: false,
                display_name: None,
                created_at: now,
                updated_at: now,
            });
        patch.apply(mapping, now);
        Ok(mapping.clone())
    }
}
