use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Skipped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "skipped" => Ok(JobStatus::Skipped),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// One unit of deferred work for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub user_id: String,
    pub status: JobStatus,
    pub scheduled_for: DateTime<Utc>,
    pub content: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new_pending(
        user_id: impl Into<String>,
        content: impl Into<String>,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            status: JobStatus::Pending,
            scheduled_for,
            content: content.into(),
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_for <= now
    }
}

/// Joins debounced fragments in arrival order.
pub fn append_fragment(content: &str, fragment: &str) -> String {
    match (content.is_empty(), fragment.is_empty()) {
        (true, _) => fragment.to_string(),
        (_, true) => content.to_string(),
        _ => format!("{content}\n{fragment}"),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityMapping {
    pub user_id: String,
    pub ai_conversation_id: Option<String>,
    pub blocked: bool,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update for an [`IdentityMapping`]; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingPatch {
    #[serde(default)]
    pub ai_conversation_id: Option<String>,
    #[serde(default)]
    pub blocked: Option<bool>,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl MappingPatch {
    pub fn conversation(id: impl Into<String>) -> Self {
        Self {
            ai_conversation_id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn display_name(name: impl Into<String>) -> Self {
        Self {
            display_name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn apply(&self, mapping: &mut IdentityMapping, now: DateTime<Utc>) {
        if let Some(id) = &self.ai_conversation_id {
            mapping.ai_conversation_id = Some(id.clone());
        }
        if let Some(blocked) = self.blocked {
            mapping.blocked = blocked;
        }
        if let Some(name) = &self.display_name {
            mapping.display_name = Some(name.clone());
        }
        mapping.updated_at = now;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    JobCompleted,
    JobFailed,
    JobRetry,
    JobSkippedBlocked,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::JobCompleted => "job_completed",
            EventType::JobFailed => "job_failed",
            EventType::JobRetry => "job_retry",
            EventType::JobSkippedBlocked => "job_skipped_blocked",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub event_type: EventType,
    pub user_id: String,
    pub job_id: String,
    pub payload: Value,
    pub error: Option<String>,
}

impl JobEvent {
    pub fn new(event_type: EventType, job: &Job, payload: Value, error: Option<String>) -> Self {
        Self {
            event_type,
            user_id: job.user_id.clone(),
            job_id: job.id.clone(),
            payload,
            error,
        }
    }
}

/// Result of one poller batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSummary {
    pub processed: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFilter {
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

impl JobFilter {
    pub fn effective_limit(&self) -> i64 {
        self.limit.unwrap_or(50).clamp(1, 500)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("Pending".parse::<JobStatus>(), Ok(JobStatus::Pending));
        assert_eq!(" skipped ".parse::<JobStatus>(), Ok(JobStatus::Skipped));
        assert!("stuck".parse::<JobStatus>().is_err());
    }

    #[test]
    fn append_fragment_joins_with_newline() {
        assert_eq!(append_fragment("", "Hello"), "Hello");
        assert_eq!(append_fragment("Hello", ""), "Hello");
        assert_eq!(
            append_fragment("Hello", "are you there?"),
            "Hello\nare you there?"
        );
    }

    #[test]
    fn patch_only_touches_supplied_fields() {
        let created = Utc::now();
        let mut mapping = IdentityMapping {
            user_id: "33600000001".into(),
            ai_conversation_id: Some("conv-1".into()),
            blocked: false,
            display_name: Some("Ana".into()),
            created_at: created,
            updated_at: created,
        };
        let later = created + chrono::Duration::seconds(10);
        MappingPatch {
            blocked: Some(true),
            ..MappingPatch::default()
        }
        .apply(&mut mapping, later);

        assert!(mapping.blocked);
        assert_eq!(mapping.ai_conversation_id.as_deref(), Some("conv-1"));
        assert_eq!(mapping.display_name.as_deref(), Some("Ana"));
        assert_eq!(mapping.updated_at, later);
    }

    #[test]
    fn job_serializes_in_camel_case() {
        let now = Utc::now();
        let job = Job::new_pending("33600000001", "Hello", now, now);
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["status"], "pending");
        assert_eq!(value["userId"], "33600000001");
        assert!(value.get("scheduledFor").is_some());
        assert!(value.get("lastError").is_some());
    }
}
