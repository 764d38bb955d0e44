use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::types::{EventType, JobEvent};

/// Write-only observability sink. Implementations swallow their own failures.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn record(&self, event: JobEvent);
}

/// Mirrors an event into the tracing stream.
pub fn trace_event(event: &JobEvent) {
    let kind = event.event_type.as_str();
    match event.event_type {
        EventType::JobCompleted => info!(
            event = kind,
            job_id = %event.job_id,
            user_id = %event.user_id,
            payload = %event.payload,
            "job event"
        ),
        EventType::JobSkippedBlocked => info!(
            event = kind,
            job_id = %event.job_id,
            user_id = %event.user_id,
            "job event"
        ),
        EventType::JobRetry => warn!(
            event = kind,
            job_id = %event.job_id,
            user_id = %event.user_id,
            payload = %event.payload,
            error = event.error.as_deref().unwrap_or(""),
            "job event"
        ),
        EventType::JobFailed => error!(
            event = kind,
            job_id = %event.job_id,
            user_id = %event.user_id,
            error = event.error.as_deref().unwrap_or(""),
            "job event"
        ),
    }
}

const DEFAULT_MEMORY_EVENT_CAPACITY: usize = 1000;

/// Keeps the most recent events in memory.
pub struct MemoryEventLog {
    capacity: usize,
    events: Mutex<VecDeque<JobEvent>>,
}

impl Default for MemoryEventLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_EVENT_CAPACITY)
    }
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn events(&self) -> Vec<JobEvent> {
        self.events.lock().await.iter().cloned().collect()
    }

    pub async fn count(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

#[async_trait]
impl EventSink for MemoryEventLog {
    async fn record(&self, event: JobEvent) {
        trace_event(&event);
        let mut events = self.events.lock().await;
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::types::Job;

    #[tokio::test]
    async fn memory_log_drops_oldest_beyond_capacity() {
        let log = MemoryEventLog::with_capacity(2);
        let now = Utc::now();
        for user in ["a", "b", "c"] {
            let job = Job::new_pending(user, "hi", now, now);
            log.record(JobEvent::new(EventType::JobCompleted, &job, json!({}), None))
                .await;
        }
        let users = log
            .events()
            .await
            .into_iter()
            .map(|e| e.user_id)
            .collect::<Vec<_>>();
        assert_eq!(users, vec!["b", "c"]);
        assert_eq!(log.count(EventType::JobCompleted).await, 2);
        assert_eq!(log.count(EventType::JobFailed).await, 0);
    }

    #[test]
    fn event_serializes_with_snake_case_type() {
        let now = Utc::now();
        let job = Job::new_pending("u1", "hi", now, now);
        let event = JobEvent::new(
            EventType::JobSkippedBlocked,
            &job,
            json!({}),
            Some("User is blocked".into()),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["eventType"], "job_skipped_blocked");
        assert_eq!(value["jobId"], job.id);
        assert_eq!(value["error"], "User is blocked");
    }
}
