//! Debounced job queue.
//!
//! Inbound fragments for one user accumulate in a single pending job whose
//! deadline slides forward with every fragment. A poller invoked from outside
//! picks due jobs oldest-deadline-first and drives each through
//! `Pending -> Processing -> {Completed | Pending (retry) | Failed | Skipped}`
//! sequentially.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::chatbase::AiAgent;
use crate::config::{keys, optional, ConfigSource, RetryPolicy, Settings};
use crate::error::JobError;
use crate::events::EventSink;
use crate::store::{JobStore, MappingStore, RetryOutcome};
use crate::types::{EventType, Job, JobEvent, JobStatus, MappingPatch, ProcessSummary};
use crate::whatsapp::OutboundChannel;

pub const BLOCKED_REASON: &str = "User is blocked";

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueOptions {
    pub debounce_window: Duration,
    pub batch_size: usize,
    pub retry: RetryPolicy,
    pub stale_after: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            debounce_window: DEFAULT_DEBOUNCE,
            batch_size: 10,
            retry: RetryPolicy::default(),
            stale_after: Duration::from_secs(300),
        }
    }
}

impl From<&Settings> for QueueOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            debounce_window: settings.debounce_window,
            batch_size: settings.batch_size,
            retry: settings.retry,
            stale_after: settings.stale_after,
        }
    }
}

/// Everything the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub jobs: Arc<dyn JobStore>,
    pub mappings: Arc<dyn MappingStore>,
    pub ai: Arc<dyn AiAgent>,
    pub outbound: Arc<dyn OutboundChannel>,
    pub events: Arc<dyn EventSink>,
    pub config: Arc<dyn ConfigSource>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Skipped,
    Retried,
    Failed,
    /// Not pending (anymore), not due, or taken elsewhere. Nothing changed.
    Ignored,
}

struct Delivery {
    response_length: usize,
    conversation_id: String,
}

const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(3000);

/// Longest debounce window accepted from config.
pub const MAX_DEBOUNCE: Duration = Duration::from_secs(10 * 60);

/// `now + window`, or `None` when the sum leaves chrono's range.
fn checked_deadline(now: DateTime<Utc>, window: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| now.checked_add_signed(window))
}

fn clamp_debounce(window: Duration) -> Duration {
    if window > MAX_DEBOUNCE {
        warn!(
            requested_ms = window.as_millis() as u64,
            max_ms = MAX_DEBOUNCE.as_millis() as u64,
            "debounce window clamped"
        );
        MAX_DEBOUNCE
    } else {
        window
    }
}

pub struct JobQueue {
    deps: Collaborators,
    clock: Arc<dyn Clock>,
    options: QueueOptions,
    batch_lock: Mutex<()>,
}

impl JobQueue {
    pub fn new(deps: Collaborators, options: QueueOptions) -> Self {
        Self {
            deps,
            clock: Arc::new(SystemClock),
            options,
            batch_lock: Mutex::new(()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn jobs(&self) -> &Arc<dyn JobStore> {
        &self.deps.jobs
    }

    pub fn mappings(&self) -> &Arc<dyn MappingStore> {
        &self.deps.mappings
    }

    /// Config store value wins over the startup default. Never above
    /// [`MAX_DEBOUNCE`].
    async fn debounce_window(&self) -> Duration {
        let window = match optional(self.deps.config.as_ref(), keys::DEBOUNCE_MS).await {
            Ok(Some(raw)) => match raw.parse::<u64>() {
                Ok(ms) => Duration::from_millis(ms),
                Err(_) => {
                    warn!(value = %raw, "ignoring unparsable debounce_ms");
                    self.options.debounce_window
                }
            },
            Ok(None) => self.options.debounce_window,
            Err(err) => {
                warn!(error = %err, "debounce_ms lookup failed");
                self.options.debounce_window
            }
        };
        clamp_debounce(window)
    }

    /// Merges `fragment` into the user's pending job, or opens one, and pushes
    /// its deadline to `now + debounce window`. Store failures are logged and
    /// reported as `false`, never raised.
    pub async fn enqueue_or_debounce(&self, user_id: &str, fragment: &str) -> bool {
        let window = self.debounce_window().await;
        let now = self.clock.now();
        let scheduled_for = checked_deadline(now, window)
            .or_else(|| {
                warn!(user_id, "debounce deadline out of range, using default window");
                checked_deadline(now, DEFAULT_DEBOUNCE)
            })
            .unwrap_or(now);
        match self
            .deps
            .jobs
            .enqueue(user_id, fragment, scheduled_for, now)
            .await
        {
            Ok(job) => {
                debug!(
                    job_id = %job.id,
                    user_id,
                    scheduled_for = %job.scheduled_for,
                    "debounced inbound message"
                );
                true
            }
            Err(err) => {
                error!(user_id, error = %err, "failed to enqueue inbound message");
                false
            }
        }
    }

    /// Processes up to `batch_size` due jobs, one after another.
    pub async fn process_ready_jobs(&self) -> ProcessSummary {
        let _batch = self.batch_lock.lock().await;
        let mut summary = ProcessSummary::default();

        let ready = match self
            .deps
            .jobs
            .ready(self.clock.now(), self.options.batch_size)
            .await
        {
            Ok(ready) => ready,
            Err(err) => {
                error!(error = %err, "failed to select ready jobs");
                summary.errors += 1;
                return summary;
            }
        };

        for job in ready {
            match self.process_job(job).await {
                JobOutcome::Completed | JobOutcome::Skipped => summary.processed += 1,
                JobOutcome::Retried | JobOutcome::Failed => summary.errors += 1,
                JobOutcome::Ignored => {}
            }
        }
        if summary != ProcessSummary::default() {
            info!(
                processed = summary.processed,
                errors = summary.errors,
                "processed ready jobs"
            );
        }
        summary
    }

    /// Runs one job through the state machine. Anything but a due pending job
    /// is left untouched.
    pub async fn process_job(&self, job: Job) -> JobOutcome {
        if job.status != JobStatus::Pending {
            return JobOutcome::Ignored;
        }

        let lookup = self.deps.mappings.get(&job.user_id).await;
        if let Ok(Some(mapping)) = &lookup {
            if mapping.blocked {
                return self.skip_blocked(&job).await;
            }
        }

        let claimed = match self.deps.jobs.claim(&job.id, self.clock.now()).await {
            Ok(Some(claimed)) => claimed,
            Ok(None) => return JobOutcome::Ignored,
            Err(err) => {
                error!(job_id = %job.id, error = %err, "failed to claim job");
                return JobOutcome::Ignored;
            }
        };

        let delivered = match lookup {
            Ok(_) => self.deliver(&claimed).await,
            Err(err) => Err(JobError::from(err)),
        };
        match delivered {
            Ok(delivery) => self.complete(&claimed, delivery).await,
            Err(err) => self.fail_or_retry(&claimed, err).await,
        }
    }

    async fn skip_blocked(&self, job: &Job) -> JobOutcome {
        match self
            .deps
            .jobs
            .skip(&job.id, BLOCKED_REASON, self.clock.now())
            .await
        {
            Ok(true) => {
                self.deps
                    .events
                    .record(JobEvent::new(
                        EventType::JobSkippedBlocked,
                        job,
                        json!({}),
                        Some(BLOCKED_REASON.to_string()),
                    ))
                    .await;
                JobOutcome::Skipped
            }
            Ok(false) => JobOutcome::Ignored,
            Err(err) => {
                error!(job_id = %job.id, error = %err, "failed to skip blocked job");
                JobOutcome::Ignored
            }
        }
    }

    async fn deliver(&self, job: &Job) -> Result<Delivery, JobError> {
        if job.content.trim().is_empty() {
            return Err(JobError::EmptyContent);
        }

        let mapping = match self.deps.mappings.get(&job.user_id).await? {
            Some(mapping) => mapping,
            None => {
                self.deps
                    .mappings
                    .upsert(&job.user_id, &MappingPatch::default())
                    .await?
            }
        };

        let reply = self
            .deps
            .ai
            .query(
                &job.content,
                mapping.ai_conversation_id.as_deref(),
                &job.user_id,
            )
            .await?;
        if mapping.ai_conversation_id.as_deref() != Some(reply.conversation_id.as_str()) {
            self.deps
                .mappings
                .upsert(
                    &job.user_id,
                    &MappingPatch::conversation(reply.conversation_id.clone()),
                )
                .await?;
        }

        self.deps
            .outbound
            .send_text(&job.user_id, &reply.text)
            .await?;

        Ok(Delivery {
            response_length: reply.text.chars().count(),
            conversation_id: reply.conversation_id,
        })
    }

    async fn complete(&self, job: &Job, delivery: Delivery) -> JobOutcome {
        match self.deps.jobs.complete(&job.id, self.clock.now()).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(job_id = %job.id, "job left processing before completion");
                return JobOutcome::Ignored;
            }
            Err(err) => {
                // The row stays in processing; the reaper requeues it and the
                // reply goes out again (at-least-once).
                error!(
                    job_id = %job.id,
                    error = %err,
                    "reply sent but completion not recorded; job will be re-sent after reaping"
                );
                return JobOutcome::Retried;
            }
        }
        self.deps
            .events
            .record(JobEvent::new(
                EventType::JobCompleted,
                job,
                json!({
                    "responseLength": delivery.response_length,
                    "conversationId": delivery.conversation_id,
                }),
                None,
            ))
            .await;
        JobOutcome::Completed
    }

    async fn fail_or_retry(&self, job: &Job, err: JobError) -> JobOutcome {
        let attempts = job.attempts.saturating_add(1);
        let message = err.to_string();
        let now = self.clock.now();
        let retry = self.options.retry;
        let give_up = retry.exhausted(attempts) || (err.is_config() && !retry.retry_config_errors);

        if give_up {
            return match self.deps.jobs.fail(&job.id, attempts, &message, now).await {
                Ok(true) => {
                    self.deps
                        .events
                        .record(JobEvent::new(
                            EventType::JobFailed,
                            job,
                            json!({ "attempts": attempts }),
                            Some(message),
                        ))
                        .await;
                    JobOutcome::Failed
                }
                Ok(false) => JobOutcome::Ignored,
                Err(store_err) => {
                    error!(job_id = %job.id, error = %store_err, "failed to mark job failed");
                    JobOutcome::Failed
                }
            };
        }

        let delay = retry.delay_for(attempts);
        let outcome = self
            .deps
            .jobs
            .retry(&job.id, attempts, &message, now + delay, now)
            .await;
        let payload = match outcome {
            Ok(Some(RetryOutcome::Rescheduled)) => json!({
                "attempts": attempts,
                "retryInSecs": delay.num_seconds(),
            }),
            Ok(Some(RetryOutcome::MergedInto(pending_id))) => json!({
                "attempts": attempts,
                "mergedInto": pending_id,
            }),
            Ok(None) => return JobOutcome::Ignored,
            Err(store_err) => {
                error!(job_id = %job.id, error = %store_err, "failed to reschedule job");
                return JobOutcome::Retried;
            }
        };
        self.deps
            .events
            .record(JobEvent::new(EventType::JobRetry, job, payload, Some(message)))
            .await;
        JobOutcome::Retried
    }

    /// Sends jobs stuck in Processing past `stale_after` down the failure path.
    pub async fn reap_stale(&self) -> usize {
        let _batch = self.batch_lock.lock().await;
        // A stale_after beyond chrono's range means nothing is ever stale.
        let cutoff = chrono::Duration::from_std(self.options.stale_after)
            .ok()
            .and_then(|after| self.clock.now().checked_sub_signed(after))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let stale = match self.deps.jobs.stale_processing(cutoff).await {
            Ok(stale) => stale,
            Err(err) => {
                error!(error = %err, "failed to look up stale jobs");
                return 0;
            }
        };
        let mut reaped = 0;
        for job in stale {
            warn!(job_id = %job.id, user_id = %job.user_id, "reaping stale processing job");
            if self.fail_or_retry(&job, JobError::TimedOut).await != JobOutcome::Ignored {
                reaped += 1;
            }
        }
        reaped
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::chatbase::AiReply;
    use crate::config::MemoryConfig;
    use crate::error::{AdapterError, StoreError};
    use crate::events::MemoryEventLog;
    use crate::store::{MemoryJobStore, MemoryMappingStore};
    use crate::types::JobFilter;

    /// Clock that only moves when told to.
    struct ManualClock {
        now: std::sync::Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        fn new(start: DateTime<Utc>) -> Self {
            Self {
                now: std::sync::Mutex::new(start),
            }
        }

        fn advance(&self, by: ChronoDuration) {
            *self.now.lock().unwrap() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }
    }

    /// Memory store whose `complete` always errors.
    struct CompleteFails(Arc<MemoryJobStore>);

    #[async_trait]
    impl JobStore for CompleteFails {
        async fn enqueue(
            &self,
            user_id: &str,
            fragment: &str,
            scheduled_for: DateTime<Utc>,
            now: DateTime<Utc>,
        ) -> Result<Job, StoreError> {
            self.0.enqueue(user_id, fragment, scheduled_for, now).await
        }

        async fn find_pending(&self, user_id: &str) -> Result<Option<Job>, StoreError> {
            self.0.find_pending(user_id).await
        }

        async fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
            self.0.get(id).await
        }

        async fn ready(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError> {
            self.0.ready(now, limit).await
        }

        async fn claim(&self, id: &str, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
            self.0.claim(id, now).await
        }

        async fn skip(&self, id: &str, reason: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
            self.0.skip(id, reason, now).await
        }

        async fn complete(&self, _: &str, _: DateTime<Utc>) -> Result<bool, StoreError> {
            Err(StoreError::Mapping("connection dropped".into()))
        }

        async fn fail(
            &self,
            id: &str,
            attempts: u32,
            error: &str,
            now: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            self.0.fail(id, attempts, error, now).await
        }

        async fn retry(
            &self,
            id: &str,
            attempts: u32,
            error: &str,
            scheduled_for: DateTime<Utc>,
            now: DateTime<Utc>,
        ) -> Result<Option<RetryOutcome>, StoreError> {
            self.0.retry(id, attempts, error, scheduled_for, now).await
        }

        async fn stale_processing(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
            self.0.stale_processing(cutoff).await
        }

        async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
            self.0.list(filter).await
        }
    }

    #[derive(Default)]
    struct FakeAi {
        calls: std::sync::Mutex<Vec<(String, Option<String>)>>,
        fail: AtomicBool,
    }

    impl FakeAi {
        fn calls(&self) -> Vec<(String, Option<String>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AiAgent for FakeAi {
        async fn query(
            &self,
            content: &str,
            conversation_id: Option<&str>,
            user_id: &str,
        ) -> Result<AiReply, AdapterError> {
            self.calls
                .lock()
                .unwrap()
                .push((content.to_string(), conversation_id.map(str::to_string)));
            if self.fail.load(Ordering::SeqCst) {
                return Err(AdapterError::Api {
                    service: "chatbase",
                    status: 503,
                    body: "unavailable".into(),
                });
            }
            Ok(AiReply {
                text: format!("echo: {content}"),
                conversation_id: conversation_id
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("conv-{user_id}")),
            })
        }
    }

    #[derive(Default)]
    struct FakeOutbound {
        sent: std::sync::Mutex<Vec<(String, String)>>,
        fail: AtomicBool,
    }

    impl FakeOutbound {
        fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OutboundChannel for FakeOutbound {
        async fn send_text(&self, to: &str, text: &str) -> Result<(), AdapterError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(AdapterError::request("whatsapp", "connection reset"));
            }
            self.sent
                .lock()
                .unwrap()
                .push((to.to_string(), text.to_string()));
            Ok(())
        }
    }

    struct ConfigMissingAi;

    #[async_trait]
    impl AiAgent for ConfigMissingAi {
        async fn query(&self, _: &str, _: Option<&str>, _: &str) -> Result<AiReply, AdapterError> {
            Err(AdapterError::Config("chatbase_api_key".into()))
        }
    }

    struct Harness {
        queue: JobQueue,
        jobs: Arc<MemoryJobStore>,
        mappings: Arc<MemoryMappingStore>,
        ai: Arc<FakeAi>,
        outbound: Arc<FakeOutbound>,
        events: Arc<MemoryEventLog>,
        config: Arc<MemoryConfig>,
        clock: Arc<ManualClock>,
    }

    impl Harness {
        fn new(options: QueueOptions) -> Self {
            Self::with_ai(options, None)
        }

        fn with_ai(options: QueueOptions, ai_override: Option<Arc<dyn AiAgent>>) -> Self {
            Self::build(options, ai_override, |jobs| jobs as Arc<dyn JobStore>)
        }

        /// `wrap_jobs` decides what the queue sees; the harness keeps the
        /// inner memory store for assertions.
        fn build(
            options: QueueOptions,
            ai_override: Option<Arc<dyn AiAgent>>,
            wrap_jobs: impl FnOnce(Arc<MemoryJobStore>) -> Arc<dyn JobStore>,
        ) -> Self {
            let jobs = Arc::new(MemoryJobStore::new());
            let mappings = Arc::new(MemoryMappingStore::new());
            let ai = Arc::new(FakeAi::default());
            let outbound = Arc::new(FakeOutbound::default());
            let events = Arc::new(MemoryEventLog::new());
            let config = Arc::new(MemoryConfig::default());
            let clock = Arc::new(ManualClock::new(Utc::now()));
            let deps = Collaborators {
                jobs: wrap_jobs(jobs.clone()),
                mappings: mappings.clone(),
                ai: ai_override.unwrap_or_else(|| ai.clone() as Arc<dyn AiAgent>),
                outbound: outbound.clone(),
                events: events.clone(),
                config: config.clone(),
            };
            let queue = JobQueue::new(deps, options).with_clock(clock.clone());
            Self {
                queue,
                jobs,
                mappings,
                ai,
                outbound,
                events,
                config,
                clock,
            }
        }

        fn advance_ms(&self, ms: i64) {
            self.clock.advance(ChronoDuration::milliseconds(ms));
        }

        async fn only_job(&self) -> Job {
            let all = self.jobs.list(&JobFilter::default()).await.unwrap();
            assert_eq!(all.len(), 1, "expected exactly one job, got {all:?}");
            all.into_iter().next().unwrap()
        }
    }

    #[tokio::test]
    async fn rapid_messages_merge_into_one_delivery() {
        let h = Harness::new(QueueOptions::default());
        let user = "+33600000001";

        h.queue.enqueue_or_debounce(user, "Hello").await;
        h.advance_ms(1000);
        let second_call_at = h.clock.now();
        h.queue.enqueue_or_debounce(user, "are you there?").await;

        let pending = h.jobs.find_pending(user).await.unwrap().unwrap();
        assert_eq!(pending.content, "Hello\nare you there?");
        assert_eq!(
            pending.scheduled_for,
            second_call_at + ChronoDuration::milliseconds(3000)
        );
        assert_eq!(h.jobs.list(&JobFilter::default()).await.unwrap().len(), 1);

        // Two seconds after the last message the window is still open.
        h.advance_ms(2000);
        assert_eq!(h.queue.process_ready_jobs().await, ProcessSummary::default());
        assert!(h.ai.calls().is_empty());

        h.advance_ms(1000);
        let summary = h.queue.process_ready_jobs().await;
        assert_eq!(summary, ProcessSummary { processed: 1, errors: 0 });

        assert_eq!(
            h.ai.calls(),
            vec![("Hello\nare you there?".to_string(), None)]
        );
        assert_eq!(
            h.outbound.sent(),
            vec![(user.to_string(), "echo: Hello\nare you there?".to_string())]
        );
        let job = h.only_job().await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 0);

        let mapping = h.mappings.get(user).await.unwrap().unwrap();
        assert_eq!(mapping.ai_conversation_id.as_deref(), Some("conv-+33600000001"));
        assert_eq!(h.events.count(EventType::JobCompleted).await, 1);
        let completed = h.events.events().await;
        assert_eq!(
            completed[0].payload["responseLength"],
            "echo: Hello\nare you there?".chars().count()
        );
    }

    #[tokio::test]
    async fn existing_conversation_is_reused() {
        let h = Harness::new(QueueOptions::default());
        h.mappings
            .upsert("u1", &MappingPatch::conversation("conv-existing"))
            .await
            .unwrap();
        h.queue.enqueue_or_debounce("u1", "hi").await;
        h.advance_ms(3000);
        h.queue.process_ready_jobs().await;
        assert_eq!(
            h.ai.calls(),
            vec![("hi".to_string(), Some("conv-existing".to_string()))]
        );
    }

    #[tokio::test]
    async fn debounce_window_comes_from_config_store() {
        let h = Harness::new(QueueOptions::default());
        h.config.set(keys::DEBOUNCE_MS, "1000").await;
        let now = h.clock.now();
        h.queue.enqueue_or_debounce("u1", "hi").await;
        let job = h.only_job().await;
        assert_eq!(job.scheduled_for, now + ChronoDuration::milliseconds(1000));

        h.config.set(keys::DEBOUNCE_MS, "soon").await;
        h.queue.enqueue_or_debounce("u1", "again").await;
        let job = h.only_job().await;
        assert_eq!(job.scheduled_for, now + ChronoDuration::milliseconds(3000));
    }

    #[tokio::test]
    async fn failing_ai_exhausts_attempts_with_growing_backoff() {
        let h = Harness::new(QueueOptions::default());
        h.ai.fail.store(true, Ordering::SeqCst);
        h.queue.enqueue_or_debounce("u1", "Hello").await;
        h.advance_ms(3000);

        let mut previous_delay = ChronoDuration::zero();
        for expected_attempts in 1..=2u32 {
            let summary = h.queue.process_ready_jobs().await;
            assert_eq!(summary, ProcessSummary { processed: 0, errors: 1 });

            let job = h.only_job().await;
            assert_eq!(job.status, JobStatus::Pending);
            assert_eq!(job.attempts, expected_attempts);
            assert_eq!(job.last_error.as_deref(), Some("chatbase returned 503: unavailable"));
            let delay = job.scheduled_for - h.clock.now();
            assert!(delay > previous_delay);
            previous_delay = delay;

            // Not picked up again before the backoff elapses.
            assert_eq!(h.queue.process_ready_jobs().await, ProcessSummary::default());
            h.clock.advance(delay);
        }

        let summary = h.queue.process_ready_jobs().await;
        assert_eq!(summary, ProcessSummary { processed: 0, errors: 1 });
        let job = h.only_job().await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);

        h.advance_ms(24 * 60 * 60 * 1000);
        assert_eq!(h.queue.process_ready_jobs().await, ProcessSummary::default());
        assert_eq!(h.ai.calls().len(), 3);
        assert!(h.outbound.sent().is_empty());
        assert_eq!(h.events.count(EventType::JobRetry).await, 2);
        assert_eq!(h.events.count(EventType::JobFailed).await, 1);
    }

    #[tokio::test]
    async fn first_retry_waits_ten_seconds() {
        let h = Harness::new(QueueOptions::default());
        h.outbound.fail.store(true, Ordering::SeqCst);
        h.queue.enqueue_or_debounce("u1", "Hello").await;
        h.advance_ms(3000);
        h.queue.process_ready_jobs().await;

        let job = h.only_job().await;
        assert_eq!(job.scheduled_for - h.clock.now(), ChronoDuration::seconds(10));
        let retry = h
            .events
            .events()
            .await
            .into_iter()
            .find(|e| e.event_type == EventType::JobRetry)
            .unwrap();
        assert_eq!(retry.payload["retryInSecs"], 10);
        assert_eq!(retry.payload["attempts"], 1);

        // Conversation id was persisted before the send failed, so the retry reuses it.
        h.outbound.fail.store(false, Ordering::SeqCst);
        h.advance_ms(10_000);
        assert_eq!(
            h.queue.process_ready_jobs().await,
            ProcessSummary { processed: 1, errors: 0 }
        );
        let calls = h.ai.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].1.as_deref(), Some("conv-u1"));
        assert_eq!(h.only_job().await.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn blocked_user_is_skipped_without_calling_adapters() {
        let h = Harness::new(QueueOptions::default());
        h.mappings
            .upsert(
                "u1",
                &MappingPatch {
                    blocked: Some(true),
                    ..MappingPatch::default()
                },
            )
            .await
            .unwrap();
        h.queue.enqueue_or_debounce("u1", "let me in").await;
        h.advance_ms(3000);

        let summary = h.queue.process_ready_jobs().await;
        assert_eq!(summary, ProcessSummary { processed: 1, errors: 0 });

        let job = h.only_job().await;
        assert_eq!(job.status, JobStatus::Skipped);
        assert_eq!(job.last_error.as_deref(), Some(BLOCKED_REASON));
        assert_eq!(job.attempts, 0);
        assert!(h.ai.calls().is_empty());
        assert!(h.outbound.sent().is_empty());
        assert_eq!(h.events.count(EventType::JobSkippedBlocked).await, 1);
    }

    #[tokio::test]
    async fn terminal_jobs_are_never_touched() {
        let h = Harness::new(QueueOptions::default());
        let past = h.clock.now() - ChronoDuration::minutes(5);
        for status in [JobStatus::Completed, JobStatus::Failed, JobStatus::Skipped] {
            let mut job = Job::new_pending("u1", "old", past, past);
            job.status = status;
            h.jobs.insert(job.clone()).await;

            assert_eq!(h.queue.process_job(job.clone()).await, JobOutcome::Ignored);
            assert_eq!(h.jobs.get(&job.id).await.unwrap().unwrap(), job);
        }

        assert_eq!(h.queue.process_ready_jobs().await, ProcessSummary::default());
        assert!(h.ai.calls().is_empty());
        assert!(h.outbound.sent().is_empty());
        assert!(h.events.events().await.is_empty());
    }

    #[tokio::test]
    async fn stale_snapshot_of_finished_job_is_ignored() {
        let h = Harness::new(QueueOptions::default());
        h.queue.enqueue_or_debounce("u1", "hi").await;
        h.advance_ms(3000);
        let snapshot = h.only_job().await;
        h.queue.process_ready_jobs().await;

        assert_eq!(h.queue.process_job(snapshot).await, JobOutcome::Ignored);
        assert_eq!(h.ai.calls().len(), 1);
        assert_eq!(h.outbound.sent().len(), 1);
    }

    #[tokio::test]
    async fn empty_content_is_a_retryable_failure() {
        let h = Harness::new(QueueOptions::default());
        h.queue.enqueue_or_debounce("u1", "   ").await;
        h.advance_ms(3000);

        assert_eq!(
            h.queue.process_ready_jobs().await,
            ProcessSummary { processed: 0, errors: 1 }
        );
        let job = h.only_job().await;
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some("No message content"));
        assert!(h.ai.calls().is_empty());
    }

    #[tokio::test]
    async fn config_errors_retry_by_default() {
        let h = Harness::with_ai(QueueOptions::default(), Some(Arc::new(ConfigMissingAi)));
        h.queue.enqueue_or_debounce("u1", "hi").await;
        h.advance_ms(3000);
        h.queue.process_ready_jobs().await;

        let job = h.only_job().await;
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn config_errors_fail_fast_when_configured() {
        let options = QueueOptions {
            retry: RetryPolicy {
                retry_config_errors: false,
                ..RetryPolicy::default()
            },
            ..QueueOptions::default()
        };
        let h = Harness::with_ai(options, Some(Arc::new(ConfigMissingAi)));
        h.queue.enqueue_or_debounce("u1", "hi").await;
        h.advance_ms(3000);
        h.queue.process_ready_jobs().await;

        let job = h.only_job().await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert_eq!(
            job.last_error.as_deref(),
            Some("missing configuration: chatbase_api_key")
        );
        assert_eq!(h.events.count(EventType::JobFailed).await, 1);
    }

    #[tokio::test]
    async fn batches_respect_size_and_deadline_order() {
        let options = QueueOptions {
            batch_size: 2,
            ..QueueOptions::default()
        };
        let h = Harness::new(options);
        for user in ["a", "b", "c"] {
            h.queue.enqueue_or_debounce(user, user).await;
            h.advance_ms(10);
        }
        h.advance_ms(3000);

        assert_eq!(
            h.queue.process_ready_jobs().await,
            ProcessSummary { processed: 2, errors: 0 }
        );
        let contents = h.ai.calls().into_iter().map(|c| c.0).collect::<Vec<_>>();
        assert_eq!(contents, vec!["a", "b"]);

        assert_eq!(
            h.queue.process_ready_jobs().await,
            ProcessSummary { processed: 1, errors: 0 }
        );
    }

    #[tokio::test]
    async fn one_failure_does_not_abort_the_batch() {
        let h = Harness::new(QueueOptions::default());
        h.queue.enqueue_or_debounce("u1", "").await;
        h.advance_ms(10);
        h.queue.enqueue_or_debounce("u2", "hi").await;
        h.advance_ms(3000);

        assert_eq!(
            h.queue.process_ready_jobs().await,
            ProcessSummary { processed: 1, errors: 1 }
        );
        assert_eq!(h.outbound.sent().len(), 1);
    }

    #[tokio::test]
    async fn stale_processing_jobs_are_requeued() {
        let h = Harness::new(QueueOptions::default());
        let start = h.clock.now();
        h.queue.enqueue_or_debounce("u1", "hi").await;
        h.advance_ms(3000);
        let job = h.only_job().await;
        h.jobs.claim(&job.id, h.clock.now()).await.unwrap().unwrap();

        h.advance_ms(60_000);
        assert_eq!(h.queue.reap_stale().await, 0);

        h.clock.advance(ChronoDuration::seconds(300));
        assert_eq!(h.queue.reap_stale().await, 1);
        let job = h.only_job().await;
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some("Processing timed out"));
        assert!(job.scheduled_for > start);
    }

    #[tokio::test]
    async fn retry_folds_into_newer_pending_job() {
        let h = Harness::new(QueueOptions::default());
        h.queue.enqueue_or_debounce("u1", "first").await;
        h.advance_ms(3000);
        let job = h.only_job().await;
        let claimed = h.jobs.claim(&job.id, h.clock.now()).await.unwrap().unwrap();
        h.queue.enqueue_or_debounce("u1", "second").await;

        let outcome = h.queue.fail_or_retry(&claimed, JobError::TimedOut).await;
        assert_eq!(outcome, JobOutcome::Retried);

        let pending = h.jobs.find_pending("u1").await.unwrap().unwrap();
        assert_ne!(pending.id, claimed.id);
        assert_eq!(pending.content, "first\nsecond");
        assert_eq!(pending.attempts, 1);
        let merged_event = h.events.events().await.pop().unwrap();
        assert_eq!(merged_event.payload["mergedInto"], pending.id);
    }

    #[tokio::test]
    async fn oversized_debounce_is_clamped() {
        let h = Harness::new(QueueOptions::default());
        h.config.set(keys::DEBOUNCE_MS, "9000000000000000").await;
        let now = h.clock.now();

        assert!(h.queue.enqueue_or_debounce("u1", "hi").await);
        let job = h.only_job().await;
        assert_eq!(
            job.scheduled_for,
            now + ChronoDuration::from_std(MAX_DEBOUNCE).unwrap()
        );
    }

    #[test]
    fn deadline_past_chrono_range_is_rejected() {
        assert!(checked_deadline(DateTime::<Utc>::MAX_UTC, Duration::from_secs(1)).is_none());
        assert!(checked_deadline(Utc::now(), Duration::from_secs(u64::MAX)).is_none());
    }

    #[tokio::test]
    async fn unbounded_stale_after_reaps_nothing() {
        let options = QueueOptions {
            stale_after: Duration::from_secs(u64::MAX),
            ..QueueOptions::default()
        };
        let h = Harness::new(options);
        h.queue.enqueue_or_debounce("u1", "hi").await;
        h.advance_ms(3000);
        let job = h.only_job().await;
        h.jobs.claim(&job.id, h.clock.now()).await.unwrap().unwrap();
        h.clock.advance(ChronoDuration::days(365));

        assert_eq!(h.queue.reap_stale().await, 0);
        assert_eq!(h.only_job().await.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn unrecorded_completion_is_not_reported_as_completed() {
        let h = Harness::build(QueueOptions::default(), None, |jobs| {
            Arc::new(CompleteFails(jobs)) as Arc<dyn JobStore>
        });
        h.queue.enqueue_or_debounce("u1", "hi").await;
        h.advance_ms(3000);

        assert_eq!(
            h.queue.process_ready_jobs().await,
            ProcessSummary { processed: 0, errors: 1 }
        );
        assert_eq!(h.outbound.sent().len(), 1);
        assert_eq!(h.events.count(EventType::JobCompleted).await, 0);
        assert_eq!(h.only_job().await.status, JobStatus::Processing);

        // Left in processing, the reaper sends it round again.
        h.clock.advance(ChronoDuration::seconds(301));
        assert_eq!(h.queue.reap_stale().await, 1);
        let job = h.only_job().await;
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.last_error.as_deref(), Some("Processing timed out"));
    }
}
