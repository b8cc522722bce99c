//! Queue loops: the join-job consumer and the kill listener.
//!
//! Both loops block on their queue, treat read failures as transient (log,
//! back off, continue), drop undecodable payloads, and exit only when the
//! shutdown token fires.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::QueueConfig;
use crate::container::ContainerManager;
use crate::error::SessionError;
use crate::queue::{JobQueue, JoinJob, KillJob};
use crate::recording::RecordingStatus;
use crate::session::SessionOrchestrator;
use crate::status::StatusSync;
use crate::store::RecordingStore;

/// Wait for the next payload on `name`, or `None` once `shutdown` fires.
async fn next_payload(
    queue: &dyn JobQueue,
    name: &str,
    error_backoff: Duration,
    shutdown: &CancellationToken,
) -> Option<String> {
    loop {
        let popped = tokio::select! {
            _ = shutdown.cancelled() => return None,
            popped = queue.pop(name) => popped,
        };
        match popped {
            Ok(Some(payload)) => return Some(payload),
            Ok(None) => continue,
            Err(e) => {
                tracing::error!(
                    queue = name,
                    backoff_ms = error_backoff.as_millis() as u64,
                    "Queue read failed: {}",
                    e
                );
                tokio::select! {
                    _ = shutdown.cancelled() => return None,
                    _ = tokio::time::sleep(error_backoff) => {}
                }
            }
        }
    }
}

/// Pops join jobs and runs each as its own session task.
pub struct JobConsumer {
    queue: Arc<dyn JobQueue>,
    queue_name: String,
    sessions: Arc<SessionOrchestrator>,
    error_backoff: Duration,
}

impl JobConsumer {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        config: &QueueConfig,
        sessions: Arc<SessionOrchestrator>,
    ) -> Self {
        Self {
            queue,
            queue_name: config.join_queue.clone(),
            sessions,
            error_backoff: config.error_backoff,
        }
    }

    /// Consume until `shutdown` fires. In-flight sessions keep running.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(queue = %self.queue_name, "Job consumer started");
        while let Some(payload) =
            next_payload(self.queue.as_ref(), &self.queue_name, self.error_backoff, &shutdown).await
        {
            self.dispatch(&payload);
        }
        tracing::info!(queue = %self.queue_name, "Job consumer stopped");
    }

    /// Decode a payload and start its session without waiting for it.
    ///
    /// Returns the handle of the task that reports the session's end, or
    /// `None` if the payload was dropped.
    pub fn dispatch(&self, payload: &str) -> Option<JoinHandle<()>> {
        let job: JoinJob = match serde_json::from_str(payload) {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(queue = %self.queue_name, "Dropping malformed join job: {}", e);
                return None;
            }
        };

        let recording_id = job.recording_id.clone();
        tracing::info!(recording_id = %recording_id, user_id = %job.user_id, "Join job received");

        let sessions = Arc::clone(&self.sessions);
        let session = tokio::spawn(async move { sessions.run(job).await });

        Some(tokio::spawn(async move {
            match session.await {
                Ok(report) => tracing::debug!(
                    recording_id = %recording_id,
                    status = %report.final_status,
                    attempts = report.attempts,
                    "Session task finished"
                ),
                Err(e) => tracing::error!(
                    recording_id = %recording_id,
                    "Session task failed: {}",
                    e
                ),
            }
        }))
    }
}

/// Result of handling one kill request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// A container was stopped and the recording marked cancelled.
    Stopped,
    /// Nothing was running, but the recording was still in flight (backoff
    /// between attempts, or not yet started) and is now marked cancelled.
    MarkedCancelled,
    /// Nothing was running and the recording is already finished or unknown.
    NotRunning,
    /// The recording had already completed; left untouched.
    AlreadyCompleted,
}

/// Pops kill requests, stops the user's recorder, and marks it cancelled.
pub struct KillListener {
    queue: Arc<dyn JobQueue>,
    queue_name: String,
    manager: Arc<ContainerManager>,
    status: Arc<StatusSync>,
    store: Arc<dyn RecordingStore>,
    error_backoff: Duration,
}

impl KillListener {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        config: &QueueConfig,
        manager: Arc<ContainerManager>,
        status: Arc<StatusSync>,
        store: Arc<dyn RecordingStore>,
    ) -> Self {
        Self {
            queue,
            queue_name: config.kill_queue.clone(),
            manager,
            status,
            store,
            error_backoff: config.error_backoff,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(queue = %self.queue_name, "Kill listener started");
        while let Some(payload) =
            next_payload(self.queue.as_ref(), &self.queue_name, self.error_backoff, &shutdown).await
        {
            let job: KillJob = match serde_json::from_str(&payload) {
                Ok(job) => job,
                Err(e) => {
                    tracing::warn!(queue = %self.queue_name, "Dropping malformed kill job: {}", e);
                    continue;
                }
            };
            if let Err(e) = self.handle(&job).await {
                tracing::error!(
                    recording_id = %job.recording_id,
                    user_id = %job.user_id,
                    "Kill request failed: {}",
                    e
                );
            }
        }
        tracing::info!(queue = %self.queue_name, "Kill listener stopped");
    }

    /// Handle one kill request.
    ///
    /// A recording with no running container may still be between attempts
    /// or about to start one; it is marked cancelled so the session's next
    /// cancellation check ends the job.
    pub async fn handle(&self, job: &KillJob) -> Result<KillOutcome, SessionError> {
        let recording_id = job.recording_id.as_str();

        let current = self.store.get_state(recording_id).await?.map(|s| s.status);
        if current == Some(RecordingStatus::Completed) {
            tracing::info!(recording_id, "Kill request ignored, recording already completed");
            return Ok(KillOutcome::AlreadyCompleted);
        }

        let stopped = self.manager.stop(recording_id, &job.user_id).await?;
        if !stopped && !current.is_some_and(may_still_run) {
            tracing::info!(recording_id, user_id = %job.user_id, "Kill request found no running recorder");
            return Ok(KillOutcome::NotRunning);
        }

        // Untagged: cancellation is not tied to an attempt.
        self.status
            .apply_status(recording_id, RecordingStatus::Cancelled, None, None)
            .await;
        tracing::info!(recording_id, user_id = %job.user_id, stopped, "Recording cancelled");

        Ok(if stopped {
            KillOutcome::Stopped
        } else {
            KillOutcome::MarkedCancelled
        })
    }
}

/// Statuses from which a session can still start a container: not started
/// yet, in progress, or failed with retries possibly left.
fn may_still_run(status: RecordingStatus) -> bool {
    !status.is_terminal() || status == RecordingStatus::Failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    use crate::config::RecorderConfig;
    use crate::error::QueueError;
    use crate::queue::MemoryQueue;
    use crate::session::SessionSettings;
    use crate::store::MemoryStore;
    use crate::testing::{FakeRuntime, join_job};

    /// Fails the first `failures` pops, then delegates.
    struct FlakyQueue {
        inner: MemoryQueue,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl JobQueue for FlakyQueue {
        async fn pop(&self, queue: &str) -> Result<Option<String>, QueueError> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(QueueError::Connection("connection reset".into()));
            }
            self.inner.pop(queue).await
        }

        async fn push(&self, queue: &str, payload: &str) -> Result<(), QueueError> {
            self.inner.push(queue, payload).await
        }
    }

    fn queue_config() -> QueueConfig {
        QueueConfig {
            error_backoff: Duration::from_millis(5),
            ..QueueConfig::default()
        }
    }

    struct Parts {
        runtime: Arc<FakeRuntime>,
        store: Arc<MemoryStore>,
        manager: Arc<ContainerManager>,
        status: Arc<StatusSync>,
    }

    fn parts() -> Parts {
        let runtime = Arc::new(FakeRuntime::new());
        let store = Arc::new(MemoryStore::new());
        let manager = Arc::new(ContainerManager::new(
            runtime.clone(),
            RecorderConfig::default(),
        ));
        let status = Arc::new(StatusSync::new(store.clone()));
        Parts {
            runtime,
            store,
            manager,
            status,
        }
    }

    fn kill_listener(p: &Parts, queue: Arc<dyn JobQueue>) -> KillListener {
        KillListener::new(
            queue,
            &queue_config(),
            p.manager.clone(),
            p.status.clone(),
            p.store.clone(),
        )
    }

    fn sessions(
        p: &Parts,
        queue: Arc<MemoryQueue>,
        max_retries: u32,
        retry_backoff: Duration,
    ) -> SessionOrchestrator {
        SessionOrchestrator::new(
            p.manager.clone(),
            p.status.clone(),
            p.store.clone(),
            queue,
            SessionSettings {
                max_retries,
                retry_backoff,
                transcription_queue: "transcription-queue".into(),
            },
        )
    }

    fn kill_job() -> KillJob {
        KillJob {
            recording_id: "rec-1".into(),
            user_id: "u1".into(),
        }
    }

    #[tokio::test]
    async fn kill_stops_running_recorder() {
        let p = parts();
        p.store.insert("rec-1", RecordingStatus::Joined).await;
        p.runtime.add_running("u1", "rec-1");
        let listener = kill_listener(&p, Arc::new(MemoryQueue::new()));

        assert_eq!(listener.handle(&kill_job()).await.unwrap(), KillOutcome::Stopped);
        assert_eq!(p.runtime.kills(), 1);
        assert_eq!(
            p.store.get("rec-1").await.unwrap().status,
            RecordingStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn kill_after_completion_changes_nothing() {
        let p = parts();
        p.store.insert("rec-1", RecordingStatus::Completed).await;
        p.runtime.add_running("u1", "rec-1");
        let listener = kill_listener(&p, Arc::new(MemoryQueue::new()));

        assert_eq!(
            listener.handle(&kill_job()).await.unwrap(),
            KillOutcome::AlreadyCompleted
        );
        assert_eq!(p.runtime.kills(), 0);
        assert_eq!(p.store.status_writes(), 0);
        assert_eq!(
            p.store.get("rec-1").await.unwrap().status,
            RecordingStatus::Completed
        );
    }

    #[tokio::test]
    async fn kill_between_attempts_marks_cancelled() {
        let p = parts();
        p.store.insert("rec-1", RecordingStatus::Failed).await;
        let listener = kill_listener(&p, Arc::new(MemoryQueue::new()));

        assert_eq!(
            listener.handle(&kill_job()).await.unwrap(),
            KillOutcome::MarkedCancelled
        );
        assert_eq!(p.runtime.kills(), 0);
        assert_eq!(
            p.store.get("rec-1").await.unwrap().status,
            RecordingStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn kill_after_final_status_changes_nothing() {
        for status in [RecordingStatus::Timeout, RecordingStatus::Cancelled] {
            let p = parts();
            p.store.insert("rec-1", status).await;
            let listener = kill_listener(&p, Arc::new(MemoryQueue::new()));

            assert_eq!(
                listener.handle(&kill_job()).await.unwrap(),
                KillOutcome::NotRunning
            );
            assert_eq!(p.store.status_writes(), 0);
            assert_eq!(p.store.get("rec-1").await.unwrap().status, status);
        }

        let p = parts();
        let listener = kill_listener(&p, Arc::new(MemoryQueue::new()));
        assert_eq!(
            listener.handle(&kill_job()).await.unwrap(),
            KillOutcome::NotRunning
        );
        assert!(p.store.get("rec-1").await.is_none());
    }

    #[tokio::test]
    async fn kill_while_container_starts_cancels_session() {
        let p = parts();
        p.store.insert("rec-1", RecordingStatus::Pending).await;
        p.runtime.script(&["admitted to the meeting"], 0);
        let queue = Arc::new(MemoryQueue::new());
        let listener = Arc::new(kill_listener(&p, queue.clone()));
        let sessions = sessions(&p, queue.clone(), 3, Duration::from_millis(1));

        // The container exists but is not listed as running yet.
        let (tx, rx) = tokio::sync::oneshot::channel();
        p.runtime.before_start({
            let listener = Arc::clone(&listener);
            async move {
                let outcome = listener.handle(&kill_job()).await;
                let _ = tx.send(outcome);
            }
        });

        let report = sessions.run(join_job("u1", "rec-1")).await;

        assert_eq!(rx.await.unwrap().unwrap(), KillOutcome::MarkedCancelled);
        assert_eq!(report.final_status, RecordingStatus::Cancelled);
        assert_eq!(report.attempts, 1);
        assert_eq!(report.published, 0);
        assert_eq!(p.runtime.starts(), 1);
        assert_eq!(p.runtime.kills(), 1);
        assert_eq!(p.runtime.running(), 0);
        assert_eq!(queue.len("transcription-queue").await, 0);
        assert_eq!(
            p.store.get("rec-1").await.unwrap().status,
            RecordingStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn kill_during_retry_backoff_cancels_session() {
        let p = parts();
        p.store.insert("rec-1", RecordingStatus::Pending).await;
        p.runtime.script(&[], 1);
        p.runtime.script(&["admitted to the meeting"], 0);
        let queue = Arc::new(MemoryQueue::new());
        let listener = kill_listener(&p, queue.clone());
        let sessions = Arc::new(sessions(&p, queue.clone(), 3, Duration::from_millis(300)));

        let session = {
            let sessions = Arc::clone(&sessions);
            tokio::spawn(async move { sessions.run(join_job("u1", "rec-1")).await })
        };

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while p.store.get("rec-1").await.unwrap().status != RecordingStatus::Failed {
            assert!(tokio::time::Instant::now() < deadline, "first attempt never failed");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(p.runtime.running(), 0);

        assert_eq!(
            listener.handle(&kill_job()).await.unwrap(),
            KillOutcome::MarkedCancelled
        );

        let report = session.await.unwrap();
        assert_eq!(report.final_status, RecordingStatus::Cancelled);
        assert_eq!(report.attempts, 2);
        assert_eq!(report.backoffs, 1);
        assert_eq!(p.runtime.starts(), 1);
        assert_eq!(queue.len("transcription-queue").await, 0);
        assert_eq!(
            p.store.get("rec-1").await.unwrap().status,
            RecordingStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn kill_loop_survives_queue_errors_and_bad_payloads() {
        let p = parts();
        p.store.insert("rec-1", RecordingStatus::Joined).await;
        p.runtime.add_running("u1", "rec-1");

        let queue = Arc::new(FlakyQueue {
            inner: MemoryQueue::new(),
            failures: AtomicUsize::new(2),
        });
        let config = queue_config();
        queue.push(&config.kill_queue, "{not json").await.unwrap();
        queue
            .push(&config.kill_queue, r#"{"recordingId":"rec-1","userId":"u1"}"#)
            .await
            .unwrap();

        let listener = Arc::new(kill_listener(&p, queue.clone()));
        let shutdown = CancellationToken::new();
        let task = {
            let listener = Arc::clone(&listener);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { listener.run(shutdown).await })
        };

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while p.store.get("rec-1").await.unwrap().status != RecordingStatus::Cancelled {
            assert!(tokio::time::Instant::now() < deadline, "kill never applied");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        shutdown.cancel();
        task.await.unwrap();
        assert_eq!(queue.failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn consumer_dispatches_sessions_concurrently() {
        let p = parts();
        p.store.insert("rec-1", RecordingStatus::Pending).await;
        p.store.insert("rec-2", RecordingStatus::Pending).await;
        let queue = Arc::new(MemoryQueue::new());
        let sessions = Arc::new(sessions(&p, queue.clone(), 1, Duration::from_millis(1)));
        let consumer = JobConsumer::new(queue.clone(), &queue_config(), sessions);

        assert!(consumer.dispatch("{not json").is_none());

        let first = consumer
            .dispatch(
                r#"{"userId":"u1","userName":"Ada","link":"l","recordingId":"rec-1","title":"t"}"#,
            )
            .unwrap();
        let second = consumer
            .dispatch(
                r#"{"userId":"u2","userName":"Bo","link":"l","recordingId":"rec-2","title":"t"}"#,
            )
            .unwrap();
        first.await.unwrap();
        second.await.unwrap();

        for id in ["rec-1", "rec-2"] {
            assert_eq!(
                p.store.get(id).await.unwrap().status,
                RecordingStatus::Completed
            );
        }
        assert_eq!(queue.len("transcription-queue").await, 2);
    }

    #[tokio::test]
    async fn consumer_stops_on_shutdown() {
        let p = parts();
        let queue = Arc::new(MemoryQueue::new());
        let sessions = Arc::new(sessions(&p, queue.clone(), 1, Duration::from_millis(1)));
        let consumer = JobConsumer::new(queue, &queue_config(), sessions);
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), consumer.run(shutdown))
            .await
            .unwrap();
    }
}
