//! Session orchestrator: drives one recording through its attempts.
//!
//! Each attempt runs cleanup, a cancellation check, container start, a second
//! cancellation check, then watches the logs while waiting for the container
//! to exit. The exit is classified into `TIMEOUT`, `COMPLETED`, or `FAILED`.
//! Failures are retried after a fixed backoff until `max_retries` attempts
//! have been made. Admission rejections (global limit, user already active)
//! end the job immediately.
//!
//! Every error inside an attempt is caught here; nothing propagates to the
//! queue consumer.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::container::{ContainerManager, RecorderHandle};
use crate::error::{DatabaseError, SessionError};
use crate::queue::{JobQueue, JoinJob, TranscriptionMessage, push_json};
use crate::recording::{RecordingStatus, StatusDetails};
use crate::status::StatusSync;
use crate::store::RecordingStore;
use crate::watcher::LogWatcher;

const MAX_RETRIES_REASON: &str = "max retries reached";

/// Knobs for a session run.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Attempts per recording, counting the first.
    pub max_retries: u32,
    pub retry_backoff: Duration,
    /// Queue that receives the completion message.
    pub transcription_queue: String,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.recorder.max_retries,
            retry_backoff: config.recorder.retry_backoff,
            transcription_queue: config.queue.transcription_queue.clone(),
        }
    }
}

/// What a session run ended with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub final_status: RecordingStatus,
    /// Attempts begun, including one aborted by cancellation.
    pub attempts: u32,
    /// Backoff sleeps taken between attempts.
    pub backoffs: u32,
    /// Completion messages published.
    pub published: u32,
}

/// How one attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptOutcome {
    /// The recording was cancelled; stop without further attempts.
    Cancelled,
    /// Admission was refused; the job is over.
    Rejected,
    /// The container ran to exit with this classified status.
    Exited(RecordingStatus),
}

/// Per-job state that outlives a single attempt.
struct JobContext<'a> {
    job: &'a JoinJob,
    file_name: String,
    file_name_saved: bool,
    report: SessionReport,
}

/// Runs recording sessions.
pub struct SessionOrchestrator {
    manager: Arc<ContainerManager>,
    status: Arc<StatusSync>,
    store: Arc<dyn RecordingStore>,
    queue: Arc<dyn JobQueue>,
    settings: SessionSettings,
}

impl SessionOrchestrator {
    pub fn new(
        manager: Arc<ContainerManager>,
        status: Arc<StatusSync>,
        store: Arc<dyn RecordingStore>,
        queue: Arc<dyn JobQueue>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            manager,
            status,
            store,
            queue,
            settings,
        }
    }

    /// Run `job` to a final status.
    pub async fn run(&self, job: JoinJob) -> SessionReport {
        let mut ctx = JobContext {
            job: &job,
            file_name: recording_file_name(&job.recording_id, Utc::now()),
            file_name_saved: false,
            report: SessionReport {
                final_status: RecordingStatus::Failed,
                attempts: 0,
                backoffs: 0,
                published: 0,
            },
        };

        tracing::info!(
            recording_id = %job.recording_id,
            user_id = %job.user_id,
            file_name = %ctx.file_name,
            max_duration_mins = job.max_duration_mins,
            "Recording session started"
        );

        let max_retries = self.settings.max_retries.max(1);
        for attempt in 1..=max_retries {
            ctx.report.attempts = attempt;
            let last = attempt == max_retries;

            let outcome = match self.attempt(&mut ctx, attempt, last).await {
                Ok(outcome) => outcome,
                Err(e) => self.attempt_failed(&ctx, attempt, last, e).await,
            };

            match outcome {
                AttemptOutcome::Cancelled => {
                    ctx.report.final_status = RecordingStatus::Cancelled;
                    break;
                }
                AttemptOutcome::Rejected => {
                    ctx.report.final_status = RecordingStatus::Failed;
                    break;
                }
                AttemptOutcome::Exited(status)
                    if matches!(status, RecordingStatus::Completed | RecordingStatus::Timeout) =>
                {
                    ctx.report.final_status = status;
                    break;
                }
                AttemptOutcome::Exited(_) if last => {
                    tracing::warn!(
                        recording_id = %job.recording_id,
                        attempts = attempt,
                        "Recording failed, max retries reached"
                    );
                    ctx.report.final_status = RecordingStatus::Failed;
                }
                AttemptOutcome::Exited(_) => {
                    tracing::info!(
                        recording_id = %job.recording_id,
                        attempt,
                        backoff_ms = self.settings.retry_backoff.as_millis() as u64,
                        "Attempt failed, retrying after backoff"
                    );
                    tokio::time::sleep(self.settings.retry_backoff).await;
                    ctx.report.backoffs += 1;
                }
            }
        }

        tracing::info!(
            recording_id = %job.recording_id,
            status = %ctx.report.final_status,
            attempts = ctx.report.attempts,
            "Recording session finished"
        );
        ctx.report
    }

    async fn attempt(
        &self,
        ctx: &mut JobContext<'_>,
        attempt: u32,
        last: bool,
    ) -> Result<AttemptOutcome, SessionError> {
        let job = ctx.job;
        let recording_id = job.recording_id.as_str();
        tracing::info!(recording_id, attempt, "Attempt started");

        // A previous attempt (or process) may have left a container behind.
        if let Err(e) = self.manager.stop(recording_id, &job.user_id).await {
            tracing::warn!(recording_id, attempt, "Cleanup before start failed: {}", e);
        }

        if self.is_cancelled(recording_id).await? {
            tracing::info!(recording_id, attempt, "Recording cancelled before start");
            return Ok(AttemptOutcome::Cancelled);
        }

        let handle = self.manager.start(job, &ctx.file_name).await?;

        if !ctx.file_name_saved {
            match self.store.set_file_name(recording_id, &ctx.file_name).await {
                Ok(()) => ctx.file_name_saved = true,
                Err(e) => tracing::warn!(recording_id, "Failed to save file name: {}", e),
            }
        }

        if self.is_cancelled(recording_id).await? {
            tracing::info!(
                recording_id,
                attempt,
                container_id = %handle.id,
                container = %handle.name,
                "Recording cancelled after start"
            );
            self.stop_quietly(&handle).await;
            return Ok(AttemptOutcome::Cancelled);
        }

        let (summary, exit) = tokio::join!(
            LogWatcher::follow(self.manager.logs(&handle), &self.status, recording_id, attempt),
            self.manager.wait(&handle),
        );
        let exit_code = exit?;

        let final_status = if summary.timed_out {
            RecordingStatus::Timeout
        } else if exit_code == 0 {
            RecordingStatus::Completed
        } else {
            RecordingStatus::Failed
        };

        tracing::info!(
            recording_id,
            attempt,
            exit_code,
            timed_out = summary.timed_out,
            joined = summary.joined,
            status = %final_status,
            "Recorder exited"
        );

        let mut details = StatusDetails::exit(exit_code, summary.timed_out);
        if final_status == RecordingStatus::Failed {
            let message = format!("recorder exited with code {exit_code}");
            details = details.with_error(failure_message(&message, last));
        }

        let applied = self
            .status
            .apply_status(recording_id, final_status, Some(details), Some(attempt))
            .await;

        if applied && final_status == RecordingStatus::Completed {
            self.publish_completion(ctx).await;
        }

        // A rejected final write usually means a kill landed while we ran.
        if !applied
            && final_status != RecordingStatus::Completed
            && self.is_cancelled(recording_id).await?
        {
            return Ok(AttemptOutcome::Cancelled);
        }

        Ok(AttemptOutcome::Exited(final_status))
    }

    /// Exception branch: stop whatever this attempt left running and record
    /// the failure.
    async fn attempt_failed(
        &self,
        ctx: &JobContext<'_>,
        attempt: u32,
        last: bool,
        error: SessionError,
    ) -> AttemptOutcome {
        let job = ctx.job;
        let recording_id = job.recording_id.as_str();
        let retryable = error.is_retryable();

        tracing::error!(
            recording_id,
            attempt,
            retryable,
            "Attempt failed: {}",
            error
        );

        if let Err(e) = self.manager.stop(recording_id, &job.user_id).await {
            tracing::warn!(recording_id, attempt, "Stop after failure failed: {}", e);
        }

        let message = error.to_string();
        let message = if retryable {
            failure_message(&message, last)
        } else {
            message
        };
        self.status
            .apply_status(
                recording_id,
                RecordingStatus::Failed,
                Some(StatusDetails::error(message)),
                Some(attempt),
            )
            .await;

        if retryable {
            AttemptOutcome::Exited(RecordingStatus::Failed)
        } else {
            AttemptOutcome::Rejected
        }
    }

    async fn publish_completion(&self, ctx: &mut JobContext<'_>) {
        let message = TranscriptionMessage {
            recording_id: ctx.job.recording_id.clone(),
            file_name: ctx.file_name.clone(),
        };
        match push_json(
            self.queue.as_ref(),
            &self.settings.transcription_queue,
            &message,
        )
        .await
        {
            Ok(()) => {
                ctx.report.published += 1;
                tracing::info!(
                    recording_id = %message.recording_id,
                    file_name = %message.file_name,
                    queue = %self.settings.transcription_queue,
                    "Published completion message"
                );
            }
            Err(e) => tracing::error!(
                recording_id = %message.recording_id,
                "Failed to publish completion message: {}",
                e
            ),
        }
    }

    async fn is_cancelled(&self, recording_id: &str) -> Result<bool, DatabaseError> {
        Ok(self
            .store
            .get_state(recording_id)
            .await?
            .is_some_and(|state| state.status == RecordingStatus::Cancelled))
    }

    async fn stop_quietly(&self, handle: &RecorderHandle) {
        if let Err(e) = self.manager.stop_handle(handle).await {
            tracing::warn!(
                container_id = %handle.id,
                container = %handle.name,
                "Failed to stop container: {}",
                e
            );
        }
    }
}

/// Output file name for a job: `<recordingId>-<unix millis>.webm`.
pub fn recording_file_name(recording_id: &str, now: DateTime<Utc>) -> String {
    format!("{}-{}.webm", recording_id, now.timestamp_millis())
}

/// The last attempt's failure also carries the retry-exhausted reason, since a
/// second write from the same attempt cannot replace a terminal status.
fn failure_message(message: &str, last: bool) -> String {
    if last {
        format!("{MAX_RETRIES_REASON}: {message}")
    } else {
        message.to_string()
    }
}
