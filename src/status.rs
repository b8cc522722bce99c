//! Status synchronizer: conflict-aware status writes.
//!
//! Several writers race on the same recording: the log watcher of the live
//! attempt, the log stream of an older attempt that is still draining, the
//! session's finalization step, and the kill listener. There is no store-side
//! transaction, so ordering is restored by the attempt number carried in
//! `errorMetadata.attempt` plus the terminal-state rules in [`evaluate`].
//!
//! Within this process, writes for one recording are additionally serialized
//! so the read-modify-write below cannot interleave with itself. Writers in
//! other processes are still only ordered by the attempt policy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::DatabaseError;
use crate::recording::{ErrorMetadata, RecordingState, RecordingStatus, StatusDetails};
use crate::store::RecordingStore;

/// Outcome of checking a write against the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Write allowed; `attempt` is what the stored metadata will carry.
    Apply { attempt: u32 },
    /// Write comes from an attempt older than the recorded one.
    Stale { current: u32 },
    /// Current status is terminal and this write may not replace it.
    Protected { current: RecordingStatus },
}

/// Decide whether `new_status` from `attempt` may replace `current`.
pub fn evaluate(current: &RecordingState, new_status: RecordingStatus, attempt: Option<u32>) -> Verdict {
    let current_attempt = current.current_attempt();

    if let Some(attempt) = attempt
        && attempt < current_attempt
    {
        return Verdict::Stale {
            current: current_attempt,
        };
    }

    let newer = attempt.is_some_and(|a| a > current_attempt);
    let apply = Verdict::Apply {
        attempt: attempt.unwrap_or(current_attempt),
    };

    if !current.status.is_terminal() {
        return apply;
    }

    // A finished recording is only re-opened by a strictly newer attempt.
    if new_status.is_progress() && !newer {
        return Verdict::Protected {
            current: current.status,
        };
    }

    let cancels = new_status == RecordingStatus::Cancelled
        && current.status != RecordingStatus::Completed;

    if new_status.is_progress() || cancels || newer {
        apply
    } else {
        Verdict::Protected {
            current: current.status,
        }
    }
}

/// Applies status writes to the store under the attempt policy.
pub struct StatusSync {
    store: Arc<dyn RecordingStore>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl StatusSync {
    pub fn new(store: Arc<dyn RecordingStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Apply a status write, logging and swallowing store failures.
    ///
    /// Returns true iff the status was written.
    pub async fn apply_status(
        &self,
        recording_id: &str,
        status: RecordingStatus,
        details: Option<StatusDetails>,
        attempt: Option<u32>,
    ) -> bool {
        match self
            .try_apply_status(recording_id, status, details, attempt)
            .await
        {
            Ok(applied) => applied,
            Err(e) => {
                tracing::error!(
                    recording_id,
                    status = %status,
                    attempt = attempt.unwrap_or(0),
                    "Status write failed: {}",
                    e
                );
                false
            }
        }
    }

    /// Apply a status write, surfacing store failures.
    pub async fn try_apply_status(
        &self,
        recording_id: &str,
        status: RecordingStatus,
        details: Option<StatusDetails>,
        attempt: Option<u32>,
    ) -> Result<bool, DatabaseError> {
        let lock = self.lock_for(recording_id);
        let result = {
            let _guard = lock.lock().await;
            self.apply_locked(recording_id, status, details, attempt)
                .await
        };
        drop(lock);
        self.release(recording_id);
        result
    }

    async fn apply_locked(
        &self,
        recording_id: &str,
        status: RecordingStatus,
        details: Option<StatusDetails>,
        attempt: Option<u32>,
    ) -> Result<bool, DatabaseError> {
        let Some(current) = self.store.get_state(recording_id).await? else {
            tracing::debug!(recording_id, status = %status, "Recording not found, skipping status write");
            return Ok(false);
        };

        let write_attempt = match evaluate(&current, status, attempt) {
            Verdict::Apply { attempt } => attempt,
            Verdict::Stale { current } => {
                tracing::info!(
                    recording_id,
                    status = %status,
                    attempt = attempt.unwrap_or(0),
                    current_attempt = current,
                    "Rejected status write from stale attempt"
                );
                return Ok(false);
            }
            Verdict::Protected { current } => {
                tracing::info!(
                    recording_id,
                    status = %status,
                    attempt = attempt.unwrap_or(0),
                    current_status = %current,
                    "Rejected status write over terminal status"
                );
                return Ok(false);
            }
        };

        let metadata = (details.is_some() || attempt.is_some())
            .then(|| merged_metadata(&current, details, write_attempt));

        self.store
            .update_status(recording_id, status, metadata.as_ref())
            .await?;

        tracing::info!(
            recording_id,
            from = %current.status,
            to = %status,
            attempt = write_attempt,
            "Recording status updated"
        );
        Ok(true)
    }

    fn lock_for(&self, recording_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(recording_id.to_string())
            .or_default()
            .clone()
    }

    /// Drop the per-recording lock once nobody else holds or awaits it.
    fn release(&self, recording_id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks
            .get(recording_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(recording_id);
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

fn merged_metadata(
    current: &RecordingState,
    details: Option<StatusDetails>,
    attempt: u32,
) -> ErrorMetadata {
    let mut meta = current.error_metadata.clone().unwrap_or_default();
    if let Some(details) = details {
        meta.merge(details);
    }
    meta.attempt = attempt;
    meta
}
