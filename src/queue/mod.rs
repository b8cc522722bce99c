//! Job queues: message types and the queue adapter seam.
//!
//! Queues are FIFO lists (push at tail, pop at head) carrying JSON payloads.
//! Adapters return raw payload strings; decoding into [`JoinJob`] and
//! [`KillJob`] happens here so nothing past this module sees wire shapes.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

pub use self::memory::MemoryQueue;
pub use self::redis::RedisQueue;

fn default_max_duration_mins() -> u32 {
    15
}

/// Request to join a meeting and record it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinJob {
    pub user_id: String,
    pub user_name: String,
    pub link: String,
    pub recording_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default = "default_max_duration_mins")]
    pub max_duration_mins: u32,
}

/// Request to stop a user's recorder and mark the recording cancelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KillJob {
    pub recording_id: String,
    pub user_id: String,
}

/// Completion signal for the downstream transcription pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionMessage {
    pub recording_id: String,
    pub file_name: String,
}

/// A FIFO queue server.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Pop the head of `queue`, waiting up to the adapter's pop timeout.
    ///
    /// Returns `Ok(None)` when the wait elapsed with the queue empty.
    async fn pop(&self, queue: &str) -> Result<Option<String>, QueueError>;

    /// Append a payload to the tail of `queue`.
    async fn push(&self, queue: &str, payload: &str) -> Result<(), QueueError>;
}

/// Serialize and push a message.
pub async fn push_json<T: Serialize + Sync>(
    queue: &dyn JobQueue,
    name: &str,
    message: &T,
) -> Result<(), QueueError> {
    let payload =
        serde_json::to_string(message).map_err(|e| QueueError::Decode(e.to_string()))?;
    queue.push(name, &payload).await
}
