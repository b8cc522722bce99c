//! In-process queue with blocking-pop semantics.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::error::QueueError;
use crate::queue::JobQueue;

/// FIFO queues held in memory. Pops wait up to `pop_timeout` for a push.
pub struct MemoryQueue {
    queues: Mutex<HashMap<String, VecDeque<String>>>,
    notify: Notify,
    pop_timeout: Duration,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::with_pop_timeout(Duration::from_millis(50))
    }

    pub fn with_pop_timeout(pop_timeout: Duration) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            pop_timeout,
        }
    }

    /// Number of payloads waiting on `queue`.
    pub async fn len(&self, queue: &str) -> usize {
        self.queues.lock().await.get(queue).map_or(0, VecDeque::len)
    }

    /// Remove and return everything waiting on `queue`.
    pub async fn drain(&self, queue: &str) -> Vec<String> {
        self.queues
            .lock()
            .await
            .get_mut(queue)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }

    async fn try_pop(&self, queue: &str) -> Option<String> {
        self.queues.lock().await.get_mut(queue)?.pop_front()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn pop(&self, queue: &str) -> Result<Option<String>, QueueError> {
        let deadline = tokio::time::Instant::now() + self.pop_timeout;
        loop {
            // Register interest before checking so a push in between is not missed.
            let notified = self.notify.notified();
            if let Some(payload) = self.try_pop(queue).await {
                return Ok(Some(payload));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn push(&self, queue: &str, payload: &str) -> Result<(), QueueError> {
        self.queues
            .lock()
            .await
            .entry(queue.to_string())
            .or_default()
            .push_back(payload.to_string());
        self.notify.notify_waiters();
        Ok(())
    }
}
