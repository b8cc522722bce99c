//! In-memory recording store for tests and local wiring checks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::DatabaseError;
use crate::recording::{ErrorMetadata, RecordingState, RecordingStatus};
use crate::store::RecordingStore;

/// A stored row: the fields this service touches.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecording {
    pub status: RecordingStatus,
    pub error_metadata: Option<ErrorMetadata>,
    pub file_name: Option<String>,
}

/// Recording store held in a `HashMap`.
#[derive(Default)]
pub struct MemoryStore {
    rows: RwLock<HashMap<String, StoredRecording>>,
    status_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a recording row.
    pub async fn insert(&self, recording_id: &str, status: RecordingStatus) {
        self.insert_with_metadata(recording_id, status, None).await;
    }

    pub async fn insert_with_metadata(
        &self,
        recording_id: &str,
        status: RecordingStatus,
        error_metadata: Option<ErrorMetadata>,
    ) {
        self.rows.write().await.insert(
            recording_id.to_string(),
            StoredRecording {
                status,
                error_metadata,
                file_name: None,
            },
        );
    }

    /// Copy of a row, if present.
    pub async fn get(&self, recording_id: &str) -> Option<StoredRecording> {
        self.rows.read().await.get(recording_id).cloned()
    }

    /// Number of status updates applied so far.
    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordingStore for MemoryStore {
    async fn get_state(&self, recording_id: &str) -> Result<Option<RecordingState>, DatabaseError> {
        Ok(self
            .rows
            .read()
            .await
            .get(recording_id)
            .map(|row| RecordingState {
                status: row.status,
                error_metadata: row.error_metadata.clone(),
            }))
    }

    async fn update_status(
        &self,
        recording_id: &str,
        status: RecordingStatus,
        error_metadata: Option<&ErrorMetadata>,
    ) -> Result<(), DatabaseError> {
        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(recording_id)
            .ok_or_else(|| DatabaseError::Query(format!("recording {recording_id} not found")))?;
        row.status = status;
        if let Some(meta) = error_metadata {
            row.error_metadata = Some(meta.clone());
        }
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_file_name(
        &self,
        recording_id: &str,
        file_name: &str,
    ) -> Result<(), DatabaseError> {
        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(recording_id)
            .ok_or_else(|| DatabaseError::Query(format!("recording {recording_id} not found")))?;
        row.file_name = Some(file_name.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn update_keeps_metadata_when_none_given() {
        let store = MemoryStore::new();
        let meta = ErrorMetadata {
            attempt: 2,
            ..Default::default()
        };
        store
            .insert_with_metadata("rec-1", RecordingStatus::Failed, Some(meta.clone()))
            .await;

        store
            .update_status("rec-1", RecordingStatus::Cancelled, None)
            .await
            .unwrap();

        let row = store.get("rec-1").await.unwrap();
        assert_eq!(row.status, RecordingStatus::Cancelled);
        assert_eq!(row.error_metadata, Some(meta));
        assert_eq!(store.status_writes(), 1);
    }

    #[tokio::test]
    async fn missing_row_reads_as_none() {
        let store = MemoryStore::new();
        assert!(store.get_state("nope").await.unwrap().is_none());
        assert!(
            store
                .update_status("nope", RecordingStatus::Joined, None)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn file_name_is_recorded() {
        let store = MemoryStore::new();
        store.insert("rec-1", RecordingStatus::Pending).await;
        store.set_file_name("rec-1", "rec-1-1.webm").await.unwrap();
        assert_eq!(
            store.get("rec-1").await.unwrap().file_name.as_deref(),
            Some("rec-1-1.webm")
        );
    }
}
