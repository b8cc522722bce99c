//! Access to the persisted recording rows.
//!
//! Recordings are created and deleted by the external API. This service only
//! reads `{status, errorMetadata}` and updates `{status, errorMetadata,
//! fileName}` for an existing id.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::recording::{ErrorMetadata, RecordingState, RecordingStatus};

pub use memory::MemoryStore;
pub use postgres::PgRecordingStore;

/// Persisted-store operations consumed by the orchestrator.
#[async_trait]
pub trait RecordingStore: Send + Sync {
    /// Read the current status and metadata. `None` if no such recording.
    async fn get_state(&self, recording_id: &str) -> Result<Option<RecordingState>, DatabaseError>;

    /// Overwrite the status, and the metadata document when one is given.
    async fn update_status(
        &self,
        recording_id: &str,
        status: RecordingStatus,
        error_metadata: Option<&ErrorMetadata>,
    ) -> Result<(), DatabaseError>;

    /// Record the output artifact name.
    async fn set_file_name(&self, recording_id: &str, file_name: &str)
    -> Result<(), DatabaseError>;
}
