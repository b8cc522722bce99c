//! Container lifecycle manager: admission limits, image pull, start, stop.
//!
//! The limit checks list containers and then create one; two sessions racing
//! through that window can both pass. The engine has no atomic
//! create-if-fewer-than-N, so the limits are best-effort.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::{RECORDER_MEMORY_LIMIT_BYTES, RecorderConfig};
use crate::container::{
    APP_LABEL, ContainerRuntime, ContainerSpec, LogStream, RECORDING_LABEL, USER_LABEL,
};
use crate::error::ContainerError;
use crate::queue::JoinJob;

/// A started recorder container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderHandle {
    pub id: String,
    pub name: String,
}

/// Starts, stops, and observes recorder containers.
pub struct ContainerManager {
    runtime: Arc<dyn ContainerRuntime>,
    config: RecorderConfig,
}

impl ContainerManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: RecorderConfig) -> Self {
        Self { runtime, config }
    }

    /// Start a recorder for `job`, writing its output to `file_name`.
    pub async fn start(
        &self,
        job: &JoinJob,
        file_name: &str,
    ) -> Result<RecorderHandle, ContainerError> {
        let running = self.runtime.list(&[APP_LABEL]).await?;
        if running.len() >= self.config.max_concurrent_containers {
            return Err(ContainerError::LimitExceeded {
                running: running.len(),
                limit: self.config.max_concurrent_containers,
            });
        }

        let users = self
            .runtime
            .list(&[APP_LABEL, (USER_LABEL, job.user_id.as_str())])
            .await?;
        if let Some(existing) = users.first() {
            return Err(ContainerError::UserAlreadyActive {
                user_id: job.user_id.clone(),
                container_id: existing.id.clone(),
            });
        }

        self.ensure_image().await?;

        let spec = self.container_spec(job, file_name, Utc::now());
        let id = self.runtime.create(&spec).await?;

        if let Err(e) = self.runtime.start(&id).await {
            // Auto-remove only kicks in after a container has run.
            if let Err(remove_err) = self.runtime.remove(&id).await {
                tracing::warn!(container_id = %id, "Failed to remove unstarted container: {}", remove_err);
            }
            return Err(e);
        }

        tracing::info!(
            recording_id = %job.recording_id,
            user_id = %job.user_id,
            container_id = %id,
            container = %spec.name,
            "Recorder container started"
        );

        Ok(RecorderHandle {
            id,
            name: spec.name,
        })
    }

    /// Force-stop the user's recorder for `recording_id`.
    ///
    /// Containers are found by the `user-id` label. Containers labeled with a
    /// different recording are left alone. Returns whether anything was
    /// actually stopped.
    pub async fn stop(&self, recording_id: &str, user_id: &str) -> Result<bool, ContainerError> {
        let containers = self
            .runtime
            .list(&[APP_LABEL, (USER_LABEL, user_id)])
            .await?;

        let mut stopped = false;
        for container in containers {
            let belongs = container
                .labels
                .get(RECORDING_LABEL)
                .is_none_or(|label| label == recording_id);
            if !belongs {
                continue;
            }
            if self.runtime.kill(&container.id).await? {
                tracing::info!(
                    recording_id,
                    user_id,
                    container_id = %container.id,
                    container = container.name.as_deref().unwrap_or("-"),
                    "Recorder container stopped"
                );
                stopped = true;
            }
        }
        Ok(stopped)
    }

    /// Stop a specific container started by this process.
    pub async fn stop_handle(&self, handle: &RecorderHandle) -> Result<bool, ContainerError> {
        self.runtime.kill(&handle.id).await
    }

    pub fn logs(&self, handle: &RecorderHandle) -> LogStream {
        self.runtime.logs(&handle.id)
    }

    pub async fn wait(&self, handle: &RecorderHandle) -> Result<i64, ContainerError> {
        self.runtime.wait(&handle.id).await
    }

    async fn ensure_image(&self) -> Result<(), ContainerError> {
        let image = &self.config.image;
        if self.runtime.image_present(image).await? {
            return Ok(());
        }
        tracing::info!(image = %image, "Recorder image not present locally, pulling");
        self.runtime.pull_image(image).await?;
        tracing::info!(image = %image, "Recorder image pulled");
        Ok(())
    }

    fn container_spec(&self, job: &JoinJob, file_name: &str, now: DateTime<Utc>) -> ContainerSpec {
        let mut labels = HashMap::new();
        labels.insert(APP_LABEL.0.to_string(), APP_LABEL.1.to_string());
        labels.insert(USER_LABEL.to_string(), job.user_id.clone());
        labels.insert(RECORDING_LABEL.to_string(), job.recording_id.clone());

        ContainerSpec {
            name: container_name(&job.user_id, now),
            image: self.config.image.clone(),
            cmd: vec![
                job.link.clone(),
                display_name(&job.user_name),
                job.max_duration_mins.to_string(),
                "--filename".to_string(),
                file_name.to_string(),
            ],
            env: vec![format!("DURATION_MINUTES={}", job.max_duration_mins)],
            labels,
            memory_bytes: RECORDER_MEMORY_LIMIT_BYTES,
            binds: vec![self.config.recordings_bind()],
            auto_remove: true,
            // The recorder's browser and audio stack need the host IPC namespace.
            host_ipc: true,
        }
    }
}

/// Deterministic container name from the user id and creation time.
pub fn container_name(user_id: &str, now: DateTime<Utc>) -> String {
    let user: String = user_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("recorder-{}-{}", user, now.timestamp_millis())
}

/// Name the recorder shows when joining the meeting.
pub fn display_name(user_name: &str) -> String {
    let user_name = user_name.trim();
    if user_name.is_empty() {
        "Notetaker".to_string()
    } else {
        format!("{user_name} Notetaker")
    }
}
