//! Recorder containers.
//!
//! [`ContainerRuntime`] is the seam over the container engine; the Docker
//! implementation lives in [`docker`]. [`manager::ContainerManager`] applies
//! the admission limits and knows how a recorder container is shaped.

pub mod docker;
pub mod manager;

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::ContainerError;

pub use docker::DockerRuntime;
pub use manager::{ContainerManager, RecorderHandle};

/// Label every recorder container carries, for global enumeration.
pub const APP_LABEL: (&str, &str) = ("app", "meet-recorder");
/// Label key holding the owning user's id.
pub const USER_LABEL: &str = "user-id";
/// Label key holding the recording id the container was started for.
pub const RECORDING_LABEL: &str = "recording-id";
/// Where the shared recordings directory is mounted inside the container.
pub const RECORDINGS_MOUNT: &str = "/app/recordings";

/// A container as listed by the runtime.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: Option<String>,
    pub labels: HashMap<String, String>,
}

/// Everything needed to create a container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub memory_bytes: i64,
    pub binds: Vec<String>,
    pub auto_remove: bool,
    pub host_ipc: bool,
}

/// Combined stdout/stderr output, in arbitrary chunks.
pub type LogStream = BoxStream<'static, Result<Bytes, ContainerError>>;

/// Operations on the container engine.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Running containers carrying every `(key, value)` label given.
    async fn list(&self, labels: &[(&str, &str)]) -> Result<Vec<ContainerInfo>, ContainerError>;

    async fn image_present(&self, image: &str) -> Result<bool, ContainerError>;

    /// Pull `image`, returning once the pull has finished.
    async fn pull_image(&self, image: &str) -> Result<(), ContainerError>;

    /// Create a container and return its id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, ContainerError>;

    async fn start(&self, id: &str) -> Result<(), ContainerError>;

    /// Force-stop a container. `Ok(false)` if it was already gone or stopped.
    async fn kill(&self, id: &str) -> Result<bool, ContainerError>;

    /// Remove a container that never started.
    async fn remove(&self, id: &str) -> Result<(), ContainerError>;

    /// Follow the container's output until it exits.
    fn logs(&self, id: &str) -> LogStream;

    /// Wait for the container to exit and return its exit code.
    async fn wait(&self, id: &str) -> Result<i64, ContainerError>;
}
