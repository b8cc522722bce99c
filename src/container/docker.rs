//! Docker implementation of [`ContainerRuntime`] via bollard.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use futures::{StreamExt, TryStreamExt};

use crate::container::{ContainerInfo, ContainerRuntime, ContainerSpec, LogStream};
use crate::error::ContainerError;

/// Container runtime backed by a local Docker (or Podman) daemon.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using bollard's local defaults (`DOCKER_HOST` or the platform
    /// socket), falling back to the rootless and Podman sockets on Unix.
    pub async fn connect() -> Result<Self, ContainerError> {
        if let Ok(docker) = Docker::connect_with_local_defaults()
            && docker.ping().await.is_ok()
        {
            return Ok(Self { docker });
        }

        #[cfg(unix)]
        for socket in fallback_sockets() {
            if !std::path::Path::new(&socket).exists() {
                continue;
            }
            if let Ok(docker) =
                Docker::connect_with_socket(&socket, 120, bollard::API_DEFAULT_VERSION)
                && docker.ping().await.is_ok()
            {
                tracing::debug!(socket = %socket, "Connected to container runtime");
                return Ok(Self { docker });
            }
        }

        Err(ContainerError::Runtime(
            "no container runtime responded (is Docker running?)".to_string(),
        ))
    }

    /// Ping the daemon.
    pub async fn ping(&self) -> Result<(), ContainerError> {
        self.docker.ping().await.map_err(runtime_error)?;
        Ok(())
    }
}

#[cfg(unix)]
fn fallback_sockets() -> Vec<String> {
    let mut sockets = Vec::new();
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        sockets.push(format!("{runtime_dir}/docker.sock"));
        sockets.push(format!("{runtime_dir}/podman/podman.sock"));
    }
    if let Ok(home) = std::env::var("HOME") {
        sockets.push(format!("{home}/.docker/run/docker.sock"));
        sockets.push(format!("{home}/.orbstack/run/docker.sock"));
    }
    sockets
}

fn runtime_error(e: bollard::errors::Error) -> ContainerError {
    ContainerError::Runtime(e.to_string())
}

/// Status code of a daemon error response, if this is one.
fn status_code(e: &bollard::errors::Error) -> Option<u16> {
    match e {
        bollard::errors::Error::DockerResponseServerError { status_code, .. } => {
            Some(*status_code)
        }
        _ => None,
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list(&self, labels: &[(&str, &str)]) -> Result<Vec<ContainerInfo>, ContainerError> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            labels
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>(),
        );

        let options = ListContainersOptions {
            all: false,
            filters,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(runtime_error)?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                Some(ContainerInfo {
                    id,
                    name: c
                        .names
                        .and_then(|names| names.into_iter().next())
                        .map(|n| n.trim_start_matches('/').to_string()),
                    labels: c.labels.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn image_present(&self, image: &str) -> Result<bool, ContainerError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if status_code(&e) == Some(404) => Ok(false),
            Err(e) => Err(runtime_error(e)),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), ContainerError> {
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(info) = stream.try_next().await.map_err(|e| ContainerError::ImagePull {
            image: image.to_string(),
            reason: e.to_string(),
        })? {
            if let Some(status) = info.status {
                tracing::trace!(image, status = %status, "Pull progress");
            }
        }
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, ContainerError> {
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(HostConfig {
                memory: Some(spec.memory_bytes),
                binds: Some(spec.binds.clone()),
                auto_remove: Some(spec.auto_remove),
                ipc_mode: spec.host_ipc.then(|| "host".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| ContainerError::Create {
                name: spec.name.clone(),
                reason: e.to_string(),
            })?;

        for warning in &response.warnings {
            tracing::warn!(container = %spec.name, "Create warning: {}", warning);
        }

        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<(), ContainerError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| ContainerError::Start {
                id: id.to_string(),
                reason: e.to_string(),
            })
    }

    async fn kill(&self, id: &str) -> Result<bool, ContainerError> {
        match self
            .docker
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(true),
            // 404: already removed; 409: not running.
            Err(e) if matches!(status_code(&e), Some(404 | 409)) => Ok(false),
            Err(e) => Err(runtime_error(e)),
        }
    }

    async fn remove(&self, id: &str) -> Result<(), ContainerError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if status_code(&e) == Some(404) => Ok(()),
            Err(e) => Err(runtime_error(e)),
        }
    }

    fn logs(&self, id: &str) -> LogStream {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        self.docker
            .logs(id, Some(options))
            .map(|chunk| chunk.map(|output| output.into_bytes()).map_err(runtime_error))
            .boxed()
    }

    async fn wait(&self, id: &str) -> Result<i64, ContainerError> {
        let options = WaitContainerOptions {
            condition: "not-running".to_string(),
        };
        let mut stream = self.docker.wait_container(id, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports non-zero exits as an error carrying the code.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(runtime_error(e)),
            None => Err(ContainerError::Runtime(format!(
                "wait stream for {id} closed without an exit status"
            ))),
        }
    }
}
