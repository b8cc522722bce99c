//! Test doubles shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};

use crate::container::{
    APP_LABEL, ContainerInfo, ContainerRuntime, ContainerSpec, LogStream, RECORDING_LABEL,
    USER_LABEL,
};
use crate::error::ContainerError;
use crate::queue::JoinJob;

pub fn join_job(user_id: &str, recording_id: &str) -> JoinJob {
    JoinJob {
        user_id: user_id.to_string(),
        user_name: "Ada".to_string(),
        link: "https://meet.example/abc-defg-hij".to_string(),
        recording_id: recording_id.to_string(),
        title: "Standup".to_string(),
        max_duration_mins: 15,
    }
}

/// What one started container prints and how it exits.
#[derive(Debug, Clone)]
struct Run {
    lines: Vec<String>,
    exit: Result<i64, String>,
}

impl Default for Run {
    fn default() -> Self {
        Self {
            lines: Vec::new(),
            exit: Ok(0),
        }
    }
}

#[derive(Default)]
struct State {
    running: Vec<ContainerInfo>,
    image_missing: bool,
    scripts: VecDeque<Run>,
    runs: HashMap<String, Run>,
    killed: Vec<String>,
    specs: Vec<ContainerSpec>,
    fail_next_start: bool,
    before_start: Option<BoxFuture<'static, ()>>,
    next_id: usize,
    pulls: usize,
    starts: usize,
    removed: usize,
}

/// In-memory [`ContainerRuntime`] with scripted container runs.
///
/// Each created container takes the next scripted run (default: no output,
/// exit 0). Started containers show up in `list` until waited on or killed.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<State>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Queue a run that prints `lines` and exits with `exit_code`.
    pub fn script(&self, lines: &[&str], exit_code: i64) {
        self.state().scripts.push_back(Run {
            lines: lines.iter().map(|l| l.to_string()).collect(),
            exit: Ok(exit_code),
        });
    }

    /// Queue a run whose exit status cannot be observed.
    pub fn script_wait_error(&self, message: &str) {
        self.state().scripts.push_back(Run {
            lines: Vec::new(),
            exit: Err(message.to_string()),
        });
    }

    pub fn fail_next_start(&self) {
        self.state().fail_next_start = true;
    }

    /// Run `hook` during the next start, before the container shows up in
    /// `list`, the way a freshly created container is invisible to a
    /// running-only listing.
    pub fn before_start(&self, hook: impl Future<Output = ()> + Send + 'static) {
        self.state().before_start = Some(hook.boxed());
    }

    pub fn set_image_present(&self, present: bool) {
        self.state().image_missing = !present;
    }

    /// Register an already running recorder container and return its id.
    pub fn add_running(&self, user_id: &str, recording_id: &str) -> String {
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("existing-{}", state.next_id);
        let mut labels = HashMap::new();
        labels.insert(APP_LABEL.0.to_string(), APP_LABEL.1.to_string());
        labels.insert(USER_LABEL.to_string(), user_id.to_string());
        labels.insert(RECORDING_LABEL.to_string(), recording_id.to_string());
        state.running.push(ContainerInfo {
            id: id.clone(),
            name: Some(format!("recorder-{user_id}")),
            labels,
        });
        id
    }

    pub fn created(&self) -> usize {
        self.state().specs.len()
    }

    pub fn starts(&self) -> usize {
        self.state().starts
    }

    pub fn pulls(&self) -> usize {
        self.state().pulls
    }

    pub fn kills(&self) -> usize {
        self.state().killed.len()
    }

    pub fn removed(&self) -> usize {
        self.state().removed
    }

    pub fn running(&self) -> usize {
        self.state().running.len()
    }

    pub fn last_spec(&self) -> Option<ContainerSpec> {
        self.state().specs.last().cloned()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list(&self, labels: &[(&str, &str)]) -> Result<Vec<ContainerInfo>, ContainerError> {
        Ok(self
            .state()
            .running
            .iter()
            .filter(|c| {
                labels
                    .iter()
                    .all(|(k, v)| c.labels.get(*k).is_some_and(|value| value == v))
            })
            .cloned()
            .collect())
    }

    async fn image_present(&self, _image: &str) -> Result<bool, ContainerError> {
        Ok(!self.state().image_missing)
    }

    async fn pull_image(&self, _image: &str) -> Result<(), ContainerError> {
        let mut state = self.state();
        state.pulls += 1;
        state.image_missing = false;
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, ContainerError> {
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("container-{}", state.next_id);
        let run = state.scripts.pop_front().unwrap_or_default();
        state.runs.insert(id.clone(), run);
        state.specs.push(spec.clone());
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), ContainerError> {
        let hook = {
            let mut state = self.state();
            if std::mem::take(&mut state.fail_next_start) {
                return Err(ContainerError::Start {
                    id: id.to_string(),
                    reason: "scripted start failure".to_string(),
                });
            }
            state.before_start.take()
        };
        if let Some(hook) = hook {
            hook.await;
        }

        let mut state = self.state();
        state.starts += 1;
        let labels = state
            .specs
            .last()
            .map(|spec| spec.labels.clone())
            .unwrap_or_default();
        state.running.push(ContainerInfo {
            id: id.to_string(),
            name: None,
            labels,
        });
        Ok(())
    }

    async fn kill(&self, id: &str) -> Result<bool, ContainerError> {
        let mut state = self.state();
        let before = state.running.len();
        state.running.retain(|c| c.id != id);
        if state.running.len() == before {
            return Ok(false);
        }
        state.killed.push(id.to_string());
        Ok(true)
    }

    async fn remove(&self, id: &str) -> Result<(), ContainerError> {
        let mut state = self.state();
        state.runs.remove(id);
        state.removed += 1;
        Ok(())
    }

    fn logs(&self, id: &str) -> LogStream {
        let lines = self
            .state()
            .runs
            .get(id)
            .map(|run| run.lines.clone())
            .unwrap_or_default();
        futures::stream::iter(
            lines
                .into_iter()
                .map(|line| Ok(Bytes::from(format!("{line}\n")))),
        )
        .boxed()
    }

    async fn wait(&self, id: &str) -> Result<i64, ContainerError> {
        let mut state = self.state();
        let run = state.runs.remove(id).unwrap_or_default();
        state.running.retain(|c| c.id != id);
        if state.killed.iter().any(|k| k == id) {
            return Ok(137);
        }
        run.exit.map_err(ContainerError::Runtime)
    }
}
