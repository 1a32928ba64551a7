//! Test utilities: an in-memory container runtime, a counting code store,
//! and a fully wired session service.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use bytes::Bytes;
use codebox::api;
use codebox::container::{
    ContainerConfig, ContainerError, ContainerResult, ContainerRuntimeApi, OutputStream,
};
use codebox::language::LanguageCatalog;
use codebox::project::{CodeStore, StoreError, StoreResult};
use codebox::sandbox::ResourcePolicy;
use codebox::session::{SessionService, SessionServiceConfig};
use codebox::ws::WsHub;
use codebox_protocol::{RunEvent, ServerEvent, StartRequest};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

type OutputTx = mpsc::UnboundedSender<ContainerResult<Bytes>>;
type OutputRx = mpsc::UnboundedReceiver<ContainerResult<Bytes>>;

#[derive(Default)]
struct FakeState {
    /// Containers that exist (running or exited).
    live: HashSet<String>,
    running: HashSet<String>,
    created: Vec<ContainerConfig>,
    kills: Vec<String>,
    removals: Vec<String>,
    stdin: Vec<(String, Vec<u8>)>,
    outputs: HashMap<String, OutputTx>,
    pending_output: HashMap<String, OutputRx>,
    max_live: usize,
    fail_create: bool,
    create_delay: Option<Duration>,
}

/// Container runtime that keeps containers in memory.
///
/// Output written with [`FakeRuntime::emit`] is buffered until the relay
/// follows it; the stream closes on [`FakeRuntime::exit`], kill, or removal.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_create(&self, fail: bool) {
        self.state.lock().unwrap().fail_create = fail;
    }

    /// Make every container creation take `delay` before it lands.
    pub fn slow_create(&self, delay: Duration) {
        self.state.lock().unwrap().create_delay = Some(delay);
    }

    pub fn emit(&self, name: &str, text: &str) {
        let state = self.state.lock().unwrap();
        let tx = state.outputs.get(name).expect("no output stream for container");
        tx.send(Ok(Bytes::copy_from_slice(text.as_bytes()))).unwrap();
    }

    /// The process inside the container exits on its own.
    pub fn exit(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.running.remove(name);
        state.outputs.remove(name);
    }

    pub fn live(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().unwrap().live.iter().cloned().collect();
        names.sort();
        names
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.state.lock().unwrap().running.contains(name)
    }

    /// Highest number of containers that ever existed at the same time.
    pub fn max_live(&self) -> usize {
        self.state.lock().unwrap().max_live
    }

    pub fn created(&self) -> Vec<ContainerConfig> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn kills(&self, name: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .kills
            .iter()
            .filter(|n| *n == name)
            .count()
    }

    pub fn removals(&self, name: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .removals
            .iter()
            .filter(|n| *n == name)
            .count()
    }

    pub fn stdin_writes(&self) -> Vec<(String, String)> {
        self.state
            .lock()
            .unwrap()
            .stdin
            .iter()
            .map(|(name, data)| (name.clone(), String::from_utf8_lossy(data).into_owned()))
            .collect()
    }

    fn missing(command: &str, name: &str) -> ContainerError {
        ContainerError::CommandFailed {
            command: command.to_string(),
            message: format!("No such container: {}", name),
        }
    }
}

#[async_trait]
impl ContainerRuntimeApi for FakeRuntime {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;
        let name = config.name.clone().unwrap_or_default();

        let delay = self.state.lock().unwrap().create_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if state.fail_create {
            return Err(ContainerError::CommandFailed {
                command: "run".to_string(),
                message: "image not found".to_string(),
            });
        }
        if state.live.contains(&name) {
            return Err(ContainerError::CommandFailed {
                command: "run".to_string(),
                message: format!("name {} is already in use", name),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.live.insert(name.clone());
        state.running.insert(name.clone());
        state.outputs.insert(name.clone(), tx);
        state.pending_output.insert(name.clone(), rx);
        state.created.push(config.clone());
        state.max_live = state.max_live.max(state.live.len());
        Ok(format!("id-{}", name))
    }

    async fn kill_container(&self, name: &str, _signal: &str) -> ContainerResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.running.remove(name) {
            return Err(Self::missing("kill", name));
        }
        state.outputs.remove(name);
        state.kills.push(name.to_string());
        Ok(())
    }

    async fn remove_container(&self, name: &str, _force: bool) -> ContainerResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.live.remove(name) {
            return Err(Self::missing("rm", name));
        }
        state.running.remove(name);
        state.outputs.remove(name);
        state.pending_output.remove(name);
        state.removals.push(name.to_string());
        Ok(())
    }

    async fn container_state_status(&self, name: &str) -> ContainerResult<Option<String>> {
        let state = self.state.lock().unwrap();
        Ok(if state.running.contains(name) {
            Some("running".to_string())
        } else if state.live.contains(name) {
            Some("exited".to_string())
        } else {
            None
        })
    }

    async fn follow_output(&self, name: &str) -> ContainerResult<OutputStream> {
        let rx = self
            .state
            .lock()
            .unwrap()
            .pending_output
            .remove(name)
            .ok_or_else(|| Self::missing("logs", name))?;
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn write_stdin(&self, name: &str, data: &[u8]) -> ContainerResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.running.contains(name) {
            return Err(Self::missing("attach", name));
        }
        state.stdin.push((name.to_string(), data.to_vec()));
        Ok(())
    }
}

/// Code store that records calls instead of touching the filesystem.
#[derive(Default)]
pub struct FakeStore {
    clones: Mutex<Vec<String>>,
    saves: Mutex<Vec<String>>,
    fail_clone: Mutex<bool>,
}

impl FakeStore {
    pub fn fail_clone(&self, fail: bool) {
        *self.fail_clone.lock().unwrap() = fail;
    }

    pub fn clones(&self, project_id: &str) -> usize {
        self.clones
            .lock()
            .unwrap()
            .iter()
            .filter(|p| *p == project_id)
            .count()
    }

    pub fn saves(&self, project_id: &str) -> usize {
        self.saves
            .lock()
            .unwrap()
            .iter()
            .filter(|p| *p == project_id)
            .count()
    }
}

#[async_trait]
impl CodeStore for FakeStore {
    async fn clone_code(&self, project_id: &str, _school_id: &str) -> StoreResult<()> {
        if *self.fail_clone.lock().unwrap() {
            return Err(StoreError::NotFound(project_id.to_string()));
        }
        self.clones.lock().unwrap().push(project_id.to_string());
        Ok(())
    }

    async fn save_changes(&self, project_id: &str, _school_id: &str) -> StoreResult<()> {
        self.saves.lock().unwrap().push(project_id.to_string());
        Ok(())
    }
}

/// A session service wired to fakes.
pub struct TestContext {
    pub runtime: Arc<FakeRuntime>,
    pub store: Arc<FakeStore>,
    pub hub: Arc<WsHub>,
    pub service: Arc<SessionService>,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_policy(test_policy())
    }

    pub fn with_policy(policy: ResourcePolicy) -> Self {
        let runtime = Arc::new(FakeRuntime::new());
        let store = Arc::new(FakeStore::default());
        let hub = Arc::new(WsHub::new());
        let service = Arc::new(SessionService::new(
            runtime.clone(),
            hub.clone(),
            store.clone(),
            Arc::new(LanguageCatalog::default()),
            SessionServiceConfig {
                policy,
                workspace_root: "/srv/codebox/workspaces".into(),
                replace_grace: Duration::from_secs(2),
            },
        ));
        Self {
            runtime,
            store,
            hub,
            service,
        }
    }

    pub fn router(&self) -> Router {
        api::create_router(api::AppState::new(self.service.clone()))
    }
}

/// Default policy with a fixed CPU budget so tests do not read host load.
pub fn test_policy() -> ResourcePolicy {
    ResourcePolicy {
        cpus: Some(0.5),
        ..ResourcePolicy::default()
    }
}

pub fn start_request(project_id: &str, language: &str, school_id: &str) -> StartRequest {
    StartRequest {
        project_id: Some(project_id.to_string()),
        language: Some(language.to_string()),
        school_id: Some(school_id.to_string()),
    }
}

/// Next run event on a connection, failing the test after a timeout.
pub async fn next_event(rx: &mut mpsc::Receiver<ServerEvent>) -> RunEvent {
    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("connection closed");
    match event {
        ServerEvent::Run(run) => run,
    }
}

/// Skip events until one matches, failing the test after a timeout.
pub async fn next_matching(
    rx: &mut mpsc::Receiver<ServerEvent>,
    mut pred: impl FnMut(&RunEvent) -> bool,
) -> RunEvent {
    loop {
        let event = next_event(rx).await;
        if pred(&event) {
            return event;
        }
    }
}

/// Poll `cond` until it holds, failing the test after a timeout.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
