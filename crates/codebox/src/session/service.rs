//! Session dispatcher: turns client commands into sandbox lifecycle steps.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use codebox_protocol::commands::present;
use codebox_protocol::{ClientCommand, RunEvent, StartRequest, StdinRequest, StopRequest};
use dashmap::DashMap;
use futures::future::join_all;
use log::{debug, error, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::error::{SessionError, SessionResult};
use super::registry::{SessionInfo, SessionRegistry, SessionStatus};
use crate::container::{ContainerRuntimeApi, validate_container_name};
use crate::language::{LanguageValidator, TagResolver};
use crate::project::CodeStore;
use crate::sandbox::{
    CpuAllocator, Provisioner, ResourcePolicy, StdinChannel, StreamRelay, Teardown,
    TeardownOutcome,
};
use crate::ws::{ConnectionId, WsHub};

/// Acknowledgement sent to the caller of a valid `start`.
pub const STARTING_MESSAGE: &str = "Starting...";
/// Sent to subscribers once the sandbox is up.
pub const CREATED_MESSAGE: &str = "Container created! Mounting...";

/// Settings of the session service.
#[derive(Debug, Clone)]
pub struct SessionServiceConfig {
    pub policy: ResourcePolicy,
    /// Host directory holding one workspace per project.
    pub workspace_root: PathBuf,
    /// How long a replacing `start` waits for the previous run to wrap up.
    pub replace_grace: Duration,
}

/// Runs sessions for client connections.
pub struct SessionService {
    hub: Arc<WsHub>,
    registry: Arc<SessionRegistry>,
    store: Arc<dyn CodeStore>,
    languages: Arc<dyn LanguageValidator>,
    provisioner: Provisioner,
    relay: StreamRelay,
    stdin: StdinChannel,
    teardown: Teardown,
    replace_grace: Duration,
    /// Serialises the fetch/replace/register phase of `start`s per project.
    start_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Latest pending `start` of each connection.
    start_tickets: DashMap<ConnectionId, u64>,
    next_ticket: AtomicU64,
}

impl SessionService {
    pub fn new<L>(
        runtime: Arc<dyn ContainerRuntimeApi>,
        hub: Arc<WsHub>,
        store: Arc<dyn CodeStore>,
        languages: Arc<L>,
        config: SessionServiceConfig,
    ) -> Self
    where
        L: TagResolver + LanguageValidator + 'static,
    {
        let cpu = config.policy.cpu_allocator();
        Self::with_cpu_allocator(runtime, hub, store, languages, cpu, config)
    }

    pub fn with_cpu_allocator<L>(
        runtime: Arc<dyn ContainerRuntimeApi>,
        hub: Arc<WsHub>,
        store: Arc<dyn CodeStore>,
        languages: Arc<L>,
        cpu: Arc<dyn CpuAllocator>,
        config: SessionServiceConfig,
    ) -> Self
    where
        L: TagResolver + LanguageValidator + 'static,
    {
        let teardown = Teardown::new(runtime.clone(), config.policy.stop_signal.clone());
        let tags: Arc<dyn TagResolver> = languages.clone();
        let provisioner = Provisioner::new(
            runtime.clone(),
            config.policy,
            tags,
            cpu,
            config.workspace_root,
        );
        let relay = StreamRelay::new(runtime.clone(), hub.clone(), teardown.clone(), store.clone());

        Self {
            hub,
            registry: Arc::new(SessionRegistry::new()),
            store,
            languages,
            provisioner,
            relay,
            stdin: StdinChannel::new(runtime),
            teardown,
            replace_grace: config.replace_grace,
            start_locks: DashMap::new(),
            start_tickets: DashMap::new(),
            next_ticket: AtomicU64::new(1),
        }
    }

    pub fn hub(&self) -> &Arc<WsHub> {
        &self.hub
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.registry.list()
    }

    /// Handle one command from a connection, replying to it on failure.
    pub async fn handle_command(self: &Arc<Self>, conn: ConnectionId, command: ClientCommand) {
        let result = match command {
            ClientCommand::Start(req) => self.start(conn, req).await.map(drop),
            ClientCommand::Stdin(req) => self.stdin(req).map(drop),
            ClientCommand::Stop(req) => self.stop(conn, req).await.map(drop),
        };

        if let Err(e) = result {
            warn!("Command from connection {} rejected: {}", conn, e);
            self.hub.send_to_connection(conn, e.to_event()).await;
        }
    }

    /// Start a run of a project, replacing any run already live for it.
    ///
    /// Only validation and the acknowledgement happen before this returns.
    /// The returned task fetches the code, replaces the previous run, then
    /// provisions the sandbox and relays its output until the run ends.
    pub async fn start(
        self: &Arc<Self>,
        conn: ConnectionId,
        req: StartRequest,
    ) -> SessionResult<JoinHandle<()>> {
        let (project_id, language, school_id) = self.validate_start(&req)?;

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        self.start_tickets.insert(conn, ticket);

        self.hub
            .send_to_connection(conn, RunEvent::progress(STARTING_MESSAGE))
            .await;

        let service = Arc::clone(self);
        let project_id = project_id.to_string();
        let school_id = school_id.to_string();
        let language = language.to_string();
        Ok(tokio::spawn(async move {
            service
                .launch(conn, ticket, project_id, school_id, language)
                .await
        }))
    }

    /// Queue one write of client input to a project's sandbox.
    pub fn stdin(&self, req: StdinRequest) -> SessionResult<JoinHandle<()>> {
        let (Some(project_id), Some(data)) = (present(&req.project_id), present(&req.stdin)) else {
            return Err(SessionError::InvalidRequest(
                "stdin needs projectId and stdin".to_string(),
            ));
        };
        Ok(self.stdin.send(project_id, data.to_string()))
    }

    /// Tear down a project's sandbox and acknowledge without waiting for it.
    pub async fn stop(
        &self,
        conn: ConnectionId,
        req: StopRequest,
    ) -> SessionResult<JoinHandle<TeardownOutcome>> {
        let Some(project_id) = present(&req.project_id) else {
            return Err(SessionError::InvalidRequest("stop needs projectId".to_string()));
        };

        let teardown = self.teardown.clone();
        let name = project_id.to_string();
        let task = tokio::spawn(async move { teardown.stop(&name).await });

        info!("Stop of {} requested by connection {}", project_id, conn);
        self.hub.send_to_connection(conn, RunEvent::ended()).await;
        Ok(task)
    }

    /// Tear down every live session and wait for their runs to finish.
    pub async fn shutdown_all(&self) {
        let projects = self.registry.live_projects();
        if projects.is_empty() {
            return;
        }

        info!("Stopping {} live sessions", projects.len());
        join_all(projects.iter().map(|project_id| async move {
            self.teardown.stop(project_id).await;
            if !self
                .registry
                .wait_finished(project_id, self.replace_grace)
                .await
            {
                warn!("Session {} did not finish before shutdown", project_id);
            }
        }))
        .await;
    }

    fn validate_start<'a>(&self, req: &'a StartRequest) -> SessionResult<(&'a str, &'a str, &'a str)> {
        let (Some(project_id), Some(language), Some(school_id)) = (
            present(&req.project_id),
            present(&req.language),
            present(&req.school_id),
        ) else {
            return Err(SessionError::InvalidRequest(
                "start needs projectId, language and schoolId".to_string(),
            ));
        };

        if !self.languages.is_supported(language) {
            return Err(SessionError::InvalidRequest(format!(
                "unsupported language '{}'",
                language
            )));
        }

        validate_container_name(project_id)
            .map_err(|e| SessionError::InvalidRequest(e.to_string()))?;

        Ok((project_id, language, school_id))
    }

    async fn launch(
        self: Arc<Self>,
        conn: ConnectionId,
        ticket: u64,
        project_id: String,
        school_id: String,
        language: String,
    ) {
        let prepared = self
            .prepare(conn, ticket, &project_id, &school_id, &language)
            .await;
        self.start_tickets.remove_if(&conn, |_, t| *t == ticket);

        match prepared {
            Ok(generation) => {
                self.run_session(project_id, school_id, language, generation)
                    .await
            }
            Err(e) => {
                warn!(
                    "Start of {} for connection {} failed: {}",
                    project_id, conn, e
                );
                self.hub.send_to_connection(conn, e.to_event()).await;
            }
        }
    }

    /// Fetch the code, replace the previous run and register the new one,
    /// one `start` per project at a time.
    async fn prepare(
        &self,
        conn: ConnectionId,
        ticket: u64,
        project_id: &str,
        school_id: &str,
        language: &str,
    ) -> SessionResult<Uuid> {
        let lock = self
            .start_locks
            .entry(project_id.to_string())
            .or_default()
            .clone();

        let result = {
            let _guard = lock.lock().await;
            self.prepare_locked(conn, ticket, project_id, school_id, language)
                .await
        };

        drop(lock);
        self.start_locks
            .remove_if(project_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn prepare_locked(
        &self,
        conn: ConnectionId,
        ticket: u64,
        project_id: &str,
        school_id: &str,
        language: &str,
    ) -> SessionResult<Uuid> {
        self.store
            .clone_code(project_id, school_id)
            .await
            .map_err(|e| SessionError::NotFound(format!("{}: {}", project_id, e)))?;

        self.replace_previous(project_id).await;

        // A later `start` from the same connection owns its subscription.
        if self
            .start_tickets
            .get(&conn)
            .is_some_and(|latest| *latest == ticket)
        {
            self.hub.join_project(conn, project_id);
        } else {
            debug!(
                "connection {} moved on before {} was registered",
                conn, project_id
            );
        }

        let generation = self.registry.begin(project_id, school_id, language);
        info!(
            "Starting {} run of {} for connection {}",
            language, project_id, conn
        );
        Ok(generation)
    }

    /// Tear down the previous sandbox of a project and let its run wrap up.
    async fn replace_previous(&self, project_id: &str) {
        // A sandbox still being created has no name to tear down yet.
        self.registry.wait_provisioned(project_id).await;
        self.teardown.stop(project_id).await;

        if self
            .registry
            .wait_finished(project_id, self.replace_grace)
            .await
        {
            return;
        }

        warn!(
            "Previous run of {} still live after {:?}, cancelling its relay",
            project_id, self.replace_grace
        );
        self.registry.cancel_relay(project_id);
        if !self
            .registry
            .wait_finished(project_id, self.replace_grace)
            .await
        {
            warn!("Previous run of {} did not finish, replacing anyway", project_id);
        }
        self.teardown.stop(project_id).await;
    }

    async fn run_session(
        self: Arc<Self>,
        project_id: String,
        school_id: String,
        language: String,
        generation: Uuid,
    ) {
        match self.provisioner.create(&project_id, &language).await {
            Ok(handle) => debug!("sandbox {} has id {}", handle.name, handle.id),
            Err(e) => {
                let e = SessionError::from(e);
                error!("Provisioning {} failed: {}", project_id, e);
                self.hub.send_to_project(&project_id, e.to_event()).await;
                self.registry.finish(&project_id, generation);
                return;
            }
        }

        if !self
            .registry
            .set_status(&project_id, generation, SessionStatus::Running)
        {
            warn!(
                "Run of {} was superseded while provisioning, removing its sandbox",
                project_id
            );
            self.teardown.stop(&project_id).await;
            return;
        }

        self.hub
            .send_to_project(&project_id, RunEvent::started(CREATED_MESSAGE))
            .await;

        let registry = self.registry.clone();
        let summary = self
            .relay
            .run(&project_id, &school_id, |pump| {
                registry.attach_pump(&project_id, generation, pump)
            })
            .await;
        debug!("relay of {} ended: {:?}", project_id, summary);

        self.registry.finish(&project_id, generation);
    }
}
