//! Output relay: sandbox output stream -> project subscribers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use codebox_protocol::RunEvent;
use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::task::AbortHandle;
use uuid::Uuid;

use super::teardown::{Teardown, TeardownOutcome};
use crate::container::ContainerRuntimeApi;
use crate::project::CodeStore;
use crate::ws::WsHub;

/// How a relay ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySummary {
    /// Output events delivered.
    pub chunks: usize,
    /// The pump was aborted rather than reaching end of stream.
    pub cancelled: bool,
    pub teardown: TeardownOutcome,
}

/// Relays one sandbox's output and finalises the run when it ends.
#[derive(Clone)]
pub struct StreamRelay {
    runtime: Arc<dyn ContainerRuntimeApi>,
    hub: Arc<WsHub>,
    teardown: Teardown,
    store: Arc<dyn CodeStore>,
}

impl StreamRelay {
    pub fn new(
        runtime: Arc<dyn ContainerRuntimeApi>,
        hub: Arc<WsHub>,
        teardown: Teardown,
        store: Arc<dyn CodeStore>,
    ) -> Self {
        Self {
            runtime,
            hub,
            teardown,
            store,
        }
    }

    /// Relay output of the sandbox `project_id` until its stream closes.
    ///
    /// `on_attach` receives a handle that cancels the pump. However the pump
    /// ends, the end event, teardown, and `save_changes` each happen once.
    pub async fn run(
        &self,
        project_id: &str,
        school_id: &str,
        on_attach: impl FnOnce(AbortHandle),
    ) -> RelaySummary {
        let chunks = Arc::new(AtomicUsize::new(0));
        let pump = tokio::spawn(pump(
            self.runtime.clone(),
            self.hub.clone(),
            project_id.to_string(),
            chunks.clone(),
        ));
        on_attach(pump.abort_handle());

        let cancelled = match pump.await {
            Ok(()) => false,
            Err(e) if e.is_cancelled() => {
                debug!("relay for {} cancelled", project_id);
                true
            }
            Err(e) => {
                error!("relay for {} panicked: {}", project_id, e);
                false
            }
        };

        self.hub.send_to_project(project_id, RunEvent::ended()).await;
        let teardown = self.teardown.stop(project_id).await;
        if let Err(e) = self.store.save_changes(project_id, school_id).await {
            warn!("saving changes of {} failed: {}", project_id, e);
        }

        let summary = RelaySummary {
            chunks: chunks.load(Ordering::Relaxed),
            cancelled,
            teardown,
        };
        info!(
            "Run of {} finished after {} output chunks",
            project_id, summary.chunks
        );
        summary
    }
}

async fn pump(
    runtime: Arc<dyn ContainerRuntimeApi>,
    hub: Arc<WsHub>,
    project_id: String,
    chunks: Arc<AtomicUsize>,
) {
    let mut stream = match runtime.follow_output(&project_id).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("attaching to {} failed: {}", project_id, e);
            return;
        }
    };

    let mut decoder = Utf8Carry::default();
    while let Some(item) = stream.next().await {
        match item {
            Ok(bytes) => {
                let text = decoder.push(&bytes);
                if !text.is_empty() {
                    emit(&hub, &project_id, text, &chunks).await;
                }
            }
            Err(e) => {
                debug!("output stream of {} closed with error: {}", project_id, e);
                break;
            }
        }
    }

    let rest = decoder.finish();
    if !rest.is_empty() {
        emit(&hub, &project_id, rest, &chunks).await;
    }
}

async fn emit(hub: &WsHub, project_id: &str, text: String, chunks: &AtomicUsize) {
    let id = Uuid::new_v4().to_string();
    hub.send_to_project(project_id, RunEvent::output(text, id))
        .await;
    chunks.fetch_add(1, Ordering::Relaxed);
}

/// Decodes UTF-8 across chunk boundaries, holding back an incomplete tail.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(std::str::from_utf8(&self.pending[..valid]).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
