//! Client input injection into running sandboxes.

use std::sync::Arc;

use log::{debug, warn};
use tokio::task::JoinHandle;

use crate::container::ContainerRuntimeApi;

/// Writes discrete chunks of client input to a sandbox's stdin.
#[derive(Clone)]
pub struct StdinChannel {
    runtime: Arc<dyn ContainerRuntimeApi>,
}

impl StdinChannel {
    pub fn new(runtime: Arc<dyn ContainerRuntimeApi>) -> Self {
        Self { runtime }
    }

    /// Write in the background so the caller's command loop keeps going.
    pub fn send(&self, project_id: &str, data: String) -> JoinHandle<()> {
        let channel = self.clone();
        let project_id = project_id.to_string();
        tokio::spawn(async move { channel.write(&project_id, data.as_bytes()).await })
    }

    /// Single write to the sandbox named `project_id`; absent sandboxes are skipped.
    pub async fn write(&self, project_id: &str, data: &[u8]) {
        match self.runtime.container_state_status(project_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!("stdin for {} dropped: no sandbox", project_id);
                return;
            }
            Err(e) => {
                warn!("stdin for {} dropped: lookup failed: {}", project_id, e);
                return;
            }
        }

        match self.runtime.write_stdin(project_id, data).await {
            Ok(()) => debug!("wrote {} bytes to stdin of {}", data.len(), project_id),
            Err(e) => warn!("stdin write to {} failed: {}", project_id, e),
        }
    }
}
