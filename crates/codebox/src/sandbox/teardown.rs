//! Best-effort kill-then-remove of a sandbox.

use std::sync::Arc;

use log::{debug, info};

use crate::container::ContainerRuntimeApi;

/// What a teardown actually managed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TeardownOutcome {
    pub killed: bool,
    pub removed: bool,
}

/// Stops and removes sandboxes by name.
///
/// Neither step can fail from the caller's point of view: a sandbox that is
/// already stopped or gone is simply reported as not killed / not removed.
#[derive(Clone)]
pub struct Teardown {
    runtime: Arc<dyn ContainerRuntimeApi>,
    signal: String,
}

impl Teardown {
    pub fn new(runtime: Arc<dyn ContainerRuntimeApi>, signal: impl Into<String>) -> Self {
        Self {
            runtime,
            signal: signal.into(),
        }
    }

    pub async fn stop(&self, name: &str) -> TeardownOutcome {
        let killed = match self.runtime.kill_container(name, &self.signal).await {
            Ok(()) => true,
            Err(e) => {
                debug!("kill {} skipped: {}", name, e);
                false
            }
        };

        let removed = match self.runtime.remove_container(name, true).await {
            Ok(()) => true,
            Err(e) => {
                debug!("remove {} skipped: {}", name, e);
                false
            }
        };

        if killed || removed {
            info!(
                "Tore down sandbox {} (killed: {}, removed: {})",
                name, killed, removed
            );
        }

        TeardownOutcome { killed, removed }
    }
}
