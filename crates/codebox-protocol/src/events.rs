//! Event types (server -> client).

use serde::{Deserialize, Serialize};

/// Events sent from the server over a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Status, progress, or output of a project's run.
    Run(RunEvent),
}

/// Payload of a `run` event.
///
/// Absent fields are omitted from the JSON, so a bare `{"status":400}` is a
/// valid event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEvent {
    /// HTTP-like status class (200, 400, 404).
    pub status: u16,

    /// Human-readable progress narration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// One chunk of combined stdout/stderr.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,

    /// Unique id of the output chunk.
    #[serde(
        default,
        rename = "stdoutID",
        skip_serializing_if = "Option::is_none"
    )]
    pub stdout_id: Option<String>,

    /// Whether the sandbox is (still) running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,
}

impl RunEvent {
    fn status(status: u16) -> Self {
        Self {
            status,
            message: None,
            stdout: None,
            stdout_id: None,
            running: None,
        }
    }

    /// Malformed or incomplete command.
    pub fn bad_request() -> Self {
        Self::status(400)
    }

    /// Project code could not be fetched.
    pub fn not_found() -> Self {
        Self::status(404)
    }

    /// Progress narration without a running flag.
    pub fn progress(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::status(200)
        }
    }

    /// Progress narration for a sandbox that is now running.
    pub fn started(message: impl Into<String>) -> Self {
        Self {
            running: Some(true),
            ..Self::progress(message)
        }
    }

    /// The sandbox could not be provisioned.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            running: Some(false),
            ..Self::progress(message)
        }
    }

    /// One chunk of output.
    pub fn output(stdout: impl Into<String>, stdout_id: impl Into<String>) -> Self {
        Self {
            stdout: Some(stdout.into()),
            stdout_id: Some(stdout_id.into()),
            running: Some(true),
            ..Self::status(200)
        }
    }

    /// The sandbox is no longer running.
    pub fn ended() -> Self {
        Self {
            running: Some(false),
            ..Self::status(200)
        }
    }
}

impl From<RunEvent> for ServerEvent {
    fn from(event: RunEvent) -> Self {
        ServerEvent::Run(event)
    }
}
