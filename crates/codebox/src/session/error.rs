//! Session command errors.

use codebox_protocol::RunEvent;
use thiserror::Error;

use crate::container::ContainerError;

/// Result type for session commands.
pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Missing or invalid command fields.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Project code could not be fetched.
    #[error("not found: {0}")]
    NotFound(String),

    /// The sandbox could not be created.
    #[error("failed to create sandbox: {0}")]
    Provision(#[from] ContainerError),
}

impl SessionError {
    /// Numeric class of the error.
    pub fn status_code(&self) -> u16 {
        match self {
            SessionError::InvalidRequest(_) => 400,
            SessionError::NotFound(_) => 404,
            SessionError::Provision(_) => 500,
        }
    }

    /// Event reporting this error to a client.
    ///
    /// Provisioning failures go out as a regular run event that ends the
    /// session, carrying the reason as its message.
    pub fn to_event(&self) -> RunEvent {
        match self {
            SessionError::InvalidRequest(_) => RunEvent::bad_request(),
            SessionError::NotFound(_) => RunEvent::not_found(),
            SessionError::Provision(e) => RunEvent::failed(format!("Failed to start: {}", e)),
        }
    }
}
