//! Execution sessions: one live sandbox per project and the clients following it.

mod error;
mod registry;
mod service;

pub use error::{SessionError, SessionResult};
pub use registry::{SessionInfo, SessionRegistry, SessionStatus};
pub use service::{
    CREATED_MESSAGE, STARTING_MESSAGE, SessionService, SessionServiceConfig,
};
