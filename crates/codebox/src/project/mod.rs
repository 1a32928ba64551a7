//! Project source code: fetching it into a sandbox workspace and persisting
//! the changes a run made.

mod store;

pub use store::LocalCodeStore;

use async_trait::async_trait;
use thiserror::Error;

/// Result type for code store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// No source exists for the project.
    #[error("project source not found: {0}")]
    NotFound(String),

    /// Identifier cannot be used as a path component.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("copy task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Fetches and persists project code around a run.
#[async_trait]
pub trait CodeStore: Send + Sync {
    /// Materialise the latest code of the project in its workspace.
    async fn clone_code(&self, project_id: &str, school_id: &str) -> StoreResult<()>;

    /// Persist the workspace after a run.
    async fn save_changes(&self, project_id: &str, school_id: &str) -> StoreResult<()>;
}
