//! Codebox: short-lived, resource-bounded sandboxed runs of project code.
//!
//! A client connects over WebSocket and sends `start`, `stdin` and `stop`
//! commands for a project. Each project has at most one live sandbox, a
//! Docker or Podman container named after the project, whose combined output
//! is relayed back to every connection following that project.

pub mod api;
pub mod container;
pub mod language;
pub mod project;
pub mod sandbox;
pub mod session;
pub mod ws;
