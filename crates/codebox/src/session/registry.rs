//! In-memory table of live sessions, keyed by project id.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use uuid::Uuid;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Provisioning,
    Running,
    Terminated,
}

/// Session summary for the `/sessions` listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub project_id: String,
    pub school_id: String,
    pub language: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
}

struct SessionEntry {
    generation: Uuid,
    school_id: String,
    language: String,
    started_at: DateTime<Utc>,
    status: watch::Sender<SessionStatus>,
    pump: Option<AbortHandle>,
}

/// Live sessions. Every mutation names the generation it belongs to, so a
/// finishing run never clears the entry of the run that replaced it.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionEntry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new run of `project_id` and return its generation.
    pub fn begin(&self, project_id: &str, school_id: &str, language: &str) -> Uuid {
        let generation = Uuid::new_v4();
        let (status, _) = watch::channel(SessionStatus::Provisioning);
        self.sessions.insert(
            project_id.to_string(),
            SessionEntry {
                generation,
                school_id: school_id.to_string(),
                language: language.to_string(),
                started_at: Utc::now(),
                status,
                pump: None,
            },
        );
        debug!("session {} began (generation {})", project_id, generation);
        generation
    }

    pub fn set_status(&self, project_id: &str, generation: Uuid, status: SessionStatus) -> bool {
        match self.sessions.get(project_id) {
            Some(entry) if entry.generation == generation => {
                entry.status.send_replace(status);
                true
            }
            _ => false,
        }
    }

    /// Remember how to cancel the run's output pump.
    pub fn attach_pump(&self, project_id: &str, generation: Uuid, pump: AbortHandle) {
        if let Some(mut entry) = self.sessions.get_mut(project_id)
            && entry.generation == generation
        {
            entry.pump = Some(pump);
        }
    }

    /// Mark a run terminated and drop its entry.
    pub fn finish(&self, project_id: &str, generation: Uuid) {
        let removed = self
            .sessions
            .remove_if(project_id, |_, entry| entry.generation == generation);
        if let Some((_, entry)) = removed {
            entry.status.send_replace(SessionStatus::Terminated);
            debug!("session {} finished (generation {})", project_id, generation);
        }
    }

    /// Wait up to `grace` for the current run of `project_id` to finish.
    ///
    /// Returns `false` if it was still live when the grace period ran out.
    pub async fn wait_finished(&self, project_id: &str, grace: Duration) -> bool {
        let mut rx = match self.sessions.get(project_id) {
            Some(entry) => entry.status.subscribe(),
            None => return true,
        };

        let finished = rx.wait_for(|status| *status == SessionStatus::Terminated);
        match tokio::time::timeout(grace, finished).await {
            Ok(_) => true,
            Err(_) => false,
        }
    }

    /// Wait until the current run of `project_id` is no longer provisioning.
    ///
    /// Creation is not cancellable, so there is no deadline here.
    pub async fn wait_provisioned(&self, project_id: &str) {
        let mut rx = match self.sessions.get(project_id) {
            Some(entry) => entry.status.subscribe(),
            None => return,
        };

        let _ = rx
            .wait_for(|status| *status != SessionStatus::Provisioning)
            .await;
    }

    /// Abort the output pump of the current run, if one is attached.
    pub fn cancel_relay(&self, project_id: &str) -> bool {
        let pump = self
            .sessions
            .get(project_id)
            .and_then(|entry| entry.pump.clone());
        match pump {
            Some(pump) => {
                pump.abort();
                true
            }
            None => false,
        }
    }

    pub fn status(&self, project_id: &str) -> Option<SessionStatus> {
        self.sessions
            .get(project_id)
            .map(|entry| *entry.status.borrow())
    }

    pub fn generation(&self, project_id: &str) -> Option<Uuid> {
        self.sessions.get(project_id).map(|entry| entry.generation)
    }

    pub fn live_projects(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|entry| SessionInfo {
                project_id: entry.key().clone(),
                school_id: entry.school_id.clone(),
                language: entry.language.clone(),
                status: *entry.status.borrow(),
                started_at: entry.started_at,
            })
            .collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_and_list() {
        let registry = SessionRegistry::new();
        registry.begin("abc", "s1", "python");

        let sessions = registry.list();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].project_id, "abc");
        assert_eq!(sessions[0].status, SessionStatus::Provisioning);

        let json = serde_json::to_value(&sessions[0]).unwrap();
        assert_eq!(json["projectId"], "abc");
        assert_eq!(json["schoolId"], "s1");
        assert_eq!(json["status"], "provisioning");
        assert!(json.get("startedAt").is_some());
    }

    #[test]
    fn test_stale_generation_cannot_finish_replacement() {
        let registry = SessionRegistry::new();
        let old = registry.begin("abc", "s1", "python");
        let new = registry.begin("abc", "s1", "python");

        registry.finish("abc", old);
        assert_eq!(registry.generation("abc"), Some(new));
        assert!(!registry.set_status("abc", old, SessionStatus::Running));

        registry.finish("abc", new);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_wait_finished() {
        let registry = std::sync::Arc::new(SessionRegistry::new());
        assert!(registry.wait_finished("none", Duration::from_millis(10)).await);

        let generation = registry.begin("abc", "s1", "python");
        assert!(!registry.wait_finished("abc", Duration::from_millis(20)).await);

        let r = registry.clone();
        let waiter =
            tokio::spawn(async move { r.wait_finished("abc", Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.finish("abc", generation);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_provisioned_returns_once_running() {
        let registry = std::sync::Arc::new(SessionRegistry::new());
        registry.wait_provisioned("none").await;

        let generation = registry.begin("abc", "s1", "python");
        let r = registry.clone();
        let waiter = tokio::spawn(async move { r.wait_provisioned("abc").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        registry.set_status("abc", generation, SessionStatus::Running);
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_relay_aborts_pump() {
        let registry = SessionRegistry::new();
        let generation = registry.begin("abc", "s1", "python");
        assert!(!registry.cancel_relay("abc"));

        let pump = tokio::spawn(std::future::pending::<()>());
        registry.attach_pump("abc", generation, pump.abort_handle());
        assert!(registry.cancel_relay("abc"));
        assert!(pump.await.unwrap_err().is_cancelled());
    }
}
