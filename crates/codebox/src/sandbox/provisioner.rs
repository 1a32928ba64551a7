//! Sandbox creation.

use std::path::PathBuf;
use std::sync::Arc;

use log::info;

use super::policy::{CpuAllocator, ResourcePolicy};
use crate::container::{ContainerConfig, ContainerError, ContainerResult, ContainerRuntimeApi};
use crate::language::TagResolver;

/// Label carrying the project a sandbox belongs to.
pub const PROJECT_LABEL: &str = "codebox.project";
/// Label carrying the language a sandbox runs.
pub const LANGUAGE_LABEL: &str = "codebox.language";

/// Reference to a created sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    /// Container name, always the project id.
    pub name: String,
    /// Id reported by the runtime.
    pub id: String,
}

/// Creates isolated, resource-bounded sandboxes for project code.
pub struct Provisioner {
    runtime: Arc<dyn ContainerRuntimeApi>,
    policy: ResourcePolicy,
    tags: Arc<dyn TagResolver>,
    cpu: Arc<dyn CpuAllocator>,
    workspace_root: PathBuf,
}

impl Provisioner {
    pub fn new(
        runtime: Arc<dyn ContainerRuntimeApi>,
        policy: ResourcePolicy,
        tags: Arc<dyn TagResolver>,
        cpu: Arc<dyn CpuAllocator>,
        workspace_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runtime,
            policy,
            tags,
            cpu,
            workspace_root: workspace_root.into(),
        }
    }

    /// Container config for a project's sandbox given a CPU budget.
    pub fn build_config(
        &self,
        project_id: &str,
        language: &str,
        cpus: f64,
    ) -> ContainerResult<ContainerConfig> {
        let image = self.tags.image_for(language).ok_or_else(|| {
            ContainerError::InvalidInput(format!("no image for language '{}'", language))
        })?;
        let run = self.tags.command_for(language).ok_or_else(|| {
            ContainerError::InvalidInput(format!("no command for language '{}'", language))
        })?;

        // `timeout` is the entrypoint so the sandbox ends itself at the deadline.
        let mut command = vec![
            "-s".to_string(),
            "KILL".to_string(),
            self.policy.timeout_arg(),
        ];
        command.extend(run);

        let host_dir = self.workspace_root.join(project_id);

        Ok(ContainerConfig::new(image)
            .name(project_id)
            .interactive(true)
            .network_mode("none")
            .volume(host_dir.to_string_lossy(), &self.policy.workdir)
            .workdir(&self.policy.workdir)
            .env("PYTHONUNBUFFERED", "1")
            .label(PROJECT_LABEL, project_id)
            .label(LANGUAGE_LABEL, language)
            .entrypoint("timeout")
            .command(command)
            .limits(self.policy.limits(cpus)))
    }

    /// Create and start the sandbox for `project_id`.
    pub async fn create(&self, project_id: &str, language: &str) -> ContainerResult<SandboxHandle> {
        let cpus = self.cpu.allocate().await;
        let config = self.build_config(project_id, language, cpus)?;
        let id = self.runtime.create_container(&config).await?;

        info!(
            "Created sandbox {} ({}) with {:.2} cpus",
            project_id, language, cpus
        );
        Ok(SandboxHandle {
            name: project_id.to_string(),
            id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerRuntime;
    use crate::language::LanguageCatalog;
    use crate::sandbox::policy::FixedCpuAllocator;

    fn provisioner(policy: ResourcePolicy) -> Provisioner {
        Provisioner::new(
            Arc::new(ContainerRuntime::with_type(Default::default())),
            policy,
            Arc::new(LanguageCatalog::default()),
            Arc::new(FixedCpuAllocator::new(0.5)),
            "/srv/codebox/ws",
        )
    }

    #[test]
    fn test_config_wraps_command_in_timeout() {
        let config = provisioner(ResourcePolicy::default())
            .build_config("abc", "python", 0.5)
            .unwrap();

        assert_eq!(config.name.as_deref(), Some("abc"));
        assert_eq!(config.image, "python:3.12-slim");
        assert_eq!(config.entrypoint.as_deref(), Some("timeout"));
        assert_eq!(
            config.command,
            ["-s", "KILL", "900", "python3", "-u", "main.py"]
        );
        assert!(config.interactive);
        assert_eq!(config.network_mode.as_deref(), Some("none"));
        assert_eq!(config.workdir.as_deref(), Some("/code"));
        assert_eq!(
            config.volumes,
            vec![("/srv/codebox/ws/abc".to_string(), "/code".to_string())]
        );
        assert_eq!(config.labels.get(PROJECT_LABEL).map(String::as_str), Some("abc"));
    }

    #[test]
    fn test_config_carries_policy_limits() {
        let policy = ResourcePolicy {
            timeout_minutes: 2,
            ..ResourcePolicy::default()
        };
        let config = provisioner(policy).build_config("abc", "node", 0.3).unwrap();

        assert_eq!(config.command[2], "120");
        assert_eq!(config.limits.memory_bytes, Some(104_857_600));
        assert_eq!(config.limits.pids_limit, Some(25));
        assert_eq!(config.limits.disk_bytes, Some(52_428_800));
        assert_eq!(config.limits.cpus, Some(0.3));
    }

    #[test]
    fn test_unknown_language_is_rejected() {
        let err = provisioner(ResourcePolicy::default())
            .build_config("abc", "cobol", 0.5)
            .unwrap_err();
        assert!(matches!(err, ContainerError::InvalidInput(_)));
    }
}
