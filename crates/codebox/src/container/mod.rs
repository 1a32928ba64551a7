//! Container runtime management module.
//!
//! Provides an async interface to manage sandbox containers via the Docker or
//! Podman CLI. The runtime is auto-detected or can be configured explicitly.

mod container;
mod error;

pub use container::{ContainerConfig, ResourceLimits, validate_container_name};
pub use error::{ContainerError, ContainerResult};

use container::validate_image_name;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::process::{Output, Stdio};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio_util::io::ReaderStream;

/// How long an attach client may linger after its input was written.
const ATTACH_SETTLE: Duration = Duration::from_secs(5);

/// Ordered stream of raw output chunks from a container.
pub type OutputStream = BoxStream<'static, ContainerResult<Bytes>>;

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Docker runtime
    #[default]
    Docker,
    /// Podman runtime
    Podman,
}

impl RuntimeType {
    /// Get the default binary name for this runtime.
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }

    /// Whether this runtime requires SELinux volume labels (:Z suffix).
    pub fn needs_selinux_labels(&self) -> bool {
        match self {
            RuntimeType::Docker => false,
            RuntimeType::Podman => true,
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.default_binary())
    }
}

/// Container runtime abstraction for testability.
///
/// Every method addresses containers by name; nothing here caches handles.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    /// Create and start a container, returning its id.
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String>;

    /// Send a signal to a running container.
    async fn kill_container(&self, name: &str, signal: &str) -> ContainerResult<()>;

    /// Remove a container.
    async fn remove_container(&self, name: &str, force: bool) -> ContainerResult<()>;

    /// State string (e.g. "running", "exited"), or `None` if the container is missing.
    async fn container_state_status(&self, name: &str) -> ContainerResult<Option<String>>;

    /// Follow the combined stdout/stderr of a container until it stops.
    async fn follow_output(&self, name: &str) -> ContainerResult<OutputStream>;

    /// Write `data` to the container's stdin once, then close the input side.
    async fn write_stdin(&self, name: &str, data: &[u8]) -> ContainerResult<()>;
}

/// Container runtime client for managing containers.
///
/// Supports both Docker and Podman with automatic detection.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    /// The runtime type (docker or podman)
    runtime_type: RuntimeType,
    /// Path to the container binary
    binary: String,
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime {
    /// Create a new container runtime with auto-detection.
    ///
    /// Prefers Docker, falls back to Podman.
    pub fn new() -> Self {
        let runtime_type = if Self::is_binary_available("docker") {
            RuntimeType::Docker
        } else if Self::is_binary_available("podman") {
            RuntimeType::Podman
        } else {
            // Will fail at runtime
            RuntimeType::Docker
        };
        Self::with_type(runtime_type)
    }

    /// Create a container runtime with a specific type.
    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self {
            binary: runtime_type.default_binary().to_string(),
            runtime_type,
        }
    }

    /// Create a container runtime with a custom binary path.
    pub fn with_binary(runtime_type: RuntimeType, binary: impl Into<String>) -> Self {
        Self {
            runtime_type,
            binary: binary.into(),
        }
    }

    /// Get the runtime type.
    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    /// Check if a binary is available in PATH.
    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Run a CLI subcommand to completion and capture its output.
    async fn exec_cli<S: AsRef<std::ffi::OsStr>>(
        &self,
        command: &str,
        args: &[S],
    ) -> ContainerResult<Output> {
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::failed(command, e.to_string()))
    }

    /// Like [`Self::exec_cli`] but turns a non-zero exit into an error.
    async fn exec_checked<S: AsRef<std::ffi::OsStr>>(
        &self,
        command: &str,
        args: &[S],
    ) -> ContainerResult<Output> {
        let output = self.exec_cli(command, args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::failed(command, stderr.trim()));
        }
        Ok(output)
    }

    /// Check if the container runtime is available and working.
    pub async fn health_check(&self) -> ContainerResult<String> {
        let output = self
            .exec_checked("version", &["version", "--format", "json"])
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Check if an image exists locally.
    pub async fn image_exists(&self, image: &str) -> ContainerResult<bool> {
        validate_image_name(image)?;

        let output = self
            .exec_cli("image inspect", &["image", "inspect", image])
            .await?;
        Ok(output.status.success())
    }

    /// Build the `run` argument list for a container config.
    pub fn run_args(&self, config: &ContainerConfig) -> Vec<String> {
        let mut args: Vec<String> = vec!["run".to_string(), "-d".to_string()];

        if config.interactive {
            args.push("-i".to_string());
        }

        if let Some(ref name) = config.name {
            args.push("--name".to_string());
            args.push(name.clone());
        }

        if let Some(ref network_mode) = config.network_mode {
            args.push("--network".to_string());
            args.push(network_mode.clone());
        }

        // Volume mounts - handle SELinux labels for Podman
        for (host, container) in &config.volumes {
            args.push("-v".to_string());
            if self.runtime_type.needs_selinux_labels() {
                args.push(format!("{}:{}:rw,Z", host, container));
            } else {
                args.push(format!("{}:{}:rw", host, container));
            }
        }

        for (key, value) in &config.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        for (key, value) in &config.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        if let Some(ref workdir) = config.workdir {
            args.push("-w".to_string());
            args.push(workdir.clone());
        }

        let limits = &config.limits;
        if let Some(memory) = limits.memory_bytes {
            args.push("--memory".to_string());
            args.push(memory.to_string());
            args.push("--memory-swap".to_string());
            args.push(memory.to_string());
        }
        if let Some(pids) = limits.pids_limit {
            args.push("--pids-limit".to_string());
            args.push(pids.to_string());
        }
        if let Some(cpus) = limits.cpus {
            args.push("--cpus".to_string());
            args.push(format!("{:.2}", cpus));
        }
        if let Some(disk) = limits.disk_bytes {
            args.push("--storage-opt".to_string());
            args.push(format!("size={}", disk));
        }

        if let Some(ref entrypoint) = config.entrypoint {
            args.push("--entrypoint".to_string());
            args.push(entrypoint.clone());
        }

        args.push(config.image.clone());
        args.extend(config.command.iter().cloned());
        args
    }

    /// Create and start a new container.
    ///
    /// The configuration is validated before creating the container to prevent
    /// injection attacks and ensure all inputs are well-formed.
    pub async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;

        let args = self.run_args(config);
        let output = self.exec_checked("run", &args).await?;

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Send a signal to a container.
    pub async fn kill_container(&self, name: &str, signal: &str) -> ContainerResult<()> {
        validate_container_name(name)?;
        validate_signal(signal)?;

        self.exec_checked("kill", &["kill", "--signal", signal, name])
            .await?;
        Ok(())
    }

    /// Remove a container.
    pub async fn remove_container(&self, name: &str, force: bool) -> ContainerResult<()> {
        validate_container_name(name)?;

        let mut args = vec!["rm"];
        if force {
            args.push("-f");
        }
        args.push(name);

        self.exec_checked("rm", &args).await?;
        Ok(())
    }

    /// Get the container state status string (e.g. "running", "exited") via `inspect`.
    ///
    /// Returns `Ok(None)` when the container does not exist.
    pub async fn container_state_status(&self, name: &str) -> ContainerResult<Option<String>> {
        validate_container_name(name)?;

        let output = self
            .exec_cli(
                "inspect",
                &["inspect", "--type", "container", "--format", "{{.State.Status}}", name],
            )
            .await?;

        if !output.status.success() {
            // Container not found is not an error; callers treat it as missing.
            return Ok(None);
        }

        let status = String::from_utf8_lossy(&output.stdout)
            .trim()
            .trim_matches('"')
            .to_string();
        if status.is_empty() {
            return Ok(None);
        }

        Ok(Some(status))
    }

    /// Follow a container's logs (stdout and stderr) until it stops.
    ///
    /// `logs --follow` replays output produced before the call, so nothing is
    /// lost between start and attach.
    pub async fn follow_output(&self, name: &str) -> ContainerResult<OutputStream> {
        validate_container_name(name)?;

        let mut child = Command::new(&self.binary)
            .args(["logs", "--follow", name])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ContainerError::failed("logs", e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ContainerError::failed("logs", "stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ContainerError::failed("logs", "stderr was not captured"))?;

        let merged = stream::select(ReaderStream::new(stdout), ReaderStream::new(stderr)).boxed();
        Ok(FollowedLogs {
            _child: child,
            inner: merged,
        }
        .boxed())
    }

    /// Attach to a container's stdin, write once, and close the input side.
    ///
    /// The attach client keeps running until the container exits, so it is
    /// given [`ATTACH_SETTLE`] to report an error and is then dropped (killed).
    pub async fn write_stdin(&self, name: &str, data: &[u8]) -> ContainerResult<()> {
        validate_container_name(name)?;

        let mut child = Command::new(&self.binary)
            .args(["attach", "--sig-proxy=false", name])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ContainerError::failed("attach", e.to_string()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ContainerError::failed("attach", "stdin was not captured"))?;
        stdin.write_all(data).await?;
        stdin.shutdown().await?;
        drop(stdin);

        match tokio::time::timeout(ATTACH_SETTLE, child.wait_with_output()).await {
            Ok(output) => {
                let output = output?;
                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    return Err(ContainerError::failed("attach", stderr.trim()));
                }
                Ok(())
            }
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        self.create_container(config).await
    }

    async fn kill_container(&self, name: &str, signal: &str) -> ContainerResult<()> {
        self.kill_container(name, signal).await
    }

    async fn remove_container(&self, name: &str, force: bool) -> ContainerResult<()> {
        self.remove_container(name, force).await
    }

    async fn container_state_status(&self, name: &str) -> ContainerResult<Option<String>> {
        self.container_state_status(name).await
    }

    async fn follow_output(&self, name: &str) -> ContainerResult<OutputStream> {
        self.follow_output(name).await
    }

    async fn write_stdin(&self, name: &str, data: &[u8]) -> ContainerResult<()> {
        self.write_stdin(name, data).await
    }
}

/// Log stream that owns the `logs --follow` child process.
struct FollowedLogs {
    _child: Child,
    inner: BoxStream<'static, std::io::Result<Bytes>>,
}

impl Stream for FollowedLogs {
    type Item = ContainerResult<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner
            .poll_next_unpin(cx)
            .map(|item| item.map(|chunk| chunk.map_err(ContainerError::Io)))
    }
}

/// Validate a signal name such as `SIGKILL`, `KILL`, or `9`.
fn validate_signal(signal: &str) -> ContainerResult<()> {
    if signal.is_empty() || signal.len() > 16 || !signal.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return Err(ContainerError::InvalidInput(format!(
            "invalid signal '{}'",
            signal
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_container_runtime_health_check() {
        let runtime = ContainerRuntime::new();
        // This test will only pass if docker or podman is installed
        if let Ok(version) = runtime.health_check().await {
            assert!(!version.is_empty());
        }
    }

    #[test]
    fn test_runtime_type_selinux() {
        assert!(!RuntimeType::Docker.needs_selinux_labels());
        assert!(RuntimeType::Podman.needs_selinux_labels());
    }

    fn sandbox_config() -> ContainerConfig {
        ContainerConfig::new("python:3.12-slim")
            .name("abc")
            .interactive(true)
            .network_mode("none")
            .volume("/srv/ws/abc", "/code")
            .workdir("/code")
            .entrypoint("timeout")
            .command(vec!["15m".to_string(), "python3".to_string(), "main.py".to_string()])
            .limits(ResourceLimits {
                memory_bytes: Some(104_857_600),
                pids_limit: Some(25),
                cpus: Some(0.5),
                disk_bytes: Some(52_428_800),
            })
    }

    fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_run_args_apply_limits() {
        let runtime = ContainerRuntime::with_type(RuntimeType::Docker);
        let args = runtime.run_args(&sandbox_config());

        assert_eq!(&args[..3], ["run", "-d", "-i"]);
        assert_eq!(flag_value(&args, "--name"), Some("abc"));
        assert_eq!(flag_value(&args, "--memory"), Some("104857600"));
        assert_eq!(flag_value(&args, "--memory-swap"), Some("104857600"));
        assert_eq!(flag_value(&args, "--pids-limit"), Some("25"));
        assert_eq!(flag_value(&args, "--cpus"), Some("0.50"));
        assert_eq!(flag_value(&args, "--storage-opt"), Some("size=52428800"));
        assert_eq!(flag_value(&args, "--network"), Some("none"));
        assert_eq!(flag_value(&args, "-v"), Some("/srv/ws/abc:/code:rw"));
        assert_eq!(flag_value(&args, "--entrypoint"), Some("timeout"));
    }

    #[test]
    fn test_run_args_image_precedes_command() {
        let runtime = ContainerRuntime::with_type(RuntimeType::Docker);
        let args = runtime.run_args(&sandbox_config());
        let tail: Vec<&str> = args[args.len() - 4..].iter().map(String::as_str).collect();
        assert_eq!(tail, ["python:3.12-slim", "15m", "python3", "main.py"]);
    }

    #[test]
    fn test_run_args_podman_relabels_volumes() {
        let runtime = ContainerRuntime::with_type(RuntimeType::Podman);
        let args = runtime.run_args(&sandbox_config());
        assert_eq!(flag_value(&args, "-v"), Some("/srv/ws/abc:/code:rw,Z"));
    }

    #[test]
    fn test_validate_signal() {
        assert!(validate_signal("SIGKILL").is_ok());
        assert!(validate_signal("9").is_ok());
        assert!(validate_signal("").is_err());
        assert!(validate_signal("KILL;rm").is_err());
    }
}
