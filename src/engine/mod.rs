//! Container engine abstraction.
//!
//! This trait defines the minimal capability set the execution plane needs
//! from a local container engine:
//!
//! - `build_image`: build from an in-memory context
//! - `create_container`: create, not yet started, under fixed limits
//! - `put_archive`: inject a tar stream before start
//! - `start_and_wait`: run under a wall-clock limit
//! - `read_logs`: demultiplexed stdout/stderr
//! - `remove_container`: best-effort cleanup
//!
//! # No Host Mounts
//!
//! User code reaches the container exclusively through `put_archive`. The
//! trait deliberately has no volume or bind-mount surface, so no
//! implementation can leak a host path into an untrusted workload.
//!
//! # Suspension Points
//!
//! Every operation is `async`; implementations must not block the runtime
//! thread, so the host keeps multiplexing other invocations while a
//! container runs.

pub mod docker;

pub use docker::DockerEngine;

use crate::constants::{
    CONTAINER_MEMORY_BYTES, CONTAINER_NANO_CPUS, CONTAINER_PIDS_MAX,
};
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

// =============================================================================
// Build Context
// =============================================================================

/// An in-memory image build context: a set of `(path, bytes)` entries
/// rendered to a tar stream for the engine's build endpoint.
///
/// Nothing is ever written to the host filesystem.
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    entries: Vec<(String, Vec<u8>)>,
}

impl BuildContext {
    /// Creates an empty build context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file to the context.
    pub fn add_file(&mut self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.entries.push((path.into(), bytes.into()));
    }

    /// Renders the context as an uncompressed tar archive.
    pub fn to_tar(&self) -> Result<Vec<u8>> {
        tar_archive(&self.entries)
    }

    /// Returns the entries, for inspection in tests.
    pub fn entries(&self) -> &[(String, Vec<u8>)] {
        &self.entries
    }
}

/// Builds an in-memory tar archive from `(path, bytes)` entries.
///
/// Shared by image build contexts and code-injection archives.
pub fn tar_archive(entries: &[(String, Vec<u8>)]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, bytes) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();
        builder.append_data(&mut header, path, bytes.as_slice())?;
    }
    Ok(builder.into_inner()?)
}

// =============================================================================
// Resource Limits
// =============================================================================

/// Resource limits applied to every function container.
///
/// The defaults are the platform's security floor; the execution plane
/// never relaxes them per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Memory cap in bytes.
    pub memory_bytes: u64,
    /// CPU share as a nano-fraction of one core.
    pub nano_cpus: i64,
    /// Maximum number of processes.
    pub pids_max: i64,
    /// Whether the root filesystem is mounted read-only.
    pub read_only_rootfs: bool,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: CONTAINER_MEMORY_BYTES,
            nano_cpus: CONTAINER_NANO_CPUS,
            pids_max: CONTAINER_PIDS_MAX,
            read_only_rootfs: true,
        }
    }
}

// =============================================================================
// Container Specification
// =============================================================================

/// Everything the engine needs to create one function container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Image tag to run.
    pub image: String,
    /// Environment as `KEY=value` pairs, already assembled in injection
    /// order (reserved runtime variables last).
    pub env: Vec<String>,
    /// Resource limits.
    pub limits: ResourceLimits,
    /// Whether the container gets a network. Off for function workloads.
    pub network_enabled: bool,
}

impl ContainerSpec {
    /// Creates a spec with default (floor) limits and no network.
    pub fn new(image: impl Into<String>, env: Vec<String>) -> Self {
        Self {
            image: image.into(),
            env,
            limits: ResourceLimits::default(),
            network_enabled: false,
        }
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// Result of waiting on a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The container's main process exited with this code.
    Exited(i64),
    /// The wall-clock limit elapsed; the container was stopped and killed.
    /// Reported regardless of the process exit state.
    TimedOut,
}

/// Demultiplexed container output.
#[derive(Debug, Clone, Default)]
pub struct ContainerLogs {
    /// Standard output bytes.
    pub stdout: Vec<u8>,
    /// Standard error bytes.
    pub stderr: Vec<u8>,
}

impl ContainerLogs {
    /// Standard output as lossy UTF-8.
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Standard error as lossy UTF-8.
    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

// =============================================================================
// Container Engine Trait
// =============================================================================

/// Minimal container-engine interface for the execution plane.
///
/// # Lifecycle
///
/// ```text
/// create_container(spec) → put_archive(id, ...) → start_and_wait(id, limit)
///     → read_logs(id) → remove_container(id)
/// ```
///
/// Implementations:
///
/// - [`DockerEngine`]: Docker Engine API over a Unix socket
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Builds an image from an in-memory context and tags it.
    ///
    /// On failure returns [`crate::error::Error::ImageBuild`] carrying the
    /// trailing lines of build output, so callers surface the package
    /// manager's message rather than an exit status.
    async fn build_image(&self, context: &BuildContext, tag: &str) -> Result<()>;

    /// Checks whether an image tag is present in the engine.
    async fn image_exists(&self, tag: &str) -> Result<bool>;

    /// Creates a container, not yet started. Returns the container id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Injects a tar stream into the container filesystem at `path`.
    ///
    /// This is the sole mechanism for delivering user code.
    async fn put_archive(&self, id: &str, path: &str, tar_bytes: Vec<u8>) -> Result<()>;

    /// Starts the container and waits at most `timeout` for it to exit.
    ///
    /// On timeout the engine stops (graceful) then kills (hard) the
    /// container and reports [`WaitOutcome::TimedOut`].
    async fn start_and_wait(&self, id: &str, timeout: Duration) -> Result<WaitOutcome>;

    /// Retrieves demultiplexed stdout and stderr.
    async fn read_logs(&self, id: &str) -> Result<ContainerLogs>;

    /// Removes the container. Best-effort: callers log failures and move on.
    async fn remove_container(&self, id: &str) -> Result<()>;
}
