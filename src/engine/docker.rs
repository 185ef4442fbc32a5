//! Docker Engine API adapter.
//!
//! Implements [`ContainerEngine`] against the Docker Engine HTTP API over a
//! Unix socket. The adapter speaks the API directly through a persistent
//! hyper client; it never shells out to a CLI and never mounts host paths.
//!
//! # Endpoint Discovery
//!
//! In order:
//!
//! 1. Explicit configuration override (`unix://...` or a bare path)
//! 2. `DOCKER_HOST`, when it names a Unix socket
//! 3. The per-user Colima socket (`~/.colima/default/docker.sock`)
//! 4. `/var/run/docker.sock`
//!
//! Failure to locate a reachable engine is a fatal startup error; the
//! platform cannot run functions without one.
//!
//! # Log Framing
//!
//! Containers are created without a TTY, so the logs endpoint returns
//! Docker's multiplexed framing: an 8-byte header (stream type, three zero
//! bytes, big-endian payload length) before each payload. The adapter
//! demultiplexes locally into separate stdout/stderr streams.

use crate::constants::{
    BUILD_LOG_TAIL_LINES, CONTAINER_TMPFS_BYTES, ENGINE_REQUEST_TIMEOUT, IMAGE_BUILD_TIMEOUT,
    STOP_GRACE,
};
use crate::engine::{BuildContext, ContainerEngine, ContainerLogs, ContainerSpec, WaitOutcome};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyperlocal::{UnixClientExt, UnixConnector, Uri as UnixUri};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

type SocketClient = Client<UnixConnector, Full<Bytes>>;

/// Docker-backed container engine.
///
/// Cheap to clone; the underlying hyper client pools connections to the
/// engine socket.
#[derive(Clone)]
pub struct DockerEngine {
    socket: PathBuf,
    client: SocketClient,
}

impl std::fmt::Debug for DockerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerEngine")
            .field("socket", &self.socket)
            .finish()
    }
}

impl DockerEngine {
    /// Locates the engine socket and verifies it answers a ping.
    ///
    /// # Errors
    ///
    /// [`Error::EngineDiscovery`] when no socket candidate exists or the
    /// engine does not respond.
    pub async fn connect(endpoint_override: Option<&str>) -> Result<Self> {
        let socket = Self::discover_socket(endpoint_override)?;
        let engine = Self {
            socket: socket.clone(),
            client: Client::unix(),
        };
        engine.ping().await.map_err(|e| {
            Error::EngineDiscovery(format!(
                "engine at {} did not answer ping: {e}",
                socket.display()
            ))
        })?;
        info!("container engine connected at {}", socket.display());
        Ok(engine)
    }

    /// Resolves the socket path without connecting. Exposed for tests.
    pub fn discover_socket(endpoint_override: Option<&str>) -> Result<PathBuf> {
        if let Some(endpoint) = endpoint_override {
            return Ok(PathBuf::from(strip_unix_scheme(endpoint)));
        }
        if let Ok(host) = std::env::var("DOCKER_HOST") {
            if host.starts_with("unix://") {
                return Ok(PathBuf::from(strip_unix_scheme(&host)));
            }
        }
        if let Some(home) = dirs::home_dir() {
            let colima = home.join(crate::constants::COLIMA_SOCKET_SUFFIX);
            if colima.exists() {
                return Ok(colima);
            }
        }
        let default = Path::new(crate::constants::DEFAULT_ENGINE_SOCKET);
        if default.exists() {
            return Ok(default.to_path_buf());
        }
        Err(Error::EngineDiscovery(
            "no engine socket found (set CLOWDY_DOCKER_ENDPOINT or DOCKER_HOST)".to_string(),
        ))
    }

    async fn ping(&self) -> Result<()> {
        let (status, _) = self
            .request(Method::GET, "/_ping", None, Bytes::new(), ENGINE_REQUEST_TIMEOUT)
            .await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::Engine {
                reason: format!("ping returned {status}"),
            })
        }
    }

    /// One HTTP round-trip against the engine socket, fully buffered.
    async fn request(
        &self,
        method: Method,
        path_and_query: &str,
        content_type: Option<&str>,
        body: Bytes,
        timeout: Duration,
    ) -> Result<(StatusCode, Bytes)> {
        let uri: http::Uri = UnixUri::new(&self.socket, path_and_query).into();
        let mut builder = http::Request::builder().method(method).uri(uri);
        if let Some(ct) = content_type {
            builder = builder.header(http::header::CONTENT_TYPE, ct);
        }
        let request = builder
            .body(Full::new(body))
            .map_err(|e| Error::Internal(format!("failed to build engine request: {e}")))?;

        let exchange = async {
            let response = self.client.request(request).await.map_err(|e| Error::Engine {
                reason: format!("engine request failed: {e}"),
            })?;
            let status = response.status();
            let bytes = response
                .into_body()
                .collect()
                .await
                .map_err(|e| Error::Engine {
                    reason: format!("engine response read failed: {e}"),
                })?
                .to_bytes();
            Ok::<_, Error>((status, bytes))
        };

        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| Error::Engine {
                reason: format!("engine request timed out after {timeout:?}"),
            })?
    }
}

/// Strips a `unix://` scheme prefix, leaving a filesystem path.
fn strip_unix_scheme(endpoint: &str) -> &str {
    endpoint.strip_prefix("unix://").unwrap_or(endpoint)
}

/// Pulls the engine's error `message` field out of a response body,
/// falling back to the raw text.
fn engine_message(status: StatusCode, body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    serde_json::from_str::<serde_json::Value>(&text)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| format!("{status}: {}", text.trim()))
}

/// Demultiplexes Docker's 8-byte-header log framing into stdout/stderr.
///
/// Truncated trailing frames are kept up to the bytes available.
pub fn demux_log_stream(raw: &[u8]) -> ContainerLogs {
    let mut logs = ContainerLogs::default();
    let mut offset = 0;
    while offset + 8 <= raw.len() {
        let stream_type = raw[offset];
        let len = u32::from_be_bytes([
            raw[offset + 4],
            raw[offset + 5],
            raw[offset + 6],
            raw[offset + 7],
        ]) as usize;
        let start = offset + 8;
        let end = (start + len).min(raw.len());
        match stream_type {
            1 => logs.stdout.extend_from_slice(&raw[start..end]),
            2 => logs.stderr.extend_from_slice(&raw[start..end]),
            _ => {}
        }
        if start + len > raw.len() {
            break;
        }
        offset = start + len;
    }
    logs
}

/// Collects the meaningful lines of a build's JSON-line stream.
///
/// Returns `Err` with the trailing lines (the package manager's actual
/// message) when the stream reports an error.
pub fn parse_build_stream(body: &str) -> std::result::Result<Vec<String>, String> {
    let mut lines: Vec<String> = Vec::new();
    let mut failed = false;
    for raw_line in body.lines() {
        let raw_line = raw_line.trim();
        if raw_line.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(raw_line) else {
            continue;
        };
        if let Some(error) = value.get("error").and_then(|e| e.as_str()) {
            let error = error.trim();
            if !error.is_empty() {
                lines.push(error.to_string());
            }
            failed = true;
        } else if let Some(stream) = value.get("stream").and_then(|s| s.as_str()) {
            let stream = stream.trim();
            if !stream.is_empty() {
                lines.push(stream.to_string());
            }
        }
    }
    if failed {
        let tail_start = lines.len().saturating_sub(BUILD_LOG_TAIL_LINES);
        Err(lines[tail_start..].join("\n"))
    } else {
        Ok(lines)
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn build_image(&self, context: &BuildContext, tag: &str) -> Result<()> {
        let tar = context.to_tar()?;
        debug!("building image {tag} ({} byte context)", tar.len());
        let path = format!("/build?t={tag}&rm=1&forcerm=1");
        let (status, body) = self
            .request(
                Method::POST,
                &path,
                Some("application/x-tar"),
                Bytes::from(tar),
                IMAGE_BUILD_TIMEOUT,
            )
            .await?;
        if !status.is_success() {
            return Err(Error::ImageBuild {
                message: engine_message(status, &body),
            });
        }
        // A 200 does not mean success: build errors arrive in-stream.
        match parse_build_stream(&String::from_utf8_lossy(&body)) {
            Ok(_) => {
                info!("image {tag} built");
                Ok(())
            }
            Err(tail) => Err(Error::ImageBuild { message: tail }),
        }
    }

    async fn image_exists(&self, tag: &str) -> Result<bool> {
        let path = format!("/images/{tag}/json");
        let (status, _) = self
            .request(Method::GET, &path, None, Bytes::new(), ENGINE_REQUEST_TIMEOUT)
            .await?;
        Ok(status.is_success())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let tmpfs_opts = format!("rw,noexec,nosuid,size={CONTAINER_TMPFS_BYTES}");
        let body = serde_json::json!({
            "Image": spec.image,
            "Env": spec.env,
            "NetworkDisabled": !spec.network_enabled,
            "HostConfig": {
                "Memory": spec.limits.memory_bytes,
                "NanoCpus": spec.limits.nano_cpus,
                "PidsLimit": spec.limits.pids_max,
                "ReadonlyRootfs": spec.limits.read_only_rootfs,
                "NetworkMode": if spec.network_enabled { "bridge" } else { "none" },
                "Tmpfs": { "/tmp": tmpfs_opts },
            },
        });
        let (status, response) = self
            .request(
                Method::POST,
                "/containers/create",
                Some("application/json"),
                Bytes::from(serde_json::to_vec(&body)?),
                ENGINE_REQUEST_TIMEOUT,
            )
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Err(Error::ImageMissing {
                tag: spec.image.clone(),
            });
        }
        if !status.is_success() {
            return Err(Error::Engine {
                reason: engine_message(status, &response),
            });
        }
        let value: serde_json::Value = serde_json::from_slice(&response)?;
        value
            .get("Id")
            .and_then(|id| id.as_str())
            .map(str::to_string)
            .ok_or_else(|| Error::Engine {
                reason: "create response missing container id".to_string(),
            })
    }

    async fn put_archive(&self, id: &str, path: &str, tar_bytes: Vec<u8>) -> Result<()> {
        let query = format!("/containers/{id}/archive?path={path}");
        let (status, body) = self
            .request(
                Method::PUT,
                &query,
                Some("application/x-tar"),
                Bytes::from(tar_bytes),
                ENGINE_REQUEST_TIMEOUT,
            )
            .await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::Engine {
                reason: engine_message(status, &body),
            })
        }
    }

    async fn start_and_wait(&self, id: &str, timeout: Duration) -> Result<WaitOutcome> {
        let (status, body) = self
            .request(
                Method::POST,
                &format!("/containers/{id}/start"),
                None,
                Bytes::new(),
                ENGINE_REQUEST_TIMEOUT,
            )
            .await?;
        if !status.is_success() && status != StatusCode::NOT_MODIFIED {
            return Err(Error::Engine {
                reason: engine_message(status, &body),
            });
        }

        // The wait endpoint blocks server-side until exit; the wall-clock
        // limit is enforced here, around the whole exchange.
        let wait_path = format!("/containers/{id}/wait");
        let wait = self.request(
            Method::POST,
            &wait_path,
            None,
            Bytes::new(),
            timeout + ENGINE_REQUEST_TIMEOUT,
        );
        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok((status, body))) if status.is_success() => {
                let value: serde_json::Value = serde_json::from_slice(&body)?;
                let code = value
                    .get("StatusCode")
                    .and_then(|c| c.as_i64())
                    .unwrap_or(-1);
                Ok(WaitOutcome::Exited(code))
            }
            Ok(Ok((status, body))) => Err(Error::Engine {
                reason: engine_message(status, &body),
            }),
            Ok(Err(e)) => Err(e),
            Err(_elapsed) => {
                warn!("container {id} exceeded wall-clock limit, stopping");
                let grace = STOP_GRACE.as_secs();
                let _ = self
                    .request(
                        Method::POST,
                        &format!("/containers/{id}/stop?t={grace}"),
                        None,
                        Bytes::new(),
                        ENGINE_REQUEST_TIMEOUT,
                    )
                    .await;
                let _ = self
                    .request(
                        Method::POST,
                        &format!("/containers/{id}/kill"),
                        None,
                        Bytes::new(),
                        ENGINE_REQUEST_TIMEOUT,
                    )
                    .await;
                Ok(WaitOutcome::TimedOut)
            }
        }
    }

    async fn read_logs(&self, id: &str) -> Result<ContainerLogs> {
        let path = format!("/containers/{id}/logs?stdout=true&stderr=true");
        let (status, body) = self
            .request(Method::GET, &path, None, Bytes::new(), ENGINE_REQUEST_TIMEOUT)
            .await?;
        if !status.is_success() {
            return Err(Error::Engine {
                reason: engine_message(status, &body),
            });
        }
        Ok(demux_log_stream(&body))
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let path = format!("/containers/{id}?force=true&v=true");
        let (status, body) = self
            .request(Method::DELETE, &path, None, Bytes::new(), ENGINE_REQUEST_TIMEOUT)
            .await?;
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(Error::Engine {
                reason: engine_message(status, &body),
            })
        }
    }
}
