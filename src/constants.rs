//! Constants for the execution plane.
//!
//! All limits, timeouts, and reserved keys are defined here to ensure
//! consistency and prevent magic numbers throughout the codebase.

use std::time::Duration;

// =============================================================================
// Isolation Floor
// =============================================================================

/// Memory cap for function containers (128 MiB).
///
/// This is the security floor, not a user-configurable knob.
pub const CONTAINER_MEMORY_BYTES: u64 = 128 * 1024 * 1024;

/// CPU share for function containers (0.5 cores, in nano-cores).
pub const CONTAINER_NANO_CPUS: i64 = 500_000_000;

/// Maximum PIDs per function container.
pub const CONTAINER_PIDS_MAX: i64 = 128;

/// Size of the writable tmpfs mounted at `/tmp` (64 MiB).
///
/// The root filesystem is read-only; this is the only writable path.
pub const CONTAINER_TMPFS_BYTES: u64 = 64 * 1024 * 1024;

// =============================================================================
// Timeouts
// =============================================================================

/// Wall-clock limit for one function execution.
pub const EXECUTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period given to `stop` before a hard `kill` on timeout.
pub const STOP_GRACE: Duration = Duration::from_secs(2);

/// Timeout for image builds (package installs can be slow).
pub const IMAGE_BUILD_TIMEOUT: Duration = Duration::from_secs(300);

/// Timeout for short engine round-trips (create, start, logs, remove).
pub const ENGINE_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Runtime Contract
// =============================================================================

/// Path inside the container where user source is injected.
pub const FUNCTION_CODE_PATH: &str = "/app/function.py";

/// Environment variable carrying the serialized invocation input.
pub const INPUT_JSON_VAR: &str = "INPUT_JSON";

/// Environment variable carrying the provisioned database connection string.
pub const DATABASE_URL_VAR: &str = "DATABASE_URL";

/// Environment variable carrying the function id (read by the bootstrap
/// to build the handler `context`).
pub const FUNCTION_ID_VAR: &str = "CLOWDY_FUNCTION_ID";

/// Environment variable carrying the invocation id.
pub const INVOCATION_ID_VAR: &str = "CLOWDY_INVOCATION_ID";

// =============================================================================
// Image Lifecycle
// =============================================================================

/// Default base runtime image (interpreter + bootstrap).
pub const DEFAULT_BASE_IMAGE: &str = "clowdy-python-runtime";

/// Tag prefix for per-project dependency images.
pub const PROJECT_IMAGE_PREFIX: &str = "clowdy-project-";

/// Hex characters of the requirements hash used in the image tag.
pub const IMAGE_TAG_HASH_LEN: usize = 12;

/// Trailing lines of build output retained when a build fails.
///
/// The tail is where the package manager prints its actual complaint.
pub const BUILD_LOG_TAIL_LINES: usize = 10;

// =============================================================================
// HTTP Surface
// =============================================================================

/// Maximum request body accepted by the gateway before dispatch.
///
/// Untrusted code behind a 128 MiB memory cap should not receive
/// arbitrarily large payloads.
pub const MAX_GATEWAY_BODY_BYTES: usize = 1024 * 1024;

/// Invocation records returned per listing query.
pub const INVOCATION_LIST_LIMIT: i64 = 50;

/// Truncation cap for stderr captured into an error output.
pub const ERROR_LOG_CAP_BYTES: usize = 4096;

// =============================================================================
// Engine Discovery
// =============================================================================

/// Well-known per-user socket path (Colima on macOS).
pub const COLIMA_SOCKET_SUFFIX: &str = ".colima/default/docker.sock";

/// Default engine socket on Linux.
pub const DEFAULT_ENGINE_SOCKET: &str = "/var/run/docker.sock";
