//! Invocation engine.
//!
//! The central component: one call produces exactly one container run and
//! exactly one invocation record. The flow within an invocation is strictly
//! sequential:
//!
//! ```text
//! resolve image → assemble env → create → inject code → start → wait
//!     → read logs → remove (best-effort) → record → return
//! ```
//!
//! Across invocations nothing is ordered; same-function invocations run
//! concurrently, each in its own fresh container. There is no warm pool
//! and no cross-invocation state.
//!
//! # Cancellation
//!
//! The container run is spawned as an independent task, so a client
//! disconnect discards only the response: the container completes (or
//! times out) and the invocation is still recorded.

use crate::constants::{
    DATABASE_URL_VAR, ERROR_LOG_CAP_BYTES, EXECUTION_TIMEOUT, FUNCTION_CODE_PATH, FUNCTION_ID_VAR,
    INPUT_JSON_VAR, INVOCATION_ID_VAR,
};
use crate::engine::{tar_archive, ContainerEngine, ContainerSpec, WaitOutcome};
use crate::error::{Error, Result};
use crate::images::ImageManager;
use crate::store::{new_id, EnvVar, Function, InvocationSource, InvocationStatus, Project, Store};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// One invocation request, fully resolved by the caller.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub function: Function,
    pub input: Value,
    pub source: InvocationSource,
    pub http_method: Option<String>,
    pub http_path: Option<String>,
}

/// The result returned to callers; mirrors the recorded invocation.
#[derive(Debug, Clone)]
pub struct InvocationResult {
    pub invocation_id: String,
    pub status: InvocationStatus,
    pub output: Value,
    pub duration_ms: i64,
}

impl InvocationResult {
    pub fn is_success(&self) -> bool {
        self.status == InvocationStatus::Success
    }

    /// Error message for callers, taken from the output's `error` field.
    pub fn error_message(&self) -> String {
        self.output
            .get("error")
            .and_then(|e| e.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| self.output.to_string())
    }
}

/// Executes invocations against the container engine.
#[derive(Clone)]
pub struct Invoker {
    store: Store,
    engine: Arc<dyn ContainerEngine>,
    images: Arc<ImageManager>,
}

impl Invoker {
    pub fn new(store: Store, engine: Arc<dyn ContainerEngine>, images: Arc<ImageManager>) -> Self {
        Self {
            store,
            engine,
            images,
        }
    }

    /// Runs one invocation and records it.
    ///
    /// The run itself happens on a detached task: if the caller's future
    /// is dropped (client disconnect), the container still completes and
    /// the record is still written.
    pub async fn invoke(&self, request: InvokeRequest) -> Result<InvocationResult> {
        let invoker = self.clone();
        let handle = tokio::spawn(async move { invoker.run(request).await });
        handle
            .await
            .map_err(|e| Error::Internal(format!("invocation task failed: {e}")))?
    }

    async fn run(&self, request: InvokeRequest) -> Result<InvocationResult> {
        let invocation_id = new_id();
        let input_json = serde_json::to_string(&request.input)?;

        let (status, output, duration_ms) = self.execute(&request, &invocation_id).await;

        // The record is written after cleanup; a write failure is logged
        // and never changes the caller's result — the invocation happened.
        let output_json = serde_json::to_string(&output).unwrap_or_else(|_| "{}".to_string());
        if let Err(e) = self
            .store
            .append_invocation(
                &invocation_id,
                &request.function.id,
                &input_json,
                &output_json,
                status,
                duration_ms,
                request.source,
                request.http_method.as_deref(),
                request.http_path.as_deref(),
            )
            .await
        {
            warn!(invocation = %invocation_id, "failed to record invocation: {e}");
        }

        Ok(InvocationResult {
            invocation_id,
            status,
            output,
            duration_ms,
        })
    }

    /// Container lifecycle for one invocation. Infallible by design:
    /// every failure mode folds into a (status, output) classification.
    async fn execute(
        &self,
        request: &InvokeRequest,
        invocation_id: &str,
    ) -> (InvocationStatus, Value, i64) {
        let overall_start = Instant::now();

        let project = match &request.function.project_id {
            Some(project_id) => match self.store.project(project_id).await {
                Ok(project) => project,
                Err(e) => {
                    warn!("project lookup failed: {e}");
                    None
                }
            },
            None => None,
        };

        let image = self.resolve_image(project.as_ref()).await;

        let env_vars = match &project {
            Some(p) => self.store.env_vars(&p.id).await.unwrap_or_default(),
            None => Vec::new(),
        };
        let env = match assemble_env(
            &env_vars,
            project.as_ref().and_then(|p| p.database_url.as_deref()),
            &request.input,
            &request.function.id,
            invocation_id,
        ) {
            Ok(env) => env,
            Err(e) => {
                return (
                    InvocationStatus::Error,
                    json!({ "error": format!("failed to assemble environment: {e}") }),
                    elapsed_ms(overall_start),
                );
            }
        };

        let spec = ContainerSpec::new(image, env);
        let container_id = match self.engine.create_container(&spec).await {
            Ok(id) => id,
            Err(e) => {
                let message = match &e {
                    Error::ImageMissing { tag } => format!("runtime image not found: {tag}"),
                    _ => "engine unavailable".to_string(),
                };
                warn!("container creation failed: {e}");
                return (
                    InvocationStatus::Error,
                    json!({ "error": message }),
                    elapsed_ms(overall_start),
                );
            }
        };
        debug!(container = %container_id, invocation = %invocation_id, "container created");

        let code_tar = tar_archive(&[(
            FUNCTION_CODE_PATH.trim_start_matches('/').to_string(),
            request.function.code.clone().into_bytes(),
        )]);
        let outcome = match code_tar {
            Ok(tar) => match self.engine.put_archive(&container_id, "/", tar).await {
                Ok(()) => self.run_container(&container_id).await,
                Err(e) => {
                    warn!("code injection failed: {e}");
                    (
                        InvocationStatus::Error,
                        json!({ "error": "engine unavailable" }),
                        0,
                    )
                }
            },
            Err(e) => (
                InvocationStatus::Error,
                json!({ "error": format!("failed to package code: {e}") }),
                0,
            ),
        };

        // Unconditional, best-effort cleanup. Never user-visible.
        if let Err(e) = self.engine.remove_container(&container_id).await {
            warn!(container = %container_id, "container removal failed: {e}");
        }

        let (status, output, exec_ms) = outcome;
        let duration_ms = if exec_ms > 0 {
            exec_ms
        } else {
            elapsed_ms(overall_start)
        };
        (status, output, duration_ms)
    }

    /// Start, wait under the wall-clock limit, read logs, classify.
    /// Duration is measured from before the start to after log retrieval.
    async fn run_container(&self, container_id: &str) -> (InvocationStatus, Value, i64) {
        let started = Instant::now();
        match self
            .engine
            .start_and_wait(container_id, EXECUTION_TIMEOUT)
            .await
        {
            Ok(WaitOutcome::Exited(exit_code)) => {
                let logs = match self.engine.read_logs(container_id).await {
                    Ok(logs) => logs,
                    Err(e) => {
                        warn!("log retrieval failed: {e}");
                        Default::default()
                    }
                };
                let (status, output) =
                    classify_output(exit_code, &logs.stdout_text(), &logs.stderr_text());
                (status, output, elapsed_ms(started))
            }
            Ok(WaitOutcome::TimedOut) => (
                InvocationStatus::Timeout,
                json!({ "error": "execution timeout" }),
                elapsed_ms(started),
            ),
            Err(e) => {
                warn!("container start/wait failed: {e}");
                (
                    InvocationStatus::Error,
                    json!({ "error": "engine unavailable" }),
                    elapsed_ms(started),
                )
            }
        }
    }

    /// Selects the image tag for a project, building on demand.
    ///
    /// A build in flight blocks here (same per-project lock); a failed
    /// build falls back to the last ready tag, or the base runtime.
    async fn resolve_image(&self, project: Option<&Project>) -> String {
        let Some(project) = project else {
            return self.images.base_image().to_string();
        };
        match self.images.ensure_image(&project.id).await {
            Ok(Some(tag)) => tag,
            Ok(None) => self.images.base_image().to_string(),
            Err(e) => {
                warn!(project = %project.id, "image unavailable, falling back: {e}");
                match self.store.project(&project.id).await {
                    Ok(Some(fresh)) => fresh
                        .runtime_image_tag
                        .unwrap_or_else(|| self.images.base_image().to_string()),
                    _ => self.images.base_image().to_string(),
                }
            }
        }
    }
}

fn elapsed_ms(start: Instant) -> i64 {
    i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX)
}

// =============================================================================
// Environment Assembly
// =============================================================================

/// Assembles the container environment in injection order: project env
/// vars, the provisioned `DATABASE_URL` (overriding any user var of that
/// name), then the reserved runtime variables last so user vars can never
/// shadow them.
pub(crate) fn assemble_env(
    env_vars: &[EnvVar],
    database_url: Option<&str>,
    input: &Value,
    function_id: &str,
    invocation_id: &str,
) -> Result<Vec<String>> {
    let mut env: Vec<String> = Vec::with_capacity(env_vars.len() + 4);
    for var in env_vars {
        env.push(format!("{}={}", var.key, var.value));
    }
    if let Some(url) = database_url {
        let prefix = format!("{DATABASE_URL_VAR}=");
        env.retain(|entry| !entry.starts_with(&prefix));
        env.push(format!("{DATABASE_URL_VAR}={url}"));
    }
    env.push(format!("{INPUT_JSON_VAR}={}", serde_json::to_string(input)?));
    env.push(format!("{FUNCTION_ID_VAR}={function_id}"));
    env.push(format!("{INVOCATION_ID_VAR}={invocation_id}"));
    Ok(env)
}

// =============================================================================
// Output Classification
// =============================================================================

/// Classifies a finished container's output.
///
/// The contract: the last non-empty stdout line is the function's return,
/// as JSON. Exit 0 plus a parsable line is success; anything else is an
/// error whose message prefers the bootstrap's structured stderr.
pub(crate) fn classify_output(
    exit_code: i64,
    stdout: &str,
    stderr: &str,
) -> (InvocationStatus, Value) {
    let last_line = stdout.lines().rev().find(|line| !line.trim().is_empty());

    if exit_code == 0 {
        if let Some(line) = last_line {
            if let Ok(value) = serde_json::from_str::<Value>(line.trim()) {
                return (InvocationStatus::Success, value);
            }
        }
    }

    let message = extract_error_message(last_line, stderr);
    (
        InvocationStatus::Error,
        json!({
            "error": message,
            "logs": truncate_tail(stderr, ERROR_LOG_CAP_BYTES),
        }),
    )
}

/// Pulls the most useful error text out of a failed run: the `error`
/// field of the bootstrap's JSON stderr line if present, else raw stderr,
/// else the stdout tail, else a generic message.
fn extract_error_message(stdout_tail: Option<&str>, stderr: &str) -> String {
    if let Some(line) = stderr.lines().rev().find(|line| !line.trim().is_empty()) {
        if let Ok(value) = serde_json::from_str::<Value>(line.trim()) {
            if let Some(error) = value.get("error").and_then(|e| e.as_str()) {
                return error.to_string();
            }
        }
    }
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return truncate_tail(stderr, ERROR_LOG_CAP_BYTES);
    }
    if let Some(line) = stdout_tail {
        return line.trim().to_string();
    }
    "function exited with an error".to_string()
}

/// Keeps the trailing `cap` bytes of `text`, respecting char boundaries.
/// The tail is where interpreters print the actual failure.
fn truncate_tail(text: &str, cap: usize) -> String {
    if text.len() <= cap {
        return text.to_string();
    }
    let mut start = text.len() - cap;
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_success_parses_last_line() {
        let (status, output) =
            classify_output(0, "debug print\n{\"echo\": {\"n\": 7}}\n", "");
        assert_eq!(status, InvocationStatus::Success);
        assert_eq!(output, json!({"echo": {"n": 7}}));
    }

    #[test]
    fn classify_success_skips_trailing_blank_lines() {
        let (status, output) = classify_output(0, "42\n\n\n", "");
        assert_eq!(status, InvocationStatus::Success);
        assert_eq!(output, json!(42));
    }

    #[test]
    fn classify_unparsable_stdout_is_error() {
        let (status, output) = classify_output(0, "not json at all", "");
        assert_eq!(status, InvocationStatus::Error);
        assert_eq!(output["error"], "not json at all");
    }

    #[test]
    fn classify_nonzero_exit_prefers_bootstrap_stderr() {
        let stderr = "{\"error\": \"Function error: NameError: name 'x' is not defined\", \"traceback\": \"...\"}\n";
        let (status, output) = classify_output(1, "", stderr);
        assert_eq!(status, InvocationStatus::Error);
        assert_eq!(
            output["error"],
            "Function error: NameError: name 'x' is not defined"
        );
        assert!(output["logs"].as_str().unwrap().contains("traceback"));
    }

    #[test]
    fn classify_nonzero_exit_with_parsable_stdout_is_still_error() {
        let (status, _) = classify_output(3, "{\"fine\": true}", "boom");
        assert_eq!(status, InvocationStatus::Error);
    }

    #[test]
    fn classify_raw_stderr_fallback() {
        let (_, output) = classify_output(139, "", "Segmentation fault\n");
        assert_eq!(output["error"], "Segmentation fault");
    }

    #[test]
    fn env_reserved_vars_come_last_and_win() {
        let vars = vec![
            EnvVar {
                project_id: "p".into(),
                key: "API_KEY".into(),
                id: "e1".into(),
                value: "abc".into(),
                is_secret: false,
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
            },
            EnvVar {
                project_id: "p".into(),
                key: "INPUT_JSON".into(),
                id: "e2".into(),
                value: "spoofed".into(),
                is_secret: false,
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
            },
        ];
        let env = assemble_env(&vars, None, &json!({"n": 1}), "fn1", "inv1").unwrap();
        // Later entries win in the engine; the real INPUT_JSON is last.
        let last_input = env.iter().rposition(|e| e.starts_with("INPUT_JSON=")).unwrap();
        let spoofed = env.iter().position(|e| e == "INPUT_JSON=spoofed").unwrap();
        assert!(last_input > spoofed);
        assert!(env[last_input].contains("{\"n\":1}"));
        assert!(env.iter().any(|e| e == "CLOWDY_FUNCTION_ID=fn1"));
        assert!(env.iter().any(|e| e == "CLOWDY_INVOCATION_ID=inv1"));
    }

    #[test]
    fn env_provisioned_database_url_wins() {
        let vars = vec![EnvVar {
            project_id: "p".into(),
            key: "DATABASE_URL".into(),
            id: "e1".into(),
            value: "user-supplied".into(),
            is_secret: true,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }];
        let env =
            assemble_env(&vars, Some("postgres://managed/db"), &json!({}), "f", "i").unwrap();
        let urls: Vec<&String> = env
            .iter()
            .filter(|e| e.starts_with("DATABASE_URL="))
            .collect();
        assert_eq!(urls.len(), 1);
        assert_eq!(urls[0], "DATABASE_URL=postgres://managed/db");
    }

    #[test]
    fn truncate_tail_keeps_the_end() {
        let text = "aaaa TAIL";
        assert_eq!(truncate_tail(text, 4), "TAIL");
        assert_eq!(truncate_tail("short", 100), "short");
    }
}
