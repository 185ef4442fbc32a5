//! HTTP surface: direct invocation, invocation queries, and stats.
//!
//! The direct invoker is public by design: the opaque function id is the
//! only gate. Platform errors use the uniform `{"detail": <string>}` body;
//! function results flow through untouched.

use crate::error::{Error, Result};
use crate::invoke::{InvokeRequest, Invoker};
use crate::routes::RouteCache;
use crate::store::{FunctionStatus, Invocation, InvocationSource, OwnerStats, Store};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub invoker: Invoker,
    pub route_cache: Arc<RouteCache>,
}

/// Builds the full router: direct invoker, invocation queries, stats,
/// health, and the gateway.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/invoke/{function_id}", post(invoke_function))
        .route("/api/invocations", get(list_invocations))
        .route("/api/stats", get(owner_stats))
        .route("/api/healthz", get(health))
        .merge(crate::gateway::router())
        .with_state(state)
}

// =============================================================================
// Direct Invoker (POST /api/invoke/{function_id})
// =============================================================================

#[derive(Debug, Serialize)]
struct InvokeResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    duration_ms: i64,
    invocation_id: String,
}

/// Invokes a function by id with `{"input": <any JSON>}`.
///
/// A missing body means `input = {}`. Unknown function is 404, disabled
/// function is 400; neither records an invocation.
async fn invoke_function(
    State(state): State<AppState>,
    Path(function_id): Path<String>,
    body: Bytes,
) -> Result<Json<InvokeResponse>> {
    let input = parse_input(&body)?;

    let function = state
        .store
        .function(&function_id)
        .await?
        .ok_or_else(|| Error::NotFound("Function not found".to_string()))?;
    if function.status != FunctionStatus::Active {
        return Err(Error::Validation(
            "Function is not active (status: disabled)".to_string(),
        ));
    }

    let result = state
        .invoker
        .invoke(InvokeRequest {
            function,
            input,
            source: InvocationSource::Direct,
            http_method: None,
            http_path: None,
        })
        .await?;

    let response = if result.is_success() {
        InvokeResponse {
            success: true,
            output: Some(result.output),
            error: None,
            duration_ms: result.duration_ms,
            invocation_id: result.invocation_id,
        }
    } else {
        InvokeResponse {
            success: false,
            output: None,
            error: Some(result.error_message()),
            duration_ms: result.duration_ms,
            invocation_id: result.invocation_id,
        }
    };
    Ok(Json(response))
}

/// Extracts the `input` value from the request body.
fn parse_input(body: &[u8]) -> Result<Value> {
    if body.is_empty() {
        return Ok(json!({}));
    }
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| Error::Validation(format!("invalid JSON body: {e}")))?;
    Ok(value.get("input").cloned().unwrap_or_else(|| json!({})))
}

// =============================================================================
// Invocation Queries (C7)
// =============================================================================

#[derive(Debug, Deserialize)]
struct InvocationsQuery {
    function_id: String,
}

/// Lists invocation records for a function, newest first, limit 50.
async fn list_invocations(
    State(state): State<AppState>,
    Query(query): Query<InvocationsQuery>,
) -> Result<Json<Vec<Invocation>>> {
    state
        .store
        .function(&query.function_id)
        .await?
        .ok_or_else(|| Error::NotFound("Function not found".to_string()))?;
    let records = state.store.invocations(&query.function_id).await?;
    Ok(Json(records))
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    owner_id: String,
}

/// Aggregate dashboard stats for one owner.
async fn owner_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<OwnerStats>> {
    Ok(Json(state.store.aggregate(&query.owner_id).await?))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
