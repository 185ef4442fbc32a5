//! Gateway dispatcher.
//!
//! Receives external HTTP requests at `/api/gateway/{slug}[/...]`, matches
//! them against the project's compiled route table, builds the HTTP event
//! object, delegates to the invocation engine, and shapes the function's
//! return value into an HTTP response.
//!
//! The gateway is public by design: these are deployed endpoints meant to
//! be called by external clients. Request bodies are capped before any
//! container is involved; untrusted code behind a small memory limit
//! should not receive arbitrarily large payloads.

use crate::api::AppState;
use crate::constants::MAX_GATEWAY_BODY_BYTES;
use crate::error::{Error, Result};
use crate::invoke::{InvocationResult, InvokeRequest};
use crate::routes::normalize_request_path;
use crate::store::{FunctionStatus, InvocationSource, InvocationStatus};
use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::debug;

/// Request headers never forwarded into the event object.
const STRIPPED_HEADERS: [&str; 4] = ["host", "connection", "authorization", "content-length"];

/// Gateway routes, with the body cap applied before dispatch.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/gateway/{slug}", any(gateway_root))
        .route("/api/gateway/{slug}/{*rest}", any(gateway_rest))
        .layer(DefaultBodyLimit::max(MAX_GATEWAY_BODY_BYTES))
}

async fn gateway_root(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    dispatch(state, slug, "/".to_string(), method, query, headers, body).await
}

async fn gateway_rest(
    State(state): State<AppState>,
    Path((slug, rest)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let path = normalize_request_path(&rest);
    dispatch(state, slug, path, method, query, headers, body).await
}

/// Core dispatch: slug → project → route → function → invoke → shape.
async fn dispatch(
    state: AppState,
    slug: String,
    path: String,
    method: Method,
    query: HashMap<String, String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let project = state
        .store
        .project_by_slug(&slug)
        .await?
        .ok_or_else(|| Error::NotFound("Project not found".to_string()))?;

    let routes = state.store.routes(&project.id).await?;
    if routes.is_empty() {
        return Err(Error::NotFound(
            "No routes configured for this project".to_string(),
        ));
    }

    let table = state.route_cache.table_for(&project.id, &routes);
    let matched = table
        .match_route(method.as_str(), &path)
        .ok_or_else(|| Error::NotFound(format!("No route matches {method} {path}")))?;

    let function = state
        .store
        .function(&matched.function_id)
        .await?
        .filter(|f| f.status == FunctionStatus::Active)
        .ok_or_else(|| {
            Error::Unavailable("The function for this route is not available".to_string())
        })?;

    let event = build_event(method.as_str(), &path, &matched.params, &query, &headers, &body);
    debug!(project = %project.id, function = %function.id, %path, "gateway dispatch");

    let result = state
        .invoker
        .invoke(InvokeRequest {
            function,
            input: event,
            source: InvocationSource::Gateway,
            http_method: Some(method.to_string()),
            http_path: Some(path),
        })
        .await?;

    Ok(shape_response(&result))
}

// =============================================================================
// HTTP Event
// =============================================================================

/// Builds the event object handed to gateway-invoked functions.
///
/// Headers are lowercased with hop-by-hop and credential headers removed;
/// the body is parsed as JSON when the content type says so and the
/// payload parses, kept as text when it is UTF-8, and null otherwise.
pub(crate) fn build_event(
    method: &str,
    path: &str,
    params: &HashMap<String, String>,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
    body: &[u8],
) -> Value {
    let mut event_headers = serde_json::Map::new();
    for (name, value) in headers {
        let name = name.as_str().to_ascii_lowercase();
        if STRIPPED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            event_headers.insert(name, Value::String(value.to_string()));
        }
    }

    let is_json = headers
        .get(CONTENT_TYPE)
        .and_then(|ct| ct.to_str().ok())
        .map(|ct| ct.to_ascii_lowercase().contains("application/json"))
        .unwrap_or(false);

    let body_value = if body.is_empty() {
        Value::Null
    } else if is_json {
        serde_json::from_slice::<Value>(body).unwrap_or_else(|_| fallback_text(body))
    } else {
        fallback_text(body)
    };

    json!({
        "method": method,
        "path": path,
        "params": params,
        "query": query,
        "headers": Value::Object(event_headers),
        "body": body_value,
    })
}

fn fallback_text(body: &[u8]) -> Value {
    match std::str::from_utf8(body) {
        Ok(text) => Value::String(text.to_string()),
        Err(_) => Value::Null,
    }
}

// =============================================================================
// Response Shaping
// =============================================================================

/// Shapes an invocation result into the gateway's HTTP response.
///
/// A returned object with a `statusCode` key drives the full response
/// contract (`statusCode`/`headers`/`body`); any other value is returned
/// as `200` JSON. Engine errors map to 500, timeouts to 504.
pub(crate) fn shape_response(result: &InvocationResult) -> Response {
    match result.status {
        InvocationStatus::Timeout => {
            error_response(StatusCode::GATEWAY_TIMEOUT, &result.error_message())
        }
        InvocationStatus::Error => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &result.error_message())
        }
        InvocationStatus::Success => {
            if result.output.get("statusCode").is_some() {
                contract_response(&result.output)
            } else {
                let mut response = Response::new(Body::from(result.output.to_string()));
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                response
            }
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    let mut response = Json(json!({ "error": message })).into_response();
    *response.status_mut() = status;
    response
}

/// Builds a response from the `{statusCode, headers, body}` contract.
fn contract_response(output: &Value) -> Response {
    let status = output
        .get("statusCode")
        .and_then(Value::as_u64)
        .and_then(|code| u16::try_from(code).ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::OK);

    let mut headers = HeaderMap::new();
    if let Some(given) = output.get("headers").and_then(Value::as_object) {
        for (name, value) in given {
            let Some(value) = value.as_str() else { continue };
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value),
            ) {
                headers.insert(name, value);
            }
        }
    }

    let body = match output.get("body") {
        Some(Value::String(text)) => {
            if !headers.contains_key(CONTENT_TYPE) {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
            }
            text.clone()
        }
        Some(value) => {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            value.to_string()
        }
        None => {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            Value::Null.to_string()
        }
    };

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
