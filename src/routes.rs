//! Route compiler: declarative route tables to ordered matchers.
//!
//! A path pattern is a sequence of `/`-separated segments, each either a
//! literal or a named parameter `:name` matching exactly one non-empty
//! segment. There are no wildcards. Compilation turns the per-project route
//! list into a matcher sorted by priority:
//!
//! 1. Exact-method routes precede `ANY` routes.
//! 2. More literal segments (fewer parameters) precede fewer. This is a
//!    static per-route score, not a per-request tie-break.
//! 3. Insertion order (oldest first) is the stable fallback.
//!
//! Compiled tables are cached per project, keyed by a fingerprint of the
//! route rows, so dispatch stays lock-free on the hot path and recompiles
//! only when the route set changes.

use crate::error::{Error, Result};
use crate::store::Route;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};
use tracing::warn;

/// Methods accepted in route definitions.
pub const VALID_METHODS: [&str; 6] = ["GET", "POST", "PUT", "PATCH", "DELETE", "ANY"];

/// Validates and uppercases a route method.
pub fn validate_method(method: &str) -> Result<String> {
    let method = method.to_ascii_uppercase();
    if VALID_METHODS.contains(&method.as_str()) {
        Ok(method)
    } else {
        Err(Error::Validation(format!(
            "invalid method '{method}', must be one of: {}",
            VALID_METHODS.join(", ")
        )))
    }
}

/// Normalizes a path pattern (leading slash enforced, trailing slash
/// stripped) and validates its segments.
pub fn normalize_pattern(pattern: &str) -> Result<String> {
    let mut path = pattern.trim().to_string();
    if !path.starts_with('/') {
        path.insert(0, '/');
    }
    while path.len() > 1 && path.ends_with('/') {
        path.pop();
    }
    // Parse to validate; the compiled form is discarded here.
    CompiledPattern::parse(&path)?;
    Ok(path)
}

// =============================================================================
// Pattern
// =============================================================================

/// One segment of a compiled pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// An anchored matcher for one path pattern.
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    raw: String,
    segments: Vec<Segment>,
    literal_count: usize,
}

impl CompiledPattern {
    /// Parses a normalized pattern (`/users/:id`, `/health`, `/`).
    pub fn parse(pattern: &str) -> Result<Self> {
        if !pattern.starts_with('/') {
            return Err(Error::Validation(format!(
                "path pattern must start with '/': '{pattern}'"
            )));
        }
        let mut segments = Vec::new();
        let mut literal_count = 0;
        if pattern != "/" {
            for piece in pattern[1..].split('/') {
                if piece.is_empty() {
                    return Err(Error::Validation(format!(
                        "path pattern has an empty segment: '{pattern}'"
                    )));
                }
                if let Some(name) = piece.strip_prefix(':') {
                    if name.is_empty()
                        || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                    {
                        return Err(Error::Validation(format!(
                            "invalid parameter name ':{name}' in '{pattern}'"
                        )));
                    }
                    segments.push(Segment::Param(name.to_string()));
                } else {
                    segments.push(Segment::Literal(piece.to_string()));
                    literal_count += 1;
                }
            }
        }
        Ok(Self {
            raw: pattern.to_string(),
            segments,
            literal_count,
        })
    }

    /// The pattern as written.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Number of literal (non-parameter) segments; the priority score.
    pub fn literal_count(&self) -> usize {
        self.literal_count
    }

    /// Matches a normalized request path, capturing named parameters.
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let path_segments: Vec<&str> = if path == "/" {
            Vec::new()
        } else {
            path.strip_prefix('/')?.split('/').collect()
        };
        if path_segments.len() != self.segments.len() {
            return None;
        }
        let mut params = HashMap::new();
        for (segment, value) in self.segments.iter().zip(path_segments) {
            match segment {
                Segment::Literal(lit) => {
                    if lit != value {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    if value.is_empty() {
                        return None;
                    }
                    params.insert(name.clone(), value.to_string());
                }
            }
        }
        Some(params)
    }
}

/// Normalizes an incoming request path for matching: leading slash
/// enforced, trailing slash stripped, empty becomes `/`.
pub fn normalize_request_path(path: &str) -> String {
    let mut path = path.to_string();
    if !path.starts_with('/') {
        path.insert(0, '/');
    }
    while path.len() > 1 && path.ends_with('/') {
        path.pop();
    }
    path
}

// =============================================================================
// Route Table
// =============================================================================

/// One compiled route.
#[derive(Debug, Clone)]
pub struct CompiledRoute {
    pub route_id: String,
    pub function_id: String,
    pub method: String,
    pub pattern: CompiledPattern,
}

/// The result of a successful match.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub route_id: String,
    pub function_id: String,
    pub params: HashMap<String, String>,
}

/// A project's compiled, priority-ordered route list.
#[derive(Debug, Default)]
pub struct RouteTable {
    /// Sorted by literal count descending, then insertion order.
    routes: Vec<CompiledRoute>,
}

impl RouteTable {
    /// Compiles stored routes (given in insertion order). Rows whose
    /// pattern fails to parse are skipped with a warning rather than
    /// poisoning dispatch for the whole project.
    pub fn compile(routes: &[Route]) -> Self {
        let mut compiled: Vec<(usize, CompiledRoute)> = Vec::with_capacity(routes.len());
        for (seq, route) in routes.iter().enumerate() {
            match CompiledPattern::parse(&route.path_pattern) {
                Ok(pattern) => compiled.push((
                    seq,
                    CompiledRoute {
                        route_id: route.id.clone(),
                        function_id: route.function_id.clone(),
                        method: route.method.to_ascii_uppercase(),
                        pattern,
                    },
                )),
                Err(e) => {
                    warn!(route = %route.id, "skipping uncompilable route: {e}");
                }
            }
        }
        compiled.sort_by(|(seq_a, a), (seq_b, b)| {
            b.pattern
                .literal_count()
                .cmp(&a.pattern.literal_count())
                .then(seq_a.cmp(seq_b))
        });
        Self {
            routes: compiled.into_iter().map(|(_, r)| r).collect(),
        }
    }

    /// Finds the first route matching the request, in priority order:
    /// exact-method routes first, then `ANY`.
    pub fn match_route(&self, method: &str, path: &str) -> Option<RouteMatch> {
        let method = method.to_ascii_uppercase();
        let path = normalize_request_path(path);
        for pass_method in [method.as_str(), "ANY"] {
            for route in &self.routes {
                if route.method != pass_method {
                    continue;
                }
                if let Some(params) = route.pattern.matches(&path) {
                    return Some(RouteMatch {
                        route_id: route.route_id.clone(),
                        function_id: route.function_id.clone(),
                        params,
                    });
                }
            }
        }
        None
    }

    /// Number of compiled routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// True when no routes compiled.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

// =============================================================================
// Cache
// =============================================================================

/// Fingerprint of a route set; changes whenever any row changes.
pub fn fingerprint(routes: &[Route]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for route in routes {
        route.id.hash(&mut hasher);
        route.method.hash(&mut hasher);
        route.path_pattern.hash(&mut hasher);
        route.function_id.hash(&mut hasher);
        route.updated_at.timestamp_micros().hash(&mut hasher);
    }
    hasher.finish()
}

/// Per-project cache of compiled route tables.
///
/// Keyed by project id; invalidated by comparing fingerprints of the
/// freshly-loaded route rows, so a stale compiled form is never served.
#[derive(Debug, Default)]
pub struct RouteCache {
    inner: RwLock<HashMap<String, (u64, Arc<RouteTable>)>>,
}

impl RouteCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the compiled table for the given rows, recompiling only
    /// when the fingerprint moved.
    pub fn table_for(&self, project_id: &str, routes: &[Route]) -> Arc<RouteTable> {
        let fp = fingerprint(routes);
        {
            let cache = self.inner.read().expect("route cache poisoned");
            if let Some((cached_fp, table)) = cache.get(project_id) {
                if *cached_fp == fp {
                    return Arc::clone(table);
                }
            }
        }
        let table = Arc::new(RouteTable::compile(routes));
        let mut cache = self.inner.write().expect("route cache poisoned");
        cache.insert(project_id.to_string(), (fp, Arc::clone(&table)));
        table
    }
}
