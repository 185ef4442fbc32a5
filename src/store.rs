//! Record store: entities and queries.
//!
//! One SQLite database holds projects, functions, env vars, routes, and the
//! append-only invocation log. The execution plane reads project/function
//! state from here and writes exactly two things: image-build state
//! transitions and invocation records.
//!
//! Invocations are facts, not state: rows are inserted with a single
//! statement and never mutated. No transaction spans components.

use crate::constants::INVOCATION_LIST_LIMIT;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

// =============================================================================
// Entities
// =============================================================================

/// Project lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ProjectStatus {
    Active,
    Archived,
}

/// Per-project image build state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum BuildStatus {
    /// No per-project image; the base runtime serves this project.
    None,
    /// A build is in flight; invocations wait on the build lock.
    Building,
    /// `runtime_image_tag` is current for `requirements_hash`.
    Ready,
    /// The last build failed; the previous ready tag is retained.
    Failed,
}

/// Function lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum FunctionStatus {
    Active,
    Disabled,
}

/// Terminal classification of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum InvocationStatus {
    Success,
    Error,
    Timeout,
}

/// How an invocation entered the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum InvocationSource {
    Direct,
    Gateway,
}

/// A project: the deployable unit grouping functions, env vars, routes,
/// an optional managed database, and a dependency manifest.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Project {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub slug: String,
    pub status: ProjectStatus,
    pub database_url: Option<String>,
    pub runtime_image_tag: Option<String>,
    pub requirements_text: String,
    pub requirements_hash: String,
    pub image_build_status: BuildStatus,
    pub image_build_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A stored function: source text plus metadata.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Function {
    pub id: String,
    pub project_id: Option<String>,
    pub owner_id: String,
    pub name: String,
    pub description: String,
    pub code: String,
    pub runtime_id: String,
    pub status: FunctionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A per-project environment variable. `is_secret` affects only UI
/// rendering, never runtime injection.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct EnvVar {
    pub project_id: String,
    pub key: String,
    pub id: String,
    pub value: String,
    pub is_secret: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A gateway route: method + path pattern → function, within one project.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Route {
    pub id: String,
    pub project_id: String,
    pub function_id: String,
    pub method: String,
    pub path_pattern: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One recorded invocation. Append-only.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Invocation {
    pub id: String,
    pub function_id: String,
    pub input_json: String,
    pub output_json: String,
    pub status: InvocationStatus,
    pub duration_ms: i64,
    pub source: InvocationSource,
    pub http_method: Option<String>,
    pub http_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Dashboard aggregate over one owner's functions.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct OwnerStats {
    pub total_functions: i64,
    pub total_invocations: i64,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
}

/// Generates an opaque record id.
pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Converts a human name into a URL-safe slug: lowercase, hyphen-separated.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_hyphen = true;
    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_hyphen = false;
        } else if (ch.is_whitespace() || ch == '-' || ch == '_') && !last_hyphen {
            slug.push('-');
            last_hyphen = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        "project".to_string()
    } else {
        slug
    }
}

// =============================================================================
// Store
// =============================================================================

/// Handle to the record store. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Connects to the store and applies pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(Error::Database)?
            .create_if_missing(true)
            .foreign_keys(true);
        // In-memory databases exist per connection; a pool of one keeps
        // every query on the same database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| Error::Internal(format!("migration failed: {e}")))?;
        info!("record store ready at {database_url}");
        Ok(Self { pool })
    }

    /// Underlying pool, for tests that need raw queries.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn project(&self, id: &str) -> Result<Option<Project>> {
        let row = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn project_by_slug(&self, slug: &str) -> Result<Option<Project>> {
        let row = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE slug = ?")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn function(&self, id: &str) -> Result<Option<Function>> {
        let row = sqlx::query_as::<_, Function>("SELECT * FROM functions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Env vars for a project, ordered by key.
    pub async fn env_vars(&self, project_id: &str) -> Result<Vec<EnvVar>> {
        let rows = sqlx::query_as::<_, EnvVar>(
            "SELECT * FROM env_vars WHERE project_id = ? ORDER BY key",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Routes for a project in insertion order (the compiler's stable
    /// tie-break).
    pub async fn routes(&self, project_id: &str) -> Result<Vec<Route>> {
        let rows = sqlx::query_as::<_, Route>(
            "SELECT * FROM routes WHERE project_id = ? ORDER BY created_at, id",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // =========================================================================
    // Image Build Transitions
    // =========================================================================

    pub async fn mark_build_started(&self, project_id: &str) -> Result<()> {
        sqlx::query("UPDATE projects SET image_build_status = 'building', updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Records a successful build: canonical manifest, hash, and tag are
    /// persisted together; any previous failure message is cleared.
    pub async fn mark_build_succeeded(
        &self,
        project_id: &str,
        canonical_text: &str,
        requirements_hash: &str,
        image_tag: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE projects SET requirements_text = ?, requirements_hash = ?, \
             runtime_image_tag = ?, image_build_status = 'ready', \
             image_build_error = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(canonical_text)
        .bind(requirements_hash)
        .bind(image_tag)
        .bind(Utc::now())
        .bind(project_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Records a failed build. The previous `runtime_image_tag` is
    /// deliberately retained so prior invocations keep working.
    pub async fn mark_build_failed(&self, project_id: &str, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE projects SET image_build_status = 'failed', image_build_error = ?, \
             updated_at = ? WHERE id = ?",
        )
        .bind(error)
        .bind(Utc::now())
        .bind(project_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // =========================================================================
    // Invocation Log (C7)
    // =========================================================================

    /// Appends one invocation record. Single statement, never updated.
    #[allow(clippy::too_many_arguments)]
    pub async fn append_invocation(
        &self,
        id: &str,
        function_id: &str,
        input_json: &str,
        output_json: &str,
        status: InvocationStatus,
        duration_ms: i64,
        source: InvocationSource,
        http_method: Option<&str>,
        http_path: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO invocations \
             (id, function_id, input_json, output_json, status, duration_ms, \
              source, http_method, http_path, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(function_id)
        .bind(input_json)
        .bind(output_json)
        .bind(status)
        .bind(duration_ms)
        .bind(source)
        .bind(http_method)
        .bind(http_path)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Invocations for one function, newest first.
    pub async fn invocations(&self, function_id: &str) -> Result<Vec<Invocation>> {
        let rows = sqlx::query_as::<_, Invocation>(
            "SELECT * FROM invocations WHERE function_id = ? \
             ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(function_id)
        .bind(INVOCATION_LIST_LIMIT)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Aggregate over all invocations of one owner's functions.
    pub async fn aggregate(&self, owner_id: &str) -> Result<OwnerStats> {
        let stats = sqlx::query_as::<_, OwnerStats>(
            "SELECT \
               (SELECT COUNT(*) FROM functions WHERE owner_id = ?) AS total_functions, \
               COUNT(i.id) AS total_invocations, \
               COALESCE(AVG(CASE WHEN i.status = 'success' THEN 1.0 ELSE 0.0 END), 0.0) \
                   AS success_rate, \
               COALESCE(AVG(CAST(i.duration_ms AS REAL)), 0.0) AS avg_duration_ms \
             FROM invocations i \
             JOIN functions f ON f.id = i.function_id \
             WHERE f.owner_id = ?",
        )
        .bind(owner_id)
        .bind(owner_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(stats)
    }

    // =========================================================================
    // Record Creation (consumed by seeding and the external CRUD layer)
    // =========================================================================

    /// Creates a project. The slug is generated from the name; on collision
    /// within the owner a short random token is suffixed.
    pub async fn create_project(&self, owner_id: &str, name: &str) -> Result<Project> {
        let base = slugify(name);
        let mut slug = base.clone();
        loop {
            let taken = sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM projects WHERE owner_id = ? AND slug = ?",
            )
            .bind(owner_id)
            .bind(&slug)
            .fetch_one(&self.pool)
            .await?;
            if taken == 0 {
                break;
            }
            slug = format!("{base}-{}", &new_id()[..6]);
        }

        let id = new_id();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO projects (id, owner_id, name, slug, status, requirements_text, \
             requirements_hash, image_build_status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, 'active', '', '', 'none', ?, ?)",
        )
        .bind(&id)
        .bind(owner_id)
        .bind(name)
        .bind(&slug)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.project(&id)
            .await?
            .ok_or_else(|| Error::Internal("project vanished after insert".to_string()))
    }

    pub async fn create_function(
        &self,
        project_id: Option<&str>,
        owner_id: &str,
        name: &str,
        code: &str,
    ) -> Result<Function> {
        let id = new_id();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO functions (id, project_id, owner_id, name, description, code, \
             runtime_id, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, '', ?, 'python', 'active', ?, ?)",
        )
        .bind(&id)
        .bind(project_id)
        .bind(owner_id)
        .bind(name)
        .bind(code)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.function(&id)
            .await?
            .ok_or_else(|| Error::Internal("function vanished after insert".to_string()))
    }

    /// Upserts an env var. An existing key keeps its row id and
    /// `created_at`; only `value`, `is_secret`, and `updated_at` move.
    pub async fn set_env_var(
        &self,
        project_id: &str,
        key: &str,
        value: &str,
        is_secret: bool,
    ) -> Result<EnvVar> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO env_vars (project_id, key, id, value, is_secret, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(project_id, key) DO UPDATE SET \
               value = excluded.value, \
               is_secret = excluded.is_secret, \
               updated_at = excluded.updated_at",
        )
        .bind(project_id)
        .bind(key)
        .bind(new_id())
        .bind(value)
        .bind(is_secret)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as::<_, EnvVar>(
            "SELECT * FROM env_vars WHERE project_id = ? AND key = ?",
        )
        .bind(project_id)
        .bind(key)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    /// Adds a route after validating the method and path pattern.
    /// Duplicate `(project_id, method, path_pattern)` rows and
    /// cross-project function references are rejected.
    pub async fn add_route(
        &self,
        project_id: &str,
        function_id: &str,
        method: &str,
        path_pattern: &str,
    ) -> Result<Route> {
        let method = crate::routes::validate_method(method)?;
        let path = crate::routes::normalize_pattern(path_pattern)?;

        let function = self
            .function(function_id)
            .await?
            .ok_or_else(|| Error::Validation("function not found in this project".to_string()))?;
        if function.project_id.as_deref() != Some(project_id) {
            return Err(Error::Validation(
                "function not found in this project".to_string(),
            ));
        }

        let duplicate = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM routes WHERE project_id = ? AND method = ? AND path_pattern = ?",
        )
        .bind(project_id)
        .bind(&method)
        .bind(&path)
        .fetch_one(&self.pool)
        .await?;
        if duplicate > 0 {
            return Err(Error::Validation(format!(
                "route {method} {path} already exists in this project"
            )));
        }

        let id = new_id();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO routes (id, project_id, function_id, method, path_pattern, \
             created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(project_id)
        .bind(function_id)
        .bind(&method)
        .bind(&path)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as::<_, Route>("SELECT * FROM routes WHERE id = ?")
            .bind(&id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    /// Stores a raw dependency manifest. Canonicalization happens in the
    /// image lifecycle manager when a build runs.
    pub async fn set_requirements(&self, project_id: &str, text: &str) -> Result<()> {
        sqlx::query("UPDATE projects SET requirements_text = ?, updated_at = ? WHERE id = ?")
            .bind(text)
            .bind(Utc::now())
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Attaches a provisioned database connection string to a project.
    pub async fn set_database_url(&self, project_id: &str, url: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE projects SET database_url = ?, updated_at = ? WHERE id = ?")
            .bind(url)
            .bind(Utc::now())
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
