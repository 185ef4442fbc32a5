//! Image lifecycle manager.
//!
//! For a given project, returns the image tag whose runtime contains the
//! declared dependencies, building on demand. Builds are cache-keyed: the
//! dependency manifest is canonicalized, hashed, and the hash becomes part
//! of the tag, so equal manifests share one image and a changed manifest
//! can never collide with a stale one.
//!
//! # Canonicalization
//!
//! Manifest text is split on line breaks, each line trimmed, blanks and
//! `#` comments dropped, the remainder sorted lexicographically and
//! rejoined with single newlines. The canonical form is what is hashed
//! and persisted; reordering or whitespace noise never triggers a rebuild.
//!
//! # Concurrency
//!
//! One `tokio::Mutex` per project serializes that project's builds; a
//! concurrent caller blocks until the first build finishes and observes
//! the recorded result. Builds for different projects run in parallel.
//! The lock map is created lazily and kept for the process lifetime,
//! bounded by project count.

use crate::constants::{IMAGE_TAG_HASH_LEN, PROJECT_IMAGE_PREFIX};
use crate::engine::{BuildContext, ContainerEngine};
use crate::error::{Error, Result};
use crate::store::Store;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Canonicalizes a raw dependency manifest.
///
/// Idempotent: `canonicalize(canonicalize(x)) == canonicalize(x)`.
pub fn canonicalize(manifest: &str) -> String {
    let mut lines: Vec<&str> = manifest
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect();
    lines.sort_unstable();
    lines.join("\n")
}

/// SHA-256 of the canonical manifest, lowercase hex.
pub fn requirements_hash(canonical: &str) -> String {
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Image tag for a project + manifest hash. Distinct hashes never collide.
pub fn image_tag(project_id: &str, hash: &str) -> String {
    let short = &hash[..IMAGE_TAG_HASH_LEN.min(hash.len())];
    format!("{PROJECT_IMAGE_PREFIX}{project_id}-{short}")
}

/// Build descriptor extending the base runtime with the manifest's
/// packages.
fn dockerfile(base_image: &str) -> String {
    format!(
        "FROM {base_image}\n\
         COPY requirements.txt /tmp/requirements.txt\n\
         RUN pip install --no-cache-dir -r /tmp/requirements.txt \
         && rm /tmp/requirements.txt\n"
    )
}

/// Manages per-project runtime images.
pub struct ImageManager {
    engine: Arc<dyn ContainerEngine>,
    store: Store,
    base_image: String,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ImageManager {
    pub fn new(engine: Arc<dyn ContainerEngine>, store: Store, base_image: String) -> Self {
        Self {
            engine,
            store,
            base_image,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Tag of the shared base runtime image.
    pub fn base_image(&self) -> &str {
        &self.base_image
    }

    /// The project's build lock, created lazily on first use.
    ///
    /// The invocation engine waits on this same lock when it finds a
    /// build in flight.
    pub fn build_lock(&self, project_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("build lock map poisoned");
        Arc::clone(
            locks
                .entry(project_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Ensures the project's dependency image exists and is recorded.
    ///
    /// Returns `Ok(Some(tag))` for a project with dependencies,
    /// `Ok(None)` when the canonical manifest is empty (the base runtime
    /// serves the project; nothing is built).
    ///
    /// State transitions recorded in the store:
    /// `none|ready|failed → building → ready|failed`. On failure the
    /// previous `runtime_image_tag` is retained and the error carries the
    /// extracted build output, not an exit status.
    pub async fn ensure_image(&self, project_id: &str) -> Result<Option<String>> {
        let project = self
            .store
            .project(project_id)
            .await?
            .ok_or_else(|| Error::NotFound("project not found".to_string()))?;

        let canonical = canonicalize(&project.requirements_text);
        if canonical.is_empty() {
            return Ok(None);
        }
        let hash = requirements_hash(&canonical);
        if project.image_build_status == crate::store::BuildStatus::Ready
            && project.requirements_hash == hash
        {
            return Ok(Some(image_tag(project_id, &hash)));
        }

        let lock = self.build_lock(project_id);
        let _guard = lock.lock().await;

        // Re-read under the lock: a concurrent caller may have finished
        // this exact build, or the manifest may have changed while waiting.
        let project = self
            .store
            .project(project_id)
            .await?
            .ok_or_else(|| Error::NotFound("project not found".to_string()))?;
        let canonical = canonicalize(&project.requirements_text);
        if canonical.is_empty() {
            return Ok(None);
        }
        let hash = requirements_hash(&canonical);
        let tag = image_tag(project_id, &hash);
        if project.image_build_status == crate::store::BuildStatus::Ready
            && project.requirements_hash == hash
        {
            return Ok(Some(tag));
        }

        // The engine may already hold the image (say, after a restart);
        // adopt it instead of rebuilding.
        if self.engine.image_exists(&tag).await.unwrap_or(false) {
            self.store
                .mark_build_succeeded(project_id, &canonical, &hash, &tag)
                .await?;
            return Ok(Some(tag));
        }

        self.store.mark_build_started(project_id).await?;
        info!(project = project_id, tag = %tag, "building dependency image");

        let mut context = BuildContext::new();
        context.add_file("Dockerfile", dockerfile(&self.base_image));
        context.add_file("requirements.txt", format!("{canonical}\n"));

        match self.engine.build_image(&context, &tag).await {
            Ok(()) => {
                self.store
                    .mark_build_succeeded(project_id, &canonical, &hash, &tag)
                    .await?;
                Ok(Some(tag))
            }
            Err(Error::ImageBuild { message }) => {
                warn!(project = project_id, "dependency image build failed");
                self.store.mark_build_failed(project_id, &message).await?;
                Err(Error::ImageBuild { message })
            }
            Err(other) => {
                self.store
                    .mark_build_failed(project_id, &other.to_string())
                    .await?;
                Err(other)
            }
        }
    }
}
