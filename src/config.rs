//! Application configuration.
//!
//! Settings are loaded from environment variables with defaults that work
//! for local, single-tenant use. Nothing here is hot-reloaded; the config
//! is read once at startup and shared immutably.

use crate::constants::DEFAULT_BASE_IMAGE;

/// Runtime configuration for the server binary.
#[derive(Debug, Clone)]
pub struct Config {
    /// Explicit container-engine socket override (`unix://...` or a bare
    /// path). When unset, discovery falls back to well-known locations.
    pub docker_endpoint: Option<String>,

    /// Tag of the shared base runtime image (interpreter + bootstrap).
    pub base_image: String,

    /// Record-store connection string.
    pub database_url: String,

    /// HTTP listen address.
    pub bind: String,

    /// Identity-provider key-set URL. Consumed by the external auth layer;
    /// carried here so one config block describes the whole deployment.
    pub auth_keyset_url: Option<String>,
}

impl Config {
    /// Loads configuration from the environment.
    pub fn from_env() -> Self {
        Self {
            docker_endpoint: std::env::var("CLOWDY_DOCKER_ENDPOINT").ok(),
            base_image: std::env::var("CLOWDY_BASE_IMAGE")
                .unwrap_or_else(|_| DEFAULT_BASE_IMAGE.to_string()),
            database_url: std::env::var("CLOWDY_DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://clowdy.db?mode=rwc".to_string()),
            bind: std::env::var("CLOWDY_BIND").unwrap_or_else(|_| "127.0.0.1:8000".to_string()),
            auth_keyset_url: std::env::var("CLOWDY_AUTH_KEYSET_URL").ok(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            docker_endpoint: None,
            base_image: DEFAULT_BASE_IMAGE.to_string(),
            database_url: "sqlite://clowdy.db?mode=rwc".to_string(),
            bind: "127.0.0.1:8000".to_string(),
            auth_keyset_url: None,
        }
    }
}
