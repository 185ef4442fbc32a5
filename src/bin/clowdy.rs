//! clowdy server binary.
//!
//! Wires configuration, the record store, the container engine, and the
//! HTTP surface together. A missing container engine is a fatal startup
//! error: the platform cannot run functions without one.

use clowdy::api::{create_router, AppState};
use clowdy::routes::RouteCache;
use clowdy::{Config, DockerEngine, ImageManager, Invoker, Store};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "clowdy=info,info".into()),
        )
        .init();

    let config = Config::from_env();

    let store = match Store::connect(&config.database_url).await {
        Ok(store) => store,
        Err(e) => {
            error!("failed to open record store: {e}");
            return ExitCode::FAILURE;
        }
    };

    let engine = match DockerEngine::connect(config.docker_endpoint.as_deref()).await {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            error!("failed to connect to container engine: {e}");
            return ExitCode::FAILURE;
        }
    };

    let images = Arc::new(ImageManager::new(
        engine.clone(),
        store.clone(),
        config.base_image.clone(),
    ));
    let invoker = Invoker::new(store.clone(), engine, images);

    let state = AppState {
        store,
        invoker,
        route_cache: Arc::new(RouteCache::new()),
    };

    let listener = match tokio::net::TcpListener::bind(&config.bind).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {}: {e}", config.bind);
            return ExitCode::FAILURE;
        }
    };
    info!("listening on {}", config.bind);

    if let Err(e) = axum::serve(listener, create_router(state)).await {
        error!("server error: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
