//! # clowdy
//!
//! **Self-Hosted Serverless Function Platform — Execution Plane**
//!
//! User-authored code snippets are stored as durable records, executed on
//! demand inside short-lived isolated containers, and returned as
//! structured HTTP responses. Functions are grouped into projects carrying
//! env vars, dependency manifests, an optional managed database, and a
//! user-configurable route table.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            clowdy                                   │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │   HTTP surface (axum)                                               │
//! │   ┌───────────────────┐   ┌──────────────────────────────────┐      │
//! │   │  Direct Invoker   │   │        Gateway Dispatcher        │      │
//! │   │ POST /api/invoke  │   │  ANY /api/gateway/{slug}[/...]   │      │
//! │   └─────────┬─────────┘   └───────┬───────────────┬──────────┘      │
//! │             │                     │   Route Compiler + cache        │
//! │             ▼                     ▼                                 │
//! │   ┌─────────────────────────────────────────────┐                   │
//! │   │              Invocation Engine              │                   │
//! │   │  resolve image → env → create → inject code │                   │
//! │   │  → wait (30 s) → classify stdout → record   │                   │
//! │   └─────────┬─────────────────────┬─────────────┘                   │
//! │             │                     │                                 │
//! │             ▼                     ▼                                 │
//! │   ┌───────────────────┐  ┌─────────────────────┐                    │
//! │   │  Image Lifecycle  │  │    Record Store     │                    │
//! │   │ canonical manifest│  │ projects/functions/ │                    │
//! │   │ → sha256 → build  │  │ routes + append-only│                    │
//! │   │   (per-proj lock) │  │   invocation log    │                    │
//! │   └─────────┬─────────┘  └─────────────────────┘                    │
//! ├─────────────┼───────────────────────────────────────────────────────┤
//! │             ▼          Container Host Adapter                       │
//! │   ContainerEngine trait → DockerEngine (Engine API, Unix socket)    │
//! │   build / create / put_archive / start_and_wait / logs / remove     │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Security Model
//!
//! User code is untrusted. Every invocation runs in a fresh container
//! under a fixed floor that is never relaxed per request:
//!
//! - Memory capped at 128 MiB, CPU at 0.5 cores, bounded PIDs
//! - Network disabled
//! - Read-only root filesystem; a small tmpfs at `/tmp` is the only
//!   writable path
//! - Code is delivered by streaming a tar archive into the container;
//!   there are **no host-path mounts** anywhere in the adapter surface
//! - A 30 s wall clock, enforced by stop-then-kill
//!
//! # Invocation Contract
//!
//! The container's bootstrap reads `INPUT_JSON`, loads `/app/function.py`,
//! calls `handler`, and prints the return value as a single JSON line on
//! stdout. The engine parses the last non-empty stdout line; exit 0 plus a
//! parsable line is success, everything else is an error carrying the
//! bootstrap's structured stderr. Every run appends exactly one record to
//! the invocation log.

pub mod api;
pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod images;
pub mod invoke;
pub mod routes;
pub mod store;

pub use config::Config;
pub use engine::{ContainerEngine, DockerEngine};
pub use error::{Error, Result};
pub use images::ImageManager;
pub use invoke::{InvocationResult, InvokeRequest, Invoker};
pub use routes::{RouteCache, RouteTable};
pub use store::Store;
