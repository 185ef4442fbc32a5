//! Invocation engine tests against a scripted engine fake.
//!
//! These cover the end-to-end semantics that don't need a live container
//! engine: classification, recording, isolation limits, env injection,
//! and the dependency-image build flow.

mod common;

use clowdy::images::{canonicalize, image_tag, requirements_hash, ImageManager};
use clowdy::invoke::{InvokeRequest, Invoker};
use clowdy::store::{BuildStatus, Function, InvocationSource, InvocationStatus, Store};
use common::{FakeEngine, PlannedRun};
use serde_json::json;
use std::sync::Arc;

async fn setup() -> (Store, Arc<FakeEngine>, Invoker) {
    let store = Store::connect("sqlite::memory:").await.unwrap();
    let engine = Arc::new(FakeEngine::new());
    let images = Arc::new(ImageManager::new(
        engine.clone(),
        store.clone(),
        "clowdy-python-runtime".to_string(),
    ));
    let invoker = Invoker::new(store.clone(), engine.clone(), images);
    (store, engine, invoker)
}

async fn seed_function(store: &Store, project_id: Option<&str>) -> Function {
    store
        .create_function(
            project_id,
            "owner1",
            "echo",
            "def handler(input):\n    return {\"echo\": input}\n",
        )
        .await
        .unwrap()
}

fn direct(function: Function, input: serde_json::Value) -> InvokeRequest {
    InvokeRequest {
        function,
        input,
        source: InvocationSource::Direct,
        http_method: None,
        http_path: None,
    }
}

// =============================================================================
// Classification and Recording
// =============================================================================

#[tokio::test]
async fn echo_invocation_succeeds_and_is_recorded() {
    let (store, engine, invoker) = setup().await;
    let function = seed_function(&store, None).await;
    engine.plan(PlannedRun::success("{\"echo\": {\"n\": 7}}"));

    let result = invoker
        .invoke(direct(function.clone(), json!({"n": 7})))
        .await
        .unwrap();

    assert!(result.is_success());
    assert_eq!(result.output, json!({"echo": {"n": 7}}));
    assert!(result.duration_ms >= 0);

    let records = store.invocations(&function.id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, InvocationStatus::Success);
    assert_eq!(records[0].source, InvocationSource::Direct);
    assert!(records[0].http_method.is_none());
    // The input payload is recorded verbatim.
    assert_eq!(records[0].input_json, "{\"n\":7}");
}

#[tokio::test]
async fn timeout_is_classified_and_recorded() {
    let (store, engine, invoker) = setup().await;
    let function = seed_function(&store, None).await;
    engine.plan(PlannedRun::timeout());

    let result = invoker
        .invoke(direct(function.clone(), json!({})))
        .await
        .unwrap();

    assert_eq!(result.status, InvocationStatus::Timeout);
    assert_eq!(result.output, json!({"error": "execution timeout"}));

    let records = store.invocations(&function.id).await.unwrap();
    assert_eq!(records[0].status, InvocationStatus::Timeout);
}

#[tokio::test]
async fn handler_failure_surfaces_bootstrap_error() {
    let (store, engine, invoker) = setup().await;
    let function = seed_function(&store, None).await;
    engine.plan(PlannedRun::failure(
        1,
        "{\"error\": \"Function error: ZeroDivisionError: division by zero\", \"traceback\": \"Traceback...\"}\n",
    ));

    let result = invoker
        .invoke(direct(function.clone(), json!({})))
        .await
        .unwrap();

    assert_eq!(result.status, InvocationStatus::Error);
    assert_eq!(
        result.error_message(),
        "Function error: ZeroDivisionError: division by zero"
    );

    let records = store.invocations(&function.id).await.unwrap();
    assert_eq!(records[0].status, InvocationStatus::Error);
}

#[tokio::test]
async fn engine_refusal_is_recorded_as_error() {
    let (store, engine, invoker) = setup().await;
    let function = seed_function(&store, None).await;
    engine.refuse_creation();

    let result = invoker
        .invoke(direct(function.clone(), json!({})))
        .await
        .unwrap();

    assert_eq!(result.status, InvocationStatus::Error);
    assert_eq!(result.output["error"], "engine unavailable");

    // The log stays complete even when nothing ran.
    let records = store.invocations(&function.id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, InvocationStatus::Error);
}

// =============================================================================
// Isolation and Code Delivery
// =============================================================================

#[tokio::test]
async fn containers_get_the_isolation_floor() {
    let (store, engine, invoker) = setup().await;
    let function = seed_function(&store, None).await;
    engine.plan(PlannedRun::success("1"));

    invoker.invoke(direct(function, json!({}))).await.unwrap();

    let specs = engine.created_specs();
    assert_eq!(specs.len(), 1);
    let spec = &specs[0];
    assert!(spec.limits.memory_bytes <= 128 * 1024 * 1024);
    assert!(spec.limits.nano_cpus <= 500_000_000);
    assert!(spec.limits.read_only_rootfs);
    assert!(!spec.network_enabled);
}

#[tokio::test]
async fn code_is_injected_by_archive_and_container_removed() {
    let (store, engine, invoker) = setup().await;
    let function = seed_function(&store, None).await;
    engine.plan(PlannedRun::success("1"));

    invoker.invoke(direct(function, json!({}))).await.unwrap();

    let archives = engine.archives();
    assert_eq!(archives.len(), 1);
    assert_eq!(archives[0].1, "/");
    assert_eq!(engine.removed().len(), 1);
    assert_eq!(archives[0].0, engine.removed()[0]);
}

#[tokio::test]
async fn env_vars_and_database_url_are_injected() {
    let (store, engine, invoker) = setup().await;
    let project = store.create_project("owner1", "p").await.unwrap();
    store
        .set_env_var(&project.id, "API_KEY", "abc", false)
        .await
        .unwrap();
    store
        .set_env_var(&project.id, "DATABASE_URL", "user-own", false)
        .await
        .unwrap();
    store
        .set_database_url(&project.id, Some("postgres://managed/db"))
        .await
        .unwrap();
    let function = seed_function(&store, Some(&project.id)).await;
    engine.plan(PlannedRun::success("1"));

    invoker
        .invoke(direct(function.clone(), json!({"n": 1})))
        .await
        .unwrap();

    let env = &engine.created_specs()[0].env;
    assert!(env.iter().any(|e| e == "API_KEY=abc"));
    // The provisioned database wins over the user-defined var.
    let urls: Vec<_> = env.iter().filter(|e| e.starts_with("DATABASE_URL=")).collect();
    assert_eq!(urls.len(), 1);
    assert_eq!(urls[0], "DATABASE_URL=postgres://managed/db");
    assert!(env.iter().any(|e| e == "INPUT_JSON={\"n\":1}"));
    assert!(env.iter().any(|e| e == &format!("CLOWDY_FUNCTION_ID={}", function.id)));
}

// =============================================================================
// Dependency Image Flow
// =============================================================================

#[tokio::test]
async fn first_invocation_builds_then_reuses_the_image() {
    let (store, engine, invoker) = setup().await;
    let project = store.create_project("owner1", "p").await.unwrap();
    store
        .set_requirements(&project.id, "requests==2.31.0\n")
        .await
        .unwrap();
    let function = seed_function(&store, Some(&project.id)).await;
    engine.plan(PlannedRun::success("1"));
    engine.plan(PlannedRun::success("2"));

    invoker.invoke(direct(function.clone(), json!({}))).await.unwrap();

    let expected_tag = image_tag(
        &project.id,
        &requirements_hash(&canonicalize("requests==2.31.0\n")),
    );
    assert_eq!(engine.built_tags(), vec![expected_tag.clone()]);
    assert_eq!(engine.created_specs()[0].image, expected_tag);

    let ready = store.project(&project.id).await.unwrap().unwrap();
    assert_eq!(ready.image_build_status, BuildStatus::Ready);
    assert_eq!(ready.runtime_image_tag.as_deref(), Some(expected_tag.as_str()));

    // Second invocation: cache hit, no new build.
    invoker.invoke(direct(function, json!({}))).await.unwrap();
    assert_eq!(engine.built_tags().len(), 1);
}

#[tokio::test]
async fn whitespace_only_manifest_changes_do_not_rebuild() {
    let (store, engine, invoker) = setup().await;
    let project = store.create_project("owner1", "p").await.unwrap();
    store
        .set_requirements(&project.id, "requests==2.31.0\nnumpy==1.26.0\n")
        .await
        .unwrap();
    let function = seed_function(&store, Some(&project.id)).await;
    engine.plan(PlannedRun::success("1"));
    engine.plan(PlannedRun::success("2"));

    invoker.invoke(direct(function.clone(), json!({}))).await.unwrap();
    assert_eq!(engine.built_tags().len(), 1);

    // Reorder + comment: same canonical manifest, same image.
    store
        .set_requirements(
            &project.id,
            "# deps\nnumpy==1.26.0\n\nrequests==2.31.0\n",
        )
        .await
        .unwrap();
    invoker.invoke(direct(function, json!({}))).await.unwrap();
    assert_eq!(engine.built_tags().len(), 1);
}

#[tokio::test]
async fn failed_build_surfaces_pip_output_and_falls_back() {
    let (store, engine, invoker) = setup().await;
    let project = store.create_project("owner1", "p").await.unwrap();
    store
        .set_requirements(&project.id, "nonexistent-xyz==1.0\n")
        .await
        .unwrap();
    let function = seed_function(&store, Some(&project.id)).await;
    engine.fail_builds_with("ERROR: No matching distribution found for nonexistent-xyz==1.0");
    engine.plan(PlannedRun::success("1"));

    let result = invoker.invoke(direct(function, json!({}))).await.unwrap();

    // The invocation itself still runs on the base runtime.
    assert!(result.is_success());
    assert_eq!(engine.created_specs()[0].image, "clowdy-python-runtime");

    let failed = store.project(&project.id).await.unwrap().unwrap();
    assert_eq!(failed.image_build_status, BuildStatus::Failed);
    let error = failed.image_build_error.unwrap();
    assert!(error.contains("No matching distribution"));
    assert!(!error.contains("non-zero exit"));
}

#[tokio::test]
async fn empty_manifest_uses_the_base_runtime_without_building() {
    let (store, engine, invoker) = setup().await;
    let project = store.create_project("owner1", "p").await.unwrap();
    store
        .set_requirements(&project.id, "# nothing yet\n")
        .await
        .unwrap();
    let function = seed_function(&store, Some(&project.id)).await;
    engine.plan(PlannedRun::success("1"));

    invoker.invoke(direct(function, json!({}))).await.unwrap();

    assert!(engine.built_tags().is_empty());
    assert_eq!(engine.created_specs()[0].image, "clowdy-python-runtime");
}
