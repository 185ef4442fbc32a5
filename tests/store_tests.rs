//! Record store tests against an in-memory database.

use clowdy::store::{
    BuildStatus, InvocationSource, InvocationStatus, Store,
};

async fn store() -> Store {
    Store::connect("sqlite::memory:").await.unwrap()
}

// =============================================================================
// Projects and Slugs
// =============================================================================

#[tokio::test]
async fn slug_is_generated_from_name() {
    let store = store().await;
    let project = store.create_project("owner1", "My Weather API").await.unwrap();
    assert_eq!(project.slug, "my-weather-api");
    assert_eq!(project.image_build_status, BuildStatus::None);
    assert!(project.runtime_image_tag.is_none());
}

#[tokio::test]
async fn slug_collision_gets_a_random_suffix() {
    let store = store().await;
    let first = store.create_project("owner1", "api").await.unwrap();
    let second = store.create_project("owner1", "api").await.unwrap();

    assert_eq!(first.slug, "api");
    assert_ne!(second.slug, "api");
    assert!(second.slug.starts_with("api-"));
}

#[tokio::test]
async fn project_lookup_by_slug() {
    let store = store().await;
    let created = store.create_project("owner1", "gateway demo").await.unwrap();
    let found = store.project_by_slug("gateway-demo").await.unwrap().unwrap();
    assert_eq!(found.id, created.id);
    assert!(store.project_by_slug("nope").await.unwrap().is_none());
}

// =============================================================================
// Env Vars
// =============================================================================

#[tokio::test]
async fn env_var_upsert_keeps_row_identity() {
    let store = store().await;
    let project = store.create_project("owner1", "p").await.unwrap();

    let first = store
        .set_env_var(&project.id, "API_KEY", "abc", false)
        .await
        .unwrap();
    let second = store
        .set_env_var(&project.id, "API_KEY", "abc", false)
        .await
        .unwrap();

    // Same row: id and created_at survive the upsert.
    assert_eq!(first.id, second.id);
    assert_eq!(first.created_at, second.created_at);

    let all = store.env_vars(&project.id).await.unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn env_var_upsert_updates_value_and_secrecy() {
    let store = store().await;
    let project = store.create_project("owner1", "p").await.unwrap();

    store.set_env_var(&project.id, "TOKEN", "old", false).await.unwrap();
    let updated = store.set_env_var(&project.id, "TOKEN", "new", true).await.unwrap();

    assert_eq!(updated.value, "new");
    assert!(updated.is_secret);
}

// =============================================================================
// Routes
// =============================================================================

#[tokio::test]
async fn duplicate_route_is_rejected() {
    let store = store().await;
    let project = store.create_project("owner1", "p").await.unwrap();
    let function = store
        .create_function(Some(&project.id), "owner1", "handler", "def handler(i): return i")
        .await
        .unwrap();

    store
        .add_route(&project.id, &function.id, "GET", "/users/:id")
        .await
        .unwrap();
    let duplicate = store
        .add_route(&project.id, &function.id, "get", "/users/:id/")
        .await;
    assert!(duplicate.is_err(), "same method+path must be unique per project");
}

#[tokio::test]
async fn route_must_target_a_function_in_the_same_project() {
    let store = store().await;
    let project_a = store.create_project("owner1", "a").await.unwrap();
    let project_b = store.create_project("owner1", "b").await.unwrap();
    let foreign = store
        .create_function(Some(&project_b.id), "owner1", "f", "def handler(i): return 1")
        .await
        .unwrap();

    let result = store.add_route(&project_a.id, &foreign.id, "GET", "/x").await;
    assert!(result.is_err());
}

#[tokio::test]
async fn route_path_is_normalized_on_insert() {
    let store = store().await;
    let project = store.create_project("owner1", "p").await.unwrap();
    let function = store
        .create_function(Some(&project.id), "owner1", "f", "def handler(i): return 1")
        .await
        .unwrap();

    let created = store
        .add_route(&project.id, &function.id, "post", "users/:id/")
        .await
        .unwrap();
    assert_eq!(created.method, "POST");
    assert_eq!(created.path_pattern, "/users/:id");
}

// =============================================================================
// Build Transitions
// =============================================================================

#[tokio::test]
async fn build_transitions_persist_state() {
    let store = store().await;
    let project = store.create_project("owner1", "p").await.unwrap();

    store.mark_build_started(&project.id).await.unwrap();
    let building = store.project(&project.id).await.unwrap().unwrap();
    assert_eq!(building.image_build_status, BuildStatus::Building);

    store
        .mark_build_succeeded(&project.id, "requests==2.31.0", "cafe", "clowdy-project-x-cafe")
        .await
        .unwrap();
    let ready = store.project(&project.id).await.unwrap().unwrap();
    assert_eq!(ready.image_build_status, BuildStatus::Ready);
    assert_eq!(ready.requirements_hash, "cafe");
    assert_eq!(ready.runtime_image_tag.as_deref(), Some("clowdy-project-x-cafe"));
    assert!(ready.image_build_error.is_none());
}

#[tokio::test]
async fn failed_build_retains_previous_tag() {
    let store = store().await;
    let project = store.create_project("owner1", "p").await.unwrap();

    store
        .mark_build_succeeded(&project.id, "a==1", "aaaa", "clowdy-project-x-aaaa")
        .await
        .unwrap();
    store
        .mark_build_failed(&project.id, "ERROR: No matching distribution found")
        .await
        .unwrap();

    let failed = store.project(&project.id).await.unwrap().unwrap();
    assert_eq!(failed.image_build_status, BuildStatus::Failed);
    // Prior invocations keep working off the last good image.
    assert_eq!(failed.runtime_image_tag.as_deref(), Some("clowdy-project-x-aaaa"));
    assert!(failed
        .image_build_error
        .as_deref()
        .unwrap()
        .contains("No matching distribution"));
}

// =============================================================================
// Invocation Log
// =============================================================================

#[tokio::test]
async fn invocations_list_newest_first_with_limit() {
    let store = store().await;
    let function = store
        .create_function(None, "owner1", "solo", "def handler(i): return 1")
        .await
        .unwrap();

    for n in 0..55 {
        store
            .append_invocation(
                &format!("inv-{n:03}"),
                &function.id,
                "{}",
                "1",
                InvocationStatus::Success,
                n,
                InvocationSource::Direct,
                None,
                None,
            )
            .await
            .unwrap();
        // Distinct timestamps keep the newest-first ordering observable.
        if n % 10 == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
    }

    let records = store.invocations(&function.id).await.unwrap();
    assert_eq!(records.len(), 50);
    for pair in records.windows(2) {
        assert!(pair[0].created_at >= pair[1].created_at);
    }
}

#[tokio::test]
async fn gateway_records_carry_method_and_path() {
    let store = store().await;
    let function = store
        .create_function(None, "owner1", "f", "def handler(i): return 1")
        .await
        .unwrap();

    store
        .append_invocation(
            "inv-1",
            &function.id,
            "{}",
            "{\"ok\":true}",
            InvocationStatus::Success,
            12,
            InvocationSource::Gateway,
            Some("GET"),
            Some("/users/42"),
        )
        .await
        .unwrap();

    let records = store.invocations(&function.id).await.unwrap();
    assert_eq!(records[0].source, InvocationSource::Gateway);
    assert_eq!(records[0].http_method.as_deref(), Some("GET"));
    assert_eq!(records[0].http_path.as_deref(), Some("/users/42"));
}

// =============================================================================
// Aggregation
// =============================================================================

#[tokio::test]
async fn aggregate_counts_only_the_owners_functions() {
    let store = store().await;
    let mine = store
        .create_function(None, "owner1", "mine", "def handler(i): return 1")
        .await
        .unwrap();
    let theirs = store
        .create_function(None, "owner2", "theirs", "def handler(i): return 1")
        .await
        .unwrap();

    for (id, status, ms) in [
        ("a", InvocationStatus::Success, 100),
        ("b", InvocationStatus::Success, 200),
        ("c", InvocationStatus::Error, 300),
        ("d", InvocationStatus::Timeout, 30_000),
    ] {
        store
            .append_invocation(id, &mine.id, "{}", "", status, ms, InvocationSource::Direct, None, None)
            .await
            .unwrap();
    }
    store
        .append_invocation(
            "other",
            &theirs.id,
            "{}",
            "",
            InvocationStatus::Success,
            5,
            InvocationSource::Direct,
            None,
            None,
        )
        .await
        .unwrap();

    let stats = store.aggregate("owner1").await.unwrap();
    assert_eq!(stats.total_functions, 1);
    assert_eq!(stats.total_invocations, 4);
    assert!((stats.success_rate - 0.5).abs() < 1e-9);
    assert!((stats.avg_duration_ms - 7650.0).abs() < 1e-6);
}

#[tokio::test]
async fn aggregate_is_zeroed_for_unknown_owner() {
    let store = store().await;
    let stats = store.aggregate("nobody").await.unwrap();
    assert_eq!(stats.total_functions, 0);
    assert_eq!(stats.total_invocations, 0);
    assert_eq!(stats.success_rate, 0.0);
    assert_eq!(stats.avg_duration_ms, 0.0);
}
