//! Registry facade tests.

mod common;

use common::*;
use serde_json::json;
use strata::core::error::ErrorCode;
use strata::registry::authz::{AccessRequest, Decision, Rule, RuleAuthorizer};
use strata::registry::facade::{Request, Response};
use strata::registry::lease::LeaseRequest;
use strata::registry::model::{Gvk, Identity, Verb};
use strata::registry::resolver::KindNames;
use strata::registry::retry::RetryPolicy;
use strata::registry::store::ListOptions;
use strata::store::KvStore;

// ============================================================================
// Resolution tests
// ============================================================================

#[test]
fn singular_and_plural_resolve_to_same_keyspace() {
    let (registry, _, _) = stock_registry();
    let singular = registry.resolve(&stock_gvk()).unwrap();
    let plural = registry.resolve(&stocks_gvk()).unwrap();
    assert_eq!(singular.keyspace, plural.keyspace);
    assert_eq!(singular.keyspace.as_str(), "/registry/stocks");

    let shouting = Gvk::new("Logistics.Stockr.IO", "V1Alpha1", "STOCKS");
    assert_eq!(registry.resolve(&shouting).unwrap().keyspace.as_str(), "/registry/stocks");
    assert!(registry.resolve(&Gvk::new(STOCK_GROUP, "v1", "stock")).is_none());
}

#[tokio::test]
async fn unserved_type_never_touches_store() {
    let (registry, store, _) = stock_registry();
    let ghost = Gvk::new(STOCK_GROUP, V1ALPHA1, "ghost");

    store.fail_next(1);
    let err = assert_code(
        registry.get(&user(), &ghost.named("a")).await,
        ErrorCode::UnservedType,
    );
    assert_eq!(err.verb(), Verb::Get);
    assert_code(
        registry.list(&user(), &ghost, ListOptions::default()).await,
        ErrorCode::UnservedType,
    );
    assert_code(registry.watch(&user(), &ghost, None).await, ErrorCode::UnservedType);

    // The injected failure is still pending: nothing above reached the store.
    assert!(store.current_revision().await.is_err());
    assert_eq!(store.stats().revision, 0);
}

// ============================================================================
// CRUD tests
// ============================================================================

#[tokio::test]
async fn stock_end_to_end() {
    let (registry, _, _) = stock_registry();
    let widget = stock("widget-1");

    let created = registry
        .create(&user(), &widget, stock_payload(10), LeaseRequest::Default)
        .await
        .unwrap();
    assert_eq!(created.version, 1);
    assert_eq!(created.lease_id, None);

    assert_eq!(registry.update(&user(), &widget, stock_payload(9), 1).await.unwrap(), 2);

    let err = assert_code(
        registry.update(&user(), &widget, stock_payload(8), 1).await,
        ErrorCode::VersionConflict,
    );
    assert!(err.to_string().contains("expected 1, current 2"), "{}", err);

    registry.delete(&user(), &widget, Some(2)).await.unwrap();
    assert_code(registry.get(&user(), &widget).await, ErrorCode::NotFound);
}

#[tokio::test]
async fn stale_update_leaves_record_untouched() {
    let (registry, _, _) = stock_registry();
    let widget = stock("widget-1");
    registry
        .create(&user(), &widget, stock_payload(10), LeaseRequest::Default)
        .await
        .unwrap();
    registry.update(&user(), &widget, stock_payload(9), 1).await.unwrap();

    assert_code(
        registry.update(&user(), &widget, stock_payload(0), 1).await,
        ErrorCode::VersionConflict,
    );
    let record = registry.get(&user(), &widget).await.unwrap();
    assert_eq!(record.payload, stock_payload(9));
    assert_eq!(record.version, 2);
}

#[tokio::test]
async fn versions_strictly_increase_across_recreate() {
    let (registry, _, _) = stock_registry();
    let widget = stock("widget-1");
    let mut versions = Vec::new();

    let v = registry
        .create(&user(), &widget, stock_payload(1), LeaseRequest::Default)
        .await
        .unwrap()
        .version;
    versions.push(v);
    let v = registry.update(&user(), &widget, stock_payload(2), v).await.unwrap();
    versions.push(v);
    let v = registry.update(&user(), &widget, stock_payload(3), v).await.unwrap();
    versions.push(v);
    registry.delete(&user(), &widget, Some(v)).await.unwrap();
    let v = registry
        .create(&user(), &widget, stock_payload(4), LeaseRequest::Default)
        .await
        .unwrap()
        .version;
    versions.push(v);

    assert!(versions.windows(2).all(|w| w[0] < w[1]), "{:?}", versions);
}

#[tokio::test]
async fn create_twice_is_already_exists() {
    let (registry, _, _) = stock_registry();
    let widget = stock("widget-1");
    registry
        .create(&user(), &widget, stock_payload(1), LeaseRequest::Default)
        .await
        .unwrap();
    assert_code(
        registry
            .create(&user(), &widget, stock_payload(2), LeaseRequest::Default)
            .await,
        ErrorCode::AlreadyExists,
    );
}

#[tokio::test]
async fn update_keeps_creation_time_and_identity() {
    let (registry, _, _) = stock_registry();
    // Written through one spelling, read through the other.
    registry
        .create(&user(), &stock("widget-1"), stock_payload(1), LeaseRequest::Default)
        .await
        .unwrap();
    let before = registry.get(&user(), &stocks_gvk().named("widget-1")).await.unwrap();
    assert_eq!(before.identity.gvk.kind, "stocks");

    registry
        .update(&user(), &stock("widget-1"), json!({ "sku": "gadget" }), 1)
        .await
        .unwrap();
    let after = registry.get(&user(), &stock("widget-1")).await.unwrap();
    assert_eq!(after.created_at_ms, before.created_at_ms);
    assert!(after.modified_at_ms >= before.modified_at_ms);
    assert_eq!(after.payload["sku"], "gadget");
}

#[tokio::test]
async fn delete_checks_presence_and_version() {
    let (registry, _, _) = stock_registry();
    let widget = stock("widget-1");
    assert_code(registry.delete(&user(), &widget, None).await, ErrorCode::NotFound);

    registry
        .create(&user(), &widget, stock_payload(1), LeaseRequest::Default)
        .await
        .unwrap();
    assert_code(
        registry.delete(&user(), &widget, Some(7)).await,
        ErrorCode::VersionConflict,
    );
    registry.delete(&user(), &widget, None).await.unwrap();
    assert_code(registry.delete(&user(), &widget, None).await, ErrorCode::NotFound);
}

#[tokio::test]
async fn invalid_names_are_rejected() {
    let (registry, store, _) = stock_registry();
    for name in ["", "a/b", "new\nline"] {
        assert_code(
            registry
                .create(&user(), &stock(name), stock_payload(1), LeaseRequest::Default)
                .await,
            ErrorCode::InvalidRequest,
        );
    }
    assert_eq!(store.stats().revision, 0);
}

#[tokio::test]
async fn execute_validates_request_shape() {
    let (registry, _, _) = stock_registry();

    let mut missing_name = Request::get(user(), stock("widget-1"));
    missing_name.name = None;
    assert_code(registry.execute(missing_name).await, ErrorCode::InvalidRequest);

    let mut missing_payload = Request::create(user(), stock("widget-1"), json!({}));
    missing_payload.payload = None;
    assert_code(registry.execute(missing_payload).await, ErrorCode::InvalidRequest);

    let mut missing_version = Request::update(user(), stock("widget-1"), json!({}), 1);
    missing_version.expected_version = None;
    assert_code(registry.execute(missing_version).await, ErrorCode::InvalidRequest);

    match registry
        .execute(Request::create(user(), stock("widget-1"), json!({ "n": 1 })))
        .await
        .unwrap()
    {
        Response::Created { version, lease_id } => {
            assert_eq!(version, 1);
            assert!(lease_id.is_none());
        }
        other => panic!("unexpected response: {:?}", other),
    }
    match registry
        .execute(Request::get(user(), stock("widget-1")))
        .await
        .unwrap()
    {
        Response::Record(record) => assert_eq!(record.payload, json!({ "n": 1 })),
        other => panic!("unexpected response: {:?}", other),
    }
}

// ============================================================================
// List tests
// ============================================================================

#[tokio::test]
async fn list_is_ordered_and_paginated() {
    let (registry, _, _) = stock_registry();
    for name in ["widget-3", "widget-1", "widget-2", "widget-4"] {
        registry
            .create(&user(), &stock(name), stock_payload(1), LeaseRequest::Default)
            .await
            .unwrap();
    }
    registry
        .create(&user(), &sandbox("unrelated"), json!({}), LeaseRequest::None)
        .await
        .unwrap();

    let first = registry
        .list(&user(), &stocks_gvk(), ListOptions::limit(3))
        .await
        .unwrap();
    let names: Vec<_> = first.items.iter().map(|r| r.identity.name.as_str()).collect();
    assert_eq!(names, vec!["widget-1", "widget-2", "widget-3"]);
    assert_eq!(first.revision, 5);
    let token = first.continue_token.clone().unwrap();

    // Later writes do not leak into later pages.
    registry
        .create(&user(), &stock("widget-5"), stock_payload(1), LeaseRequest::Default)
        .await
        .unwrap();

    let second = registry
        .list(
            &user(),
            &stocks_gvk(),
            ListOptions {
                limit: 3,
                continue_token: Some(token),
            },
        )
        .await
        .unwrap();
    let names: Vec<_> = second.items.iter().map(|r| r.identity.name.as_str()).collect();
    assert_eq!(names, vec!["widget-4"]);
    assert_eq!(second.revision, first.revision);
    assert!(second.continue_token.is_none());

    let all = registry
        .list(&user(), &stocks_gvk(), ListOptions::default())
        .await
        .unwrap();
    assert_eq!(all.items.len(), 5);
    assert!(all.items.iter().all(|r| r.identity.gvk == stocks_gvk()));
}

#[tokio::test]
async fn list_rejects_bad_or_expired_tokens() {
    let (registry, store, _) = stock_registry();
    for i in 0..4 {
        registry
            .create(&user(), &stock(&format!("widget-{}", i)), stock_payload(1), LeaseRequest::Default)
            .await
            .unwrap();
    }

    let bad = ListOptions {
        limit: 1,
        continue_token: Some("%%%".into()),
    };
    assert_code(
        registry.list(&user(), &stock_gvk(), bad).await,
        ErrorCode::InvalidRequest,
    );

    let first = registry
        .list(&user(), &stock_gvk(), ListOptions::limit(1))
        .await
        .unwrap();
    registry
        .create(&user(), &stock("widget-9"), stock_payload(1), LeaseRequest::Default)
        .await
        .unwrap();
    store.compact(5);

    let expired = ListOptions {
        limit: 1,
        continue_token: first.continue_token,
    };
    let err = assert_code(
        registry.list(&user(), &stock_gvk(), expired).await,
        ErrorCode::InvalidRequest,
    );
    assert!(err.to_string().contains("continue token expired"), "{}", err);
}

#[tokio::test]
async fn nested_keyspace_stays_out_of_parent() {
    let builder = stock_builder().serve(
        STOCK_GROUP,
        V1ALPHA1,
        KindNames::new("archivedstock", "archivedstocks"),
        "/registry/stocks/archive",
    );
    let (registry, _, _) = registry_with(builder);
    let archived = Gvk::new(STOCK_GROUP, V1ALPHA1, "archivedstock");

    registry
        .create(&user(), &archived.named("old-1"), stock_payload(0), LeaseRequest::Default)
        .await
        .unwrap();
    registry
        .create(&user(), &stock("widget-1"), stock_payload(1), LeaseRequest::Default)
        .await
        .unwrap();

    let stocks = registry
        .list(&user(), &stocks_gvk(), ListOptions::default())
        .await
        .unwrap();
    let names: Vec<_> = stocks.items.iter().map(|r| r.identity.name.as_str()).collect();
    assert_eq!(names, vec!["widget-1"]);

    let archive = registry
        .list(&user(), &archived, ListOptions::default())
        .await
        .unwrap();
    let names: Vec<_> = archive.items.iter().map(|r| r.identity.name.as_str()).collect();
    assert_eq!(names, vec!["old-1"]);

    // A page holding only nested keys still continues.
    let first = registry
        .list(&user(), &stocks_gvk(), ListOptions::limit(1))
        .await
        .unwrap();
    assert!(first.items.is_empty());
    let second = registry
        .list(
            &user(),
            &stocks_gvk(),
            ListOptions {
                limit: 1,
                continue_token: first.continue_token,
            },
        )
        .await
        .unwrap();
    assert_eq!(second.items[0].identity.name, "widget-1");

    let mut watch = registry.watch(&user(), &stock_gvk(), Some(1)).await.unwrap();
    let event = next_event(&mut watch).await;
    assert_eq!(event.record.identity.name, "widget-1");
    assert_eq!(event.sequence, 2);
}

// ============================================================================
// Retry tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn reads_retry_transient_failures() {
    let (registry, store, _) = stock_registry();
    registry
        .create(&user(), &stock("widget-1"), stock_payload(1), LeaseRequest::Default)
        .await
        .unwrap();

    store.fail_next(2);
    assert!(registry.get(&user(), &stock("widget-1")).await.is_ok());

    store.fail_next(2);
    assert!(registry.list(&user(), &stock_gvk(), ListOptions::default()).await.is_ok());

    store.fail_next(3);
    assert_code(
        registry.get(&user(), &stock("widget-1")).await,
        ErrorCode::StoreUnavailable,
    );
}

#[tokio::test]
async fn mutations_surface_unavailability_immediately() {
    let (registry, store, _) = stock_registry();
    store.fail_next(1);
    assert_code(
        registry
            .create(&user(), &stock("widget-1"), stock_payload(1), LeaseRequest::Default)
            .await,
        ErrorCode::StoreUnavailable,
    );
    assert_code(registry.get(&user(), &stock("widget-1")).await, ErrorCode::NotFound);
}

#[tokio::test]
async fn retry_policy_is_configurable() {
    let (registry, store, _) = registry_with(stock_builder().retry(RetryPolicy::no_retry()));
    registry
        .create(&user(), &stock("widget-1"), stock_payload(1), LeaseRequest::Default)
        .await
        .unwrap();
    store.fail_next(1);
    assert_code(
        registry.get(&user(), &stock("widget-1")).await,
        ErrorCode::StoreUnavailable,
    );
}

// ============================================================================
// Authorization tests
// ============================================================================

fn deny_sandboxes(request: &AccessRequest<'_>) -> bool {
    !request.is_kind("sandbox")
}

#[tokio::test]
async fn denied_kind_is_forbidden_for_every_verb_and_spelling() {
    let (registry, store, _) = registry_with(stock_builder().authorizer(deny_sandboxes));
    let existing = sandbox("box-1");

    for kind in ["sandbox", "sandboxes", "Sandboxes"] {
        let gvk = Gvk::new(SANDBOX_GROUP, V1ALPHA1, kind);
        for name in ["box-1", "does-not-exist"] {
            let resource = gvk.named(name);
            assert_code(
                registry
                    .create(&user(), &resource, json!({}), LeaseRequest::Default)
                    .await,
                ErrorCode::Forbidden,
            );
            assert_code(registry.get(&user(), &resource).await, ErrorCode::Forbidden);
            assert_code(
                registry.update(&user(), &resource, json!({}), 1).await,
                ErrorCode::Forbidden,
            );
            assert_code(registry.delete(&user(), &resource, None).await, ErrorCode::Forbidden);
        }
        assert_code(registry.watch(&user(), &gvk, None).await, ErrorCode::Forbidden);
        assert_code(
            registry.list(&user(), &gvk, ListOptions::default()).await,
            ErrorCode::Forbidden,
        );
    }

    assert_eq!(store.stats().revision, 0);
    assert_eq!(registry.watches().shared_watches(), 0);
    // Stocks are unaffected.
    registry
        .create(&user(), &stock("widget-1"), stock_payload(1), LeaseRequest::Default)
        .await
        .unwrap();
    assert_code(registry.get(&user(), &existing).await, ErrorCode::Forbidden);
}

fn deny_sandbox_group(request: &AccessRequest<'_>) -> bool {
    !request.is_group(SANDBOX_GROUP)
}

#[tokio::test]
async fn denial_precedes_unserved_type() {
    let (registry, _, _) = registry_with(stock_builder().authorizer(deny_sandbox_group));

    let ghost = Gvk::new(SANDBOX_GROUP, V1ALPHA1, "ghost");
    assert_code(registry.get(&user(), &ghost.named("a")).await, ErrorCode::Forbidden);

    let other = Gvk::new("elsewhere.io", V1ALPHA1, "ghost");
    assert_code(registry.get(&user(), &other.named("a")).await, ErrorCode::UnservedType);
}

#[tokio::test]
async fn rule_authorizer_gates_by_subject_and_verb() {
    let authorizer = RuleAuthorizer::new(
        Decision::Deny,
        vec![
            Rule {
                effect: Decision::Allow,
                subjects: vec!["group:operators".into()],
                ..Default::default()
            },
            Rule {
                effect: Decision::Allow,
                kinds: vec!["stock".into()],
                verbs: vec![Verb::Get, Verb::List, Verb::Watch],
                ..Default::default()
            },
        ],
    );
    let (registry, _, _) = registry_with(stock_builder().authorizer(authorizer));
    let operator = Identity::new("bob").with_group("operators");
    let reader = Identity::anonymous();

    registry
        .create(&operator, &stock("widget-1"), stock_payload(1), LeaseRequest::Default)
        .await
        .unwrap();
    assert!(registry.get(&reader, &stocks_gvk().named("widget-1")).await.is_ok());
    assert_code(
        registry.update(&reader, &stock("widget-1"), stock_payload(2), 1).await,
        ErrorCode::Forbidden,
    );
    assert_code(
        registry.get(&reader, &sandbox("box")).await,
        ErrorCode::Forbidden,
    );
}
