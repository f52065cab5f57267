//! Integration tests for the plugin admin HTTP API.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use axum::http::StatusCode;
use serde_json::json;

use common::{Harness, json_body, send};

#[tokio::test]
async fn admin_routes_require_token() {
    let h = Harness::new();
    let app = h.router();

    let response = send(&app, "GET", "/admin/plugins", None, false).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key("www-authenticate"));

    let response = send(&app, "POST", "/admin/plugins/reconcile", None, false).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(h.reconciler.statuses().await.unwrap().is_empty());
}

#[tokio::test]
async fn health_is_public() {
    let h = Harness::new();
    let app = h.router();

    let response = send(&app, "GET", "/health", None, false).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["persistent_registry"], false);
    assert_eq!(body["loaded_plugins"], 0);
}

#[tokio::test]
async fn reconcile_then_manage_a_plugin() {
    let h = Harness::new();
    h.tree
        .plugin("billing-sync")
        .name("Billing Sync")
        .migrations(&["m1", "m2"])
        .write();
    h.tree.plugin("a-dup").id("dup").write();
    h.tree.plugin("b-dup").id("dup").write();
    h.tree.raw_manifest("broken", "version = \"1.0.0\"\n");
    h.tree.empty_dir("scratch");
    let app = h.router();

    let response = send(&app, "POST", "/admin/plugins/reconcile", None, true).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["registered"], json!(["billing-sync", "dup"]));
    assert_eq!(body["duplicates"].as_array().unwrap().len(), 1);
    assert!(
        body["duplicates"][0]["dir"]
            .as_str()
            .unwrap()
            .ends_with("b-dup")
    );
    assert_eq!(body["issues"].as_array().unwrap().len(), 1);
    assert_eq!(body["skipped"].as_array().unwrap().len(), 1);
    assert!(
        body["skipped"][0]["error"]
            .as_str()
            .unwrap()
            .contains("no plugin.info.toml")
    );
    assert_eq!(body["contended"], json!([]));

    let response = send(&app, "GET", "/admin/plugins", None, true).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["plugins"].as_array().unwrap().len(), 2);

    let response = send(&app, "POST", "/admin/plugins/billing-sync/enable", None, true).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["state"], "enabled");
    assert_eq!(body["enabled"], true);
    assert_eq!(body["name"], "Billing Sync");
    assert_eq!(h.ledger("billing-sync").await, vec!["m1", "m2"]);

    let response = send(&app, "GET", "/admin/plugins/billing-sync", None, true).await;
    let body = json_body(response).await;
    assert_eq!(body["loaded"], true);
    assert_eq!(body["installed_version"], "1.0.0");

    let response = send(&app, "POST", "/admin/plugins/billing-sync/disable", None, true).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["state"], "disabled");
    assert_eq!(body["loaded"], false);
}

#[tokio::test]
async fn config_must_be_an_object() {
    let h = Harness::new();
    h.tree.plugin("regional").write();
    h.reconcile().await;
    let app = h.router();

    let response = send(
        &app,
        "PUT",
        "/admin/plugins/regional/config",
        Some(json!(["not", "an", "object"])),
        true,
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = send(
        &app,
        "PUT",
        "/admin/plugins/regional/config",
        Some(json!({ "region": "eu" })),
        true,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn errors_map_to_statuses() {
    let h = Harness::new();
    h.tree.plugin("gone").write();
    h.tree.plugin("fragile").module(hostdesk_test_utils::wat::TRAP_ON_START).write();
    h.reconcile().await;
    h.tree.remove("gone");
    h.reconcile().await;
    let app = h.router();

    let response = send(&app, "GET", "/admin/plugins/missing", None, true).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    assert!(body["error"].as_str().unwrap().contains("missing"));

    let response = send(&app, "POST", "/admin/plugins/gone/enable", None, true).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = send(&app, "POST", "/admin/plugins/fragile/enable", None, true).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = json_body(response).await;
    assert!(body["error"].as_str().unwrap().contains("fragile"));
}
