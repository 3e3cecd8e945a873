#![allow(clippy::expect_used)]
//! Authorization integration tests.
//!
//! Drives grants through the administrative API and checks that decisions
//! follow them without a restart, and that the RBAC middleware fails closed.

use salvo::http::StatusCode;
use serde_json::{Value, json};

use klinik_test::component::authz::{AuthzResult, Subject};

use super::helpers::*;

async fn decide(app: &TestApp, user_id: &str, key: &str, action: &str) -> AuthzResult {
    let user_id = uuid::Uuid::parse_str(user_id).expect("user id is a uuid");
    app.context
        .authorizer
        .check(Subject::User(user_id), key, action, None)
        .await
        .expect("decision should not error")
}

/// ## Summary
/// A role granted a data permission allows exactly that action, and revoking
/// the grant takes effect on the next decision.
#[test_log::test(tokio::test)]
async fn supervisor_grant_follows_policy_edits() {
    let app = TestApp::new().await;
    let admin = app.admin_token().await;

    let menu = app
        .create_node(
            &admin,
            &json!({
                "label": "Kehadiran",
                "resource_key": "kehadiran",
                "action": "read",
                "view": "menu",
            }),
        )
        .await;
    let approve = app
        .create_node(
            &admin,
            &json!({
                "label": "Approve attendance",
                "resource_key": "kehadiran.approve",
                "action": "update",
                "parent_id": menu,
                "view": "data",
            }),
        )
        .await;

    let role = app.create_role(&admin, "supervisor").await;
    TestRequest::put(&format!("/api/users/roles/policies/{role}"))
        .bearer(&admin)
        .json(&json!({ "resource_ids": [approve] }))
        .send(&app.service)
        .await
        .assert_status(StatusCode::OK);

    let user = app.create_user(&admin, "siti", "siti-password").await;
    TestRequest::put(&format!("/api/users/{user}/roles"))
        .bearer(&admin)
        .json(&json!({ "role_ids": [role] }))
        .send(&app.service)
        .await
        .assert_status(StatusCode::OK);

    assert!(decide(&app, &user, "kehadiran.approve", "update").await.is_allowed());
    assert!(!decide(&app, &user, "kehadiran.approve", "delete").await.is_allowed());

    // The user's own menu carries the granted node under its menu parent.
    let token = app.access_token("siti", "siti-password").await;
    let view: Vec<Value> = TestRequest::get("/api/permissions/users")
        .bearer(&token)
        .send(&app.service)
        .await
        .assert_status(StatusCode::OK)
        .json();
    assert_eq!(view.len(), 1);
    assert_eq!(view[0]["resource_key"], "kehadiran");
    assert_eq!(view[0]["children"][0]["resource_key"], "kehadiran.approve");

    TestRequest::put(&format!("/api/users/roles/policies/{role}"))
        .bearer(&admin)
        .json(&json!({ "resource_ids": [] }))
        .send(&app.service)
        .await
        .assert_status(StatusCode::OK);

    assert!(!decide(&app, &user, "kehadiran.approve", "update").await.is_allowed());

    // Cached views are dropped with the grant.
    let view: Vec<Value> = TestRequest::get("/api/permissions/users")
        .bearer(&token)
        .send(&app.service)
        .await
        .assert_status(StatusCode::OK)
        .json();
    assert!(view.is_empty());
}

/// ## Summary
/// Route grants gate the administrative API per method and path.
#[test_log::test(tokio::test)]
async fn route_grant_allows_only_the_granted_route() {
    let app = TestApp::new().await;
    let admin = app.admin_token().await;

    let list_roles = app
        .route_node_id(&admin, "GET", "/api/users/roles")
        .await;
    let role = app.create_role(&admin, "auditor").await;
    TestRequest::put(&format!("/api/users/roles/policies/{role}"))
        .bearer(&admin)
        .json(&json!({ "resource_ids": [list_roles] }))
        .send(&app.service)
        .await
        .assert_status(StatusCode::OK);

    let user = app.create_user(&admin, "budi", "budi-password").await;
    TestRequest::put(&format!("/api/users/{user}/roles"))
        .bearer(&admin)
        .json(&json!({ "role_ids": [role] }))
        .send(&app.service)
        .await
        .assert_status(StatusCode::OK);

    let token = app.access_token("budi", "budi-password").await;
    TestRequest::get("/api/users/roles")
        .bearer(&token)
        .send(&app.service)
        .await
        .assert_status(StatusCode::OK);

    // Same resource key, different action.
    TestRequest::post("/api/users/roles")
        .bearer(&token)
        .json(&json!({ "name": "escalated" }))
        .send(&app.service)
        .await
        .assert_status(StatusCode::FORBIDDEN)
        .assert_code("forbidden");

    TestRequest::get("/api/permissions/tree")
        .bearer(&token)
        .send(&app.service)
        .await
        .assert_status(StatusCode::FORBIDDEN)
        .assert_code("forbidden");
}

/// ## Summary
/// A route without a resource mapping is refused, even for the superuser.
#[test_log::test(tokio::test)]
async fn unmapped_route_is_denied_for_everyone() {
    let app = TestApp::new().await;
    let admin = app.admin_token().await;

    let pending = app
        .route_node_id(&admin, "GET", "/api/admin/pending")
        .await;
    let deleted: Value = TestRequest::delete(&format!("/api/permissions/{pending}"))
        .bearer(&admin)
        .send(&app.service)
        .await
        .assert_status(StatusCode::OK)
        .json();
    assert_eq!(deleted["deleted_ids"], json!([pending]));

    TestRequest::get("/api/admin/pending")
        .bearer(&admin)
        .send(&app.service)
        .await
        .assert_status(StatusCode::FORBIDDEN)
        .assert_code("not_configured");
}

/// ## Summary
/// Requests without a credential never reach the RBAC check.
#[test_log::test(tokio::test)]
async fn missing_token_is_unauthorized() {
    let app = TestApp::new().await;

    TestRequest::get("/api/users/roles")
        .send(&app.service)
        .await
        .assert_status(StatusCode::UNAUTHORIZED)
        .assert_code("token_missing");

    TestRequest::get("/api/users/roles")
        .bearer("not-a-jwt")
        .send(&app.service)
        .await
        .assert_status(StatusCode::UNAUTHORIZED)
        .assert_code("token_malformed");
}

/// ## Summary
/// A stale `expected_revision` is rejected and leaves the grants untouched.
#[test_log::test(tokio::test)]
async fn stale_revision_conflicts() {
    let app = TestApp::new().await;
    let admin = app.admin_token().await;
    let role = app.create_role(&admin, "nurse").await;
    let tree = app
        .route_node_id(&admin, "GET", "/api/permissions/tree")
        .await;

    let report: Value = TestRequest::put(&format!("/api/users/roles/policies/{role}"))
        .bearer(&admin)
        .json(&json!({ "resource_ids": [tree], "expected_revision": 0 }))
        .send(&app.service)
        .await
        .assert_status(StatusCode::OK)
        .json();
    let revision = report["revision"].as_i64().expect("revision");
    assert!(revision > 0);

    TestRequest::put(&format!("/api/users/roles/policies/{role}"))
        .bearer(&admin)
        .json(&json!({ "resource_ids": [], "expected_revision": 0 }))
        .send(&app.service)
        .await
        .assert_status(StatusCode::CONFLICT)
        .assert_code("conflict");

    let detail: Value = TestRequest::get(&format!("/api/users/roles/{role}"))
        .bearer(&admin)
        .send(&app.service)
        .await
        .assert_status(StatusCode::OK)
        .json();
    assert_eq!(detail["resource_ids"], json!([tree]));
}

/// ## Summary
/// Members lose the roles a group conferred once the group is deleted.
#[test_log::test(tokio::test)]
async fn deleting_a_group_revokes_inherited_access() {
    let app = TestApp::new().await;
    let admin = app.admin_token().await;

    let list = app
        .create_node(
            &admin,
            &json!({
                "label": "Daftar fasilitas",
                "resource_key": "fasilitas.list",
                "action": "read",
                "view": "data",
            }),
        )
        .await;
    let role = app.create_role(&admin, "staf").await;
    TestRequest::put(&format!("/api/users/roles/policies/{role}"))
        .bearer(&admin)
        .json(&json!({ "resource_ids": [list] }))
        .send(&app.service)
        .await
        .assert_status(StatusCode::OK);

    let group: Value = TestRequest::post("/api/users/groups")
        .bearer(&admin)
        .json(&json!({ "name": "poli umum" }))
        .send(&app.service)
        .await
        .assert_status(StatusCode::OK)
        .json();
    let group = group["id"].as_i64().expect("group id");
    TestRequest::put(&format!("/api/users/groups/{group}/roles"))
        .bearer(&admin)
        .json(&json!({ "role_ids": [role] }))
        .send(&app.service)
        .await
        .assert_status(StatusCode::OK);

    let user = app.create_user(&admin, "rina", "rina-password").await;
    TestRequest::put(&format!("/api/users/{user}/groups"))
        .bearer(&admin)
        .json(&json!({ "group_ids": [group] }))
        .send(&app.service)
        .await
        .assert_status(StatusCode::OK);
    assert!(decide(&app, &user, "fasilitas.list", "read").await.is_allowed());

    let renamed: Value = TestRequest::put(&format!("/api/users/groups/{group}"))
        .bearer(&admin)
        .json(&json!({ "name": "poli anak" }))
        .send(&app.service)
        .await
        .assert_status(StatusCode::OK)
        .json();
    assert_eq!(renamed["name"], "poli anak");

    let detail: Value = TestRequest::get(&format!("/api/users/groups/{group}"))
        .bearer(&admin)
        .send(&app.service)
        .await
        .assert_status(StatusCode::OK)
        .json();
    assert_eq!(detail["name"], "poli anak");
    assert_eq!(detail["role_ids"], json!([role]));

    let deleted: Value = TestRequest::delete(&format!("/api/users/groups/{group}"))
        .bearer(&admin)
        .send(&app.service)
        .await
        .assert_status(StatusCode::OK)
        .json();
    assert_eq!(deleted["deleted"], group);
    assert!(!decide(&app, &user, "fasilitas.list", "read").await.is_allowed());

    TestRequest::get(&format!("/api/users/groups/{group}"))
        .bearer(&admin)
        .send(&app.service)
        .await
        .assert_status(StatusCode::NOT_FOUND)
        .assert_code("not_found");
}
