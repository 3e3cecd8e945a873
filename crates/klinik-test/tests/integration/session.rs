#![allow(clippy::expect_used)]
//! Session integration tests: login, refresh rotation, replay and logout.

use salvo::http::StatusCode;
use serde_json::{Value, json};

use super::helpers::*;

fn field(body: &Value, name: &str) -> String {
    body[name]
        .as_str()
        .unwrap_or_else(|| panic!("{name} missing from {body}"))
        .to_string()
}

#[test_log::test(tokio::test)]
async fn wrong_password_is_unauthorized() {
    let app = TestApp::new().await;

    TestRequest::post("/api/auth/login")
        .json(&json!({ "username": ADMIN_USERNAME, "password": "nope" }))
        .send(&app.service)
        .await
        .assert_status(StatusCode::UNAUTHORIZED)
        .assert_code("unauthorized");
}

/// ## Summary
/// Refresh hands out a new pair and retires the old refresh token; replaying
/// it is refused.
#[test_log::test(tokio::test)]
async fn refresh_rotates_and_rejects_replay() {
    let app = TestApp::new().await;
    let first = app.login(ADMIN_USERNAME, ADMIN_PASSWORD).await;
    let old_refresh = field(&first, "refresh_token");

    let second: Value = TestRequest::get("/api/auth/refresh")
        .bearer(&old_refresh)
        .send(&app.service)
        .await
        .assert_status(StatusCode::OK)
        .json();
    assert_eq!(second["token_type"], "Bearer");
    assert_ne!(field(&second, "refresh_token"), old_refresh);
    assert_ne!(second["session_id"], first["session_id"]);

    TestRequest::post("/api/auth/refresh")
        .json(&json!({ "refresh_token": old_refresh }))
        .send(&app.service)
        .await
        .assert_status(StatusCode::UNAUTHORIZED)
        .assert_code("token_revoked");

    // The rotated token still works, through the body form.
    TestRequest::post("/api/auth/refresh")
        .json(&json!({ "refresh_token": field(&second, "refresh_token") }))
        .send(&app.service)
        .await
        .assert_status(StatusCode::OK);
}

#[test_log::test(tokio::test)]
async fn token_kinds_are_not_interchangeable() {
    let app = TestApp::new().await;
    let tokens = app.login(ADMIN_USERNAME, ADMIN_PASSWORD).await;

    TestRequest::get("/api/auth/refresh")
        .bearer(&field(&tokens, "access_token"))
        .send(&app.service)
        .await
        .assert_status(StatusCode::UNAUTHORIZED)
        .assert_code("token_wrong_type");

    TestRequest::get("/api/permissions/users")
        .bearer(&field(&tokens, "refresh_token"))
        .send(&app.service)
        .await
        .assert_status(StatusCode::UNAUTHORIZED)
        .assert_code("token_wrong_type");
}

/// ## Summary
/// Logout revokes every session of the caller: access tokens stop working
/// and the refresh token can no longer be redeemed.
#[test_log::test(tokio::test)]
async fn logout_revokes_sessions() {
    let app = TestApp::new().await;
    let tokens = app.login(ADMIN_USERNAME, ADMIN_PASSWORD).await;
    let access = field(&tokens, "access_token");

    let body: Value = TestRequest::delete("/api/auth/logout")
        .bearer(&access)
        .send(&app.service)
        .await
        .assert_status(StatusCode::OK)
        .json();
    assert_eq!(body["revoked_sessions"], 1);

    TestRequest::get("/api/permissions/users")
        .bearer(&access)
        .send(&app.service)
        .await
        .assert_status(StatusCode::UNAUTHORIZED)
        .assert_code("token_revoked");

    TestRequest::get("/api/auth/refresh")
        .bearer(&field(&tokens, "refresh_token"))
        .send(&app.service)
        .await
        .assert_status(StatusCode::UNAUTHORIZED)
        .assert_code("token_revoked");
}

/// ## Summary
/// Two refreshes racing on the same token admit exactly one.
#[test_log::test(tokio::test)]
async fn concurrent_refresh_admits_one() {
    let app = TestApp::new().await;
    let tokens = app.login(ADMIN_USERNAME, ADMIN_PASSWORD).await;
    let refresh = field(&tokens, "refresh_token");

    let responses = futures::future::join_all((0..4).map(|_| {
        TestRequest::get("/api/auth/refresh")
            .bearer(&refresh)
            .send(&app.service)
    }))
    .await;

    let ok = responses
        .iter()
        .filter(|r| r.status == StatusCode::OK)
        .count();
    assert_eq!(ok, 1);
    assert!(
        responses
            .iter()
            .filter(|r| r.status != StatusCode::OK)
            .all(|r| r.status == StatusCode::UNAUTHORIZED)
    );
}
