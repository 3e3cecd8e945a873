#![allow(clippy::expect_used, dead_code)]
//! Test helpers for integration tests.
//!
//! Provides utilities for:
//! - Building an isolated service over the in-memory store, engine and cache
//! - Logging in and making authenticated JSON requests
//! - Asserting on responses
//!
//! ## Isolation
//! Every [`TestApp`] owns its own store, casbin enforcer and key-value cache,
//! so tests can run in parallel without sharing policy state.

use std::sync::Arc;

use salvo::http::header::{AUTHORIZATION, CONTENT_TYPE, HeaderName};
use salvo::http::{Method, ReqBody, StatusCode};
use salvo::prelude::*;
use salvo::test::{RequestBuilder, ResponseExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use klinik_test::app::catalogue::{ensure_admin_catalogue, ensure_superuser};
use klinik_test::component::authz::casbin::CasbinEngine;
use klinik_test::component::cache::MemoryKv;
use klinik_test::component::config::{AuthzConfig, BootstrapConfig, JwtConfig};
use klinik_test::component::context::{AuthzContext, AuthzContextHandler};
use klinik_test::component::db::store::memory::MemoryStore;

pub const ADMIN_USERNAME: &str = "admin";
pub const ADMIN_PASSWORD: &str = "admin-password";

pub fn test_jwt_config() -> JwtConfig {
    JwtConfig {
        access_secret: "access-secret-for-integration-tests".to_string(),
        refresh_secret: "refresh-secret-for-integration-tests".to_string(),
        issuer: "klinik-rbac".to_string(),
        access_ttl_minutes: 15,
        refresh_ttl_hours: 24,
        leeway_seconds: 0,
    }
}

/// A running service plus handles on its authorization state.
pub struct TestApp {
    pub service: Service,
    pub context: Arc<AuthzContext>,
    pub store: Arc<MemoryStore>,
}

impl TestApp {
    /// ## Summary
    /// Builds a service with the administrative catalogue seeded and a
    /// bootstrap superuser (`admin` / `admin-password`).
    ///
    /// ## Panics
    /// Panics if any startup step fails.
    pub async fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        ensure_admin_catalogue(store.as_ref())
            .await
            .expect("catalogue should seed");
        ensure_superuser(
            store.as_ref(),
            &BootstrapConfig {
                username: ADMIN_USERNAME.to_string(),
                password: ADMIN_PASSWORD.to_string(),
            },
        )
        .await
        .expect("superuser should bootstrap");

        let engine = CasbinEngine::in_memory()
            .await
            .expect("in-memory casbin engine");
        let context = Arc::new(
            AuthzContext::build(
                store.clone(),
                Arc::new(engine),
                Arc::new(MemoryKv::new()),
                &test_jwt_config(),
                &AuthzConfig::default(),
            )
            .await
            .expect("authorization context should build"),
        );

        let router = Router::new()
            .hoop(AuthzContextHandler {
                context: context.clone(),
            })
            .push(klinik_test::app::api::routes());

        Self {
            service: Service::new(router),
            context,
            store,
        }
    }

    /// Logs in and returns the full token response.
    pub async fn login(&self, username: &str, password: &str) -> Value {
        TestRequest::post("/api/auth/login")
            .json(&json!({ "username": username, "password": password }))
            .send(&self.service)
            .await
            .assert_status(StatusCode::OK)
            .json()
    }

    /// Logs in and returns only the access token.
    pub async fn access_token(&self, username: &str, password: &str) -> String {
        self.login(username, password).await["access_token"]
            .as_str()
            .expect("access_token should be a string")
            .to_string()
    }

    pub async fn admin_token(&self) -> String {
        self.access_token(ADMIN_USERNAME, ADMIN_PASSWORD).await
    }

    /// Creates a user through the API and returns its id.
    pub async fn create_user(&self, admin: &str, username: &str, password: &str) -> String {
        let user: Value = TestRequest::post("/api/users")
            .bearer(admin)
            .json(&json!({
                "username": username,
                "display_name": username,
                "password": password,
            }))
            .send(&self.service)
            .await
            .assert_status(StatusCode::OK)
            .json();
        user["id"].as_str().expect("user id").to_string()
    }

    /// Creates a role through the API and returns its id.
    pub async fn create_role(&self, admin: &str, name: &str) -> i64 {
        let role: Value = TestRequest::post("/api/users/roles")
            .bearer(admin)
            .json(&json!({ "name": name }))
            .send(&self.service)
            .await
            .assert_status(StatusCode::OK)
            .json();
        role["id"].as_i64().expect("role id")
    }

    /// Creates a resource node through the API and returns its id.
    pub async fn create_node(&self, admin: &str, node: &Value) -> i64 {
        let created: Value = TestRequest::post("/api/permissions")
            .bearer(admin)
            .json(node)
            .send(&self.service)
            .await
            .assert_status(StatusCode::OK)
            .json();
        created["id"].as_i64().expect("node id")
    }

    /// Returns the id of the node mapped to `method path`.
    pub async fn route_node_id(&self, admin: &str, method: &str, path: &str) -> i64 {
        let nodes: Vec<Value> = TestRequest::get("/api/permissions")
            .bearer(admin)
            .send(&self.service)
            .await
            .assert_status(StatusCode::OK)
            .json();
        nodes
            .iter()
            .find(|n| n["route_method"] == method && n["route_path"] == path)
            .and_then(|n| n["id"].as_i64())
            .unwrap_or_else(|| panic!("no node mapped to {method} {path}"))
    }
}

/// Test request builder for constructing HTTP requests.
pub struct TestRequest {
    method: Method,
    path: String,
    headers: Vec<(HeaderName, String)>,
    body: Option<Vec<u8>>,
}

impl TestRequest {
    #[must_use]
    pub fn new(method: Method, path: &str) -> Self {
        Self {
            method,
            path: path.to_string(),
            headers: Vec::new(),
            body: None,
        }
    }

    #[must_use]
    pub fn get(path: &str) -> Self {
        Self::new(Method::GET, path)
    }

    #[must_use]
    pub fn post(path: &str) -> Self {
        Self::new(Method::POST, path)
    }

    #[must_use]
    pub fn put(path: &str) -> Self {
        Self::new(Method::PUT, path)
    }

    #[must_use]
    pub fn delete(path: &str) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Sets the `Authorization: Bearer` header.
    #[must_use]
    pub fn bearer(mut self, token: &str) -> Self {
        self.headers.push((AUTHORIZATION, format!("Bearer {token}")));
        self
    }

    /// Sets a JSON request body.
    #[must_use]
    pub fn json(mut self, body: &impl Serialize) -> Self {
        self.headers
            .push((CONTENT_TYPE, "application/json; charset=utf-8".to_string()));
        self.body = Some(serde_json::to_vec(body).expect("body should serialize"));
        self
    }

    /// Sends the request to the test service and returns the response.
    pub async fn send(self, service: &Service) -> TestResponse {
        let url = format!("http://127.0.0.1:5800{}", self.path);
        let mut client = RequestBuilder::new(&url, self.method);

        for (name, value) in self.headers {
            client = client.add_header(name, value, true);
        }
        if let Some(body_bytes) = self.body {
            client = client.body(ReqBody::Once(body_bytes.into()));
        }

        let mut response = client.send(service).await;
        let status = response
            .status_code
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body: Vec<u8> = response.take_bytes(None).await.unwrap_or_default().to_vec();

        TestResponse { status, body }
    }
}

/// Represents an HTTP test response for assertions.
pub struct TestResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl TestResponse {
    /// Asserts that the response status matches the expected code.
    #[must_use]
    pub fn assert_status(self, expected: StatusCode) -> Self {
        assert_eq!(
            self.status,
            expected,
            "Expected status {expected} but got {}: {}",
            self.status,
            self.body_string()
        );
        self
    }

    /// Asserts the machine-readable error code of an error response.
    #[must_use]
    pub fn assert_code(self, expected: &str) -> Self {
        let body: Value = self.json();
        assert_eq!(body["code"], expected, "unexpected error body: {body}");
        self
    }

    #[must_use]
    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }

    /// Parses the body as JSON.
    #[must_use]
    pub fn json<T: DeserializeOwned>(&self) -> T {
        serde_json::from_slice(&self.body)
            .unwrap_or_else(|e| panic!("invalid JSON body ({e}): {}", self.body_string()))
    }
}
