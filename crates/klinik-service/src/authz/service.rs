//! Authorization service for request-time decisions and menu views.
//!
//! Handlers and the RBAC middleware ask [`Authorizer`] whether a subject may
//! perform an action on a resource key. Decisions are bounded by the configured
//! timeout; a decision that does not finish in time is a denial.

use std::sync::Arc;
use std::time::Duration;

use klinik_core::constants::SUPERUSER_ROLE_ID;
use klinik_db::model::resource::ResourceNode;
use klinik_db::store::AuthzStore;

use crate::error::{ServiceError, ServiceResult};

use super::engine::EnforceRequest;
use super::subject::Subject;
use super::sync::PolicySynchronizer;
use super::tree::{MenuNode, build_resource_tree, with_ancestors};

/// Result of an authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthzResult {
    /// Access is allowed.
    Allowed,
    /// Access is denied.
    Denied,
}

impl AuthzResult {
    /// Returns `true` if access is allowed.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Convert to a `Result`, returning `Err(ServiceError::AuthorizationError)` if denied.
    ///
    /// ## Errors
    ///
    /// Returns `AuthorizationError` if access is denied.
    pub fn require(self, resource_key: &str, action: &str) -> ServiceResult<()> {
        match self {
            Self::Allowed => Ok(()),
            Self::Denied => Err(ServiceError::AuthorizationError(format!(
                "Access denied: {action} on {resource_key}"
            ))),
        }
    }
}

/// Read-side authorization API.
///
/// ## Usage
///
/// ```ignore
/// let result = authorizer.check(identity.subject(), "kehadiran.approve", "update", None).await?;
/// if result.is_allowed() {
///     // proceed
/// }
/// ```
pub struct Authorizer {
    sync: Arc<PolicySynchronizer>,
    store: Arc<dyn AuthzStore>,
    timeout: Duration,
}

impl Authorizer {
    #[must_use]
    pub fn new(sync: Arc<PolicySynchronizer>, store: Arc<dyn AuthzStore>, timeout: Duration) -> Self {
        Self {
            sync,
            store,
            timeout,
        }
    }

    /// ## Summary
    /// Decides whether `subject` may perform `action` on `resource_key`,
    /// optionally within `tenant`.
    ///
    /// A decision that exceeds the configured timeout is `Denied`.
    ///
    /// ## Errors
    ///
    /// Engine or store failures. Callers must not proceed on an error.
    #[tracing::instrument(skip(self))]
    pub async fn check(
        &self,
        subject: Subject,
        resource_key: &str,
        action: &str,
        tenant: Option<&str>,
    ) -> ServiceResult<AuthzResult> {
        let request = EnforceRequest::new(subject, resource_key, action).with_tenant(tenant);

        tracing::debug!("Authorization check started");

        let allowed = match tokio::time::timeout(self.timeout, self.sync.evaluate(&request)).await
        {
            Ok(Ok(allowed)) => allowed,
            Ok(Err(err)) => {
                tracing::error!(error = %err, "Authorization check failed");
                return Err(err);
            }
            Err(_elapsed) => {
                tracing::warn!(
                    timeout_ms = self.timeout.as_millis(),
                    "Authorization check timed out; denying"
                );
                return Ok(AuthzResult::Denied);
            }
        };

        if allowed {
            tracing::debug!("Authorization granted");
            Ok(AuthzResult::Allowed)
        } else {
            tracing::debug!("Authorization denied");
            Ok(AuthzResult::Denied)
        }
    }

    /// Check and require permission, returning an error if denied.
    ///
    /// ## Errors
    ///
    /// - Returns `AuthorizationError` if access is denied.
    /// - Returns engine or store errors if evaluation fails.
    pub async fn require(
        &self,
        subject: Subject,
        resource_key: &str,
        action: &str,
    ) -> ServiceResult<()> {
        self.check(subject, resource_key, action, None)
            .await?
            .require(resource_key, action)
    }

    /// ## Summary
    /// Builds the full menu/permission forest from every live node.
    ///
    /// ## Errors
    /// Store failures.
    pub async fn resource_tree(&self) -> ServiceResult<Vec<MenuNode>> {
        let nodes = self.store.list_resources().await?;
        Ok(build_resource_tree(&nodes))
    }

    /// ## Summary
    /// Builds the menu a user sees: nodes granted through any of the user's
    /// effective roles, plus the ancestors leading to them. Superusers see the
    /// whole tree.
    ///
    /// ## Errors
    /// `NotFound` for an unknown user, or store failures.
    #[tracing::instrument(skip(self))]
    pub async fn user_menu(&self, user_id: uuid::Uuid) -> ServiceResult<Vec<MenuNode>> {
        let role_ids = self.store.effective_role_ids(user_id).await?;
        let all = self.store.list_resources().await?;
        if role_ids.contains(&SUPERUSER_ROLE_ID) {
            return Ok(build_resource_tree(&all));
        }

        let granted = self.store.resources_for_roles(&role_ids).await?;
        let tree = visible_tree(&all, &granted);
        tracing::debug!(roles = role_ids.len(), nodes = tree.len(), "Built user menu");
        Ok(tree)
    }

    /// ## Summary
    /// Builds the menu granted to a single role, with ancestors.
    ///
    /// ## Errors
    /// `NotFound` for an unknown role, or store failures.
    pub async fn role_menu(&self, role_id: i32) -> ServiceResult<Vec<MenuNode>> {
        self.store.get_role(role_id).await?;
        let all = self.store.list_resources().await?;
        if role_id == SUPERUSER_ROLE_ID {
            return Ok(build_resource_tree(&all));
        }
        let granted = self.store.role_grants(role_id).await?;
        Ok(visible_tree(&all, &granted))
    }
}

fn visible_tree(all: &[ResourceNode], granted: &[ResourceNode]) -> Vec<MenuNode> {
    let ids: Vec<i32> = granted.iter().map(|n| n.id).collect();
    build_resource_tree(&with_ancestors(all, &ids))
}

#[cfg(test)]
mod tests {
    use klinik_core::config::AuthzConfig;
    use klinik_db::model::resource::ResourceNodeInput;
    use klinik_db::store::memory::MemoryStore;

    use super::*;
    use crate::authz::casbin::CasbinEngine;
    use crate::authz::engine::PolicyEngine;
    use crate::authz::route_cache::RouteCache;
    use crate::cache::MemoryKv;
    use crate::test_support::FlakyEngine;

    struct Fixture {
        store: Arc<MemoryStore>,
        sync: Arc<PolicySynchronizer>,
        authz: Authorizer,
    }

    fn fixture(engine: Arc<dyn PolicyEngine>, timeout: Duration) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let routes = Arc::new(RouteCache::new(Arc::new(MemoryKv::new()), store.clone()));
        let config = AuthzConfig {
            sync_retry_backoff_ms: 1,
            ..AuthzConfig::default()
        };
        let sync = Arc::new(PolicySynchronizer::new(
            store.clone(),
            engine,
            routes,
            config,
        ));
        let authz = Authorizer::new(sync.clone(), store.clone(), timeout);
        Fixture { store, sync, authz }
    }

    fn input(key: &str, action: &str, parent: Option<i32>, view: &str) -> ResourceNodeInput {
        ResourceNodeInput {
            label: key.to_string(),
            resource_key: key.to_string(),
            action: action.to_string(),
            parent_id: parent,
            view: Some(view.to_string()),
            data: None,
            route_path: None,
            route_method: None,
        }
    }

    #[test]
    fn authz_result_require() {
        assert!(AuthzResult::Allowed.require("kehadiran", "read").is_ok());
        assert!(matches!(
            AuthzResult::Denied.require("kehadiran", "read"),
            Err(ServiceError::AuthorizationError(_))
        ));
    }

    #[test_log::test(tokio::test)]
    async fn check_allows_granted_and_denies_the_rest() {
        let f = fixture(
            Arc::new(CasbinEngine::in_memory().await.unwrap()),
            Duration::from_millis(500),
        );
        let node = f
            .store
            .create_resource(&input("kehadiran.approve", "update", None, "data"), None)
            .await
            .unwrap();
        let role = f.store.create_role("supervisor", None).await.unwrap();
        let user = f.store.create_user("siti", "Siti", "hash").await.unwrap();
        f.sync
            .sync_role_policies(role.id, &[node.id], None, None)
            .await
            .unwrap();
        f.sync
            .assign_user_roles(user.id, &[role.id], None)
            .await
            .unwrap();

        let subject = Subject::User(user.id);
        assert!(
            f.authz
                .check(subject, "kehadiran.approve", "update", None)
                .await
                .unwrap()
                .is_allowed()
        );
        assert_eq!(
            f.authz
                .check(subject, "kehadiran.approve", "delete", None)
                .await
                .unwrap(),
            AuthzResult::Denied
        );
        assert!(f.authz.require(subject, "payroll", "read").await.is_err());
    }

    #[test_log::test(tokio::test)]
    async fn slow_decisions_deny() {
        let engine = FlakyEngine::new(0, 0)
            .await
            .slow_enforce(Duration::from_millis(200));
        let f = fixture(Arc::new(engine), Duration::from_millis(20));

        let result = f
            .authz
            .check(Subject::superuser(), "anything", "read", None)
            .await
            .unwrap();
        assert_eq!(result, AuthzResult::Denied);
    }

    #[test_log::test(tokio::test)]
    async fn engine_errors_surface_as_internal() {
        let engine = FlakyEngine::new(0, 0).await.failing_enforce(1);
        let f = fixture(Arc::new(engine), Duration::from_millis(500));

        let err = f
            .authz
            .check(Subject::superuser(), "anything", "read", None)
            .await
            .unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Internal);
    }

    #[test_log::test(tokio::test)]
    async fn user_menu_includes_ancestors_only_for_granted_leaves() {
        let f = fixture(
            Arc::new(CasbinEngine::in_memory().await.unwrap()),
            Duration::from_millis(500),
        );
        let hr = f
            .store
            .create_resource(&input("hr", "read", None, "menu"), None)
            .await
            .unwrap();
        let attendance = f
            .store
            .create_resource(&input("kehadiran", "read", Some(hr.id), "menu"), None)
            .await
            .unwrap();
        let approve = f
            .store
            .create_resource(
                &input("kehadiran.approve", "update", Some(attendance.id), "data"),
                None,
            )
            .await
            .unwrap();
        f.store
            .create_resource(&input("payroll", "read", None, "menu"), None)
            .await
            .unwrap();

        let role = f.store.create_role("supervisor", None).await.unwrap();
        let user = f.store.create_user("siti", "Siti", "hash").await.unwrap();
        f.sync
            .sync_role_policies(role.id, &[approve.id], None, None)
            .await
            .unwrap();
        f.sync
            .assign_user_roles(user.id, &[role.id], None)
            .await
            .unwrap();

        let menu = f.authz.user_menu(user.id).await.unwrap();
        assert_eq!(menu.len(), 1);
        assert_eq!(menu[0].resource_key, "hr");
        assert_eq!(menu[0].count(), 3);

        let role_menu = f.authz.role_menu(role.id).await.unwrap();
        assert_eq!(role_menu, menu);

        let full = f.authz.resource_tree().await.unwrap();
        assert_eq!(full.len(), 2);
    }
}
