use async_trait::async_trait;
use serde::Serialize;

use crate::error::ServiceResult;

use super::policy::{GroupingDelta, GroupingTuple, PolicyDelta, PolicyTuple};
use super::subject::Subject;

/// One enforcement question. The reserved dimensions default to empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnforceRequest {
    pub subject: Subject,
    pub resource_key: String,
    pub action: String,
    pub tenant: String,
    pub scope: String,
    pub time: String,
}

impl EnforceRequest {
    #[must_use]
    pub fn new(subject: Subject, resource_key: &str, action: &str) -> Self {
        Self {
            subject,
            resource_key: resource_key.to_string(),
            action: action.to_string(),
            tenant: String::new(),
            scope: String::new(),
            time: String::new(),
        }
    }

    #[must_use]
    pub fn with_tenant(mut self, tenant: Option<&str>) -> Self {
        self.tenant = tenant.unwrap_or_default().to_string();
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub policy_count: usize,
    pub grouping_count: usize,
}

/// ## Summary
/// The enforcement engine seam. Only the policy synchronizer mutates it;
/// request paths call [`PolicyEngine::enforce`].
///
/// Mutations are applied in memory first and persisted by [`PolicyEngine::save`],
/// so a failed save leaves the in-memory set ahead of the adapter.
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    /// ## Errors
    /// Engine evaluation failures.
    async fn enforce(&self, request: &EnforceRequest) -> ServiceResult<bool>;

    /// Tuples currently held for `role:{role_id}`.
    async fn role_policies(&self, role_id: i32) -> ServiceResult<Vec<PolicyTuple>>;

    async fn has_policy(&self, tuple: &PolicyTuple) -> ServiceResult<bool>;

    /// Applies the delta in memory. Tuples already in the desired state are skipped.
    async fn apply_delta(&self, delta: &PolicyDelta) -> ServiceResult<()>;

    async fn all_groupings(&self) -> ServiceResult<Vec<GroupingTuple>>;

    async fn apply_grouping_delta(&self, delta: &GroupingDelta) -> ServiceResult<()>;

    /// Makes the engine hold exactly the given sets.
    async fn replace_all(
        &self,
        policies: &[PolicyTuple],
        groupings: &[GroupingTuple],
    ) -> ServiceResult<()>;

    /// Persists the in-memory policy set through the adapter.
    async fn save(&self) -> ServiceResult<()>;

    async fn stats(&self) -> ServiceResult<EngineStats>;
}
