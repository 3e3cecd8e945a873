use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use klinik_db::model::resource::ResourceNode;

use crate::authz::casbin::CasbinEngine;
use crate::authz::engine::{EngineStats, EnforceRequest, PolicyEngine};
use crate::authz::policy::{GroupingDelta, GroupingTuple, PolicyDelta, PolicyTuple};
use crate::error::{ServiceError, ServiceResult};

pub fn node(id: i32, parent_id: Option<i32>, view: Option<&str>) -> ResourceNode {
    let now = chrono::Utc::now();
    ResourceNode {
        id,
        label: format!("node {id}"),
        resource_key: format!("res.{id}"),
        action: "read".to_string(),
        parent_id,
        view: view.map(str::to_string),
        data: None,
        level: None,
        path: None,
        route_path: None,
        route_method: None,
        created_by: None,
        updated_by: None,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    }
}

pub fn keyed(id: i32, key: &str, action: &str, view: Option<&str>) -> ResourceNode {
    ResourceNode {
        resource_key: key.to_string(),
        action: action.to_string(),
        label: key.to_string(),
        ..node(id, None, view)
    }
}

pub fn routed(id: i32, key: &str, action: &str, method: &str, path: &str) -> ResourceNode {
    ResourceNode {
        route_method: Some(method.to_string()),
        route_path: Some(path.to_string()),
        ..keyed(id, key, action, None)
    }
}

/// Engine that fails `save`, `apply_delta` or `enforce` a set number of
/// times, can delay decisions, and can stall the next `apply_delta`.
pub struct FlakyEngine {
    inner: CasbinEngine,
    save_failures: AtomicU32,
    apply_failures: AtomicU32,
    enforce_failures: AtomicU32,
    enforce_delay: Option<Duration>,
    next_apply_delay_ms: AtomicU64,
}

impl FlakyEngine {
    pub async fn new(save_failures: u32, apply_failures: u32) -> Self {
        Self {
            inner: CasbinEngine::in_memory().await.unwrap(),
            save_failures: AtomicU32::new(save_failures),
            apply_failures: AtomicU32::new(apply_failures),
            enforce_failures: AtomicU32::new(0),
            enforce_delay: None,
            next_apply_delay_ms: AtomicU64::new(0),
        }
    }

    pub fn failing_enforce(mut self, times: u32) -> Self {
        self.enforce_failures = AtomicU32::new(times);
        self
    }

    pub fn slow_enforce(mut self, delay: Duration) -> Self {
        self.enforce_delay = Some(delay);
        self
    }

    /// Stalls only the next `apply_delta` call by `delay`.
    pub fn stall_next_apply(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.next_apply_delay_ms.store(millis, Ordering::SeqCst);
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl PolicyEngine for FlakyEngine {
    async fn enforce(&self, request: &EnforceRequest) -> ServiceResult<bool> {
        if let Some(delay) = self.enforce_delay {
            tokio::time::sleep(delay).await;
        }
        if Self::take(&self.enforce_failures) {
            return Err(ServiceError::InvariantViolation("injected matcher failure"));
        }
        self.inner.enforce(request).await
    }
    async fn role_policies(&self, role_id: i32) -> ServiceResult<Vec<PolicyTuple>> {
        self.inner.role_policies(role_id).await
    }
    async fn has_policy(&self, tuple: &PolicyTuple) -> ServiceResult<bool> {
        self.inner.has_policy(tuple).await
    }
    async fn apply_delta(&self, delta: &PolicyDelta) -> ServiceResult<()> {
        let stall = self.next_apply_delay_ms.swap(0, Ordering::SeqCst);
        if stall > 0 {
            tokio::time::sleep(Duration::from_millis(stall)).await;
        }
        if Self::take(&self.apply_failures) {
            return Err(ServiceError::Cache("injected apply failure".into()));
        }
        self.inner.apply_delta(delta).await
    }
    async fn all_groupings(&self) -> ServiceResult<Vec<GroupingTuple>> {
        self.inner.all_groupings().await
    }
    async fn apply_grouping_delta(&self, delta: &GroupingDelta) -> ServiceResult<()> {
        self.inner.apply_grouping_delta(delta).await
    }
    async fn replace_all(
        &self,
        policies: &[PolicyTuple],
        groupings: &[GroupingTuple],
    ) -> ServiceResult<()> {
        self.inner.replace_all(policies, groupings).await
    }
    async fn save(&self) -> ServiceResult<()> {
        if Self::take(&self.save_failures) {
            return Err(ServiceError::Cache("injected save failure".into()));
        }
        self.inner.save().await
    }
    async fn stats(&self) -> ServiceResult<EngineStats> {
        self.inner.stats().await
    }
}
