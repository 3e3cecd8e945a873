//! The single write path into the enforcement engine.
//!
//! Every durable RBAC edit that changes what the engine must hold goes through
//! [`PolicySynchronizer`]: the durable store is written first (one transaction),
//! then the engine receives a minimal delta and is persisted, then the route
//! cache entries of touched resource keys are invalidated.
//!
//! A target is recorded as pending before its durable write and cleared once
//! the engine holds the result, so an edit abandoned between the two (a
//! dropped request future) still leaves a record. An engine failure after the
//! commit is retried with backoff; on exhaustion the caller receives
//! [`ServiceError::EngineSync`]. The next decision reconciles pending targets
//! before evaluating.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use klinik_core::config::AuthzConfig;
use klinik_core::constants::SUPERUSER_ROLE_ID;
use klinik_db::error::DbError;
use klinik_db::model::resource::expand_with_descendants;
use klinik_db::store::AuthzStore;

use crate::error::{ServiceError, ServiceResult};

use super::engine::{EngineStats, EnforceRequest, PolicyEngine};
use super::policy::{
    GroupingDelta, GroupingTuple, PolicyDelta, PolicyTuple, derive_groupings, derive_role_tuples,
};
use super::route_cache::RouteCache;
use super::subject::Subject;

/// Engine state that may lag the durable store after a failed sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum SyncTarget {
    Role(i32),
    Groupings,
}

impl std::fmt::Display for SyncTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Role(id) => write!(f, "role:{id}"),
            Self::Groupings => f.write_str("groupings"),
        }
    }
}

/// Outcome of a completed role grant sync.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub role_id: i32,
    pub revision: i64,
    /// Granted node ids after descendant expansion.
    pub granted_ids: Vec<i32>,
    pub added_ids: Vec<i32>,
    pub removed_ids: Vec<i32>,
    pub policies_added: usize,
    pub policies_removed: usize,
    pub invalidated_keys: Vec<String>,
}

/// Engine tuples of a role compared with their durable derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub role_id: i32,
    pub converged: bool,
    /// Derivable from durable grants but absent from the engine.
    pub missing: Vec<PolicyTuple>,
    /// Held by the engine without a durable grant.
    pub unexpected: Vec<PolicyTuple>,
}

pub struct PolicySynchronizer {
    store: Arc<dyn AuthzStore>,
    engine: Arc<dyn PolicyEngine>,
    routes: Arc<RouteCache>,
    config: AuthzConfig,
    role_locks: DashMap<i32, Arc<Mutex<()>>>,
    membership_lock: Mutex<()>,
    /// Held shared by incremental edits and exclusively by a full resync.
    resync_gate: RwLock<()>,
    pending: DashMap<SyncTarget, Vec<i32>>,
    /// Last durable cross-check of a denial, per user.
    mismatch_checks: DashMap<uuid::Uuid, Instant>,
}

impl PolicySynchronizer {
    #[must_use]
    pub fn new(
        store: Arc<dyn AuthzStore>,
        engine: Arc<dyn PolicyEngine>,
        routes: Arc<RouteCache>,
        config: AuthzConfig,
    ) -> Self {
        Self {
            store,
            engine,
            routes,
            config,
            role_locks: DashMap::new(),
            membership_lock: Mutex::new(()),
            resync_gate: RwLock::new(()),
            pending: DashMap::new(),
            mismatch_checks: DashMap::new(),
        }
    }

    fn role_lock(&self, role_id: i32) -> Arc<Mutex<()>> {
        self.role_locks.entry(role_id).or_default().clone()
    }

    /// Runs a durable write with `targets` recorded as pending. A failed write
    /// leaves the engine as it was, so targets it marked are cleared again;
    /// a successful one keeps them until the engine catches up.
    async fn write_durable<T>(
        &self,
        targets: &[SyncTarget],
        resource_ids: &[i32],
        write: impl std::future::Future<Output = Result<T, DbError>>,
    ) -> ServiceResult<T> {
        let marked: Vec<SyncTarget> = targets
            .iter()
            .copied()
            .filter(|target| !self.pending.contains_key(target))
            .collect();
        for target in &marked {
            self.pending.insert(*target, resource_ids.to_vec());
        }
        match write.await {
            Ok(value) => Ok(value),
            Err(err) => {
                for target in &marked {
                    self.pending.remove(target);
                }
                Err(err.into())
            }
        }
    }

    /// Targets whose engine state may lag the durable store, including edits
    /// in flight.
    #[must_use]
    pub fn pending_targets(&self) -> Vec<SyncTarget> {
        let mut targets: Vec<SyncTarget> = self.pending.iter().map(|e| *e.key()).collect();
        targets.sort_unstable();
        targets
    }

    /// ## Summary
    /// Replaces the role's grant set with `resource_ids` (expanded with
    /// descendants) and brings the engine in line. Re-running with the same
    /// set is a no-op apart from the revision bump.
    ///
    /// ## Errors
    /// - `Conflict` when `expected_revision` is stale; nothing is applied.
    /// - Store errors abort before the engine is touched.
    /// - `EngineSync` when the engine could not be updated after the durable commit.
    #[tracing::instrument(skip(self, resource_ids), fields(requested = resource_ids.len()))]
    pub async fn sync_role_policies(
        &self,
        role_id: i32,
        resource_ids: &[i32],
        actor: Option<uuid::Uuid>,
        expected_revision: Option<i64>,
    ) -> ServiceResult<SyncReport> {
        let _gate = self.resync_gate.read().await;
        let lock = self.role_lock(role_id);
        let _guard = lock.lock().await;
        self.sync_role_locked(role_id, resource_ids, actor, expected_revision)
            .await
    }

    /// ## Summary
    /// Adds `resource_ids` (and their descendants) to the role's grants.
    ///
    /// ## Errors
    /// Same as [`Self::sync_role_policies`].
    #[tracing::instrument(skip(self, resource_ids))]
    pub async fn grant_resources(
        &self,
        role_id: i32,
        resource_ids: &[i32],
        actor: Option<uuid::Uuid>,
    ) -> ServiceResult<SyncReport> {
        let _gate = self.resync_gate.read().await;
        let lock = self.role_lock(role_id);
        let _guard = lock.lock().await;

        let mut desired: BTreeSet<i32> = self
            .store
            .role_grants(role_id)
            .await?
            .iter()
            .map(|n| n.id)
            .collect();
        desired.extend(resource_ids.iter().copied());
        let desired: Vec<i32> = desired.into_iter().collect();
        self.sync_role_locked(role_id, &desired, actor, None).await
    }

    /// ## Summary
    /// Removes `resource_ids` and their descendants from the role's grants.
    /// A node whose ancestor stays granted is re-added by expansion.
    ///
    /// ## Errors
    /// Same as [`Self::sync_role_policies`].
    #[tracing::instrument(skip(self, resource_ids))]
    pub async fn revoke_resources(
        &self,
        role_id: i32,
        resource_ids: &[i32],
        actor: Option<uuid::Uuid>,
    ) -> ServiceResult<SyncReport> {
        let _gate = self.resync_gate.read().await;
        let lock = self.role_lock(role_id);
        let _guard = lock.lock().await;

        let all = self.store.list_resources().await?;
        let revoked: BTreeSet<i32> = expand_with_descendants(&all, resource_ids)
            .into_iter()
            .collect();
        let desired: Vec<i32> = self
            .store
            .role_grants(role_id)
            .await?
            .iter()
            .map(|n| n.id)
            .filter(|id| !revoked.contains(id))
            .collect();
        self.sync_role_locked(role_id, &desired, actor, None).await
    }

    async fn sync_role_locked(
        &self,
        role_id: i32,
        resource_ids: &[i32],
        actor: Option<uuid::Uuid>,
        expected_revision: Option<i64>,
    ) -> ServiceResult<SyncReport> {
        let outcome = self
            .write_durable(
                &[SyncTarget::Role(role_id)],
                resource_ids,
                self.store
                    .replace_role_grants(role_id, resource_ids, actor, expected_revision),
            )
            .await?;
        tracing::debug!(
            role_id,
            revision = outcome.revision,
            added = outcome.added_ids.len(),
            removed = outcome.removed_ids.len(),
            "Durable grants committed"
        );

        let desired = derive_role_tuples(role_id, &outcome.granted);
        let delta = self
            .apply_role_with_retry(role_id, &desired, &outcome.expanded_ids)
            .await?;
        let invalidated_keys = self.invalidate_keys(delta.touched_keys()).await;

        tracing::info!(
            role_id,
            revision = outcome.revision,
            policies_added = delta.add.len(),
            policies_removed = delta.remove.len(),
            "Role policies synchronized"
        );
        Ok(SyncReport {
            role_id,
            revision: outcome.revision,
            granted_ids: outcome.expanded_ids,
            added_ids: outcome.added_ids,
            removed_ids: outcome.removed_ids,
            policies_added: delta.add.len(),
            policies_removed: delta.remove.len(),
            invalidated_keys,
        })
    }

    async fn apply_role_with_retry(
        &self,
        role_id: i32,
        desired: &BTreeSet<PolicyTuple>,
        resource_ids: &[i32],
    ) -> ServiceResult<PolicyDelta> {
        let current: BTreeSet<PolicyTuple> =
            self.engine.role_policies(role_id).await?.into_iter().collect();
        let delta = PolicyDelta::between(&current, desired);
        let target = SyncTarget::Role(role_id);

        let engine = &self.engine;
        let pending_delta = &delta;
        self.retry(target, resource_ids, move || async move {
            if !pending_delta.is_empty() {
                engine.apply_delta(pending_delta).await?;
            }
            engine.save().await
        })
        .await?;
        Ok(delta)
    }

    async fn retry<F, Fut>(&self, target: SyncTarget, resource_ids: &[i32], op: F) -> ServiceResult<()>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = ServiceResult<()>>,
    {
        let attempts = self.config.sync_retry_attempts.max(1);
        let mut reason = String::new();
        for attempt in 1..=attempts {
            match op().await {
                Ok(()) => {
                    self.pending.remove(&target);
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(%target, attempt, attempts, error = %err, "Engine update failed");
                    reason = err.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.config.sync_retry_backoff() * attempt).await;
                    }
                }
            }
        }

        self.pending.insert(target, resource_ids.to_vec());
        tracing::error!(
            %target,
            ?resource_ids,
            attempts,
            reason = %reason,
            "Engine out of sync with durable store; marked for reconciliation"
        );
        Err(ServiceError::EngineSync {
            target: target.to_string(),
            resource_ids: resource_ids.to_vec(),
            attempts,
            reason,
        })
    }

    async fn invalidate_keys(&self, keys: BTreeSet<String>) -> Vec<String> {
        for key in &keys {
            if let Err(err) = self.routes.invalidate_resource_key(key).await {
                tracing::warn!(resource_key = %key, error = %err, "Route cache invalidation failed");
            }
        }
        keys.into_iter().collect()
    }

    // Grouping edits

    /// ## Summary
    /// Replaces the user's direct roles.
    ///
    /// ## Errors
    /// Store errors, or `EngineSync` after the durable commit.
    #[tracing::instrument(skip(self, role_ids))]
    pub async fn assign_user_roles(
        &self,
        user_id: uuid::Uuid,
        role_ids: &[i32],
        actor: Option<uuid::Uuid>,
    ) -> ServiceResult<()> {
        let _gate = self.resync_gate.read().await;
        let _guard = self.membership_lock.lock().await;
        self.write_durable(
            &[SyncTarget::Groupings],
            &[],
            self.store.replace_user_roles(user_id, role_ids, actor),
        )
        .await?;
        self.sync_groupings().await
    }

    /// ## Summary
    /// Replaces the roles granted to every member of the group.
    ///
    /// ## Errors
    /// Store errors, or `EngineSync` after the durable commit.
    #[tracing::instrument(skip(self, role_ids))]
    pub async fn assign_group_roles(
        &self,
        group_id: i32,
        role_ids: &[i32],
        actor: Option<uuid::Uuid>,
    ) -> ServiceResult<()> {
        let _gate = self.resync_gate.read().await;
        let _guard = self.membership_lock.lock().await;
        self.write_durable(
            &[SyncTarget::Groupings],
            &[],
            self.store.replace_group_roles(group_id, role_ids, actor),
        )
        .await?;
        self.sync_groupings().await
    }

    /// ## Summary
    /// Replaces the user's group memberships.
    ///
    /// ## Errors
    /// Store errors, or `EngineSync` after the durable commit.
    #[tracing::instrument(skip(self, group_ids))]
    pub async fn set_user_groups(
        &self,
        user_id: uuid::Uuid,
        group_ids: &[i32],
        actor: Option<uuid::Uuid>,
    ) -> ServiceResult<()> {
        let _gate = self.resync_gate.read().await;
        let _guard = self.membership_lock.lock().await;
        self.write_durable(
            &[SyncTarget::Groupings],
            &[],
            self.store.replace_user_groups(user_id, group_ids, actor),
        )
        .await?;
        self.sync_groupings().await
    }

    /// ## Summary
    /// Replaces the roles `role_id` inherits from. Cycles are stored as given;
    /// reachability stops at already visited roles.
    ///
    /// ## Errors
    /// Store errors, or `EngineSync` after the durable commit.
    #[tracing::instrument(skip(self, parent_ids))]
    pub async fn set_role_parents(
        &self,
        role_id: i32,
        parent_ids: &[i32],
        actor: Option<uuid::Uuid>,
    ) -> ServiceResult<()> {
        let _gate = self.resync_gate.read().await;
        let _guard = self.membership_lock.lock().await;
        self.write_durable(
            &[SyncTarget::Groupings],
            &[],
            self.store.replace_role_parents(role_id, parent_ids, actor),
        )
        .await?;
        self.sync_groupings().await
    }

    /// ## Summary
    /// Soft-deletes the group and removes the role edges its members held
    /// through it.
    ///
    /// ## Errors
    /// `NotFound` for an unknown group, store errors, or `EngineSync`.
    #[tracing::instrument(skip(self))]
    pub async fn delete_group(
        &self,
        group_id: i32,
        actor: Option<uuid::Uuid>,
    ) -> ServiceResult<()> {
        let _gate = self.resync_gate.read().await;
        let _guard = self.membership_lock.lock().await;
        self.write_durable(
            &[SyncTarget::Groupings],
            &[],
            self.store.soft_delete_group(group_id, actor),
        )
        .await?;
        self.sync_groupings().await?;
        tracing::info!(group_id, "Group deleted");
        Ok(())
    }

    async fn sync_groupings(&self) -> ServiceResult<()> {
        let snapshot = self.store.memberships().await?;
        let desired = derive_groupings(&snapshot);
        let current: BTreeSet<GroupingTuple> =
            self.engine.all_groupings().await?.into_iter().collect();
        let delta = GroupingDelta::between(&current, &desired);
        tracing::debug!(
            added = delta.add.len(),
            removed = delta.remove.len(),
            "Grouping delta computed"
        );

        let engine = &self.engine;
        let delta = &delta;
        self.retry(SyncTarget::Groupings, &[], move || async move {
            if !delta.is_empty() {
                engine.apply_grouping_delta(delta).await?;
            }
            engine.save().await
        })
        .await
    }

    /// ## Summary
    /// Soft-deletes the role, drops its grants and memberships, and removes its
    /// tuples and edges from the engine. The superuser role cannot be deleted.
    ///
    /// ## Errors
    /// `InvalidInput` for the superuser role, store errors, or `EngineSync`.
    #[tracing::instrument(skip(self))]
    pub async fn delete_role(&self, role_id: i32, actor: Option<uuid::Uuid>) -> ServiceResult<()> {
        if role_id == SUPERUSER_ROLE_ID {
            return Err(ServiceError::InvalidInput(
                "the superuser role cannot be deleted".to_string(),
            ));
        }
        let _gate = self.resync_gate.read().await;
        let lock = self.role_lock(role_id);
        let _guard = lock.lock().await;
        let _membership = self.membership_lock.lock().await;

        self.write_durable(
            &[SyncTarget::Role(role_id), SyncTarget::Groupings],
            &[],
            self.store.soft_delete_role(role_id, actor),
        )
        .await?;
        let delta = self
            .apply_role_with_retry(role_id, &BTreeSet::new(), &[])
            .await?;
        self.invalidate_keys(delta.touched_keys()).await;
        self.sync_groupings().await?;
        self.role_locks.remove(&role_id);
        tracing::info!(role_id, "Role deleted");
        Ok(())
    }

    /// ## Summary
    /// Brings every role granting one of `resource_ids` back in line after the
    /// nodes were edited or deleted, and invalidates the route entries of
    /// `resource_keys` (old and new keys of edited nodes).
    ///
    /// ## Errors
    /// Store errors, or `EngineSync` for the first role that fails.
    #[tracing::instrument(skip(self))]
    pub async fn resources_changed(
        &self,
        resource_ids: &[i32],
        resource_keys: &[String],
    ) -> ServiceResult<()> {
        let _gate = self.resync_gate.read().await;
        for role_id in self.store.roles_granting(resource_ids).await? {
            let lock = self.role_lock(role_id);
            let _guard = lock.lock().await;
            let delta = self.resync_role(role_id).await?;
            self.invalidate_keys(delta.touched_keys()).await;
        }
        self.invalidate_keys(resource_keys.iter().cloned().collect())
            .await;
        Ok(())
    }

    async fn resync_role(&self, role_id: i32) -> ServiceResult<PolicyDelta> {
        let granted = match self.store.role_grants(role_id).await {
            Ok(granted) => granted,
            Err(DbError::NotFound(_)) => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        let desired = derive_role_tuples(role_id, &granted);
        let ids: Vec<i32> = granted.iter().map(|n| n.id).collect();
        self.apply_role_with_retry(role_id, &desired, &ids).await
    }

    /// ## Summary
    /// Rebuilds the engine from the durable store: every live grant and every
    /// membership edge. Blocks incremental edits while running.
    ///
    /// ## Errors
    /// Store or engine failures.
    #[tracing::instrument(skip(self))]
    pub async fn resync_all(&self) -> ServiceResult<EngineStats> {
        let _gate = self.resync_gate.write().await;

        let mut policies: BTreeSet<PolicyTuple> = BTreeSet::new();
        for (role_id, node) in self.store.all_grants().await? {
            policies.extend(derive_role_tuples(role_id, std::slice::from_ref(&node)));
        }
        let groupings = derive_groupings(&self.store.memberships().await?);

        let policies: Vec<PolicyTuple> = policies.into_iter().collect();
        let groupings: Vec<GroupingTuple> = groupings.into_iter().collect();
        self.engine.replace_all(&policies, &groupings).await?;
        self.engine.save().await?;
        self.pending.clear();

        let stats = self.engine.stats().await?;
        tracing::info!(
            policy_count = stats.policy_count,
            grouping_count = stats.grouping_count,
            "Engine resynchronized from durable store"
        );
        Ok(stats)
    }

    /// ## Summary
    /// Compares the role's engine tuples with their durable derivation.
    ///
    /// ## Errors
    /// Store or engine failures.
    pub async fn verify_role(&self, role_id: i32) -> ServiceResult<VerifyReport> {
        let granted = self.store.role_grants(role_id).await?;
        let desired = derive_role_tuples(role_id, &granted);
        let current: BTreeSet<PolicyTuple> =
            self.engine.role_policies(role_id).await?.into_iter().collect();
        let delta = PolicyDelta::between(&current, &desired);
        Ok(VerifyReport {
            role_id,
            converged: delta.is_empty(),
            missing: delta.add,
            unexpected: delta.remove,
        })
    }

    /// ## Summary
    /// Retries every pending target. Returns how many were reconciled.
    ///
    /// ## Errors
    /// The first target that still fails.
    pub async fn reconcile_pending(&self) -> ServiceResult<usize> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        let _gate = self.resync_gate.read().await;
        let targets = self.pending_targets();
        for target in &targets {
            tracing::info!(%target, "Reconciling pending engine state");
            match target {
                SyncTarget::Role(role_id) => {
                    let lock = self.role_lock(*role_id);
                    let _guard = lock.lock().await;
                    self.resync_role(*role_id).await?;
                }
                SyncTarget::Groupings => {
                    let _guard = self.membership_lock.lock().await;
                    self.sync_groupings().await?;
                }
            }
        }
        Ok(targets.len())
    }

    /// ## Summary
    /// Evaluates a request against the engine after reconciling pending
    /// targets. A denial for a user whose durable grants would allow the
    /// request is an enforcement mismatch: the user's roles and the grouping
    /// relation are resynced and the request evaluated once more. Denials are
    /// cross-checked against the store at most once per user per
    /// `mismatch_check_interval`.
    ///
    /// ## Errors
    /// Engine or store failures. Callers must treat any error as a denial.
    pub async fn evaluate(&self, request: &EnforceRequest) -> ServiceResult<bool> {
        self.reconcile_pending().await?;
        if self.engine.enforce(request).await? {
            return Ok(true);
        }

        let Subject::User(user_id) = request.subject else {
            return Ok(false);
        };
        if !self.mismatch_check_due(user_id) {
            return Ok(false);
        }
        let role_ids = match self.store.effective_role_ids(user_id).await {
            Ok(ids) => ids,
            Err(DbError::NotFound(_)) => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        let durable_allows = role_ids.contains(&SUPERUSER_ROLE_ID)
            || self
                .store
                .resources_for_roles(&role_ids)
                .await?
                .iter()
                .any(|n| {
                    n.is_enforceable()
                        && n.resource_key == request.resource_key
                        && n.action == request.action
                });
        if !durable_allows {
            return Ok(false);
        }

        tracing::warn!(
            subject = %request.subject,
            resource_key = %request.resource_key,
            action = %request.action,
            "Enforcement mismatch with durable grants; resyncing"
        );
        {
            let _gate = self.resync_gate.read().await;
            for role_id in &role_ids {
                let lock = self.role_lock(*role_id);
                let _guard = lock.lock().await;
                self.resync_role(*role_id).await?;
            }
            let _guard = self.membership_lock.lock().await;
            self.sync_groupings().await?;
        }
        self.engine.enforce(request).await
    }

    fn mismatch_check_due(&self, user_id: uuid::Uuid) -> bool {
        let now = Instant::now();
        match self.mismatch_checks.entry(user_id) {
            Entry::Occupied(mut last) => {
                if now.duration_since(*last.get()) < self.config.mismatch_check_interval() {
                    return false;
                }
                last.insert(now);
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
            }
        }
        true
    }
}
