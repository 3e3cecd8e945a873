use std::collections::BTreeSet;

use async_trait::async_trait;
use casbin::{CoreApi, MgmtApi};
use tokio::sync::RwLock;

use klinik_db::db::connection::DbPool;

use crate::error::{ServiceError, ServiceResult};

use super::engine::{EngineStats, EnforceRequest, PolicyEngine};
use super::policy::{GroupingDelta, GroupingTuple, POLICY_ARITY, PolicyDelta, PolicyTuple};
use super::subject::Subject;

const MODEL: &str = include_str!("casbin_model.conf");

/// ## Summary
/// Initialize a Casbin enforcer with a Diesel adapter using the provided connection pool.
/// Auto-save is disabled; the policy synchronizer persists explicitly.
///
/// ## Errors
/// Returns an error if the model, adapter or enforcer fails to initialize.
#[tracing::instrument(skip(pool))]
pub async fn init_casbin(pool: DbPool) -> ServiceResult<casbin::Enforcer> {
    tracing::debug!("Initializing Casbin enforcer");

    let model = casbin::DefaultModel::from_str(MODEL).await?;
    tracing::debug!("Casbin model loaded");

    let adapter = diesel_async_adapter::DieselAdapter::with_pool(pool).await?;
    tracing::debug!("Casbin adapter created");

    let mut enforcer = casbin::Enforcer::new(model, adapter).await?;
    enforcer.enable_auto_save(false);
    let padded = pad_short_rules(&mut enforcer).await?;

    tracing::info!(
        policy_count = enforcer.get_policy().len(),
        grouping_count = enforcer.get_grouping_policy().len(),
        padded,
        "Casbin enforcer initialized successfully"
    );
    Ok(enforcer)
}

/// ## Summary
/// Rewrites loaded policy rules shorter than the model's arity with empty
/// trailing fields. Adapters that drop empty trailing columns otherwise make
/// every enforce call fail with a definition mismatch.
///
/// ## Errors
/// Casbin errors from removing or re-adding the rules.
pub async fn pad_short_rules(enforcer: &mut casbin::Enforcer) -> ServiceResult<usize> {
    let short: Vec<Vec<String>> = enforcer
        .get_policy()
        .into_iter()
        .filter(|rule| rule.len() < POLICY_ARITY)
        .collect();
    if short.is_empty() {
        return Ok(0);
    }

    let padded: Vec<Vec<String>> = short
        .iter()
        .filter_map(|rule| PolicyTuple::from_rule(rule))
        .map(|tuple| tuple.to_rule())
        .filter(|rule| !enforcer.has_policy(rule.clone()))
        .collect();

    tracing::warn!(count = short.len(), "Padding short policy rules");
    enforcer.remove_policies(short.clone()).await?;
    if !padded.is_empty() {
        enforcer.add_policies(padded).await?;
    }
    Ok(short.len())
}

/// [`PolicyEngine`] over a Casbin enforcer.
pub struct CasbinEngine {
    enforcer: RwLock<casbin::Enforcer>,
}

impl CasbinEngine {
    #[must_use]
    pub fn from_enforcer(enforcer: casbin::Enforcer) -> Self {
        Self {
            enforcer: RwLock::new(enforcer),
        }
    }

    /// ## Summary
    /// An engine over an in-memory adapter, starting empty.
    ///
    /// ## Errors
    /// Returns an error if the model fails to load.
    pub async fn in_memory() -> ServiceResult<Self> {
        let model = casbin::DefaultModel::from_str(MODEL).await?;
        let mut enforcer = casbin::Enforcer::new(model, casbin::MemoryAdapter::default()).await?;
        enforcer.enable_auto_save(false);
        Ok(Self::from_enforcer(enforcer))
    }
}

fn rules<T>(tuples: &[T], to_rule: fn(&T) -> Vec<String>) -> Vec<Vec<String>> {
    tuples.iter().map(to_rule).collect()
}

#[async_trait]
impl PolicyEngine for CasbinEngine {
    async fn enforce(&self, request: &EnforceRequest) -> ServiceResult<bool> {
        let sub = request.subject.casbin_subject();
        let enforcer = self.enforcer.read().await;
        enforcer
            .enforce((
                sub.as_str(),
                request.resource_key.as_str(),
                request.action.as_str(),
                request.tenant.as_str(),
                request.scope.as_str(),
                request.time.as_str(),
            ))
            .map_err(ServiceError::CasbinError)
    }

    async fn role_policies(&self, role_id: i32) -> ServiceResult<Vec<PolicyTuple>> {
        let sub = Subject::Role(role_id).casbin_subject();
        let enforcer = self.enforcer.read().await;
        Ok(enforcer
            .get_filtered_policy(0, vec![sub])
            .iter()
            .filter_map(|rule| PolicyTuple::from_rule(rule))
            .collect())
    }

    async fn has_policy(&self, tuple: &PolicyTuple) -> ServiceResult<bool> {
        Ok(self.enforcer.read().await.has_policy(tuple.to_rule()))
    }

    // Batch calls are all-or-nothing in Casbin, so rules already in the
    // desired state are filtered out first.
    async fn apply_delta(&self, delta: &PolicyDelta) -> ServiceResult<()> {
        let mut enforcer = self.enforcer.write().await;

        let remove: Vec<Vec<String>> = rules(&delta.remove, PolicyTuple::to_rule)
            .into_iter()
            .filter(|rule| enforcer.has_policy(rule.clone()))
            .collect();
        if !remove.is_empty() {
            enforcer.remove_policies(remove).await?;
        }

        let add: Vec<Vec<String>> = rules(&delta.add, PolicyTuple::to_rule)
            .into_iter()
            .filter(|rule| !enforcer.has_policy(rule.clone()))
            .collect();
        if !add.is_empty() {
            enforcer.add_policies(add).await?;
        }
        Ok(())
    }

    async fn all_groupings(&self) -> ServiceResult<Vec<GroupingTuple>> {
        let enforcer = self.enforcer.read().await;
        Ok(enforcer
            .get_grouping_policy()
            .iter()
            .filter_map(|rule| GroupingTuple::from_rule(rule))
            .collect())
    }

    async fn apply_grouping_delta(&self, delta: &GroupingDelta) -> ServiceResult<()> {
        let mut enforcer = self.enforcer.write().await;

        let remove: Vec<Vec<String>> = rules(&delta.remove, GroupingTuple::to_rule)
            .into_iter()
            .filter(|rule| enforcer.has_grouping_policy(rule.clone()))
            .collect();
        if !remove.is_empty() {
            enforcer.remove_grouping_policies(remove).await?;
        }

        let add: Vec<Vec<String>> = rules(&delta.add, GroupingTuple::to_rule)
            .into_iter()
            .filter(|rule| !enforcer.has_grouping_policy(rule.clone()))
            .collect();
        if !add.is_empty() {
            enforcer.add_grouping_policies(add).await?;
        }
        Ok(())
    }

    async fn replace_all(
        &self,
        policies: &[PolicyTuple],
        groupings: &[GroupingTuple],
    ) -> ServiceResult<()> {
        let (current_policies, current_groupings): (BTreeSet<PolicyTuple>, BTreeSet<GroupingTuple>) = {
            let enforcer = self.enforcer.read().await;
            (
                enforcer
                    .get_policy()
                    .iter()
                    .filter_map(|rule| PolicyTuple::from_rule(rule))
                    .collect(),
                enforcer
                    .get_grouping_policy()
                    .iter()
                    .filter_map(|rule| GroupingTuple::from_rule(rule))
                    .collect(),
            )
        };

        let desired_policies: BTreeSet<PolicyTuple> = policies.iter().cloned().collect();
        let desired_groupings: BTreeSet<GroupingTuple> = groupings.iter().cloned().collect();
        let policy_delta = PolicyDelta::between(&current_policies, &desired_policies);
        let grouping_delta = GroupingDelta::between(&current_groupings, &desired_groupings);

        tracing::debug!(
            policies_added = policy_delta.add.len(),
            policies_removed = policy_delta.remove.len(),
            groupings_added = grouping_delta.add.len(),
            groupings_removed = grouping_delta.remove.len(),
            "Replacing engine contents"
        );

        self.apply_delta(&policy_delta).await?;
        self.apply_grouping_delta(&grouping_delta).await
    }

    async fn save(&self) -> ServiceResult<()> {
        self.enforcer.write().await.save_policy().await?;
        Ok(())
    }

    async fn stats(&self) -> ServiceResult<EngineStats> {
        let enforcer = self.enforcer.read().await;
        Ok(EngineStats {
            policy_count: enforcer.get_policy().len(),
            grouping_count: enforcer.get_grouping_policy().len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use casbin::{CoreApi, DefaultModel, Enforcer};
    use string_adapter::StringAdapter;

    use super::*;

    /// ## Summary
    /// Creates a test enforcer with the production model and test policies.
    async fn create_test_enforcer(policies: &'static str) -> Enforcer {
        let model = DefaultModel::from_str(MODEL)
            .await
            .expect("Failed to load Casbin model");
        let adapter = StringAdapter::new(policies);
        let mut enforcer = Enforcer::new(model, adapter)
            .await
            .expect("Failed to create enforcer");
        pad_short_rules(&mut enforcer)
            .await
            .expect("Failed to pad rules");
        enforcer
    }

    const POLICIES: &str = r"
p, role:2, kehadiran.approve, update
p, role:3, kehadiran.list, read
p, role:4, laporan.export, read

g, group:7, role:2
g, role:2, role:3
g, role:3, role:2
";

    #[tokio::test]
    async fn short_rules_are_padded_on_load() {
        let e = create_test_enforcer(POLICIES).await;
        assert!(e.get_policy().iter().all(|rule| rule.len() == POLICY_ARITY));
        assert!(
            e.enforce(("role:2", "kehadiran.approve", "update", "", "", ""))
                .unwrap()
        );
    }

    #[tokio::test]
    async fn superuser_role_bypasses_policies() {
        let e = create_test_enforcer(
            r"
p, role:2, kehadiran.approve, update
g, user:root, role:1
",
        )
        .await;
        assert!(
            e.enforce(("user:root", "anything.at.all", "delete", "", "", ""))
                .unwrap()
        );
        assert!(
            !e.enforce(("user:nobody", "anything.at.all", "delete", "", "", ""))
                .unwrap()
        );
    }

    #[tokio::test]
    async fn group_members_inherit_group_roles() {
        let e = create_test_enforcer(
            r"
p, role:2, kehadiran.approve, update
g, group:7, role:2
g, user:siti, group:7
",
        )
        .await;
        assert!(
            e.enforce(("user:siti", "kehadiran.approve", "update", "", "", ""))
                .unwrap()
        );
        assert!(
            !e.enforce(("user:siti", "kehadiran.approve", "delete", "", "", ""))
                .unwrap()
        );
    }

    #[tokio::test]
    async fn role_cycles_terminate() {
        let e = create_test_enforcer(POLICIES).await;
        assert!(
            e.enforce(("role:2", "kehadiran.list", "read", "", "", ""))
                .unwrap()
        );
        assert!(
            e.enforce(("role:3", "kehadiran.approve", "update", "", "", ""))
                .unwrap()
        );
        assert!(
            !e.enforce(("role:3", "laporan.export", "read", "", "", ""))
                .unwrap()
        );
    }

    #[tokio::test]
    async fn engine_deltas_skip_present_rules() {
        let engine = CasbinEngine::in_memory().await.unwrap();
        let tuple = PolicyTuple::for_role(5, "obat.stock", "read");
        let delta = PolicyDelta {
            add: vec![tuple.clone()],
            remove: vec![PolicyTuple::for_role(5, "obat.absent", "read")],
        };
        engine.apply_delta(&delta).await.unwrap();
        engine.apply_delta(&delta).await.unwrap();

        assert_eq!(engine.role_policies(5).await.unwrap(), vec![tuple.clone()]);
        assert!(engine.has_policy(&tuple).await.unwrap());
    }

    #[tokio::test]
    async fn replace_all_converges_to_given_sets() {
        let engine = CasbinEngine::in_memory().await.unwrap();
        engine
            .apply_delta(&PolicyDelta {
                add: vec![PolicyTuple::for_role(9, "stale", "read")],
                remove: Vec::new(),
            })
            .await
            .unwrap();

        let user = uuid::Uuid::now_v7();
        let policies = vec![PolicyTuple::for_role(2, "kehadiran.approve", "update")];
        let groupings = vec![GroupingTuple::new(Subject::User(user), Subject::Role(2))];
        engine.replace_all(&policies, &groupings).await.unwrap();

        assert_eq!(
            engine.stats().await.unwrap(),
            EngineStats {
                policy_count: 1,
                grouping_count: 1
            }
        );
        let request = EnforceRequest::new(Subject::User(user), "kehadiran.approve", "update");
        assert!(engine.enforce(&request).await.unwrap());
        assert!(engine.role_policies(9).await.unwrap().is_empty());
    }
}
