//! Engine tuples and their derivation from durable state.
//!
//! Policy rules always have six fields: subject, resource key, action, then the
//! reserved tenant, scope and time dimensions. Rules read back from an adapter
//! that trims empty trailing values are padded to that arity.

use std::collections::BTreeSet;

use serde::Serialize;

use klinik_db::model::grant::MembershipSnapshot;
use klinik_db::model::resource::ResourceNode;

use super::subject::Subject;

pub const POLICY_ARITY: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PolicyTuple {
    pub subject: String,
    pub resource_key: String,
    pub action: String,
    pub tenant: String,
    pub scope: String,
    pub time: String,
}

impl PolicyTuple {
    /// A role grant with the reserved dimensions left empty.
    #[must_use]
    pub fn for_role(role_id: i32, resource_key: &str, action: &str) -> Self {
        Self {
            subject: Subject::Role(role_id).casbin_subject(),
            resource_key: resource_key.to_string(),
            action: action.to_string(),
            tenant: String::new(),
            scope: String::new(),
            time: String::new(),
        }
    }

    #[must_use]
    pub fn to_rule(&self) -> Vec<String> {
        vec![
            self.subject.clone(),
            self.resource_key.clone(),
            self.action.clone(),
            self.tenant.clone(),
            self.scope.clone(),
            self.time.clone(),
        ]
    }

    /// Builds a tuple from an engine rule, padding missing trailing fields.
    /// Rules shorter than three fields or longer than six are rejected.
    #[must_use]
    pub fn from_rule(rule: &[String]) -> Option<Self> {
        if rule.len() < 3 || rule.len() > POLICY_ARITY {
            return None;
        }
        let field = |i: usize| rule.get(i).cloned().unwrap_or_default();
        Some(Self {
            subject: field(0),
            resource_key: field(1),
            action: field(2),
            tenant: field(3),
            scope: field(4),
            time: field(5),
        })
    }
}

/// A `g` edge: `member` inherits everything `parent` holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct GroupingTuple {
    pub member: String,
    pub parent: String,
}

impl GroupingTuple {
    #[must_use]
    pub fn new(member: Subject, parent: Subject) -> Self {
        Self {
            member: member.casbin_subject(),
            parent: parent.casbin_subject(),
        }
    }

    #[must_use]
    pub fn to_rule(&self) -> Vec<String> {
        vec![self.member.clone(), self.parent.clone()]
    }

    #[must_use]
    pub fn from_rule(rule: &[String]) -> Option<Self> {
        match rule {
            [member, parent, ..] => Some(Self {
                member: member.clone(),
                parent: parent.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PolicyDelta {
    pub add: Vec<PolicyTuple>,
    pub remove: Vec<PolicyTuple>,
}

impl PolicyDelta {
    /// Minimal edit turning `current` into `desired`.
    #[must_use]
    pub fn between(current: &BTreeSet<PolicyTuple>, desired: &BTreeSet<PolicyTuple>) -> Self {
        Self {
            add: desired.difference(current).cloned().collect(),
            remove: current.difference(desired).cloned().collect(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }

    /// Resource keys whose tuples change.
    #[must_use]
    pub fn touched_keys(&self) -> BTreeSet<String> {
        self.add
            .iter()
            .chain(&self.remove)
            .map(|t| t.resource_key.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupingDelta {
    pub add: Vec<GroupingTuple>,
    pub remove: Vec<GroupingTuple>,
}

impl GroupingDelta {
    #[must_use]
    pub fn between(current: &BTreeSet<GroupingTuple>, desired: &BTreeSet<GroupingTuple>) -> Self {
        Self {
            add: desired.difference(current).cloned().collect(),
            remove: current.difference(desired).cloned().collect(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

/// ## Summary
/// Tuples a role must hold for its granted nodes. Only enforceable nodes (data
/// view or route-bearing) contribute; menu-only nodes shape the view tree.
#[must_use]
pub fn derive_role_tuples(role_id: i32, granted: &[ResourceNode]) -> BTreeSet<PolicyTuple> {
    granted
        .iter()
        .filter(|node| !node.is_deleted() && node.is_enforceable())
        .map(|node| PolicyTuple::for_role(role_id, &node.resource_key, &node.action))
        .collect()
}

/// Every `g` edge implied by durable memberships.
#[must_use]
pub fn derive_groupings(snapshot: &MembershipSnapshot) -> BTreeSet<GroupingTuple> {
    let users = snapshot
        .user_roles
        .iter()
        .map(|(user, role)| GroupingTuple::new(Subject::User(*user), Subject::Role(*role)));
    let user_groups = snapshot
        .user_groups
        .iter()
        .map(|(user, group)| GroupingTuple::new(Subject::User(*user), Subject::Group(*group)));
    let group_roles = snapshot
        .group_roles
        .iter()
        .map(|(group, role)| GroupingTuple::new(Subject::Group(*group), Subject::Role(*role)));
    let role_parents = snapshot
        .role_parents
        .iter()
        .map(|(role, parent)| GroupingTuple::new(Subject::Role(*role), Subject::Role(*parent)));

    users
        .chain(user_groups)
        .chain(group_roles)
        .chain(role_parents)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{keyed, routed};

    #[test]
    fn derivation_skips_menu_only_nodes() {
        let granted = vec![
            keyed(1, "kehadiran", "read", Some("menu")),
            keyed(2, "kehadiran.approve", "update", Some("data")),
            routed(3, "kehadiran.list", "read", "GET", "/api/kehadiran"),
        ];
        let tuples = derive_role_tuples(4, &granted);
        let keys: Vec<&str> = tuples.iter().map(|t| t.resource_key.as_str()).collect();
        assert_eq!(keys, vec!["kehadiran.approve", "kehadiran.list"]);
        assert!(tuples.iter().all(|t| t.subject == "role:4"));
    }

    #[test]
    fn short_rules_are_padded() {
        let rule = vec!["role:2".to_string(), "a".to_string(), "read".to_string()];
        let tuple = PolicyTuple::from_rule(&rule).unwrap();
        assert_eq!(tuple.to_rule().len(), POLICY_ARITY);
        assert_eq!(tuple, PolicyTuple::for_role(2, "a", "read"));
        assert!(PolicyTuple::from_rule(&rule[..2]).is_none());
    }

    #[test]
    fn delta_is_minimal() {
        let current: BTreeSet<_> = [
            PolicyTuple::for_role(2, "a", "read"),
            PolicyTuple::for_role(2, "b", "read"),
        ]
        .into();
        let desired: BTreeSet<_> = [
            PolicyTuple::for_role(2, "b", "read"),
            PolicyTuple::for_role(2, "c", "read"),
        ]
        .into();

        let delta = PolicyDelta::between(&current, &desired);
        assert_eq!(delta.add, vec![PolicyTuple::for_role(2, "c", "read")]);
        assert_eq!(delta.remove, vec![PolicyTuple::for_role(2, "a", "read")]);
        assert_eq!(
            delta.touched_keys().into_iter().collect::<Vec<_>>(),
            vec!["a".to_string(), "c".to_string()]
        );
        assert!(PolicyDelta::between(&desired, &desired).is_empty());
    }

    #[test]
    fn groupings_cover_every_membership_kind() {
        let user = uuid::Uuid::now_v7();
        let snapshot = MembershipSnapshot {
            user_roles: vec![(user, 2)],
            user_groups: vec![(user, 5)],
            group_roles: vec![(5, 3)],
            role_parents: vec![(3, 4)],
        };
        let groupings = derive_groupings(&snapshot);
        assert_eq!(groupings.len(), 4);
        assert!(groupings.contains(&GroupingTuple::new(Subject::Group(5), Subject::Role(3))));
        assert!(groupings.contains(&GroupingTuple::new(Subject::Role(3), Subject::Role(4))));
    }
}
