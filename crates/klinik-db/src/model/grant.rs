use std::collections::{HashMap, HashSet, VecDeque};

use diesel::prelude::*;
use serde::Serialize;

use crate::db::schema;
use crate::model::resource::ResourceNode;

#[derive(Debug, Clone, PartialEq, Eq, Insertable)]
#[diesel(table_name = schema::role_grant)]
pub struct NewRoleGrant {
    pub role_id: i32,
    pub resource_id: i32,
    pub created_by: Option<uuid::Uuid>,
}

/// Result of replacing a role's grant set inside one transaction.
#[derive(Debug, Clone, Serialize)]
pub struct GrantSyncOutcome {
    pub role_id: i32,
    /// Revision after the bump.
    pub revision: i64,
    /// Requested ids after descendant expansion.
    pub expanded_ids: Vec<i32>,
    pub added_ids: Vec<i32>,
    pub removed_ids: Vec<i32>,
    /// The role's live grants as read back before commit.
    #[serde(skip_serializing)]
    pub granted: Vec<ResourceNode>,
}

/// Every membership edge, used to rebuild the engine's grouping relation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipSnapshot {
    pub user_roles: Vec<(uuid::Uuid, i32)>,
    pub user_groups: Vec<(uuid::Uuid, i32)>,
    pub group_roles: Vec<(i32, i32)>,
    /// `(role, parent role)`: the role inherits the parent's grants.
    pub role_parents: Vec<(i32, i32)>,
}

/// ## Summary
/// Collects every role reachable from the given direct roles and groups.
/// Traversal follows group→role and role→parent edges breadth-first with a
/// visited set, so cycles in either relation terminate.
#[must_use]
pub fn reachable_roles(
    direct_roles: &[i32],
    groups: &[i32],
    group_roles: &[(i32, i32)],
    role_parents: &[(i32, i32)],
) -> Vec<i32> {
    let mut parents: HashMap<i32, Vec<i32>> = HashMap::new();
    for (role, parent) in role_parents {
        parents.entry(*role).or_default().push(*parent);
    }

    let group_set: HashSet<i32> = groups.iter().copied().collect();
    let mut queue: VecDeque<i32> = direct_roles.iter().copied().collect();
    queue.extend(
        group_roles
            .iter()
            .filter(|(group, _)| group_set.contains(group))
            .map(|(_, role)| *role),
    );

    let mut seen = HashSet::new();
    while let Some(role) = queue.pop_front() {
        if !seen.insert(role) {
            continue;
        }
        if let Some(next) = parents.get(&role) {
            queue.extend(next.iter().copied().filter(|r| !seen.contains(r)));
        }
    }

    let mut roles: Vec<i32> = seen.into_iter().collect();
    roles.sort_unstable();
    roles
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reachable_roles_through_groups_and_parents() {
        let roles = reachable_roles(&[2], &[10], &[(10, 3), (11, 4)], &[(3, 5)]);
        assert_eq!(roles, vec![2, 3, 5]);
    }

    #[test]
    fn reachable_roles_terminates_on_cycle() {
        let roles = reachable_roles(&[2], &[], &[], &[(2, 3), (3, 2)]);
        assert_eq!(roles, vec![2, 3]);
    }
}
