use std::collections::{HashMap, HashSet};

use diesel::{pg::Pg, prelude::*};
use serde::{Deserialize, Serialize};

use klinik_core::constants::{DATA_VIEW, ROUTE_VALUE_SEPARATOR};
use klinik_core::error::{CoreError, CoreResult};

use crate::db::schema;
use crate::model::route;

/// A node of the permission catalogue. Nodes form a forest via `parent_id`.
#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = schema::resource_node)]
#[diesel(check_for_backend(Pg))]
pub struct ResourceNode {
    pub id: i32,
    pub label: String,
    pub resource_key: String,
    pub action: String,
    pub parent_id: Option<i32>,
    pub view: Option<String>,
    pub data: Option<String>,
    pub level: Option<i16>,
    pub path: Option<String>,
    pub route_path: Option<String>,
    pub route_method: Option<String>,
    pub created_by: Option<uuid::Uuid>,
    pub updated_by: Option<uuid::Uuid>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing)]
    pub deleted_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl ResourceNode {
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Returns `(path, method)` when the node guards an HTTP route.
    #[must_use]
    pub fn route(&self) -> Option<(&str, &str)> {
        match (self.route_path.as_deref(), self.route_method.as_deref()) {
            (Some(path), Some(method)) => Some((path, method)),
            _ => None,
        }
    }

    /// Data nodes and route-bearing nodes produce enforcement tuples; pure
    /// menu nodes only shape the view tree.
    #[must_use]
    pub fn is_enforceable(&self) -> bool {
        self.view.as_deref() == Some(DATA_VIEW) || self.route().is_some()
    }
}

/// Administrator-supplied fields for creating or replacing a node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResourceNodeInput {
    pub label: String,
    pub resource_key: String,
    pub action: String,
    #[serde(default)]
    pub parent_id: Option<i32>,
    #[serde(default)]
    pub view: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub route_path: Option<String>,
    #[serde(default)]
    pub route_method: Option<String>,
}

impl ResourceNodeInput {
    /// ## Summary
    /// Validates and normalizes the input. The resource key and action must be
    /// non-empty and free of the route cache separator; a route needs both a
    /// path and a method.
    ///
    /// ## Errors
    /// Returns `InvalidInput` describing the first offending field.
    pub fn validate(mut self) -> CoreResult<Self> {
        self.label = self.label.trim().to_string();
        if self.label.is_empty() {
            return Err(CoreError::InvalidInput("label must not be empty".into()));
        }
        validate_component("resource_key", &self.resource_key)?;
        validate_component("action", &self.action)?;

        match (self.route_path.take(), self.route_method.take()) {
            (None, None) => {}
            (Some(path), Some(method)) => {
                self.route_path = Some(route::validate_path(&path)?);
                self.route_method = Some(route::normalize_method(&method)?);
            }
            _ => {
                return Err(CoreError::InvalidInput(
                    "route_path and route_method must be set together".into(),
                ));
            }
        }
        Ok(self)
    }
}

fn validate_component(field: &str, value: &str) -> CoreResult<()> {
    if value.trim().is_empty() {
        return Err(CoreError::InvalidInput(format!("{field} must not be empty")));
    }
    if value.contains(ROUTE_VALUE_SEPARATOR) {
        return Err(CoreError::InvalidInput(format!(
            "{field} must not contain '{ROUTE_VALUE_SEPARATOR}'"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::resource_node)]
pub struct NewResourceNode<'a> {
    pub label: &'a str,
    pub resource_key: &'a str,
    pub action: &'a str,
    pub parent_id: Option<i32>,
    pub view: Option<&'a str>,
    pub data: Option<&'a str>,
    pub level: Option<i16>,
    pub route_path: Option<&'a str>,
    pub route_method: Option<&'a str>,
    pub created_by: Option<uuid::Uuid>,
    pub updated_by: Option<uuid::Uuid>,
}

impl<'a> NewResourceNode<'a> {
    #[must_use]
    pub fn from_input(input: &'a ResourceNodeInput, level: i16, actor: Option<uuid::Uuid>) -> Self {
        Self {
            label: &input.label,
            resource_key: &input.resource_key,
            action: &input.action,
            parent_id: input.parent_id,
            view: input.view.as_deref(),
            data: input.data.as_deref(),
            level: Some(level),
            route_path: input.route_path.as_deref(),
            route_method: input.route_method.as_deref(),
            created_by: actor,
            updated_by: actor,
        }
    }
}

/// Full-row update; `None` clears the column.
#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = schema::resource_node)]
#[diesel(treat_none_as_null = true)]
pub struct ResourceNodeUpdate<'a> {
    pub label: &'a str,
    pub resource_key: &'a str,
    pub action: &'a str,
    pub parent_id: Option<i32>,
    pub view: Option<&'a str>,
    pub data: Option<&'a str>,
    pub route_path: Option<&'a str>,
    pub route_method: Option<&'a str>,
    pub updated_by: Option<uuid::Uuid>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl<'a> ResourceNodeUpdate<'a> {
    #[must_use]
    pub fn from_input(input: &'a ResourceNodeInput, actor: Option<uuid::Uuid>) -> Self {
        Self {
            label: &input.label,
            resource_key: &input.resource_key,
            action: &input.action,
            parent_id: input.parent_id,
            view: input.view.as_deref(),
            data: input.data.as_deref(),
            route_path: input.route_path.as_deref(),
            route_method: input.route_method.as_deref(),
            updated_by: actor,
            updated_at: chrono::Utc::now(),
        }
    }
}

/// ## Summary
/// Expands the requested ids with every live descendant. Unknown and deleted
/// ids are dropped. The result is sorted and free of duplicates; cyclic parent
/// links terminate because each id is visited once.
#[must_use]
pub fn expand_with_descendants(nodes: &[ResourceNode], ids: &[i32]) -> Vec<i32> {
    let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
    let mut live: HashSet<i32> = HashSet::with_capacity(nodes.len());
    for node in nodes.iter().filter(|n| !n.is_deleted()) {
        live.insert(node.id);
        if let Some(parent) = node.parent_id {
            children.entry(parent).or_default().push(node.id);
        }
    }

    let mut seen: HashSet<i32> = HashSet::new();
    let mut stack: Vec<i32> = ids.iter().copied().filter(|id| live.contains(id)).collect();
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        if let Some(kids) = children.get(&id) {
            stack.extend(kids.iter().copied().filter(|kid| !seen.contains(kid)));
        }
    }

    let mut expanded: Vec<i32> = seen.into_iter().collect();
    expanded.sort_unstable();
    expanded
}

/// Returns true if re-parenting `id` under `new_parent` would close a loop.
#[must_use]
pub fn would_create_cycle(nodes: &[ResourceNode], id: i32, new_parent: Option<i32>) -> bool {
    let Some(start) = new_parent else {
        return false;
    };
    let parents: HashMap<i32, Option<i32>> = nodes.iter().map(|n| (n.id, n.parent_id)).collect();
    let mut seen = HashSet::new();
    let mut cursor = Some(start);
    while let Some(current) = cursor {
        if current == id {
            return true;
        }
        if !seen.insert(current) {
            // Pre-existing loop that does not pass through `id`.
            return false;
        }
        cursor = parents.get(&current).copied().flatten();
    }
    false
}

/// Materialized path of a node: its ancestors' ids and its own, dot-joined.
#[must_use]
pub fn child_path(parent_path: Option<&str>, id: i32) -> String {
    match parent_path {
        Some(prefix) if !prefix.is_empty() => format!("{prefix}.{id}"),
        _ => id.to_string(),
    }
}

/// Nesting level below the given parent; roots sit at level 1.
#[must_use]
pub fn child_level(parent_level: Option<i16>) -> i16 {
    parent_level.map_or(1, |level| level.saturating_add(1))
}

/// ## Summary
/// Recomputes `(id, level, path)` for `root_id` and its subtree, taking the
/// parent's stored lineage as the starting point. Used after re-parenting.
#[must_use]
pub fn subtree_lineage(nodes: &[ResourceNode], root_id: i32) -> Vec<(i32, i16, String)> {
    let by_id: HashMap<i32, &ResourceNode> = nodes.iter().map(|n| (n.id, n)).collect();
    let Some(root) = by_id.get(&root_id) else {
        return Vec::new();
    };
    let parent = root.parent_id.and_then(|p| by_id.get(&p));
    let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
    for node in nodes {
        if let Some(parent_id) = node.parent_id {
            children.entry(parent_id).or_default().push(node.id);
        }
    }

    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut stack = vec![(
        root_id,
        child_level(parent.and_then(|p| p.level)),
        child_path(parent.and_then(|p| p.path.as_deref()), root_id),
    )];
    while let Some((id, level, path)) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        for kid in children.get(&id).into_iter().flatten() {
            stack.push((*kid, child_level(Some(level)), child_path(Some(&path), *kid)));
        }
        out.push((id, level, path));
    }
    out
}


#[cfg(test)]
mod tests {
    use super::fixtures::node;
    use super::*;

    fn input(key: &str, action: &str) -> ResourceNodeInput {
        ResourceNodeInput {
            label: "Approve".into(),
            resource_key: key.into(),
            action: action.into(),
            parent_id: None,
            view: Some("data".into()),
            data: None,
            route_path: None,
            route_method: None,
        }
    }

    #[test]
    fn separator_rejected_in_key_and_action() {
        assert!(input("kehadiran|approve", "update").validate().is_err());
        assert!(input("kehadiran.approve", "up|date").validate().is_err());
        assert!(input("kehadiran.approve", "update").validate().is_ok());
    }

    #[test]
    fn route_requires_both_parts_and_is_normalized() {
        let mut half = input("kehadiran.approve", "update");
        half.route_path = Some("/api/attendance/approve".into());
        assert!(half.validate().is_err());

        let mut full = input("kehadiran.approve", "update");
        full.route_path = Some("/api/attendance/approve/".into());
        full.route_method = Some("put".into());
        let full = full.validate().unwrap();
        assert_eq!(full.route_path.as_deref(), Some("/api/attendance/approve"));
        assert_eq!(full.route_method.as_deref(), Some("PUT"));
    }

    #[test]
    fn expand_includes_descendants_and_skips_deleted() {
        let mut deleted = node(5, Some(2), Some("menu"));
        deleted.deleted_at = Some(chrono::Utc::now());
        let nodes = vec![
            node(1, None, Some("menu")),
            node(2, Some(1), Some("menu")),
            node(3, Some(2), Some("data")),
            node(4, None, Some("menu")),
            deleted,
            node(6, Some(5), Some("data")),
        ];

        assert_eq!(expand_with_descendants(&nodes, &[1]), vec![1, 2, 3]);
        assert_eq!(expand_with_descendants(&nodes, &[4, 99]), vec![4]);
        assert_eq!(expand_with_descendants(&nodes, &[5]), Vec::<i32>::new());
    }

    #[test]
    fn expand_terminates_on_cycles() {
        let nodes = vec![node(1, Some(2), None), node(2, Some(1), None)];
        assert_eq!(expand_with_descendants(&nodes, &[1]), vec![1, 2]);
    }

    #[test]
    fn cycle_detection_on_reparent() {
        let nodes = vec![
            node(1, None, None),
            node(2, Some(1), None),
            node(3, Some(2), None),
        ];
        assert!(would_create_cycle(&nodes, 1, Some(3)));
        assert!(would_create_cycle(&nodes, 2, Some(2)));
        assert!(!would_create_cycle(&nodes, 3, Some(1)));
        assert!(!would_create_cycle(&nodes, 1, None));
    }

    #[test]
    fn lineage_recomputed_for_subtree() {
        let mut root = node(1, None, None);
        root.level = Some(1);
        root.path = Some("1".into());
        let nodes = vec![root, node(4, Some(1), None), node(9, Some(4), None)];

        let mut lineage = subtree_lineage(&nodes, 4);
        lineage.sort_unstable();
        assert_eq!(
            lineage,
            vec![(4, 2, "1.4".to_string()), (9, 3, "1.4.9".to_string())]
        );
    }
}
