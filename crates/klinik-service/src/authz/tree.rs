//! Menu and permission forest built from the flat resource catalogue.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use klinik_db::model::resource::ResourceNode;

pub use klinik_db::model::resource::expand_with_descendants;

/// One node of the rendered forest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuNode {
    pub id: i32,
    pub label: String,
    pub resource_key: String,
    pub action: String,
    pub view: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    pub level: Option<i16>,
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<MenuNode>,
}

impl MenuNode {
    fn leaf(node: &ResourceNode, view: &str) -> Self {
        Self {
            id: node.id,
            label: node.label.clone(),
            resource_key: node.resource_key.clone(),
            action: node.action.clone(),
            view: view.to_string(),
            data: node.data.clone(),
            level: node.level,
            path: node.path.clone(),
            children: Vec::new(),
        }
    }

    /// Number of nodes in this subtree, including `self`.
    #[must_use]
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(Self::count).sum::<usize>()
    }
}

/// ## Summary
/// Builds the visible forest from a flat node list.
///
/// - Only live nodes with a view flag are rendered; a hidden node hides its
///   whole subtree.
/// - Siblings keep their order in `nodes`.
/// - A node whose parent is absent from the input becomes a root.
/// - A node reached again through a parent cycle is promoted to a root once,
///   so the build always terminates.
///
/// The walk uses an explicit stack, so depth is bounded only by memory.
#[must_use]
pub fn build_resource_tree(nodes: &[ResourceNode]) -> Vec<MenuNode> {
    let live: Vec<&ResourceNode> = nodes.iter().filter(|n| !n.is_deleted()).collect();
    let index: HashMap<i32, usize> = live.iter().enumerate().map(|(i, n)| (n.id, i)).collect();

    let mut children: Vec<Vec<usize>> = vec![Vec::new(); live.len()];
    let mut roots: Vec<usize> = Vec::new();
    for (i, node) in live.iter().enumerate() {
        match node.parent_id.and_then(|p| index.get(&p)) {
            Some(&parent) if parent != i => children[parent].push(i),
            Some(_) => {
                tracing::warn!(id = node.id, "Resource node is its own parent; rendering as root");
                roots.push(i);
            }
            None => {
                if let Some(parent_id) = node.parent_id {
                    tracing::warn!(
                        id = node.id,
                        parent_id,
                        "Resource node parent missing; rendering as root"
                    );
                }
                roots.push(i);
            }
        }
    }

    let mut visited = vec![false; live.len()];
    let mut forest = Vec::new();
    for &root in &roots {
        if let Some(tree) = render(root, &live, &children, &mut visited) {
            forest.push(tree);
        }
    }

    // Nodes left unvisited sit on a parent cycle with no path from a root.
    for i in 0..live.len() {
        if visited[i] {
            continue;
        }
        tracing::warn!(id = live[i].id, "Resource node is on a parent cycle; rendering as root");
        if let Some(tree) = render(i, &live, &children, &mut visited) {
            forest.push(tree);
        }
    }

    forest
}

/// Renders the subtree under `root`, marking every reached node visited.
fn render(
    root: usize,
    live: &[&ResourceNode],
    children: &[Vec<usize>],
    visited: &mut [bool],
) -> Option<MenuNode> {
    enum Step {
        Enter(usize),
        Exit(usize),
    }

    let mut rendered: HashMap<usize, MenuNode> = HashMap::new();
    let mut stack = vec![Step::Enter(root)];

    while let Some(step) = stack.pop() {
        match step {
            Step::Enter(i) => {
                if visited[i] {
                    continue;
                }
                visited[i] = true;
                let Some(view) = live[i].view.as_deref() else {
                    mark_hidden(i, children, visited);
                    continue;
                };
                rendered.insert(i, MenuNode::leaf(live[i], view));
                stack.push(Step::Exit(i));
                for &child in children[i].iter().rev() {
                    stack.push(Step::Enter(child));
                }
            }
            Step::Exit(i) => {
                let kids: Vec<MenuNode> = children[i]
                    .iter()
                    .filter_map(|child| rendered.remove(child))
                    .collect();
                if let Some(node) = rendered.get_mut(&i) {
                    node.children = kids;
                }
            }
        }
    }

    rendered.remove(&root)
}

fn mark_hidden(root: usize, children: &[Vec<usize>], visited: &mut [bool]) {
    let mut stack: Vec<usize> = children[root].clone();
    while let Some(i) = stack.pop() {
        if visited[i] {
            continue;
        }
        visited[i] = true;
        stack.extend(children[i].iter().copied());
    }
}

/// ## Summary
/// Closes a granted set upward: returns every node of `granted` plus all of
/// their live ancestors in `all`, preserving `all`'s order. Used so a user
/// granted a leaf still sees the menu path leading to it.
#[must_use]
pub fn with_ancestors(all: &[ResourceNode], granted: &[i32]) -> Vec<ResourceNode> {
    let parents: HashMap<i32, Option<i32>> = all
        .iter()
        .filter(|n| !n.is_deleted())
        .map(|n| (n.id, n.parent_id))
        .collect();

    let mut keep: HashSet<i32> = HashSet::new();
    for &id in granted {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if !parents.contains_key(&current) || !keep.insert(current) {
                break;
            }
            cursor = parents.get(&current).copied().flatten();
        }
    }

    all.iter()
        .filter(|n| keep.contains(&n.id))
        .cloned()
        .collect()
}
