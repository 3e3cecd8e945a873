use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::db::schema::resource_node;
use crate::model::resource::{NewResourceNode, ResourceNode, ResourceNodeUpdate};

/// Live (not soft-deleted) nodes.
#[must_use]
pub fn live() -> resource_node::BoxedQuery<'static, diesel::pg::Pg> {
    resource_node::table
        .filter(resource_node::deleted_at.is_null())
        .into_boxed()
}

pub async fn list_live(conn: &mut AsyncPgConnection) -> QueryResult<Vec<ResourceNode>> {
    live()
        .order(resource_node::id.asc())
        .select(ResourceNode::as_select())
        .load(conn)
        .await
}

pub async fn find_live(conn: &mut AsyncPgConnection, id: i32) -> QueryResult<ResourceNode> {
    live()
        .filter(resource_node::id.eq(id))
        .select(ResourceNode::as_select())
        .first(conn)
        .await
}

pub async fn insert(
    conn: &mut AsyncPgConnection,
    node: &NewResourceNode<'_>,
) -> QueryResult<ResourceNode> {
    diesel::insert_into(resource_node::table)
        .values(node)
        .returning(ResourceNode::as_returning())
        .get_result(conn)
        .await
}

pub async fn set_lineage(
    conn: &mut AsyncPgConnection,
    id: i32,
    level: i16,
    path: &str,
) -> QueryResult<usize> {
    diesel::update(resource_node::table.find(id))
        .set((
            resource_node::level.eq(Some(level)),
            resource_node::path.eq(Some(path)),
        ))
        .execute(conn)
        .await
}

pub async fn update(
    conn: &mut AsyncPgConnection,
    id: i32,
    changes: &ResourceNodeUpdate<'_>,
) -> QueryResult<ResourceNode> {
    diesel::update(resource_node::table.find(id))
        .set(changes)
        .returning(ResourceNode::as_returning())
        .get_result(conn)
        .await
}

pub async fn soft_delete(
    conn: &mut AsyncPgConnection,
    ids: &[i32],
    actor: Option<uuid::Uuid>,
) -> QueryResult<usize> {
    let now = chrono::Utc::now();
    diesel::update(resource_node::table.filter(resource_node::id.eq_any(ids)))
        .set((
            resource_node::deleted_at.eq(Some(now)),
            resource_node::updated_at.eq(now),
            resource_node::updated_by.eq(actor),
        ))
        .execute(conn)
        .await
}

/// Live nodes carrying both route columns, optionally limited to one key.
pub async fn routed(
    conn: &mut AsyncPgConnection,
    resource_key: Option<&str>,
) -> QueryResult<Vec<ResourceNode>> {
    let mut query = live()
        .filter(resource_node::route_path.is_not_null())
        .filter(resource_node::route_method.is_not_null());
    if let Some(key) = resource_key {
        query = query.filter(resource_node::resource_key.eq(key.to_string()));
    }
    query
        .order(resource_node::id.asc())
        .select(ResourceNode::as_select())
        .load(conn)
        .await
}
