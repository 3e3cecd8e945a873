use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::db::schema::{resource_node, role, role_grant, role_parent};
use crate::model::grant::NewRoleGrant;
use crate::model::resource::ResourceNode;
use crate::model::role::{NewRole, NewRoleParent, Role};

pub async fn list_live(conn: &mut AsyncPgConnection) -> QueryResult<Vec<Role>> {
    role::table
        .filter(role::deleted_at.is_null())
        .order(role::id.asc())
        .select(Role::as_select())
        .load(conn)
        .await
}

pub async fn find_live(conn: &mut AsyncPgConnection, id: i32) -> QueryResult<Role> {
    role::table
        .filter(role::id.eq(id))
        .filter(role::deleted_at.is_null())
        .select(Role::as_select())
        .first(conn)
        .await
}

/// Row-locks the role for the rest of the transaction so revision checks and
/// grant edits of concurrent writers serialize.
pub async fn lock_live(conn: &mut AsyncPgConnection, id: i32) -> QueryResult<Role> {
    role::table
        .filter(role::id.eq(id))
        .filter(role::deleted_at.is_null())
        .select(Role::as_select())
        .for_update()
        .first(conn)
        .await
}

pub async fn insert(conn: &mut AsyncPgConnection, new_role: &NewRole<'_>) -> QueryResult<Role> {
    diesel::insert_into(role::table)
        .values(new_role)
        .returning(Role::as_returning())
        .get_result(conn)
        .await
}

pub async fn rename(
    conn: &mut AsyncPgConnection,
    id: i32,
    name: &str,
    actor: Option<uuid::Uuid>,
) -> QueryResult<Role> {
    diesel::update(role::table.find(id).filter(role::deleted_at.is_null()))
        .set((
            role::name.eq(name),
            role::updated_by.eq(actor),
            role::updated_at.eq(chrono::Utc::now()),
        ))
        .returning(Role::as_returning())
        .get_result(conn)
        .await
}

pub async fn soft_delete(
    conn: &mut AsyncPgConnection,
    id: i32,
    actor: Option<uuid::Uuid>,
) -> QueryResult<Role> {
    let now = chrono::Utc::now();
    diesel::update(role::table.find(id).filter(role::deleted_at.is_null()))
        .set((
            role::deleted_at.eq(Some(now)),
            role::updated_at.eq(now),
            role::updated_by.eq(actor),
            role::policy_revision.eq(role::policy_revision + 1),
        ))
        .returning(Role::as_returning())
        .get_result(conn)
        .await
}

/// Returns the new revision.
pub async fn bump_revision(conn: &mut AsyncPgConnection, id: i32) -> QueryResult<i64> {
    diesel::update(role::table.find(id))
        .set((
            role::policy_revision.eq(role::policy_revision + 1),
            role::updated_at.eq(chrono::Utc::now()),
        ))
        .returning(role::policy_revision)
        .get_result(conn)
        .await
}

/// Every granted node id of the role, including soft-deleted nodes.
pub async fn grant_ids(conn: &mut AsyncPgConnection, role_id: i32) -> QueryResult<Vec<i32>> {
    role_grant::table
        .filter(role_grant::role_id.eq(role_id))
        .select(role_grant::resource_id)
        .order(role_grant::resource_id.asc())
        .load(conn)
        .await
}

pub async fn granted_nodes(
    conn: &mut AsyncPgConnection,
    role_id: i32,
) -> QueryResult<Vec<ResourceNode>> {
    role_grant::table
        .inner_join(resource_node::table)
        .filter(role_grant::role_id.eq(role_id))
        .filter(resource_node::deleted_at.is_null())
        .order(resource_node::id.asc())
        .select(ResourceNode::as_select())
        .load(conn)
        .await
}

pub async fn delete_grants(
    conn: &mut AsyncPgConnection,
    role_id: i32,
    resource_ids: &[i32],
) -> QueryResult<usize> {
    diesel::delete(
        role_grant::table
            .filter(role_grant::role_id.eq(role_id))
            .filter(role_grant::resource_id.eq_any(resource_ids)),
    )
    .execute(conn)
    .await
}

pub async fn insert_grants(
    conn: &mut AsyncPgConnection,
    rows: &[NewRoleGrant],
) -> QueryResult<usize> {
    if rows.is_empty() {
        return Ok(0);
    }
    diesel::insert_into(role_grant::table)
        .values(rows)
        .on_conflict_do_nothing()
        .execute(conn)
        .await
}

pub async fn delete_all_grants(conn: &mut AsyncPgConnection, role_id: i32) -> QueryResult<usize> {
    diesel::delete(role_grant::table.filter(role_grant::role_id.eq(role_id)))
        .execute(conn)
        .await
}

pub async fn roles_granting(
    conn: &mut AsyncPgConnection,
    resource_ids: &[i32],
) -> QueryResult<Vec<i32>> {
    role_grant::table
        .filter(role_grant::resource_id.eq_any(resource_ids))
        .select(role_grant::role_id)
        .distinct()
        .order(role_grant::role_id.asc())
        .load(conn)
        .await
}

/// Live grants of live roles.
pub async fn all_grants(conn: &mut AsyncPgConnection) -> QueryResult<Vec<(i32, ResourceNode)>> {
    role_grant::table
        .inner_join(resource_node::table)
        .inner_join(role::table)
        .filter(resource_node::deleted_at.is_null())
        .filter(role::deleted_at.is_null())
        .order((role_grant::role_id.asc(), resource_node::id.asc()))
        .select((role_grant::role_id, ResourceNode::as_select()))
        .load(conn)
        .await
}

pub async fn resources_for_roles(
    conn: &mut AsyncPgConnection,
    role_ids: &[i32],
) -> QueryResult<Vec<ResourceNode>> {
    let granted = role_grant::table
        .filter(role_grant::role_id.eq_any(role_ids.to_vec()))
        .select(role_grant::resource_id);
    resource_node::table
        .filter(resource_node::id.eq_any(granted))
        .filter(resource_node::deleted_at.is_null())
        .order(resource_node::id.asc())
        .select(ResourceNode::as_select())
        .load(conn)
        .await
}

pub async fn parent_edges(conn: &mut AsyncPgConnection) -> QueryResult<Vec<(i32, i32)>> {
    role_parent::table
        .select((role_parent::role_id, role_parent::parent_role_id))
        .load(conn)
        .await
}

pub async fn replace_parents(
    conn: &mut AsyncPgConnection,
    role_id: i32,
    rows: &[NewRoleParent],
) -> QueryResult<usize> {
    diesel::delete(role_parent::table.filter(role_parent::role_id.eq(role_id)))
        .execute(conn)
        .await?;
    if rows.is_empty() {
        return Ok(0);
    }
    diesel::insert_into(role_parent::table)
        .values(rows)
        .execute(conn)
        .await
}

/// Drops every edge naming the role on either side.
pub async fn delete_parent_edges(conn: &mut AsyncPgConnection, role_id: i32) -> QueryResult<usize> {
    diesel::delete(
        role_parent::table.filter(
            role_parent::role_id
                .eq(role_id)
                .or(role_parent::parent_role_id.eq(role_id)),
        ),
    )
    .execute(conn)
    .await
}
