use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::db::schema::{group_role, principal_group, user_group, user_role};
use crate::model::group::{Group, NewGroup, NewGroupRole};
use crate::model::user::{NewUserGroup, NewUserRole};

pub async fn list_groups(conn: &mut AsyncPgConnection) -> QueryResult<Vec<Group>> {
    principal_group::table
        .filter(principal_group::deleted_at.is_null())
        .order(principal_group::id.asc())
        .select(Group::as_select())
        .load(conn)
        .await
}

pub async fn find_group(conn: &mut AsyncPgConnection, id: i32) -> QueryResult<Group> {
    principal_group::table
        .filter(principal_group::id.eq(id))
        .filter(principal_group::deleted_at.is_null())
        .select(Group::as_select())
        .first(conn)
        .await
}

pub async fn insert_group(conn: &mut AsyncPgConnection, group: &NewGroup<'_>) -> QueryResult<Group> {
    diesel::insert_into(principal_group::table)
        .values(group)
        .returning(Group::as_returning())
        .get_result(conn)
        .await
}

pub async fn rename_group(
    conn: &mut AsyncPgConnection,
    id: i32,
    name: &str,
    actor: Option<uuid::Uuid>,
) -> QueryResult<Group> {
    diesel::update(
        principal_group::table
            .find(id)
            .filter(principal_group::deleted_at.is_null()),
    )
    .set((
        principal_group::name.eq(name),
        principal_group::updated_by.eq(actor),
        principal_group::updated_at.eq(chrono::Utc::now()),
    ))
    .returning(Group::as_returning())
    .get_result(conn)
    .await
}

pub async fn soft_delete_group(
    conn: &mut AsyncPgConnection,
    id: i32,
    actor: Option<uuid::Uuid>,
) -> QueryResult<Group> {
    let now = chrono::Utc::now();
    diesel::update(
        principal_group::table
            .find(id)
            .filter(principal_group::deleted_at.is_null()),
    )
    .set((
        principal_group::deleted_at.eq(Some(now)),
        principal_group::updated_at.eq(now),
        principal_group::updated_by.eq(actor),
    ))
    .returning(Group::as_returning())
    .get_result(conn)
    .await
}

/// Drops the group's role grants and memberships.
pub async fn detach_group(conn: &mut AsyncPgConnection, group_id: i32) -> QueryResult<usize> {
    let roles = diesel::delete(group_role::table.filter(group_role::group_id.eq(group_id)))
        .execute(conn)
        .await?;
    let members = diesel::delete(user_group::table.filter(user_group::group_id.eq(group_id)))
        .execute(conn)
        .await?;
    Ok(roles + members)
}

pub async fn replace_group_roles(
    conn: &mut AsyncPgConnection,
    group_id: i32,
    rows: &[NewGroupRole],
) -> QueryResult<usize> {
    diesel::delete(group_role::table.filter(group_role::group_id.eq(group_id)))
        .execute(conn)
        .await?;
    if rows.is_empty() {
        return Ok(0);
    }
    diesel::insert_into(group_role::table)
        .values(rows)
        .execute(conn)
        .await
}

pub async fn replace_user_roles(
    conn: &mut AsyncPgConnection,
    user_id: uuid::Uuid,
    rows: &[NewUserRole],
) -> QueryResult<usize> {
    diesel::delete(user_role::table.filter(user_role::user_id.eq(user_id)))
        .execute(conn)
        .await?;
    if rows.is_empty() {
        return Ok(0);
    }
    diesel::insert_into(user_role::table)
        .values(rows)
        .execute(conn)
        .await
}

pub async fn replace_user_groups(
    conn: &mut AsyncPgConnection,
    user_id: uuid::Uuid,
    rows: &[NewUserGroup],
) -> QueryResult<usize> {
    diesel::delete(user_group::table.filter(user_group::user_id.eq(user_id)))
        .execute(conn)
        .await?;
    if rows.is_empty() {
        return Ok(0);
    }
    diesel::insert_into(user_group::table)
        .values(rows)
        .execute(conn)
        .await
}

pub async fn roles_of_user(
    conn: &mut AsyncPgConnection,
    user_id: uuid::Uuid,
) -> QueryResult<Vec<i32>> {
    user_role::table
        .filter(user_role::user_id.eq(user_id))
        .select(user_role::role_id)
        .order(user_role::role_id.asc())
        .load(conn)
        .await
}

pub async fn groups_of_user(
    conn: &mut AsyncPgConnection,
    user_id: uuid::Uuid,
) -> QueryResult<Vec<i32>> {
    user_group::table
        .filter(user_group::user_id.eq(user_id))
        .select(user_group::group_id)
        .order(user_group::group_id.asc())
        .load(conn)
        .await
}

pub async fn user_role_edges(conn: &mut AsyncPgConnection) -> QueryResult<Vec<(uuid::Uuid, i32)>> {
    user_role::table
        .select((user_role::user_id, user_role::role_id))
        .load(conn)
        .await
}

pub async fn user_group_edges(
    conn: &mut AsyncPgConnection,
) -> QueryResult<Vec<(uuid::Uuid, i32)>> {
    user_group::table
        .select((user_group::user_id, user_group::group_id))
        .load(conn)
        .await
}

pub async fn group_role_edges(conn: &mut AsyncPgConnection) -> QueryResult<Vec<(i32, i32)>> {
    group_role::table
        .select((group_role::group_id, group_role::role_id))
        .load(conn)
        .await
}

/// Drops the role from every user and group.
pub async fn detach_role(conn: &mut AsyncPgConnection, role_id: i32) -> QueryResult<usize> {
    let users = diesel::delete(user_role::table.filter(user_role::role_id.eq(role_id)))
        .execute(conn)
        .await?;
    let groups = diesel::delete(group_role::table.filter(group_role::role_id.eq(role_id)))
        .execute(conn)
        .await?;
    Ok(users + groups)
}
