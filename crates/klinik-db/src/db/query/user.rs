use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::db::schema::app_user;
use crate::model::user::{NewUser, User};

pub async fn insert(conn: &mut AsyncPgConnection, user: &NewUser<'_>) -> QueryResult<User> {
    diesel::insert_into(app_user::table)
        .values(user)
        .returning(User::as_returning())
        .get_result(conn)
        .await
}

pub async fn find_live(conn: &mut AsyncPgConnection, id: uuid::Uuid) -> QueryResult<User> {
    app_user::table
        .filter(app_user::id.eq(id))
        .filter(app_user::deleted_at.is_null())
        .select(User::as_select())
        .first(conn)
        .await
}

pub async fn find_by_username(
    conn: &mut AsyncPgConnection,
    username: &str,
) -> QueryResult<Option<User>> {
    app_user::table
        .filter(app_user::username.eq(username))
        .filter(app_user::deleted_at.is_null())
        .select(User::as_select())
        .first(conn)
        .await
        .optional()
}

pub async fn set_refresh_token(
    conn: &mut AsyncPgConnection,
    id: uuid::Uuid,
    token: Option<&str>,
) -> QueryResult<usize> {
    diesel::update(
        app_user::table
            .filter(app_user::id.eq(id))
            .filter(app_user::deleted_at.is_null()),
    )
    .set((
        app_user::refresh_token.eq(token),
        app_user::updated_at.eq(chrono::Utc::now()),
    ))
    .execute(conn)
    .await
}
