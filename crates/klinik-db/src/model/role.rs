use diesel::{pg::Pg, prelude::*};
use serde::Serialize;

use crate::db::schema;

#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = schema::role)]
#[diesel(check_for_backend(Pg))]
pub struct Role {
    pub id: i32,
    pub name: String,
    /// Bumped on every grant sync; callers pass it back for optimistic checks.
    pub policy_revision: i64,
    pub created_by: Option<uuid::Uuid>,
    pub updated_by: Option<uuid::Uuid>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing)]
    pub deleted_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::role)]
pub struct NewRole<'a> {
    pub name: &'a str,
    pub created_by: Option<uuid::Uuid>,
    pub updated_by: Option<uuid::Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Insertable)]
#[diesel(table_name = schema::role_parent)]
pub struct NewRoleParent {
    pub role_id: i32,
    pub parent_role_id: i32,
    pub created_by: Option<uuid::Uuid>,
}
