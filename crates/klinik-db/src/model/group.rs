use diesel::{pg::Pg, prelude::*};
use serde::Serialize;

use crate::db::schema;

/// A named set of users that receives roles as a unit.
#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = schema::principal_group)]
#[diesel(check_for_backend(Pg))]
pub struct Group {
    pub id: i32,
    pub name: String,
    pub created_by: Option<uuid::Uuid>,
    pub updated_by: Option<uuid::Uuid>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing)]
    pub deleted_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::principal_group)]
pub struct NewGroup<'a> {
    pub name: &'a str,
    pub created_by: Option<uuid::Uuid>,
    pub updated_by: Option<uuid::Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Insertable)]
#[diesel(table_name = schema::group_role)]
pub struct NewGroupRole {
    pub group_id: i32,
    pub role_id: i32,
    pub created_by: Option<uuid::Uuid>,
}
