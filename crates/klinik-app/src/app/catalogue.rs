//! Startup seeding of the administrative API catalogue and the bootstrap
//! superuser account.
//!
//! Every administrative route is guarded by the RBAC middleware, which denies
//! unmapped routes, so the routes of this API must exist as resource nodes
//! before anyone (including the superuser) can call them.

use std::collections::HashSet;

use klinik_core::config::BootstrapConfig;
use klinik_core::constants::SUPERUSER_ROLE_ID;
use klinik_db::model::resource::ResourceNodeInput;
use klinik_db::store::AuthzStore;
use klinik_service::error::ServiceResult;
use klinik_service::password::hash_password;

/// Resource key of the menu node the administrative routes hang under.
pub const ADMIN_MENU_KEY: &str = "admin";

/// `(label, resource key, action, method, path)`
pub const ADMIN_ROUTES: &[(&str, &str, &str, &str, &str)] = &[
    ("Permission tree", "permissions.tree", "read", "GET", "/api/permissions/tree"),
    ("Role menu", "permissions.role", "read", "GET", "/api/permissions/role/{id}"),
    ("List permissions", "permissions", "read", "GET", "/api/permissions"),
    ("Create permission", "permissions", "create", "POST", "/api/permissions"),
    ("Show permission", "permissions", "read", "GET", "/api/permissions/{id}"),
    ("Update permission", "permissions", "update", "PUT", "/api/permissions/{id}"),
    ("Delete permission", "permissions", "delete", "DELETE", "/api/permissions/{id}"),
    ("List roles", "roles", "read", "GET", "/api/users/roles"),
    ("Create role", "roles", "create", "POST", "/api/users/roles"),
    ("Show role", "roles", "read", "GET", "/api/users/roles/{id}"),
    ("Rename role", "roles", "update", "PUT", "/api/users/roles/{id}"),
    ("Delete role", "roles", "delete", "DELETE", "/api/users/roles/{id}"),
    ("Role parents", "roles", "update", "PUT", "/api/users/roles/{id}/parents"),
    ("Role policies", "roles.policies", "update", "PUT", "/api/users/roles/policies/{id}"),
    ("List groups", "groups", "read", "GET", "/api/users/groups"),
    ("Create group", "groups", "create", "POST", "/api/users/groups"),
    ("Show group", "groups", "read", "GET", "/api/users/groups/{id}"),
    ("Rename group", "groups", "update", "PUT", "/api/users/groups/{id}"),
    ("Delete group", "groups", "delete", "DELETE", "/api/users/groups/{id}"),
    ("Group roles", "groups", "update", "PUT", "/api/users/groups/{id}/roles"),
    ("Create user", "users", "create", "POST", "/api/users"),
    ("User roles", "users.roles", "read", "GET", "/api/users/{id}/roles"),
    ("Assign user roles", "users.roles", "update", "PUT", "/api/users/{id}/roles"),
    ("Assign user groups", "users.groups", "update", "PUT", "/api/users/{id}/groups"),
    ("Reload", "admin.reload", "execute", "POST", "/api/admin/reload"),
    ("Verify role", "admin.verify", "read", "GET", "/api/admin/verify/{id}"),
    ("Pending sync", "admin.verify", "read", "GET", "/api/admin/pending"),
];

/// ## Summary
/// Creates the administrative menu node and every missing route node under
/// it. Routes already mapped (by method and path) are left untouched.
/// Returns the number of nodes created.
///
/// ## Errors
/// Store failures.
#[tracing::instrument(skip(store))]
pub async fn ensure_admin_catalogue(store: &dyn AuthzStore) -> ServiceResult<usize> {
    let mut created = 0;
    let nodes = store.list_resources().await?;
    let menu_id = match nodes
        .iter()
        .find(|n| n.resource_key == ADMIN_MENU_KEY && n.route().is_none())
    {
        Some(menu) => menu.id,
        None => {
            let input = ResourceNodeInput {
                label: "Administration".to_string(),
                resource_key: ADMIN_MENU_KEY.to_string(),
                action: "read".to_string(),
                parent_id: None,
                view: Some("menu".to_string()),
                data: None,
                route_path: None,
                route_method: None,
            }
            .validate()?;
            created += 1;
            store.create_resource(&input, None).await?.id
        }
    };

    let mapped: HashSet<(String, String)> = store
        .route_mappings()
        .await?
        .into_iter()
        .map(|m| (m.method, m.path))
        .collect();

    for &(label, resource_key, action, method, path) in ADMIN_ROUTES {
        if mapped.contains(&(method.to_string(), path.to_string())) {
            continue;
        }
        let input = ResourceNodeInput {
            label: label.to_string(),
            resource_key: resource_key.to_string(),
            action: action.to_string(),
            parent_id: Some(menu_id),
            view: None,
            data: None,
            route_path: Some(path.to_string()),
            route_method: Some(method.to_string()),
        }
        .validate()?;
        store.create_resource(&input, None).await?;
        created += 1;
    }

    if created > 0 {
        tracing::info!(created, "Administrative catalogue seeded");
    }
    Ok(created)
}

/// ## Summary
/// Creates the bootstrap account if it does not exist and makes sure it holds
/// the superuser role. Returns the account id.
///
/// ## Errors
/// Store or hashing failures.
#[tracing::instrument(skip(store, config), fields(username = %config.username))]
pub async fn ensure_superuser(
    store: &dyn AuthzStore,
    config: &BootstrapConfig,
) -> ServiceResult<uuid::Uuid> {
    let user = match store.find_user_by_username(&config.username).await? {
        Some(user) => user,
        None => {
            let hash = hash_password(&config.password)?;
            let user = store
                .create_user(&config.username, &config.username, &hash)
                .await?;
            tracing::info!(user_id = %user.id, "Bootstrap superuser created");
            user
        }
    };

    let mut roles = store.user_roles(user.id).await?;
    if !roles.contains(&SUPERUSER_ROLE_ID) {
        roles.push(SUPERUSER_ROLE_ID);
        store.replace_user_roles(user.id, &roles, None).await?;
        tracing::info!(user_id = %user.id, "Superuser role assigned");
    }
    Ok(user.id)
}
