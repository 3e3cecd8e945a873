//! Durable store for the RBAC catalogue: resource nodes, roles, groups, users
//! and their grants.

pub mod db;
pub mod error;
pub mod model;
pub mod store;
