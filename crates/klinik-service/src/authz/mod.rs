//! Authorization flow.
//!
//! ## Module Organization
//!
//! - `tree`: Menu/permission forest built from the flat resource catalogue
//! - `subject`: Engine subject naming for users, roles and groups
//! - `policy`: Policy and grouping tuples, derivation from durable grants, deltas
//! - `engine`: The `PolicyEngine` seam
//! - `casbin`: Casbin-backed engine and enforcer initialization
//! - `sync`: `PolicySynchronizer`, the only writer of engine state
//! - `route_cache`: `(path, method)` to `(resource key, action)` resolution
//! - `service`: Read-side `Authorizer`
//! - `depot`: Typed request context for Salvo handlers

pub mod casbin;
pub mod depot;
pub mod engine;
pub mod policy;
pub mod route_cache;
pub mod service;
pub mod subject;
pub mod sync;
pub mod tree;

pub use engine::{EnforceRequest, PolicyEngine};
pub use policy::{GroupingTuple, PolicyTuple};
pub use route_cache::{RouteCache, RouteTarget};
pub use service::{Authorizer, AuthzResult};
pub use subject::Subject;
pub use sync::PolicySynchronizer;
pub use tree::{MenuNode, build_resource_tree};
