//! HTTP-level integration tests for the Klinik RBAC server.

mod authorization;
mod helpers;
mod session;
