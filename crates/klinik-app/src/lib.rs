//! Klinik RBAC HTTP service: middleware, administrative API and startup wiring.

pub mod app;
pub mod error;
pub mod middleware;
