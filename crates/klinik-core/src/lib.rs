//! Shared configuration, constants and error types for the Klinik RBAC workspace.

pub mod config;
pub mod constants;
pub mod error;
