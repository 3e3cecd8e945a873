//! Authorization core: resource tree, policy synchronization, enforcement,
//! route resolution and session handling.

pub mod authz;
pub mod cache;
pub mod context;
pub mod error;
pub mod password;
pub mod session;

#[cfg(test)]
pub(crate) mod test_support;
