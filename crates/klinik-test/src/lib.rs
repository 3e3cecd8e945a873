//! Klinik RBAC server - integration test support.
//!
//! Re-exports the workspace crates so integration tests can use `klinik::`
//! style paths without depending on each crate directly.

pub mod component {
    pub use klinik_core::{config, constants};
    pub use klinik_service::{authz, cache, context, error, password, session};

    pub mod db {
        pub use klinik_db::db::*;
        pub use klinik_db::store;
    }

    pub mod model {
        pub use klinik_db::model::*;
    }

    pub mod middleware {
        pub use klinik_app::middleware::*;
    }
}

pub mod app {
    pub use klinik_app::app::*;
    pub use klinik_app::error;
}
