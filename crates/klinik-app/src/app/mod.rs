pub mod api;
pub mod catalogue;
