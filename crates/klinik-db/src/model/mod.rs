pub mod grant;
pub mod group;
pub mod resource;
pub mod role;
pub mod route;
pub mod user;
