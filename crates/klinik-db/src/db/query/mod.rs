//! Diesel queries grouped by table family. Functions take a bare connection so
//! they compose inside `with_transaction`.

pub mod membership;
pub mod resource;
pub mod role;
pub mod user;
