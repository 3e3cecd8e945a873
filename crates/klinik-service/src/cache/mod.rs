//! Key-value cache backing the route map, session markers and user views.

pub mod kv;

pub use kv::{KvStore, MemoryKv};
