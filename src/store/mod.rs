//! Persistence layer — libSQL-backed storage behind the async `Database` trait.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, PruneReport};
