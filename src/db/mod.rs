//! Database module for the read-only statistics dataset
//!
//! Provides the SQLite pool used by the schema loader, the query executor
//! and the optional few-shot example source.

pub mod connection;

pub use connection::{init_read_only_pool, DbPool};
