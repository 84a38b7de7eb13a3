//! Database layer for flowbridge.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization
//! and embedded SQL migrations. Every table (the pending flow queue, the
//! token→phone mappings and the submission records) is created through
//! versioned migrations managed by this crate.
//!
//! Schema setup is safe to run from any number of processes at once; see
//! [`run_migrations`].

mod migrations;
mod pool;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
