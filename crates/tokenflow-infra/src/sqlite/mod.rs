//! SQLite storage layer.
//!
//! The runtime repository backed by SQLite with WAL mode and split
//! read/write connection pools.

pub mod pool;
pub mod runtime;

pub use pool::DatabasePool;
pub use runtime::SqliteRuntimeRepository;
