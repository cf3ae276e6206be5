//! Database module
//!
//! PostgreSQL integration using sqlx with:
//! - Connection pool management
//! - Row types with FromRow
//! - Repository pattern for data access
//! - The `Store` seam the services depend on

#[cfg(test)]
pub mod memory;
pub mod models;
pub mod pool;
pub mod repository;
pub mod store;

// Re-export commonly used items
pub use pool::{create_pool, health_check, pool_stats, run_migrations};
pub use store::{PgStore, Store};
