//! Database repositories
//!
//! Repository pattern for database access, separating data access logic
//! from business logic.

pub mod channels;
pub mod credentials;
pub mod mappings;
pub mod providers;
pub mod sessions;
pub mod subscriptions;
