//! Domain models shared by services and routes

pub mod catalog;
pub mod channel;
pub mod provider;
pub mod session;

pub use catalog::{CachedCatalog, CatalogCategory, CatalogChannel};
pub use channel::{Channel, ChannelMapping, NewChannel, NewMapping};
pub use provider::{Credential, HealthStatus, NewCredential, NewProvider, ProtocolKind, Provider};
pub use session::{ActiveStreamSession, NewSession};
