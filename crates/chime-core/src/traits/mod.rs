//! Seams the scheduler consumes. Implementations live in `chime-scheduler`
//! (SQLite store, webhook delivery) or in the embedding application.

pub mod delivery;
pub mod identity;
pub mod store;

pub use delivery::Deliverer;
pub use identity::{IdentityResolver, NoopResolver};
pub use store::TaskStore;
