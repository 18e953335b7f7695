//! OAuth credential lifecycle
//!
//! One token pair, one file on disk, one coordinator deciding when to refresh.

pub mod coordinator;
pub mod store;

pub use coordinator::{CoordinatorConfig, CoordinatorStatus, Freshness, TokenCoordinator};
pub use store::{TokenPair, TokenStore};
