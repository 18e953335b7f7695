//! Caching layer
//!
//! Folder listings live in memory for a short TTL; file contents live on disk
//! under a byte budget.

pub mod content;
pub mod layout;
pub mod listing;

pub use content::{CachedFile, ContentCache, PendingFile};
pub use listing::{normalize_path, ListingCache, ListingSnapshot};
