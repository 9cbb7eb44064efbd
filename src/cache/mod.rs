//! In-memory caching for sync state.
//!
//! This module provides:
//! - A generic TTL cache with lazy (on read) and periodic (sweep) eviction
//! - The dependent identity cache used to detect removed child records
//! - A background sweeper task
//!
//! Nothing here is durable; every cache can be rebuilt by a full resync.

mod identity;
mod sweeper;
mod traits;
mod ttl;

pub use identity::{
  IdentityCache, IdentityJournal, IdentityKey, IdentitySet, IdentityWrite, ParentKey,
};
pub use sweeper::spawn_sweeper;
pub use traits::Sweep;
pub use ttl::{CacheEntry, TtlCache};
