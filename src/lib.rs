//! Mirrors accounting records from a source system into a workspace platform.
//!
//! Three delivery modes share one type framework: full paginated sync,
//! incremental change-capture sync, and webhook-triggered sync. Removals of
//! records nested inside a parent are detected through an in-memory identity
//! cache.

pub mod attachable;
pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod schema;
pub mod source;
pub mod sync;
pub mod webhook;

pub use error::{Result, SyncError};
pub use sync::{EngineSettings, SyncEngine};
