//! Source system model: query envelopes, typed records, and the client seam.

pub mod api_types;
pub mod client;
pub mod entities;
pub mod memory;

pub use api_types::{
  BatchItemRequest, BatchItemResponse, ChangeCaptureResponse, QueryFilter, QueryResponse,
  SourceQuery, ATTACHABLE_ENTITY,
};
pub use client::SourceClient;
pub use entities::{RecordStatus, SourceEntity};
pub use memory::InMemorySource;
