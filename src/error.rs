//! Error types for sync operations.

use thiserror::Error;

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

/// Every failure terminates the current request as a single error.
#[derive(Debug, Error)]
pub enum SyncError {
  #[error("Malformed correlation id '{id}': {reason}")]
  MalformedCorrelationId { id: String, reason: String },

  #[error("Invalid page {page}: pages start at 1")]
  InvalidPage { page: u32 },

  #[error("Duplicate batch item for source entity {entity}")]
  DuplicateBatchItem { entity: String },

  #[error("Batch response item '{correlation_id}' does not match any request")]
  UnexpectedBatchItem { correlation_id: String },

  #[error(
    "Change capture for {target_type} returned {count} records (page limit); force a full resync"
  )]
  ForceFullResync { target_type: String, count: usize },

  #[error("Attachable page for {entity} was not exhausted ({count} records)")]
  TruncatedAttachables { entity: String, count: usize },

  #[error("Source fault for '{correlation_id}': {message}")]
  SourceFault {
    correlation_id: String,
    message: String,
  },

  #[error("Fetch failed: {0}")]
  Fetch(String),

  #[error("Failed to convert field {field} of {target_type} record {record_id}: {reason}")]
  Conversion {
    target_type: String,
    field: String,
    record_id: String,
    reason: String,
  },

  #[error("Failed to decode {entity} records: {source}")]
  Decode {
    entity: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("Unknown target type: {0}")]
  UnknownType(String),

  #[error("Target type {target_type} does not support {capability}")]
  Unsupported {
    target_type: String,
    capability: String,
  },

  #[error("Invalid type registry: {0}")]
  InvalidRegistry(String),

  #[error("Invalid webhook notification: {0}")]
  InvalidNotification(String),

  #[error("Change-capture lookback {0:?} is out of range")]
  LookbackOutOfRange(std::time::Duration),

  #[error("Request deadline exceeded")]
  DeadlineExceeded,

  #[error("Lock poisoned: {0}")]
  LockPoisoned(String),
}

impl SyncError {
  /// Conditions that mean the source and our caches disagree about the
  /// shape of the conversation.
  pub fn is_protocol_violation(&self) -> bool {
    matches!(
      self,
      Self::MalformedCorrelationId { .. }
        | Self::InvalidPage { .. }
        | Self::DuplicateBatchItem { .. }
        | Self::UnexpectedBatchItem { .. }
    )
  }

  /// The caller must drop its incremental state and run a full sync.
  pub fn requires_full_resync(&self) -> bool {
    matches!(self, Self::ForceFullResync { .. })
  }
}
