//! The boundary to the source system.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::api_types::{BatchItemRequest, BatchItemResponse, ChangeCaptureResponse};
use crate::error::Result;

/// Network access to the source system.
///
/// Implementations own authentication, rate limiting and retries. Any error
/// returned here is terminal for the request that triggered it.
#[async_trait]
pub trait SourceClient: Send + Sync {
  /// Run several correlated queries in one round trip. Each response item
  /// carries back the correlation id of its request.
  async fn batch_query(
    &self,
    workspace: &str,
    requests: Vec<BatchItemRequest>,
  ) -> Result<Vec<BatchItemResponse>>;

  /// Records of the given entities changed at or after `since`, including
  /// deleted ones.
  async fn change_capture(
    &self,
    workspace: &str,
    entities: &[String],
    since: DateTime<Utc>,
  ) -> Result<ChangeCaptureResponse>;
}
