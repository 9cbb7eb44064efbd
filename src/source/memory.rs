//! Fixture-backed source client.
//!
//! Answers batch and change-capture queries from an in-memory record set.
//! Used by the `qbsync` replay commands and throughout the tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use super::api_types::{
  BatchItemRequest, BatchItemResponse, ChangeCaptureResponse, Fault, FaultError, QueryFilter,
  QueryResponse, SourceQuery,
};
use super::client::SourceClient;
use crate::error::{Result, SyncError};

#[derive(Default)]
pub struct InMemorySource {
  records: RwLock<BTreeMap<String, Vec<Value>>>,
  faults: RwLock<HashMap<String, String>>,
  batch_failure: RwLock<Option<String>>,
  cdc_failure: RwLock<Option<String>>,
  latency: Duration,
  batch_log: Mutex<Vec<BatchItemRequest>>,
  cdc_log: Mutex<Vec<(Vec<String>, DateTime<Utc>)>>,
}

impl InMemorySource {
  pub fn new() -> Self {
    Self::default()
  }

  /// Build from a fixture document: `{ "<Entity>": [records...], ... }`.
  pub fn from_fixtures(fixtures: Value) -> serde_json::Result<Self> {
    let records: BTreeMap<String, Vec<Value>> = serde_json::from_value(fixtures)?;
    Ok(Self {
      records: RwLock::new(records),
      ..Default::default()
    })
  }

  /// Delay every call, e.g. to exercise request deadlines.
  pub fn with_latency(mut self, latency: Duration) -> Self {
    self.latency = latency;
    self
  }

  /// Insert or replace a record (matched by `Id`).
  pub fn upsert(&self, entity: &str, record: Value) {
    let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
    let list = records.entry(entity.to_string()).or_default();
    let id = record_id(&record).map(String::from);
    match list.iter_mut().find(|r| record_id(r) == id.as_deref()) {
      Some(existing) => *existing = record,
      None => list.push(record),
    }
  }

  /// Replace a record with the tombstone the source reports for deletions.
  pub fn delete(&self, entity: &str, id: &str) {
    self.upsert(
      entity,
      json!({ "Id": id, "status": "Deleted", "domain": "QBO" }),
    );
  }

  /// Answer every query for `entity` with a per-item fault.
  pub fn fault_entity(&self, entity: &str, message: &str) {
    self
      .faults
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .insert(entity.to_string(), message.to_string());
  }

  pub fn fail_batch(&self, message: &str) {
    *self.batch_failure.write().unwrap_or_else(|e| e.into_inner()) = Some(message.to_string());
  }

  pub fn fail_change_capture(&self, message: &str) {
    *self.cdc_failure.write().unwrap_or_else(|e| e.into_inner()) = Some(message.to_string());
  }

  /// Every batch item requested so far.
  pub fn batch_requests(&self) -> Vec<BatchItemRequest> {
    self
      .batch_log
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
  }

  /// Entities and window start of every change-capture call so far.
  pub fn change_capture_requests(&self) -> Vec<(Vec<String>, DateTime<Utc>)> {
    self
      .cdc_log
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
  }

  fn run_query(&self, query: &SourceQuery) -> Result<QueryResponse> {
    let records = self
      .records
      .read()
      .map_err(|e| SyncError::LockPoisoned(e.to_string()))?;

    let matched: Vec<Value> = records
      .get(&query.entity)
      .into_iter()
      .flatten()
      .filter(|r| !is_tombstone(r))
      .filter(|r| matches_filter(r, &query.filter))
      .skip(query.start_position.saturating_sub(1) as usize)
      .take(query.max_results as usize)
      .cloned()
      .collect();

    let mut response = QueryResponse::with_records(&query.entity, matched);
    response.start_position = Some(query.start_position);
    response.max_results = Some(query.max_results);
    Ok(response)
  }
}

#[async_trait]
impl SourceClient for InMemorySource {
  async fn batch_query(
    &self,
    _workspace: &str,
    requests: Vec<BatchItemRequest>,
  ) -> Result<Vec<BatchItemResponse>> {
    if !self.latency.is_zero() {
      tokio::time::sleep(self.latency).await;
    }
    self
      .batch_log
      .lock()
      .map_err(|e| SyncError::LockPoisoned(e.to_string()))?
      .extend(requests.iter().cloned());

    if let Some(message) = self
      .batch_failure
      .read()
      .map_err(|e| SyncError::LockPoisoned(e.to_string()))?
      .clone()
    {
      return Err(SyncError::Fetch(message));
    }

    let faults = self
      .faults
      .read()
      .map_err(|e| SyncError::LockPoisoned(e.to_string()))?
      .clone();

    requests
      .into_iter()
      .map(|request| {
        if let Some(message) = faults.get(&request.query.entity) {
          return Ok(BatchItemResponse {
            correlation_id: request.correlation_id,
            query_response: None,
            fault: Some(Fault {
              errors: vec![FaultError {
                message: message.clone(),
                ..Default::default()
              }],
              fault_type: Some("ValidationFault".to_string()),
            }),
          });
        }
        Ok(BatchItemResponse {
          query_response: Some(self.run_query(&request.query)?),
          correlation_id: request.correlation_id,
          fault: None,
        })
      })
      .collect()
  }

  async fn change_capture(
    &self,
    _workspace: &str,
    entities: &[String],
    since: DateTime<Utc>,
  ) -> Result<ChangeCaptureResponse> {
    if !self.latency.is_zero() {
      tokio::time::sleep(self.latency).await;
    }
    self
      .cdc_log
      .lock()
      .map_err(|e| SyncError::LockPoisoned(e.to_string()))?
      .push((entities.to_vec(), since));

    if let Some(message) = self
      .cdc_failure
      .read()
      .map_err(|e| SyncError::LockPoisoned(e.to_string()))?
      .clone()
    {
      return Err(SyncError::Fetch(message));
    }

    let records = self
      .records
      .read()
      .map_err(|e| SyncError::LockPoisoned(e.to_string()))?;

    let query_responses = entities
      .iter()
      .map(|entity| {
        let changed: Vec<Value> = records
          .get(entity)
          .into_iter()
          .flatten()
          .filter(|r| changed_since(r, since))
          .cloned()
          .collect();
        QueryResponse::with_records(entity, changed)
      })
      .collect();

    Ok(ChangeCaptureResponse { query_responses })
  }
}

fn record_id(record: &Value) -> Option<&str> {
  record.get("Id").and_then(Value::as_str)
}

fn is_tombstone(record: &Value) -> bool {
  record
    .get("status")
    .and_then(Value::as_str)
    .is_some_and(|s| s.eq_ignore_ascii_case("deleted"))
}

fn matches_filter(record: &Value, filter: &QueryFilter) -> bool {
  match filter {
    QueryFilter::All => true,
    QueryFilter::Ids(ids) => record_id(record).is_some_and(|id| ids.iter().any(|i| i == id)),
    QueryFilter::AttachedTo { entity, ids } => record
      .get("AttachableRef")
      .and_then(Value::as_array)
      .into_iter()
      .flatten()
      .filter_map(|r| r.get("EntityRef"))
      .any(|entity_ref| {
        entity_ref.get("type").and_then(Value::as_str) == Some(entity.as_str())
          && entity_ref
            .get("value")
            .and_then(Value::as_str)
            .is_some_and(|v| ids.iter().any(|i| i == v))
      }),
  }
}

/// Records without a modification time are always reported as changed.
fn changed_since(record: &Value, since: DateTime<Utc>) -> bool {
  record
    .pointer("/MetaData/LastUpdatedTime")
    .and_then(Value::as_str)
    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
    .map(|updated| updated.with_timezone(&Utc) >= since)
    .unwrap_or(true)
}
