//! Serde types matching the source system's query, batch, and change-capture
//! envelopes.
//!
//! Response envelopes are kept generic (entity name → JSON array) and typed
//! records are pulled out on demand with [`QueryResponse::extract`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::entities::SourceEntity;
use crate::error::{Result, SyncError};

/// Source entity name of file attachments.
pub const ATTACHABLE_ENTITY: &str = "Attachable";

// ============================================================================
// Queries
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryFilter {
  All,
  Ids(Vec<String>),
  /// Attachables referencing any of `ids` of the given entity type.
  AttachedTo { entity: String, ids: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceQuery {
  pub entity: String,
  pub filter: QueryFilter,
  /// 1-based offset of the first record.
  pub start_position: u32,
  pub max_results: u32,
}

/// 1-based offset of the first record on `page`.
fn start_position(page: u32, page_size: u32) -> Result<u32> {
  page
    .checked_sub(1)
    .and_then(|skipped| skipped.checked_mul(page_size))
    .and_then(|offset| offset.checked_add(1))
    .ok_or(SyncError::InvalidPage { page })
}

impl SourceQuery {
  /// One page of every record of `entity`. Pages start at 1.
  pub fn page(entity: &str, page: u32, page_size: u32) -> Result<Self> {
    let start_position = start_position(page, page_size)?;
    Ok(Self {
      entity: entity.to_string(),
      filter: QueryFilter::All,
      start_position,
      max_results: page_size,
    })
  }

  /// Records of `entity` with the given ids, in a single page.
  pub fn by_ids(entity: &str, ids: Vec<String>) -> Self {
    let max_results = ids.len().max(1) as u32;
    Self {
      entity: entity.to_string(),
      filter: QueryFilter::Ids(ids),
      start_position: 1,
      max_results,
    }
  }

  /// One page of attachables referencing the given records.
  pub fn attachables(entity: &str, ids: Vec<String>, page: u32, page_size: u32) -> Result<Self> {
    let start_position = start_position(page, page_size)?;
    Ok(Self {
      entity: ATTACHABLE_ENTITY.to_string(),
      filter: QueryFilter::AttachedTo {
        entity: entity.to_string(),
        ids,
      },
      start_position,
      max_results: page_size,
    })
  }

  /// Render in the source system's query language.
  pub fn to_query_string(&self) -> String {
    let condition = match &self.filter {
      QueryFilter::All => String::new(),
      QueryFilter::Ids(ids) => format!(" WHERE Id IN ({})", quote_list(ids)),
      QueryFilter::AttachedTo { entity, ids } => format!(
        " WHERE AttachableRef.EntityRef.Type = {} AND AttachableRef.EntityRef.value IN ({})",
        quote(entity),
        quote_list(ids)
      ),
    };
    format!(
      "SELECT * FROM {}{} STARTPOSITION {} MAXRESULTS {}",
      self.entity, condition, self.start_position, self.max_results
    )
  }
}

fn quote(value: &str) -> String {
  format!("'{}'", value.replace('\'', "\\'"))
}

fn quote_list(values: &[String]) -> String {
  values
    .iter()
    .map(|v| quote(v))
    .collect::<Vec<_>>()
    .join(", ")
}

// ============================================================================
// Batch endpoint
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItemRequest {
  /// Opaque correlation id echoed back on the matching response item.
  #[serde(rename = "bId")]
  pub correlation_id: String,
  #[serde(rename = "Query")]
  pub query: SourceQuery,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchItemResponse {
  #[serde(rename = "bId")]
  pub correlation_id: String,
  #[serde(rename = "QueryResponse", default, skip_serializing_if = "Option::is_none")]
  pub query_response: Option<QueryResponse>,
  #[serde(rename = "Fault", default, skip_serializing_if = "Option::is_none")]
  pub fault: Option<Fault>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Fault {
  #[serde(rename = "Error", default)]
  pub errors: Vec<FaultError>,
  #[serde(rename = "type", default)]
  pub fault_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FaultError {
  #[serde(rename = "Message", default)]
  pub message: String,
  #[serde(rename = "Detail", default)]
  pub detail: Option<String>,
  #[serde(default)]
  pub code: Option<String>,
}

impl Fault {
  pub fn message(&self) -> String {
    if self.errors.is_empty() {
      return self
        .fault_type
        .clone()
        .unwrap_or_else(|| "unknown fault".to_string());
    }
    self
      .errors
      .iter()
      .map(|e| match &e.detail {
        Some(detail) => format!("{} ({})", e.message, detail),
        None => e.message.clone(),
      })
      .collect::<Vec<_>>()
      .join("; ")
  }
}

// ============================================================================
// Query and change-capture responses
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
  #[serde(rename = "startPosition", default, skip_serializing_if = "Option::is_none")]
  pub start_position: Option<u32>,
  #[serde(rename = "maxResults", default, skip_serializing_if = "Option::is_none")]
  pub max_results: Option<u32>,
  /// Entity name → array of records. Non-array members are ignored.
  #[serde(flatten)]
  pub entities: BTreeMap<String, Value>,
}

impl QueryResponse {
  pub fn with_records(entity: &str, records: Vec<Value>) -> Self {
    let mut entities = BTreeMap::new();
    entities.insert(entity.to_string(), Value::Array(records));
    Self {
      entities,
      ..Default::default()
    }
  }

  pub fn records(&self, entity: &str) -> &[Value] {
    match self.entities.get(entity) {
      Some(Value::Array(records)) => records,
      _ => &[],
    }
  }

  pub fn count(&self, entity: &str) -> usize {
    self.records(entity).len()
  }

  /// Typed records of `S` contained in this response.
  pub fn extract<S: SourceEntity>(&self) -> Result<Vec<S>> {
    decode_records(S::ENTITY, self.records(S::ENTITY).iter())
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeCaptureResponse {
  #[serde(rename = "QueryResponse", default)]
  pub query_responses: Vec<QueryResponse>,
}

impl ChangeCaptureResponse {
  pub fn records(&self, entity: &str) -> impl Iterator<Item = &Value> {
    let entity = entity.to_string();
    self
      .query_responses
      .iter()
      .flat_map(move |r| r.records(&entity).iter())
  }

  pub fn count(&self, entity: &str) -> usize {
    self.records(entity).count()
  }

  pub fn extract<S: SourceEntity>(&self) -> Result<Vec<S>> {
    decode_records(S::ENTITY, self.records(S::ENTITY))
  }
}

fn decode_records<'a, S, I>(entity: &str, records: I) -> Result<Vec<S>>
where
  S: SourceEntity,
  I: Iterator<Item = &'a Value>,
{
  records
    .map(|value| {
      S::deserialize(value).map_err(|source| SyncError::Decode {
        entity: entity.to_string(),
        source,
      })
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::source::entities::Customer;
  use serde_json::json;

  #[test]
  fn test_query_string() {
    let query = SourceQuery::page("Customer", 3, 100).unwrap();
    assert_eq!(
      query.to_query_string(),
      "SELECT * FROM Customer STARTPOSITION 201 MAXRESULTS 100"
    );

    let query = SourceQuery::by_ids("Bill", vec!["1".into(), "O'Brien".into()]);
    assert_eq!(
      query.to_query_string(),
      "SELECT * FROM Bill WHERE Id IN ('1', 'O\\'Brien') STARTPOSITION 1 MAXRESULTS 2"
    );

    let query = SourceQuery::attachables("Invoice", vec!["9".into()], 1, 50).unwrap();
    assert_eq!(
      query.to_query_string(),
      "SELECT * FROM Attachable WHERE AttachableRef.EntityRef.Type = 'Invoice' \
       AND AttachableRef.EntityRef.value IN ('9') STARTPOSITION 1 MAXRESULTS 50"
    );
  }

  #[test]
  fn test_page_zero_rejected() {
    assert!(matches!(
      SourceQuery::page("Customer", 0, 100),
      Err(SyncError::InvalidPage { page: 0 })
    ));
  }

  #[test]
  fn test_page_offset_overflow_rejected() {
    assert!(matches!(
      SourceQuery::page("Customer", u32::MAX, 1000),
      Err(SyncError::InvalidPage { page: u32::MAX })
    ));
    assert!(matches!(
      SourceQuery::attachables("Invoice", vec!["1".to_string()], 5_000_000, 1000),
      Err(SyncError::InvalidPage { page: 5_000_000 })
    ));
    assert_eq!(
      SourceQuery::page("Customer", 3, 100).unwrap().start_position,
      201
    );
  }

  #[test]
  fn test_extract_from_envelope() {
    let response: QueryResponse = serde_json::from_value(json!({
      "Customer": [
        { "Id": "1", "SyncToken": "0", "DisplayName": "Amy's Bird Sanctuary" },
        { "Id": "2", "SyncToken": "3", "DisplayName": "Bill's Windsurf Shop" }
      ],
      "startPosition": 1,
      "maxResults": 2,
      "totalCount": 2
    }))
    .unwrap();

    assert_eq!(response.count("Customer"), 2);
    assert_eq!(response.count("Vendor"), 0);
    let customers: Vec<Customer> = response.extract().unwrap();
    assert_eq!(customers[1].display_name.as_deref(), Some("Bill's Windsurf Shop"));
  }

  #[test]
  fn test_extract_reports_decode_errors() {
    let response = QueryResponse::with_records("Customer", vec![json!({ "Id": 42 })]);
    let err = response.extract::<Customer>().unwrap_err();
    assert!(matches!(err, SyncError::Decode { .. }));
  }

  #[test]
  fn test_change_capture_spans_responses() {
    let response: ChangeCaptureResponse = serde_json::from_value(json!({
      "QueryResponse": [
        { "Customer": [{ "Id": "1" }] },
        { "Item": [{ "Id": "7" }], "Customer": [{ "Id": "2", "status": "Deleted" }] }
      ]
    }))
    .unwrap();

    assert_eq!(response.count("Customer"), 2);
    assert_eq!(response.count("Item"), 1);
  }

  #[test]
  fn test_fault_message() {
    let item: BatchItemResponse = serde_json::from_value(json!({
      "bId": "Bill:1",
      "Fault": {
        "Error": [{ "Message": "Invalid query", "Detail": "unknown column", "code": "4000" }],
        "type": "ValidationFault"
      }
    }))
    .unwrap();

    assert!(item.query_response.is_none());
    assert_eq!(
      item.fault.unwrap().message(),
      "Invalid query (unknown column)"
    );
  }
}
