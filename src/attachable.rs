//! Groups file attachments by the record they are attached to.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::source::entities::Attachable;
use crate::source::QueryResponse;

/// Attachment metadata exposed on target records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attachment {
  pub id: String,
  pub file_name: Option<String>,
  pub content_type: Option<String>,
  pub size: Option<u64>,
  pub url: Option<String>,
}

impl From<&Attachable> for Attachment {
  fn from(a: &Attachable) -> Self {
    Self {
      id: a.id.clone(),
      file_name: a.file_name.clone(),
      content_type: a.content_type.clone(),
      size: a.size,
      url: a.temp_download_uri.clone(),
    }
  }
}

/// Entity type → entity id → attachments, built up page by page.
#[derive(Debug, Clone, Default)]
pub struct AttachableIndex {
  by_entity: HashMap<String, BTreeMap<String, Vec<Attachment>>>,
}

impl AttachableIndex {
  pub fn new() -> Self {
    Self::default()
  }

  /// Index one page of attachables, keeping only references to `entity`.
  ///
  /// Returns `true` when the page was full, meaning more attachables may
  /// follow on the next page.
  pub fn merge_page(&mut self, entity: &str, response: &QueryResponse, page_size: u32) -> Result<bool> {
    let attachables: Vec<Attachable> = response.extract()?;
    let full = attachables.len() == page_size as usize;

    let index = self.by_entity.entry(entity.to_string()).or_default();
    for attachable in &attachables {
      for entity_ref in attachable.attachable_ref.iter().filter_map(|r| r.entity_ref.as_ref()) {
        if entity_ref.entity_type != entity {
          continue;
        }
        let attachments = index.entry(entity_ref.value.clone()).or_default();
        // A re-delivered attachable replaces the earlier copy.
        attachments.retain(|a| a.id != attachable.id);
        attachments.push(Attachment::from(attachable));
      }
    }

    Ok(full)
  }

  pub fn get(&self, entity: &str, id: &str) -> &[Attachment] {
    self
      .by_entity
      .get(entity)
      .and_then(|index| index.get(id))
      .map(Vec::as_slice)
      .unwrap_or(&[])
  }

  /// Whether attachments for `entity` were fetched at all. Records of an
  /// unfetched entity keep their attachment field untouched.
  pub fn covers(&self, entity: &str) -> bool {
    self.by_entity.contains_key(entity)
  }

  /// Field value for a record: a JSON array of attachments, possibly empty.
  pub fn field_value(&self, entity: &str, id: &str) -> Value {
    serde_json::to_value(self.get(entity, id)).unwrap_or(Value::Array(Vec::new()))
  }

  pub fn is_empty(&self) -> bool {
    self.by_entity.values().all(BTreeMap::is_empty)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::source::ATTACHABLE_ENTITY;
  use serde_json::json;

  fn page(records: Vec<Value>) -> QueryResponse {
    QueryResponse::with_records(ATTACHABLE_ENTITY, records)
  }

  #[test]
  fn test_groups_by_referenced_record() {
    let mut index = AttachableIndex::new();
    let full = index
      .merge_page(
        "Bill",
        &page(vec![
          json!({
            "Id": "100",
            "FileName": "receipt.pdf",
            "AttachableRef": [
              { "EntityRef": { "type": "Bill", "value": "1" } },
              { "EntityRef": { "type": "Invoice", "value": "1" } }
            ]
          }),
          json!({
            "Id": "101",
            "FileName": "scan.png",
            "AttachableRef": [{ "EntityRef": { "type": "Bill", "value": "2" } }]
          }),
        ]),
        10,
      )
      .unwrap();

    assert!(!full);
    assert_eq!(index.get("Bill", "1")[0].file_name.as_deref(), Some("receipt.pdf"));
    assert_eq!(index.get("Bill", "2")[0].id, "101");
    assert!(index.get("Invoice", "1").is_empty());
    assert!(index.covers("Bill"));
    assert!(!index.covers("Invoice"));
  }

  #[test]
  fn test_merges_across_pages_and_reports_full() {
    let mut index = AttachableIndex::new();
    let attach = |id: &str| {
      json!({ "Id": id, "AttachableRef": [{ "EntityRef": { "type": "Bill", "value": "1" } }] })
    };

    assert!(index
      .merge_page("Bill", &page(vec![attach("1"), attach("2")]), 2)
      .unwrap());
    assert!(!index.merge_page("Bill", &page(vec![attach("3")]), 2).unwrap());

    let ids: Vec<_> = index.get("Bill", "1").iter().map(|a| a.id.as_str()).collect();
    assert_eq!(ids, vec!["1", "2", "3"]);
    assert_eq!(index.field_value("Bill", "1").as_array().unwrap().len(), 3);
  }
}
