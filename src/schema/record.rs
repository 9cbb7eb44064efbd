//! Records produced for the target platform.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name of the sync-action marker field.
pub const ACTION_FIELD: &str = "_action";

/// Target type id → records, the output of every sync mode.
pub type SyncOutput = BTreeMap<String, Vec<TargetRecord>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncAction {
  Set,
  Remove,
}

/// How upserts are marked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
  /// Full paginated sync: upserts carry no marker.
  Full,
  /// Change-capture and webhook sync: upserts are marked `SET`.
  Incremental,
}

impl SyncMode {
  pub fn upsert_action(self) -> Option<SyncAction> {
    match self {
      SyncMode::Full => None,
      SyncMode::Incremental => Some(SyncAction::Set),
    }
  }
}

/// One record for the target platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRecord {
  pub id: String,
  #[serde(rename = "_action", default, skip_serializing_if = "Option::is_none")]
  pub action: Option<SyncAction>,
  #[serde(flatten)]
  pub fields: BTreeMap<String, Value>,
}

impl TargetRecord {
  pub fn new(id: impl Into<String>, action: Option<SyncAction>) -> Self {
    Self {
      id: id.into(),
      action,
      fields: BTreeMap::new(),
    }
  }

  /// A removal carries only the id and the marker.
  pub fn removal(id: impl Into<String>) -> Self {
    Self::new(id, Some(SyncAction::Remove))
  }

  pub fn is_removal(&self) -> bool {
    self.action == Some(SyncAction::Remove)
  }

  pub fn set(&mut self, field: impl Into<String>, value: Value) {
    self.fields.insert(field.into(), value);
  }

  pub fn get(&self, field: &str) -> Option<&Value> {
    self.fields.get(field)
  }
}

/// One page of a full sync.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
  pub records: Vec<TargetRecord>,
  /// `true` when the source returned exactly a page worth of records.
  pub has_more: bool,
}
