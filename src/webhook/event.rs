//! Change notifications pushed by the source system.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
  Create,
  Update,
  Delete,
  Merge,
  Void,
  Emailed,
}

impl Operation {
  /// Whether the record no longer exists under its id afterwards.
  pub fn is_removal(self) -> bool {
    matches!(self, Operation::Delete | Operation::Merge)
  }
}

impl FromStr for Operation {
  type Err = SyncError;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "Create" => Ok(Operation::Create),
      "Update" => Ok(Operation::Update),
      "Delete" => Ok(Operation::Delete),
      "Merge" => Ok(Operation::Merge),
      "Void" => Ok(Operation::Void),
      "Emailed" => Ok(Operation::Emailed),
      other => Err(SyncError::InvalidNotification(format!(
        "unknown operation '{}'",
        other
      ))),
    }
  }
}

impl fmt::Display for Operation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Debug::fmt(self, f)
  }
}

/// One changed record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookChangeEvent {
  pub entity: String,
  pub id: String,
  pub operation: Operation,
  pub timestamp: DateTime<Utc>,
}

impl WebhookChangeEvent {
  pub fn new(entity: &str, id: &str, operation: Operation, timestamp: DateTime<Utc>) -> Self {
    Self {
      entity: entity.to_string(),
      id: id.to_string(),
      operation,
      timestamp,
    }
  }
}

// ============================================================================
// Notification envelope
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
  #[serde(default)]
  event_notifications: Vec<Notification>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Notification {
  realm_id: String,
  data_change_event: Option<DataChangeEvent>,
}

#[derive(Debug, Deserialize)]
struct DataChangeEvent {
  #[serde(default)]
  entities: Vec<EntityChange>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntityChange {
  name: String,
  id: String,
  operation: String,
  last_updated: String,
  /// Set on merges: the record that was merged away.
  deleted_id: Option<String>,
}

/// Parse a notification body, keeping the changes of one realm.
///
/// A merge reports the surviving record in `id` and the absorbed one in
/// `deletedId`; it yields a removal for the absorbed record and an update for
/// the survivor.
pub fn parse_notifications(body: &[u8], realm: &str) -> Result<Vec<WebhookChangeEvent>> {
  let envelope: Envelope = serde_json::from_slice(body)
    .map_err(|e| SyncError::InvalidNotification(e.to_string()))?;

  let mut events = Vec::new();
  for notification in envelope.event_notifications {
    if notification.realm_id != realm {
      continue;
    }
    let Some(change_event) = notification.data_change_event else {
      continue;
    };
    for change in change_event.entities {
      let operation: Operation = change.operation.parse()?;
      let timestamp = parse_timestamp(&change.last_updated)?;
      match (operation, change.deleted_id) {
        (Operation::Merge, Some(absorbed)) => {
          events.push(WebhookChangeEvent::new(
            &change.name,
            &absorbed,
            Operation::Merge,
            timestamp,
          ));
          events.push(WebhookChangeEvent::new(
            &change.name,
            &change.id,
            Operation::Update,
            timestamp,
          ));
        }
        _ => events.push(WebhookChangeEvent::new(
          &change.name,
          &change.id,
          operation,
          timestamp,
        )),
      }
    }
  }
  Ok(events)
}

/// RFC 3339, or the source's compact offset form (`-0700`).
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(raw)
    .or_else(|_| DateTime::<FixedOffset>::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z"))
    .map(|t| t.with_timezone(&Utc))
    .map_err(|e| SyncError::InvalidNotification(format!("bad timestamp '{}': {}", raw, e)))
}
