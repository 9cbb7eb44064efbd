//! Correlation ids for batched queries.
//!
//! A batch carries several queries in one round trip; the only way to route a
//! response item back to its consumer is the id echoed back with it:
//! `"<entity>:<page>"` for records and `"attachable:<entity>:<page>"` for the
//! attachments referencing that entity.

use crate::error::{Result, SyncError};

const ATTACHABLE_PREFIX: &str = "attachable";

/// A decoded correlation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correlation {
  pub entity: String,
  pub page: u32,
  pub attachable: bool,
}

pub fn encode(entity: &str, page: u32) -> String {
  format!("{}:{}", entity, page)
}

pub fn encode_attachable(entity: &str, page: u32) -> String {
  format!("{}:{}:{}", ATTACHABLE_PREFIX, entity, page)
}

pub fn decode(id: &str) -> Result<Correlation> {
  let malformed = |reason: &str| SyncError::MalformedCorrelationId {
    id: id.to_string(),
    reason: reason.to_string(),
  };

  let parts: Vec<&str> = id.split(':').collect();
  let (entity, page, attachable) = match parts.as_slice() {
    [entity, page] => (*entity, *page, false),
    [prefix, entity, page] if *prefix == ATTACHABLE_PREFIX => (*entity, *page, true),
    [_, _, _] => return Err(malformed("unknown prefix")),
    _ => return Err(malformed("expected 2 or 3 parts")),
  };

  if entity.is_empty() {
    return Err(malformed("empty entity"));
  }
  let page = page
    .parse::<u32>()
    .map_err(|_| malformed("page is not a number"))?;

  Ok(Correlation {
    entity: entity.to_string(),
    page,
    attachable,
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_decode_record_id() {
    let decoded = decode(&encode("Bill", 3)).unwrap();
    assert_eq!(
      decoded,
      Correlation {
        entity: "Bill".to_string(),
        page: 3,
        attachable: false,
      }
    );
  }

  #[test]
  fn test_decode_attachable_id() {
    let decoded = decode(&encode_attachable("Invoice", 1)).unwrap();
    assert_eq!(decoded.entity, "Invoice");
    assert!(decoded.attachable);
  }

  #[test]
  fn test_decode_rejects_malformed_ids() {
    for id in ["Bill", "Bill:x", "a:b:c:d", "other:Bill:1", ":1", "Bill:-1", ""] {
      let err = decode(id).unwrap_err();
      assert!(err.is_protocol_violation(), "{} should be rejected", id);
    }
  }
}
