//! Field schema and converters.
//!
//! A type's fields are a data table: each entry pairs a field definition with
//! a pure function extracting the value from a source record (and, for
//! dependent types, the child item being converted).

use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::{json, Value};

use super::record::{SyncAction, TargetRecord};
use crate::error::{Result, SyncError};
use crate::source::entities::Ref;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
  Text,
  Number,
  Boolean,
  Date,
  Reference,
  /// Filled from the attachable index rather than a converter.
  Attachments,
}

/// Points a field at another target type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Relation {
  pub target_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldDef {
  pub id: String,
  pub name: String,
  pub kind: FieldKind,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub relation: Option<Relation>,
}

impl FieldDef {
  pub fn new(id: &str, kind: FieldKind) -> Self {
    Self {
      id: id.to_string(),
      name: display_name(id),
      kind,
      relation: None,
    }
  }
}

/// The published shape of a target type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeSchema {
  pub id: String,
  pub name: String,
  pub fields: Vec<FieldDef>,
}

impl TypeSchema {
  pub fn field(&self, id: &str) -> Option<&FieldDef> {
    self.fields.iter().find(|f| f.id == id)
  }

  pub fn has_field(&self, id: &str) -> bool {
    self.field(id).is_some()
  }
}

/// A converter rejected its input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ConvertError(pub String);

type Converter<S, C> = Arc<dyn Fn(&S, &C) -> Result<Value, ConvertError> + Send + Sync>;

/// A field definition plus its converter. Root types use `C = ()`.
pub struct Field<S, C = ()> {
  pub def: FieldDef,
  convert: Converter<S, C>,
}

impl<S, C> Clone for Field<S, C> {
  fn clone(&self) -> Self {
    Self {
      def: self.def.clone(),
      convert: Arc::clone(&self.convert),
    }
  }
}

impl<S, C> fmt::Debug for Field<S, C> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Field").field("def", &self.def).finish_non_exhaustive()
  }
}

impl<S: 'static, C: 'static> Field<S, C> {
  /// Infallible converter over the parent record and the child item.
  pub fn child<F>(id: &str, kind: FieldKind, f: F) -> Self
  where
    F: Fn(&S, &C) -> Value + Send + Sync + 'static,
  {
    Self::with_converter(
      id,
      kind,
      Arc::new(move |s: &S, c: &C| Ok::<_, ConvertError>(f(s, c))),
    )
  }

  pub fn try_child<F>(id: &str, kind: FieldKind, f: F) -> Self
  where
    F: Fn(&S, &C) -> Result<Value, ConvertError> + Send + Sync + 'static,
  {
    Self::with_converter(id, kind, Arc::new(f))
  }

  /// Placeholder for the attachment list; the value comes from the
  /// attachable index after conversion.
  pub fn attachments(id: &str) -> Self {
    Self::with_converter(
      id,
      FieldKind::Attachments,
      Arc::new(|_: &S, _: &C| Ok::<_, ConvertError>(Value::Null)),
    )
  }

  fn with_converter(id: &str, kind: FieldKind, convert: Converter<S, C>) -> Self {
    Self {
      def: FieldDef::new(id, kind),
      convert,
    }
  }

  pub fn named(mut self, name: &str) -> Self {
    self.def.name = name.to_string();
    self
  }

  pub fn relates_to(mut self, target_type: &str) -> Self {
    self.def.relation = Some(Relation {
      target_type: target_type.to_string(),
    });
    self
  }

  pub fn convert(&self, source: &S, item: &C) -> Result<Value, ConvertError> {
    (self.convert)(source, item)
  }
}

impl<S: 'static> Field<S, ()> {
  /// Infallible converter over a root record.
  pub fn root<F>(id: &str, kind: FieldKind, f: F) -> Self
  where
    F: Fn(&S) -> Value + Send + Sync + 'static,
  {
    Self::child(id, kind, move |s: &S, _: &()| f(s))
  }

  pub fn try_root<F>(id: &str, kind: FieldKind, f: F) -> Self
  where
    F: Fn(&S) -> Result<Value, ConvertError> + Send + Sync + 'static,
  {
    Self::try_child(id, kind, move |s: &S, _: &()| f(s))
  }
}

/// `display_name` → `Display Name`.
fn display_name(id: &str) -> String {
  id.split('_')
    .filter(|w| !w.is_empty())
    .map(|w| {
      let mut chars = w.chars();
      match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
        None => String::new(),
      }
    })
    .collect::<Vec<_>>()
    .join(" ")
}

/// Run every converter of a field table over one source item.
pub fn convert_record<S, C>(
  target_type: &str,
  id: String,
  action: Option<SyncAction>,
  fields: &[Field<S, C>],
  source: &S,
  item: &C,
) -> Result<TargetRecord>
where
  S: 'static,
  C: 'static,
{
  let mut record = TargetRecord::new(id, action);
  for field in fields {
    if field.def.kind == FieldKind::Attachments {
      continue;
    }
    let value = field
      .convert(source, item)
      .map_err(|e| SyncError::Conversion {
        target_type: target_type.to_string(),
        field: field.def.id.clone(),
        record_id: record.id.clone(),
        reason: e.0,
      })?;
    record.set(field.def.id.clone(), value);
  }
  Ok(record)
}

// ============================================================================
// Value helpers used by the field tables
// ============================================================================

pub fn text(value: Option<&str>) -> Value {
  value.map_or(Value::Null, |v| json!(v))
}

pub fn number(value: Option<f64>) -> Value {
  value.map_or(Value::Null, |v| json!(v))
}

pub fn flag(value: Option<bool>) -> Value {
  value.map_or(Value::Null, Value::Bool)
}

/// The id of a referenced record.
pub fn reference(value: Option<&Ref>) -> Value {
  value.map_or(Value::Null, |r| json!(r.value))
}

/// Validate a `YYYY-MM-DD` date.
pub fn date(value: Option<&str>) -> Result<Value, ConvertError> {
  match value {
    None => Ok(Value::Null),
    Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
      .map(|d| json!(d.format("%Y-%m-%d").to_string()))
      .map_err(|e| ConvertError(format!("invalid date '{}': {}", raw, e))),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct Widget {
    name: Option<String>,
    made: Option<String>,
  }

  fn table() -> Vec<Field<Widget>> {
    vec![
      Field::root("name", FieldKind::Text, |w: &Widget| text(w.name.as_deref())),
      Field::try_root("made_on", FieldKind::Date, |w: &Widget| date(w.made.as_deref())),
      Field::attachments("attachments"),
    ]
  }

  #[test]
  fn test_convert_record() {
    let widget = Widget {
      name: Some("Sprocket".to_string()),
      made: Some("2024-02-29".to_string()),
    };
    let record = convert_record("widget", "1".to_string(), None, &table(), &widget, &()).unwrap();

    assert_eq!(record.get("name"), Some(&json!("Sprocket")));
    assert_eq!(record.get("made_on"), Some(&json!("2024-02-29")));
    assert_eq!(record.get("attachments"), None);
  }

  #[test]
  fn test_conversion_failure_names_field_and_record() {
    let widget = Widget {
      name: None,
      made: Some("2023-02-30".to_string()),
    };
    let err = convert_record("widget", "9".to_string(), None, &table(), &widget, &()).unwrap_err();
    match err {
      SyncError::Conversion {
        target_type,
        field,
        record_id,
        ..
      } => {
        assert_eq!(target_type, "widget");
        assert_eq!(field, "made_on");
        assert_eq!(record_id, "9");
      }
      other => panic!("unexpected error: {other}"),
    }
  }

  #[test]
  fn test_display_names() {
    let field: Field<Widget> = Field::root("due_date", FieldKind::Date, |_| Value::Null);
    assert_eq!(field.def.name, "Due Date");
    let field = field.named("Due").relates_to("calendar");
    assert_eq!(field.def.name, "Due");
    assert_eq!(field.def.relation.unwrap().target_type, "calendar");
  }
}
