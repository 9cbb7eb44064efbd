//! Union types compose several root types into one target type.
//!
//! Each member keeps its own conversion. The union re-maps the member's
//! output onto its own field list and prefixes ids so records from different
//! members never collide.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;

use super::context::SyncContext;
use super::definition::{
  Capability, CdcSync, DeletedIds, SourceBatch, StandardSync, TypeDefinition, TypeKind,
  WebhookSync,
};
use super::field::{FieldDef, TypeSchema};
use super::record::{Page, TargetRecord};
use crate::error::{Result, SyncError};
use crate::source::{ChangeCaptureResponse, SourceQuery};

/// How a union field is filled for one member.
#[derive(Debug, Clone, PartialEq)]
pub enum UnionRule {
  /// Copy a field of the member's converted record.
  Field(String),
  /// Same value for every record of the member.
  Const(Value),
}

pub struct UnionMember {
  pub definition: Arc<dyn TypeDefinition>,
  pub prefix: String,
  rules: Vec<(String, UnionRule)>,
}

impl UnionMember {
  pub fn new(definition: Arc<dyn TypeDefinition>, prefix: &str) -> Self {
    Self {
      definition,
      prefix: prefix.to_string(),
      rules: Vec::new(),
    }
  }

  pub fn map(mut self, field: &str, source_field: &str) -> Self {
    self
      .rules
      .push((field.to_string(), UnionRule::Field(source_field.to_string())));
    self
  }

  pub fn constant(mut self, field: &str, value: Value) -> Self {
    self.rules.push((field.to_string(), UnionRule::Const(value)));
    self
  }

  fn rule(&self, field: &str) -> Option<&UnionRule> {
    self
      .rules
      .iter()
      .find(|(id, _)| id == field)
      .map(|(_, rule)| rule)
  }

  fn target_id(&self, id: &str) -> String {
    format!("{}-{}", self.prefix, id)
  }
}

pub struct UnionType {
  schema: TypeSchema,
  members: Vec<UnionMember>,
}

impl UnionType {
  pub fn new(id: &str, name: &str, fields: Vec<FieldDef>, members: Vec<UnionMember>) -> Result<Self> {
    if members.is_empty() {
      return Err(SyncError::InvalidRegistry(format!(
        "union '{}' has no members",
        id
      )));
    }

    let mut prefixes = BTreeSet::new();
    for member in &members {
      // The prefix must not contain the id separator.
      if member.prefix.is_empty() || member.prefix.contains('-') {
        return Err(SyncError::InvalidRegistry(format!(
          "union '{}' member '{}' has invalid prefix '{}'",
          id,
          member.definition.id(),
          member.prefix
        )));
      }
      if !prefixes.insert(member.prefix.as_str()) {
        return Err(SyncError::InvalidRegistry(format!(
          "union '{}' reuses prefix '{}'",
          id, member.prefix
        )));
      }
      if !matches!(member.definition.kind(), TypeKind::Root { .. }) {
        return Err(SyncError::InvalidRegistry(format!(
          "union '{}' member '{}' is not a root type",
          id,
          member.definition.id()
        )));
      }
      for (field, _) in &member.rules {
        if !fields.iter().any(|f| &f.id == field) {
          return Err(SyncError::InvalidRegistry(format!(
            "union '{}' maps unknown field '{}'",
            id, field
          )));
        }
      }
    }

    Ok(Self {
      schema: TypeSchema {
        id: id.to_string(),
        name: name.to_string(),
        fields,
      },
      members,
    })
  }

  pub fn members(&self) -> &[UnionMember] {
    &self.members
  }

  fn has(&self, capability: Capability) -> bool {
    self
      .members
      .iter()
      .all(|m| m.definition.capabilities().contains(&capability))
  }

  fn remap(&self, member: &UnionMember, record: TargetRecord) -> TargetRecord {
    let id = member.target_id(&record.id);
    if record.is_removal() {
      return TargetRecord::removal(id);
    }

    let mut out = TargetRecord::new(id, record.action);
    for field in &self.schema.fields {
      let value = match member.rule(&field.id) {
        Some(UnionRule::Field(source)) => record.get(source).cloned().unwrap_or(Value::Null),
        Some(UnionRule::Const(value)) => value.clone(),
        None => Value::Null,
      };
      out.set(field.id.clone(), value);
    }
    out
  }

  fn remap_all(&self, member: &UnionMember, records: Vec<TargetRecord>) -> Vec<TargetRecord> {
    records
      .into_iter()
      .map(|r| self.remap(member, r))
      .collect()
  }

  fn unsupported(&self, capability: Capability) -> SyncError {
    SyncError::Unsupported {
      target_type: self.schema.id.clone(),
      capability: capability.to_string(),
    }
  }

  fn standard<'m>(&self, member: &'m UnionMember) -> Result<&'m dyn StandardSync> {
    member
      .definition
      .as_standard()
      .ok_or_else(|| self.unsupported(Capability::Standard))
  }

  fn cdc<'m>(&self, member: &'m UnionMember) -> Result<&'m dyn CdcSync> {
    member
      .definition
      .as_cdc()
      .ok_or_else(|| self.unsupported(Capability::Cdc))
  }

  fn webhook<'m>(&self, member: &'m UnionMember) -> Result<&'m dyn WebhookSync> {
    member
      .definition
      .as_webhook()
      .ok_or_else(|| self.unsupported(Capability::Webhook))
  }

  fn collect<F>(&self, f: F) -> Vec<String>
  where
    F: Fn(&UnionMember) -> Vec<String>,
  {
    let mut seen = BTreeSet::new();
    self
      .members
      .iter()
      .flat_map(f)
      .filter(|e| seen.insert(e.clone()))
      .collect()
  }
}

impl TypeDefinition for UnionType {
  fn schema(&self) -> &TypeSchema {
    &self.schema
  }

  fn kind(&self) -> TypeKind {
    TypeKind::Union
  }

  fn as_standard(&self) -> Option<&dyn StandardSync> {
    self.has(Capability::Standard).then_some(self as &dyn StandardSync)
  }

  fn as_cdc(&self) -> Option<&dyn CdcSync> {
    self.has(Capability::Cdc).then_some(self as &dyn CdcSync)
  }

  fn as_webhook(&self) -> Option<&dyn WebhookSync> {
    self.has(Capability::Webhook).then_some(self as &dyn WebhookSync)
  }

  fn as_union(&self) -> Option<&UnionType> {
    Some(self)
  }

  fn attachment_entities(&self, attachable_field: &str) -> Vec<String> {
    self.collect(|m| match m.rule(attachable_field) {
      Some(UnionRule::Field(source)) => m.definition.attachment_entities(source),
      _ => Vec::new(),
    })
  }
}

impl StandardSync for UnionType {
  fn page_queries(&self, page: u32, page_size: u32) -> Result<Vec<SourceQuery>> {
    let mut queries = Vec::new();
    for member in &self.members {
      queries.extend(self.standard(member)?.page_queries(page, page_size)?);
    }
    Ok(queries)
  }

  fn materialize_batch(
    &self,
    ctx: &SyncContext<'_>,
    batch: &SourceBatch,
    page_size: u32,
  ) -> Result<Page> {
    let mut page = Page::default();
    for member in &self.members {
      let part = self.standard(member)?.materialize_batch(ctx, batch, page_size)?;
      page.has_more |= part.has_more;
      page.records.extend(self.remap_all(member, part.records));
    }
    Ok(page)
  }
}

impl CdcSync for UnionType {
  fn cdc_entities(&self) -> Vec<String> {
    self.collect(|m| m.definition.as_cdc().map(|c| c.cdc_entities()).unwrap_or_default())
  }

  fn materialize_changes(
    &self,
    ctx: &SyncContext<'_>,
    response: &ChangeCaptureResponse,
    page_size: u32,
  ) -> Result<Vec<TargetRecord>> {
    let mut output = Vec::new();
    for member in &self.members {
      let records = self.cdc(member)?.materialize_changes(ctx, response, page_size)?;
      output.extend(self.remap_all(member, records));
    }
    Ok(output)
  }
}

impl WebhookSync for UnionType {
  fn watched_entities(&self) -> Vec<String> {
    self.collect(|m| {
      m.definition
        .as_webhook()
        .map(|w| w.watched_entities())
        .unwrap_or_default()
    })
  }

  fn related_types(&self) -> Vec<String> {
    self.collect(|m| {
      m.definition
        .as_webhook()
        .map(|w| w.related_types())
        .unwrap_or_default()
    })
  }

  fn materialize_updates(
    &self,
    ctx: &SyncContext<'_>,
    batch: &SourceBatch,
  ) -> Result<Vec<TargetRecord>> {
    let mut output = Vec::new();
    for member in &self.members {
      let records = self.webhook(member)?.materialize_updates(ctx, batch)?;
      output.extend(self.remap_all(member, records));
    }
    Ok(output)
  }

  fn materialize_deletions(
    &self,
    ctx: &SyncContext<'_>,
    deleted: &DeletedIds,
  ) -> Result<Vec<TargetRecord>> {
    let mut output = Vec::new();
    for member in &self.members {
      let records = self.webhook(member)?.materialize_deletions(ctx, deleted)?;
      output.extend(self.remap_all(member, records));
    }
    Ok(output)
  }
}
