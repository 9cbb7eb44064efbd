//! Type definitions and their capabilities.
//!
//! A definition may implement any subset of the sync capabilities. Callers
//! narrow to the capability they need (`as_standard`, `as_cdc`,
//! `as_webhook`) instead of walking a class hierarchy.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

use super::context::SyncContext;
use super::field::TypeSchema;
use super::record::{Page, TargetRecord};
use super::union::UnionType;
use crate::error::Result;
use crate::source::{ChangeCaptureResponse, QueryResponse, SourceQuery};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
  /// Full paginated sync.
  Standard,
  /// Incremental change-capture sync.
  Cdc,
  /// Webhook-triggered sync.
  Webhook,
  /// Driven by a parent type instead of direct queries.
  Dependent,
  /// Composes several root types.
  Union,
}

impl fmt::Display for Capability {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Capability::Standard => "standard sync",
      Capability::Cdc => "change capture",
      Capability::Webhook => "webhooks",
      Capability::Dependent => "dependent records",
      Capability::Union => "union composition",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
  Root { entity: String },
  Dependent { parent_entity: String },
  Union,
}

/// Fetched query responses keyed by source entity.
#[derive(Debug, Clone, Default)]
pub struct SourceBatch {
  responses: BTreeMap<String, QueryResponse>,
}

impl SourceBatch {
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns the response previously stored for the entity, if any.
  pub fn insert(&mut self, entity: &str, response: QueryResponse) -> Option<QueryResponse> {
    self.responses.insert(entity.to_string(), response)
  }

  pub fn get(&self, entity: &str) -> Option<&QueryResponse> {
    self.responses.get(entity)
  }

  pub fn contains(&self, entity: &str) -> bool {
    self.responses.contains_key(entity)
  }

  pub fn is_empty(&self) -> bool {
    self.responses.is_empty()
  }
}

/// Deleted source ids keyed by source entity.
pub type DeletedIds = BTreeMap<String, BTreeSet<String>>;

pub trait TypeDefinition: Send + Sync {
  fn schema(&self) -> &TypeSchema;

  fn id(&self) -> &str {
    &self.schema().id
  }

  fn kind(&self) -> TypeKind;

  fn as_standard(&self) -> Option<&dyn StandardSync> {
    None
  }

  fn as_cdc(&self) -> Option<&dyn CdcSync> {
    None
  }

  fn as_webhook(&self) -> Option<&dyn WebhookSync> {
    None
  }

  fn as_union(&self) -> Option<&UnionType> {
    None
  }

  /// Source entities whose records fill `attachable_field` on this type.
  fn attachment_entities(&self, attachable_field: &str) -> Vec<String> {
    match self.kind() {
      TypeKind::Root { entity } if self.schema().has_field(attachable_field) => vec![entity],
      _ => Vec::new(),
    }
  }

  fn capabilities(&self) -> BTreeSet<Capability> {
    let mut capabilities = BTreeSet::new();
    if self.as_standard().is_some() {
      capabilities.insert(Capability::Standard);
    }
    if self.as_cdc().is_some() {
      capabilities.insert(Capability::Cdc);
    }
    if self.as_webhook().is_some() {
      capabilities.insert(Capability::Webhook);
    }
    match self.kind() {
      TypeKind::Dependent { .. } => {
        capabilities.insert(Capability::Dependent);
      }
      TypeKind::Union => {
        capabilities.insert(Capability::Union);
      }
      TypeKind::Root { .. } => {}
    }
    capabilities
  }
}

pub trait StandardSync: Send + Sync {
  /// Queries fetching one page of source records.
  fn page_queries(&self, page: u32, page_size: u32) -> Result<Vec<SourceQuery>>;

  /// Convert one fetched page. Upserts follow `ctx.mode`.
  fn materialize_batch(&self, ctx: &SyncContext<'_>, batch: &SourceBatch, page_size: u32)
    -> Result<Page>;
}

pub trait CdcSync: Send + Sync {
  /// Source entities to include in the change-capture query.
  fn cdc_entities(&self) -> Vec<String>;

  /// Convert changed records, diffing dependent items against the identity
  /// cache. Fails with `ForceFullResync` when the window may be truncated.
  fn materialize_changes(
    &self,
    ctx: &SyncContext<'_>,
    response: &ChangeCaptureResponse,
    page_size: u32,
  ) -> Result<Vec<TargetRecord>>;
}

pub trait WebhookSync: Send + Sync {
  /// Source entities whose notifications concern this type.
  fn watched_entities(&self) -> Vec<String>;

  /// Change-capture types to refresh whenever a watched entity changes.
  fn related_types(&self) -> Vec<String> {
    Vec::new()
  }

  /// Convert records re-fetched after create/update notifications.
  fn materialize_updates(&self, ctx: &SyncContext<'_>, batch: &SourceBatch)
    -> Result<Vec<TargetRecord>>;

  /// Removals for records reported deleted.
  fn materialize_deletions(&self, ctx: &SyncContext<'_>, deleted: &DeletedIds)
    -> Result<Vec<TargetRecord>>;
}
