//! Types backed directly by one source entity.

use std::marker::PhantomData;

use tracing::debug;

use super::context::SyncContext;
use super::definition::{
  CdcSync, DeletedIds, SourceBatch, StandardSync, TypeDefinition, TypeKind, WebhookSync,
};
use super::field::{convert_record, Field, TypeSchema};
use super::record::{Page, SyncAction, TargetRecord};
use crate::error::{Result, SyncError};
use crate::source::{ChangeCaptureResponse, RecordStatus, SourceEntity, SourceQuery};

/// A target type mirroring one source entity record for record.
///
/// Standard sync is always available; change capture and webhooks are opted
/// into per type.
pub struct RootType<S: SourceEntity> {
  schema: TypeSchema,
  fields: Vec<Field<S>>,
  cdc: bool,
  webhook: bool,
  related: Vec<String>,
  _source: PhantomData<fn() -> S>,
}

impl<S: SourceEntity> RootType<S> {
  pub fn new(id: &str, name: &str, fields: Vec<Field<S>>) -> Self {
    let schema = TypeSchema {
      id: id.to_string(),
      name: name.to_string(),
      fields: fields.iter().map(|f| f.def.clone()).collect(),
    };
    Self {
      schema,
      fields,
      cdc: false,
      webhook: false,
      related: Vec::new(),
      _source: PhantomData,
    }
  }

  pub fn with_cdc(mut self) -> Self {
    self.cdc = true;
    self
  }

  pub fn with_webhooks(mut self) -> Self {
    self.webhook = true;
    self
  }

  /// Both change capture and webhooks.
  pub fn dual(self) -> Self {
    self.with_cdc().with_webhooks()
  }

  /// Change-capture types whose data moves when this entity changes.
  pub fn with_related(mut self, target_types: &[&str]) -> Self {
    self.related = target_types.iter().map(|t| t.to_string()).collect();
    self
  }

  fn convert(
    &self,
    ctx: &SyncContext<'_>,
    record: &S,
    action: Option<SyncAction>,
  ) -> Result<TargetRecord> {
    if record.status() == RecordStatus::Deleted {
      return Ok(TargetRecord::removal(record.id()));
    }
    let mut target = convert_record(
      &self.schema.id,
      record.id().to_string(),
      action,
      &self.fields,
      record,
      &(),
    )?;
    ctx.attach_files(&self.schema, S::ENTITY, record.id(), &mut target);
    Ok(target)
  }

  fn convert_all(
    &self,
    ctx: &SyncContext<'_>,
    records: &[S],
    action: Option<SyncAction>,
  ) -> Result<Vec<TargetRecord>> {
    records
      .iter()
      .map(|r| self.convert(ctx, r, action))
      .collect()
  }

  fn extract(batch: &SourceBatch) -> Result<Vec<S>> {
    Ok(
      batch
        .get(S::ENTITY)
        .map(|response| response.extract::<S>())
        .transpose()?
        .unwrap_or_default(),
    )
  }
}

impl<S: SourceEntity> TypeDefinition for RootType<S> {
  fn schema(&self) -> &TypeSchema {
    &self.schema
  }

  fn kind(&self) -> TypeKind {
    TypeKind::Root {
      entity: S::ENTITY.to_string(),
    }
  }

  fn as_standard(&self) -> Option<&dyn StandardSync> {
    Some(self)
  }

  fn as_cdc(&self) -> Option<&dyn CdcSync> {
    if self.cdc {
      Some(self)
    } else {
      None
    }
  }

  fn as_webhook(&self) -> Option<&dyn WebhookSync> {
    if self.webhook {
      Some(self)
    } else {
      None
    }
  }
}

impl<S: SourceEntity> StandardSync for RootType<S> {
  fn page_queries(&self, page: u32, page_size: u32) -> Result<Vec<SourceQuery>> {
    Ok(vec![SourceQuery::page(S::ENTITY, page, page_size)?])
  }

  fn materialize_batch(
    &self,
    ctx: &SyncContext<'_>,
    batch: &SourceBatch,
    page_size: u32,
  ) -> Result<Page> {
    let records = Self::extract(batch)?;
    let has_more = records.len() == page_size as usize;
    let records = self.convert_all(ctx, &records, ctx.upsert_action())?;

    debug!(
      workspace = ctx.workspace,
      target_type = %self.schema.id,
      count = records.len(),
      has_more,
      "materialized batch page"
    );
    Ok(Page { records, has_more })
  }
}

impl<S: SourceEntity> CdcSync for RootType<S> {
  fn cdc_entities(&self) -> Vec<String> {
    vec![S::ENTITY.to_string()]
  }

  fn materialize_changes(
    &self,
    ctx: &SyncContext<'_>,
    response: &ChangeCaptureResponse,
    page_size: u32,
  ) -> Result<Vec<TargetRecord>> {
    let records = response.extract::<S>()?;
    if records.len() == page_size as usize {
      return Err(SyncError::ForceFullResync {
        target_type: self.schema.id.clone(),
        count: records.len(),
      });
    }
    let records = self.convert_all(ctx, &records, Some(SyncAction::Set))?;

    debug!(
      workspace = ctx.workspace,
      target_type = %self.schema.id,
      count = records.len(),
      "materialized change capture"
    );
    Ok(records)
  }
}

impl<S: SourceEntity> WebhookSync for RootType<S> {
  fn watched_entities(&self) -> Vec<String> {
    vec![S::ENTITY.to_string()]
  }

  fn related_types(&self) -> Vec<String> {
    self.related.clone()
  }

  fn materialize_updates(
    &self,
    ctx: &SyncContext<'_>,
    batch: &SourceBatch,
  ) -> Result<Vec<TargetRecord>> {
    let records = Self::extract(batch)?;
    self.convert_all(ctx, &records, Some(SyncAction::Set))
  }

  fn materialize_deletions(
    &self,
    _ctx: &SyncContext<'_>,
    deleted: &DeletedIds,
  ) -> Result<Vec<TargetRecord>> {
    Ok(
      deleted
        .get(S::ENTITY)
        .into_iter()
        .flatten()
        .map(TargetRecord::removal)
        .collect(),
    )
  }
}
