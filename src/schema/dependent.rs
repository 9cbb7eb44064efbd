//! Types whose records only exist inside a parent record.
//!
//! A dependent item cannot be queried or deleted on its own in the source
//! system. Its removal is detected by diffing the child ids produced by the
//! latest fetch of the parent against the ids cached from the previous one.

use std::marker::PhantomData;
use std::sync::Arc;

use tracing::debug;

use super::context::SyncContext;
use super::definition::{
  CdcSync, DeletedIds, SourceBatch, StandardSync, TypeDefinition, TypeKind, WebhookSync,
};
use super::field::{convert_record, Field, TypeSchema};
use super::record::{Page, SyncAction, TargetRecord};
use crate::cache::{IdentitySet, IdentityWrite, ParentKey};
use crate::error::{Result, SyncError};
use crate::source::{ChangeCaptureResponse, RecordStatus, SourceEntity, SourceQuery};

type Extractor<S, C> = Arc<dyn for<'s> Fn(&'s S) -> Vec<&'s C> + Send + Sync>;
type ChildId<S, C> = Arc<dyn Fn(&S, &C) -> String + Send + Sync>;

pub struct DependentType<S: SourceEntity, C: 'static> {
  schema: TypeSchema,
  fields: Vec<Field<S, C>>,
  extract: Extractor<S, C>,
  child_id: ChildId<S, C>,
  _source: PhantomData<fn() -> S>,
}

impl<S: SourceEntity, C: 'static> DependentType<S, C> {
  /// `extract` lists the children of a parent; `child_id` builds the target
  /// id of one child, unique across all parents.
  pub fn new<E, I>(id: &str, name: &str, fields: Vec<Field<S, C>>, extract: E, child_id: I) -> Self
  where
    E: for<'s> Fn(&'s S) -> Vec<&'s C> + Send + Sync + 'static,
    I: Fn(&S, &C) -> String + Send + Sync + 'static,
  {
    let schema = TypeSchema {
      id: id.to_string(),
      name: name.to_string(),
      fields: fields.iter().map(|f| f.def.clone()).collect(),
    };
    Self {
      schema,
      fields,
      extract: Arc::new(extract),
      child_id: Arc::new(child_id),
      _source: PhantomData,
    }
  }

  fn parent_key(id: &str) -> ParentKey {
    ParentKey::new(S::ENTITY, id)
  }

  /// Convert every child of one parent, returning the records and their ids.
  fn convert_children(
    &self,
    parent: &S,
    action: Option<SyncAction>,
  ) -> Result<(Vec<TargetRecord>, IdentitySet)> {
    let mut records = Vec::new();
    let mut ids = IdentitySet::new();
    for child in (self.extract)(parent) {
      let id = (self.child_id)(parent, child);
      ids.insert(id.clone());
      records.push(convert_record(
        &self.schema.id,
        id,
        action,
        &self.fields,
        parent,
        child,
      )?);
    }
    Ok((records, ids))
  }

  /// Removals for every child cached under a parent.
  fn cascade(&self, ctx: &SyncContext<'_>, key: &ParentKey) -> Vec<TargetRecord> {
    ctx
      .identities
      .get(ctx.workspace, key, &self.schema.id)
      .unwrap_or_default()
      .into_iter()
      .map(TargetRecord::removal)
      .collect()
  }

  /// Incremental conversion of re-fetched parents: deleted parents cascade,
  /// live parents are diffed against the cached child ids.
  fn reconcile(
    &self,
    ctx: &SyncContext<'_>,
    parents: &[S],
    output: &mut Vec<TargetRecord>,
    writes: &mut Vec<IdentityWrite>,
  ) -> Result<()> {
    for parent in parents {
      let key = Self::parent_key(parent.id());

      if parent.status() == RecordStatus::Deleted {
        output.extend(self.cascade(ctx, &key));
        writes.push(self.remove(key));
        continue;
      }

      let (records, ids) = self.convert_children(parent, Some(SyncAction::Set))?;
      let cached = ctx
        .identities
        .get(ctx.workspace, &key, &self.schema.id)
        .unwrap_or_default();
      output.extend(
        cached
          .difference(&ids)
          .map(|stale| TargetRecord::removal(stale.as_str())),
      );
      output.extend(records);
      writes.push(IdentityWrite::Replace {
        parent: key,
        target_type: self.schema.id.clone(),
        ids,
      });
    }
    Ok(())
  }

  fn remove(&self, parent: ParentKey) -> IdentityWrite {
    IdentityWrite::Remove {
      parent,
      target_type: self.schema.id.clone(),
    }
  }

  fn extract_parents(batch: &SourceBatch) -> Result<Vec<S>> {
    Ok(
      batch
        .get(S::ENTITY)
        .map(|response| response.extract::<S>())
        .transpose()?
        .unwrap_or_default(),
    )
  }
}

impl<S: SourceEntity, C: 'static> TypeDefinition for DependentType<S, C> {
  fn schema(&self) -> &TypeSchema {
    &self.schema
  }

  fn kind(&self) -> TypeKind {
    TypeKind::Dependent {
      parent_entity: S::ENTITY.to_string(),
    }
  }

  fn as_standard(&self) -> Option<&dyn StandardSync> {
    Some(self)
  }

  fn as_cdc(&self) -> Option<&dyn CdcSync> {
    Some(self)
  }

  fn as_webhook(&self) -> Option<&dyn WebhookSync> {
    Some(self)
  }
}

impl<S: SourceEntity, C: 'static> StandardSync for DependentType<S, C> {
  fn page_queries(&self, page: u32, page_size: u32) -> Result<Vec<SourceQuery>> {
    Ok(vec![SourceQuery::page(S::ENTITY, page, page_size)?])
  }

  fn materialize_batch(
    &self,
    ctx: &SyncContext<'_>,
    batch: &SourceBatch,
    page_size: u32,
  ) -> Result<Page> {
    let parents = Self::extract_parents(batch)?;
    let has_more = parents.len() == page_size as usize;

    let mut records = Vec::new();
    let mut writes = Vec::new();
    for parent in parents
      .iter()
      .filter(|p| p.status() == RecordStatus::Active)
    {
      let (children, ids) = self.convert_children(parent, ctx.upsert_action())?;
      records.extend(children);
      // A parent arrives whole within one page.
      writes.push(IdentityWrite::Replace {
        parent: Self::parent_key(parent.id()),
        target_type: self.schema.id.clone(),
        ids,
      });
    }
    // Only reached when every parent converted.
    ctx.write_identities(writes);

    debug!(
      workspace = ctx.workspace,
      target_type = %self.schema.id,
      parents = parents.len(),
      count = records.len(),
      has_more,
      "materialized dependent batch page"
    );
    Ok(Page { records, has_more })
  }
}

impl<S: SourceEntity, C: 'static> CdcSync for DependentType<S, C> {
  fn cdc_entities(&self) -> Vec<String> {
    vec![S::ENTITY.to_string()]
  }

  fn materialize_changes(
    &self,
    ctx: &SyncContext<'_>,
    response: &ChangeCaptureResponse,
    page_size: u32,
  ) -> Result<Vec<TargetRecord>> {
    let parents = response.extract::<S>()?;
    if parents.len() == page_size as usize {
      return Err(SyncError::ForceFullResync {
        target_type: self.schema.id.clone(),
        count: parents.len(),
      });
    }

    let mut output = Vec::new();
    let mut writes = Vec::new();
    self.reconcile(ctx, &parents, &mut output, &mut writes)?;
    ctx.write_identities(writes);

    debug!(
      workspace = ctx.workspace,
      target_type = %self.schema.id,
      parents = parents.len(),
      count = output.len(),
      "materialized dependent change capture"
    );
    Ok(output)
  }
}

impl<S: SourceEntity, C: 'static> WebhookSync for DependentType<S, C> {
  fn watched_entities(&self) -> Vec<String> {
    vec![S::ENTITY.to_string()]
  }

  fn materialize_updates(
    &self,
    ctx: &SyncContext<'_>,
    batch: &SourceBatch,
  ) -> Result<Vec<TargetRecord>> {
    let parents = Self::extract_parents(batch)?;
    let mut output = Vec::new();
    let mut writes = Vec::new();
    self.reconcile(ctx, &parents, &mut output, &mut writes)?;
    ctx.write_identities(writes);
    Ok(output)
  }

  fn materialize_deletions(
    &self,
    ctx: &SyncContext<'_>,
    deleted: &DeletedIds,
  ) -> Result<Vec<TargetRecord>> {
    let mut output = Vec::new();
    let mut writes = Vec::new();
    for id in deleted.get(S::ENTITY).into_iter().flatten() {
      let key = Self::parent_key(id);
      output.extend(self.cascade(ctx, &key));
      writes.push(self.remove(key));
    }
    ctx.write_identities(writes);
    Ok(output)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::IdentityCache;
  use crate::schema::field::{number, text, ConvertError, FieldKind};
  use crate::schema::record::SyncMode;
  use crate::source::entities::{Bill, TxnLine, ITEM_EXPENSE_LINE};
  use crate::source::QueryResponse;
  use proptest::prelude::*;
  use serde_json::{json, Value};
  use std::collections::BTreeSet;
  use std::time::Duration;

  fn item_lines(bill: &Bill) -> Vec<&TxnLine> {
    bill
      .line
      .iter()
      .filter(|l| l.is_detail(ITEM_EXPENSE_LINE))
      .collect()
  }

  fn line_id(bill: &Bill, line: &TxnLine) -> String {
    format!("{}-{}", bill.id, line.id.as_deref().unwrap_or_default())
  }

  fn bill_item_lines() -> DependentType<Bill, TxnLine> {
    DependentType::new(
      "bill_item_line",
      "Bill Item Lines",
      vec![
        Field::child("description", FieldKind::Text, |_: &Bill, l: &TxnLine| {
          text(l.description.as_deref())
        }),
        Field::try_child("amount", FieldKind::Number, |_: &Bill, l: &TxnLine| {
          match l.amount {
            Some(a) if a < 0.0 => Err(ConvertError(format!("negative amount {}", a))),
            other => Ok(number(other)),
          }
        }),
      ],
      item_lines,
      line_id,
    )
  }

  fn line(id: &str) -> Value {
    json!({
      "Id": id,
      "Amount": 10.0,
      "DetailType": "ItemBasedExpenseLineDetail",
      "ItemBasedExpenseLineDetail": { "ItemRef": { "value": "1" } }
    })
  }

  fn bill(id: &str, lines: &[&str]) -> Value {
    json!({ "Id": id, "Line": lines.iter().map(|l| line(l)).collect::<Vec<_>>() })
  }

  fn page(records: Vec<Value>) -> SourceBatch {
    let mut batch = SourceBatch::new();
    batch.insert("Bill", QueryResponse::with_records("Bill", records));
    batch
  }

  fn changes(records: Vec<Value>) -> ChangeCaptureResponse {
    ChangeCaptureResponse {
      query_responses: vec![QueryResponse::with_records("Bill", records)],
    }
  }

  fn ids(values: &[&str]) -> IdentitySet {
    values.iter().map(|s| s.to_string()).collect()
  }

  fn cached(identities: &IdentityCache, bill: &str) -> Option<IdentitySet> {
    identities.get("realm", &ParentKey::new("Bill", bill), "bill_item_line")
  }

  #[test]
  fn test_full_sync_populates_cache() {
    let identities = IdentityCache::new(Duration::from_secs(60));
    let ctx = SyncContext::new("realm", &identities, SyncMode::Full);

    let page = bill_item_lines()
      .materialize_batch(&ctx, &page(vec![bill("1", &["1", "2"])]), 1)
      .unwrap();

    assert!(page.has_more);
    let out: Vec<_> = page.records.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(out, vec!["1-1", "1-2"]);
    assert_eq!(cached(&identities, "1"), Some(ids(&["1-1", "1-2"])));
  }

  #[test]
  fn test_full_resync_drops_stale_children() {
    let identities = IdentityCache::new(Duration::from_secs(60));
    let lines = bill_item_lines();
    let full = SyncContext::new("realm", &identities, SyncMode::Full);

    lines
      .materialize_batch(&full, &page(vec![bill("1", &["1", "2"])]), 100)
      .unwrap();
    lines
      .materialize_batch(&full, &page(vec![bill("1", &["2"])]), 100)
      .unwrap();
    assert_eq!(cached(&identities, "1"), Some(ids(&["1-2"])));

    let ctx = SyncContext::new("realm", &identities, SyncMode::Incremental);
    let output = lines
      .materialize_changes(&ctx, &changes(vec![bill("1", &["2"])]), 100)
      .unwrap();
    let out: Vec<_> = output.iter().map(|r| (r.id.as_str(), r.action)).collect();
    assert_eq!(out, vec![("1-2", Some(SyncAction::Set))]);
  }

  #[test]
  fn test_change_capture_diffs_against_previous_fetch() {
    let identities = IdentityCache::new(Duration::from_secs(60));
    let lines = bill_item_lines();

    let full = SyncContext::new("realm", &identities, SyncMode::Full);
    lines
      .materialize_batch(&full, &page(vec![bill("1", &["1", "2"])]), 100)
      .unwrap();

    let ctx = SyncContext::new("realm", &identities, SyncMode::Incremental);
    let output = lines
      .materialize_changes(&ctx, &changes(vec![bill("1", &["2", "3"])]), 100)
      .unwrap();

    assert_eq!(output[0], TargetRecord::removal("1-1"));
    let upserts: Vec<_> = output[1..]
      .iter()
      .map(|r| (r.id.as_str(), r.action))
      .collect();
    assert_eq!(
      upserts,
      vec![("1-2", Some(SyncAction::Set)), ("1-3", Some(SyncAction::Set))]
    );
    assert_eq!(cached(&identities, "1"), Some(ids(&["1-2", "1-3"])));
  }

  #[test]
  fn test_deleted_parent_cascades() {
    let identities = IdentityCache::new(Duration::from_secs(60));
    identities.replace(
      "realm",
      &ParentKey::new("Bill", "1"),
      "bill_item_line",
      ids(&["1-1", "1-2"]),
    );
    let ctx = SyncContext::new("realm", &identities, SyncMode::Incremental);

    let output = bill_item_lines()
      .materialize_changes(
        &ctx,
        &changes(vec![json!({ "Id": "1", "status": "Deleted" })]),
        100,
      )
      .unwrap();

    assert_eq!(
      output,
      vec![TargetRecord::removal("1-1"), TargetRecord::removal("1-2")]
    );
    assert_eq!(cached(&identities, "1"), None);
  }

  #[test]
  fn test_webhook_deletion_clears_cached_children() {
    let identities = IdentityCache::new(Duration::from_secs(60));
    identities.replace(
      "realm",
      &ParentKey::new("Bill", "7"),
      "bill_item_line",
      ids(&["7-1"]),
    );
    let ctx = SyncContext::new("realm", &identities, SyncMode::Incremental);
    let mut deleted = DeletedIds::new();
    deleted.insert("Bill".to_string(), BTreeSet::from(["7".to_string(), "8".to_string()]));

    let output = bill_item_lines()
      .materialize_deletions(&ctx, &deleted)
      .unwrap();

    assert_eq!(output, vec![TargetRecord::removal("7-1")]);
    assert!(identities.is_empty());
  }

  #[test]
  fn test_conversion_failure_leaves_cache_untouched() {
    let identities = IdentityCache::new(Duration::from_secs(60));
    identities.replace(
      "realm",
      &ParentKey::new("Bill", "1"),
      "bill_item_line",
      ids(&["1-1"]),
    );
    let ctx = SyncContext::new("realm", &identities, SyncMode::Incremental);
    let mut broken = bill("2", &["1"]);
    broken["Line"][0]["Amount"] = json!(-5.0);

    let err = bill_item_lines()
      .materialize_changes(&ctx, &changes(vec![bill("1", &["2"]), broken]), 100)
      .unwrap_err();

    assert!(matches!(err, SyncError::Conversion { .. }));
    assert_eq!(cached(&identities, "1"), Some(ids(&["1-1"])));
  }

  #[test]
  fn test_truncated_window_leaves_cache_untouched() {
    let identities = IdentityCache::new(Duration::from_secs(60));
    identities.replace(
      "realm",
      &ParentKey::new("Bill", "1"),
      "bill_item_line",
      ids(&["1-1"]),
    );
    let ctx = SyncContext::new("realm", &identities, SyncMode::Incremental);

    let err = bill_item_lines()
      .materialize_changes(&ctx, &changes(vec![bill("1", &["2"])]), 1)
      .unwrap_err();

    assert!(err.requires_full_resync());
    assert_eq!(cached(&identities, "1"), Some(ids(&["1-1"])));
  }

  proptest! {
    #[test]
    fn prop_diff_removes_exactly_the_missing_children(
      before in proptest::collection::btree_set(1u8..20, 0..10),
      after in proptest::collection::btree_set(1u8..20, 0..10),
    ) {
      let identities = IdentityCache::new(Duration::from_secs(60));
      let cached_ids: IdentitySet = before.iter().map(|n| format!("1-{}", n)).collect();
      identities.replace("realm", &ParentKey::new("Bill", "1"), "bill_item_line", cached_ids);
      let ctx = SyncContext::new("realm", &identities, SyncMode::Incremental);

      let names: Vec<String> = after.iter().map(|n| n.to_string()).collect();
      let refs: Vec<&str> = names.iter().map(String::as_str).collect();
      let output = bill_item_lines()
        .materialize_changes(&ctx, &changes(vec![bill("1", &refs)]), 100)
        .unwrap();

      let removed: BTreeSet<u8> = output
        .iter()
        .filter(|r| r.is_removal())
        .map(|r| r.id[2..].parse().unwrap())
        .collect();
      let upserted: BTreeSet<u8> = output
        .iter()
        .filter(|r| !r.is_removal())
        .map(|r| r.id[2..].parse().unwrap())
        .collect();

      prop_assert_eq!(removed, before.difference(&after).copied().collect::<BTreeSet<_>>());
      prop_assert_eq!(&upserted, &after);
      let expected: IdentitySet = after.iter().map(|n| format!("1-{}", n)).collect();
      prop_assert_eq!(cached(&identities, "1"), Some(expected));
    }
  }
}
