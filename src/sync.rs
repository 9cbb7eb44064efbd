//! Entry points for the three sync modes.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info};

use crate::attachable::AttachableIndex;
use crate::cache::{IdentityCache, IdentityJournal};
use crate::codec::{self, Correlation};
use crate::error::{Result, SyncError};
use crate::schema::{
  Capability, Page, SourceBatch, SyncContext, SyncMode, SyncOutput, TypeDefinition, TypeRegistry,
};
use crate::source::{BatchItemRequest, BatchItemResponse, QueryResponse, SourceClient, SourceQuery};
use crate::webhook::{WebhookChangeEvent, WebhookCorrelator};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
  /// Records per page for full sync, change-capture truncation and attachable
  /// pages.
  pub page_size: u32,
  pub attachable_field: String,
  /// Subtracted from the earliest notification when opening a change-capture
  /// window.
  pub lookback: Duration,
  /// Deadline for the fetch phase of a webhook request.
  pub request_timeout: Option<Duration>,
}

impl Default for EngineSettings {
  fn default() -> Self {
    Self {
      page_size: 1000,
      attachable_field: "attachments".to_string(),
      lookback: Duration::from_secs(60),
      request_timeout: None,
    }
  }
}

pub struct SyncEngine {
  client: Arc<dyn SourceClient>,
  registry: Arc<TypeRegistry>,
  identities: Arc<IdentityCache>,
  settings: EngineSettings,
}

impl SyncEngine {
  pub fn new(
    client: Arc<dyn SourceClient>,
    registry: Arc<TypeRegistry>,
    identities: Arc<IdentityCache>,
    settings: EngineSettings,
  ) -> Self {
    Self {
      client,
      registry,
      identities,
      settings,
    }
  }

  pub fn registry(&self) -> &TypeRegistry {
    &self.registry
  }

  pub fn identities(&self) -> &Arc<IdentityCache> {
    &self.identities
  }

  pub fn settings(&self) -> &EngineSettings {
    &self.settings
  }

  /// Fetch and convert one page of a full sync. Pages start at 1.
  pub async fn full_sync_page(&self, workspace: &str, type_id: &str, page: u32) -> Result<Page> {
    if page == 0 {
      return Err(SyncError::InvalidPage { page });
    }
    let definition = self.registry.resolve(type_id)?;
    let standard = definition
      .as_standard()
      .ok_or_else(|| unsupported(definition.as_ref(), Capability::Standard))?;
    let page_size = self.settings.page_size;

    let requests: Vec<BatchItemRequest> = standard
      .page_queries(page, page_size)?
      .into_iter()
      .map(|query| BatchItemRequest {
        correlation_id: codec::encode(&query.entity, page),
        query,
      })
      .collect();
    let expected = correlation_ids(&requests);

    let mut batch = SourceBatch::new();
    for item in self.client.batch_query(workspace, requests).await? {
      let (correlation, response) = unpack(item, &expected)?;
      if correlation.attachable {
        return Err(SyncError::UnexpectedBatchItem {
          correlation_id: codec::encode_attachable(&correlation.entity, correlation.page),
        });
      }
      if batch.insert(&correlation.entity, response).is_some() {
        return Err(SyncError::DuplicateBatchItem {
          entity: correlation.entity,
        });
      }
    }

    let attachments = self
      .fetch_attachments(
        workspace,
        &batch,
        definition.attachment_entities(&self.settings.attachable_field),
      )
      .await?;

    let journal = IdentityJournal::new();
    let ctx = SyncContext::new(workspace, &self.identities, SyncMode::Full)
      .with_attachments(&self.settings.attachable_field, &attachments)
      .with_journal(&journal);
    let result = standard.materialize_batch(&ctx, &batch, page_size)?;
    journal.commit(&self.identities, workspace);

    info!(
      workspace,
      target_type = type_id,
      page,
      count = result.records.len(),
      has_more = result.has_more,
      "full sync page"
    );
    Ok(result)
  }

  /// Attachables referencing the fetched records, paginated until every
  /// entity returns a short page.
  async fn fetch_attachments(
    &self,
    workspace: &str,
    batch: &SourceBatch,
    entities: Vec<String>,
  ) -> Result<AttachableIndex> {
    let page_size = self.settings.page_size;
    let mut index = AttachableIndex::new();
    let mut pending: Vec<(String, Vec<String>)> = entities
      .into_iter()
      .filter_map(|entity| {
        let ids = record_ids(batch, &entity);
        (!ids.is_empty()).then_some((entity, ids))
      })
      .collect();

    let mut page = 1;
    while !pending.is_empty() {
      let requests = pending
        .iter()
        .map(|(entity, ids)| {
          Ok(BatchItemRequest {
            correlation_id: codec::encode_attachable(entity, page),
            query: SourceQuery::attachables(entity, ids.clone(), page, page_size)?,
          })
        })
        .collect::<Result<Vec<_>>>()?;
      let expected = correlation_ids(&requests);

      let mut full = BTreeSet::new();
      for item in self.client.batch_query(workspace, requests).await? {
        let (correlation, response) = unpack(item, &expected)?;
        if index.merge_page(&correlation.entity, &response, page_size)? {
          full.insert(correlation.entity);
        }
      }
      debug!(workspace, page, more = full.len(), "indexed attachable page");

      pending.retain(|(entity, _)| full.contains(entity));
      page += 1;
    }
    Ok(index)
  }

  /// One change-capture call covering every requested type.
  pub async fn incremental_sync(
    &self,
    workspace: &str,
    type_ids: &[String],
    since: DateTime<Utc>,
  ) -> Result<SyncOutput> {
    let mut definitions = Vec::new();
    let mut entities = BTreeSet::new();
    for id in type_ids {
      let definition = self.registry.resolve(id)?;
      let cdc = definition
        .as_cdc()
        .ok_or_else(|| unsupported(definition.as_ref(), Capability::Cdc))?;
      entities.extend(cdc.cdc_entities());
      definitions.push((definition, cdc));
    }
    let entities: Vec<String> = entities.into_iter().collect();

    let response = self
      .client
      .change_capture(workspace, &entities, since)
      .await?;

    let journal = IdentityJournal::new();
    let ctx = SyncContext::new(workspace, &self.identities, SyncMode::Incremental)
      .with_journal(&journal);
    let mut output = SyncOutput::new();
    for (definition, cdc) in definitions {
      let records = cdc.materialize_changes(&ctx, &response, self.settings.page_size)?;
      output
        .entry(definition.id().to_string())
        .or_default()
        .extend(records);
    }
    journal.commit(&self.identities, workspace);

    info!(
      workspace,
      since = %since,
      types = output.len(),
      records = output.values().map(Vec::len).sum::<usize>(),
      "incremental sync"
    );
    Ok(output)
  }

  pub async fn webhook_transform(
    &self,
    workspace: &str,
    type_ids: &[String],
    events: &[WebhookChangeEvent],
  ) -> Result<SyncOutput> {
    WebhookCorrelator::new(
      self.client.as_ref(),
      &self.registry,
      &self.identities,
      &self.settings,
    )
    .transform(workspace, type_ids, events)
    .await
  }
}

fn unsupported(definition: &dyn TypeDefinition, capability: Capability) -> SyncError {
  SyncError::Unsupported {
    target_type: definition.id().to_string(),
    capability: capability.to_string(),
  }
}

fn correlation_ids(requests: &[BatchItemRequest]) -> BTreeSet<String> {
  requests.iter().map(|r| r.correlation_id.clone()).collect()
}

/// Route a batch item back to its request, surfacing per-item faults.
pub(crate) fn unpack(
  item: BatchItemResponse,
  expected: &BTreeSet<String>,
) -> Result<(Correlation, QueryResponse)> {
  let correlation = codec::decode(&item.correlation_id)?;
  if !expected.contains(&item.correlation_id) {
    return Err(SyncError::UnexpectedBatchItem {
      correlation_id: item.correlation_id,
    });
  }
  if let Some(fault) = item.fault {
    return Err(SyncError::SourceFault {
      correlation_id: item.correlation_id,
      message: fault.message(),
    });
  }
  Ok((correlation, item.query_response.unwrap_or_default()))
}

fn record_ids(batch: &SourceBatch, entity: &str) -> Vec<String> {
  batch
    .get(entity)
    .map(|response| {
      response
        .records(entity)
        .iter()
        .filter_map(|r| r.get("Id").and_then(Value::as_str))
        .map(String::from)
        .collect()
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::ParentKey;
  use crate::schema::{SyncAction, TargetRecord};
  use crate::source::{InMemorySource, QueryFilter};
  use crate::webhook::Operation;
  use chrono::TimeZone;
  use serde_json::json;

  fn bill_line(id: &str, item: &str) -> Value {
    json!({
      "Id": id,
      "Amount": 10.0,
      "DetailType": "ItemBasedExpenseLineDetail",
      "ItemBasedExpenseLineDetail": { "ItemRef": { "value": item } }
    })
  }

  fn engine(source: Arc<InMemorySource>, page_size: u32) -> SyncEngine {
    SyncEngine::new(
      source,
      Arc::new(TypeRegistry::default_catalog().unwrap()),
      Arc::new(IdentityCache::new(Duration::from_secs(3600))),
      EngineSettings {
        page_size,
        ..EngineSettings::default()
      },
    )
  }

  fn types(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
  }

  fn actions(records: &[TargetRecord]) -> Vec<(&str, Option<SyncAction>)> {
    records.iter().map(|r| (r.id.as_str(), r.action)).collect()
  }

  #[tokio::test]
  async fn test_bill_lines_end_to_end() {
    let source = Arc::new(InMemorySource::new());
    source.upsert(
      "Bill",
      json!({ "Id": "1", "Line": [bill_line("1", "11"), bill_line("2", "11")] }),
    );
    let engine = engine(Arc::clone(&source), 100);
    let parent = ParentKey::new("Bill", "1");

    let page = engine
      .full_sync_page("realm", "bill_item_line", 1)
      .await
      .unwrap();
    assert_eq!(actions(&page.records), vec![("1-1", None), ("1-2", None)]);
    assert!(!page.has_more);
    assert_eq!(
      engine.identities().get("realm", &parent, "bill_item_line"),
      Some(["1-1".to_string(), "1-2".to_string()].into())
    );

    source.upsert(
      "Bill",
      json!({ "Id": "1", "Line": [bill_line("2", "11"), bill_line("3", "12")] }),
    );
    let since = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let output = engine
      .incremental_sync("realm", &types(&["bill_item_line"]), since)
      .await
      .unwrap();

    assert_eq!(
      actions(&output["bill_item_line"]),
      vec![
        ("1-1", Some(SyncAction::Remove)),
        ("1-2", Some(SyncAction::Set)),
        ("1-3", Some(SyncAction::Set)),
      ]
    );
    assert_eq!(
      engine.identities().get("realm", &parent, "bill_item_line"),
      Some(["1-2".to_string(), "1-3".to_string()].into())
    );

    source.delete("Bill", "1");
    let output = engine
      .incremental_sync("realm", &types(&["bill_item_line"]), since)
      .await
      .unwrap();
    assert_eq!(
      actions(&output["bill_item_line"]),
      vec![
        ("1-2", Some(SyncAction::Remove)),
        ("1-3", Some(SyncAction::Remove)),
      ]
    );
    assert_eq!(engine.identities().get("realm", &parent, "bill_item_line"), None);
  }

  #[tokio::test]
  async fn test_full_sync_paginates_attachments() {
    let source = Arc::new(
      InMemorySource::from_fixtures(json!({
        "Invoice": [{ "Id": "1" }, { "Id": "2" }],
        "Attachable": [
          { "Id": "a1", "FileName": "a.pdf", "AttachableRef": [{ "EntityRef": { "type": "Invoice", "value": "1" } }] },
          { "Id": "a2", "FileName": "b.pdf", "AttachableRef": [{ "EntityRef": { "type": "Invoice", "value": "1" } }] },
          { "Id": "a3", "FileName": "c.pdf", "AttachableRef": [{ "EntityRef": { "type": "Bill", "value": "1" } }] }
        ]
      }))
      .unwrap(),
    );
    let engine = engine(Arc::clone(&source), 2);

    let page = engine.full_sync_page("realm", "invoice", 1).await.unwrap();

    assert!(page.has_more);
    let files = page.records[0].get("attachments").unwrap().as_array().unwrap();
    assert_eq!(files.len(), 2);
    assert_eq!(page.records[1].get("attachments"), Some(&json!([])));

    let attachable_pages: Vec<_> = source
      .batch_requests()
      .into_iter()
      .filter(|r| matches!(r.query.filter, QueryFilter::AttachedTo { .. }))
      .map(|r| r.correlation_id)
      .collect();
    assert_eq!(attachable_pages, vec!["attachable:Invoice:1", "attachable:Invoice:2"]);
  }

  #[tokio::test]
  async fn test_full_sync_rejects_page_zero_and_unknown_types() {
    let engine = engine(Arc::new(InMemorySource::new()), 10);

    assert!(matches!(
      engine.full_sync_page("realm", "bill", 0).await,
      Err(SyncError::InvalidPage { page: 0 })
    ));
    assert!(matches!(
      engine.full_sync_page("realm", "estimate", 1).await,
      Err(SyncError::UnknownType(_))
    ));
  }

  #[tokio::test]
  async fn test_full_sync_rejects_unreachable_page() {
    let engine = engine(Arc::new(InMemorySource::new()), 1000);

    assert!(matches!(
      engine.full_sync_page("realm", "customer", 5_000_000).await,
      Err(SyncError::InvalidPage { page: 5_000_000 })
    ));
  }

  #[tokio::test]
  async fn test_incremental_requires_change_capture() {
    let engine = engine(Arc::new(InMemorySource::new()), 10);
    let since = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

    let err = engine
      .incremental_sync("realm", &types(&["employee"]), since)
      .await
      .unwrap_err();
    assert!(matches!(err, SyncError::Unsupported { .. }));
  }

  #[tokio::test]
  async fn test_truncated_window_keeps_cache() {
    let source = Arc::new(InMemorySource::new());
    source.upsert("Bill", json!({ "Id": "1", "Line": [bill_line("1", "11")] }));
    source.upsert("Bill", json!({ "Id": "2", "Line": [bill_line("1", "11")] }));
    let engine = engine(Arc::clone(&source), 2);
    engine.full_sync_page("realm", "bill_item_line", 1).await.unwrap();
    let before = engine.identities().len();

    source.upsert("Bill", json!({ "Id": "1", "Line": [] }));
    let since = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let err = engine
      .incremental_sync("realm", &types(&["bill", "bill_item_line"]), since)
      .await
      .unwrap_err();

    assert!(err.requires_full_resync());
    assert_eq!(engine.identities().len(), before);
    assert_eq!(
      engine
        .identities()
        .get("realm", &ParentKey::new("Bill", "1"), "bill_item_line"),
      Some(["1-1".to_string()].into())
    );
  }

  #[tokio::test]
  async fn test_webhook_transform_uses_engine_state() {
    let source = Arc::new(InMemorySource::new());
    source.upsert("Customer", json!({ "Id": "3", "DisplayName": "Cool Cars" }));
    let engine = engine(Arc::clone(&source), 10);
    let at = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();

    let output = engine
      .webhook_transform(
        "realm",
        &types(&["party"]),
        &[
          WebhookChangeEvent::new("Customer", "3", Operation::Update, at),
          WebhookChangeEvent::new("Employee", "8", Operation::Delete, at),
        ],
      )
      .await
      .unwrap();

    let party = &output["party"];
    assert_eq!(
      actions(party),
      vec![
        ("customer-3", Some(SyncAction::Set)),
        ("employee-8", Some(SyncAction::Remove)),
      ]
    );
    assert_eq!(party[0].get("name"), Some(&json!("Cool Cars")));
    assert_eq!(party[0].get("party_type"), Some(&json!("customer")));
  }
}
