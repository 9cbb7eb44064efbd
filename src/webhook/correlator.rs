//! Turns a batch of notifications into target records.
//!
//! Two fetches run concurrently: one batch query for the records named in the
//! notifications (plus their attachments) and one change-capture query for the
//! related types those notifications trigger. Both index into one shared
//! state; the first error recorded fails the request.

use std::collections::BTreeSet;
use std::sync::Mutex;

use tracing::{debug, info, warn};

use super::event::WebhookChangeEvent;
use super::group::{WebhookGroup, WebhookPlan};
use crate::attachable::AttachableIndex;
use crate::cache::{IdentityCache, IdentityJournal};
use crate::codec;
use crate::error::{Result, SyncError};
use crate::schema::{Capability, SourceBatch, SyncContext, SyncMode, SyncOutput, TypeRegistry};
use crate::source::{
  BatchItemRequest, BatchItemResponse, ChangeCaptureResponse, SourceClient, SourceQuery,
  ATTACHABLE_ENTITY,
};
use crate::sync::{unpack, EngineSettings};

/// Everything the two fetches produced.
#[derive(Default)]
struct FetchState {
  updated: SourceBatch,
  attachments: AttachableIndex,
  changes: Option<ChangeCaptureResponse>,
  error: Option<SyncError>,
}

impl FetchState {
  fn fail(&mut self, err: SyncError) {
    if self.error.is_none() {
      warn!(error = %err, "webhook fetch failed");
      self.error = Some(err);
    } else {
      debug!(error = %err, "discarding later fetch error");
    }
  }

  fn index(
    &mut self,
    item: BatchItemResponse,
    expected: &BTreeSet<String>,
    page_size: u32,
  ) -> Result<()> {
    let (correlation, response) = unpack(item, expected)?;
    if correlation.attachable {
      let count = response.count(ATTACHABLE_ENTITY);
      if self
        .attachments
        .merge_page(&correlation.entity, &response, page_size)?
      {
        return Err(SyncError::TruncatedAttachables {
          entity: correlation.entity,
          count,
        });
      }
    } else if self
      .updated
      .insert(&correlation.entity, response)
      .is_some()
    {
      return Err(SyncError::DuplicateBatchItem {
        entity: correlation.entity,
      });
    }
    Ok(())
  }
}

pub struct WebhookCorrelator<'a> {
  client: &'a dyn SourceClient,
  registry: &'a TypeRegistry,
  identities: &'a IdentityCache,
  settings: &'a EngineSettings,
}

impl<'a> WebhookCorrelator<'a> {
  pub fn new(
    client: &'a dyn SourceClient,
    registry: &'a TypeRegistry,
    identities: &'a IdentityCache,
    settings: &'a EngineSettings,
  ) -> Self {
    Self {
      client,
      registry,
      identities,
      settings,
    }
  }

  pub async fn transform(
    &self,
    workspace: &str,
    type_ids: &[String],
    events: &[WebhookChangeEvent],
  ) -> Result<SyncOutput> {
    let plan = WebhookPlan::build(self.registry, type_ids, &self.settings.attachable_field)?;
    let group = WebhookGroup::classify(&plan, events);

    let fetched = match self.settings.request_timeout {
      Some(deadline) => tokio::time::timeout(deadline, self.fetch(workspace, &plan, &group))
        .await
        .map_err(|_| SyncError::DeadlineExceeded)??,
      None => self.fetch(workspace, &plan, &group).await?,
    };

    let output = self.process(workspace, &plan, &group, &fetched)?;
    info!(
      workspace,
      events = events.len(),
      types = output.len(),
      records = output.values().map(Vec::len).sum::<usize>(),
      "webhook transform complete"
    );
    Ok(output)
  }

  fn batch_requests(
    &self,
    plan: &WebhookPlan,
    group: &WebhookGroup,
  ) -> Result<Vec<BatchItemRequest>> {
    let mut requests = Vec::new();
    for (entity, ids) in &group.updated {
      let ids: Vec<String> = ids.iter().cloned().collect();
      if plan.needs_attachments(entity) {
        requests.push(BatchItemRequest {
          correlation_id: codec::encode_attachable(entity, 1),
          query: SourceQuery::attachables(entity, ids.clone(), 1, self.settings.page_size)?,
        });
      }
      requests.push(BatchItemRequest {
        correlation_id: codec::encode(entity, 1),
        query: SourceQuery::by_ids(entity, ids),
      });
    }
    Ok(requests)
  }

  fn cdc_entities(&self, group: &WebhookGroup) -> Result<Vec<String>> {
    let mut entities = BTreeSet::new();
    for id in &group.active_related {
      let cdc = self
        .registry
        .resolve(id)?
        .as_cdc()
        .ok_or_else(|| SyncError::Unsupported {
          target_type: id.clone(),
          capability: Capability::Cdc.to_string(),
        })?;
      entities.extend(cdc.cdc_entities());
    }
    Ok(entities.into_iter().collect())
  }

  async fn fetch(
    &self,
    workspace: &str,
    plan: &WebhookPlan,
    group: &WebhookGroup,
  ) -> Result<FetchState> {
    let requests = self.batch_requests(plan, group)?;
    let expected: BTreeSet<String> = requests.iter().map(|r| r.correlation_id.clone()).collect();
    let cdc_entities = self.cdc_entities(group)?;
    let since = group.cdc_since(self.settings.lookback)?;
    let page_size = self.settings.page_size;

    debug!(
      workspace,
      batch_items = requests.len(),
      cdc_entities = ?cdc_entities,
      since = ?since,
      "fetching webhook records"
    );

    let state = Mutex::new(FetchState::default());
    let lock = || state.lock().unwrap_or_else(|e| e.into_inner());

    let batch = async {
      if requests.is_empty() {
        return;
      }
      match self.client.batch_query(workspace, requests).await {
        Ok(items) => {
          let mut state = lock();
          for item in items {
            if let Err(err) = state.index(item, &expected, page_size) {
              state.fail(err);
              break;
            }
          }
        }
        Err(err) => lock().fail(err),
      }
    };

    let changes = async {
      let Some(since) = since else {
        return;
      };
      if cdc_entities.is_empty() {
        return;
      }
      match self
        .client
        .change_capture(workspace, &cdc_entities, since)
        .await
      {
        Ok(response) => lock().changes = Some(response),
        Err(err) => lock().fail(err),
      }
    };

    tokio::join!(batch, changes);

    let mut state = state.into_inner().unwrap_or_else(|e| e.into_inner());
    match state.error.take() {
      Some(err) => Err(err),
      None => Ok(state),
    }
  }

  fn process(
    &self,
    workspace: &str,
    plan: &WebhookPlan,
    group: &WebhookGroup,
    fetched: &FetchState,
  ) -> Result<SyncOutput> {
    let journal = IdentityJournal::new();
    let ctx = SyncContext::new(workspace, self.identities, SyncMode::Incremental)
      .with_attachments(&self.settings.attachable_field, &fetched.attachments)
      .with_journal(&journal);

    let mut output = SyncOutput::new();
    for definition in &plan.targets {
      let webhook = definition
        .as_webhook()
        .ok_or_else(|| SyncError::Unsupported {
          target_type: definition.id().to_string(),
          capability: Capability::Webhook.to_string(),
        })?;
      let mut records = webhook.materialize_updates(&ctx, &fetched.updated)?;
      records.extend(webhook.materialize_deletions(&ctx, &group.deleted)?);
      output
        .entry(definition.id().to_string())
        .or_default()
        .extend(records);
    }

    if let Some(changes) = &fetched.changes {
      for id in &group.active_related {
        let definition = self.registry.resolve(id)?;
        let cdc = definition.as_cdc().ok_or_else(|| SyncError::Unsupported {
          target_type: id.clone(),
          capability: Capability::Cdc.to_string(),
        })?;
        let records = cdc.materialize_changes(&ctx, changes, self.settings.page_size)?;
        // A related type may also be a target; its notified records come first.
        let emitted = output.entry(id.clone()).or_default();
        let seen: BTreeSet<String> = emitted.iter().map(|r| r.id.clone()).collect();
        emitted.extend(records.into_iter().filter(|r| !seen.contains(&r.id)));
      }
    }

    let writes = journal.commit(self.identities, workspace);
    debug!(workspace, writes, "committed identity writes");
    Ok(output)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::ParentKey;
  use crate::schema::{SyncAction, TargetRecord};
  use crate::source::{InMemorySource, QueryResponse};
  use crate::webhook::event::Operation;
  use async_trait::async_trait;
  use chrono::{DateTime, TimeZone, Utc};
  use serde_json::json;
  use std::time::Duration;

  fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, minute, 0).unwrap()
  }

  fn types(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
  }

  fn settings() -> EngineSettings {
    EngineSettings {
      page_size: 10,
      ..EngineSettings::default()
    }
  }

  fn bill_line(id: &str, amount: f64) -> serde_json::Value {
    json!({
      "Id": id,
      "Amount": amount,
      "DetailType": "ItemBasedExpenseLineDetail",
      "ItemBasedExpenseLineDetail": { "ItemRef": { "value": "11" } }
    })
  }

  fn source() -> InMemorySource {
    InMemorySource::from_fixtures(json!({
      "Bill": [
        { "Id": "1", "DocNumber": "B-1", "Line": [bill_line("2", 5.0), bill_line("3", 7.5)] },
        { "Id": "2", "DocNumber": "B-2", "Line": [] }
      ],
      "Item": [
        { "Id": "11", "Name": "Rock Fountain", "MetaData": { "LastUpdatedTime": "2024-03-01T12:04:00Z" } },
        { "Id": "12", "Name": "Sprinkler", "MetaData": { "LastUpdatedTime": "2024-03-01T11:00:00Z" } }
      ],
      "Vendor": [{ "Id": "4", "DisplayName": "Hicks Hardware" }],
      "Attachable": [{
        "Id": "900",
        "FileName": "receipt.pdf",
        "AttachableRef": [{ "EntityRef": { "type": "Bill", "value": "1" } }]
      }]
    }))
    .unwrap()
  }

  fn ids(records: &[TargetRecord]) -> Vec<(&str, Option<SyncAction>)> {
    records.iter().map(|r| (r.id.as_str(), r.action)).collect()
  }

  #[tokio::test]
  async fn test_transform_merges_updates_deletions_and_related() {
    let client = source();
    let registry = TypeRegistry::default_catalog().unwrap();
    let identities = IdentityCache::new(Duration::from_secs(60));
    identities.replace(
      "realm",
      &ParentKey::new("Bill", "1"),
      "bill_item_line",
      ["1-1".to_string(), "1-2".to_string()].into(),
    );
    identities.replace(
      "realm",
      &ParentKey::new("Bill", "5"),
      "bill_item_line",
      ["5-1".to_string()].into(),
    );
    let settings = settings();
    let correlator = WebhookCorrelator::new(&client, &registry, &identities, &settings);

    let events = vec![
      WebhookChangeEvent::new("Bill", "1", Operation::Update, at(5)),
      WebhookChangeEvent::new("Bill", "5", Operation::Delete, at(6)),
      WebhookChangeEvent::new("Vendor", "4", Operation::Create, at(7)),
    ];
    let output = correlator
      .transform("realm", &types(&["bill", "bill_item_line", "vendor"]), &events)
      .await
      .unwrap();

    let bills = &output["bill"];
    assert_eq!(ids(bills), vec![("1", Some(SyncAction::Set)), ("5", Some(SyncAction::Remove))]);
    assert_eq!(bills[0].get("attachments").unwrap()[0]["file_name"], "receipt.pdf");

    assert_eq!(
      ids(&output["bill_item_line"]),
      vec![
        ("1-1", Some(SyncAction::Remove)),
        ("1-2", Some(SyncAction::Set)),
        ("1-3", Some(SyncAction::Set)),
        ("5-1", Some(SyncAction::Remove)),
      ]
    );
    assert_eq!(ids(&output["vendor"]), vec![("4", Some(SyncAction::Set))]);
    // Window starts a minute before the earliest bill change.
    assert_eq!(ids(&output["item"]), vec![("11", Some(SyncAction::Set))]);
    assert_eq!(client.change_capture_requests()[0].1, at(4));

    assert_eq!(
      identities.get("realm", &ParentKey::new("Bill", "1"), "bill_item_line"),
      Some(["1-2".to_string(), "1-3".to_string()].into())
    );
    assert_eq!(
      identities.get("realm", &ParentKey::new("Bill", "5"), "bill_item_line"),
      None
    );
  }

  #[tokio::test]
  async fn test_related_target_is_emitted_once() {
    let client = source();
    let registry = TypeRegistry::default_catalog().unwrap();
    let identities = IdentityCache::new(Duration::from_secs(60));
    let settings = settings();
    let correlator = WebhookCorrelator::new(&client, &registry, &identities, &settings);

    let events = vec![
      WebhookChangeEvent::new("Bill", "1", Operation::Update, at(5)),
      WebhookChangeEvent::new("Item", "11", Operation::Update, at(5)),
    ];
    let output = correlator
      .transform("realm", &types(&["bill", "item"]), &events)
      .await
      .unwrap();

    assert_eq!(client.change_capture_requests().len(), 1);
    assert_eq!(ids(&output["item"]), vec![("11", Some(SyncAction::Set))]);
    assert_eq!(output["item"][0].get("name"), Some(&json!("Rock Fountain")));
  }

  #[tokio::test]
  async fn test_deleted_ids_are_not_fetched() {
    let client = source();
    let registry = TypeRegistry::default_catalog().unwrap();
    let identities = IdentityCache::new(Duration::from_secs(60));
    let settings = settings();
    let correlator = WebhookCorrelator::new(&client, &registry, &identities, &settings);

    let events = vec![
      WebhookChangeEvent::new("Vendor", "4", Operation::Create, at(1)),
      WebhookChangeEvent::new("Vendor", "4", Operation::Delete, at(2)),
    ];
    let output = correlator
      .transform("realm", &types(&["vendor"]), &events)
      .await
      .unwrap();

    assert!(client.batch_requests().is_empty());
    assert!(client.change_capture_requests().is_empty());
    assert_eq!(output["vendor"], vec![TargetRecord::removal("4")]);
  }

  #[tokio::test]
  async fn test_item_fault_fails_request_and_keeps_cache() {
    let client = source();
    client.fault_entity("Bill", "Object Not Found");
    let registry = TypeRegistry::default_catalog().unwrap();
    let identities = IdentityCache::new(Duration::from_secs(60));
    identities.replace(
      "realm",
      &ParentKey::new("Bill", "5"),
      "bill_item_line",
      ["5-1".to_string()].into(),
    );
    let settings = settings();
    let correlator = WebhookCorrelator::new(&client, &registry, &identities, &settings);

    let events = vec![
      WebhookChangeEvent::new("Bill", "1", Operation::Update, at(1)),
      WebhookChangeEvent::new("Bill", "5", Operation::Delete, at(1)),
    ];
    let err = correlator
      .transform("realm", &types(&["bill_item_line"]), &events)
      .await
      .unwrap_err();

    assert!(matches!(err, SyncError::SourceFault { .. }));
    assert_eq!(identities.len(), 1);
  }

  #[tokio::test]
  async fn test_change_capture_error_fails_request() {
    let client = source();
    client.fail_change_capture("throttled");
    let registry = TypeRegistry::default_catalog().unwrap();
    let identities = IdentityCache::new(Duration::from_secs(60));
    let settings = settings();
    let correlator = WebhookCorrelator::new(&client, &registry, &identities, &settings);

    let err = correlator
      .transform(
        "realm",
        &types(&["bill"]),
        &[WebhookChangeEvent::new("Bill", "1", Operation::Update, at(1))],
      )
      .await
      .unwrap_err();

    assert!(matches!(err, SyncError::Fetch(message) if message == "throttled"));
    // The batch half still ran to completion.
    assert_eq!(client.batch_requests().len(), 2);
  }

  #[tokio::test]
  async fn test_full_attachable_page_is_fatal() {
    let client = source();
    let registry = TypeRegistry::default_catalog().unwrap();
    let identities = IdentityCache::new(Duration::from_secs(60));
    let settings = EngineSettings {
      page_size: 1,
      ..EngineSettings::default()
    };
    let correlator = WebhookCorrelator::new(&client, &registry, &identities, &settings);

    let err = correlator
      .transform(
        "realm",
        &types(&["vendor", "bill"]),
        &[WebhookChangeEvent::new("Bill", "1", Operation::Update, at(1))],
      )
      .await
      .unwrap_err();

    assert!(matches!(err, SyncError::TruncatedAttachables { count: 1, .. }));
  }

  #[tokio::test]
  async fn test_deadline_aborts_fetch() {
    let client = source().with_latency(Duration::from_millis(200));
    let registry = TypeRegistry::default_catalog().unwrap();
    let identities = IdentityCache::new(Duration::from_secs(60));
    let settings = EngineSettings {
      request_timeout: Some(Duration::from_millis(10)),
      ..settings()
    };
    let correlator = WebhookCorrelator::new(&client, &registry, &identities, &settings);

    let err = correlator
      .transform(
        "realm",
        &types(&["vendor"]),
        &[WebhookChangeEvent::new("Vendor", "4", Operation::Update, at(1))],
      )
      .await
      .unwrap_err();

    assert!(matches!(err, SyncError::DeadlineExceeded));
  }

  /// Answers every batch with the same item twice.
  struct EchoTwice;

  #[async_trait]
  impl SourceClient for EchoTwice {
    async fn batch_query(
      &self,
      _workspace: &str,
      requests: Vec<BatchItemRequest>,
    ) -> Result<Vec<BatchItemResponse>> {
      let item = BatchItemResponse {
        correlation_id: requests[0].correlation_id.clone(),
        query_response: Some(QueryResponse::with_records(
          &requests[0].query.entity,
          vec![json!({ "Id": "4" })],
        )),
        fault: None,
      };
      Ok(vec![item.clone(), item])
    }

    async fn change_capture(
      &self,
      _workspace: &str,
      _entities: &[String],
      _since: DateTime<Utc>,
    ) -> Result<ChangeCaptureResponse> {
      Ok(ChangeCaptureResponse::default())
    }
  }

  /// Answers with an id nobody asked for.
  struct Stranger;

  #[async_trait]
  impl SourceClient for Stranger {
    async fn batch_query(
      &self,
      _workspace: &str,
      _requests: Vec<BatchItemRequest>,
    ) -> Result<Vec<BatchItemResponse>> {
      Ok(vec![BatchItemResponse {
        correlation_id: "Customer:1".to_string(),
        query_response: Some(QueryResponse::default()),
        fault: None,
      }])
    }

    async fn change_capture(
      &self,
      _workspace: &str,
      _entities: &[String],
      _since: DateTime<Utc>,
    ) -> Result<ChangeCaptureResponse> {
      Ok(ChangeCaptureResponse::default())
    }
  }

  #[tokio::test]
  async fn test_protocol_violations() {
    let registry = TypeRegistry::default_catalog().unwrap();
    let identities = IdentityCache::new(Duration::from_secs(60));
    let settings = settings();
    let events = [WebhookChangeEvent::new("Vendor", "4", Operation::Update, at(1))];

    let err = WebhookCorrelator::new(&EchoTwice, &registry, &identities, &settings)
      .transform("realm", &types(&["vendor"]), &events)
      .await
      .unwrap_err();
    assert!(matches!(err, SyncError::DuplicateBatchItem { ref entity } if entity == "Vendor"));
    assert!(err.is_protocol_violation());

    let err = WebhookCorrelator::new(&Stranger, &registry, &identities, &settings)
      .transform("realm", &types(&["vendor"]), &events)
      .await
      .unwrap_err();
    assert!(matches!(err, SyncError::UnexpectedBatchItem { .. }));
  }
}
