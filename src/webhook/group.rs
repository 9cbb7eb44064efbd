//! Which records a batch of notifications touches.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::event::WebhookChangeEvent;
use crate::error::{Result, SyncError};
use crate::schema::{Capability, DeletedIds, TypeDefinition, TypeKind, TypeRegistry};

/// The requested target types and the source entities they listen to.
pub struct WebhookPlan {
  pub targets: Vec<Arc<dyn TypeDefinition>>,
  /// Watched entity → whether its records need attachments.
  pub watched: BTreeMap<String, bool>,
  /// Watched entity → change-capture types it triggers.
  pub triggers: BTreeMap<String, BTreeSet<String>>,
}

impl WebhookPlan {
  pub fn build(registry: &TypeRegistry, type_ids: &[String], attachable_field: &str) -> Result<Self> {
    let mut targets = Vec::new();
    let mut watched = BTreeMap::new();
    let mut triggers: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for id in type_ids {
      let definition = registry.resolve(id)?;
      let webhook = definition
        .as_webhook()
        .ok_or_else(|| SyncError::Unsupported {
          target_type: id.clone(),
          capability: Capability::Webhook.to_string(),
        })?;

      let kind = match definition.kind() {
        TypeKind::Root { .. } => "root",
        TypeKind::Dependent { .. } => "dependent",
        TypeKind::Union => "union",
      };
      debug!(target_type = %id, kind, "planning webhook type");

      let entities = webhook.watched_entities();
      for entity in &entities {
        watched.entry(entity.clone()).or_insert(false);
      }
      for entity in definition.attachment_entities(attachable_field) {
        watched.insert(entity, true);
      }
      let related = webhook.related_types();
      if !related.is_empty() {
        for entity in &entities {
          triggers
            .entry(entity.clone())
            .or_default()
            .extend(related.iter().cloned());
        }
      }
      targets.push(Arc::clone(definition));
    }

    Ok(Self {
      targets,
      watched,
      triggers,
    })
  }

  pub fn needs_attachments(&self, entity: &str) -> bool {
    self.watched.get(entity).copied().unwrap_or(false)
  }
}

/// Notifications of one request, bucketed per source entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WebhookGroup {
  pub updated: BTreeMap<String, BTreeSet<String>>,
  pub deleted: DeletedIds,
  /// Change-capture types to refresh.
  pub active_related: BTreeSet<String>,
  /// Earliest change among notifications that triggered a related type.
  pub earliest: Option<DateTime<Utc>>,
}

impl WebhookGroup {
  pub fn classify(plan: &WebhookPlan, events: &[WebhookChangeEvent]) -> Self {
    let mut group = Self::default();

    for event in events {
      if !plan.watched.contains_key(&event.entity) {
        debug!(entity = %event.entity, id = %event.id, "ignoring unwatched notification");
        continue;
      }

      let bucket = if event.operation.is_removal() {
        &mut group.deleted
      } else {
        &mut group.updated
      };
      bucket
        .entry(event.entity.clone())
        .or_default()
        .insert(event.id.clone());

      if let Some(related) = plan.triggers.get(&event.entity) {
        group.active_related.extend(related.iter().cloned());
        group.earliest = Some(match group.earliest {
          Some(earliest) => earliest.min(event.timestamp),
          None => event.timestamp,
        });
      }
    }

    // A record both updated and deleted in one request is gone.
    for (entity, deleted) in &group.deleted {
      if let Some(updated) = group.updated.get_mut(entity) {
        updated.retain(|id| !deleted.contains(id));
      }
    }
    group.updated.retain(|_, ids| !ids.is_empty());

    group
  }

  /// Lower bound of the change-capture window.
  pub fn cdc_since(&self, lookback: Duration) -> Result<Option<DateTime<Utc>>> {
    let Some(earliest) = self.earliest.filter(|_| !self.active_related.is_empty()) else {
      return Ok(None);
    };
    chrono::Duration::from_std(lookback)
      .ok()
      .and_then(|lookback| earliest.checked_sub_signed(lookback))
      .map(Some)
      .ok_or(SyncError::LookbackOutOfRange(lookback))
  }

  pub fn is_empty(&self) -> bool {
    self.updated.is_empty() && self.deleted.is_empty() && self.active_related.is_empty()
  }
}
