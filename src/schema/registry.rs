//! The set of target types a deployment exposes.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::catalog;
use super::definition::{Capability, TypeDefinition};
use crate::error::{Result, SyncError};

/// Immutable once built; share it behind an `Arc`.
pub struct TypeRegistry {
  types: BTreeMap<String, Arc<dyn TypeDefinition>>,
}

impl TypeRegistry {
  pub fn builder() -> TypeRegistryBuilder {
    TypeRegistryBuilder::default()
  }

  /// The shipped accounting catalog.
  pub fn default_catalog() -> Result<Self> {
    catalog::register(Self::builder())?.build()
  }

  pub fn get(&self, id: &str) -> Option<&Arc<dyn TypeDefinition>> {
    self.types.get(id)
  }

  pub fn resolve(&self, id: &str) -> Result<&Arc<dyn TypeDefinition>> {
    self
      .get(id)
      .ok_or_else(|| SyncError::UnknownType(id.to_string()))
  }

  pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn TypeDefinition>> {
    self.types.values()
  }

  pub fn ids(&self) -> impl Iterator<Item = &str> {
    self.types.keys().map(String::as_str)
  }

  pub fn len(&self) -> usize {
    self.types.len()
  }

  pub fn is_empty(&self) -> bool {
    self.types.is_empty()
  }
}

#[derive(Default)]
pub struct TypeRegistryBuilder {
  types: Vec<Arc<dyn TypeDefinition>>,
}

impl TypeRegistryBuilder {
  pub fn register(mut self, definition: Arc<dyn TypeDefinition>) -> Self {
    self.types.push(definition);
    self
  }

  pub fn build(self) -> Result<TypeRegistry> {
    let mut types = BTreeMap::new();
    for definition in self.types {
      match types.entry(definition.id().to_string()) {
        Entry::Occupied(entry) => {
          return Err(SyncError::InvalidRegistry(format!(
            "type '{}' registered twice",
            entry.key()
          )));
        }
        Entry::Vacant(entry) => {
          entry.insert(definition);
        }
      }
    }

    for definition in types.values() {
      validate(definition.as_ref(), &types)?;
    }
    Ok(TypeRegistry { types })
  }
}

fn validate(
  definition: &dyn TypeDefinition,
  types: &BTreeMap<String, Arc<dyn TypeDefinition>>,
) -> Result<()> {
  if let Some(webhook) = definition.as_webhook() {
    for related in webhook.related_types() {
      let target = types.get(&related).ok_or_else(|| {
        SyncError::InvalidRegistry(format!(
          "'{}' lists unknown related type '{}'",
          definition.id(),
          related
        ))
      })?;
      if !target.capabilities().contains(&Capability::Cdc) {
        return Err(SyncError::InvalidRegistry(format!(
          "related type '{}' of '{}' does not support change capture",
          related,
          definition.id()
        )));
      }
    }
  }

  for field in &definition.schema().fields {
    if let Some(relation) = &field.relation {
      if !types.contains_key(&relation.target_type) {
        return Err(SyncError::InvalidRegistry(format!(
          "field '{}.{}' points at unknown type '{}'",
          definition.id(),
          field.id,
          relation.target_type
        )));
      }
    }
  }
  Ok(())
}
