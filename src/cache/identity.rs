//! Tracks which dependent records were last emitted for each parent.
//!
//! Dependent items (invoice lines, bill lines) cannot be queried on their own,
//! so the only way to notice that one disappeared is to remember what the
//! previous fetch of its parent produced and diff against it.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use super::traits::Sweep;
use super::ttl::TtlCache;

/// Target ids of the dependent records known for one parent.
pub type IdentitySet = BTreeSet<String>;

/// A parent record in the source system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParentKey {
  /// Source entity name, e.g. `Bill`.
  pub entity: String,
  pub id: String,
}

impl ParentKey {
  pub fn new(entity: impl Into<String>, id: impl Into<String>) -> Self {
    Self {
      entity: entity.into(),
      id: id.into(),
    }
  }
}

impl fmt::Display for ParentKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.entity, self.id)
  }
}

/// Sets are scoped per target type: one parent can feed several dependent
/// types and their memberships are diffed separately.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
  pub workspace: String,
  pub parent: ParentKey,
  pub target_type: String,
}

impl IdentityKey {
  fn new(workspace: &str, parent: &ParentKey, target_type: &str) -> Self {
    Self {
      workspace: workspace.to_string(),
      parent: parent.clone(),
      target_type: target_type.to_string(),
    }
  }
}

/// Process-wide dependent identity cache.
pub struct IdentityCache {
  inner: TtlCache<IdentityKey, IdentitySet>,
}

impl IdentityCache {
  pub fn new(ttl: Duration) -> Self {
    Self {
      inner: TtlCache::new(ttl),
    }
  }

  pub fn get(&self, workspace: &str, parent: &ParentKey, target_type: &str) -> Option<IdentitySet> {
    self
      .inner
      .get(&IdentityKey::new(workspace, parent, target_type))
  }

  /// Overwrite the set for a parent after a complete fetch.
  pub fn replace(&self, workspace: &str, parent: &ParentKey, target_type: &str, ids: IdentitySet) {
    self
      .inner
      .set(IdentityKey::new(workspace, parent, target_type), ids);
  }

  /// Merge ids into the set, used while a full sync is still paging.
  pub fn add<I>(&self, workspace: &str, parent: &ParentKey, target_type: &str, ids: I) -> IdentitySet
  where
    I: IntoIterator<Item = String>,
  {
    self
      .inner
      .update(IdentityKey::new(workspace, parent, target_type), |current| {
        let mut set = current.unwrap_or_default();
        set.extend(ids);
        set
      })
  }

  /// Drop the entry for a deleted parent, returning what was cached.
  pub fn remove_parent(
    &self,
    workspace: &str,
    parent: &ParentKey,
    target_type: &str,
  ) -> Option<IdentitySet> {
    self
      .inner
      .remove(&IdentityKey::new(workspace, parent, target_type))
  }

  pub fn apply(&self, workspace: &str, write: IdentityWrite) {
    match write {
      IdentityWrite::Add {
        parent,
        target_type,
        ids,
      } => {
        self.add(workspace, &parent, &target_type, ids);
      }
      IdentityWrite::Replace {
        parent,
        target_type,
        ids,
      } => self.replace(workspace, &parent, &target_type, ids),
      IdentityWrite::Remove {
        parent,
        target_type,
      } => {
        self.remove_parent(workspace, &parent, &target_type);
      }
    }
  }

  pub fn len(&self) -> usize {
    self.inner.len()
  }

  pub fn is_empty(&self) -> bool {
    self.inner.is_empty()
  }
}

/// A pending change to the identity cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityWrite {
  Add {
    parent: ParentKey,
    target_type: String,
    ids: IdentitySet,
  },
  Replace {
    parent: ParentKey,
    target_type: String,
    ids: IdentitySet,
  },
  Remove {
    parent: ParentKey,
    target_type: String,
  },
}

/// Collects identity writes for one request so they are applied only once
/// every materialization in it succeeded.
#[derive(Debug, Default)]
pub struct IdentityJournal {
  writes: Mutex<Vec<IdentityWrite>>,
}

impl IdentityJournal {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn record(&self, writes: Vec<IdentityWrite>) {
    self
      .writes
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .extend(writes);
  }

  pub fn len(&self) -> usize {
    self.writes.lock().unwrap_or_else(|e| e.into_inner()).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Apply every recorded write in order. Returns how many were applied.
  pub fn commit(self, cache: &IdentityCache, workspace: &str) -> usize {
    let writes = self.writes.into_inner().unwrap_or_else(|e| e.into_inner());
    let count = writes.len();
    for write in writes {
      cache.apply(workspace, write);
    }
    count
  }
}

impl Sweep for IdentityCache {
  fn sweep(&self) -> usize {
    self.inner.sweep()
  }

  fn name(&self) -> &'static str {
    "identity"
  }
}
