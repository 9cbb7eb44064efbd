use crate::attachable::AttachableIndex;
use crate::cache::{IdentityCache, IdentityJournal, IdentityWrite};

use super::field::TypeSchema;
use super::record::{SyncAction, SyncMode, TargetRecord};

/// Everything a materialization needs besides the fetched records.
#[derive(Clone, Copy)]
pub struct SyncContext<'a> {
  pub workspace: &'a str,
  pub identities: &'a IdentityCache,
  pub mode: SyncMode,
  /// Field id that holds attachments on types that declare it.
  pub attachable_field: Option<&'a str>,
  pub attachments: Option<&'a AttachableIndex>,
  /// When set, identity writes are staged here instead of applied.
  pub journal: Option<&'a IdentityJournal>,
}

impl<'a> SyncContext<'a> {
  pub fn new(workspace: &'a str, identities: &'a IdentityCache, mode: SyncMode) -> Self {
    Self {
      workspace,
      identities,
      mode,
      attachable_field: None,
      attachments: None,
      journal: None,
    }
  }

  pub fn with_attachments(mut self, field: &'a str, index: &'a AttachableIndex) -> Self {
    self.attachable_field = Some(field);
    self.attachments = Some(index);
    self
  }

  pub fn with_journal(mut self, journal: &'a IdentityJournal) -> Self {
    self.journal = Some(journal);
    self
  }

  pub fn write_identities(&self, writes: Vec<IdentityWrite>) {
    match self.journal {
      Some(journal) => journal.record(writes),
      None => {
        for write in writes {
          self.identities.apply(self.workspace, write);
        }
      }
    }
  }

  pub fn upsert_action(&self) -> Option<SyncAction> {
    self.mode.upsert_action()
  }

  /// Fill the attachment field of a converted record from the index.
  pub(crate) fn attach_files(
    &self,
    schema: &TypeSchema,
    entity: &str,
    source_id: &str,
    record: &mut TargetRecord,
  ) {
    let (Some(field), Some(index)) = (self.attachable_field, self.attachments) else {
      return;
    };
    if schema.has_field(field) && index.covers(entity) {
      record.set(field, index.field_value(entity, source_id));
    }
  }
}
