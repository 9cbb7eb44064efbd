//! Target type definitions.
//!
//! This module provides:
//! - Field tables and the conversion of source records into target records
//! - Root, dependent and union type definitions with opt-in capabilities
//! - The type registry and the shipped catalog

mod catalog;
mod context;
mod definition;
mod dependent;
mod field;
mod record;
mod registry;
mod root;
mod union;

pub use catalog::ATTACHMENTS_FIELD;
pub use context::SyncContext;
pub use definition::{
  Capability, CdcSync, DeletedIds, SourceBatch, StandardSync, TypeDefinition, TypeKind,
  WebhookSync,
};
pub use dependent::DependentType;
pub use field::{
  convert_record, date, flag, number, reference, text, ConvertError, Field, FieldDef, FieldKind,
  Relation, TypeSchema,
};
pub use record::{Page, SyncAction, SyncMode, SyncOutput, TargetRecord, ACTION_FIELD};
pub use registry::{TypeRegistry, TypeRegistryBuilder};
pub use root::RootType;
pub use union::{UnionMember, UnionRule, UnionType};
