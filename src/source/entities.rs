//! Source system records.
//!
//! Field names follow the source API (PascalCase). Every field except `Id` is
//! optional because deleted records in change-capture responses carry only
//! their identity and status.

use chrono::{DateTime, FixedOffset};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Lifecycle status of a source record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
  Active,
  Deleted,
}

/// A record type fetched from the source system.
pub trait SourceEntity: DeserializeOwned + Send + Sync + 'static {
  /// Entity name in the source API, e.g. `Bill`.
  const ENTITY: &'static str;

  fn id(&self) -> &str;

  /// Version token, bumped by the source on every change.
  fn sync_token(&self) -> Option<&str>;

  fn status(&self) -> RecordStatus;
}

macro_rules! source_entity {
  ($ty:ident, $name:literal) => {
    impl SourceEntity for $ty {
      const ENTITY: &'static str = $name;

      fn id(&self) -> &str {
        &self.id
      }

      fn sync_token(&self) -> Option<&str> {
        self.sync_token.as_deref()
      }

      fn status(&self) -> RecordStatus {
        match self.status.as_deref() {
          Some(s) if s.eq_ignore_ascii_case("deleted") => RecordStatus::Deleted,
          _ => RecordStatus::Active,
        }
      }
    }
  };
}

// ============================================================================
// Common nested types
// ============================================================================

/// Reference to another record, e.g. `CustomerRef`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ref {
  pub value: String,
  #[serde(default)]
  pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetaData {
  pub create_time: Option<DateTime<FixedOffset>>,
  pub last_updated_time: Option<DateTime<FixedOffset>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EmailAddress {
  pub address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PhoneNumber {
  pub free_form_number: Option<String>,
}

// ============================================================================
// Names
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Customer {
  pub id: String,
  pub sync_token: Option<String>,
  #[serde(rename = "status")]
  pub status: Option<String>,
  pub meta_data: Option<MetaData>,
  pub display_name: Option<String>,
  pub company_name: Option<String>,
  pub given_name: Option<String>,
  pub family_name: Option<String>,
  pub primary_email_addr: Option<EmailAddress>,
  pub primary_phone: Option<PhoneNumber>,
  pub balance: Option<f64>,
  pub active: Option<bool>,
  pub currency_ref: Option<Ref>,
}
source_entity!(Customer, "Customer");

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Vendor {
  pub id: String,
  pub sync_token: Option<String>,
  #[serde(rename = "status")]
  pub status: Option<String>,
  pub meta_data: Option<MetaData>,
  pub display_name: Option<String>,
  pub company_name: Option<String>,
  pub primary_email_addr: Option<EmailAddress>,
  pub primary_phone: Option<PhoneNumber>,
  pub acct_num: Option<String>,
  pub balance: Option<f64>,
  pub active: Option<bool>,
}
source_entity!(Vendor, "Vendor");

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Employee {
  pub id: String,
  pub sync_token: Option<String>,
  #[serde(rename = "status")]
  pub status: Option<String>,
  pub meta_data: Option<MetaData>,
  pub display_name: Option<String>,
  pub given_name: Option<String>,
  pub family_name: Option<String>,
  pub primary_email_addr: Option<EmailAddress>,
  pub primary_phone: Option<PhoneNumber>,
  pub hired_date: Option<String>,
  pub active: Option<bool>,
}
source_entity!(Employee, "Employee");

// ============================================================================
// Lists
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Account {
  pub id: String,
  pub sync_token: Option<String>,
  #[serde(rename = "status")]
  pub status: Option<String>,
  pub meta_data: Option<MetaData>,
  pub name: Option<String>,
  pub fully_qualified_name: Option<String>,
  pub account_type: Option<String>,
  pub account_sub_type: Option<String>,
  pub classification: Option<String>,
  pub current_balance: Option<f64>,
  pub active: Option<bool>,
}
source_entity!(Account, "Account");

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Item {
  pub id: String,
  pub sync_token: Option<String>,
  #[serde(rename = "status")]
  pub status: Option<String>,
  pub meta_data: Option<MetaData>,
  pub name: Option<String>,
  pub sku: Option<String>,
  #[serde(rename = "Type")]
  pub item_type: Option<String>,
  pub unit_price: Option<f64>,
  pub purchase_cost: Option<f64>,
  pub qty_on_hand: Option<f64>,
  pub income_account_ref: Option<Ref>,
  pub active: Option<bool>,
}
source_entity!(Item, "Item");

// ============================================================================
// Transactions
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SalesItemLineDetail {
  pub item_ref: Option<Ref>,
  pub qty: Option<f64>,
  pub unit_price: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ItemBasedExpenseLineDetail {
  pub item_ref: Option<Ref>,
  pub customer_ref: Option<Ref>,
  pub qty: Option<f64>,
  pub unit_price: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AccountBasedExpenseLineDetail {
  pub account_ref: Option<Ref>,
  pub customer_ref: Option<Ref>,
}

pub const SALES_ITEM_LINE: &str = "SalesItemLineDetail";
pub const ITEM_EXPENSE_LINE: &str = "ItemBasedExpenseLineDetail";
pub const ACCOUNT_EXPENSE_LINE: &str = "AccountBasedExpenseLineDetail";

/// A line inside a transaction. Lines have no query path of their own.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TxnLine {
  /// Local ordinal, unique within the parent only. Subtotal lines have none.
  pub id: Option<String>,
  pub line_num: Option<u32>,
  pub description: Option<String>,
  pub amount: Option<f64>,
  pub detail_type: Option<String>,
  pub sales_item_line_detail: Option<SalesItemLineDetail>,
  pub item_based_expense_line_detail: Option<ItemBasedExpenseLineDetail>,
  pub account_based_expense_line_detail: Option<AccountBasedExpenseLineDetail>,
}

impl TxnLine {
  pub fn is_detail(&self, detail_type: &str) -> bool {
    self.id.is_some() && self.detail_type.as_deref() == Some(detail_type)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Invoice {
  pub id: String,
  pub sync_token: Option<String>,
  #[serde(rename = "status")]
  pub status: Option<String>,
  pub meta_data: Option<MetaData>,
  pub doc_number: Option<String>,
  pub txn_date: Option<String>,
  pub due_date: Option<String>,
  pub customer_ref: Option<Ref>,
  pub total_amt: Option<f64>,
  pub balance: Option<f64>,
  pub email_status: Option<String>,
  pub currency_ref: Option<Ref>,
  pub line: Vec<TxnLine>,
}
source_entity!(Invoice, "Invoice");

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Bill {
  pub id: String,
  pub sync_token: Option<String>,
  #[serde(rename = "status")]
  pub status: Option<String>,
  pub meta_data: Option<MetaData>,
  pub doc_number: Option<String>,
  pub txn_date: Option<String>,
  pub due_date: Option<String>,
  pub vendor_ref: Option<Ref>,
  #[serde(rename = "APAccountRef")]
  pub ap_account_ref: Option<Ref>,
  pub total_amt: Option<f64>,
  pub balance: Option<f64>,
  pub currency_ref: Option<Ref>,
  pub line: Vec<TxnLine>,
}
source_entity!(Bill, "Bill");

// ============================================================================
// Attachments
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityRef {
  #[serde(rename = "type")]
  pub entity_type: String,
  pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AttachableRef {
  pub entity_ref: Option<EntityRef>,
  pub include_on_send: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Attachable {
  pub id: String,
  pub sync_token: Option<String>,
  #[serde(rename = "status")]
  pub status: Option<String>,
  pub meta_data: Option<MetaData>,
  pub file_name: Option<String>,
  pub content_type: Option<String>,
  pub size: Option<u64>,
  pub temp_download_uri: Option<String>,
  pub note: Option<String>,
  pub attachable_ref: Vec<AttachableRef>,
}
source_entity!(Attachable, "Attachable");
