//! Field tables of the shipped accounting types.

use std::sync::Arc;

use serde_json::{json, Value};

use super::definition::TypeDefinition;
use super::dependent::DependentType;
use super::field::{date, flag, number, reference, text, Field, FieldDef, FieldKind};
use super::registry::TypeRegistryBuilder;
use super::root::RootType;
use super::union::{UnionMember, UnionType};
use crate::error::Result;
use crate::source::entities::{
  Account, Bill, Customer, EmailAddress, Employee, Invoice, Item, PhoneNumber, TxnLine, Vendor,
  ACCOUNT_EXPENSE_LINE, ITEM_EXPENSE_LINE, SALES_ITEM_LINE,
};

/// Field id that receives attachments on invoices and bills.
pub const ATTACHMENTS_FIELD: &str = "attachments";

pub fn register(builder: TypeRegistryBuilder) -> Result<TypeRegistryBuilder> {
  let customer: Arc<dyn TypeDefinition> = Arc::new(customer());
  let vendor: Arc<dyn TypeDefinition> = Arc::new(vendor());
  let employee: Arc<dyn TypeDefinition> = Arc::new(employee());
  let party = party(&customer, &vendor, &employee)?;

  Ok(
    builder
      .register(customer)
      .register(vendor)
      .register(employee)
      .register(Arc::new(account()))
      .register(Arc::new(item()))
      .register(Arc::new(invoice()))
      .register(Arc::new(invoice_line()))
      .register(Arc::new(bill()))
      .register(Arc::new(bill_item_line()))
      .register(Arc::new(bill_expense_line()))
      .register(Arc::new(party)),
  )
}

fn email(value: Option<&EmailAddress>) -> Value {
  text(value.and_then(|e| e.address.as_deref()))
}

fn phone(value: Option<&PhoneNumber>) -> Value {
  text(value.and_then(|p| p.free_form_number.as_deref()))
}

// ============================================================================
// Names
// ============================================================================

fn customer() -> RootType<Customer> {
  RootType::new(
    "customer",
    "Customers",
    vec![
      Field::root("display_name", FieldKind::Text, |c: &Customer| {
        text(c.display_name.as_deref())
      }),
      Field::root("company_name", FieldKind::Text, |c: &Customer| {
        text(c.company_name.as_deref())
      }),
      Field::root("given_name", FieldKind::Text, |c: &Customer| {
        text(c.given_name.as_deref())
      }),
      Field::root("family_name", FieldKind::Text, |c: &Customer| {
        text(c.family_name.as_deref())
      }),
      Field::root("email", FieldKind::Text, |c: &Customer| {
        email(c.primary_email_addr.as_ref())
      }),
      Field::root("phone", FieldKind::Text, |c: &Customer| {
        phone(c.primary_phone.as_ref())
      }),
      Field::root("balance", FieldKind::Number, |c: &Customer| number(c.balance)),
      Field::root("active", FieldKind::Boolean, |c: &Customer| flag(c.active)),
      Field::root("currency", FieldKind::Text, |c: &Customer| {
        reference(c.currency_ref.as_ref())
      }),
    ],
  )
  .dual()
}

fn vendor() -> RootType<Vendor> {
  RootType::new(
    "vendor",
    "Vendors",
    vec![
      Field::root("display_name", FieldKind::Text, |v: &Vendor| {
        text(v.display_name.as_deref())
      }),
      Field::root("company_name", FieldKind::Text, |v: &Vendor| {
        text(v.company_name.as_deref())
      }),
      Field::root("email", FieldKind::Text, |v: &Vendor| {
        email(v.primary_email_addr.as_ref())
      }),
      Field::root("phone", FieldKind::Text, |v: &Vendor| {
        phone(v.primary_phone.as_ref())
      }),
      Field::root("account_number", FieldKind::Text, |v: &Vendor| {
        text(v.acct_num.as_deref())
      }),
      Field::root("balance", FieldKind::Number, |v: &Vendor| number(v.balance)),
      Field::root("active", FieldKind::Boolean, |v: &Vendor| flag(v.active)),
    ],
  )
  .dual()
}

/// Employees have no change-capture feed in the source.
fn employee() -> RootType<Employee> {
  RootType::new(
    "employee",
    "Employees",
    vec![
      Field::root("display_name", FieldKind::Text, |e: &Employee| {
        text(e.display_name.as_deref())
      }),
      Field::root("given_name", FieldKind::Text, |e: &Employee| {
        text(e.given_name.as_deref())
      }),
      Field::root("family_name", FieldKind::Text, |e: &Employee| {
        text(e.family_name.as_deref())
      }),
      Field::root("email", FieldKind::Text, |e: &Employee| {
        email(e.primary_email_addr.as_ref())
      }),
      Field::root("phone", FieldKind::Text, |e: &Employee| {
        phone(e.primary_phone.as_ref())
      }),
      Field::try_root("hired_date", FieldKind::Date, |e: &Employee| {
        date(e.hired_date.as_deref())
      }),
      Field::root("active", FieldKind::Boolean, |e: &Employee| flag(e.active)),
    ],
  )
  .with_webhooks()
}

// ============================================================================
// Lists
// ============================================================================

fn account() -> RootType<Account> {
  RootType::new(
    "account",
    "Accounts",
    vec![
      Field::root("name", FieldKind::Text, |a: &Account| text(a.name.as_deref())),
      Field::root("fully_qualified_name", FieldKind::Text, |a: &Account| {
        text(a.fully_qualified_name.as_deref())
      }),
      Field::root("account_type", FieldKind::Text, |a: &Account| {
        text(a.account_type.as_deref())
      }),
      Field::root("account_sub_type", FieldKind::Text, |a: &Account| {
        text(a.account_sub_type.as_deref())
      }),
      Field::root("classification", FieldKind::Text, |a: &Account| {
        text(a.classification.as_deref())
      }),
      Field::root("current_balance", FieldKind::Number, |a: &Account| {
        number(a.current_balance)
      }),
      Field::root("active", FieldKind::Boolean, |a: &Account| flag(a.active)),
    ],
  )
  .with_cdc()
}

fn item() -> RootType<Item> {
  RootType::new(
    "item",
    "Items",
    vec![
      Field::root("name", FieldKind::Text, |i: &Item| text(i.name.as_deref())),
      Field::root("sku", FieldKind::Text, |i: &Item| text(i.sku.as_deref())).named("SKU"),
      Field::root("item_type", FieldKind::Text, |i: &Item| text(i.item_type.as_deref())),
      Field::root("unit_price", FieldKind::Number, |i: &Item| number(i.unit_price)),
      Field::root("purchase_cost", FieldKind::Number, |i: &Item| number(i.purchase_cost)),
      Field::root("qty_on_hand", FieldKind::Number, |i: &Item| number(i.qty_on_hand))
        .named("Quantity On Hand"),
      Field::root("income_account", FieldKind::Reference, |i: &Item| {
        reference(i.income_account_ref.as_ref())
      })
      .relates_to("account"),
      Field::root("active", FieldKind::Boolean, |i: &Item| flag(i.active)),
    ],
  )
  .dual()
}

// ============================================================================
// Transactions
// ============================================================================

fn invoice() -> RootType<Invoice> {
  RootType::new(
    "invoice",
    "Invoices",
    vec![
      Field::root("doc_number", FieldKind::Text, |i: &Invoice| {
        text(i.doc_number.as_deref())
      }),
      Field::try_root("txn_date", FieldKind::Date, |i: &Invoice| {
        date(i.txn_date.as_deref())
      })
      .named("Date"),
      Field::try_root("due_date", FieldKind::Date, |i: &Invoice| {
        date(i.due_date.as_deref())
      }),
      Field::root("customer", FieldKind::Reference, |i: &Invoice| {
        reference(i.customer_ref.as_ref())
      })
      .relates_to("customer"),
      Field::root("total_amount", FieldKind::Number, |i: &Invoice| number(i.total_amt)),
      Field::root("balance", FieldKind::Number, |i: &Invoice| number(i.balance)),
      Field::root("email_status", FieldKind::Text, |i: &Invoice| {
        text(i.email_status.as_deref())
      }),
      Field::root("currency", FieldKind::Text, |i: &Invoice| {
        reference(i.currency_ref.as_ref())
      }),
      Field::attachments(ATTACHMENTS_FIELD),
    ],
  )
  .dual()
  .with_related(&["item"])
}

fn sales_lines(invoice: &Invoice) -> Vec<&TxnLine> {
  invoice
    .line
    .iter()
    .filter(|l| l.is_detail(SALES_ITEM_LINE))
    .collect()
}

fn item_expense_lines(bill: &Bill) -> Vec<&TxnLine> {
  bill
    .line
    .iter()
    .filter(|l| l.is_detail(ITEM_EXPENSE_LINE))
    .collect()
}

fn account_expense_lines(bill: &Bill) -> Vec<&TxnLine> {
  bill
    .line
    .iter()
    .filter(|l| l.is_detail(ACCOUNT_EXPENSE_LINE))
    .collect()
}

/// `<parent id>-<line id>`; line ids are only unique within their parent.
fn line_id(parent_id: &str, line: &TxnLine) -> String {
  format!("{}-{}", parent_id, line.id.as_deref().unwrap_or_default())
}

fn invoice_line() -> DependentType<Invoice, TxnLine> {
  DependentType::new(
    "invoice_line",
    "Invoice Lines",
    vec![
      Field::child("invoice", FieldKind::Reference, |i: &Invoice, _: &TxnLine| {
        json!(i.id)
      })
      .relates_to("invoice"),
      Field::child("line_num", FieldKind::Number, |_: &Invoice, l: &TxnLine| {
        number(l.line_num.map(f64::from))
      })
      .named("Line Number"),
      Field::child("description", FieldKind::Text, |_: &Invoice, l: &TxnLine| {
        text(l.description.as_deref())
      }),
      Field::child("amount", FieldKind::Number, |_: &Invoice, l: &TxnLine| number(l.amount)),
      Field::child("item", FieldKind::Reference, |_: &Invoice, l: &TxnLine| {
        reference(
          l.sales_item_line_detail
            .as_ref()
            .and_then(|d| d.item_ref.as_ref()),
        )
      })
      .relates_to("item"),
      Field::child("quantity", FieldKind::Number, |_: &Invoice, l: &TxnLine| {
        number(l.sales_item_line_detail.as_ref().and_then(|d| d.qty))
      }),
      Field::child("unit_price", FieldKind::Number, |_: &Invoice, l: &TxnLine| {
        number(l.sales_item_line_detail.as_ref().and_then(|d| d.unit_price))
      }),
    ],
    sales_lines,
    |i: &Invoice, l: &TxnLine| line_id(&i.id, l),
  )
}

fn bill() -> RootType<Bill> {
  RootType::new(
    "bill",
    "Bills",
    vec![
      Field::root("doc_number", FieldKind::Text, |b: &Bill| text(b.doc_number.as_deref())),
      Field::try_root("txn_date", FieldKind::Date, |b: &Bill| date(b.txn_date.as_deref()))
        .named("Date"),
      Field::try_root("due_date", FieldKind::Date, |b: &Bill| date(b.due_date.as_deref())),
      Field::root("vendor", FieldKind::Reference, |b: &Bill| {
        reference(b.vendor_ref.as_ref())
      })
      .relates_to("vendor"),
      Field::root("ap_account", FieldKind::Reference, |b: &Bill| {
        reference(b.ap_account_ref.as_ref())
      })
      .named("AP Account")
      .relates_to("account"),
      Field::root("total_amount", FieldKind::Number, |b: &Bill| number(b.total_amt)),
      Field::root("balance", FieldKind::Number, |b: &Bill| number(b.balance)),
      Field::root("currency", FieldKind::Text, |b: &Bill| {
        reference(b.currency_ref.as_ref())
      }),
      Field::attachments(ATTACHMENTS_FIELD),
    ],
  )
  .dual()
  .with_related(&["item"])
}

fn bill_line_fields() -> Vec<Field<Bill, TxnLine>> {
  vec![
    Field::child("bill", FieldKind::Reference, |b: &Bill, _: &TxnLine| json!(b.id))
      .relates_to("bill"),
    Field::child("line_num", FieldKind::Number, |_: &Bill, l: &TxnLine| {
      number(l.line_num.map(f64::from))
    })
    .named("Line Number"),
    Field::child("description", FieldKind::Text, |_: &Bill, l: &TxnLine| {
      text(l.description.as_deref())
    }),
    Field::child("amount", FieldKind::Number, |_: &Bill, l: &TxnLine| number(l.amount)),
  ]
}

fn bill_item_line() -> DependentType<Bill, TxnLine> {
  let mut fields = bill_line_fields();
  fields.extend([
    Field::child("item", FieldKind::Reference, |_: &Bill, l: &TxnLine| {
      reference(
        l.item_based_expense_line_detail
          .as_ref()
          .and_then(|d| d.item_ref.as_ref()),
      )
    })
    .relates_to("item"),
    Field::child("customer", FieldKind::Reference, |_: &Bill, l: &TxnLine| {
      reference(
        l.item_based_expense_line_detail
          .as_ref()
          .and_then(|d| d.customer_ref.as_ref()),
      )
    })
    .relates_to("customer"),
    Field::child("quantity", FieldKind::Number, |_: &Bill, l: &TxnLine| {
      number(l.item_based_expense_line_detail.as_ref().and_then(|d| d.qty))
    }),
    Field::child("unit_price", FieldKind::Number, |_: &Bill, l: &TxnLine| {
      number(
        l.item_based_expense_line_detail
          .as_ref()
          .and_then(|d| d.unit_price),
      )
    }),
  ]);

  DependentType::new(
    "bill_item_line",
    "Bill Item Lines",
    fields,
    item_expense_lines,
    |b: &Bill, l: &TxnLine| line_id(&b.id, l),
  )
}

fn bill_expense_line() -> DependentType<Bill, TxnLine> {
  let mut fields = bill_line_fields();
  fields.extend([
    Field::child("account", FieldKind::Reference, |_: &Bill, l: &TxnLine| {
      reference(
        l.account_based_expense_line_detail
          .as_ref()
          .and_then(|d| d.account_ref.as_ref()),
      )
    })
    .relates_to("account"),
    Field::child("customer", FieldKind::Reference, |_: &Bill, l: &TxnLine| {
      reference(
        l.account_based_expense_line_detail
          .as_ref()
          .and_then(|d| d.customer_ref.as_ref()),
      )
    })
    .relates_to("customer"),
  ]);

  DependentType::new(
    "bill_expense_line",
    "Bill Expense Lines",
    fields,
    account_expense_lines,
    |b: &Bill, l: &TxnLine| line_id(&b.id, l),
  )
}

// ============================================================================
// Unions
// ============================================================================

fn party(
  customer: &Arc<dyn TypeDefinition>,
  vendor: &Arc<dyn TypeDefinition>,
  employee: &Arc<dyn TypeDefinition>,
) -> Result<UnionType> {
  let member = |definition: &Arc<dyn TypeDefinition>, prefix: &str| {
    UnionMember::new(Arc::clone(definition), prefix)
      .map("name", "display_name")
      .map("email", "email")
      .map("phone", "phone")
      .map("active", "active")
      .constant("party_type", json!(prefix))
  };

  UnionType::new(
    "party",
    "Parties",
    vec![
      FieldDef::new("name", FieldKind::Text),
      FieldDef::new("email", FieldKind::Text),
      FieldDef::new("phone", FieldKind::Text),
      FieldDef::new("party_type", FieldKind::Text),
      FieldDef::new("active", FieldKind::Boolean),
      FieldDef::new("balance", FieldKind::Number),
    ],
    vec![
      member(customer, "customer").map("balance", "balance"),
      member(vendor, "vendor").map("balance", "balance"),
      member(employee, "employee"),
    ],
  )
}
