//! Webhook-triggered sync.
//!
//! Notifications only name the records that changed. The correlator groups
//! them per source entity, fetches the current state and runs the affected
//! types' materializations over it.

mod correlator;
mod event;
mod group;

pub use correlator::WebhookCorrelator;
pub use event::{parse_notifications, Operation, WebhookChangeEvent};
pub use group::{WebhookGroup, WebhookPlan};
