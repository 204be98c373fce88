//! Meterbill usage in-arrear invoicing core
//!
//! Reconciles a subscription's metered consumption against its billing-plan
//! timeline to determine which usage-based charges are still owed. Given the
//! subscription's billing events, its raw usage records, and the invoice
//! items already issued, the core produces exactly the new line items needed
//! to bring the account up to date through a target date, plus the next date
//! each usage section must be re-evaluated.
//!
//! The computation is a pure function of its inputs and is safely
//! re-runnable: previously issued items and consumed tracking ids are
//! threaded back in, and every metered record is billed exactly once.

pub mod catalog;
pub mod config;
pub mod error;
pub mod events;
pub mod interval;
pub mod items;
pub mod raw_usage;
pub mod subscription;

pub use catalog::{
    BillingMode, BillingPeriod, CapacityTier, ConsumableRate, UnitLimit, UsageDefinition,
    UsagePricing, UsageType,
};
pub use config::InvoiceConfig;
pub use error::{InvoiceError, InvoiceResult};
pub use events::BillingEvent;
pub use interval::{ContiguousUsageInterval, FinalizedUsageInterval, IntervalResult, UsageKey};
pub use items::{InvoiceItem, UsageDetailMode};
pub use raw_usage::{filter_and_sort, RawUsageRecord, TrackingId};
pub use subscription::{SubscriptionUsageInArrear, SubscriptionUsageResult};
