//! Invoice line items produced by usage reconciliation

use meterbill_shared::{AccountId, InvoiceId, SubscriptionId};
use serde::{Deserialize, Serialize};
use time::Date;
use uuid::Uuid;

/// Amount of detail recorded on produced invoice items
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageDetailMode {
    /// One aggregate amount per item
    Aggregate,
    /// Items carry a per-unit breakdown in `item_details`
    Detail,
}

/// One usage-in-arrear invoice line item. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceItem {
    pub id: Uuid,
    pub account_id: AccountId,
    pub invoice_id: InvoiceId,
    pub subscription_id: SubscriptionId,
    /// Usage section that produced this item
    pub usage_name: String,
    /// Billed unit type; None for capacity items, which price the whole period
    pub unit_type: Option<String>,
    pub period_start: Date,
    pub period_end: Date,
    pub quantity: i64,
    /// Per-unit rate in cents; None for capacity items
    pub rate_cents: Option<i64>,
    pub amount_cents: i64,
    /// Per-unit breakdown, present in detail mode
    pub item_details: Option<serde_json::Value>,
}

impl InvoiceItem {
    /// Whether this item settles the given (usage, unit type, period) bucket
    pub fn covers(
        &self,
        usage_name: &str,
        unit_type: Option<&str>,
        period_start: Date,
        period_end: Date,
    ) -> bool {
        self.usage_name == usage_name
            && self.unit_type.as_deref() == unit_type
            && self.period_start == period_start
            && self.period_end == period_end
    }
}
