//! Raw metered usage records
//!
//! Raw usage is externally sourced and append-only: one record per metered
//! fact. Records are never mutated here; the core only selects, orders, and
//! aggregates them.

use meterbill_shared::SubscriptionId;
use serde::{Deserialize, Serialize};
use time::Date;
use uuid::Uuid;

/// Idempotency marker tying a raw usage fact to the invoice item it produced
///
/// Once a record's tracking id has been consumed by a run, later runs must be
/// handed that id back so the record is never billed twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackingId(pub Uuid);

impl From<Uuid> for TrackingId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// One metered fact reported for a subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawUsageRecord {
    pub id: Uuid,
    pub subscription_id: SubscriptionId,
    pub unit_type: String,
    pub date: Date,
    pub quantity: i64,
}

impl RawUsageRecord {
    pub fn new(
        subscription_id: SubscriptionId,
        unit_type: impl Into<String>,
        date: Date,
        quantity: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscription_id,
            unit_type: unit_type.into(),
            date,
            quantity,
        }
    }

    pub fn tracking_id(&self) -> TrackingId {
        TrackingId(self.id)
    }
}

/// Select one subscription's records and order them deterministically.
///
/// Ordering key is (date, unit type, record id). The record id tie-break
/// keeps the order stable across process restarts when date and unit type
/// collide; identity hashes are never used.
pub fn filter_and_sort(
    records: &[RawUsageRecord],
    subscription_id: SubscriptionId,
) -> Vec<RawUsageRecord> {
    let mut selected: Vec<RawUsageRecord> = records
        .iter()
        .filter(|record| record.subscription_id == subscription_id)
        .cloned()
        .collect();
    selected.sort_by(|a, b| {
        a.date
            .cmp(&b.date)
            .then_with(|| a.unit_type.cmp(&b.unit_type))
            .then_with(|| a.id.cmp(&b.id))
    });
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn test_filter_selects_only_the_target_subscription() {
        let target = SubscriptionId::new();
        let other = SubscriptionId::new();
        let records = vec![
            RawUsageRecord::new(target, "calls", date!(2024 - 01 - 10), 100),
            RawUsageRecord::new(other, "calls", date!(2024 - 01 - 10), 999),
            RawUsageRecord::new(target, "calls", date!(2024 - 01 - 05), 50),
        ];

        let selected = filter_and_sort(&records, target);
        assert_eq!(selected.len(), 2);
        assert!(selected.iter().all(|r| r.subscription_id == target));
        assert_eq!(selected[0].date, date!(2024 - 01 - 05));
    }

    #[test]
    fn test_sort_orders_by_date_then_unit_type() {
        let subscription_id = SubscriptionId::new();
        let records = vec![
            RawUsageRecord::new(subscription_id, "tokens", date!(2024 - 01 - 10), 1),
            RawUsageRecord::new(subscription_id, "calls", date!(2024 - 01 - 10), 2),
            RawUsageRecord::new(subscription_id, "calls", date!(2024 - 01 - 02), 3),
        ];

        let sorted = filter_and_sort(&records, subscription_id);
        assert_eq!(sorted[0].quantity, 3);
        assert_eq!(sorted[1].unit_type, "calls");
        assert_eq!(sorted[2].unit_type, "tokens");
    }

    #[test]
    fn test_tie_break_on_record_id_is_stable_across_runs() {
        let subscription_id = SubscriptionId::new();
        let a = RawUsageRecord::new(subscription_id, "calls", date!(2024 - 01 - 10), 1);
        let b = RawUsageRecord::new(subscription_id, "calls", date!(2024 - 01 - 10), 2);

        let first = filter_and_sort(&[a.clone(), b.clone()], subscription_id);
        let second = filter_and_sort(&[b, a], subscription_id);
        assert_eq!(first, second);
    }
}
