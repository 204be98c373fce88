//! Subscription billing events
//!
//! A billing event is one immutable point on a subscription's plan timeline:
//! a plan start, a plan change, a catalog version bump, or a cancellation. The
//! event carries the usage sections active from that point; cancellation-type
//! events carry none.

use meterbill_shared::SubscriptionId;
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

use crate::catalog::{BillingMode, UsageDefinition};

/// One point on a subscription's plan timeline
///
/// Events for a subscription are supplied pre-sorted ascending by effective
/// date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingEvent {
    pub subscription_id: SubscriptionId,
    /// Date the event takes effect
    pub effective_date: Date,
    /// Catalog version in force from this event on
    pub catalog_effective_date: OffsetDateTime,
    /// Usage sections active from this point; empty for cancellations
    pub usages: Vec<UsageDefinition>,
}

impl BillingEvent {
    pub fn new(
        subscription_id: SubscriptionId,
        effective_date: Date,
        catalog_effective_date: OffsetDateTime,
        usages: Vec<UsageDefinition>,
    ) -> Self {
        Self {
            subscription_id,
            effective_date,
            catalog_effective_date,
            usages,
        }
    }

    /// Sections of this event billed in arrear; the core processes no others
    pub fn in_arrear_usages(&self) -> impl Iterator<Item = &UsageDefinition> {
        self.usages
            .iter()
            .filter(|usage| usage.billing_mode == BillingMode::InArrear)
    }

    /// Cancellation-type events declare no usage sections of their own
    pub fn is_terminal(&self) -> bool {
        self.usages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{BillingPeriod, ConsumableRate, UsageDefinition};
    use time::macros::{date, datetime};

    #[test]
    fn test_in_arrear_filter_skips_in_advance_sections() {
        let mut in_advance = UsageDefinition::consumable(
            "PREPAID",
            BillingPeriod::Monthly,
            vec![ConsumableRate {
                unit_type: "seats".to_string(),
                per_unit_cents: 100,
            }],
        );
        in_advance.billing_mode = BillingMode::InAdvance;
        let in_arrear = UsageDefinition::consumable(
            "API-CALLS",
            BillingPeriod::Monthly,
            vec![ConsumableRate {
                unit_type: "calls".to_string(),
                per_unit_cents: 1,
            }],
        );

        let event = BillingEvent::new(
            SubscriptionId::new(),
            date!(2024 - 01 - 01),
            datetime!(2024-01-01 00:00 UTC),
            vec![in_advance, in_arrear],
        );

        let selected: Vec<&str> = event.in_arrear_usages().map(|u| u.name.as_str()).collect();
        assert_eq!(selected, vec!["API-CALLS"]);
        assert!(!event.is_terminal());
    }

    #[test]
    fn test_cancellation_event_is_terminal() {
        let event = BillingEvent::new(
            SubscriptionId::new(),
            date!(2024 - 02 - 01),
            datetime!(2024-01-01 00:00 UTC),
            Vec::new(),
        );
        assert!(event.is_terminal());
        assert_eq!(event.in_arrear_usages().count(), 0);
    }
}
