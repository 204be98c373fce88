//! Per-subscription usage reconciliation
//!
//! Walks one subscription's billing-event timeline, partitions it into
//! contiguous per-usage-section intervals, reconciles each interval against
//! the invoice items already issued, and merges the per-interval results into
//! the subscription-level outcome.
//!
//! The walk is strictly sequential (interval closure depends on event order);
//! distinct subscriptions share no mutable state and may be processed in
//! parallel by the caller.

use std::collections::{BTreeSet, HashMap, HashSet};

use time::Date;
use tracing::debug;

use meterbill_shared::{AccountId, InvoiceId, SubscriptionId};

use crate::config::InvoiceConfig;
use crate::error::{InvoiceError, InvoiceResult};
use crate::events::BillingEvent;
use crate::interval::{
    ContiguousUsageInterval, FinalizedUsageInterval, IntervalResult, UsageKey,
};
use crate::items::InvoiceItem;
use crate::raw_usage::{filter_and_sort, RawUsageRecord, TrackingId};

/// Reconciles one subscription's metered usage against its plan timeline.
///
/// All inputs are materialized up front; the computation is a pure function
/// of them. A run either completes or fails as a whole, so the caller can
/// treat the returned item set as all-or-nothing.
pub struct SubscriptionUsageInArrear {
    account_id: AccountId,
    invoice_id: InvoiceId,
    subscription_id: SubscriptionId,
    events: Vec<BillingEvent>,
    raw_usage: Vec<RawUsageRecord>,
    existing_tracking_ids: HashSet<TrackingId>,
    target_date: Date,
    raw_usage_start_date: Date,
    config: InvoiceConfig,
}

impl SubscriptionUsageInArrear {
    /// Build the per-subscription computation.
    ///
    /// `events` must be non-empty and pre-sorted ascending by effective date.
    /// `raw_usage` may span many subscriptions; only the records of the
    /// events' subscription are kept, deterministically ordered.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        account_id: AccountId,
        invoice_id: InvoiceId,
        events: Vec<BillingEvent>,
        raw_usage: &[RawUsageRecord],
        existing_tracking_ids: HashSet<TrackingId>,
        target_date: Date,
        raw_usage_start_date: Date,
        config: InvoiceConfig,
    ) -> InvoiceResult<Self> {
        let subscription_id = events
            .first()
            .map(|event| event.subscription_id)
            .ok_or(InvoiceError::NoBillingEvents)?;
        let raw_usage = filter_and_sort(raw_usage, subscription_id);
        Ok(Self {
            account_id,
            invoice_id,
            subscription_id,
            events,
            raw_usage,
            existing_tracking_ids,
            target_date,
            raw_usage_start_date,
            config,
        })
    }

    pub fn subscription_id(&self) -> SubscriptionId {
        self.subscription_id
    }

    /// Compute what remains to be billed through the target date, plus the
    /// next date each usage section must be re-evaluated.
    pub fn compute_missing_items(
        &self,
        existing_items: &[InvoiceItem],
    ) -> InvoiceResult<SubscriptionUsageResult> {
        let intervals = self.compute_intervals()?;
        let mut result = SubscriptionUsageResult::default();
        for interval in &intervals {
            let interval_result = interval.compute_missing_items(
                &self.raw_usage,
                existing_items,
                &self.existing_tracking_ids,
                &self.config,
            )?;
            debug!(
                subscription_id = %self.subscription_id,
                usage_name = interval.usage_name(),
                closed = interval.is_closed(),
                new_items = interval_result.invoice_items.len(),
                next_notification = ?interval_result.next_notification_date,
                "reconciled usage interval"
            );
            result.add_interval(interval.usage_name(), interval_result);
        }
        Ok(result)
    }

    /// Partition the billing-event timeline into contiguous usage intervals.
    ///
    /// One pass over the events: a usage section referenced by the current
    /// event keeps (or opens) its accumulator; every section seen earlier but
    /// absent from the current event closes now, with the current event
    /// appended as its boundary. Accumulators still open when the timeline
    /// ends stay active going forward and finalize with `closed = false`.
    pub fn compute_intervals(&self) -> InvoiceResult<Vec<FinalizedUsageInterval>> {
        let mut finalized: Vec<FinalizedUsageInterval> = Vec::new();
        let mut open: HashMap<UsageKey, ContiguousUsageInterval> = HashMap::new();
        let mut seen: BTreeSet<UsageKey> = BTreeSet::new();
        let mut prev_event_unit_types: BTreeSet<String> = BTreeSet::new();

        for event in &self.events {
            // Every key seen so far is a closure candidate until the current
            // event references it again.
            let mut to_close: BTreeSet<UsageKey> = seen.clone();
            let mut event_unit_types: BTreeSet<String> = BTreeSet::new();
            let mut touched: Vec<UsageKey> = Vec::new();

            let usages: Vec<_> = event.in_arrear_usages().cloned().collect();
            for usage in &usages {
                let key = UsageKey::new(usage.name.clone(), event.catalog_effective_date);
                seen.insert(key.clone());
                to_close.remove(&key);
                let interval = open.entry(key.clone()).or_insert_with(|| {
                    ContiguousUsageInterval::new(
                        usage.clone(),
                        key.clone(),
                        self.account_id,
                        self.invoice_id,
                        self.subscription_id,
                        self.target_date,
                        self.raw_usage_start_date,
                    )
                });
                interval.push_event(event.clone());
                event_unit_types.extend(usage.unit_types.iter().cloned());
                touched.push(key);
            }

            // Propagate the full unit-type set this event saw to every
            // interval it touched
            for key in &touched {
                if let Some(interval) = open.get_mut(key) {
                    interval.observe_unit_types(&event_unit_types);
                }
            }

            // A cancellation declares no sections of its own, so intervals it
            // closes aggregate with the previous event's unit types
            let closing_unit_types = if usages.is_empty() {
                &prev_event_unit_types
            } else {
                &event_unit_types
            };
            for key in &to_close {
                if let Some(mut interval) = open.remove(key) {
                    interval.push_event(event.clone());
                    interval.observe_unit_types(closing_unit_types);
                    finalized.push(interval.build(true)?);
                }
            }

            prev_event_unit_types = event_unit_types;
        }

        // Timeline ended with these still active; finalize in stable key
        // order so output ordering is reproducible
        let mut still_open: Vec<(UsageKey, ContiguousUsageInterval)> = open.into_iter().collect();
        still_open.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, interval) in still_open {
            finalized.push(interval.build(false)?);
        }

        debug!(
            subscription_id = %self.subscription_id,
            intervals = finalized.len(),
            "partitioned billing events into usage intervals"
        );
        Ok(finalized)
    }
}

/// Subscription-level merge of per-interval results
#[derive(Debug, Default)]
pub struct SubscriptionUsageResult {
    invoice_items: Vec<InvoiceItem>,
    per_usage_notification_dates: HashMap<String, Date>,
    tracking_ids: HashSet<TrackingId>,
}

impl SubscriptionUsageResult {
    /// Merge one finalized interval's result: items append, a non-None
    /// notification date replaces any earlier date for the same usage name,
    /// tracking ids union.
    pub fn add_interval(&mut self, usage_name: &str, input: IntervalResult) {
        if !input.invoice_items.is_empty() {
            self.invoice_items.extend(input.invoice_items);
        }
        if let Some(date) = input.next_notification_date {
            self.per_usage_notification_dates
                .insert(usage_name.to_string(), date);
        }
        self.tracking_ids.extend(input.tracking_ids);
    }

    /// New invoice items to persist
    pub fn invoice_items(&self) -> &[InvoiceItem] {
        &self.invoice_items
    }

    /// Next re-evaluation date per usage name, for the scheduling collaborator
    pub fn per_usage_notification_dates(&self) -> &HashMap<String, Date> {
        &self.per_usage_notification_dates
    }

    /// Tracking ids newly consumed by this run
    pub fn tracking_ids(&self) -> &HashSet<TrackingId> {
        &self.tracking_ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{BillingPeriod, ConsumableRate, UsageDefinition};
    use time::macros::{date, datetime};
    use uuid::Uuid;

    fn api_calls_usage() -> UsageDefinition {
        UsageDefinition::consumable(
            "API-CALLS",
            BillingPeriod::Monthly,
            vec![ConsumableRate {
                unit_type: "calls".to_string(),
                per_unit_cents: 2,
            }],
        )
    }

    #[test]
    fn test_empty_billing_events_fail_fast() {
        let result = SubscriptionUsageInArrear::new(
            AccountId::new(),
            InvoiceId::new(),
            Vec::new(),
            &[],
            HashSet::new(),
            date!(2024 - 03 - 01),
            date!(2024 - 01 - 01),
            InvoiceConfig::default(),
        );
        assert!(matches!(result, Err(InvoiceError::NoBillingEvents)));
    }

    #[test]
    fn test_catalog_version_bump_splits_the_interval() {
        let subscription_id = SubscriptionId::new();
        let events = vec![
            BillingEvent::new(
                subscription_id,
                date!(2024 - 01 - 01),
                datetime!(2024-01-01 00:00 UTC),
                vec![api_calls_usage()],
            ),
            BillingEvent::new(
                subscription_id,
                date!(2024 - 02 - 01),
                datetime!(2024-02-01 00:00 UTC),
                vec![api_calls_usage()],
            ),
        ];
        let computation = match SubscriptionUsageInArrear::new(
            AccountId::new(),
            InvoiceId::new(),
            events,
            &[],
            HashSet::new(),
            date!(2024 - 04 - 01),
            date!(2024 - 01 - 01),
            InvoiceConfig::default(),
        ) {
            Ok(computation) => computation,
            Err(err) => panic!("construction failed: {err}"),
        };

        let intervals = match computation.compute_intervals() {
            Ok(intervals) => intervals,
            Err(err) => panic!("interval walk failed: {err}"),
        };
        // Same usage name, two catalog versions: the first run closes when
        // the second event stops referencing its key
        assert_eq!(intervals.len(), 2);
        assert!(intervals[0].is_closed());
        assert!(!intervals[1].is_closed());
        assert_ne!(intervals[0].usage_key(), intervals[1].usage_key());
    }

    #[test]
    fn test_same_key_stays_one_open_interval() {
        let subscription_id = SubscriptionId::new();
        let catalog_date = datetime!(2024-01-01 00:00 UTC);
        let events = vec![
            BillingEvent::new(
                subscription_id,
                date!(2024 - 01 - 01),
                catalog_date,
                vec![api_calls_usage()],
            ),
            BillingEvent::new(
                subscription_id,
                date!(2024 - 02 - 01),
                catalog_date,
                vec![api_calls_usage()],
            ),
        ];
        let computation = match SubscriptionUsageInArrear::new(
            AccountId::new(),
            InvoiceId::new(),
            events,
            &[],
            HashSet::new(),
            date!(2024 - 04 - 01),
            date!(2024 - 01 - 01),
            InvoiceConfig::default(),
        ) {
            Ok(computation) => computation,
            Err(err) => panic!("construction failed: {err}"),
        };

        let intervals = match computation.compute_intervals() {
            Ok(intervals) => intervals,
            Err(err) => panic!("interval walk failed: {err}"),
        };
        assert_eq!(intervals.len(), 1);
        assert!(!intervals[0].is_closed());
        assert_eq!(intervals[0].events().len(), 2);
    }

    #[test]
    fn test_last_writer_wins_for_notification_dates() {
        let mut result = SubscriptionUsageResult::default();
        result.add_interval(
            "API-CALLS",
            IntervalResult {
                invoice_items: Vec::new(),
                next_notification_date: Some(date!(2024 - 02 - 01)),
                tracking_ids: HashSet::new(),
            },
        );
        result.add_interval(
            "API-CALLS",
            IntervalResult {
                invoice_items: Vec::new(),
                next_notification_date: Some(date!(2024 - 03 - 01)),
                tracking_ids: HashSet::new(),
            },
        );
        // A None date never erases an earlier one
        result.add_interval(
            "API-CALLS",
            IntervalResult {
                invoice_items: Vec::new(),
                next_notification_date: None,
                tracking_ids: HashSet::new(),
            },
        );
        assert_eq!(
            result.per_usage_notification_dates().get("API-CALLS"),
            Some(&date!(2024 - 03 - 01))
        );
    }

    #[test]
    fn test_tracking_ids_union_across_intervals() {
        let mut result = SubscriptionUsageResult::default();
        let shared = TrackingId(Uuid::new_v4());
        let mut first = HashSet::new();
        first.insert(shared);
        first.insert(TrackingId(Uuid::new_v4()));
        let mut second = HashSet::new();
        second.insert(shared);

        result.add_interval(
            "API-CALLS",
            IntervalResult {
                invoice_items: Vec::new(),
                next_notification_date: None,
                tracking_ids: first,
            },
        );
        result.add_interval(
            "STORAGE",
            IntervalResult {
                invoice_items: Vec::new(),
                next_notification_date: None,
                tracking_ids: second,
            },
        );
        assert_eq!(result.tracking_ids().len(), 2);
    }
}
