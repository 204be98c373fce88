//! Contiguous usage intervals
//!
//! A contiguous interval is the maximal run of consecutive billing events
//! during which one usage section (by [`UsageKey`]) stays referenced. The
//! timeline walk feeds events into an open accumulator; once the section
//! drops off the timeline (or the timeline ends) the accumulator is finalized
//! and reconciles its window of metered usage against the invoice items
//! already issued.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde_json::json;
use time::{Date, OffsetDateTime};
use tracing::{debug, warn};
use uuid::Uuid;

use meterbill_shared::{AccountId, InvoiceId, SubscriptionId};

use crate::catalog::{UsageDefinition, UsageType};
use crate::config::InvoiceConfig;
use crate::error::{InvoiceError, InvoiceResult};
use crate::events::BillingEvent;
use crate::items::{InvoiceItem, UsageDetailMode};
use crate::raw_usage::{RawUsageRecord, TrackingId};

/// Identity of a usage section at a point in time.
///
/// Two sections are the same interval subject only if both the name and the
/// catalog version match. `OffsetDateTime` compares and hashes by instant, so
/// the same catalog version expressed in different UTC offsets forms the same
/// key, while a catalog version bump always yields a distinct key even under
/// an identical name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UsageKey {
    usage_name: String,
    catalog_effective_date: OffsetDateTime,
}

impl UsageKey {
    pub fn new(usage_name: impl Into<String>, catalog_effective_date: OffsetDateTime) -> Self {
        Self {
            usage_name: usage_name.into(),
            catalog_effective_date,
        }
    }

    pub fn usage_name(&self) -> &str {
        &self.usage_name
    }

    pub fn catalog_effective_date(&self) -> OffsetDateTime {
        self.catalog_effective_date
    }
}

/// Result of reconciling one finalized interval
#[derive(Debug, Clone)]
pub struct IntervalResult {
    pub invoice_items: Vec<InvoiceItem>,
    /// Next date this usage section must be re-evaluated; None when the
    /// interval is closed and fully settled
    pub next_notification_date: Option<Date>,
    /// Tracking ids newly consumed by this interval (never overlaps the ids
    /// supplied as already consumed)
    pub tracking_ids: HashSet<TrackingId>,
}

/// Open accumulator for one contiguous run of billing events referencing the
/// same usage section.
///
/// The timeline walk appends events while the section stays referenced, then
/// calls [`build`](Self::build) exactly once to finalize it.
#[derive(Debug, Clone)]
pub struct ContiguousUsageInterval {
    usage: UsageDefinition,
    usage_key: UsageKey,
    account_id: AccountId,
    invoice_id: InvoiceId,
    subscription_id: SubscriptionId,
    target_date: Date,
    raw_usage_start_date: Date,
    events: Vec<BillingEvent>,
    seen_unit_types: BTreeSet<String>,
}

impl ContiguousUsageInterval {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        usage: UsageDefinition,
        usage_key: UsageKey,
        account_id: AccountId,
        invoice_id: InvoiceId,
        subscription_id: SubscriptionId,
        target_date: Date,
        raw_usage_start_date: Date,
    ) -> Self {
        Self {
            usage,
            usage_key,
            account_id,
            invoice_id,
            subscription_id,
            target_date,
            raw_usage_start_date,
            events: Vec::new(),
            seen_unit_types: BTreeSet::new(),
        }
    }

    pub fn usage(&self) -> &UsageDefinition {
        &self.usage
    }

    pub fn usage_key(&self) -> &UsageKey {
        &self.usage_key
    }

    /// Append the next billing event of this interval's run. A closing event
    /// is appended too, marking the interval's upper boundary.
    pub fn push_event(&mut self, event: BillingEvent) {
        self.events.push(event);
    }

    /// Record the unit types a billing event saw, across every interval the
    /// event touched. For a cancellation the walk passes the previous event's
    /// set, since a cancellation carries no section info of its own.
    pub fn observe_unit_types(&mut self, unit_types: &BTreeSet<String>) {
        self.seen_unit_types.extend(unit_types.iter().cloned());
    }

    /// Finalize the accumulator. `closed` records whether the usage section
    /// was dropped by a later event (true) or the timeline ended while the
    /// section was still active (false).
    pub fn build(self, closed: bool) -> InvoiceResult<FinalizedUsageInterval> {
        // A closed interval owns at least its opening and its boundary event
        let min_events = if closed { 2 } else { 1 };
        if self.events.len() < min_events {
            return Err(InvoiceError::EmptyInterval {
                usage_name: self.usage.name,
            });
        }
        Ok(FinalizedUsageInterval {
            usage: self.usage,
            usage_key: self.usage_key,
            account_id: self.account_id,
            invoice_id: self.invoice_id,
            subscription_id: self.subscription_id,
            target_date: self.target_date,
            raw_usage_start_date: self.raw_usage_start_date,
            events: self.events,
            seen_unit_types: self.seen_unit_types,
            closed,
        })
    }
}

/// A finalized interval: its event run and window are fixed, and it can be
/// reconciled. Never transitions back to open.
#[derive(Debug, Clone)]
pub struct FinalizedUsageInterval {
    usage: UsageDefinition,
    usage_key: UsageKey,
    account_id: AccountId,
    invoice_id: InvoiceId,
    subscription_id: SubscriptionId,
    target_date: Date,
    raw_usage_start_date: Date,
    events: Vec<BillingEvent>,
    seen_unit_types: BTreeSet<String>,
    closed: bool,
}

impl FinalizedUsageInterval {
    pub fn usage(&self) -> &UsageDefinition {
        &self.usage
    }

    pub fn usage_name(&self) -> &str {
        &self.usage.name
    }

    pub fn usage_key(&self) -> &UsageKey {
        &self.usage_key
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn events(&self) -> &[BillingEvent] {
        &self.events
    }

    /// Unit types observed across the run, including those carried over from
    /// sibling sections of the same billing events
    pub fn seen_unit_types(&self) -> &BTreeSet<String> {
        &self.seen_unit_types
    }

    fn window_start(&self) -> Date {
        self.events
            .first()
            .map(|event| event.effective_date)
            .unwrap_or(self.raw_usage_start_date)
    }

    fn last_event_date(&self) -> Date {
        self.events
            .last()
            .map(|event| event.effective_date)
            .unwrap_or(self.target_date)
    }

    /// Upper bound of the billable window: the closing event for a closed
    /// interval, the target date for one still active, both clipped to the
    /// target date.
    fn window_end(&self) -> Date {
        if self.closed {
            self.last_event_date().min(self.target_date)
        } else {
            self.target_date
        }
    }

    /// Billing-period buckets anchored at the interval's first event.
    ///
    /// An open interval bills only completed periods; a closed one also bills
    /// its final partial period up to the closing event date. Periods that end
    /// before the raw-usage history starts are not reportable and are skipped.
    fn billable_buckets(&self) -> Vec<(Date, Date)> {
        let window_end = self.window_end();
        let closing_date = self.last_event_date();
        let mut buckets = Vec::new();
        let mut cursor = self.window_start();
        while cursor < window_end {
            let next_boundary = self.usage.billing_period.advance(cursor);
            // The closing event truncates the final period; the target date
            // never does, it only defers billing to a later run.
            let bucket_end = if self.closed && next_boundary > closing_date {
                closing_date
            } else {
                next_boundary
            };
            if bucket_end > window_end {
                break;
            }
            if bucket_end > self.raw_usage_start_date {
                buckets.push((cursor, bucket_end));
            }
            cursor = next_boundary;
        }
        buckets
    }

    /// First period boundary strictly after `date`
    fn first_boundary_after(&self, date: Date) -> Date {
        let mut cursor = self.window_start();
        while cursor <= date {
            cursor = self.usage.billing_period.advance(cursor);
        }
        cursor
    }

    fn next_notification_date(&self) -> Option<Date> {
        if self.closed {
            let closing_date = self.last_event_date();
            if closing_date <= self.target_date {
                // Fully settled; nothing left to re-evaluate
                None
            } else {
                Some(self.first_boundary_after(self.target_date).min(closing_date))
            }
        } else {
            Some(self.first_boundary_after(self.target_date))
        }
    }

    /// Reconcile this interval's window against the already-issued items.
    ///
    /// A bucket already covered by an existing item is skipped, but the
    /// tracking ids of its records are still consumed so they are not later
    /// mistaken for unbilled.
    pub fn compute_missing_items(
        &self,
        raw_usage: &[RawUsageRecord],
        existing_items: &[InvoiceItem],
        existing_tracking_ids: &HashSet<TrackingId>,
        config: &InvoiceConfig,
    ) -> InvoiceResult<IntervalResult> {
        self.warn_on_undeclared_unit_types(raw_usage);

        let mut invoice_items = Vec::new();
        let mut tracking_ids: HashSet<TrackingId> = HashSet::new();

        for (bucket_start, bucket_end) in self.billable_buckets() {
            self.check_existing_items(existing_items, bucket_start, bucket_end)?;
            match self.usage.usage_type {
                UsageType::Consumable => self.reconcile_consumable_bucket(
                    raw_usage,
                    existing_items,
                    existing_tracking_ids,
                    config,
                    bucket_start,
                    bucket_end,
                    &mut invoice_items,
                    &mut tracking_ids,
                )?,
                UsageType::Capacity => self.reconcile_capacity_bucket(
                    raw_usage,
                    existing_items,
                    existing_tracking_ids,
                    config,
                    bucket_start,
                    bucket_end,
                    &mut invoice_items,
                    &mut tracking_ids,
                )?,
            }
        }

        Ok(IntervalResult {
            invoice_items,
            next_notification_date: self.next_notification_date(),
            tracking_ids,
        })
    }

    /// Records inside the window whose unit type no active section ever
    /// declared would go unbilled silently; surface them.
    fn warn_on_undeclared_unit_types(&self, raw_usage: &[RawUsageRecord]) {
        let window_start = self.window_start();
        let window_end = self.window_end();
        for record in raw_usage {
            if record.date >= window_start.max(self.raw_usage_start_date)
                && record.date < window_end
                && !self.seen_unit_types.contains(&record.unit_type)
            {
                warn!(
                    subscription_id = %self.subscription_id,
                    unit_type = %record.unit_type,
                    record_date = %record.date,
                    "raw usage references a unit type no active usage section declares"
                );
            }
        }
    }

    /// Existing items for a bucket must reference unit types the catalog
    /// still defines; anything else is inconsistent invoice data.
    fn check_existing_items(
        &self,
        existing_items: &[InvoiceItem],
        bucket_start: Date,
        bucket_end: Date,
    ) -> InvoiceResult<()> {
        for item in existing_items.iter().filter(|item| {
            item.usage_name == self.usage.name
                && item.period_start == bucket_start
                && item.period_end == bucket_end
        }) {
            if let Some(unit_type) = &item.unit_type {
                if !self.usage.bills_unit_type(unit_type) {
                    return Err(InvoiceError::UnknownItemUnitType {
                        item_id: item.id,
                        usage_name: self.usage.name.clone(),
                        unit_type: unit_type.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn bucket_records<'a>(
        &self,
        raw_usage: &'a [RawUsageRecord],
        bucket_start: Date,
        bucket_end: Date,
        unit_type: Option<&str>,
    ) -> Vec<&'a RawUsageRecord> {
        raw_usage
            .iter()
            .filter(|record| {
                record.date >= bucket_start
                    && record.date < bucket_end
                    && record.date >= self.raw_usage_start_date
                    && match unit_type {
                        Some(unit_type) => record.unit_type == unit_type,
                        None => self.usage.bills_unit_type(&record.unit_type),
                    }
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn reconcile_consumable_bucket(
        &self,
        raw_usage: &[RawUsageRecord],
        existing_items: &[InvoiceItem],
        existing_tracking_ids: &HashSet<TrackingId>,
        config: &InvoiceConfig,
        bucket_start: Date,
        bucket_end: Date,
        invoice_items: &mut Vec<InvoiceItem>,
        tracking_ids: &mut HashSet<TrackingId>,
    ) -> InvoiceResult<()> {
        for unit_type in &self.usage.unit_types {
            let records =
                self.bucket_records(raw_usage, bucket_start, bucket_end, Some(unit_type));
            if records.is_empty() {
                continue;
            }

            let rate_cents = self.usage.consumable_rate_cents(unit_type)?;
            let quantity: i64 = records.iter().map(|record| record.quantity).sum();

            tracking_ids.extend(
                records
                    .iter()
                    .map(|record| record.tracking_id())
                    .filter(|id| !existing_tracking_ids.contains(id)),
            );

            let covered = existing_items.iter().any(|item| {
                item.covers(&self.usage.name, Some(unit_type), bucket_start, bucket_end)
            });
            if covered {
                debug!(
                    usage_name = %self.usage.name,
                    unit_type = %unit_type,
                    period_start = %bucket_start,
                    period_end = %bucket_end,
                    "bucket already invoiced, skipping"
                );
                continue;
            }
            if quantity <= 0 {
                continue;
            }

            let item_details = match config.detail_mode {
                UsageDetailMode::Detail => Some(json!({
                    "unit_type": unit_type,
                    "records": records.len(),
                    "rate_cents": rate_cents,
                })),
                UsageDetailMode::Aggregate => None,
            };
            invoice_items.push(InvoiceItem {
                id: Uuid::new_v4(),
                account_id: self.account_id,
                invoice_id: self.invoice_id,
                subscription_id: self.subscription_id,
                usage_name: self.usage.name.clone(),
                unit_type: Some(unit_type.clone()),
                period_start: bucket_start,
                period_end: bucket_end,
                quantity,
                rate_cents: Some(rate_cents),
                amount_cents: quantity.saturating_mul(rate_cents),
                item_details,
            });
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn reconcile_capacity_bucket(
        &self,
        raw_usage: &[RawUsageRecord],
        existing_items: &[InvoiceItem],
        existing_tracking_ids: &HashSet<TrackingId>,
        config: &InvoiceConfig,
        bucket_start: Date,
        bucket_end: Date,
        invoice_items: &mut Vec<InvoiceItem>,
        tracking_ids: &mut HashSet<TrackingId>,
    ) -> InvoiceResult<()> {
        let records = self.bucket_records(raw_usage, bucket_start, bucket_end, None);
        if records.is_empty() {
            return Ok(());
        }

        // Peak recorded quantity per unit type decides the tier
        let mut observed_maxima: BTreeMap<String, i64> = BTreeMap::new();
        for record in &records {
            let peak = observed_maxima.entry(record.unit_type.clone()).or_insert(0);
            *peak = (*peak).max(record.quantity);
        }
        let (tier_index, tier) =
            self.usage
                .capacity_tier(&observed_maxima, bucket_start, bucket_end)?;

        tracking_ids.extend(
            records
                .iter()
                .map(|record| record.tracking_id())
                .filter(|id| !existing_tracking_ids.contains(id)),
        );

        let covered = existing_items
            .iter()
            .any(|item| item.covers(&self.usage.name, None, bucket_start, bucket_end));
        if covered {
            debug!(
                usage_name = %self.usage.name,
                period_start = %bucket_start,
                period_end = %bucket_end,
                "bucket already invoiced, skipping"
            );
            return Ok(());
        }

        let item_details = match config.detail_mode {
            UsageDetailMode::Detail => Some(json!({
                "tier": tier_index + 1,
                "maxima": observed_maxima,
            })),
            UsageDetailMode::Aggregate => None,
        };
        invoice_items.push(InvoiceItem {
            id: Uuid::new_v4(),
            account_id: self.account_id,
            invoice_id: self.invoice_id,
            subscription_id: self.subscription_id,
            usage_name: self.usage.name.clone(),
            unit_type: None,
            period_start: bucket_start,
            period_end: bucket_end,
            quantity: 1,
            rate_cents: None,
            amount_cents: tier.recurring_cents,
            item_details,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{BillingPeriod, ConsumableRate};
    use std::collections::HashMap;
    use time::macros::{date, datetime};

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

    fn interval_for(events: Vec<BillingEvent>) -> ContiguousUsageInterval {
        let key = UsageKey::new("API-CALLS", datetime!(2024-01-01 00:00 UTC));
        let mut interval = ContiguousUsageInterval::new(
            api_calls_usage(),
            key,
            AccountId::new(),
            InvoiceId::new(),
            SubscriptionId::new(),
            date!(2024 - 03 - 01),
            date!(2024 - 01 - 01),
        );
        for event in events {
            interval.push_event(event);
        }
        interval
    }

    fn event(effective_date: Date, usages: Vec<UsageDefinition>) -> BillingEvent {
        BillingEvent::new(
            SubscriptionId::new(),
            effective_date,
            datetime!(2024-01-01 00:00 UTC),
            usages,
        )
    }

    #[test]
    fn test_usage_key_equality_is_instant_based_across_offsets() {
        let utc = UsageKey::new("API-CALLS", datetime!(2024-03-01 00:00 UTC));
        let offset = UsageKey::new("API-CALLS", datetime!(2024-03-01 02:00 +02:00));
        assert_eq!(utc, offset);

        let mut keyed: HashMap<UsageKey, u32> = HashMap::new();
        keyed.insert(utc, 1);
        keyed.insert(offset, 2);
        assert_eq!(keyed.len(), 1);
    }

    #[test]
    fn test_usage_key_distinguishes_catalog_versions() {
        let v1 = UsageKey::new("API-CALLS", datetime!(2024-01-01 00:00 UTC));
        let v2 = UsageKey::new("API-CALLS", datetime!(2024-06-01 00:00 UTC));
        assert_ne!(v1, v2);
    }

    #[test]
    fn test_closed_interval_requires_a_boundary_event() {
        let interval = interval_for(vec![event(date!(2024 - 01 - 01), vec![api_calls_usage()])]);
        assert!(matches!(
            interval.build(true),
            Err(InvoiceError::EmptyInterval { .. })
        ));
    }

    #[test]
    fn test_open_interval_with_one_event_finalizes() {
        let interval = interval_for(vec![event(date!(2024 - 01 - 01), vec![api_calls_usage()])]);
        let finalized = match interval.build(false) {
            Ok(finalized) => finalized,
            Err(err) => panic!("build failed: {err}"),
        };
        assert!(!finalized.is_closed());
    }

    #[test]
    fn test_buckets_anchor_at_first_event_and_stop_at_close() {
        let interval = interval_for(vec![
            event(date!(2024 - 01 - 15), vec![api_calls_usage()]),
            event(date!(2024 - 03 - 01), Vec::new()),
        ]);
        let finalized = match interval.build(true) {
            Ok(finalized) => finalized,
            Err(err) => panic!("build failed: {err}"),
        };
        assert_eq!(
            finalized.billable_buckets(),
            vec![
                (date!(2024 - 01 - 15), date!(2024 - 02 - 15)),
                (date!(2024 - 02 - 15), date!(2024 - 03 - 01)),
            ]
        );
        assert_eq!(finalized.next_notification_date(), None);
    }

    #[test]
    fn test_open_interval_bills_only_completed_periods() {
        let interval = interval_for(vec![event(date!(2024 - 01 - 15), vec![api_calls_usage()])]);
        let finalized = match interval.build(false) {
            Ok(finalized) => finalized,
            Err(err) => panic!("build failed: {err}"),
        };
        // Target date 2024-03-01 sits inside [02-15, 03-15); that period is
        // incomplete and must not be billed yet.
        assert_eq!(
            finalized.billable_buckets(),
            vec![(date!(2024 - 01 - 15), date!(2024 - 02 - 15))]
        );
        assert_eq!(
            finalized.next_notification_date(),
            Some(date!(2024 - 03 - 15))
        );
    }

    #[test]
    fn test_closed_interval_beyond_target_reports_next_date() {
        let interval = interval_for(vec![
            event(date!(2024 - 01 - 15), vec![api_calls_usage()]),
            event(date!(2024 - 03 - 10), Vec::new()),
        ]);
        let finalized = match interval.build(true) {
            Ok(finalized) => finalized,
            Err(err) => panic!("build failed: {err}"),
        };
        // Target 2024-03-01 precedes the closing date: the final partial
        // period [02-15, 03-10) is not yet billable.
        assert_eq!(
            finalized.billable_buckets(),
            vec![(date!(2024 - 01 - 15), date!(2024 - 02 - 15))]
        );
        assert_eq!(
            finalized.next_notification_date(),
            Some(date!(2024 - 03 - 10))
        );
    }
}
