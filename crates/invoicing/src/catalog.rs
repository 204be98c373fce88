//! Catalog usage definitions
//!
//! In-memory view of the catalog data the reconciliation core consumes: which
//! usage sections a plan bills, how often, and at what price. The catalog
//! itself (plan documents, version history) lives outside this crate; billing
//! events carry the definitions in force at each point of the timeline.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::{Date, Duration, Month};

use crate::error::{InvoiceError, InvoiceResult};

/// When a usage section is billed relative to consumption
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingMode {
    /// Billed ahead of consumption; not processed by this core
    InAdvance,
    /// Billed after the fact, once actual usage is known
    InArrear,
}

/// How a usage section aggregates metered quantities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageType {
    /// Step pricing on the peak recorded quantity per period
    Capacity,
    /// Per-unit pricing on the total recorded quantity per period
    Consumable,
}

/// Billing period of a usage section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingPeriod {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Annual,
}

impl BillingPeriod {
    /// Next period boundary after `date`.
    ///
    /// Month-based periods clamp to the last day of a shorter target month,
    /// so Jan 31 + 1 month = Feb 28 (or 29).
    pub fn advance(&self, date: Date) -> Date {
        match self {
            BillingPeriod::Daily => date.saturating_add(Duration::days(1)),
            BillingPeriod::Weekly => date.saturating_add(Duration::weeks(1)),
            BillingPeriod::Monthly => add_months(date, 1),
            BillingPeriod::Quarterly => add_months(date, 3),
            BillingPeriod::Annual => add_months(date, 12),
        }
    }
}

/// Add whole months to a date, clamping the day to the target month's length
fn add_months(date: Date, months: i32) -> Date {
    let zero_based = date.year() * 12 + (date.month() as i32 - 1) + months;
    let year = zero_based.div_euclid(12);
    let month = Month::try_from((zero_based.rem_euclid(12) + 1) as u8).unwrap_or(date.month());
    let day = date.day().min(time::util::days_in_year_month(year, month));
    Date::from_calendar_date(year, month, day).unwrap_or(date)
}

/// Per-unit price for a consumable usage section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumableRate {
    pub unit_type: String,
    /// Price per metered unit, in cents
    pub per_unit_cents: i64,
}

/// Ceiling for one unit type within a capacity tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitLimit {
    pub unit_type: String,
    pub max: i64,
}

/// One capacity tier: per-unit ceilings and the recurring price when selected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityTier {
    pub limits: Vec<UnitLimit>,
    /// Recurring price per billing period, in cents
    pub recurring_cents: i64,
}

impl CapacityTier {
    /// Whether this tier covers every observed per-unit maximum
    pub fn covers(&self, observed_maxima: &BTreeMap<String, i64>) -> bool {
        observed_maxima.iter().all(|(unit_type, max_used)| {
            self.limits
                .iter()
                .any(|limit| &limit.unit_type == unit_type && *max_used <= limit.max)
        })
    }
}

/// Pricing strategy of a usage section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UsagePricing {
    Consumable { rates: Vec<ConsumableRate> },
    Capacity { tiers: Vec<CapacityTier> },
}

/// One usage section as defined by a catalog version
///
/// The name identifies the section within a catalog version; the same name
/// under a different catalog version is a logically distinct section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageDefinition {
    pub name: String,
    pub billing_mode: BillingMode,
    pub usage_type: UsageType,
    pub billing_period: BillingPeriod,
    /// Unit types this section bills
    pub unit_types: Vec<String>,
    pub pricing: UsagePricing,
}

impl UsageDefinition {
    /// Consumable in-arrear section; unit types derive from the rate card
    pub fn consumable(
        name: impl Into<String>,
        billing_period: BillingPeriod,
        rates: Vec<ConsumableRate>,
    ) -> Self {
        let unit_types = rates.iter().map(|r| r.unit_type.clone()).collect();
        Self {
            name: name.into(),
            billing_mode: BillingMode::InArrear,
            usage_type: UsageType::Consumable,
            billing_period,
            unit_types,
            pricing: UsagePricing::Consumable { rates },
        }
    }

    /// Capacity in-arrear section; unit types derive from the tier limits
    pub fn capacity(
        name: impl Into<String>,
        billing_period: BillingPeriod,
        tiers: Vec<CapacityTier>,
    ) -> Self {
        let mut unit_types: Vec<String> = Vec::new();
        for tier in &tiers {
            for limit in &tier.limits {
                if !unit_types.contains(&limit.unit_type) {
                    unit_types.push(limit.unit_type.clone());
                }
            }
        }
        Self {
            name: name.into(),
            billing_mode: BillingMode::InArrear,
            usage_type: UsageType::Capacity,
            billing_period,
            unit_types,
            pricing: UsagePricing::Capacity { tiers },
        }
    }

    /// Whether this section declares the given unit type
    pub fn bills_unit_type(&self, unit_type: &str) -> bool {
        self.unit_types.iter().any(|u| u == unit_type)
    }

    /// Per-unit rate for a consumable section.
    ///
    /// A declared unit type with no rate is a catalog configuration error.
    pub fn consumable_rate_cents(&self, unit_type: &str) -> InvoiceResult<i64> {
        let rates = match &self.pricing {
            UsagePricing::Consumable { rates } => rates,
            UsagePricing::Capacity { .. } => {
                return Err(InvoiceError::MissingUnitRate {
                    usage_name: self.name.clone(),
                    unit_type: unit_type.to_string(),
                })
            }
        };
        rates
            .iter()
            .find(|rate| rate.unit_type == unit_type)
            .map(|rate| rate.per_unit_cents)
            .ok_or_else(|| InvoiceError::MissingUnitRate {
                usage_name: self.name.clone(),
                unit_type: unit_type.to_string(),
            })
    }

    /// Lowest capacity tier covering the observed per-unit maxima.
    ///
    /// Returns the tier's index alongside it for detail reporting. Usage
    /// exceeding every tier is a catalog configuration error.
    pub fn capacity_tier(
        &self,
        observed_maxima: &BTreeMap<String, i64>,
        period_start: Date,
        period_end: Date,
    ) -> InvoiceResult<(usize, &CapacityTier)> {
        let tiers: &[CapacityTier] = match &self.pricing {
            UsagePricing::Capacity { tiers } => tiers,
            UsagePricing::Consumable { .. } => &[],
        };
        tiers
            .iter()
            .enumerate()
            .find(|(_, tier)| tier.covers(observed_maxima))
            .ok_or(InvoiceError::NoCapacityTier {
                usage_name: self.name.clone(),
                period_start,
                period_end,
            })
    }
}
