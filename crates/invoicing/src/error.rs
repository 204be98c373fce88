//! Invoicing error types

use thiserror::Error;
use time::Date;
use uuid::Uuid;

/// Errors surfaced by the usage reconciliation core
///
/// Catalog and invoice-data errors abort the whole per-subscription run; the
/// caller retries the run after fixing the catalog or the stored items. No
/// partial results are returned.
#[derive(Debug, Error)]
pub enum InvoiceError {
    #[error("no consumable rate for unit type '{unit_type}' in usage section '{usage_name}'")]
    MissingUnitRate { usage_name: String, unit_type: String },

    #[error("no capacity tier of usage section '{usage_name}' covers recorded usage for {period_start} - {period_end}")]
    NoCapacityTier {
        usage_name: String,
        period_start: Date,
        period_end: Date,
    },

    #[error("existing invoice item {item_id} references unit type '{unit_type}' not defined by usage section '{usage_name}'")]
    UnknownItemUnitType {
        item_id: Uuid,
        usage_name: String,
        unit_type: String,
    },

    #[error("no billing events supplied for the subscription")]
    NoBillingEvents,

    #[error("usage interval for '{usage_name}' finalized with too few billing events")]
    EmptyInterval { usage_name: String },
}

impl InvoiceError {
    /// Whether this error stems from catalog configuration (fix the catalog,
    /// then retry the run) as opposed to inconsistent invoice data.
    pub fn is_catalog_error(&self) -> bool {
        matches!(
            self,
            InvoiceError::MissingUnitRate { .. } | InvoiceError::NoCapacityTier { .. }
        )
    }
}

pub type InvoiceResult<T> = Result<T, InvoiceError>;
