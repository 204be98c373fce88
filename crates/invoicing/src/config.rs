//! Invoice generation configuration

use crate::items::UsageDetailMode;

/// Tunables for usage invoice generation
#[derive(Debug, Clone)]
pub struct InvoiceConfig {
    /// Whether produced items carry a per-unit breakdown payload
    pub detail_mode: UsageDetailMode,
}

impl Default for InvoiceConfig {
    fn default() -> Self {
        Self {
            detail_mode: UsageDetailMode::Aggregate,
        }
    }
}

impl InvoiceConfig {
    /// Load configuration from environment or use defaults
    pub fn from_env() -> Self {
        let detail_mode = match std::env::var("INVOICE_USAGE_DETAIL_MODE")
            .map(|v| v.to_lowercase())
            .ok()
            .as_deref()
        {
            Some("detail") => UsageDetailMode::Detail,
            _ => UsageDetailMode::Aggregate,
        };
        Self { detail_mode }
    }
}
