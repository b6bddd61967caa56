use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cost::CostBreakdown;
use crate::ledger::LedgerEntryId;
use crate::types::{Credits, UserId, VendorUsage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageStatus {
    /// Vendor call completed and the response was delivered.
    Success,
    /// Vendor call failed before producing output; the hold was released.
    Failed,
    /// Stream aborted mid-response; delivered tokens were still charged.
    Partial,
}

impl UsageStatus {
    /// Whether any output reached the caller, and therefore whether credits
    /// were committed rather than released.
    pub fn is_billable(&self) -> bool {
        !matches!(self, Self::Failed)
    }
}

/// Immutable audit record of one metered request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    /// Caller-supplied request id; unique across all records.
    pub request_id: String,
    pub user_id: UserId,
    pub provider: String,
    pub model: String,
    pub tier: String,
    pub usage: VendorUsage,
    pub credits_charged: Credits,
    /// Raw vendor cost before margin, in cents.
    pub vendor_cost_cents: Decimal,
    pub margin_applied: Decimal,
    pub status: UsageStatus,
    /// Credits the commit could not collect; cleared by reconciliation.
    pub shortfall: Credits,
    /// The ledger entry this request settled against, for analytics and
    /// reconciliation joins.
    pub ledger_entry_id: Option<LedgerEntryId>,
    pub reconciled_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl UsageRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        request_id: impl Into<String>,
        user_id: impl Into<UserId>,
        provider: impl Into<String>,
        model: impl Into<String>,
        tier: impl Into<String>,
        usage: VendorUsage,
        breakdown: CostBreakdown,
        status: UsageStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            request_id: request_id.into(),
            user_id: user_id.into(),
            provider: provider.into(),
            model: model.into(),
            tier: tier.into(),
            usage,
            credits_charged: breakdown.total(),
            vendor_cost_cents: breakdown.vendor_cost_cents,
            margin_applied: breakdown.margin_applied,
            status,
            shortfall: 0,
            ledger_entry_id: None,
            reconciled_at: None,
            started_at: now,
            completed_at: now,
        }
    }

    pub fn with_charged(mut self, credits_charged: Credits, shortfall: Credits) -> Self {
        self.credits_charged = credits_charged;
        self.shortfall = shortfall;
        self
    }

    pub fn with_ledger_entry(mut self, ledger_entry_id: LedgerEntryId) -> Self {
        self.ledger_entry_id = Some(ledger_entry_id);
        self
    }

    /// Actual request lifespan; `new` stamps both ends with the write time.
    pub fn with_timing(mut self, started_at: DateTime<Utc>, completed_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self.completed_at = completed_at;
        self
    }

    pub fn needs_reconciliation(&self) -> bool {
        self.shortfall > 0 && self.reconciled_at.is_none()
    }
}
