use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Credits, UserId};

pub type LedgerEntryId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryReason {
    /// Credits granted by a renewal, tier change, or promotion.
    Allocation,
    /// Credits deducted for a metered vendor request.
    Usage,
    /// Compensating entry releasing a held reservation.
    Reversal,
    /// Manual correction by an operator.
    AdminAdjustment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Reservation hold; amount is an estimate awaiting settlement.
    Pending,
    Committed,
    Reversed,
}

impl EntryStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// One balance-affecting event. `amount` is signed: deductions are negative.
///
/// `balance_before`/`balance_after` snapshot the cached balance at append
/// time. `correlation_id` ties the entry to exactly one logical request and is
/// unique across the ledger when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub user_id: UserId,
    pub amount: Credits,
    pub balance_before: Credits,
    pub balance_after: Credits,
    pub reason: EntryReason,
    pub correlation_id: Option<String>,
    pub status: EntryStatus,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(
        user_id: impl Into<UserId>,
        amount: Credits,
        balance_before: Credits,
        reason: EntryReason,
        status: EntryStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            amount,
            balance_before,
            balance_after: balance_before + amount,
            reason,
            correlation_id: None,
            status,
            created_at: Utc::now(),
        }
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Point-in-time balance summary for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceView {
    /// Credits allocated within the current period.
    pub total: Credits,
    /// Credits consumed by usage within the current period, holds included.
    pub used: Credits,
    /// Spendable balance right now (may include carry-over from prior periods).
    pub remaining: Credits,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
}
