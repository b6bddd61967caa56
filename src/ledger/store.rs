//! Ledger storage backends.
//!
//! The store applies entries and maintains the cached balance; callers are
//! responsible for per-user serialization (see the deduction coordinator).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::entry::{BalanceView, EntryReason, EntryStatus, LedgerEntry, LedgerEntryId};
use super::{LedgerError, LedgerResult};
use crate::types::{Credits, UserId};

#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
    fn name(&self) -> &str;

    /// Append an entry and apply its amount to the cached balance.
    ///
    /// Rejects a duplicate `correlation_id`: that uniqueness is what makes
    /// retries and re-run jobs idempotent.
    async fn append(&self, entry: LedgerEntry) -> LedgerResult<LedgerEntry>;

    /// Move a pending entry to a terminal status, adjusting its amount to the
    /// settled value and applying the difference to the balance. Returns the
    /// updated entry and the current balance.
    async fn settle(
        &self,
        id: &LedgerEntryId,
        final_amount: Credits,
        status: EntryStatus,
    ) -> LedgerResult<(LedgerEntry, Credits)>;

    async fn get(&self, id: &LedgerEntryId) -> LedgerResult<Option<LedgerEntry>>;

    async fn find_by_correlation(&self, correlation_id: &str)
    -> LedgerResult<Option<LedgerEntry>>;

    async fn balance(&self, user_id: &str) -> LedgerResult<Credits>;

    async fn balance_view(&self, user_id: &str) -> LedgerResult<BalanceView>;

    async fn entries(&self, user_id: &str) -> LedgerResult<Vec<LedgerEntry>>;

    /// Stamp the current allocation period, set when an allocation lands.
    async fn set_period(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> LedgerResult<()>;

    /// Audit: recompute the balance from the entry sum. Must always equal
    /// [`LedgerStore::balance`].
    async fn recompute_balance(&self, user_id: &str) -> LedgerResult<Credits>;
}

#[derive(Debug, Default)]
struct UserLedger {
    balance: Credits,
    entries: Vec<LedgerEntry>,
    period: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

#[derive(Debug, Default)]
struct Inner {
    users: HashMap<UserId, UserLedger>,
    by_correlation: HashMap<String, LedgerEntryId>,
    entry_owner: HashMap<LedgerEntryId, UserId>,
}

/// In-memory ledger (testing and single-instance deployments).
#[derive(Debug, Default, Clone)]
pub struct MemoryLedgerStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn user_count(&self) -> usize {
        self.inner.read().await.users.len()
    }
}

#[async_trait::async_trait]
impl LedgerStore for MemoryLedgerStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn append(&self, entry: LedgerEntry) -> LedgerResult<LedgerEntry> {
        let mut inner = self.inner.write().await;

        if let Some(correlation_id) = &entry.correlation_id {
            if inner.by_correlation.contains_key(correlation_id) {
                return Err(LedgerError::DuplicateCorrelation {
                    correlation_id: correlation_id.clone(),
                });
            }
            inner
                .by_correlation
                .insert(correlation_id.clone(), entry.id);
        }

        inner.entry_owner.insert(entry.id, entry.user_id.clone());
        let ledger = inner.users.entry(entry.user_id.clone()).or_default();
        ledger.balance += entry.amount;
        ledger.entries.push(entry.clone());
        Ok(entry)
    }

    async fn settle(
        &self,
        id: &LedgerEntryId,
        final_amount: Credits,
        status: EntryStatus,
    ) -> LedgerResult<(LedgerEntry, Credits)> {
        let mut inner = self.inner.write().await;

        let user_id = inner
            .entry_owner
            .get(id)
            .cloned()
            .ok_or(LedgerError::NotFound { id: *id })?;
        let ledger = inner
            .users
            .get_mut(&user_id)
            .ok_or(LedgerError::NotFound { id: *id })?;
        let entry = ledger
            .entries
            .iter_mut()
            .find(|e| e.id == *id)
            .ok_or(LedgerError::NotFound { id: *id })?;

        if entry.status.is_terminal() {
            return Err(LedgerError::AlreadySettled { id: *id });
        }

        let delta = final_amount - entry.amount;
        entry.amount = final_amount;
        entry.balance_after = entry.balance_before + final_amount;
        entry.status = status;
        let updated = entry.clone();

        ledger.balance += delta;
        Ok((updated, ledger.balance))
    }

    async fn get(&self, id: &LedgerEntryId) -> LedgerResult<Option<LedgerEntry>> {
        let inner = self.inner.read().await;
        let Some(user_id) = inner.entry_owner.get(id) else {
            return Ok(None);
        };
        Ok(inner
            .users
            .get(user_id)
            .and_then(|l| l.entries.iter().find(|e| e.id == *id))
            .cloned())
    }

    async fn find_by_correlation(
        &self,
        correlation_id: &str,
    ) -> LedgerResult<Option<LedgerEntry>> {
        let inner = self.inner.read().await;
        let Some(id) = inner.by_correlation.get(correlation_id).copied() else {
            return Ok(None);
        };
        let Some(user_id) = inner.entry_owner.get(&id) else {
            return Ok(None);
        };
        Ok(inner
            .users
            .get(user_id)
            .and_then(|l| l.entries.iter().find(|e| e.id == id))
            .cloned())
    }

    async fn balance(&self, user_id: &str) -> LedgerResult<Credits> {
        let inner = self.inner.read().await;
        Ok(inner.users.get(user_id).map(|l| l.balance).unwrap_or(0))
    }

    async fn balance_view(&self, user_id: &str) -> LedgerResult<BalanceView> {
        let inner = self.inner.read().await;
        let Some(ledger) = inner.users.get(user_id) else {
            return Ok(BalanceView {
                total: 0,
                used: 0,
                remaining: 0,
                period_start: None,
                period_end: None,
            });
        };

        let in_period = |e: &LedgerEntry| match ledger.period {
            Some((start, _)) => e.created_at >= start,
            None => true,
        };

        let total = ledger
            .entries
            .iter()
            .filter(|e| e.reason == EntryReason::Allocation && in_period(e))
            .map(|e| e.amount)
            .sum();
        // Usage holds/charges net against their reversal entries.
        let used = -ledger
            .entries
            .iter()
            .filter(|e| {
                matches!(e.reason, EntryReason::Usage | EntryReason::Reversal) && in_period(e)
            })
            .map(|e| e.amount)
            .sum::<Credits>();

        Ok(BalanceView {
            total,
            used,
            remaining: ledger.balance,
            period_start: ledger.period.map(|(s, _)| s),
            period_end: ledger.period.map(|(_, e)| e),
        })
    }

    async fn entries(&self, user_id: &str) -> LedgerResult<Vec<LedgerEntry>> {
        let inner = self.inner.read().await;
        Ok(inner
            .users
            .get(user_id)
            .map(|l| l.entries.clone())
            .unwrap_or_default())
    }

    async fn set_period(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let mut inner = self.inner.write().await;
        inner.users.entry(user_id.to_string()).or_default().period = Some((start, end));
        Ok(())
    }

    async fn recompute_balance(&self, user_id: &str) -> LedgerResult<Credits> {
        let inner = self.inner.read().await;
        Ok(inner
            .users
            .get(user_id)
            .map(|l| l.entries.iter().map(|e| e.amount).sum())
            .unwrap_or(0))
    }
}
