//! Deduction coordinator: reserve → external vendor call → commit/release.
//!
//! Guarantees at most one net deduction per logical request, keyed by the
//! caller-supplied correlation id. Reserve/commit/release for one user
//! serialize on a per-user async lock; different users never contend.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::ledger::{
    EntryReason, EntryStatus, LedgerEntry, LedgerEntryId, LedgerError, LedgerStore,
};
use crate::types::{Credits, UserId};

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Insufficient credits: required {required}, available {available}")]
    InsufficientCredits {
        required: Credits,
        available: Credits,
    },

    #[error("Reservation not found or already terminal: {id}")]
    ReservationNotFound { id: Uuid },

    #[error("Invalid credit amount: {amount}")]
    InvalidAmount { amount: Credits },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

pub type CoordinatorResult<T> = std::result::Result<T, CoordinatorError>;

/// A provisional, reversible hold on a user's balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub user_id: UserId,
    pub correlation_id: String,
    pub estimated_credits: Credits,
    pub ledger_entry_id: LedgerEntryId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitReceipt {
    /// Credits actually collected (may be below real cost; see `shortfall`).
    pub credits_charged: Credits,
    pub balance_after: Credits,
    /// Credits the balance could not cover; flagged for reconciliation.
    /// Zero for a clean commit. Never fails the request — the caller already
    /// received the response content.
    pub shortfall: Credits,
}

impl CommitReceipt {
    pub fn needs_reconciliation(&self) -> bool {
        self.shortfall > 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseReceipt {
    pub balance_after: Credits,
}

#[derive(Debug, Clone)]
enum ReservationState {
    Held,
    Committed(CommitReceipt),
    Released(ReleaseReceipt),
}

#[derive(Debug, Clone)]
struct ReservationSlot {
    reservation: Reservation,
    state: ReservationState,
}

pub struct DeductionCoordinator {
    ledger: Arc<dyn LedgerStore>,
    locks: DashMap<UserId, Arc<Mutex<()>>>,
    reservations: DashMap<Uuid, ReservationSlot>,
    by_correlation: DashMap<String, Uuid>,
}

impl std::fmt::Debug for DeductionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeductionCoordinator")
            .field("ledger", &self.ledger.name())
            .field("reservations", &self.reservations.len())
            .finish()
    }
}

impl DeductionCoordinator {
    pub fn new(ledger: Arc<dyn LedgerStore>) -> Self {
        Self {
            ledger,
            locks: DashMap::new(),
            reservations: DashMap::new(),
            by_correlation: DashMap::new(),
        }
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerStore> {
        &self.ledger
    }

    fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn existing_for(&self, correlation_id: &str) -> Option<Reservation> {
        let id = *self.by_correlation.get(correlation_id)?;
        self.reservations.get(&id).map(|s| s.reservation.clone())
    }

    /// Hold `estimated_credits` against the user's balance.
    ///
    /// Idempotent: a retry with the same correlation id returns the existing
    /// reservation without a second decrement. Rejection leaves no ledger
    /// entry behind.
    pub async fn reserve(
        &self,
        user_id: &str,
        correlation_id: &str,
        estimated_credits: Credits,
    ) -> CoordinatorResult<Reservation> {
        if estimated_credits < 0 {
            return Err(CoordinatorError::InvalidAmount {
                amount: estimated_credits,
            });
        }
        if let Some(existing) = self.existing_for(correlation_id) {
            return Ok(existing);
        }

        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        // Re-check: a concurrent retry may have won the lock first.
        if let Some(existing) = self.existing_for(correlation_id) {
            return Ok(existing);
        }

        let balance = self.ledger.balance(user_id).await?;
        if balance < estimated_credits {
            return Err(CoordinatorError::InsufficientCredits {
                required: estimated_credits,
                available: balance,
            });
        }

        let entry = LedgerEntry::new(
            user_id,
            -estimated_credits,
            balance,
            EntryReason::Usage,
            EntryStatus::Pending,
        )
        .with_correlation(correlation_id);

        let entry = match self.ledger.append(entry).await {
            Ok(entry) => entry,
            // The ledger outlives this process: rebuild the in-memory slot
            // from the persisted entry instead of double-charging.
            Err(LedgerError::DuplicateCorrelation { .. }) => {
                return self.recover(user_id, correlation_id).await;
            }
            Err(e) => return Err(e.into()),
        };

        let reservation = Reservation {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            correlation_id: correlation_id.to_string(),
            estimated_credits,
            ledger_entry_id: entry.id,
            created_at: entry.created_at,
        };
        self.register(reservation.clone(), ReservationState::Held);

        tracing::debug!(
            user_id,
            correlation_id,
            estimated_credits,
            balance_after = entry.balance_after,
            "reserved credits"
        );
        Ok(reservation)
    }

    async fn recover(
        &self,
        user_id: &str,
        correlation_id: &str,
    ) -> CoordinatorResult<Reservation> {
        let entry = self
            .ledger
            .find_by_correlation(correlation_id)
            .await?
            .ok_or_else(|| {
                CoordinatorError::Ledger(LedgerError::Storage {
                    message: format!("correlation '{correlation_id}' indexed but entry missing"),
                })
            })?;

        let reservation = Reservation {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            correlation_id: correlation_id.to_string(),
            estimated_credits: -entry.amount,
            ledger_entry_id: entry.id,
            created_at: entry.created_at,
        };
        let balance = self.ledger.balance(user_id).await?;
        let state = match entry.status {
            EntryStatus::Pending => ReservationState::Held,
            EntryStatus::Committed => ReservationState::Committed(CommitReceipt {
                credits_charged: -entry.amount,
                balance_after: balance,
                shortfall: 0,
            }),
            EntryStatus::Reversed => ReservationState::Released(ReleaseReceipt {
                balance_after: balance,
            }),
        };
        tracing::debug!(user_id, correlation_id, "recovered reservation from ledger");
        self.register(reservation.clone(), state);
        Ok(reservation)
    }

    fn register(&self, reservation: Reservation, state: ReservationState) {
        self.by_correlation
            .insert(reservation.correlation_id.clone(), reservation.id);
        self.reservations.insert(
            reservation.id,
            ReservationSlot { reservation, state },
        );
    }

    /// Settle a reservation against actual usage.
    ///
    /// Below-estimate actuals release the unused hold; above-estimate actuals
    /// charge whatever the balance covers and flag the rest for
    /// reconciliation. Calling commit again returns the original receipt.
    pub async fn commit(
        &self,
        reservation_id: Uuid,
        actual_credits: Credits,
    ) -> CoordinatorResult<CommitReceipt> {
        if actual_credits < 0 {
            return Err(CoordinatorError::InvalidAmount {
                amount: actual_credits,
            });
        }

        let reservation = self
            .reservations
            .get(&reservation_id)
            .map(|s| s.reservation.clone())
            .ok_or(CoordinatorError::ReservationNotFound { id: reservation_id })?;

        let lock = self.user_lock(&reservation.user_id);
        let _guard = lock.lock().await;

        match self
            .reservations
            .get(&reservation_id)
            .map(|s| s.state.clone())
        {
            Some(ReservationState::Held) => {}
            Some(ReservationState::Committed(receipt)) => return Ok(receipt),
            Some(ReservationState::Released(_)) | None => {
                return Err(CoordinatorError::ReservationNotFound { id: reservation_id });
            }
        }

        let estimate = reservation.estimated_credits;
        let receipt = if actual_credits <= estimate {
            let (_, balance) = self
                .ledger
                .settle(
                    &reservation.ledger_entry_id,
                    -actual_credits,
                    EntryStatus::Committed,
                )
                .await?;
            CommitReceipt {
                credits_charged: actual_credits,
                balance_after: balance,
                shortfall: 0,
            }
        } else {
            // Overrun: generous max-token settings or cache pricing pushed
            // actuals past the hold. Collect what the balance allows.
            let overrun = actual_credits - estimate;
            let available = self.ledger.balance(&reservation.user_id).await?.max(0);
            let collected = overrun.min(available);
            let charged = estimate + collected;
            let shortfall = overrun - collected;

            let (_, balance) = self
                .ledger
                .settle(&reservation.ledger_entry_id, -charged, EntryStatus::Committed)
                .await?;

            if shortfall > 0 {
                tracing::warn!(
                    user_id = %reservation.user_id,
                    correlation_id = %reservation.correlation_id,
                    shortfall,
                    "commit exceeded reservation and balance; flagged for reconciliation"
                );
            }
            CommitReceipt {
                credits_charged: charged,
                balance_after: balance,
                shortfall,
            }
        };

        if let Some(mut slot) = self.reservations.get_mut(&reservation_id) {
            slot.state = ReservationState::Committed(receipt.clone());
        }
        tracing::debug!(
            user_id = %reservation.user_id,
            correlation_id = %reservation.correlation_id,
            credits_charged = receipt.credits_charged,
            balance_after = receipt.balance_after,
            "committed deduction"
        );
        Ok(receipt)
    }

    /// Reverse a full reservation: the vendor call never ran or failed before
    /// producing output. Net effect on the balance is zero.
    pub async fn release(&self, reservation_id: Uuid) -> CoordinatorResult<ReleaseReceipt> {
        let reservation = self
            .reservations
            .get(&reservation_id)
            .map(|s| s.reservation.clone())
            .ok_or(CoordinatorError::ReservationNotFound { id: reservation_id })?;

        let lock = self.user_lock(&reservation.user_id);
        let _guard = lock.lock().await;

        match self
            .reservations
            .get(&reservation_id)
            .map(|s| s.state.clone())
        {
            Some(ReservationState::Held) => {}
            Some(ReservationState::Released(receipt)) => return Ok(receipt),
            Some(ReservationState::Committed(_)) | None => {
                return Err(CoordinatorError::ReservationNotFound { id: reservation_id });
            }
        }

        // The original hold keeps its amount under a Reversed status; the
        // refund is a separate compensating entry, so the entry sum still
        // matches the balance.
        self.ledger
            .settle(
                &reservation.ledger_entry_id,
                -reservation.estimated_credits,
                EntryStatus::Reversed,
            )
            .await?;

        let balance = self.ledger.balance(&reservation.user_id).await?;
        let compensating = LedgerEntry::new(
            reservation.user_id.clone(),
            reservation.estimated_credits,
            balance,
            EntryReason::Reversal,
            EntryStatus::Committed,
        );
        let compensating = self.ledger.append(compensating).await?;

        let receipt = ReleaseReceipt {
            balance_after: compensating.balance_after,
        };
        if let Some(mut slot) = self.reservations.get_mut(&reservation_id) {
            slot.state = ReservationState::Released(receipt.clone());
        }
        tracing::debug!(
            user_id = %reservation.user_id,
            correlation_id = %reservation.correlation_id,
            released = reservation.estimated_credits,
            "released reservation"
        );
        Ok(receipt)
    }

    /// Grant credits (renewal or tier-change allocation event) and stamp the
    /// new allocation period.
    pub async fn allocate(
        &self,
        user_id: &str,
        credits: Credits,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> CoordinatorResult<LedgerEntry> {
        if credits <= 0 {
            return Err(CoordinatorError::InvalidAmount { amount: credits });
        }
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let balance = self.ledger.balance(user_id).await?;
        let entry = LedgerEntry::new(
            user_id,
            credits,
            balance,
            EntryReason::Allocation,
            EntryStatus::Committed,
        );
        let entry = self.ledger.append(entry).await?;
        self.ledger
            .set_period(user_id, period_start, period_end)
            .await?;
        tracing::debug!(user_id, credits, "allocated credits");
        Ok(entry)
    }

    /// Manual operator correction, positive or negative.
    pub async fn adjust(&self, user_id: &str, amount: Credits) -> CoordinatorResult<LedgerEntry> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let balance = self.ledger.balance(user_id).await?;
        let entry = LedgerEntry::new(
            user_id,
            amount,
            balance,
            EntryReason::AdminAdjustment,
            EntryStatus::Committed,
        );
        Ok(self.ledger.append(entry).await?)
    }

    /// Collect an outstanding reconciliation shortfall, all or nothing.
    ///
    /// Returns the credits collected: the full amount, or zero when the
    /// balance cannot cover it yet. The correlation id makes re-runs
    /// idempotent — a duplicate means a previous run already collected.
    pub async fn collect_debt(
        &self,
        user_id: &str,
        correlation_id: &str,
        amount: Credits,
    ) -> CoordinatorResult<Credits> {
        if amount <= 0 {
            return Err(CoordinatorError::InvalidAmount { amount });
        }
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let balance = self.ledger.balance(user_id).await?;
        if balance < amount {
            return Ok(0);
        }

        let entry = LedgerEntry::new(
            user_id,
            -amount,
            balance,
            EntryReason::Usage,
            EntryStatus::Committed,
        )
        .with_correlation(correlation_id);

        match self.ledger.append(entry).await {
            Ok(_) => {
                tracing::debug!(user_id, correlation_id, amount, "collected reconciliation debt");
                Ok(amount)
            }
            Err(LedgerError::DuplicateCorrelation { .. }) => {
                tracing::debug!(user_id, correlation_id, "debt already collected");
                Ok(amount)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn reservation(&self, id: Uuid) -> Option<Reservation> {
        self.reservations.get(&id).map(|s| s.reservation.clone())
    }

    /// Sum of estimates on reservations still held, excluding anything
    /// already committed or released.
    pub fn held_credits(&self) -> Credits {
        self.reservations
            .iter()
            .filter(|slot| matches!(slot.state, ReservationState::Held))
            .map(|slot| slot.reservation.estimated_credits)
            .sum()
    }

    /// Drop terminal reservation slots older than `retention`, so the
    /// in-memory maps do not grow with request history. Held reservations are
    /// never dropped. A retry arriving after its slot was pruned still
    /// resolves idempotently through the ledger's correlation index.
    pub fn prune_terminal(&self, retention: chrono::Duration) -> usize {
        let cutoff = Utc::now() - retention;
        let mut removed = 0;
        self.reservations.retain(|_, slot| {
            let keep = matches!(slot.state, ReservationState::Held)
                || slot.reservation.created_at > cutoff;
            if !keep {
                self.by_correlation.remove(&slot.reservation.correlation_id);
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            tracing::debug!(removed, "pruned terminal reservations");
        }
        removed
    }
}
