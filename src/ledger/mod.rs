//! Append-only credit ledger.
//!
//! Every balance-affecting event is a [`LedgerEntry`]; the per-user balance is
//! a materialized cache of the entry sum, never a second source of truth.
//! Entries reach a terminal status once and are never mutated afterwards — a
//! reversal is a new compensating entry.

mod entry;
mod store;

pub use entry::{BalanceView, EntryReason, EntryStatus, LedgerEntry, LedgerEntryId};
pub use store::{LedgerStore, MemoryLedgerStore};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Ledger entry not found: {id}")]
    NotFound { id: uuid::Uuid },

    #[error("An entry already exists for correlation id '{correlation_id}'")]
    DuplicateCorrelation { correlation_id: String },

    #[error("Entry {id} is already settled and cannot change")]
    AlreadySettled { id: uuid::Uuid },

    #[error("Storage error: {message}")]
    Storage { message: String },
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let id = uuid::Uuid::new_v4();
        let err = LedgerError::NotFound { id };
        assert!(err.to_string().contains(&id.to_string()));
    }
}
