//! Usage records and shortfall reconciliation.
//!
//! One record per metered request, written once at terminal time (commit or
//! failure) and keyed by the caller's request id. Records whose commit left a
//! shortfall stay outstanding until a reconciliation run collects the debt.

mod record;
mod store;

pub use record::{UsageRecord, UsageStatus};
pub use store::{MemoryUsageStore, UsageStore};

use std::sync::Arc;

use thiserror::Error;

use crate::coordinator::{CoordinatorError, DeductionCoordinator};

#[derive(Error, Debug)]
pub enum UsageError {
    #[error("A usage record already exists for request '{request_id}'")]
    Duplicate { request_id: String },

    #[error("Usage record not found: '{request_id}'")]
    NotFound { request_id: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

pub type UsageResult<T> = std::result::Result<T, UsageError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconciliationReport {
    /// Outstanding shortfall records examined this run.
    pub examined: usize,
    /// Records whose debt was collected in full.
    pub collected: usize,
    /// Records still waiting for balance to cover them.
    pub remaining: usize,
}

/// Periodic job that collects commit shortfalls once balances can cover them.
///
/// Collection is all or nothing per record, and the derived correlation id
/// makes a re-run after a crash collect each debt at most once.
pub struct Reconciler {
    coordinator: Arc<DeductionCoordinator>,
    store: Arc<dyn UsageStore>,
}

impl Reconciler {
    pub fn new(coordinator: Arc<DeductionCoordinator>, store: Arc<dyn UsageStore>) -> Self {
        Self { coordinator, store }
    }

    fn debt_correlation(request_id: &str) -> String {
        format!("{request_id}::reconcile")
    }

    pub async fn run_once(&self) -> UsageResult<ReconciliationReport> {
        let outstanding = self.store.outstanding_shortfalls().await?;
        let mut report = ReconciliationReport {
            examined: outstanding.len(),
            ..Default::default()
        };

        for record in outstanding {
            let collected = self
                .coordinator
                .collect_debt(
                    &record.user_id,
                    &Self::debt_correlation(&record.request_id),
                    record.shortfall,
                )
                .await?;

            if collected == record.shortfall {
                self.store.mark_reconciled(&record.request_id).await?;
                report.collected += 1;
                tracing::info!(
                    user_id = %record.user_id,
                    request_id = %record.request_id,
                    collected,
                    "reconciled usage shortfall"
                );
            } else {
                report.remaining += 1;
            }
        }

        Ok(report)
    }
}
