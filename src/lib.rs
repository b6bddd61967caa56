//! # credit-meter
//!
//! Metered usage billing and admission control for prepaid-credit LLM resale
//! platforms.
//!
//! Users buy subscription tiers priced in real money; their requests to
//! upstream model vendors are metered in an internal credit currency derived
//! from vendor token pricing plus a configurable margin. This crate is the
//! billing core: versioned vendor pricing, margin policy resolution,
//! token-to-credit conversion, an append-only credit ledger, pre-flight
//! admission control, and the reserve/commit/release protocol that keeps the
//! ledger honest around vendor calls that can fail mid-stream.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chrono::Utc;
//! use credit_meter::{
//!     BeginRequest, MarginPolicy, MarginScope, Meter, PricingRecord, UsageStatus, VendorUsage,
//! };
//! use rust_decimal_macros::dec;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), credit_meter::Error> {
//!     let meter = Meter::builder()
//!         .pricing_record(PricingRecord::new(
//!             "anthropic",
//!             "claude-sonnet",
//!             dec!(125),  // input, cents per Mtok
//!             dec!(1000), // output, cents per Mtok
//!             Utc::now(),
//!         ))?
//!         .margin_policy(MarginPolicy::new(
//!             MarginScope::Tier { tier: "pro".into() },
//!             dec!(2.5),
//!             Utc::now(),
//!         ))?
//!         .build();
//!
//!     meter.allocate_monthly("user-1", "pro").await?;
//!
//!     let ticket = meter
//!         .begin(BeginRequest {
//!             user_id: "user-1".into(),
//!             tier: "pro".into(),
//!             provider: "anthropic".into(),
//!             model: "claude-sonnet".into(),
//!             request_id: "req-0001".into(),
//!             prompt_tokens: 1_200,
//!             max_output_tokens: 4_000,
//!         })
//!         .await?;
//!
//!     // ... dispatch the vendor call ...
//!
//!     let outcome = meter
//!         .commit(
//!             ticket.reservation_id,
//!             VendorUsage::new(1_200, 900),
//!             UsageStatus::Success,
//!         )
//!         .await?;
//!     println!("charged {} credits", outcome.receipt.credits_charged);
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod admission;
pub mod coordinator;
pub mod cost;
pub mod ledger;
pub mod meter;
pub mod pricing;
pub mod proration;
pub mod tiers;
pub mod types;
pub mod usage;

// Re-exports for convenience
pub use admission::{
    AdmissionController, AdmissionDecision, AdmissionError, AdmissionRequest, CounterStore,
    LimitDimension, MemoryCounterStore, WindowUsage,
};
#[cfg(feature = "redis-backend")]
pub use admission::{RedisCounterConfig, RedisCounterStore};
pub use coordinator::{
    CommitReceipt, CoordinatorError, DeductionCoordinator, ReleaseReceipt, Reservation,
};
pub use cost::{CostBreakdown, CostCalculator};
pub use ledger::{
    BalanceView, EntryReason, EntryStatus, LedgerEntry, LedgerEntryId, LedgerError, LedgerStore,
    MemoryLedgerStore,
};
pub use meter::{BeginRequest, CommitOutcome, Meter, MeterBuilder, MeterTicket};
pub use pricing::{
    ApprovalStatus, MarginPolicy, MarginResolver, MarginScope, PricingError, PricingRecord,
    PricingTable, PricingTableBuilder,
};
pub use proration::{ProrationCalculator, ProrationError, ProrationRecord, ProrationStatus};
pub use tiers::{TierCatalog, TierCatalogBuilder, TierConfig, TierLimits};
pub use types::{Credits, RequestClass, TierName, UserId, VendorUsage};
pub use usage::{
    MemoryUsageStore, ReconciliationReport, Reconciler, UsageError, UsageRecord, UsageStatus,
    UsageStore,
};

/// Error type for credit-meter operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Pricing or margin configuration problem.
    #[error(transparent)]
    Pricing(#[from] PricingError),

    /// Ledger storage failed or an entry was in an unexpected state.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Balance cannot cover the requested reservation.
    #[error("Insufficient credits: required {required}, available {available}")]
    InsufficientCredits {
        required: Credits,
        available: Credits,
    },

    /// Reservation unknown or already settled.
    #[error("Reservation not found or already terminal: {id}")]
    ReservationNotFound { id: uuid::Uuid },

    /// An admission limit was hit.
    #[error("{dimension} limit exceeded, retry in {:.0}s", retry_after.as_secs_f64())]
    AdmissionExceeded {
        dimension: LimitDimension,
        retry_after: std::time::Duration,
    },

    /// Counter store unreachable on a path that may not degrade.
    #[error("Counter store unavailable: {message}")]
    StoreUnavailable { message: String },

    /// Tier name not present in the catalog.
    #[error("Unknown tier: '{tier}'")]
    UnknownTier { tier: String },

    /// Usage record storage failed.
    #[error(transparent)]
    Usage(UsageError),

    /// Request parameters are invalid.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Error category for unified error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Pricing table, margin policy, or tier catalog problems
    Configuration,
    /// Credit balance or admission limits; clears on its own
    ResourceLimit,
    /// Storage outages that may succeed on retry
    Transient,
    /// Bad identifiers or parameters from the caller
    Caller,
    /// Unexpected internal states
    Internal,
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Pricing(PricingError::Overflow { .. }) => ErrorCategory::Internal,
            Error::Pricing(_) | Error::UnknownTier { .. } => ErrorCategory::Configuration,

            Error::InsufficientCredits { .. } | Error::AdmissionExceeded { .. } => {
                ErrorCategory::ResourceLimit
            }

            Error::Ledger(LedgerError::Storage { .. })
            | Error::StoreUnavailable { .. }
            | Error::Usage(UsageError::Storage { .. }) => ErrorCategory::Transient,

            Error::ReservationNotFound { .. }
            | Error::InvalidRequest(_)
            | Error::Usage(UsageError::Duplicate { .. })
            | Error::Usage(UsageError::NotFound { .. }) => ErrorCategory::Caller,

            Error::Ledger(_) | Error::Usage(_) => ErrorCategory::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    pub fn is_resource_limit(&self) -> bool {
        self.category() == ErrorCategory::ResourceLimit
    }

    /// Client-facing retry hint, present for admission rejections.
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            Error::AdmissionExceeded { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

impl From<CoordinatorError> for Error {
    fn from(err: CoordinatorError) -> Self {
        match err {
            CoordinatorError::InsufficientCredits {
                required,
                available,
            } => Error::InsufficientCredits {
                required,
                available,
            },
            CoordinatorError::ReservationNotFound { id } => Error::ReservationNotFound { id },
            CoordinatorError::InvalidAmount { amount } => {
                Error::InvalidRequest(format!("invalid credit amount: {amount}"))
            }
            CoordinatorError::Ledger(e) => Error::Ledger(e),
        }
    }
}

impl From<AdmissionError> for Error {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::StoreUnavailable { message } => Error::StoreUnavailable { message },
            AdmissionError::UnknownTier { tier } => Error::UnknownTier { tier },
        }
    }
}

impl From<UsageError> for Error {
    fn from(err: UsageError) -> Self {
        match err {
            UsageError::Coordinator(e) => e.into(),
            other => Error::Usage(other),
        }
    }
}

impl From<ProrationError> for Error {
    fn from(err: ProrationError) -> Self {
        match err {
            ProrationError::UnknownTier { tier } => Error::UnknownTier { tier },
            other @ ProrationError::OutsidePeriod { .. } => {
                Error::InvalidRequest(other.to_string())
            }
        }
    }
}

/// Convenience Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let err = Error::InsufficientCredits {
            required: 100,
            available: 40,
        };
        assert_eq!(err.category(), ErrorCategory::ResourceLimit);
        assert!(err.is_resource_limit());
        assert!(!err.is_retryable());

        let err = Error::StoreUnavailable {
            message: "connection refused".into(),
        };
        assert_eq!(err.category(), ErrorCategory::Transient);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_admission_retry_hint() {
        let err = Error::AdmissionExceeded {
            dimension: LimitDimension::RequestsPerMinute,
            retry_after: std::time::Duration::from_secs(42),
        };
        assert_eq!(err.retry_after(), Some(std::time::Duration::from_secs(42)));
        assert!(err.to_string().contains("requests_per_minute"));
    }

    #[test]
    fn test_coordinator_errors_flatten() {
        let err: Error = CoordinatorError::InsufficientCredits {
            required: 10,
            available: 3,
        }
        .into();
        assert!(matches!(err, Error::InsufficientCredits { .. }));

        let err: Error = UsageError::Coordinator(CoordinatorError::ReservationNotFound {
            id: uuid::Uuid::new_v4(),
        })
        .into();
        assert!(matches!(err, Error::ReservationNotFound { .. }));
    }
}
