//! Vendor pricing reference data and margin policy resolution.
//!
//! Both tables are read-mostly: records are created by an administrative
//! collaborator and superseded, never mutated in place.

mod margin;
mod record;

pub use margin::{ApprovalStatus, MarginPolicy, MarginResolver, MarginScope};
pub use record::{PricingRecord, PricingTable, PricingTableBuilder};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PricingError {
    #[error("No pricing record for {provider}/{model} at the requested instant")]
    PricingNotFound { provider: String, model: String },

    #[error("No approved margin policy for tier '{tier}' (provider: {provider})")]
    PolicyNotFound { tier: String, provider: String },

    #[error(
        "Pricing record for {provider}/{model} must take effect after the record it supersedes"
    )]
    InvalidEffectiveRange { provider: String, model: String },

    #[error("Margin multiplier {multiplier} is below 1.0; resale below vendor cost is not allowed")]
    MultiplierBelowCost { multiplier: rust_decimal::Decimal },

    #[error("Credit conversion overflowed for {tokens} tokens")]
    Overflow { tokens: u64 },
}

pub type PricingResult<T> = std::result::Result<T, PricingError>;
