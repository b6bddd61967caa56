//! Shared identifiers and token-count types.

use serde::{Deserialize, Serialize};

/// Platform-internal currency unit. Always an integer; never fractional.
pub type Credits = i64;

pub type UserId = String;

/// Subscription tier name, resolved against the [`crate::tiers::TierCatalog`].
pub type TierName = String;

/// Vendor-reported token consumption for a single request.
///
/// `cached_tokens` counts cache reads (tokens served from the vendor's prompt
/// cache); `cache_write_tokens` counts tokens written into it. Vendors that do
/// not distinguish cache traffic report both as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub cache_write_tokens: u64,
}

impl VendorUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            ..Default::default()
        }
    }

    pub fn with_cached(mut self, cached_tokens: u64) -> Self {
        self.cached_tokens = cached_tokens;
        self
    }

    pub fn with_cache_writes(mut self, cache_write_tokens: u64) -> Self {
        self.cache_write_tokens = cache_write_tokens;
        self
    }

    #[inline]
    pub fn total(&self) -> u64 {
        self.input_tokens
            .saturating_add(self.output_tokens)
            .saturating_add(self.cached_tokens)
            .saturating_add(self.cache_write_tokens)
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Risk class of a request for admission-control degradation policy.
///
/// When the counter store is unreachable, `Read` requests fail open (already
/// authenticated, no vendor spend) and `Spend` requests fail closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestClass {
    /// Balance queries, usage listings and other non-billable reads.
    Read,
    /// Anything that would dispatch a vendor call and spend credits.
    Spend,
}

impl RequestClass {
    pub fn is_spend(&self) -> bool {
        matches!(self, Self::Spend)
    }
}
