//! Token-to-credit conversion.
//!
//! Credits are computed separately for input and output — a blended average
//! under-prices output-heavy workloads badly. Every rounding step is a
//! ceiling: the platform must never charge less than vendor cost.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::pricing::{MarginPolicy, PricingError, PricingRecord, PricingResult};
use crate::types::{Credits, VendorUsage};

/// Cents-per-Mtok → USD-per-Ktok: divide by 100 (cents→USD) and 1000 (M→K).
const CENTS_MTOK_TO_USD_KTOK: Decimal = dec!(100_000);

/// Display-only estimation assumes ten output tokens per input token.
const DISPLAY_OUTPUT_RATIO: u64 = 10;

/// Per-dimension credit charge for one request, plus the raw vendor cost for
/// the usage record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub input_credits: Credits,
    pub output_credits: Credits,
    pub cached_credits: Credits,
    pub cache_write_credits: Credits,
    /// Exact vendor cost in cents, unrounded. Analytics data, never billed.
    pub vendor_cost_cents: Decimal,
    pub margin_applied: Decimal,
}

impl CostBreakdown {
    pub fn total(&self) -> Credits {
        self.input_credits
            + self.output_credits
            + self.cached_credits
            + self.cache_write_credits
    }
}

/// Pure conversion of vendor token counts into credits.
#[derive(Debug, Clone)]
pub struct CostCalculator {
    /// USD value of one credit (e.g. $0.0005).
    credit_usd_value: Decimal,
}

impl Default for CostCalculator {
    fn default() -> Self {
        Self {
            credit_usd_value: dec!(0.0005),
        }
    }
}

impl CostCalculator {
    pub fn new(credit_usd_value: Decimal) -> Self {
        Self { credit_usd_value }
    }

    pub fn credit_usd_value(&self) -> Decimal {
        self.credit_usd_value
    }

    /// Credits per thousand tokens for one cost dimension.
    ///
    /// `ceil((vendor_cents_per_mtok / 100_000) * margin / credit_usd_value)`.
    /// Zero vendor cost yields zero credits, not an error.
    pub fn credits_per_ktok(&self, cost_cents_per_mtok: Decimal, margin: Decimal) -> Credits {
        if cost_cents_per_mtok.is_zero() {
            return 0;
        }
        let usd_per_ktok = cost_cents_per_mtok / CENTS_MTOK_TO_USD_KTOK;
        let credits = (usd_per_ktok * margin / self.credit_usd_value).ceil();
        credits.to_i64().unwrap_or(i64::MAX)
    }

    /// Charge for `tokens` at `credits_per_ktok`, ceiling-rounded so a single
    /// token on a nonzero-cost dimension always costs at least one credit.
    pub fn charge(credits_per_ktok: Credits, tokens: u64) -> PricingResult<Credits> {
        if credits_per_ktok == 0 || tokens == 0 {
            return Ok(0);
        }
        let charged = (credits_per_ktok as i128 * tokens as i128 + 999) / 1000;
        i64::try_from(charged).map_err(|_| PricingError::Overflow { tokens })
    }

    /// Full cost of a request: pricing record + resolved margin + actuals.
    pub fn cost(
        &self,
        record: &PricingRecord,
        policy: &MarginPolicy,
        usage: &VendorUsage,
    ) -> PricingResult<CostBreakdown> {
        let margin = policy.multiplier;

        let input_rate = self.credits_per_ktok(record.input_cost_per_mtok, margin);
        let output_rate = self.credits_per_ktok(record.output_cost_per_mtok, margin);
        let cached_rate = self.credits_per_ktok(record.cache_read_cost(), margin);
        let write_rate = self.credits_per_ktok(record.cache_write_cost(), margin);

        Ok(CostBreakdown {
            input_credits: Self::charge(input_rate, usage.input_tokens)?,
            output_credits: Self::charge(output_rate, usage.output_tokens)?,
            cached_credits: Self::charge(cached_rate, usage.cached_tokens)?,
            cache_write_credits: Self::charge(write_rate, usage.cache_write_tokens)?,
            vendor_cost_cents: vendor_cost_cents(record, usage),
            margin_applied: margin,
        })
    }

    /// Pre-flight reservation estimate: prompt tokens as input, the caller's
    /// max-output-tokens as output. Deliberately pessimistic; commit releases
    /// the unused portion.
    pub fn estimate(
        &self,
        record: &PricingRecord,
        policy: &MarginPolicy,
        prompt_tokens: u64,
        max_output_tokens: u64,
    ) -> PricingResult<Credits> {
        let usage = VendorUsage::new(prompt_tokens, max_output_tokens);
        Ok(self.cost(record, policy, &usage)?.total())
    }

    /// Rough total for UI display, assuming a fixed 1:10 input:output ratio.
    ///
    /// Non-authoritative. Never feeds reservations, admission, or billing.
    pub fn display_estimate(
        &self,
        record: &PricingRecord,
        policy: &MarginPolicy,
        input_tokens: u64,
    ) -> PricingResult<Credits> {
        let usage = VendorUsage::new(
            input_tokens,
            input_tokens.saturating_mul(DISPLAY_OUTPUT_RATIO),
        );
        Ok(self.cost(record, policy, &usage)?.total())
    }
}

/// Exact vendor cost in cents for the given usage, no margin, no rounding.
fn vendor_cost_cents(record: &PricingRecord, usage: &VendorUsage) -> Decimal {
    let mtok = dec!(1_000_000);
    Decimal::from(usage.input_tokens) * record.input_cost_per_mtok / mtok
        + Decimal::from(usage.output_tokens) * record.output_cost_per_mtok / mtok
        + Decimal::from(usage.cached_tokens) * record.cache_read_cost() / mtok
        + Decimal::from(usage.cache_write_tokens) * record.cache_write_cost() / mtok
}
