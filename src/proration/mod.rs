//! Mid-period tier change proration.
//!
//! All arithmetic stays in `Decimal` cents; rounding happens exactly once, on
//! the amounts that leave the calculator. A partially elapsed day counts as a
//! full remaining day, so a change right before midnight still credits and
//! charges that day on both sides.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::tiers::TierCatalog;
use crate::types::UserId;

const SECS_PER_DAY: i64 = 86_400;

#[derive(Error, Debug)]
pub enum ProrationError {
    #[error("Unknown tier: '{tier}'")]
    UnknownTier { tier: String },

    #[error("Change time {at} falls outside the period {start}..{end}")]
    OutsidePeriod {
        at: DateTime<Utc>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

pub type ProrationResult<T> = std::result::Result<T, ProrationError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProrationStatus {
    /// Computed but not yet posted to the billing provider.
    Pending,
    Applied,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProrationRecord {
    pub id: Uuid,
    pub user_id: UserId,
    pub from_tier: String,
    pub to_tier: String,
    /// Credit for unused time on the old tier, in cents.
    pub unused_credit_cents: Decimal,
    /// Charge for remaining time on the new tier, in cents.
    pub remaining_charge_cents: Decimal,
    /// Charge minus credit; negative means the user is owed money.
    pub net_charge_cents: Decimal,
    pub remaining_days: i64,
    pub period_days: i64,
    pub status: ProrationStatus,
    pub created_at: DateTime<Utc>,
}

pub struct ProrationCalculator {
    catalog: TierCatalog,
}

impl ProrationCalculator {
    pub fn new(catalog: TierCatalog) -> Self {
        Self { catalog }
    }

    /// Prorate a tier change at `at` within `period_start..period_end`.
    ///
    /// Both sides of the change price the same number of remaining days, so
    /// an upgrade immediately reversed nets out to within a cent.
    pub fn prorate(
        &self,
        user_id: &str,
        from_tier: &str,
        to_tier: &str,
        at: DateTime<Utc>,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> ProrationResult<ProrationRecord> {
        let from = self.price_of(from_tier)?;
        let to = self.price_of(to_tier)?;

        if at < period_start || at >= period_end || period_end <= period_start {
            return Err(ProrationError::OutsidePeriod {
                at,
                start: period_start,
                end: period_end,
            });
        }

        let period_days = ceil_days((period_end - period_start).num_seconds());
        let remaining_days = ceil_days((period_end - at).num_seconds());

        let days = Decimal::from(remaining_days);
        let span = Decimal::from(period_days);
        let unused_credit = from * days / span;
        let remaining_charge = to * days / span;

        let record = ProrationRecord {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            from_tier: from_tier.to_string(),
            to_tier: to_tier.to_string(),
            unused_credit_cents: unused_credit.round_dp(2),
            remaining_charge_cents: remaining_charge.round_dp(2),
            net_charge_cents: (remaining_charge - unused_credit).round_dp(2),
            remaining_days,
            period_days,
            status: ProrationStatus::Pending,
            created_at: Utc::now(),
        };
        tracing::debug!(
            user_id,
            from_tier,
            to_tier,
            net_charge = %record.net_charge_cents,
            remaining_days,
            "prorated tier change"
        );
        Ok(record)
    }

    fn price_of(&self, tier: &str) -> ProrationResult<Decimal> {
        self.catalog
            .get(tier)
            .map(|t| t.monthly_price_cents)
            .ok_or_else(|| ProrationError::UnknownTier {
                tier: tier.to_string(),
            })
    }
}

fn ceil_days(secs: i64) -> i64 {
    (secs.max(0) + SECS_PER_DAY - 1).div_euclid(SECS_PER_DAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn calculator() -> ProrationCalculator {
        ProrationCalculator::new(TierCatalog::default())
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn thirty_day_period() -> (DateTime<Utc>, DateTime<Utc>) {
        let start = ts(1_700_000_000);
        (start, start + chrono::Duration::days(30))
    }

    #[test]
    fn test_upgrade_at_period_start_charges_full_difference() {
        let (start, end) = thirty_day_period();
        let record = calculator()
            .prorate("u1", "free", "pro", start, start, end)
            .unwrap();

        assert_eq!(record.remaining_days, 30);
        assert_eq!(record.period_days, 30);
        assert_eq!(record.unused_credit_cents, dec!(0));
        assert_eq!(record.remaining_charge_cents, dec!(2900));
        assert_eq!(record.net_charge_cents, dec!(2900));
        assert_eq!(record.status, ProrationStatus::Pending);
    }

    #[test]
    fn test_midperiod_upgrade() {
        let (start, end) = thirty_day_period();
        let at = start + chrono::Duration::days(12);
        let record = calculator()
            .prorate("u1", "pro", "business", at, start, end)
            .unwrap();

        // 18 of 30 days remain: credit 2900*18/30 = 1740, charge 9900*18/30 = 5940.
        assert_eq!(record.remaining_days, 18);
        assert_eq!(record.unused_credit_cents, dec!(1740));
        assert_eq!(record.remaining_charge_cents, dec!(5940));
        assert_eq!(record.net_charge_cents, dec!(4200));
    }

    #[test]
    fn test_downgrade_is_negative_net() {
        let (start, end) = thirty_day_period();
        let at = start + chrono::Duration::days(12);
        let record = calculator()
            .prorate("u1", "business", "pro", at, start, end)
            .unwrap();
        assert_eq!(record.net_charge_cents, dec!(-4200));
    }

    #[test]
    fn test_upgrade_then_reversal_nets_within_a_cent() {
        let (start, end) = thirty_day_period();
        // Awkward instant: mid-day, so remaining days round up.
        let at = start + chrono::Duration::seconds(11 * 86_400 + 13_531);
        let calc = calculator();

        let up = calc.prorate("u1", "pro", "business", at, start, end).unwrap();
        let down = calc.prorate("u1", "business", "pro", at, start, end).unwrap();

        let net = up.net_charge_cents + down.net_charge_cents;
        assert!(net.abs() <= dec!(1), "net {net} exceeds one cent");
    }

    #[test]
    fn test_partial_day_counts_as_full_remaining_day() {
        let (start, end) = thirty_day_period();
        // One second before period end: one remaining day on both sides.
        let at = end - chrono::Duration::seconds(1);
        let record = calculator()
            .prorate("u1", "free", "pro", at, start, end)
            .unwrap();
        assert_eq!(record.remaining_days, 1);
        assert_eq!(record.net_charge_cents, dec!(96.67));
    }

    #[test]
    fn test_change_outside_period_rejected() {
        let (start, end) = thirty_day_period();
        let err = calculator()
            .prorate("u1", "free", "pro", end, start, end)
            .unwrap_err();
        assert!(matches!(err, ProrationError::OutsidePeriod { .. }));
    }

    #[test]
    fn test_unknown_tier_rejected() {
        let (start, end) = thirty_day_period();
        let err = calculator()
            .prorate("u1", "free", "platinum", start, start, end)
            .unwrap_err();
        assert!(matches!(err, ProrationError::UnknownTier { .. }));
    }
}
