//! Margin policy resolution.
//!
//! A policy sets the multiplier applied to vendor cost for a scope. Scopes are
//! an explicit tagged union with a specificity ranking rather than ad hoc
//! key lookups: a (tier, provider) override beats a provider override, which
//! beats the tier default. Ties break on the latest `effective_from`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::{PricingError, PricingResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum MarginScope {
    /// Default for every request on a tier. Every tier must carry one; its
    /// absence is a deployment error, not a runtime condition.
    Tier { tier: String },
    /// Override for one vendor across all tiers.
    Provider { provider: String },
    /// Override for one vendor on one tier.
    TierProvider { tier: String, provider: String },
}

impl MarginScope {
    /// Higher wins. The ranking is the whole resolution rule; keep it explicit.
    pub fn specificity(&self) -> u8 {
        match self {
            Self::TierProvider { .. } => 3,
            Self::Provider { .. } => 2,
            Self::Tier { .. } => 1,
        }
    }

    pub fn matches(&self, tier: &str, provider: &str) -> bool {
        match self {
            Self::Tier { tier: t } => t == tier,
            Self::Provider { provider: p } => p == provider,
            Self::TierProvider {
                tier: t,
                provider: p,
            } => t == tier && p == provider,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Draft,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarginPolicy {
    pub scope: MarginScope,
    /// Factor applied to vendor cost; never below 1.0.
    pub multiplier: Decimal,
    pub target_margin_percent: Decimal,
    pub effective_from: DateTime<Utc>,
    pub approval_status: ApprovalStatus,
}

impl MarginPolicy {
    pub fn new(scope: MarginScope, multiplier: Decimal, effective_from: DateTime<Utc>) -> Self {
        // target margin of 2.5x is 60%: (1 - 1/m) * 100
        let target_margin_percent = if multiplier.is_zero() {
            Decimal::ZERO
        } else {
            (Decimal::ONE - Decimal::ONE / multiplier) * dec!(100)
        };
        Self {
            scope,
            multiplier,
            target_margin_percent,
            effective_from,
            approval_status: ApprovalStatus::Approved,
        }
    }

    pub fn with_approval(mut self, status: ApprovalStatus) -> Self {
        self.approval_status = status;
        self
    }

    fn applies(&self, tier: &str, provider: &str, as_of: DateTime<Utc>) -> bool {
        self.approval_status == ApprovalStatus::Approved
            && self.effective_from <= as_of
            && self.scope.matches(tier, provider)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MarginResolver {
    policies: Vec<MarginPolicy>,
}

impl MarginResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&mut self, policy: MarginPolicy) -> PricingResult<()> {
        if policy.multiplier < Decimal::ONE {
            return Err(PricingError::MultiplierBelowCost {
                multiplier: policy.multiplier,
            });
        }
        self.policies.push(policy);
        Ok(())
    }

    /// Select the most specific approved policy in effect at `as_of`.
    pub fn resolve(
        &self,
        tier: &str,
        provider: &str,
        as_of: DateTime<Utc>,
    ) -> PricingResult<&MarginPolicy> {
        self.policies
            .iter()
            .filter(|p| p.applies(tier, provider, as_of))
            .max_by_key(|p| (p.scope.specificity(), p.effective_from))
            .ok_or_else(|| PricingError::PolicyNotFound {
                tier: tier.to_string(),
                provider: provider.to_string(),
            })
    }

    /// Deployment check: every tier name passed in must have a tier-scope
    /// fallback. Run at startup or after admin edits, never per request.
    pub fn verify_tier_defaults<'a>(
        &self,
        tiers: impl IntoIterator<Item = &'a str>,
        as_of: DateTime<Utc>,
    ) -> PricingResult<()> {
        for tier in tiers {
            let has_default = self.policies.iter().any(|p| {
                matches!(&p.scope, MarginScope::Tier { tier: t } if t == tier)
                    && p.approval_status == ApprovalStatus::Approved
                    && p.effective_from <= as_of
            });
            if !has_default {
                return Err(PricingError::PolicyNotFound {
                    tier: tier.to_string(),
                    provider: "*".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
