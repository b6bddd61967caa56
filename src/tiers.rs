//! Subscription tier catalog.
//!
//! One registry for everything tier-scoped: monthly price, monthly credit
//! allocation, and per-dimension admission limits. Built-in defaults can be
//! replaced or extended through the builder.

use std::collections::HashMap;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::types::Credits;

/// Per-tier admission limits, one per dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    pub requests_per_minute: u32,
    pub tokens_per_minute: u64,
    pub credits_per_day: Credits,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierConfig {
    pub name: String,
    /// Monthly subscription price in cents.
    pub monthly_price_cents: Decimal,
    /// Credits allocated on each renewal.
    pub monthly_credits: Credits,
    pub limits: TierLimits,
}

impl TierConfig {
    pub fn new(
        name: impl Into<String>,
        monthly_price_cents: Decimal,
        monthly_credits: Credits,
        limits: TierLimits,
    ) -> Self {
        Self {
            name: name.into(),
            monthly_price_cents,
            monthly_credits,
            limits,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TierCatalog {
    tiers: HashMap<String, TierConfig>,
}

impl TierCatalog {
    pub fn builder() -> TierCatalogBuilder {
        TierCatalogBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&TierConfig> {
        self.tiers.get(name)
    }

    pub fn tier_names(&self) -> Vec<&str> {
        self.tiers.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }
}

impl Default for TierCatalog {
    fn default() -> Self {
        TierCatalogBuilder::default().with_defaults().build()
    }
}

#[derive(Debug, Default)]
pub struct TierCatalogBuilder {
    tiers: HashMap<String, TierConfig>,
}

impl TierCatalogBuilder {
    pub fn with_defaults(mut self) -> Self {
        self = self.tier(TierConfig::new(
            "free",
            dec!(0),
            1_000,
            TierLimits {
                requests_per_minute: 10,
                tokens_per_minute: 10_000,
                credits_per_day: 200,
            },
        ));
        self = self.tier(TierConfig::new(
            "pro",
            dec!(2900),
            60_000,
            TierLimits {
                requests_per_minute: 60,
                tokens_per_minute: 200_000,
                credits_per_day: 10_000,
            },
        ));
        self.tier(TierConfig::new(
            "business",
            dec!(9900),
            250_000,
            TierLimits {
                requests_per_minute: 300,
                tokens_per_minute: 1_000_000,
                credits_per_day: 50_000,
            },
        ))
    }

    pub fn tier(mut self, config: TierConfig) -> Self {
        self.tiers.insert(config.name.clone(), config);
        self
    }

    pub fn build(self) -> TierCatalog {
        TierCatalog { tiers: self.tiers }
    }
}
