//! Versioned, time-scoped vendor cost records.
//!
//! One record per (provider, model) is active at any instant. Publishing a
//! newer record closes the prior one by stamping its `effective_until`;
//! nothing is ever deleted, so historical requests can always be re-priced.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{PricingError, PricingResult};

/// Vendor cost for one (provider, model) pair over an effective window.
///
/// All costs are in **cents per million tokens**. Cache costs are optional:
/// vendors without distinct cache pricing bill cached tokens as plain input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingRecord {
    pub provider: String,
    pub model: String,
    pub input_cost_per_mtok: Decimal,
    pub output_cost_per_mtok: Decimal,
    pub cache_write_cost_per_mtok: Option<Decimal>,
    pub cache_read_cost_per_mtok: Option<Decimal>,
    pub effective_from: DateTime<Utc>,
    pub effective_until: Option<DateTime<Utc>>,
    pub active: bool,
}

impl PricingRecord {
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        input_cost_per_mtok: Decimal,
        output_cost_per_mtok: Decimal,
        effective_from: DateTime<Utc>,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            input_cost_per_mtok,
            output_cost_per_mtok,
            cache_write_cost_per_mtok: None,
            cache_read_cost_per_mtok: None,
            effective_from,
            effective_until: None,
            active: true,
        }
    }

    pub fn with_cache_costs(mut self, write: Decimal, read: Decimal) -> Self {
        self.cache_write_cost_per_mtok = Some(write);
        self.cache_read_cost_per_mtok = Some(read);
        self
    }

    /// Cost applied to cache-read tokens: the discounted rate when the vendor
    /// publishes one, otherwise the plain input rate.
    pub fn cache_read_cost(&self) -> Decimal {
        self.cache_read_cost_per_mtok
            .unwrap_or(self.input_cost_per_mtok)
    }

    /// Cost applied to cache-write tokens, falling back to the input rate.
    pub fn cache_write_cost(&self) -> Decimal {
        self.cache_write_cost_per_mtok
            .unwrap_or(self.input_cost_per_mtok)
    }

    pub fn covers(&self, as_of: DateTime<Utc>) -> bool {
        self.active
            && self.effective_from <= as_of
            && self.effective_until.map(|u| as_of < u).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    records: HashMap<(String, String), Vec<PricingRecord>>,
}

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> PricingTableBuilder {
        PricingTableBuilder::default()
    }

    /// Publish a new record, superseding the currently active one.
    ///
    /// The superseded record keeps its history but is stamped with
    /// `effective_until = new.effective_from` and deactivated, preserving the
    /// one-active-record-per-pair invariant.
    pub fn publish(&mut self, record: PricingRecord) -> PricingResult<()> {
        let key = (record.provider.clone(), record.model.clone());
        let history = self.records.entry(key).or_default();

        if let Some(current) = history.iter_mut().rev().find(|r| r.active) {
            if record.effective_from <= current.effective_from {
                return Err(PricingError::InvalidEffectiveRange {
                    provider: record.provider,
                    model: record.model,
                });
            }
            current.effective_until = Some(record.effective_from);
            current.active = false;
        }

        history.push(record);
        Ok(())
    }

    /// Resolve the record in effect at `as_of`.
    pub fn resolve(
        &self,
        provider: &str,
        model: &str,
        as_of: DateTime<Utc>,
    ) -> PricingResult<&PricingRecord> {
        self.records
            .get(&(provider.to_string(), model.to_string()))
            .and_then(|history| {
                history.iter().rev().find(|r| {
                    r.effective_from <= as_of && r.effective_until.map(|u| as_of < u).unwrap_or(true)
                })
            })
            .ok_or_else(|| PricingError::PricingNotFound {
                provider: provider.to_string(),
                model: model.to_string(),
            })
    }

    /// Full supersession history for a pair, oldest first.
    pub fn history(&self, provider: &str, model: &str) -> &[PricingRecord] {
        self.records
            .get(&(provider.to_string(), model.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct PricingTableBuilder {
    records: Vec<PricingRecord>,
}

impl PricingTableBuilder {
    pub fn record(mut self, record: PricingRecord) -> Self {
        self.records.push(record);
        self
    }

    pub fn build(self) -> PricingResult<PricingTable> {
        let mut table = PricingTable::new();
        let mut records = self.records;
        records.sort_by_key(|r| r.effective_from);
        for record in records {
            table.publish(record)?;
        }
        Ok(table)
    }
}
