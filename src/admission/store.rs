//! Counter storage backends for admission windows.

use dashmap::DashMap;

use super::AdmissionResult;
use crate::types::{Credits, UserId};

/// Usage accumulated in the windows an admission check runs against.
///
/// Token and credit figures are the admitted **estimates** — token counts are
/// not known before the vendor call, so in-flight demand must count here or
/// concurrent requests would all pass against an empty window. Credits are
/// corrected to actuals at settlement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowUsage {
    /// Requests admitted in the current epoch minute.
    pub requests: u64,
    /// Estimated tokens admitted in the current epoch minute.
    pub tokens: u64,
    /// Credits counted against the current UTC day (admitted estimates,
    /// adjusted to actuals once known).
    pub credits: Credits,
}

#[async_trait::async_trait]
pub trait CounterStore: Send + Sync {
    fn name(&self) -> &str;

    /// Current usage for the given minute and day windows. Windows other than
    /// the requested ones read as empty.
    async fn window_usage(
        &self,
        user_id: &str,
        minute_key: i64,
        day_key: i64,
    ) -> AdmissionResult<WindowUsage>;

    /// Count one admitted request: bump the request counter and fold the
    /// estimated tokens and credits into their windows.
    async fn record_admission(
        &self,
        user_id: &str,
        minute_key: i64,
        day_key: i64,
        estimated_tokens: u64,
        estimated_credits: Credits,
    ) -> AdmissionResult<()>;

    /// Apply a signed correction to the day's credit counter, once actuals
    /// replace an admitted estimate. The counter never goes below zero.
    async fn adjust_credits(
        &self,
        user_id: &str,
        day_key: i64,
        delta: Credits,
    ) -> AdmissionResult<()>;
}

#[derive(Debug, Default)]
struct UserCounters {
    minute_key: i64,
    requests: u64,
    tokens: u64,
    day_key: i64,
    credits: Credits,
}

impl UserCounters {
    /// Lazy rollover: stale windows are discarded on first touch instead of
    /// by a background sweeper.
    fn roll(&mut self, minute_key: i64, day_key: i64) {
        if self.minute_key != minute_key {
            self.minute_key = minute_key;
            self.requests = 0;
            self.tokens = 0;
        }
        if self.day_key != day_key {
            self.day_key = day_key;
            self.credits = 0;
        }
    }
}

/// In-memory counters (testing and single-instance deployments).
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: DashMap<UserId, UserCounters>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl CounterStore for MemoryCounterStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn window_usage(
        &self,
        user_id: &str,
        minute_key: i64,
        day_key: i64,
    ) -> AdmissionResult<WindowUsage> {
        let mut entry = self.counters.entry(user_id.to_string()).or_default();
        entry.roll(minute_key, day_key);
        Ok(WindowUsage {
            requests: entry.requests,
            tokens: entry.tokens,
            credits: entry.credits,
        })
    }

    async fn record_admission(
        &self,
        user_id: &str,
        minute_key: i64,
        day_key: i64,
        estimated_tokens: u64,
        estimated_credits: Credits,
    ) -> AdmissionResult<()> {
        let mut entry = self.counters.entry(user_id.to_string()).or_default();
        entry.roll(minute_key, day_key);
        entry.requests += 1;
        entry.tokens += estimated_tokens;
        entry.credits += estimated_credits;
        Ok(())
    }

    async fn adjust_credits(
        &self,
        user_id: &str,
        day_key: i64,
        delta: Credits,
    ) -> AdmissionResult<()> {
        let mut entry = self.counters.entry(user_id.to_string()).or_default();
        if entry.day_key != day_key {
            entry.day_key = day_key;
            entry.credits = 0;
        }
        entry.credits = (entry.credits + delta).max(0);
        Ok(())
    }
}
