//! Pre-flight admission control.
//!
//! Every metered request passes three independent limit dimensions before any
//! credits are held: requests per minute, tokens per minute, and credits per
//! day. Windows are fixed calendar windows (epoch minute, UTC day), not
//! sliding — a counter resets at the window boundary, and the retry hint in a
//! rejection points at that boundary.
//!
//! Counter-store outages degrade reads and reject spends: a balance check may
//! proceed unmetered, a vendor call that costs money may not.

mod store;
#[cfg(feature = "redis-backend")]
mod store_redis;

pub use store::{CounterStore, MemoryCounterStore, WindowUsage};
#[cfg(feature = "redis-backend")]
pub use store_redis::{RedisCounterConfig, RedisCounterStore};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tiers::{TierCatalog, TierLimits};
use crate::types::{Credits, RequestClass};

pub(crate) const SECS_PER_MINUTE: i64 = 60;
pub(crate) const SECS_PER_DAY: i64 = 86_400;

#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("Counter store unavailable: {message}")]
    StoreUnavailable { message: String },

    #[error("Unknown tier: '{tier}'")]
    UnknownTier { tier: String },
}

pub type AdmissionResult<T> = std::result::Result<T, AdmissionError>;

#[cfg(feature = "redis-backend")]
pub(crate) trait StoreResultExt<T> {
    fn store_err(self) -> AdmissionResult<T>;
    fn store_err_ctx(self, context: &str) -> AdmissionResult<T>;
}

#[cfg(feature = "redis-backend")]
impl<T, E: std::fmt::Display> StoreResultExt<T> for std::result::Result<T, E> {
    fn store_err(self) -> AdmissionResult<T> {
        self.map_err(|e| AdmissionError::StoreUnavailable {
            message: e.to_string(),
        })
    }

    fn store_err_ctx(self, context: &str) -> AdmissionResult<T> {
        self.map_err(|e| AdmissionError::StoreUnavailable {
            message: format!("{}: {}", context, e),
        })
    }
}

#[cfg(feature = "redis-backend")]
pub(crate) async fn with_retry<F, Fut, T>(
    max_retries: u32,
    initial_backoff: std::time::Duration,
    max_backoff: std::time::Duration,
    operation: F,
) -> AdmissionResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = AdmissionResult<T>>,
{
    let mut attempt = 0;
    let mut backoff = initial_backoff;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt < max_retries => {
                attempt += 1;
                tracing::warn!(
                    attempt = attempt,
                    error = %e,
                    "Retrying counter operation after transient failure"
                );
                // Symmetrical 10% jitter to prevent thundering herd
                let jitter_factor = 1.0 + (rand::random::<f64>() * 0.2 - 0.1);
                tokio::time::sleep(backoff.mul_f64(jitter_factor)).await;
                backoff = (backoff * 2).min(max_backoff);
            }
            Err(e) => return Err(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitDimension {
    RequestsPerMinute,
    TokensPerMinute,
    CreditsPerDay,
}

impl std::fmt::Display for LimitDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RequestsPerMinute => write!(f, "requests_per_minute"),
            Self::TokensPerMinute => write!(f, "tokens_per_minute"),
            Self::CreditsPerDay => write!(f, "credits_per_day"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    Allowed {
        /// True when the counter store was unreachable and the request was
        /// admitted unmetered (read-class requests only).
        degraded: bool,
    },
    Rejected {
        dimension: LimitDimension,
        /// Time until the violated window rolls over.
        retry_after: Duration,
        current: u64,
        limit: u64,
    },
}

impl AdmissionDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Estimated demand for the request being admitted. Token and credit
/// dimensions are checked against `current + estimate`; the request dimension
/// counts the request itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdmissionRequest {
    pub estimated_tokens: u64,
    pub estimated_credits: Credits,
}

pub struct AdmissionController {
    catalog: TierCatalog,
    store: Arc<dyn CounterStore>,
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("store", &self.store.name())
            .finish()
    }
}

impl AdmissionController {
    pub fn new(catalog: TierCatalog, store: Arc<dyn CounterStore>) -> Self {
        Self { catalog, store }
    }

    pub async fn check(
        &self,
        user_id: &str,
        tier: &str,
        request: AdmissionRequest,
        class: RequestClass,
    ) -> AdmissionResult<AdmissionDecision> {
        self.check_at(user_id, tier, request, class, Utc::now())
            .await
    }

    /// Admission check against the windows containing `now`.
    ///
    /// A tier with limit N admits the Nth request in a minute and rejects the
    /// N+1th. Token and credit checks are pessimistic: the estimate must fit
    /// in the remaining window headroom.
    pub async fn check_at(
        &self,
        user_id: &str,
        tier: &str,
        request: AdmissionRequest,
        class: RequestClass,
        now: DateTime<Utc>,
    ) -> AdmissionResult<AdmissionDecision> {
        let limits = self.limits_for(tier)?;
        let minute_key = now.timestamp().div_euclid(SECS_PER_MINUTE);
        let day_key = now.timestamp().div_euclid(SECS_PER_DAY);

        let usage = match self.store.window_usage(user_id, minute_key, day_key).await {
            Ok(usage) => usage,
            Err(e) => return self.degrade(user_id, class, e),
        };

        if usage.requests >= u64::from(limits.requests_per_minute) {
            return Ok(self.reject(
                user_id,
                LimitDimension::RequestsPerMinute,
                secs_to_minute(now),
                usage.requests,
                u64::from(limits.requests_per_minute),
            ));
        }
        if usage.tokens + request.estimated_tokens > limits.tokens_per_minute {
            return Ok(self.reject(
                user_id,
                LimitDimension::TokensPerMinute,
                secs_to_minute(now),
                usage.tokens,
                limits.tokens_per_minute,
            ));
        }
        let credits_used = usage.credits.max(0) as u64;
        let credits_limit = limits.credits_per_day.max(0) as u64;
        if usage.credits + request.estimated_credits > limits.credits_per_day {
            return Ok(self.reject(
                user_id,
                LimitDimension::CreditsPerDay,
                secs_to_day(now),
                credits_used,
                credits_limit,
            ));
        }

        // Count the admitted estimates immediately, before the vendor call.
        // Token counts are unknown pre-call, so the windows meter admitted
        // demand; concurrent near-limit requests must see each other.
        if let Err(e) = self
            .store
            .record_admission(
                user_id,
                minute_key,
                day_key,
                request.estimated_tokens,
                request.estimated_credits,
            )
            .await
        {
            return self.degrade(user_id, class, e);
        }
        Ok(AdmissionDecision::Allowed { degraded: false })
    }

    /// Replace an admitted credit estimate with the settled actual in the
    /// day window. Call exactly once per request, at its terminal event
    /// (actual charge on commit, zero on release). Best effort: a
    /// counter-store failure here never fails the request, the deduction
    /// already happened.
    pub async fn settle_spend(
        &self,
        user_id: &str,
        estimated_credits: Credits,
        actual_credits: Credits,
    ) {
        self.settle_spend_at(user_id, estimated_credits, actual_credits, Utc::now())
            .await;
    }

    pub async fn settle_spend_at(
        &self,
        user_id: &str,
        estimated_credits: Credits,
        actual_credits: Credits,
        now: DateTime<Utc>,
    ) {
        let delta = actual_credits - estimated_credits;
        if delta == 0 {
            return;
        }
        let day_key = now.timestamp().div_euclid(SECS_PER_DAY);
        if let Err(e) = self.store.adjust_credits(user_id, day_key, delta).await {
            tracing::warn!(user_id, error = %e, "failed to settle spend in counter store");
        }
    }

    fn limits_for(&self, tier: &str) -> AdmissionResult<TierLimits> {
        self.catalog
            .get(tier)
            .map(|t| t.limits)
            .ok_or_else(|| AdmissionError::UnknownTier {
                tier: tier.to_string(),
            })
    }

    fn degrade(
        &self,
        user_id: &str,
        class: RequestClass,
        error: AdmissionError,
    ) -> AdmissionResult<AdmissionDecision> {
        if class.is_spend() {
            tracing::error!(user_id, error = %error, "counter store down, rejecting spend");
            return Err(error);
        }
        tracing::warn!(user_id, error = %error, "counter store down, admitting read unmetered");
        Ok(AdmissionDecision::Allowed { degraded: true })
    }

    fn reject(
        &self,
        user_id: &str,
        dimension: LimitDimension,
        retry_after: Duration,
        current: u64,
        limit: u64,
    ) -> AdmissionDecision {
        tracing::debug!(user_id, %dimension, current, limit, "admission rejected");
        AdmissionDecision::Rejected {
            dimension,
            retry_after,
            current,
            limit,
        }
    }
}

/// Seconds until the next epoch-minute boundary. Never zero: at an exact
/// boundary the new window is already empty.
fn secs_to_minute(now: DateTime<Utc>) -> Duration {
    let rem = now.timestamp().rem_euclid(SECS_PER_MINUTE);
    Duration::from_secs((SECS_PER_MINUTE - rem).max(1) as u64)
}

/// Seconds until the next UTC midnight.
fn secs_to_day(now: DateTime<Utc>) -> Duration {
    let rem = now.timestamp().rem_euclid(SECS_PER_DAY);
    Duration::from_secs((SECS_PER_DAY - rem).max(1) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct FailingCounterStore;

    #[async_trait::async_trait]
    impl CounterStore for FailingCounterStore {
        fn name(&self) -> &str {
            "failing"
        }

        async fn window_usage(
            &self,
            _user_id: &str,
            _minute_key: i64,
            _day_key: i64,
        ) -> AdmissionResult<WindowUsage> {
            Err(AdmissionError::StoreUnavailable {
                message: "connection refused".to_string(),
            })
        }

        async fn record_admission(
            &self,
            _user_id: &str,
            _minute_key: i64,
            _day_key: i64,
            _estimated_tokens: u64,
            _estimated_credits: Credits,
        ) -> AdmissionResult<()> {
            Err(AdmissionError::StoreUnavailable {
                message: "connection refused".to_string(),
            })
        }

        async fn adjust_credits(
            &self,
            _user_id: &str,
            _day_key: i64,
            _delta: Credits,
        ) -> AdmissionResult<()> {
            Err(AdmissionError::StoreUnavailable {
                message: "connection refused".to_string(),
            })
        }
    }

    fn controller() -> AdmissionController {
        AdmissionController::new(TierCatalog::default(), Arc::new(MemoryCounterStore::new()))
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_request_limit_boundary() {
        let controller = controller();
        let now = at(1_700_000_010);

        // Free tier: 10 requests per minute. The 10th is admitted.
        for _ in 0..10 {
            let decision = controller
                .check_at(
                    "u1",
                    "free",
                    AdmissionRequest::default(),
                    RequestClass::Spend,
                    now,
                )
                .await
                .unwrap();
            assert!(decision.is_allowed());
        }

        // The 11th is not.
        let decision = controller
            .check_at(
                "u1",
                "free",
                AdmissionRequest::default(),
                RequestClass::Spend,
                now,
            )
            .await
            .unwrap();
        match decision {
            AdmissionDecision::Rejected {
                dimension,
                retry_after,
                current,
                limit,
            } => {
                assert_eq!(dimension, LimitDimension::RequestsPerMinute);
                assert_eq!(current, 10);
                assert_eq!(limit, 10);
                assert!(retry_after > Duration::ZERO);
                assert!(retry_after <= Duration::from_secs(60));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_minute_window_rolls_over() {
        let controller = controller();
        let now = at(1_700_000_010);

        for _ in 0..10 {
            controller
                .check_at(
                    "u1",
                    "free",
                    AdmissionRequest::default(),
                    RequestClass::Spend,
                    now,
                )
                .await
                .unwrap();
        }

        // Next epoch minute: counter starts fresh.
        let later = at(1_700_000_070);
        let decision = controller
            .check_at(
                "u1",
                "free",
                AdmissionRequest::default(),
                RequestClass::Spend,
                later,
            )
            .await
            .unwrap();
        assert!(decision.is_allowed());
    }

    #[tokio::test]
    async fn test_token_estimate_must_fit_headroom() {
        let controller = controller();
        let now = at(1_700_000_010);

        // Free tier: 10_000 tokens per minute. The first admission consumes
        // 9_500 of the window.
        let decision = controller
            .check_at(
                "u1",
                "free",
                AdmissionRequest {
                    estimated_tokens: 9_500,
                    estimated_credits: 0,
                },
                RequestClass::Spend,
                now,
            )
            .await
            .unwrap();
        assert!(decision.is_allowed());

        let decision = controller
            .check_at(
                "u1",
                "free",
                AdmissionRequest {
                    estimated_tokens: 501,
                    estimated_credits: 0,
                },
                RequestClass::Spend,
                now,
            )
            .await
            .unwrap();
        assert!(matches!(
            decision,
            AdmissionDecision::Rejected {
                dimension: LimitDimension::TokensPerMinute,
                ..
            }
        ));

        // An estimate that exactly fills the window still passes.
        let decision = controller
            .check_at(
                "u1",
                "free",
                AdmissionRequest {
                    estimated_tokens: 500,
                    estimated_credits: 0,
                },
                RequestClass::Spend,
                now,
            )
            .await
            .unwrap();
        assert!(decision.is_allowed());
    }

    #[tokio::test]
    async fn test_inflight_estimates_count_against_token_window() {
        // Pro tier: 200_000 tokens per minute. Three concurrent 180_000-token
        // requests in the same minute must not all pass just because none has
        // settled yet; the window meters admitted demand.
        let controller = controller();
        let now = at(1_700_000_010);
        let request = AdmissionRequest {
            estimated_tokens: 180_000,
            estimated_credits: 0,
        };

        let first = controller
            .check_at("u1", "pro", request, RequestClass::Spend, now)
            .await
            .unwrap();
        assert!(first.is_allowed());

        for _ in 0..2 {
            let decision = controller
                .check_at("u1", "pro", request, RequestClass::Spend, now)
                .await
                .unwrap();
            assert!(matches!(
                decision,
                AdmissionDecision::Rejected {
                    dimension: LimitDimension::TokensPerMinute,
                    ..
                }
            ));
        }
    }

    #[tokio::test]
    async fn test_daily_credit_cap_spans_minutes() {
        let controller = controller();
        let now = at(1_700_000_010);

        // Free tier: 200 credits per day. Admit a 195-credit estimate.
        let decision = controller
            .check_at(
                "u1",
                "free",
                AdmissionRequest {
                    estimated_tokens: 0,
                    estimated_credits: 195,
                },
                RequestClass::Spend,
                now,
            )
            .await
            .unwrap();
        assert!(decision.is_allowed());

        // Same day, different minute: the daily window still sees 195 held.
        let later = at(1_700_000_100);
        let decision = controller
            .check_at(
                "u1",
                "free",
                AdmissionRequest {
                    estimated_tokens: 0,
                    estimated_credits: 10,
                },
                RequestClass::Spend,
                later,
            )
            .await
            .unwrap();
        match decision {
            AdmissionDecision::Rejected {
                dimension,
                retry_after,
                ..
            } => {
                assert_eq!(dimension, LimitDimension::CreditsPerDay);
                assert!(retry_after <= Duration::from_secs(86_400));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_settle_releases_unused_credit_estimate() {
        let controller = controller();
        let now = at(1_700_000_010);

        let decision = controller
            .check_at(
                "u1",
                "free",
                AdmissionRequest {
                    estimated_tokens: 0,
                    estimated_credits: 150,
                },
                RequestClass::Spend,
                now,
            )
            .await
            .unwrap();
        assert!(decision.is_allowed());

        // Actual charge came in well under the estimate; the day window
        // drops to the settled figure and the headroom comes back.
        controller.settle_spend_at("u1", 150, 40, now).await;

        let decision = controller
            .check_at(
                "u1",
                "free",
                AdmissionRequest {
                    estimated_tokens: 0,
                    estimated_credits: 160,
                },
                RequestClass::Spend,
                now,
            )
            .await
            .unwrap();
        assert!(decision.is_allowed());
    }

    #[tokio::test]
    async fn test_read_fails_open_spend_fails_closed() {
        let controller =
            AdmissionController::new(TierCatalog::default(), Arc::new(FailingCounterStore));
        let now = at(1_700_000_010);

        let decision = controller
            .check_at(
                "u1",
                "free",
                AdmissionRequest::default(),
                RequestClass::Read,
                now,
            )
            .await
            .unwrap();
        assert_eq!(decision, AdmissionDecision::Allowed { degraded: true });

        let err = controller
            .check_at(
                "u1",
                "free",
                AdmissionRequest::default(),
                RequestClass::Spend,
                now,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::StoreUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_unknown_tier() {
        let controller = controller();
        let err = controller
            .check("u1", "platinum", AdmissionRequest::default(), RequestClass::Spend)
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::UnknownTier { .. }));
    }

    #[tokio::test]
    async fn test_users_do_not_share_windows() {
        let controller = controller();
        let now = at(1_700_000_010);

        for _ in 0..10 {
            controller
                .check_at(
                    "u1",
                    "free",
                    AdmissionRequest::default(),
                    RequestClass::Spend,
                    now,
                )
                .await
                .unwrap();
        }

        let decision = controller
            .check_at(
                "u2",
                "free",
                AdmissionRequest::default(),
                RequestClass::Spend,
                now,
            )
            .await
            .unwrap();
        assert!(decision.is_allowed());
    }
}
