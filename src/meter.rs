//! End-to-end metering facade.
//!
//! [`Meter`] wires the pricing table, margin resolver, cost calculator,
//! admission controller, deduction coordinator and usage store into the
//! request lifecycle the gateway drives: [`Meter::begin`] before the vendor
//! call, then exactly one of [`Meter::commit`] or [`Meter::release`].

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::admission::{
    AdmissionController, AdmissionDecision, AdmissionRequest, CounterStore, MemoryCounterStore,
};
use crate::coordinator::{CommitReceipt, DeductionCoordinator, ReleaseReceipt};
use crate::cost::{CostBreakdown, CostCalculator};
use crate::ledger::{BalanceView, LedgerEntry, LedgerStore, MemoryLedgerStore};
use crate::pricing::{MarginPolicy, MarginResolver, PricingRecord, PricingTable};
use crate::proration::{ProrationCalculator, ProrationRecord};
use crate::tiers::TierCatalog;
use crate::types::{Credits, RequestClass, VendorUsage};
use crate::usage::{
    MemoryUsageStore, ReconciliationReport, Reconciler, UsageError, UsageRecord, UsageStatus,
    UsageStore,
};
use crate::{Error, Result};

/// Everything the facade needs to know about one admitted request between
/// `begin` and its terminal call.
#[derive(Debug, Clone)]
struct RequestContext {
    user_id: String,
    tier: String,
    provider: String,
    model: String,
    request_id: String,
    estimated_credits: Credits,
    started_at: DateTime<Utc>,
}

/// Parameters for [`Meter::begin`].
#[derive(Debug, Clone)]
pub struct BeginRequest {
    pub user_id: String,
    pub tier: String,
    pub provider: String,
    pub model: String,
    /// Caller-supplied idempotency key; retries must reuse it.
    pub request_id: String,
    pub prompt_tokens: u64,
    pub max_output_tokens: u64,
}

/// Proof of admission: credits are held and the vendor call may proceed.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterTicket {
    pub reservation_id: Uuid,
    pub estimated_credits: Credits,
    pub balance_after_hold: Credits,
}

/// Result of settling a request against actual vendor usage.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitOutcome {
    pub receipt: CommitReceipt,
    pub record: UsageRecord,
}

pub struct Meter {
    pricing: Arc<RwLock<PricingTable>>,
    margins: Arc<RwLock<MarginResolver>>,
    catalog: TierCatalog,
    calculator: CostCalculator,
    coordinator: Arc<DeductionCoordinator>,
    admission: AdmissionController,
    usage_store: Arc<dyn UsageStore>,
    prorations: ProrationCalculator,
    contexts: DashMap<Uuid, RequestContext>,
}

impl std::fmt::Debug for Meter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Meter")
            .field("usage_store", &self.usage_store.name())
            .field("in_flight", &self.contexts.len())
            .finish()
    }
}

impl Meter {
    pub fn builder() -> MeterBuilder {
        MeterBuilder::default()
    }

    pub fn coordinator(&self) -> &Arc<DeductionCoordinator> {
        &self.coordinator
    }

    pub fn usage_store(&self) -> &Arc<dyn UsageStore> {
        &self.usage_store
    }

    /// Admit a request and hold its pessimistic cost estimate.
    ///
    /// Runs the admission check before touching the balance, so a
    /// rate-limited request never creates a ledger entry. Idempotent per
    /// `request_id` through the coordinator.
    pub async fn begin(&self, request: BeginRequest) -> Result<MeterTicket> {
        self.begin_at(request, Utc::now()).await
    }

    pub async fn begin_at(&self, request: BeginRequest, now: DateTime<Utc>) -> Result<MeterTicket> {
        let estimated_credits = {
            let pricing = self.pricing.read().await;
            let margins = self.margins.read().await;
            let record = pricing.resolve(&request.provider, &request.model, now)?;
            let policy = margins.resolve(&request.tier, &request.provider, now)?;
            self.calculator.estimate(
                record,
                policy,
                request.prompt_tokens,
                request.max_output_tokens,
            )?
        };

        let decision = self
            .admission
            .check_at(
                &request.user_id,
                &request.tier,
                AdmissionRequest {
                    estimated_tokens: request.prompt_tokens + request.max_output_tokens,
                    estimated_credits,
                },
                RequestClass::Spend,
                now,
            )
            .await?;
        if let AdmissionDecision::Rejected {
            dimension,
            retry_after,
            ..
        } = decision
        {
            return Err(Error::AdmissionExceeded {
                dimension,
                retry_after,
            });
        }

        let reservation = self
            .coordinator
            .reserve(&request.user_id, &request.request_id, estimated_credits)
            .await?;

        let balance_after_hold = self.coordinator.ledger().balance(&request.user_id).await?;
        self.contexts.insert(
            reservation.id,
            RequestContext {
                user_id: request.user_id,
                tier: request.tier,
                provider: request.provider,
                model: request.model,
                request_id: request.request_id,
                estimated_credits,
                started_at: now,
            },
        );

        Ok(MeterTicket {
            reservation_id: reservation.id,
            estimated_credits,
            balance_after_hold,
        })
    }

    /// Settle a delivered response against vendor-reported usage.
    ///
    /// Prices at the instant the request began, so a pricing change landing
    /// mid-request cannot reprice it. Never fails for lack of balance; an
    /// overrun the balance cannot cover surfaces as a shortfall on the
    /// receipt. Repeating a commit returns the original outcome.
    pub async fn commit(
        &self,
        reservation_id: Uuid,
        usage: VendorUsage,
        status: UsageStatus,
    ) -> Result<CommitOutcome> {
        let context = self
            .contexts
            .get(&reservation_id)
            .map(|c| c.value().clone())
            .ok_or(Error::ReservationNotFound { id: reservation_id })?;

        let breakdown = {
            let pricing = self.pricing.read().await;
            let margins = self.margins.read().await;
            let record = pricing.resolve(&context.provider, &context.model, context.started_at)?;
            let policy =
                margins.resolve(&context.tier, &context.provider, context.started_at)?;
            self.calculator.cost(record, policy, &usage)?
        };

        let receipt = self
            .coordinator
            .commit(reservation_id, breakdown.total())
            .await?;

        let mut record = UsageRecord::new(
            &context.request_id,
            &context.user_id,
            &context.provider,
            &context.model,
            &context.tier,
            usage,
            breakdown,
            status,
        )
        .with_charged(receipt.credits_charged, receipt.shortfall)
        .with_timing(context.started_at, Utc::now());
        if let Some(reservation) = self.coordinator.reservation(reservation_id) {
            record = record.with_ledger_entry(reservation.ledger_entry_id);
        }

        let record = match self.usage_store.insert(record).await {
            Ok(record) => {
                // First settlement only: a retry must not count the spend
                // against the admission windows a second time.
                self.admission
                    .settle_spend(
                        &context.user_id,
                        context.estimated_credits,
                        receipt.credits_charged,
                    )
                    .await;
                record
            }
            // Commit retry: the record from the first attempt stands.
            Err(UsageError::Duplicate { request_id }) => self
                .usage_store
                .get(&request_id)
                .await?
                .ok_or(UsageError::NotFound { request_id })?,
            Err(e) => return Err(e.into()),
        };

        Ok(CommitOutcome { receipt, record })
    }

    /// Abandon a request whose vendor call failed before producing output.
    /// The hold comes back in full and a zero-charge failure record is kept
    /// for the audit trail.
    pub async fn release(&self, reservation_id: Uuid) -> Result<ReleaseReceipt> {
        let context = self
            .contexts
            .get(&reservation_id)
            .map(|c| c.value().clone())
            .ok_or(Error::ReservationNotFound { id: reservation_id })?;

        let receipt = self.coordinator.release(reservation_id).await?;
        if self.record_failure(&context, reservation_id).await {
            // The admitted estimate never became a charge; give the day
            // window its headroom back. First release only.
            self.admission
                .settle_spend(&context.user_id, context.estimated_credits, 0)
                .await;
        }
        Ok(receipt)
    }

    /// Write the zero-charge audit record for a released request. Returns
    /// whether this call wrote it (false on a release retry).
    async fn record_failure(&self, context: &RequestContext, reservation_id: Uuid) -> bool {
        let breakdown = {
            let pricing = self.pricing.read().await;
            let margins = self.margins.read().await;
            let resolved = pricing
                .resolve(&context.provider, &context.model, context.started_at)
                .and_then(|record| {
                    let policy =
                        margins.resolve(&context.tier, &context.provider, context.started_at)?;
                    self.calculator.cost(record, policy, &VendorUsage::default())
                });
            match resolved {
                Ok(b) => b,
                // The audit record outranks the cost detail: a record with a
                // zeroed breakdown still documents that the hold was
                // released.
                Err(e) => {
                    tracing::warn!(error = %e, "failure record gets zeroed cost breakdown");
                    CostBreakdown::default()
                }
            }
        };

        let mut record = UsageRecord::new(
            &context.request_id,
            &context.user_id,
            &context.provider,
            &context.model,
            &context.tier,
            VendorUsage::default(),
            breakdown,
            UsageStatus::Failed,
        )
        .with_timing(context.started_at, Utc::now());
        if let Some(reservation) = self.coordinator.reservation(reservation_id) {
            record = record.with_ledger_entry(reservation.ledger_entry_id);
        }
        match self.usage_store.insert(record).await {
            Ok(_) => true,
            Err(UsageError::Duplicate { .. }) => false,
            Err(e) => {
                tracing::warn!(error = %e, "failed to persist failure record");
                false
            }
        }
    }

    /// Current balance summary. Read path: consults the ledger directly, no
    /// admission counters involved.
    pub async fn balance(&self, user_id: &str) -> Result<BalanceView> {
        Ok(self.coordinator.ledger().balance_view(user_id).await?)
    }

    pub async fn usage_history(&self, user_id: &str) -> Result<Vec<UsageRecord>> {
        Ok(self.usage_store.list_for_user(user_id).await?)
    }

    /// Grant a tier's monthly credit allocation for the period starting now.
    pub async fn allocate_monthly(&self, user_id: &str, tier: &str) -> Result<LedgerEntry> {
        self.allocate_monthly_at(user_id, tier, Utc::now()).await
    }

    pub async fn allocate_monthly_at(
        &self,
        user_id: &str,
        tier: &str,
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry> {
        let config = self.catalog.get(tier).ok_or_else(|| Error::UnknownTier {
            tier: tier.to_string(),
        })?;
        Ok(self
            .coordinator
            .allocate(
                user_id,
                config.monthly_credits,
                now,
                now + ChronoDuration::days(30),
            )
            .await?)
    }

    /// Prorate a mid-period tier change; pure calculation, nothing posted.
    pub fn prorate(
        &self,
        user_id: &str,
        from_tier: &str,
        to_tier: &str,
        at: DateTime<Utc>,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<ProrationRecord> {
        Ok(self
            .prorations
            .prorate(user_id, from_tier, to_tier, at, period_start, period_end)?)
    }

    /// Rough cost preview for display surfaces; never used for billing.
    pub async fn display_estimate(
        &self,
        tier: &str,
        provider: &str,
        model: &str,
        input_tokens: u64,
    ) -> Result<Credits> {
        let now = Utc::now();
        let pricing = self.pricing.read().await;
        let margins = self.margins.read().await;
        let record = pricing.resolve(provider, model, now)?;
        let policy = margins.resolve(tier, provider, now)?;
        Ok(self
            .calculator
            .display_estimate(record, policy, input_tokens)?)
    }

    /// Run one reconciliation pass over outstanding shortfalls.
    pub async fn reconcile(&self) -> Result<ReconciliationReport> {
        let reconciler = Reconciler::new(
            Arc::clone(&self.coordinator),
            Arc::clone(&self.usage_store),
        );
        Ok(reconciler.run_once().await?)
    }

    /// Publish a new vendor pricing record, superseding the active one.
    pub async fn publish_pricing(&self, record: PricingRecord) -> Result<()> {
        Ok(self.pricing.write().await.publish(record)?)
    }

    /// Publish a margin policy. Policies never retroactively reprice
    /// committed usage; only future resolutions see them.
    pub async fn publish_margin(&self, policy: MarginPolicy) -> Result<()> {
        Ok(self.margins.write().await.publish(policy)?)
    }

    /// Startup check: every tier in the catalog has an approved default
    /// margin policy.
    pub async fn verify_configuration(&self) -> Result<()> {
        let margins = self.margins.read().await;
        margins.verify_tier_defaults(
            self.catalog.tier_names().into_iter(),
            Utc::now(),
        )?;
        Ok(())
    }

    /// Estimated credits still held by in-flight requests. Diagnostic only.
    /// Settled requests do not count, even while their idempotency state is
    /// retained.
    pub fn held_estimate(&self) -> Credits {
        self.coordinator.held_credits()
    }

    /// Drop idempotency state for requests settled longer than `retention`
    /// ago. Run periodically; in-flight requests are untouched.
    pub fn prune_settled(&self, retention: ChronoDuration) -> usize {
        let removed = self.coordinator.prune_terminal(retention);
        self.contexts
            .retain(|id, _| self.coordinator.reservation(*id).is_some());
        removed
    }
}

#[derive(Default)]
pub struct MeterBuilder {
    pricing: PricingTable,
    margins: MarginResolver,
    catalog: Option<TierCatalog>,
    calculator: Option<CostCalculator>,
    ledger: Option<Arc<dyn LedgerStore>>,
    counters: Option<Arc<dyn CounterStore>>,
    usage_store: Option<Arc<dyn UsageStore>>,
}

impl MeterBuilder {
    pub fn pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn pricing_record(mut self, record: PricingRecord) -> Result<Self> {
        self.pricing.publish(record)?;
        Ok(self)
    }

    pub fn margin_policy(mut self, policy: MarginPolicy) -> Result<Self> {
        self.margins.publish(policy)?;
        Ok(self)
    }

    pub fn catalog(mut self, catalog: TierCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn credit_usd_value(mut self, value: Decimal) -> Self {
        self.calculator = Some(CostCalculator::new(value));
        self
    }

    pub fn ledger(mut self, ledger: Arc<dyn LedgerStore>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn counters(mut self, counters: Arc<dyn CounterStore>) -> Self {
        self.counters = Some(counters);
        self
    }

    pub fn usage_store(mut self, usage_store: Arc<dyn UsageStore>) -> Self {
        self.usage_store = Some(usage_store);
        self
    }

    /// Memory-backed stores fill any backend left unset.
    pub fn build(self) -> Meter {
        let catalog = self.catalog.unwrap_or_default();
        let ledger = self
            .ledger
            .unwrap_or_else(|| Arc::new(MemoryLedgerStore::new()));
        let counters = self
            .counters
            .unwrap_or_else(|| Arc::new(MemoryCounterStore::new()));
        let usage_store = self
            .usage_store
            .unwrap_or_else(|| Arc::new(MemoryUsageStore::new()));

        Meter {
            pricing: Arc::new(RwLock::new(self.pricing)),
            margins: Arc::new(RwLock::new(self.margins)),
            calculator: self.calculator.unwrap_or_default(),
            coordinator: Arc::new(DeductionCoordinator::new(ledger)),
            admission: AdmissionController::new(catalog.clone(), counters),
            usage_store,
            prorations: ProrationCalculator::new(catalog.clone()),
            catalog,
            contexts: DashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::MarginScope;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn meter() -> Meter {
        let effective = ts(1_600_000_000);
        Meter::builder()
            .pricing_record(PricingRecord::new(
                "anthropic",
                "claude-sonnet",
                dec!(125),
                dec!(1000),
                effective,
            ))
            .unwrap()
            .margin_policy(MarginPolicy::new(
                MarginScope::Tier {
                    tier: "pro".to_string(),
                },
                dec!(2.5),
                effective,
            ))
            .unwrap()
            .build()
    }

    fn begin_request(request_id: &str) -> BeginRequest {
        BeginRequest {
            user_id: "u1".to_string(),
            tier: "pro".to_string(),
            provider: "anthropic".to_string(),
            model: "claude-sonnet".to_string(),
            request_id: request_id.to_string(),
            prompt_tokens: 2_000,
            max_output_tokens: 4_000,
        }
    }

    #[tokio::test]
    async fn test_begin_holds_estimate() {
        let meter = meter();
        meter.allocate_monthly("u1", "pro").await.unwrap();

        let ticket = meter
            .begin_at(begin_request("req-1"), ts(1_700_000_000))
            .await
            .unwrap();
        // 2000 prompt @ 7/Ktok + 4000 max output @ 50/Ktok
        assert_eq!(ticket.estimated_credits, 214);
        assert_eq!(ticket.balance_after_hold, 60_000 - 214);
    }

    #[tokio::test]
    async fn test_commit_settles_to_actuals() {
        let meter = meter();
        meter.allocate_monthly("u1", "pro").await.unwrap();
        let ticket = meter
            .begin_at(begin_request("req-1"), ts(1_700_000_000))
            .await
            .unwrap();

        let outcome = meter
            .commit(
                ticket.reservation_id,
                VendorUsage::new(2_000, 1_000),
                UsageStatus::Success,
            )
            .await
            .unwrap();

        // input 14 + output 50
        assert_eq!(outcome.receipt.credits_charged, 64);
        assert_eq!(outcome.receipt.shortfall, 0);
        assert_eq!(outcome.record.credits_charged, 64);

        // The audit record links back to the settled ledger entry and spans
        // the actual request lifetime.
        let entry_id = outcome.record.ledger_entry_id.unwrap();
        let entry = meter
            .coordinator()
            .ledger()
            .get(&entry_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.correlation_id.as_deref(), Some("req-1"));
        assert_eq!(entry.amount, -64);
        assert_eq!(outcome.record.started_at, ts(1_700_000_000));
        assert!(outcome.record.completed_at >= outcome.record.started_at);

        let view = meter.balance("u1").await.unwrap();
        assert_eq!(view.remaining, 60_000 - 64);
    }

    #[tokio::test]
    async fn test_release_restores_hold() {
        let meter = meter();
        meter.allocate_monthly("u1", "pro").await.unwrap();
        let ticket = meter
            .begin_at(begin_request("req-1"), ts(1_700_000_000))
            .await
            .unwrap();

        let receipt = meter.release(ticket.reservation_id).await.unwrap();
        assert_eq!(receipt.balance_after, 60_000);

        // Audit trail keeps a zero-charge failure record, linked to the
        // reversed hold.
        let history = meter.usage_history("u1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, UsageStatus::Failed);
        assert_eq!(history[0].credits_charged, 0);
        assert!(history[0].ledger_entry_id.is_some());
        assert_eq!(history[0].started_at, ts(1_700_000_000));
    }

    #[tokio::test]
    async fn test_admission_rejection_precedes_reservation() {
        let meter = meter();
        meter.allocate_monthly("u1", "pro").await.unwrap();
        let now = ts(1_700_000_000);

        // Pro tier: 200_000 tokens per minute. A single oversized request
        // bounces off admission without touching the ledger.
        let mut request = begin_request("req-big");
        request.max_output_tokens = 250_000;
        let err = meter.begin_at(request, now).await.unwrap_err();
        assert!(matches!(err, Error::AdmissionExceeded { .. }));

        let view = meter.balance("u1").await.unwrap();
        assert_eq!(view.remaining, 60_000);
    }

    #[tokio::test]
    async fn test_insufficient_credits() {
        let meter = meter();
        // No allocation at all.
        let err = meter
            .begin_at(begin_request("req-1"), ts(1_700_000_000))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientCredits {
                required: 214,
                available: 0
            }
        ));
    }

    #[tokio::test]
    async fn test_commit_prices_at_begin_time() {
        let meter = meter();
        meter.allocate_monthly("u1", "pro").await.unwrap();
        let ticket = meter
            .begin_at(begin_request("req-1"), ts(1_700_000_000))
            .await
            .unwrap();

        // Price hike lands while the request is in flight.
        meter
            .publish_pricing(PricingRecord::new(
                "anthropic",
                "claude-sonnet",
                dec!(250),
                dec!(2000),
                ts(1_700_000_001),
            ))
            .await
            .unwrap();

        let outcome = meter
            .commit(
                ticket.reservation_id,
                VendorUsage::new(2_000, 1_000),
                UsageStatus::Success,
            )
            .await
            .unwrap();
        // Still the old rates: 14 + 50.
        assert_eq!(outcome.receipt.credits_charged, 64);
    }

    #[tokio::test]
    async fn test_shortfall_surfaces_and_reconciles() {
        let effective = ts(1_600_000_000);
        let meter = Meter::builder()
            .pricing_record(PricingRecord::new(
                "anthropic",
                "claude-sonnet",
                dec!(125),
                dec!(1000),
                effective,
            ))
            .unwrap()
            .margin_policy(MarginPolicy::new(
                MarginScope::Tier {
                    tier: "pro".to_string(),
                },
                dec!(2.5),
                effective,
            ))
            .unwrap()
            .build();

        // Just enough for the hold, nowhere near the real cost.
        meter
            .coordinator()
            .allocate("u1", 220, ts(1_700_000_000), ts(1_702_592_000))
            .await
            .unwrap();

        let ticket = meter
            .begin_at(begin_request("req-1"), ts(1_700_000_000))
            .await
            .unwrap();
        let outcome = meter
            .commit(
                ticket.reservation_id,
                // 14 + 500 = 514 credits, balance only covers 220.
                VendorUsage::new(2_000, 10_000),
                UsageStatus::Success,
            )
            .await
            .unwrap();

        assert_eq!(outcome.receipt.credits_charged, 220);
        assert_eq!(outcome.receipt.shortfall, 294);
        assert!(outcome.record.needs_reconciliation());

        // Nothing to collect until a new allocation lands.
        let report = meter.reconcile().await.unwrap();
        assert_eq!(report.collected, 0);
        assert_eq!(report.remaining, 1);

        meter
            .coordinator()
            .allocate("u1", 1_000, ts(1_702_592_000), ts(1_705_184_000))
            .await
            .unwrap();
        let report = meter.reconcile().await.unwrap();
        assert_eq!(report.collected, 1);

        let view = meter.balance("u1").await.unwrap();
        assert_eq!(view.remaining, 1_000 - 294);
    }

    #[tokio::test]
    async fn test_held_estimate_excludes_settled_requests() {
        let meter = meter();
        meter.allocate_monthly("u1", "pro").await.unwrap();

        let ticket = meter
            .begin_at(begin_request("req-1"), ts(1_700_000_000))
            .await
            .unwrap();
        assert_eq!(meter.held_estimate(), 214);

        meter
            .commit(
                ticket.reservation_id,
                VendorUsage::new(2_000, 1_000),
                UsageStatus::Success,
            )
            .await
            .unwrap();
        assert_eq!(meter.held_estimate(), 0);
    }

    #[tokio::test]
    async fn test_prune_settled_drops_only_terminal_state() {
        let meter = meter();
        meter.allocate_monthly("u1", "pro").await.unwrap();

        let done = meter
            .begin_at(begin_request("req-done"), ts(1_700_000_000))
            .await
            .unwrap();
        meter
            .commit(
                done.reservation_id,
                VendorUsage::new(2_000, 1_000),
                UsageStatus::Success,
            )
            .await
            .unwrap();
        let inflight = meter
            .begin_at(begin_request("req-inflight"), ts(1_700_000_001))
            .await
            .unwrap();

        assert_eq!(meter.prune_settled(ChronoDuration::zero()), 1);

        // The in-flight request still settles normally.
        let outcome = meter
            .commit(
                inflight.reservation_id,
                VendorUsage::new(2_000, 1_000),
                UsageStatus::Success,
            )
            .await
            .unwrap();
        assert_eq!(outcome.receipt.credits_charged, 64);

        // The pruned one is gone from the retry cache.
        let err = meter
            .commit(
                done.reservation_id,
                VendorUsage::new(2_000, 1_000),
                UsageStatus::Success,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReservationNotFound { .. }));
    }

    #[tokio::test]
    async fn test_release_records_audit_even_without_cost_detail() {
        // A release whose cost context cannot be rebuilt still writes the
        // failure record, with a zeroed breakdown.
        let meter = meter();
        meter.allocate_monthly("u1", "pro").await.unwrap();
        let ticket = meter
            .begin_at(begin_request("req-1"), ts(1_700_000_000))
            .await
            .unwrap();

        let context = meter
            .contexts
            .get(&ticket.reservation_id)
            .map(|c| c.value().clone())
            .unwrap();
        // Vendor identifiers that resolve to no pricing record.
        let broken = RequestContext {
            model: "decommissioned-model".to_string(),
            ..context
        };
        assert!(meter.record_failure(&broken, ticket.reservation_id).await);

        let history = meter.usage_history("u1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, UsageStatus::Failed);
        assert_eq!(history[0].credits_charged, 0);
        assert_eq!(history[0].vendor_cost_cents, Decimal::ZERO);

        // The retry path reports the record as already written.
        assert!(!meter.record_failure(&broken, ticket.reservation_id).await);
    }

    #[tokio::test]
    async fn test_verify_configuration_needs_all_tier_defaults() {
        let meter = meter();
        // Only "pro" carries a default; free and business do not.
        assert!(meter.verify_configuration().await.is_err());
    }

    #[tokio::test]
    async fn test_display_estimate_matches_ratio() {
        let meter = meter();
        let estimate = meter
            .display_estimate("pro", "anthropic", "claude-sonnet", 1_000)
            .await
            .unwrap();
        assert_eq!(estimate, 507);
    }
}
