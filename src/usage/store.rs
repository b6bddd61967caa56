//! Usage record storage backends.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;

use super::record::UsageRecord;
use super::{UsageError, UsageResult};
use crate::types::UserId;

#[async_trait::async_trait]
pub trait UsageStore: Send + Sync {
    fn name(&self) -> &str;

    /// Insert a record, rejecting a duplicate request id. Records are
    /// write-once; only the reconciliation stamp ever changes afterwards.
    async fn insert(&self, record: UsageRecord) -> UsageResult<UsageRecord>;

    async fn get(&self, request_id: &str) -> UsageResult<Option<UsageRecord>>;

    /// Records for one user, oldest first.
    async fn list_for_user(&self, user_id: &str) -> UsageResult<Vec<UsageRecord>>;

    /// Records with an uncollected shortfall.
    async fn outstanding_shortfalls(&self) -> UsageResult<Vec<UsageRecord>>;

    async fn mark_reconciled(&self, request_id: &str) -> UsageResult<()>;
}

#[derive(Debug, Default)]
struct Inner {
    by_request: HashMap<String, UsageRecord>,
    by_user: HashMap<UserId, Vec<String>>,
}

/// In-memory usage store (testing and single-instance deployments).
#[derive(Debug, Default, Clone)]
pub struct MemoryUsageStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_count(&self) -> usize {
        self.inner.read().await.by_request.len()
    }
}

#[async_trait::async_trait]
impl UsageStore for MemoryUsageStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn insert(&self, record: UsageRecord) -> UsageResult<UsageRecord> {
        let mut inner = self.inner.write().await;
        if inner.by_request.contains_key(&record.request_id) {
            return Err(UsageError::Duplicate {
                request_id: record.request_id,
            });
        }
        inner
            .by_user
            .entry(record.user_id.clone())
            .or_default()
            .push(record.request_id.clone());
        inner
            .by_request
            .insert(record.request_id.clone(), record.clone());
        Ok(record)
    }

    async fn get(&self, request_id: &str) -> UsageResult<Option<UsageRecord>> {
        Ok(self.inner.read().await.by_request.get(request_id).cloned())
    }

    async fn list_for_user(&self, user_id: &str) -> UsageResult<Vec<UsageRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_user
            .get(user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.by_request.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn outstanding_shortfalls(&self) -> UsageResult<Vec<UsageRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .by_request
            .values()
            .filter(|r| r.needs_reconciliation())
            .cloned()
            .collect())
    }

    async fn mark_reconciled(&self, request_id: &str) -> UsageResult<()> {
        let mut inner = self.inner.write().await;
        let record = inner
            .by_request
            .get_mut(request_id)
            .ok_or_else(|| UsageError::NotFound {
                request_id: request_id.to_string(),
            })?;
        record.reconciled_at = Some(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::CostBreakdown;
    use crate::types::VendorUsage;
    use crate::usage::UsageStatus;
    use rust_decimal_macros::dec;

    fn record(request_id: &str, user: &str) -> UsageRecord {
        UsageRecord::new(
            request_id,
            user,
            "anthropic",
            "claude-sonnet",
            "pro",
            VendorUsage::new(500, 1_500),
            CostBreakdown {
                input_credits: 4,
                output_credits: 75,
                cached_credits: 0,
                cache_write_credits: 0,
                vendor_cost_cents: dec!(0.2),
                margin_applied: dec!(2.5),
            },
            UsageStatus::Success,
        )
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = MemoryUsageStore::new();
        store.insert(record("req-1", "u1")).await.unwrap();

        let found = store.get("req-1").await.unwrap().unwrap();
        assert_eq!(found.user_id, "u1");
        assert!(store.get("req-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_request_id_rejected() {
        let store = MemoryUsageStore::new();
        store.insert(record("req-1", "u1")).await.unwrap();
        let err = store.insert(record("req-1", "u1")).await.unwrap_err();
        assert!(matches!(err, UsageError::Duplicate { .. }));
        assert_eq!(store.record_count().await, 1);
    }

    #[tokio::test]
    async fn test_list_preserves_insertion_order() {
        let store = MemoryUsageStore::new();
        store.insert(record("req-1", "u1")).await.unwrap();
        store.insert(record("req-2", "u1")).await.unwrap();
        store.insert(record("req-3", "u2")).await.unwrap();

        let records = store.list_for_user("u1").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].request_id, "req-1");
        assert_eq!(records[1].request_id, "req-2");
    }

    #[tokio::test]
    async fn test_mark_reconciled() {
        let store = MemoryUsageStore::new();
        store
            .insert(record("req-1", "u1").with_charged(50, 29))
            .await
            .unwrap();
        assert_eq!(store.outstanding_shortfalls().await.unwrap().len(), 1);

        store.mark_reconciled("req-1").await.unwrap();
        assert!(store.outstanding_shortfalls().await.unwrap().is_empty());

        let err = store.mark_reconciled("ghost").await.unwrap_err();
        assert!(matches!(err, UsageError::NotFound { .. }));
    }
}
