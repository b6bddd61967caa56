//! Redis counter backend for multi-instance deployments.
//!
//! One key per user per window, expired a little after the window closes so
//! stale counters clean themselves up.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::store::{CounterStore, WindowUsage};
use super::{AdmissionError, AdmissionResult, StoreResultExt, SECS_PER_DAY, SECS_PER_MINUTE};
use crate::types::Credits;

#[derive(Clone, Debug)]
pub struct RedisCounterConfig {
    pub key_prefix: String,
    pub connection_timeout: Duration,
    pub response_timeout: Duration,
    /// Maximum retry attempts for transient failures.
    pub max_retries: u32,
    /// Initial backoff duration for retries.
    pub initial_backoff: Duration,
    /// Maximum backoff duration.
    pub max_backoff: Duration,
}

impl Default for RedisCounterConfig {
    fn default() -> Self {
        Self {
            key_prefix: "meter:window:".to_string(),
            connection_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(30),
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RedisCounterConfig {
    pub fn prefix(mut self, prefix: impl Into<String>) -> AdmissionResult<Self> {
        let prefix = prefix.into();
        if !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
        {
            return Err(AdmissionError::StoreUnavailable {
                message: format!(
                    "Invalid key prefix '{}': only ASCII alphanumeric, underscore, and colon allowed",
                    prefix
                ),
            });
        }
        self.key_prefix = prefix;
        Ok(self)
    }
}

pub struct RedisCounterStore {
    client: Arc<redis::Client>,
    config: RedisCounterConfig,
}

impl RedisCounterStore {
    pub fn new(redis_url: &str) -> Result<Self, redis::RedisError> {
        Self::from_config(redis_url, RedisCounterConfig::default())
    }

    pub fn from_config(
        redis_url: &str,
        config: RedisCounterConfig,
    ) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client: Arc::new(client),
            config,
        })
    }

    fn requests_key(&self, user_id: &str, minute_key: i64) -> String {
        format!("{}req:{}:{}", self.config.key_prefix, user_id, minute_key)
    }

    fn tokens_key(&self, user_id: &str, minute_key: i64) -> String {
        format!("{}tok:{}:{}", self.config.key_prefix, user_id, minute_key)
    }

    fn credits_key(&self, user_id: &str, day_key: i64) -> String {
        format!("{}cr:{}:{}", self.config.key_prefix, user_id, day_key)
    }

    async fn get_connection(&self) -> AdmissionResult<redis::aio::MultiplexedConnection> {
        super::with_retry(
            self.config.max_retries,
            self.config.initial_backoff,
            self.config.max_backoff,
            || async {
                tokio::time::timeout(
                    self.config.connection_timeout,
                    self.client.get_multiplexed_async_connection(),
                )
                .await
                .store_err_ctx("connection timeout")?
                .store_err()
            },
        )
        .await
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn window_usage(
        &self,
        user_id: &str,
        minute_key: i64,
        day_key: i64,
    ) -> AdmissionResult<WindowUsage> {
        let mut conn = self.get_connection().await?;

        let (requests, tokens, credits): (Option<u64>, Option<u64>, Option<Credits>) = redis::pipe()
            .cmd("GET")
            .arg(self.requests_key(user_id, minute_key))
            .cmd("GET")
            .arg(self.tokens_key(user_id, minute_key))
            .cmd("GET")
            .arg(self.credits_key(user_id, day_key))
            .query_async(&mut conn)
            .await
            .store_err()?;

        Ok(WindowUsage {
            requests: requests.unwrap_or(0),
            tokens: tokens.unwrap_or(0),
            credits: credits.unwrap_or(0),
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
        let mut conn = self.get_connection().await?;
        let requests_key = self.requests_key(user_id, minute_key);
        let tokens_key = self.tokens_key(user_id, minute_key);
        let credits_key = self.credits_key(user_id, day_key);

        // Expiry trails the window by one window length so late reads within
        // the window never miss the counter.
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("INCR")
            .arg(&requests_key)
            .cmd("EXPIRE")
            .arg(&requests_key)
            .arg(SECS_PER_MINUTE * 2);
        if estimated_tokens > 0 {
            pipe.cmd("INCRBY")
                .arg(&tokens_key)
                .arg(estimated_tokens)
                .cmd("EXPIRE")
                .arg(&tokens_key)
                .arg(SECS_PER_MINUTE * 2);
        }
        if estimated_credits != 0 {
            pipe.cmd("INCRBY")
                .arg(&credits_key)
                .arg(estimated_credits)
                .cmd("EXPIRE")
                .arg(&credits_key)
                .arg(SECS_PER_DAY * 2);
        }
        pipe.query_async::<()>(&mut conn).await.store_err()?;
        Ok(())
    }

    async fn adjust_credits(
        &self,
        user_id: &str,
        day_key: i64,
        delta: Credits,
    ) -> AdmissionResult<()> {
        if delta == 0 {
            return Ok(());
        }
        let mut conn = self.get_connection().await?;
        let credits_key = self.credits_key(user_id, day_key);

        let (after,): (Credits,) = redis::pipe()
            .atomic()
            .cmd("INCRBY")
            .arg(&credits_key)
            .arg(delta)
            .cmd("EXPIRE")
            .arg(&credits_key)
            .arg(SECS_PER_DAY * 2)
            .ignore()
            .query_async(&mut conn)
            .await
            .store_err()?;

        // The counter never reads below zero: an adjustment landing after the
        // day rolled over has no estimate left to subtract from.
        if after < 0 {
            let _: () = redis::cmd("SET")
                .arg(&credits_key)
                .arg(0)
                .arg("KEEPTTL")
                .query_async(&mut conn)
                .await
                .store_err()?;
        }
        Ok(())
    }
}
