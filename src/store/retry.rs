//! Bounded timeout + retry around cold-store calls
//!
//! Every cold call gets a per-attempt timeout; timeouts and I/O failures are
//! retried with exponential backoff. When retries run out the caller sees a
//! `StoreError::Transient` and the next scheduled run picks the work up again.

use super::cold::{ColdStore, StoredObject, WriteCondition};
use super::StoreError;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

#[derive(Debug)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    max_retries: u32,
    current_attempt: u32,
}

#[derive(Debug)]
pub struct MaxRetriesExceeded;

impl std::fmt::Display for MaxRetriesExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Maximum retry attempts exceeded")
    }
}

impl std::error::Error for MaxRetriesExceeded {}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, retries: u32) -> Self {
        Self {
            initial_delay: initial,
            max_delay: max,
            max_retries: retries,
            current_attempt: 0,
        }
    }

    /// Delay before the next attempt (without sleeping)
    pub fn next_delay(&self) -> Duration {
        let factor = 2_u32.saturating_pow(self.current_attempt);
        std::cmp::min(self.initial_delay.saturating_mul(factor), self.max_delay)
    }

    pub async fn sleep(&mut self) -> Result<(), MaxRetriesExceeded> {
        if self.current_attempt >= self.max_retries {
            return Err(MaxRetriesExceeded);
        }

        let delay = self.next_delay();

        log::warn!(
            "⏳ Retry attempt {} of {} in {}ms",
            self.current_attempt + 1,
            self.max_retries,
            delay.as_millis()
        );

        sleep(delay).await;
        self.current_attempt += 1;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Per-attempt timeout
    pub timeout: Duration,
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_retries: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.initial_delay, self.max_delay, self.max_retries)
    }
}

/// Cold store decorator adding timeouts and retries to every call
pub struct ResilientColdStore {
    inner: Arc<dyn ColdStore>,
    policy: RetryPolicy,
}

impl ResilientColdStore {
    pub fn new(inner: Arc<dyn ColdStore>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn with_retry<T, F, Fut>(&self, op: &str, path: &str, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, StoreError>> + Send,
        T: Send,
    {
        let mut backoff = self.policy.backoff();

        loop {
            let last_error = match timeout(self.policy.timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if !e.is_retryable() => return Err(e),
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("timed out after {}ms", self.policy.timeout.as_millis()),
            };

            log::warn!("⚠️  Cold {} {} failed: {}", op, path, last_error);

            if backoff.sleep().await.is_err() {
                log::error!(
                    "❌ Cold {} {} gave up after {} retries",
                    op,
                    path,
                    self.policy.max_retries
                );
                return Err(StoreError::Transient(format!(
                    "cold {} {}: {}",
                    op, path, last_error
                )));
            }
        }
    }
}

#[async_trait]
impl ColdStore for ResilientColdStore {
    async fn get_object(&self, path: &str) -> Result<Option<StoredObject>, StoreError> {
        match self.with_retry("get", path, || self.inner.get_object(path)).await {
            Err(StoreError::NotFound(_)) => Ok(None),
            other => other,
        }
    }

    async fn put_object(
        &self,
        path: &str,
        body: Vec<u8>,
        condition: WriteCondition,
    ) -> Result<String, StoreError> {
        self.with_retry("put", path, || {
            self.inner.put_object(path, body.clone(), condition.clone())
        })
        .await
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.with_retry("list", prefix, || self.inner.list_objects(prefix))
            .await
    }

    fn backend_type(&self) -> &'static str {
        self.inner.backend_type()
    }
}
