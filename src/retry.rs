use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use crate::error::StoreError;
use crate::store::{CellUpdate, LedgerStore, Row, RowRange, SheetWrite};

const MAX_DELAY_MS: u64 = 60_000;

/// Bounded exponential backoff shared by every collaborator call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 2_000,
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            multiplier: 1,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.multiplier.max(1))
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(MAX_DELAY_MS))
    }

    /// Runs `op` until it succeeds or the attempt budget is spent; the last
    /// error is returned unchanged.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < attempts => {
                    let delay = self.delay(attempt);
                    warn!(%label, attempt, ?delay, error = %err, "call failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Applies a [`RetryPolicy`] to every call of the wrapped store.
pub struct RetryingLedger<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S> RetryingLedger<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<S: LedgerStore> LedgerStore for RetryingLedger<S> {
    async fn read_range(&self, sheet: &str, range: RowRange) -> Result<Vec<Row>, StoreError> {
        self.policy
            .run("read_range", || self.inner.read_range(sheet, range))
            .await
    }

    async fn append_rows(&self, sheet: &str, rows: Vec<Row>) -> Result<(), StoreError> {
        self.policy
            .run("append_rows", || self.inner.append_rows(sheet, rows.clone()))
            .await
    }

    async fn update_cells(&self, sheet: &str, updates: Vec<CellUpdate>) -> Result<(), StoreError> {
        self.policy
            .run("update_cells", || self.inner.update_cells(sheet, updates.clone()))
            .await
    }

    async fn apply_batch(&self, writes: Vec<SheetWrite>) -> Result<(), StoreError> {
        self.policy
            .run("apply_batch", || self.inner.apply_batch(writes.clone()))
            .await
    }
}
