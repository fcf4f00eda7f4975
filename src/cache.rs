//! Balance cache in front of the ledger store
//!
//! Reads go through the cache and repopulate it on miss. Mutations go
//! straight to the store with an optimistic version check and then invalidate
//! the cached entry instead of updating it. A failing backend is logged and
//! bypassed; callers never see `CacheError`.

use crate::{
    common::types::{Account, TransactionType, TxContext, UserId},
    errors::{CacheError, StoreError, StoreResult},
    money::Amount,
    storage::{BalanceUpdate, Store},
};
use lru::LruCache;
use rand::Rng;
use std::{
    num::NonZeroUsize,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

/// Key/value backend for cached balances
pub trait CacheBackend: Send + Sync {
    fn get(&self, user_id: &str) -> Result<Option<Amount>, CacheError>;
    fn put(&self, user_id: &str, balance: Amount) -> Result<(), CacheError>;
    fn remove(&self, user_id: &str) -> Result<(), CacheError>;
}

struct Entry {
    balance: Amount,
    stored_at: Instant,
}

/// Bounded in-process backend; entries expire after `ttl`
pub struct LruCacheBackend {
    entries: Mutex<LruCache<UserId, Entry>>,
    ttl: Duration,
}

impl LruCacheBackend {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LruCache<UserId, Entry>>, CacheError> {
        self.entries
            .lock()
            .map_err(|_| CacheError::Unavailable("cache lock poisoned".to_string()))
    }
}

impl CacheBackend for LruCacheBackend {
    fn get(&self, user_id: &str) -> Result<Option<Amount>, CacheError> {
        let mut entries = self.lock()?;
        let expired = match entries.get(user_id) {
            Some(entry) if entry.stored_at.elapsed() <= self.ttl => return Ok(Some(entry.balance)),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(user_id);
        }
        Ok(None)
    }

    fn put(&self, user_id: &str, balance: Amount) -> Result<(), CacheError> {
        self.lock()?.put(
            user_id.to_string(),
            Entry {
                balance,
                stored_at: Instant::now(),
            },
        );
        Ok(())
    }

    fn remove(&self, user_id: &str) -> Result<(), CacheError> {
        self.lock()?.pop(user_id);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_millis(25),
        }
    }
}

pub struct BalanceCache {
    store: Arc<dyn Store>,
    backend: Arc<dyn CacheBackend>,
    retry: RetryPolicy,
}

impl BalanceCache {
    pub fn new(store: Arc<dyn Store>, backend: Arc<dyn CacheBackend>, retry: RetryPolicy) -> Self {
        Self { store, backend, retry }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Available balance; an unknown account reads as zero
    pub async fn get_balance(&self, user_id: &str) -> StoreResult<Amount> {
        match self.backend.get(user_id) {
            Ok(Some(balance)) => return Ok(balance),
            Ok(None) => {}
            Err(e) => tracing::warn!(user_id, error = %e, "balance cache read failed, using store"),
        }

        let balance = self
            .store
            .get_account(user_id)
            .await?
            .map(|account| account.available)
            .unwrap_or(Amount::ZERO);

        if let Err(e) = self.backend.put(user_id, balance) {
            tracing::warn!(user_id, error = %e, "balance cache refill failed");
        }
        Ok(balance)
    }

    pub fn invalidate(&self, user_id: &str) {
        if let Err(e) = self.backend.remove(user_id) {
            tracing::warn!(user_id, error = %e, "balance cache invalidation failed");
        }
    }

    /// Debit `amount` from the available balance with bounded optimistic retry
    pub async fn deduct(
        &self,
        user_id: &str,
        amount: Amount,
        tx_type: TransactionType,
        context: TxContext,
    ) -> StoreResult<Account> {
        require_positive(amount)?;

        let cached = self.get_balance(user_id).await?;
        if cached < amount {
            return Err(StoreError::InsufficientBalance {
                user_id: user_id.to_string(),
                required: amount,
                available: cached,
            });
        }

        self.mutate(user_id, -amount, tx_type, context).await
    }

    /// Credit `amount` to the available balance, opening the account if needed
    pub async fn add(
        &self,
        user_id: &str,
        amount: Amount,
        tx_type: TransactionType,
        context: TxContext,
    ) -> StoreResult<Account> {
        require_positive(amount)?;
        self.mutate(user_id, amount, tx_type, context).await
    }

    async fn mutate(
        &self,
        user_id: &str,
        delta: Amount,
        tx_type: TransactionType,
        context: TxContext,
    ) -> StoreResult<Account> {
        let mut attempt = 0;
        loop {
            let current = self.store.get_account(user_id).await?;
            let expected_version = match &current {
                Some(account) => account.version,
                None if delta.is_negative() => {
                    return Err(StoreError::AccountNotFound(user_id.to_string()))
                }
                None => 0,
            };

            let update = BalanceUpdate {
                user_id: user_id.to_string(),
                amount: delta,
                expected_version: Some(expected_version),
                tx_type,
                context: context.clone(),
            };

            match self.store.apply_delta(update).await {
                Ok((account, _)) => {
                    self.invalidate(user_id);
                    return Ok(account);
                }
                Err(StoreError::VersionConflict { .. }) if attempt < self.retry.max_retries => {
                    attempt += 1;
                    tracing::debug!(user_id, attempt, "version conflict, retrying");
                    tokio::time::sleep(self.backoff(attempt)).await;
                }
                Err(e) => {
                    self.invalidate(user_id);
                    return Err(e);
                }
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.retry.backoff.saturating_mul(attempt);
        let jitter_cap = self.retry.backoff.as_millis() as u64 / 2;
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_cap)
        };
        base + Duration::from_millis(jitter)
    }
}

fn require_positive(amount: Amount) -> StoreResult<()> {
    if amount.is_positive() {
        Ok(())
    } else {
        Err(StoreError::InvalidAmount(format!("{} must be positive", amount)))
    }
}
