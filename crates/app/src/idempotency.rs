use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use thiserror::Error;
use webhook_gate_core::{IdempotencyCache, IdempotencyError, IdempotencyRecord, ShouldProcess};
use webhook_gate_storage::{IdempotencyRepository, IdempotencyStoreError};

const SWEEP_BATCH_LIMIT: i64 = 1000;

/// Store consulted by the guard to absorb duplicate deliveries.
#[derive(Clone)]
pub enum IdempotencyBackend {
    /// Process-local; the at-most-once guarantee resets on restart.
    Memory(Arc<IdempotencyCache>),
    /// SQLite-backed; survives restarts.
    Sqlite(IdempotencyRepository),
}

impl IdempotencyBackend {
    pub fn memory() -> Self {
        Self::Memory(Arc::new(IdempotencyCache::new()))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::Sqlite(_) => "sqlite",
        }
    }

    pub async fn should_process(
        &self,
        webhook_id: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<ShouldProcess, BackendError> {
        match self {
            Self::Memory(cache) => Ok(cache.should_process_at(webhook_id, ttl, now)?),
            Self::Sqlite(repository) => {
                let record = IdempotencyRecord::issue(webhook_id, now, ttl)?;
                Ok(repository.check_and_record(&record).await?)
            }
        }
    }

    /// Removes every record that expired before `now`.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<u64, BackendError> {
        match self {
            Self::Memory(cache) => Ok(cache.sweep_expired(now) as u64),
            Self::Sqlite(repository) => {
                let mut total = 0u64;
                loop {
                    let deleted = repository
                        .delete_expired_batch(now, SWEEP_BATCH_LIMIT)
                        .await?;
                    total += deleted;
                    if deleted < SWEEP_BATCH_LIMIT as u64 {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
                Ok(total)
            }
        }
    }

    pub async fn len(&self) -> Result<u64, BackendError> {
        match self {
            Self::Memory(cache) => Ok(cache.len() as u64),
            Self::Sqlite(repository) => Ok(repository.count().await?),
        }
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Record(#[from] IdempotencyError),
    #[error("idempotency store failure: {0}")]
    Store(#[from] IdempotencyStoreError),
}
