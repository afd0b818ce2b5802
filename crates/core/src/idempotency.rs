use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use thiserror::Error;

use crate::Clock;

/// Default lifetime of an idempotency record (24 hours).
pub const DEFAULT_TTL: Duration = Duration::from_millis(86_400_000);

/// Default cadence of the expiry sweep (1 hour).
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(3_600_000);

/// Longest accepted record lifetime (100 years). Keeps every expiry inside
/// the four-digit years that RFC 3339 storage compares correctly.
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 86_400);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdempotencyError {
    #[error("webhook id is required")]
    MissingIdentifier,
    #[error("idempotency ttl is out of range")]
    TtlOutOfRange,
}

/// A processed webhook id and the window during which repeats are absorbed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord {
    pub webhook_id: String,
    pub processed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Builds the record stored on first acceptance of `webhook_id`.
    pub fn issue(
        webhook_id: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Self, IdempotencyError> {
        if webhook_id.is_empty() {
            return Err(IdempotencyError::MissingIdentifier);
        }
        if ttl > MAX_TTL {
            return Err(IdempotencyError::TtlOutOfRange);
        }
        let ttl = ChronoDuration::from_std(ttl).map_err(|_| IdempotencyError::TtlOutOfRange)?;
        let expires_at = now
            .checked_add_signed(ttl)
            .ok_or(IdempotencyError::TtlOutOfRange)?;

        Ok(Self {
            webhook_id: webhook_id.to_string(),
            processed_at: now,
            expires_at,
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Outcome of a check-and-set against an idempotency store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShouldProcess {
    /// First sighting (or the previous record had expired); a new record was stored.
    Fresh(IdempotencyRecord),
    /// A live record exists; the caller must not process the webhook again.
    Duplicate(IdempotencyRecord),
}

impl ShouldProcess {
    pub fn already_processed(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }

    pub fn record(&self) -> &IdempotencyRecord {
        match self {
            Self::Fresh(record) | Self::Duplicate(record) => record,
        }
    }
}

/// Process-local store of processed webhook ids.
///
/// The check-and-set in [`IdempotencyCache::should_process_at`] runs under a
/// single lock acquisition, so concurrent requests carrying the same id can
/// never both observe a fresh outcome.
///
/// Scaling limit: [`IdempotencyCache::sweep_expired`] scans every entry while
/// holding the lock. That is fine for tens of thousands of live ids; larger
/// deployments should use the SQLite-backed store, which sweeps in bounded
/// batches. Nothing survives a restart.
pub struct IdempotencyCache {
    records: Mutex<HashMap<String, IdempotencyRecord>>,
    clock: Clock,
}

impl IdempotencyCache {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            clock: Arc::new(Utc::now),
        }
    }

    /// Replaces the wall clock, mainly so tests can simulate expiry.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn should_process(
        &self,
        webhook_id: &str,
        ttl: Duration,
    ) -> Result<ShouldProcess, IdempotencyError> {
        self.should_process_at(webhook_id, ttl, (self.clock)())
    }

    pub fn should_process_at(
        &self,
        webhook_id: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<ShouldProcess, IdempotencyError> {
        let fresh = IdempotencyRecord::issue(webhook_id, now, ttl)?;

        let mut records = self.lock();
        match records.get(webhook_id) {
            Some(existing) if !existing.is_expired(now) => {
                Ok(ShouldProcess::Duplicate(existing.clone()))
            }
            _ => {
                records.insert(fresh.webhook_id.clone(), fresh.clone());
                Ok(ShouldProcess::Fresh(fresh))
            }
        }
    }

    /// Deletes expired records and returns how many were removed.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut records = self.lock();
        let before = records.len();
        records.retain(|_, record| !record.is_expired(now));
        before - records.len()
    }

    pub fn get(&self, webhook_id: &str) -> Option<IdempotencyRecord> {
        self.lock().get(webhook_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // A panic while holding the lock cannot leave a half-written record, so
    // poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, IdempotencyRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for IdempotencyCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn fixed_now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .expect("fixed time")
            .with_timezone(&Utc)
    }

    fn manual_clock(start: DateTime<Utc>) -> (Clock, Arc<Mutex<DateTime<Utc>>>) {
        let current = Arc::new(Mutex::new(start));
        let handle = current.clone();
        let clock: Clock = Arc::new(move || *handle.lock().expect("clock lock"));
        (clock, current)
    }

    #[test]
    fn second_call_within_ttl_is_duplicate() {
        let cache = IdempotencyCache::new();
        let ttl = Duration::from_secs(60);

        let first = cache.should_process("id1", ttl).expect("first");
        let second = cache.should_process("id1", ttl).expect("second");

        assert!(!first.already_processed());
        assert!(second.already_processed());
        assert_eq!(first.record(), second.record());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn duplicate_does_not_extend_the_record() {
        let (clock, current) = manual_clock(fixed_now());
        let cache = IdempotencyCache::new().with_clock(clock);
        let ttl = Duration::from_secs(60);

        let first = cache.should_process("id1", ttl).expect("first");
        *current.lock().expect("clock") = fixed_now() + ChronoDuration::seconds(30);
        let second = cache.should_process("id1", ttl).expect("second");

        assert_eq!(second.record().processed_at, first.record().processed_at);
        assert_eq!(second.record().expires_at, first.record().expires_at);
    }

    #[test]
    fn record_is_fresh_again_after_ttl_elapses() {
        let (clock, current) = manual_clock(fixed_now());
        let cache = IdempotencyCache::new().with_clock(clock);
        let ttl = Duration::from_millis(1_000);

        assert!(!cache.should_process("id1", ttl).expect("first").already_processed());

        *current.lock().expect("clock") = fixed_now() + ChronoDuration::milliseconds(1_000);
        assert!(
            cache.should_process("id1", ttl).expect("at expiry").already_processed(),
            "record is still live at exactly expires_at"
        );

        *current.lock().expect("clock") = fixed_now() + ChronoDuration::milliseconds(1_001);
        let after = cache.should_process("id1", ttl).expect("after expiry");
        assert!(!after.already_processed());
        assert_eq!(
            after.record().processed_at,
            fixed_now() + ChronoDuration::milliseconds(1_001)
        );
    }

    #[test]
    fn empty_id_is_rejected() {
        let cache = IdempotencyCache::new();
        assert_eq!(
            cache.should_process("", DEFAULT_TTL),
            Err(IdempotencyError::MissingIdentifier)
        );
        assert!(cache.is_empty());
    }

    #[test]
    fn oversized_ttl_is_rejected() {
        let cache = IdempotencyCache::new();
        assert_eq!(
            cache.should_process("id1", Duration::MAX),
            Err(IdempotencyError::TtlOutOfRange)
        );
        assert_eq!(
            cache.should_process("id1", MAX_TTL + Duration::from_millis(1)),
            Err(IdempotencyError::TtlOutOfRange)
        );
        assert!(cache.is_empty());

        let record = IdempotencyRecord::issue("id1", fixed_now(), MAX_TTL).expect("max ttl");
        assert!(record.expires_at.to_rfc3339().starts_with("2123-"));
    }

    #[test]
    fn sweep_removes_only_expired_records() {
        let now = fixed_now();
        let cache = IdempotencyCache::new();
        cache
            .should_process_at("old", Duration::from_secs(10), now)
            .expect("old");
        cache
            .should_process_at("new", Duration::from_secs(3_600), now)
            .expect("new");

        let removed = cache.sweep_expired(now + ChronoDuration::seconds(60));

        assert_eq!(removed, 1);
        assert!(cache.get("old").is_none());
        assert!(cache.get("new").is_some());
    }

    #[test]
    fn concurrent_callers_see_exactly_one_fresh_outcome() {
        let cache = Arc::new(IdempotencyCache::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                thread::spawn(move || {
                    cache
                        .should_process("shared", DEFAULT_TTL)
                        .expect("should_process")
                        .already_processed()
                })
            })
            .collect();

        let fresh = handles
            .into_iter()
            .map(|handle| handle.join().expect("thread"))
            .filter(|already| !already)
            .count();
        assert_eq!(fresh, 1);
    }
}
