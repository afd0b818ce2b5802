use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{migrate::MigrateError, sqlite::SqlitePoolOptions, Row, SqlitePool};
use thiserror::Error;

use webhook_gate_core::{IdempotencyRecord, ShouldProcess};

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle to the durable idempotency store.
    pub fn idempotency(&self) -> IdempotencyRepository {
        IdempotencyRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for per-tenant webhook secrets.
    pub fn tenant_secrets(&self) -> TenantSecretRepository {
        TenantSecretRepository {
            pool: self.pool.clone(),
        }
    }

    /// Closes every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
}

const CHECK_AND_RECORD_ATTEMPTS: usize = 3;

/// Repository backing idempotency records with the `webhook_idempotency` table.
///
/// Records survive process restarts, unlike the in-memory cache.
#[derive(Clone)]
pub struct IdempotencyRepository {
    pool: SqlitePool,
}

impl IdempotencyRepository {
    /// Atomically stores `record` unless a live record for the same id exists.
    ///
    /// The upsert only overwrites rows whose `expires_at` is already in the
    /// past relative to the new record's `processed_at`, so a single statement
    /// decides between [`ShouldProcess::Fresh`] and [`ShouldProcess::Duplicate`].
    /// If a sweep deletes the live row before it is read back, the upsert is
    /// retried and the delivery counts as fresh.
    pub async fn check_and_record(
        &self,
        record: &IdempotencyRecord,
    ) -> Result<ShouldProcess, IdempotencyStoreError> {
        for _ in 0..CHECK_AND_RECORD_ATTEMPTS {
            let result = sqlx::query(
                "INSERT INTO webhook_idempotency (webhook_id, processed_at, expires_at) \
                 VALUES (?, ?, ?) \
                 ON CONFLICT(webhook_id) DO UPDATE SET \
                     processed_at = excluded.processed_at, \
                     expires_at = excluded.expires_at \
                 WHERE webhook_idempotency.expires_at < excluded.processed_at",
            )
            .bind(&record.webhook_id)
            .bind(to_rfc3339(record.processed_at))
            .bind(to_rfc3339(record.expires_at))
            .execute(&self.pool)
            .await?;

            if result.rows_affected() > 0 {
                return Ok(ShouldProcess::Fresh(record.clone()));
            }
            if let Some(existing) = self.fetch(&record.webhook_id).await? {
                return Ok(ShouldProcess::Duplicate(existing));
            }
        }

        Err(IdempotencyStoreError::Vanished(record.webhook_id.clone()))
    }

    /// Loads the record stored for `webhook_id`, expired or not.
    pub async fn fetch(
        &self,
        webhook_id: &str,
    ) -> Result<Option<IdempotencyRecord>, IdempotencyStoreError> {
        let row = sqlx::query(
            "SELECT webhook_id, processed_at, expires_at FROM webhook_idempotency WHERE webhook_id = ?",
        )
        .bind(webhook_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let processed_at: String = row.get("processed_at");
        let expires_at: String = row.get("expires_at");
        Ok(Some(IdempotencyRecord {
            webhook_id: row.get("webhook_id"),
            processed_at: parse_rfc3339(&processed_at)?,
            expires_at: parse_rfc3339(&expires_at)?,
        }))
    }

    /// Deletes up to `limit` records that expired before `now`.
    pub async fn delete_expired_batch(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, IdempotencyStoreError> {
        let result = sqlx::query(
            "DELETE FROM webhook_idempotency WHERE rowid IN \
             (SELECT rowid FROM webhook_idempotency WHERE expires_at < ? LIMIT ?)",
        )
        .bind(to_rfc3339(now))
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Number of stored records, including expired ones not yet swept.
    pub async fn count(&self) -> Result<u64, IdempotencyStoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM webhook_idempotency")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

/// Errors raised by the durable idempotency store.
#[derive(Debug, Error)]
pub enum IdempotencyStoreError {
    #[error("idempotency record for {0} kept disappearing during check")]
    Vanished(String),
    #[error("failed to decode stored timestamp: {0}")]
    Decode(#[from] chrono::ParseError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository resolving webhook secrets per tenant.
#[derive(Clone)]
pub struct TenantSecretRepository {
    pool: SqlitePool,
}

impl TenantSecretRepository {
    /// Returns the secret registered for `tenant_id`, if any.
    pub async fn fetch(&self, tenant_id: &str) -> Result<Option<String>, TenantSecretError> {
        let secret: Option<String> =
            sqlx::query_scalar("SELECT secret FROM tenant_secrets WHERE tenant_id = ?")
                .bind(tenant_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(secret)
    }

    /// Registers or rotates the secret for `tenant_id`.
    pub async fn upsert(
        &self,
        tenant_id: &str,
        secret: &str,
        now: DateTime<Utc>,
    ) -> Result<(), TenantSecretError> {
        if secret.is_empty() {
            return Err(TenantSecretError::EmptySecret);
        }

        let now = to_rfc3339(now);
        sqlx::query(
            "INSERT INTO tenant_secrets (tenant_id, secret, created_at, updated_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(tenant_id) DO UPDATE SET \
                 secret = excluded.secret, \
                 updated_at = excluded.updated_at",
        )
        .bind(tenant_id)
        .bind(secret)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Errors that can occur while reading or writing tenant secrets.
#[derive(Debug, Error)]
pub enum TenantSecretError {
    #[error("tenant secret must not be empty")]
    EmptySecret,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

// Fixed-width millisecond UTC timestamps compare lexically in chronological order.
fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value).map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    async fn setup_db() -> Database {
        let db = Database::connect("sqlite::memory:?cache=shared")
            .await
            .expect("connect");
        db.run_migrations().await.expect("migrations");
        db
    }

    fn fixed_now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .expect("fixed time")
            .with_timezone(&Utc)
    }

    fn record(id: &str, now: DateTime<Utc>, ttl_secs: u64) -> IdempotencyRecord {
        IdempotencyRecord::issue(id, now, Duration::from_secs(ttl_secs)).expect("record")
    }

    #[tokio::test]
    async fn check_and_record_detects_duplicates() {
        let db = setup_db().await;
        let repo = db.idempotency();
        let now = fixed_now();

        let first = repo
            .check_and_record(&record("abc123", now, 60))
            .await
            .expect("first");
        assert!(!first.already_processed());

        let later = now + ChronoDuration::seconds(10);
        let second = repo
            .check_and_record(&record("abc123", later, 60))
            .await
            .expect("second");
        assert!(second.already_processed());
        assert_eq!(second.record().processed_at, now);
        assert_eq!(second.record().expires_at, now + ChronoDuration::seconds(60));
    }

    #[tokio::test]
    async fn expired_record_is_overwritten() {
        let db = setup_db().await;
        let repo = db.idempotency();
        let now = fixed_now();

        repo.check_and_record(&record("abc123", now, 60))
            .await
            .expect("first");

        let after_expiry = now + ChronoDuration::seconds(61);
        let outcome = repo
            .check_and_record(&record("abc123", after_expiry, 60))
            .await
            .expect("after expiry");
        assert!(!outcome.already_processed());

        let stored = repo.fetch("abc123").await.expect("fetch").expect("row");
        assert_eq!(stored.processed_at, after_expiry);
        assert_eq!(repo.count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn record_at_exact_expiry_is_still_live() {
        let db = setup_db().await;
        let repo = db.idempotency();
        let now = fixed_now();

        repo.check_and_record(&record("edge", now, 60))
            .await
            .expect("first");
        let outcome = repo
            .check_and_record(&record("edge", now + ChronoDuration::seconds(60), 60))
            .await
            .expect("at expiry");
        assert!(outcome.already_processed());
    }

    #[tokio::test]
    async fn delete_expired_batch_respects_limit_and_threshold() {
        let db = setup_db().await;
        let repo = db.idempotency();
        let now = fixed_now();

        for idx in 0..3 {
            repo.check_and_record(&record(&format!("old-{idx}"), now, 10))
                .await
                .expect("old");
        }
        repo.check_and_record(&record("live", now, 3_600))
            .await
            .expect("live");

        let sweep_at = now + ChronoDuration::seconds(60);
        assert_eq!(repo.delete_expired_batch(sweep_at, 2).await.expect("batch"), 2);
        assert_eq!(repo.delete_expired_batch(sweep_at, 2).await.expect("batch"), 1);
        assert_eq!(repo.delete_expired_batch(sweep_at, 2).await.expect("batch"), 0);

        assert_eq!(repo.count().await.expect("count"), 1);
        assert!(repo.fetch("live").await.expect("fetch").is_some());
    }

    #[tokio::test]
    async fn deleted_live_record_is_recorded_again() {
        let db = setup_db().await;
        let repo = db.idempotency();
        let now = fixed_now();

        repo.check_and_record(&record("swept", now, 60))
            .await
            .expect("first");
        // A sweep with a clock far ahead removes the row while it is still live here.
        let deleted = repo
            .delete_expired_batch(now + ChronoDuration::hours(1), 10)
            .await
            .expect("sweep");
        assert_eq!(deleted, 1);

        let outcome = repo
            .check_and_record(&record("swept", now + ChronoDuration::seconds(1), 60))
            .await
            .expect("after sweep");
        assert!(!outcome.already_processed());
        assert_eq!(repo.count().await.expect("count"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_same_id_is_fresh_exactly_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("race.db").display());
        let db = Database::connect(&url).await.expect("connect");
        db.run_migrations().await.expect("migrations");
        let now = fixed_now();

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let repo = db.idempotency();
            tasks.push(tokio::spawn(async move {
                repo.check_and_record(&record("contended", now, 60)).await
            }));
        }

        let mut fresh = 0;
        let mut duplicate = 0;
        for task in tasks {
            match task.await.expect("task").expect("check") {
                ShouldProcess::Fresh(_) => fresh += 1,
                ShouldProcess::Duplicate(_) => duplicate += 1,
            }
        }
        assert_eq!(fresh, 1);
        assert_eq!(duplicate, 31);
        assert_eq!(db.idempotency().count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn records_survive_reconnect() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("gate.db").display());
        let now = fixed_now();

        let db = Database::connect(&url).await.expect("connect");
        db.run_migrations().await.expect("migrations");
        db.idempotency()
            .check_and_record(&record("persisted", now, 3_600))
            .await
            .expect("record");
        db.close().await;

        let reopened = Database::connect(&url).await.expect("reconnect");
        reopened.run_migrations().await.expect("migrations");
        let outcome = reopened
            .idempotency()
            .check_and_record(&record("persisted", now + ChronoDuration::seconds(5), 3_600))
            .await
            .expect("check");
        assert!(outcome.already_processed());
    }

    #[tokio::test]
    async fn tenant_secrets_upsert_and_rotate() {
        let db = setup_db().await;
        let repo = db.tenant_secrets();
        let now = fixed_now();

        assert_eq!(repo.fetch("acme").await.expect("fetch"), None);

        repo.upsert("acme", "first-secret", now).await.expect("insert");
        assert_eq!(
            repo.fetch("acme").await.expect("fetch").as_deref(),
            Some("first-secret")
        );

        repo.upsert("acme", "rotated", now + ChronoDuration::hours(1))
            .await
            .expect("rotate");
        assert_eq!(
            repo.fetch("acme").await.expect("fetch").as_deref(),
            Some("rotated")
        );

        let err = repo.upsert("acme", "", now).await.expect_err("empty");
        assert!(matches!(err, TenantSecretError::EmptySecret));
    }
}
