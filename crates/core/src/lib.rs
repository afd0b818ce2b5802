//! Webhook authentication primitives: HMAC signatures, timestamp freshness,
//! and at-most-once idempotency bookkeeping. Nothing here performs I/O.

use std::sync::Arc;

use chrono::{DateTime, Utc};

pub mod freshness;
pub mod idempotency;
pub mod payload;
pub mod signature;

pub use freshness::{
    check_freshness, parse_timestamp, verify_with_timestamp, Freshness, VerificationFailure,
    VerificationResult, DEFAULT_TOLERANCE_SECS,
};
pub use idempotency::{
    IdempotencyCache, IdempotencyError, IdempotencyRecord, ShouldProcess, DEFAULT_SWEEP_INTERVAL,
    DEFAULT_TTL, MAX_TTL,
};
pub use payload::{canonical_json, PayloadError};
pub use signature::{generate, generate_named, parse_signature, verify, Algorithm, SignatureError};

/// Injectable wall clock shared by components that reason about expiry.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;
