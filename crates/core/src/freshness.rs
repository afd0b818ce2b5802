use crate::signature;

/// Default allowed clock skew between sender and receiver.
pub const DEFAULT_TOLERANCE_SECS: u64 = 300;

/// Outcome of a timestamp freshness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Freshness {
    pub ok: bool,
    /// `now - timestamp` in seconds; negative when the timestamp is in the future.
    pub age: Option<i64>,
}

/// Why a verification attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationFailure {
    MissingTimestamp,
    StaleTimestamp,
    InvalidSignature,
}

/// Result of one verification attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    pub valid: bool,
    pub reason: Option<String>,
    pub timestamp: Option<i64>,
    pub age: Option<i64>,
    pub failure: Option<VerificationFailure>,
}

impl VerificationResult {
    fn rejected(failure: VerificationFailure, reason: String) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
            timestamp: None,
            age: None,
            failure: Some(failure),
        }
    }

    /// Wraps a plain signature check that carried no timestamp.
    pub fn signature_only(valid: bool) -> Self {
        if valid {
            Self {
                valid: true,
                reason: None,
                timestamp: None,
                age: None,
                failure: None,
            }
        } else {
            Self::rejected(
                VerificationFailure::InvalidSignature,
                "invalid signature".to_string(),
            )
        }
    }
}

/// Parses a unix-seconds header value. Anything but a plain integer is `None`.
pub fn parse_timestamp(raw: &str) -> Option<i64> {
    raw.trim().parse::<i64>().ok()
}

/// Fails closed: a missing timestamp is never fresh.
pub fn check_freshness(timestamp: Option<i64>, tolerance_secs: u64, now_secs: i64) -> Freshness {
    let Some(timestamp) = timestamp else {
        return Freshness {
            ok: false,
            age: None,
        };
    };

    let age = now_secs.saturating_sub(timestamp);
    Freshness {
        ok: age.unsigned_abs() <= tolerance_secs,
        age: Some(age),
    }
}

/// Runs the freshness check before the signature check and stops at the
/// first failure.
pub fn verify_with_timestamp(
    payload: &[u8],
    signature: &str,
    timestamp: Option<i64>,
    secret: &[u8],
    tolerance_secs: u64,
    now_secs: i64,
) -> VerificationResult {
    let freshness = check_freshness(timestamp, tolerance_secs, now_secs);
    let Some(age) = freshness.age else {
        return VerificationResult::rejected(
            VerificationFailure::MissingTimestamp,
            "timestamp is required".to_string(),
        );
    };

    if !freshness.ok {
        let direction = if age < 0 { "new" } else { "old" };
        let mut result = VerificationResult::rejected(
            VerificationFailure::StaleTimestamp,
            format!("timestamp too {direction} (age: {age}s, tolerance: {tolerance_secs}s)"),
        );
        result.timestamp = timestamp;
        result.age = Some(age);
        return result;
    }

    let mut result = VerificationResult::signature_only(signature::verify(payload, signature, secret));
    result.timestamp = timestamp;
    result.age = Some(age);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::{generate, Algorithm};

    const NOW: i64 = 1_700_000_000;
    const PAYLOAD: &[u8] = br#"{"event":"ping"}"#;
    const SECRET: &[u8] = b"s3cr3t";

    #[test]
    fn freshness_boundary_is_inclusive() {
        assert!(check_freshness(Some(NOW - 300), 300, NOW).ok);
        assert!(!check_freshness(Some(NOW - 301), 300, NOW).ok);
        assert!(check_freshness(Some(NOW + 300), 300, NOW).ok);
        assert!(!check_freshness(Some(NOW + 301), 300, NOW).ok);
    }

    #[test]
    fn freshness_reports_signed_age() {
        assert_eq!(check_freshness(Some(NOW - 42), 300, NOW).age, Some(42));
        assert_eq!(check_freshness(Some(NOW + 42), 300, NOW).age, Some(-42));
    }

    #[test]
    fn freshness_fails_closed_without_timestamp() {
        let freshness = check_freshness(None, 300, NOW);
        assert!(!freshness.ok);
        assert_eq!(freshness.age, None);
    }

    #[test]
    fn freshness_survives_extreme_values() {
        assert!(!check_freshness(Some(i64::MIN), 300, NOW).ok);
        assert!(!check_freshness(Some(i64::MAX), 300, NOW).ok);
    }

    #[test]
    fn parse_timestamp_is_strict() {
        assert_eq!(parse_timestamp("1700000000"), Some(1_700_000_000));
        assert_eq!(parse_timestamp(" 1700000000 "), Some(1_700_000_000));
        assert_eq!(parse_timestamp("-5"), Some(-5));
        assert_eq!(parse_timestamp("abc"), None);
        assert_eq!(parse_timestamp("1700000000abc"), None);
        assert_eq!(parse_timestamp("17.5"), None);
        assert_eq!(parse_timestamp(""), None);
    }

    #[test]
    fn valid_signature_within_window_passes() {
        let signature = generate(PAYLOAD, SECRET, Algorithm::Sha256).expect("signature");
        let result = verify_with_timestamp(PAYLOAD, &signature, Some(NOW - 10), SECRET, 300, NOW);
        assert!(result.valid);
        assert_eq!(result.reason, None);
        assert_eq!(result.timestamp, Some(NOW - 10));
        assert_eq!(result.age, Some(10));
        assert_eq!(result.failure, None);
    }

    #[test]
    fn stale_timestamp_short_circuits_before_signature() {
        let result =
            verify_with_timestamp(PAYLOAD, "not-a-signature", Some(NOW - 600), SECRET, 300, NOW);
        assert!(!result.valid);
        assert_eq!(result.failure, Some(VerificationFailure::StaleTimestamp));
        assert_eq!(
            result.reason.as_deref(),
            Some("timestamp too old (age: 600s, tolerance: 300s)")
        );
        assert_eq!(result.age, Some(600));
        assert_eq!(result.timestamp, Some(NOW - 600));
    }

    #[test]
    fn future_timestamp_is_reported_as_too_new() {
        let signature = generate(PAYLOAD, SECRET, Algorithm::Sha256).expect("signature");
        let result = verify_with_timestamp(PAYLOAD, &signature, Some(NOW + 900), SECRET, 300, NOW);
        assert_eq!(result.failure, Some(VerificationFailure::StaleTimestamp));
        assert_eq!(
            result.reason.as_deref(),
            Some("timestamp too new (age: -900s, tolerance: 300s)")
        );
    }

    #[test]
    fn missing_timestamp_is_rejected() {
        let signature = generate(PAYLOAD, SECRET, Algorithm::Sha256).expect("signature");
        let result = verify_with_timestamp(PAYLOAD, &signature, None, SECRET, 300, NOW);
        assert!(!result.valid);
        assert_eq!(result.failure, Some(VerificationFailure::MissingTimestamp));
        assert_eq!(result.reason.as_deref(), Some("timestamp is required"));
    }

    #[test]
    fn fresh_timestamp_with_bad_signature_is_invalid_signature() {
        let signature = generate(PAYLOAD, b"other", Algorithm::Sha256).expect("signature");
        let result = verify_with_timestamp(PAYLOAD, &signature, Some(NOW), SECRET, 300, NOW);
        assert!(!result.valid);
        assert_eq!(result.failure, Some(VerificationFailure::InvalidSignature));
        assert_eq!(result.reason.as_deref(), Some("invalid signature"));
        assert_eq!(result.age, Some(0));
    }
}
