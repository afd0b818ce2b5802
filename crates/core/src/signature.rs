use std::{fmt, str::FromStr};

use hmac::{digest::KeyInit, Hmac, Mac};
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, warn};

/// HMAC digests accepted on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Sha256,
    Sha512,
}

impl Algorithm {
    /// Allow-list used when parsing algorithms taken from a signature header.
    pub const SUPPORTED: [Algorithm; 2] = [Algorithm::Sha256, Algorithm::Sha512];

    /// Returns the name used in the `algorithm=hexdigest` signature format.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    fn mac(self, secret: &[u8], payload: &[u8]) -> Result<Vec<u8>, SignatureError> {
        match self {
            Self::Sha256 => compute_mac::<Hmac<Sha256>>(secret, payload),
            Self::Sha512 => compute_mac::<Hmac<Sha512>>(secret, payload),
        }
    }
}

impl FromStr for Algorithm {
    type Err = SignatureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            other => Err(SignatureError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("payload is required for signature generation")]
    EmptyPayload,
    #[error("secret is required for signature generation")]
    EmptySecret,
    #[error("failed to initialize HMAC with the provided secret")]
    InvalidKey,
}

/// Computes `algorithm=hexdigest` over the raw payload bytes.
pub fn generate(
    payload: &[u8],
    secret: &[u8],
    algorithm: Algorithm,
) -> Result<String, SignatureError> {
    if payload.is_empty() {
        return Err(SignatureError::EmptyPayload);
    }
    if secret.is_empty() {
        return Err(SignatureError::EmptySecret);
    }

    let digest = algorithm.mac(secret, payload)?;
    Ok(format!("{}={}", algorithm.as_str(), hex::encode(digest)))
}

/// Same as [`generate`] with the algorithm given by name.
pub fn generate_named(
    payload: &[u8],
    secret: &[u8],
    algorithm: &str,
) -> Result<String, SignatureError> {
    generate(payload, secret, algorithm.parse()?)
}

/// Splits a header value of the form `^([a-z0-9]+)=([a-f0-9]+)$`.
pub fn parse_signature(value: &str) -> Option<(&str, &str)> {
    let (algorithm, digest) = value.split_once('=')?;
    let algorithm_ok = !algorithm.is_empty()
        && algorithm
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
    let digest_ok = !digest.is_empty()
        && digest
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));

    (algorithm_ok && digest_ok).then_some((algorithm, digest))
}

/// Checks `signature` against the payload using the algorithm named in the
/// signature itself. Every failure, including internal ones, yields `false`.
pub fn verify(payload: &[u8], signature: &str, secret: &[u8]) -> bool {
    if payload.is_empty() || signature.is_empty() || secret.is_empty() {
        debug!(stage = "signature", "verification input missing");
        return false;
    }

    let Some((algorithm_name, digest_hex)) = parse_signature(signature) else {
        debug!(stage = "signature", "invalid signature format");
        return false;
    };

    let algorithm = match algorithm_name.parse::<Algorithm>() {
        Ok(algorithm) => algorithm,
        Err(err) => {
            warn!(stage = "signature", error = %err, "signature verification error");
            return false;
        }
    };

    let Ok(provided) = hex::decode(digest_hex) else {
        debug!(stage = "signature", %algorithm, "signature is not valid hex");
        return false;
    };

    let expected = match algorithm.mac(secret, payload) {
        Ok(expected) => expected,
        Err(err) => {
            warn!(stage = "signature", %algorithm, error = %err, "signature verification error");
            return false;
        }
    };

    expected.as_slice().ct_eq(provided.as_slice()).into()
}

fn compute_mac<M>(secret: &[u8], payload: &[u8]) -> Result<Vec<u8>, SignatureError>
where
    M: Mac + KeyInit,
{
    let mut mac = <M as Mac>::new_from_slice(secret).map_err(|_| SignatureError::InvalidKey)?;
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}
