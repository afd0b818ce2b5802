use std::{env, fmt, net::SocketAddr, time::Duration};

use webhook_gate_core::{DEFAULT_SWEEP_INTERVAL, DEFAULT_TOLERANCE_SECS, DEFAULT_TTL, MAX_TTL};

use super::server_bind_address;

pub const DEFAULT_SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const DEFAULT_TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";
pub const DEFAULT_ID_HEADER: &str = "X-Webhook-ID";
pub const DEFAULT_SECRET_TIMEOUT: Duration = Duration::from_millis(5_000);
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Signature header names used by well-known webhook senders.
pub const PROVIDER_SIGNATURE_HEADERS: [(&str, &str); 4] = [
    ("scrollverse", "X-ScrollVerse-Signature"),
    ("stripe", "Stripe-Signature"),
    ("github", "X-Hub-Signature-256"),
    ("custom", DEFAULT_SIGNATURE_HEADER),
];

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// How the request body is turned into the bytes that get signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadMode {
    /// Sign the body exactly as received.
    #[default]
    Raw,
    /// Parse the body as JSON and sign it re-serialized with sorted keys.
    CanonicalJson,
}

impl PayloadMode {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "raw" => Ok(Self::Raw),
            "canonical-json" | "canonical_json" => Ok(Self::CanonicalJson),
            other => Err(ConfigError::InvalidPayloadMode(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::CanonicalJson => "canonical-json",
        }
    }
}

/// Settings for the webhook authentication layer.
#[derive(Debug, Clone)]
pub struct WebhookSettings {
    pub secret: Option<String>,
    pub signature_header: String,
    pub timestamp_header: Option<String>,
    pub id_header: Option<String>,
    pub tenant_header: Option<String>,
    pub tolerance_secs: u64,
    pub idempotency_ttl: Duration,
    pub sweep_interval: Duration,
    pub secret_timeout: Duration,
    pub max_body_bytes: usize,
    pub payload_mode: PayloadMode,
    pub database_url: Option<String>,
}

impl WebhookSettings {
    /// Reads every `WEBHOOK_*` variable plus `DATABASE_URL`.
    ///
    /// Optional headers are disabled by setting the variable to an empty string.
    pub fn from_env() -> Result<Self, ConfigError> {
        let settings = Self {
            secret: non_empty_var("WEBHOOK_SECRET"),
            signature_header: non_empty_var("WEBHOOK_SIGNATURE_HEADER")
                .unwrap_or_else(|| DEFAULT_SIGNATURE_HEADER.to_string()),
            timestamp_header: header_var("WEBHOOK_TIMESTAMP_HEADER", DEFAULT_TIMESTAMP_HEADER),
            id_header: header_var("WEBHOOK_ID_HEADER", DEFAULT_ID_HEADER),
            tenant_header: non_empty_var("WEBHOOK_TENANT_HEADER"),
            tolerance_secs: number_var("WEBHOOK_TOLERANCE_SECS", DEFAULT_TOLERANCE_SECS)?,
            idempotency_ttl: millis_var("WEBHOOK_IDEMPOTENCY_TTL_MS", DEFAULT_TTL)?,
            sweep_interval: millis_var("WEBHOOK_SWEEP_INTERVAL_MS", DEFAULT_SWEEP_INTERVAL)?,
            secret_timeout: millis_var("WEBHOOK_SECRET_TIMEOUT_MS", DEFAULT_SECRET_TIMEOUT)?,
            max_body_bytes: number_var("WEBHOOK_MAX_BODY_BYTES", DEFAULT_MAX_BODY_BYTES)?,
            payload_mode: match non_empty_var("WEBHOOK_PAYLOAD_MODE") {
                Some(value) => PayloadMode::from_str(&value)?,
                None => PayloadMode::default(),
            },
            database_url: non_empty_var("DATABASE_URL"),
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Returns `true` when secrets are looked up per tenant instead of using
    /// the single static secret.
    pub fn uses_tenant_secrets(&self) -> bool {
        self.tenant_header.is_some() && self.database_url.is_some()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.tenant_header.is_some() && self.database_url.is_none() {
            return Err(ConfigError::TenantSecretsWithoutDatabase);
        }
        if self.secret.is_none() && !self.uses_tenant_secrets() {
            return Err(ConfigError::MissingSecret);
        }
        for (name, value) in [
            ("WEBHOOK_IDEMPOTENCY_TTL_MS", self.idempotency_ttl),
            ("WEBHOOK_SWEEP_INTERVAL_MS", self.sweep_interval),
            ("WEBHOOK_SECRET_TIMEOUT_MS", self.secret_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        if self.idempotency_ttl > MAX_TTL {
            return Err(ConfigError::TtlOutOfRange(self.idempotency_ttl));
        }
        if self.max_body_bytes == 0 {
            return Err(ConfigError::InvalidNumber {
                name: "WEBHOOK_MAX_BODY_BYTES",
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub webhook: WebhookSettings,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;
        let webhook = WebhookSettings::from_env()?;

        Ok(Self {
            bind_addr,
            environment,
            webhook,
        })
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

// Unset falls back to the default name; set-but-empty disables the header.
fn header_var(name: &str, default: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) if value.trim().is_empty() => None,
        Ok(value) => Some(value.trim().to_string()),
        Err(_) => Some(default.to_string()),
    }
}

fn number_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match non_empty_var(name) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { name, value }),
        None => Ok(default),
    }
}

fn millis_var(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match non_empty_var(name) {
        Some(value) => value
            .parse()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::InvalidNumber { name, value }),
        None => Ok(default),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    MissingSecret,
    TenantSecretsWithoutDatabase,
    InvalidNumber { name: &'static str, value: String },
    ZeroDuration(&'static str),
    TtlOutOfRange(Duration),
    InvalidPayloadMode(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::MissingSecret => write!(
                f,
                "WEBHOOK_SECRET is required unless WEBHOOK_TENANT_HEADER and DATABASE_URL are set"
            ),
            Self::TenantSecretsWithoutDatabase => {
                write!(f, "WEBHOOK_TENANT_HEADER requires DATABASE_URL")
            }
            Self::InvalidNumber { name, value } => {
                write!(f, "{name} must be a positive integer (got {value})")
            }
            Self::ZeroDuration(name) => write!(f, "{name} must be greater than zero"),
            Self::TtlOutOfRange(ttl) => write!(
                f,
                "WEBHOOK_IDEMPOTENCY_TTL_MS must not exceed {} (got {})",
                MAX_TTL.as_millis(),
                ttl.as_millis()
            ),
            Self::InvalidPayloadMode(value) => write!(
                f,
                "WEBHOOK_PAYLOAD_MODE must be 'raw' or 'canonical-json' (got {value})"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}
