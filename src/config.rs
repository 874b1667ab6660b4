//! Process configuration read from the environment.
//!
//! Every knob has a default except the signing secret. Numeric values that do
//! not parse are reported as errors instead of being silently replaced.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};

pub const ENV_SECRET: &str = "COURSEGATE_JWT_SECRET";
pub const ENV_TOKEN_TTL: &str = "COURSEGATE_TOKEN_TTL_SECS";
pub const ENV_ADMIN_TTL: &str = "COURSEGATE_ADMIN_SESSION_TTL_SECS";
pub const ENV_SWEEP_INTERVAL: &str = "COURSEGATE_SWEEP_INTERVAL_SECS";
pub const ENV_WARNING: &str = "COURSEGATE_SESSION_WARNING_SECS";
pub const ENV_LOOKUP_TIMEOUT: &str = "COURSEGATE_LOOKUP_TIMEOUT_MS";
pub const ENV_HTTP_PORT: &str = "COURSEGATE_HTTP_PORT";
pub const ENV_BREAK_GLASS_EMAIL: &str = "COURSEGATE_BREAK_GLASS_EMAIL";
pub const ENV_BREAK_GLASS_HASH: &str = "COURSEGATE_BREAK_GLASS_PASSWORD_HASH";
pub const ENV_FAILED_LOGIN_THRESHOLD: &str = "COURSEGATE_FAILED_LOGIN_THRESHOLD";
pub const ENV_SEED_ADMIN_EMAIL: &str = "COURSEGATE_SEED_ADMIN_EMAIL";
pub const ENV_SEED_ADMIN_HASH: &str = "COURSEGATE_SEED_ADMIN_PASSWORD_HASH";

/// Email plus argon2 PHC hash. Plain passwords never live in configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub email: String,
    pub password_hash: String,
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub signing_secret: String,
    pub standard_token_ttl: Duration,
    /// Privileged token lifetime; also the idle timeout of privileged sessions.
    pub privileged_token_ttl: Duration,
    pub sweep_interval: Duration,
    pub session_warning_threshold: Duration,
    pub lookup_timeout: Duration,
    pub http_port: u16,
    /// Credential that bypasses the user directory; off unless configured.
    pub break_glass: Option<Credential>,
    /// Admin account placed in the in-memory directory at startup.
    pub seed_admin: Option<Credential>,
    pub failed_login_threshold: u64,
}

impl GateConfig {
    pub const DEFAULT_TOKEN_TTL_SECS: u64 = 3_600;
    pub const DEFAULT_ADMIN_TTL_SECS: u64 = 14_400;
    pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
    pub const DEFAULT_WARNING_SECS: u64 = 900;
    pub const DEFAULT_LOOKUP_TIMEOUT_MS: u64 = 5_000;
    pub const DEFAULT_HTTP_PORT: u16 = 7878;
    pub const DEFAULT_FAILED_LOGIN_THRESHOLD: u64 = 3;

    /// Defaults around a given secret. Handy for tests and embedding.
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            signing_secret: secret.into(),
            standard_token_ttl: Duration::from_secs(Self::DEFAULT_TOKEN_TTL_SECS),
            privileged_token_ttl: Duration::from_secs(Self::DEFAULT_ADMIN_TTL_SECS),
            sweep_interval: Duration::from_secs(Self::DEFAULT_SWEEP_INTERVAL_SECS),
            session_warning_threshold: Duration::from_secs(Self::DEFAULT_WARNING_SECS),
            lookup_timeout: Duration::from_millis(Self::DEFAULT_LOOKUP_TIMEOUT_MS),
            http_port: Self::DEFAULT_HTTP_PORT,
            break_glass: None,
            seed_admin: None,
            failed_login_threshold: Self::DEFAULT_FAILED_LOGIN_THRESHOLD,
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let secret = lookup(ENV_SECRET)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| anyhow!("{} must be set to a non-empty signing secret", ENV_SECRET))?;
        let mut cfg = Self::with_secret(secret);

        if let Some(v) = parse_u64(&lookup, ENV_TOKEN_TTL)? { cfg.standard_token_ttl = Duration::from_secs(v); }
        if let Some(v) = parse_u64(&lookup, ENV_ADMIN_TTL)? { cfg.privileged_token_ttl = Duration::from_secs(v); }
        if let Some(v) = parse_u64(&lookup, ENV_SWEEP_INTERVAL)? { cfg.sweep_interval = Duration::from_secs(v); }
        if let Some(v) = parse_u64(&lookup, ENV_WARNING)? { cfg.session_warning_threshold = Duration::from_secs(v); }
        if let Some(v) = parse_u64(&lookup, ENV_LOOKUP_TIMEOUT)? { cfg.lookup_timeout = Duration::from_millis(v); }
        if let Some(v) = parse_u64(&lookup, ENV_FAILED_LOGIN_THRESHOLD)? { cfg.failed_login_threshold = v; }
        if let Some(v) = parse_u64(&lookup, ENV_HTTP_PORT)? {
            cfg.http_port = u16::try_from(v).with_context(|| format!("{} out of range: {}", ENV_HTTP_PORT, v))?;
        }
        if cfg.sweep_interval.is_zero() {
            return Err(anyhow!("{} must be greater than zero", ENV_SWEEP_INTERVAL));
        }

        cfg.break_glass = credential_pair(&lookup, ENV_BREAK_GLASS_EMAIL, ENV_BREAK_GLASS_HASH)?;
        cfg.seed_admin = credential_pair(&lookup, ENV_SEED_ADMIN_EMAIL, ENV_SEED_ADMIN_HASH)?;
        Ok(cfg)
    }
}

fn credential_pair<F>(lookup: &F, email_key: &str, hash_key: &str) -> Result<Option<Credential>>
where
    F: Fn(&str) -> Option<String>,
{
    let email = lookup(email_key).filter(|s| !s.trim().is_empty());
    let hash = lookup(hash_key).filter(|s| !s.trim().is_empty());
    match (email, hash) {
        (Some(email), Some(password_hash)) => Ok(Some(Credential { email: email.trim().to_string(), password_hash })),
        (None, None) => Ok(None),
        _ => Err(anyhow!("{} and {} must be set together", email_key, hash_key)),
    }
}

fn parse_u64<F>(lookup: &F, key: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .with_context(|| format!("invalid value for {}: '{}'", key, raw)),
    }
}
