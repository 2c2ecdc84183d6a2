//! Runtime configuration from `CLINSYNC_*` environment variables.
//!
//! Durations are given in whole seconds (retention windows in days). Every
//! variable is optional; see [`SyncConfig::default`] for the fallbacks.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context};

use clinsync_core::{FailurePolicy, RetryPolicy};

use crate::credentials::ClientCredentials;
use crate::payload::DEFAULT_IDENTIFIER_SYSTEM;
use crate::workers::{RetentionConfig, SweeperConfig, WorkerPoolConfig};

const DAY_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FhirConfig {
    pub base_url: String,
    /// Identifier system stamped on every resource built for the server
    pub identifier_system: String,
    pub request_timeout: Duration,
    /// `None` sends requests without a bearer token
    pub credentials: Option<ClientCredentials>,
}

impl Default for FhirConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8090/fhir".into(),
            identifier_system: DEFAULT_IDENTIFIER_SYSTEM.into(),
            request_timeout: Duration::from_secs(30),
            credentials: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Ledger database. `None` runs against in-memory stores.
    pub database_url: Option<String>,
    /// Legacy EMR database; the ledger database when unset.
    pub legacy_database_url: Option<String>,
    pub fhir: FhirConfig,
    pub retry: RetryPolicy,
    pub pool: WorkerPoolConfig,
    /// Upper bound on one adapter call
    pub delivery_timeout: Duration,
    pub sweeper: SweeperConfig,
    pub retention: RetentionConfig,
    pub bind_addr: SocketAddr,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            legacy_database_url: None,
            fhir: FhirConfig::default(),
            retry: RetryPolicy::default(),
            pool: WorkerPoolConfig::default(),
            delivery_timeout: Duration::from_secs(60),
            sweeper: SweeperConfig::default(),
            retention: RetentionConfig::default(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let env = Env(&lookup);
        let defaults = Self::default();

        let failure_policy = match env.get("CLINSYNC_FAILURE_POLICY").as_deref() {
            None | Some("fail_fast") => FailurePolicy::FailFast,
            Some("uniform") => FailurePolicy::Uniform,
            Some(other) => bail!(
                "CLINSYNC_FAILURE_POLICY must be `fail_fast` or `uniform`, got `{other}`"
            ),
        };
        let retry = RetryPolicy {
            base_delay: env.secs("CLINSYNC_RETRY_BASE_SECS", defaults.retry.base_delay)?,
            max_delay: env.secs("CLINSYNC_RETRY_MAX_SECS", defaults.retry.max_delay)?,
            default_max_retries: env.parse("CLINSYNC_MAX_RETRIES", defaults.retry.default_max_retries)?,
            failure_policy,
        };
        if retry.default_max_retries == 0 {
            bail!("CLINSYNC_MAX_RETRIES must be at least 1");
        }

        let pool = WorkerPoolConfig {
            concurrency: env.parse("CLINSYNC_WORKERS", defaults.pool.concurrency)?,
            queue_capacity: env.parse("CLINSYNC_QUEUE_CAPACITY", defaults.pool.queue_capacity)?,
        };
        if pool.concurrency == 0 || pool.queue_capacity == 0 {
            bail!("CLINSYNC_WORKERS and CLINSYNC_QUEUE_CAPACITY must be positive");
        }

        let sweeper = SweeperConfig {
            interval: env.secs("CLINSYNC_SWEEP_INTERVAL_SECS", defaults.sweeper.interval)?,
            pending_limit: env.parse("CLINSYNC_SWEEP_PENDING_LIMIT", defaults.sweeper.pending_limit)?,
            retry_limit: env.parse("CLINSYNC_SWEEP_RETRY_LIMIT", defaults.sweeper.retry_limit)?,
            stale_after: env.secs("CLINSYNC_STALE_AFTER_SECS", defaults.sweeper.stale_after)?,
        };

        let retention = RetentionConfig {
            interval: env.secs("CLINSYNC_RETENTION_INTERVAL_SECS", defaults.retention.interval)?,
            done_retention: env.days("CLINSYNC_DONE_RETENTION_DAYS", defaults.retention.done_retention)?,
            failed_retention: env.days(
                "CLINSYNC_FAILED_RETENTION_DAYS",
                defaults.retention.failed_retention,
            )?,
        };

        let fhir = FhirConfig {
            base_url: env
                .get("CLINSYNC_FHIR_BASE_URL")
                .unwrap_or(defaults.fhir.base_url)
                .trim_end_matches('/')
                .to_string(),
            identifier_system: env
                .get("CLINSYNC_FHIR_IDENTIFIER_SYSTEM")
                .unwrap_or(defaults.fhir.identifier_system),
            request_timeout: env.secs("CLINSYNC_FHIR_TIMEOUT_SECS", defaults.fhir.request_timeout)?,
            credentials: fhir_credentials(&env)?,
        };

        Ok(Self {
            database_url: env.get("CLINSYNC_DATABASE_URL").or_else(|| env.get("DATABASE_URL")),
            legacy_database_url: env.get("CLINSYNC_LEGACY_DATABASE_URL"),
            fhir,
            retry,
            pool,
            delivery_timeout: env.secs("CLINSYNC_DELIVERY_TIMEOUT_SECS", defaults.delivery_timeout)?,
            sweeper,
            retention,
            bind_addr: env.parse("CLINSYNC_BIND_ADDR", defaults.bind_addr)?,
        })
    }
}

fn fhir_credentials(env: &Env<'_>) -> anyhow::Result<Option<ClientCredentials>> {
    let token_url = env.get("CLINSYNC_FHIR_TOKEN_URL");
    let client_id = env.get("CLINSYNC_FHIR_CLIENT_ID");
    let client_secret = env.get("CLINSYNC_FHIR_CLIENT_SECRET");

    match (token_url, client_id, client_secret) {
        (None, None, None) => Ok(None),
        (Some(token_url), Some(client_id), Some(client_secret)) => Ok(Some(ClientCredentials {
            token_url,
            client_id,
            client_secret,
            scope: env.get("CLINSYNC_FHIR_SCOPE"),
        })),
        _ => bail!(
            "CLINSYNC_FHIR_TOKEN_URL, CLINSYNC_FHIR_CLIENT_ID and CLINSYNC_FHIR_CLIENT_SECRET \
             must be set together"
        ),
    }
}

struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    /// Non-blank value of `key`.
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> anyhow::Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse()
                .with_context(|| format!("invalid value for {key}: `{raw}`")),
        }
    }

    fn secs(&self, key: &str, default: Duration) -> anyhow::Result<Duration> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }

    fn days(&self, key: &str, default: Duration) -> anyhow::Result<Duration> {
        let days = self.parse(key, default.as_secs() / DAY_SECS)?;
        days.checked_mul(DAY_SECS)
            .map(Duration::from_secs)
            .with_context(|| format!("{key} is out of range"))
    }
}
