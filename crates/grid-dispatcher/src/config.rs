use clap::Parser;
use grid_core::auth::keys::CachePolicy;
use grid_core::executor::BackendSettings;
use grid_core::scheduler::SchedulerConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Grid dispatcher configuration. Parsed once at startup and passed by reference.
#[derive(Parser, Clone)]
#[command(name = "grid-dispatcher", about = "Compute grid front door")]
pub struct GridConfig {
    /// Bind address for the HTTP server.
    #[arg(long, env = "GRID_BIND", default_value = "127.0.0.1:9090")]
    pub bind: String,

    /// YAML file listing trusted token issuers and their role mapping.
    #[arg(long, env = "GRID_ISSUERS_FILE", default_value = "issuers.yaml")]
    pub issuers_file: PathBuf,

    /// Key-set cache TTL in seconds; entries older than this are refetched.
    #[arg(long, env = "KEYSET_CACHE_TTL_SECS", default_value_t = 3_600)]
    pub keyset_cache_ttl_secs: u64,

    /// How long past the TTL a cached key set may still be used while the identity provider is
    /// unreachable. Zero disables stale reuse.
    #[arg(long, env = "KEYSET_STALE_GRACE_SECS", default_value_t = 600)]
    pub keyset_stale_grace_secs: u64,

    /// After a failed JWKS fetch, no new fetch for that issuer starts for this long.
    #[arg(long, env = "KEYSET_REFRESH_BACKOFF_SECS", default_value_t = 30)]
    pub keyset_refresh_backoff_secs: u64,

    /// Timeout for one JWKS fetch.
    #[arg(long, env = "KEYSET_FETCH_TIMEOUT_MS", default_value_t = 5_000)]
    pub keyset_fetch_timeout_ms: u64,

    #[arg(long, env = "SCHEDULING_MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    #[arg(long, env = "SCHEDULING_RETRY_BASE_DELAY_MS", default_value_t = 500)]
    pub retry_base_delay_ms: u64,

    #[arg(long, env = "SCHEDULING_AGING_INTERVAL_MS", default_value_t = 5_000)]
    pub aging_interval_ms: u64,

    #[arg(long, env = "SCHEDULING_STARVATION_THRESHOLD_MS", default_value_t = 30_000)]
    pub starvation_threshold_ms: u64,

    /// Terminal tasks are forgotten this long after they finish.
    #[arg(long, env = "SCHEDULING_RETENTION_MS", default_value_t = 3_600_000)]
    pub retention_ms: u64,

    #[arg(long, env = "CIRCUIT_BREAKER_FAILURE_THRESHOLD", default_value_t = 5)]
    pub circuit_breaker_failure_threshold: u32,

    #[arg(long, env = "CIRCUIT_BREAKER_TIMEOUT_MS", default_value_t = 30_000)]
    pub circuit_breaker_timeout_ms: u64,

    /// Maximum concurrent executions.
    #[arg(long, env = "DISPATCH_CONCURRENCY", default_value_t = 4)]
    pub dispatch_concurrency: usize,

    /// Dispatch loop poll interval (backoff expiry, breaker cool-down).
    #[arg(long, env = "DISPATCH_POLL_MS", default_value_t = 200)]
    pub dispatch_poll_ms: u64,

    /// Backend used when a submission does not name one.
    #[arg(long, env = "DEFAULT_BACKEND", default_value = "echo")]
    pub default_backend: String,

    /// Worker endpoint for the `http` backend. Unset leaves that backend unavailable.
    #[arg(long, env = "WORKER_URL")]
    pub worker_url: Option<String>,

    #[arg(long, env = "WORKER_TIMEOUT_MS", default_value_t = 30_000)]
    pub worker_timeout_ms: u64,

    /// Paths served without authentication.
    #[arg(long, env = "PUBLIC_METHODS", value_delimiter = ',', default_value = "/healthz")]
    pub public_methods: Vec<String>,
}

impl std::fmt::Debug for GridConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Worker URLs may embed credentials.
        let worker_url = self.worker_url.as_deref().map(|_| "<redacted>");
        f.debug_struct("GridConfig")
            .field("bind", &self.bind)
            .field("issuers_file", &self.issuers_file)
            .field("keyset_cache_ttl_secs", &self.keyset_cache_ttl_secs)
            .field("keyset_stale_grace_secs", &self.keyset_stale_grace_secs)
            .field("keyset_refresh_backoff_secs", &self.keyset_refresh_backoff_secs)
            .field("keyset_fetch_timeout_ms", &self.keyset_fetch_timeout_ms)
            .field("max_retries", &self.max_retries)
            .field("retry_base_delay_ms", &self.retry_base_delay_ms)
            .field("aging_interval_ms", &self.aging_interval_ms)
            .field("starvation_threshold_ms", &self.starvation_threshold_ms)
            .field("retention_ms", &self.retention_ms)
            .field(
                "circuit_breaker_failure_threshold",
                &self.circuit_breaker_failure_threshold,
            )
            .field("circuit_breaker_timeout_ms", &self.circuit_breaker_timeout_ms)
            .field("dispatch_concurrency", &self.dispatch_concurrency)
            .field("dispatch_poll_ms", &self.dispatch_poll_ms)
            .field("default_backend", &self.default_backend)
            .field("worker_url", &worker_url)
            .field("worker_timeout_ms", &self.worker_timeout_ms)
            .field("public_methods", &self.public_methods)
            .finish()
    }
}

impl GridConfig {
    /// Defaults overlaid with environment variables only; ignores process arguments.
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self::try_parse_from(["grid-dispatcher"])?)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_retries: self.max_retries,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            starvation_threshold: Duration::from_millis(self.starvation_threshold_ms),
            retention: Duration::from_millis(self.retention_ms),
        }
    }

    pub fn cache_policy(&self) -> CachePolicy {
        CachePolicy {
            ttl: Duration::from_secs(self.keyset_cache_ttl_secs),
            stale_grace: Duration::from_secs(self.keyset_stale_grace_secs),
            refresh_backoff: Duration::from_secs(self.keyset_refresh_backoff_secs),
        }
    }

    pub fn backend_settings(&self) -> BackendSettings {
        BackendSettings {
            worker_url: self.worker_url.clone(),
            request_timeout: Duration::from_millis(self.worker_timeout_ms),
        }
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_timeout_ms)
    }

    pub fn keyset_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.keyset_fetch_timeout_ms)
    }
}
