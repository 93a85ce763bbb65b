use rand::Rng;
use std::time::Duration;

// Runtime configuration for the analysis worker.
// Every value comes from the environment (optionally a .env file), read with
// the MAILSCAN_ prefix first and the bare name as a fallback.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,

    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub read_count: usize,
    pub block_ms: u64,
    pub error_backoff_ms: u64,
    pub reclaim_idle_ms: Option<u64>,

    pub persist_timeout_ms: u64,
    pub attachment_concurrency: usize,
    pub analysis_delay_ms: u64,

    pub gmail_access_token: Option<String>,
    pub gmail_api_base: String,
    pub fetch_timeout_ms: u64,

    pub admin_addr: Option<String>,
    pub migrate_on_startup: bool,
}

pub const DEFAULT_STREAM: &str = "email_analysis_queue";
pub const DEFAULT_GROUP: &str = "analysis_workers";

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env_or_fallback("MAILSCAN_DATABASE_URL", "DATABASE_URL")
            .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is missing"))?;

        let redis_url = env_or_fallback("MAILSCAN_REDIS_URL", "REDIS_URL")
            .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string());

        let stream = env_or_fallback("MAILSCAN_STREAM", "STREAM")
            .unwrap_or_else(|| DEFAULT_STREAM.to_string());
        let group = env_or_fallback("MAILSCAN_GROUP", "GROUP")
            .unwrap_or_else(|| DEFAULT_GROUP.to_string());
        let consumer =
            env_or_fallback("MAILSCAN_CONSUMER", "CONSUMER").unwrap_or_else(random_consumer_name);

        let read_count = env_parse("MAILSCAN_READ_COUNT", "READ_COUNT")
            .unwrap_or(1usize)
            .clamp(1, 100);
        // Redis reads BLOCK 0 as no timeout.
        let block_ms = env_parse("MAILSCAN_BLOCK_MS", "BLOCK_MS")
            .unwrap_or(5_000u64)
            .max(1);
        let error_backoff_ms = env_parse("MAILSCAN_ERROR_BACKOFF_MS", "ERROR_BACKOFF_MS")
            .unwrap_or(1_000u64)
            .max(1);
        let reclaim_idle_ms = env_parse("MAILSCAN_RECLAIM_IDLE_MS", "RECLAIM_IDLE_MS");

        let persist_timeout_ms =
            env_parse("MAILSCAN_PERSIST_TIMEOUT_MS", "PERSIST_TIMEOUT_MS").unwrap_or(10_000);
        let attachment_concurrency =
            env_parse("MAILSCAN_ATTACHMENT_CONCURRENCY", "ATTACHMENT_CONCURRENCY")
                .unwrap_or(4usize)
                .clamp(1, 32);
        let analysis_delay_ms =
            env_parse("MAILSCAN_ANALYSIS_DELAY_MS", "ANALYSIS_DELAY_MS").unwrap_or(2_000);

        let gmail_access_token = env_or_fallback("MAILSCAN_GMAIL_ACCESS_TOKEN", "GMAIL_ACCESS_TOKEN");
        let gmail_api_base = env_or_fallback("MAILSCAN_GMAIL_API_BASE", "GMAIL_API_BASE")
            .unwrap_or_else(|| "https://gmail.googleapis.com".to_string());
        let fetch_timeout_ms =
            env_parse("MAILSCAN_FETCH_TIMEOUT_MS", "FETCH_TIMEOUT_MS").unwrap_or(15_000);

        let admin_addr = env_or_fallback("MAILSCAN_ADMIN_ADDR", "ADMIN_ADDR")
            .and_then(|s| normalize_optional_addr(&s));

        let migrate_on_startup = env_bool("MAILSCAN_MIGRATE_ON_STARTUP")
            .or_else(|| env_bool("MIGRATE_ON_STARTUP"))
            .unwrap_or(false);

        Ok(Self {
            database_url,
            redis_url,
            stream,
            group,
            consumer,
            read_count,
            block_ms,
            error_backoff_ms,
            reclaim_idle_ms,
            persist_timeout_ms,
            attachment_concurrency,
            analysis_delay_ms,
            gmail_access_token,
            gmail_api_base,
            fetch_timeout_ms,
            admin_addr,
            migrate_on_startup,
        })
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn persist_timeout(&self) -> Duration {
        Duration::from_millis(self.persist_timeout_ms)
    }
}

/// `worker-NNNN`, unique enough to tell processes apart inside one group.
pub fn random_consumer_name() -> String {
    format!("worker-{}", rand::thread_rng().gen_range(1000..=9999))
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_parse<T: std::str::FromStr>(primary: &str, fallback: &str) -> Option<T> {
    env_or_fallback(primary, fallback).and_then(|s| s.trim().parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|v| parse_bool(&v))
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}
