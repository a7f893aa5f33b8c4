use std::str::FromStr;

use chrono_tz::Tz;

use crate::types::BlackoutWindow;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string (pacing state + delayed queues)
    pub redis_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// HTTP port of the submission API (default: 3333)
    pub api_port: u16,

    /// Zone used to read requested send times and to evaluate blackout hours
    pub timezone: Tz,

    /// Hour ranges during which nothing is dispatched (default: "20-24,0-8")
    pub blackout_windows: Vec<BlackoutWindow>,

    /// Largest accepted batch (default: 500)
    pub max_batch_size: usize,

    /// Randomized spacing between consecutive messages of a group
    pub message_delay_min_ms: u64,
    pub message_delay_max_ms: u64,

    /// Substitute delay when a requested send time has already elapsed
    pub past_due_delay_min_ms: u64,
    pub past_due_delay_max_ms: u64,

    /// Upper bound of the jitter added after leaving a blackout window
    pub boundary_jitter_max_ms: u64,

    /// Fixed gap between two items of the same group
    pub min_gap_ms: u64,

    /// Cushion stored after each scheduled group
    pub group_cushion_ms: u64,

    /// Cushion added when reading a customer's earliest available instant
    pub pacing_floor_cushion_ms: u64,

    /// Expiry of per-customer pacing state (default: 7200 = 2h)
    pub pacing_ttl_secs: u64,

    /// Total delivery attempts per job (default: 3)
    pub retry_max_attempts: u32,

    /// First retry delay, doubled per subsequent attempt (default: 10000)
    pub retry_base_delay_ms: u64,

    /// Timeout of a single provider call (default: 20000)
    pub provider_timeout_ms: u64,

    /// Sleep between idle worker ticks (default: 1000)
    pub worker_poll_interval_ms: u64,

    /// Lease taken on a claimed queue entry before it becomes visible again
    pub queue_visibility_timeout_ms: u64,

    /// Adaptive WhatsApp send floor bounds
    pub whatsapp_send_floor_min_ms: u64,
    pub whatsapp_send_floor_max_ms: u64,

    /// Fixed SMS send floor
    pub sms_send_floor_ms: u64,

    /// Parallel email deliveries per worker
    pub email_concurrency: usize,

    /// Endpoint that delivery receipts are relayed to, if any
    pub receipt_forward_url: Option<String>,

    /// Per-IP request budget of the API per minute (default: 1000)
    pub rate_limit_per_minute: u64,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let timezone = std::env::var("SCHEDULE_TIMEZONE")
            .unwrap_or_else(|_| "America/Sao_Paulo".to_string());
        let timezone = timezone
            .parse::<Tz>()
            .map_err(|e| anyhow::anyhow!("SCHEDULE_TIMEZONE is not a valid time zone: {}", e))?;

        let blackout_windows = std::env::var("BLACKOUT_WINDOWS")
            .unwrap_or_else(|_| "20-24,0-8".to_string());
        let blackout_windows = BlackoutWindow::parse_list(&blackout_windows)
            .map_err(|e| anyhow::anyhow!("BLACKOUT_WINDOWS is invalid: {}", e))?;

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            db_max_connections: var_or("DB_MAX_CONNECTIONS", 20)?,
            api_port: var_or("API_PORT", 3333)?,
            timezone,
            blackout_windows,
            max_batch_size: var_or("MAX_BATCH_SIZE", 500)?,
            message_delay_min_ms: var_or("MESSAGE_DELAY_MIN_MS", 1_000)?,
            message_delay_max_ms: var_or("MESSAGE_DELAY_MAX_MS", 5_000)?,
            past_due_delay_min_ms: var_or("PAST_DUE_DELAY_MIN_MS", 15_000)?,
            past_due_delay_max_ms: var_or("PAST_DUE_DELAY_MAX_MS", 90_000)?,
            boundary_jitter_max_ms: var_or("BOUNDARY_JITTER_MAX_MS", 60_000)?,
            min_gap_ms: var_or("MIN_GAP_MS", 1_000)?,
            group_cushion_ms: var_or("GROUP_CUSHION_MS", 10_000)?,
            pacing_floor_cushion_ms: var_or("PACING_FLOOR_CUSHION_MS", 1_000)?,
            pacing_ttl_secs: var_or("PACING_TTL_SECS", 7_200)?,
            retry_max_attempts: var_or("RETRY_MAX_ATTEMPTS", 3)?,
            retry_base_delay_ms: var_or("RETRY_BASE_DELAY_MS", 10_000)?,
            provider_timeout_ms: var_or("PROVIDER_TIMEOUT_MS", 20_000)?,
            worker_poll_interval_ms: var_or("WORKER_POLL_INTERVAL_MS", 1_000)?,
            queue_visibility_timeout_ms: var_or("QUEUE_VISIBILITY_TIMEOUT_MS", 120_000)?,
            whatsapp_send_floor_min_ms: var_or("WHATSAPP_SEND_FLOOR_MIN_MS", 10_000)?,
            whatsapp_send_floor_max_ms: var_or("WHATSAPP_SEND_FLOOR_MAX_MS", 30_000)?,
            sms_send_floor_ms: var_or("SMS_SEND_FLOOR_MS", 1_000)?,
            email_concurrency: var_or("EMAIL_CONCURRENCY", 4)?,
            receipt_forward_url: std::env::var("RECEIPT_FORWARD_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            rate_limit_per_minute: var_or("RATE_LIMIT_PER_MINUTE", 1_000)?,
        })
    }
}

/// Read an optional numeric variable, falling back to `default` when unset.
fn var_or<T: FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be a valid {}", name, std::any::type_name::<T>())),
        Err(_) => Ok(default),
    }
}
