//! Environment-derived configuration. Mirrors spec.md §6: `DB_URI`, `HTTP_PORT`, plus the
//! operational tunables this expansion names in SPEC_FULL.md §6.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub db_uri: String,
    pub http_port: u16,
    pub janitor_interval: Duration,
    pub retention: Duration,
    pub detail_cache_ttl: Duration,
    /// NDJSON warm-start/crash-recovery snapshot for `InMemoryAlertStore`. `None` disables it
    /// (the default store used by tests never sets this).
    pub snapshot_path: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            db_uri: env::var("DB_URI").unwrap_or_else(|_| "memory://local".to_string()),
            http_port: env_parse("HTTP_PORT", 8080),
            janitor_interval: Duration::from_secs(env_parse(
                "CAPCAST_JANITOR_INTERVAL_SECS",
                86_400,
            )),
            retention: Duration::from_secs(env_parse("CAPCAST_RETENTION_DAYS", 30) * 86_400),
            detail_cache_ttl: Duration::from_secs(env_parse(
                "CAPCAST_DETAIL_CACHE_TTL_SECS",
                300,
            )),
            snapshot_path: env::var("CAPCAST_SNAPSHOT_PATH").ok().map(PathBuf::from),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
