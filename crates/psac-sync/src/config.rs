use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use psac_storage::{HttpSourceConfig, SettingsStore};
use tracing::warn;

/// Process-level configuration read from the environment.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub source_url: String,
    pub source_token: Option<String>,
    pub rules_path: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub web_port: u16,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            source_url: std::env::var("PSAC_SOURCE_URL").unwrap_or_else(|_| "http://127.0.0.1:8081".to_string()),
            source_token: std::env::var("PSAC_SOURCE_TOKEN").ok(),
            rules_path: std::env::var("PSAC_RULES_PATH").ok().map(PathBuf::from),
            scheduler_enabled: std::env::var("PSAC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
            web_port: std::env::var("PSAC_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
            http_timeout_secs: std::env::var("PSAC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: std::env::var("PSAC_USER_AGENT").unwrap_or_else(|_| "psac-bot/0.1".to_string()),
        }
    }

    pub fn source_config(&self) -> HttpSourceConfig {
        HttpSourceConfig {
            base_url: self.source_url.clone(),
            token: self.source_token.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..HttpSourceConfig::default()
        }
    }
}

pub const INTERVAL_MINUTES: &str = "scraper.interval_minutes";
pub const RETRY_ATTEMPTS: &str = "scraper.retry_attempts";
pub const RETRY_BACKOFF_SECS: &str = "scraper.retry_backoff_secs";
pub const BULK_LIMIT: &str = "scraper.bulk_limit";
pub const WINDOW_HOURS: &str = "scraper.window_hours";
pub const INCREMENTAL_WINDOW_MINUTES: &str = "scraper.incremental_window_minutes";
pub const SCRAPER_ENABLED: &str = "scraper.enabled";
pub const SWEEP_ENABLED: &str = "sweep.enabled";
pub const SWEEP_INTERVAL_HOURS: &str = "sweep.interval_hours";
pub const SWEEP_MAX_AGE_DAYS: &str = "sweep.max_age_days";
pub const SWEEP_NOTIFY_THRESHOLD: &str = "sweep.notify_threshold";

/// Operational thresholds, loaded from the settings store once per cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub interval_minutes: u64,
    pub retry_attempts: u32,
    pub retry_backoff_secs: u64,
    pub bulk_limit: u32,
    pub window_hours: u32,
    pub incremental_window_minutes: i64,
    pub scraper_enabled: bool,
    pub sweep_enabled: bool,
    pub sweep_interval_hours: i64,
    pub sweep_max_age_days: i64,
    pub sweep_notify_threshold: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            interval_minutes: 15,
            retry_attempts: 3,
            retry_backoff_secs: 5,
            bulk_limit: 100,
            window_hours: 24,
            incremental_window_minutes: 60,
            scraper_enabled: true,
            sweep_enabled: false,
            sweep_interval_hours: 6,
            sweep_max_age_days: 7,
            sweep_notify_threshold: 5,
        }
    }
}

impl Settings {
    /// Read every key, falling back to the default for missing, unparsable,
    /// non-positive or out-of-range values. A failing store yields the defaults.
    pub async fn load<S>(store: &S) -> Self
    where
        S: SettingsStore + ?Sized,
    {
        let defaults = Self::default();
        let mut raw = Vec::with_capacity(11);
        for key in [
            INTERVAL_MINUTES,
            RETRY_ATTEMPTS,
            RETRY_BACKOFF_SECS,
            BULK_LIMIT,
            WINDOW_HOURS,
            INCREMENTAL_WINDOW_MINUTES,
            SCRAPER_ENABLED,
            SWEEP_ENABLED,
            SWEEP_INTERVAL_HOURS,
            SWEEP_MAX_AGE_DAYS,
            SWEEP_NOTIFY_THRESHOLD,
        ] {
            match store.get_setting(key).await {
                Ok(value) => raw.push((key, value)),
                Err(err) => {
                    warn!(key, error = %err, "settings store unavailable; using defaults");
                    return defaults;
                }
            }
        }
        let lookup = |key: &str| {
            raw.iter()
                .find(|(k, _)| *k == key)
                .and_then(|(_, v)| v.as_deref())
        };

        Self {
            interval_minutes: bounded(INTERVAL_MINUTES, lookup(INTERVAL_MINUTES), defaults.interval_minutes, 7 * 24 * 60),
            retry_attempts: bounded(RETRY_ATTEMPTS, lookup(RETRY_ATTEMPTS), defaults.retry_attempts, 20),
            retry_backoff_secs: bounded(
                RETRY_BACKOFF_SECS,
                lookup(RETRY_BACKOFF_SECS),
                defaults.retry_backoff_secs,
                60 * 60,
            ),
            bulk_limit: bounded(BULK_LIMIT, lookup(BULK_LIMIT), defaults.bulk_limit, 10_000),
            window_hours: bounded(WINDOW_HOURS, lookup(WINDOW_HOURS), defaults.window_hours, 24 * 366),
            incremental_window_minutes: bounded(
                INCREMENTAL_WINDOW_MINUTES,
                lookup(INCREMENTAL_WINDOW_MINUTES),
                defaults.incremental_window_minutes,
                366 * 24 * 60,
            ),
            scraper_enabled: flag(SCRAPER_ENABLED, lookup(SCRAPER_ENABLED), defaults.scraper_enabled),
            sweep_enabled: flag(SWEEP_ENABLED, lookup(SWEEP_ENABLED), defaults.sweep_enabled),
            sweep_interval_hours: bounded(
                SWEEP_INTERVAL_HOURS,
                lookup(SWEEP_INTERVAL_HOURS),
                defaults.sweep_interval_hours,
                24 * 366,
            ),
            sweep_max_age_days: bounded(
                SWEEP_MAX_AGE_DAYS,
                lookup(SWEEP_MAX_AGE_DAYS),
                defaults.sweep_max_age_days,
                10 * 366,
            ),
            sweep_notify_threshold: bounded(
                SWEEP_NOTIFY_THRESHOLD,
                lookup(SWEEP_NOTIFY_THRESHOLD),
                defaults.sweep_notify_threshold,
                1_000_000,
            ),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes.saturating_mul(60))
    }

    pub fn incremental_window(&self) -> chrono::Duration {
        chrono::Duration::try_minutes(self.incremental_window_minutes).unwrap_or(chrono::Duration::MAX)
    }

    pub fn sweep_interval(&self) -> chrono::Duration {
        chrono::Duration::try_hours(self.sweep_interval_hours).unwrap_or(chrono::Duration::MAX)
    }

    pub fn sweep_max_age(&self) -> chrono::Duration {
        chrono::Duration::try_days(self.sweep_max_age_days).unwrap_or(chrono::Duration::MAX)
    }
}

/// Parse a value in `1..=max`; anything else falls back to `default`.
fn bounded<T>(key: &str, raw: Option<&str>, default: T, max: T) -> T
where
    T: FromStr + PartialOrd + Default + Display + Copy,
{
    let Some(raw) = raw else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() && value <= max => value,
        _ => {
            warn!(key, value = raw, fallback = %default, "invalid setting; using default");
            default
        }
    }
}

fn flag(key: &str, raw: Option<&str>, default: bool) -> bool {
    let Some(raw) = raw else {
        return default;
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => {
            warn!(key, value = raw, fallback = default, "invalid setting; using default");
            default
        }
    }
}
