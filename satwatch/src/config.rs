//! Session tunables: reconnect timing, window sizes and retention, with
//! `SATWATCH_*` environment overrides.

use std::time::Duration;

use tracing::warn;

use crate::error::ConfigError;

/// Two-tier reconnect policy: bounded exponential backoff after losing a live
/// link, then a fixed-interval probe once offline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub retry_limit: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub probe_interval: Duration,
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .map_or(self.backoff_cap, |d| d.min(self.backoff_cap))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            retry_limit: 5,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(8),
            probe_interval: Duration::from_secs(6),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DashboardConfig {
    pub reconnect: ReconnectPolicy,
    pub window_capacity: usize,
    pub anomaly_retention: Duration,
    pub retention_tick: Duration,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            window_capacity: 120,
            anomaly_retention: Duration::from_secs(3600),
            retention_tick: Duration::from_secs(30),
        }
    }
}

impl DashboardConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Invalid values are logged and the default kept.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(v) = read(&lookup, "SATWATCH_RETRY_LIMIT", parse_num::<u32>) {
            cfg.reconnect.retry_limit = v;
        }
        if let Some(v) = read(&lookup, "SATWATCH_BACKOFF_BASE_MS", parse_millis) {
            cfg.reconnect.backoff_base = v;
        }
        if let Some(v) = read(&lookup, "SATWATCH_BACKOFF_CAP_MS", parse_millis) {
            cfg.reconnect.backoff_cap = v;
        }
        if let Some(v) = read(&lookup, "SATWATCH_PROBE_INTERVAL_MS", parse_millis) {
            cfg.reconnect.probe_interval = v;
        }
        if let Some(v) = read(&lookup, "SATWATCH_WINDOW", parse_nonzero) {
            cfg.window_capacity = v;
        }
        if let Some(v) = read(&lookup, "SATWATCH_RETENTION_SECS", parse_num::<u64>) {
            cfg.anomaly_retention = Duration::from_secs(v);
        }
        cfg
    }
}

fn read<F, T>(
    lookup: &F,
    key: &'static str,
    parse: fn(&'static str, &str) -> Result<T, ConfigError>,
) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match parse(key, &raw) {
        Ok(v) => Some(v),
        Err(err) => {
            warn!("ignoring {key}: {err}");
            None
        }
    }
}

fn parse_num<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse::<T>().map_err(|_| invalid(key, raw))
}

fn parse_nonzero(key: &'static str, raw: &str) -> Result<usize, ConfigError> {
    match parse_num(key, raw)? {
        0 => Err(invalid(key, raw)),
        n => Ok(n),
    }
}

fn parse_millis(key: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    let ms: u64 = parse_num(key, raw)?;
    if ms == 0 {
        return Err(invalid(key, raw));
    }
    Ok(Duration::from_millis(ms))
}

fn invalid(key: &'static str, raw: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
    }
}
