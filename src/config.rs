//! Ledger settings: built-in defaults, optionally overridden from the
//! environment.
//!
//! Every window is a whole number of seconds between one second and
//! [`MAX_WINDOW_SECS`], and the lock timeout is at most
//! [`MAX_LOCK_WAIT`]. Anything else is refused at load time.
use std::{path::PathBuf, time::Duration};

use anyhow::{Context, ensure};
use chrono::TimeDelta;

pub use crate::store::MAX_LOCK_WAIT;

pub const DEFAULT_DB_PATH: &str = "relay.db";

/// Ten years.
pub const MAX_WINDOW_SECS: i64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub db_path: PathBuf,
    /// How long a reserved or committed delivery stays claimable before pickup.
    pub reservation_window: TimeDelta,
    /// Window in which a courier's earlier active claim is treated as a retry
    /// of the same intent rather than a conflicting second claim.
    pub claim_grace: TimeDelta,
    /// Upper bound on waiting for a row lock.
    pub lock_timeout: Duration,
    /// Batch expiry applied when the good carries no shelf life of its own.
    pub default_shelf_life: TimeDelta,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            reservation_window: TimeDelta::hours(3),
            claim_grace: TimeDelta::seconds(30),
            lock_timeout: Duration::from_secs(5),
            default_shelf_life: TimeDelta::hours(24),
        }
    }
}

impl LedgerConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Default::default()
        }
    }

    /// Defaults overridden by `GOODS_RELAY_*` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(path) = lookup("GOODS_RELAY_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(secs) = parse_i64(&lookup, "GOODS_RELAY_RESERVATION_WINDOW_SECS")? {
            config.reservation_window = seconds(secs, "GOODS_RELAY_RESERVATION_WINDOW_SECS")?;
        }
        if let Some(secs) = parse_i64(&lookup, "GOODS_RELAY_CLAIM_GRACE_SECS")? {
            config.claim_grace = seconds(secs, "GOODS_RELAY_CLAIM_GRACE_SECS")?;
        }
        if let Some(ms) = parse_i64(&lookup, "GOODS_RELAY_LOCK_TIMEOUT_MS")? {
            let ms = u64::try_from(ms).context("GOODS_RELAY_LOCK_TIMEOUT_MS must not be negative")?;
            let timeout = Duration::from_millis(ms);
            ensure!(
                !timeout.is_zero() && timeout <= MAX_LOCK_WAIT,
                "GOODS_RELAY_LOCK_TIMEOUT_MS must be between 1 and {}, got {ms}",
                MAX_LOCK_WAIT.as_millis()
            );
            config.lock_timeout = timeout;
        }
        if let Some(secs) = parse_i64(&lookup, "GOODS_RELAY_SHELF_LIFE_SECS")? {
            config.default_shelf_life = seconds(secs, "GOODS_RELAY_SHELF_LIFE_SECS")?;
        }

        Ok(config)
    }
}

fn seconds(secs: i64, name: &str) -> anyhow::Result<TimeDelta> {
    ensure!(
        (1..=MAX_WINDOW_SECS).contains(&secs),
        "{name} must be between 1 and {MAX_WINDOW_SECS} seconds, got {secs}"
    );
    TimeDelta::try_seconds(secs).with_context(|| format!("{name} is out of range: {secs}"))
}

fn parse_i64(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> anyhow::Result<Option<i64>> {
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse::<i64>()
                .with_context(|| format!("{name} is not an integer: {raw:?}"))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn lookup_overrides_defaults() {
        let vars = HashMap::from([
            ("GOODS_RELAY_DB_PATH", "/tmp/relay"),
            ("GOODS_RELAY_CLAIM_GRACE_SECS", "10"),
            ("GOODS_RELAY_LOCK_TIMEOUT_MS", "250"),
        ]);
        let config = LedgerConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.db_path, PathBuf::from("/tmp/relay"));
        assert_eq!(config.claim_grace, TimeDelta::seconds(10));
        assert_eq!(config.lock_timeout, Duration::from_millis(250));
        assert_eq!(config.reservation_window, TimeDelta::hours(3));
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = LedgerConfig::from_lookup(|k| {
            (k == "GOODS_RELAY_RESERVATION_WINDOW_SECS").then(|| "three hours".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("GOODS_RELAY_RESERVATION_WINDOW_SECS"));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let too_long = (MAX_WINDOW_SECS + 1).to_string();
        let cases = [
            ("GOODS_RELAY_CLAIM_GRACE_SECS", "0"),
            ("GOODS_RELAY_CLAIM_GRACE_SECS", "-30"),
            ("GOODS_RELAY_RESERVATION_WINDOW_SECS", "-1"),
            ("GOODS_RELAY_RESERVATION_WINDOW_SECS", too_long.as_str()),
            ("GOODS_RELAY_SHELF_LIFE_SECS", "0"),
            ("GOODS_RELAY_SHELF_LIFE_SECS", "9223372036854775807"),
            ("GOODS_RELAY_LOCK_TIMEOUT_MS", "0"),
            ("GOODS_RELAY_LOCK_TIMEOUT_MS", "9223372036854775807"),
        ];
        for (name, value) in cases {
            let err = LedgerConfig::from_lookup(|k| (k == name).then(|| value.to_string()))
                .unwrap_err();
            assert!(err.to_string().contains(name), "{name}={value}: {err}");
        }

        let config = LedgerConfig::from_lookup(|k| {
            (k == "GOODS_RELAY_SHELF_LIFE_SECS").then(|| MAX_WINDOW_SECS.to_string())
        })
        .unwrap();
        assert_eq!(config.default_shelf_life, TimeDelta::seconds(MAX_WINDOW_SECS));
    }
}
