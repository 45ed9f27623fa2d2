//! Runtime configuration.
//!
//! Layered as defaults, then `VALET_*` environment variables, then rows in
//! `local_settings` under the `config` category (written by the admin screens).

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::db;

const CONFIG_CATEGORY: &str = "config";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub remote_url: Option<String>,
    pub api_key: Option<String>,
    pub remote_timeout_ms: u64,
    pub sync_interval_secs: u64,
    /// Fixed width of the zero-padded sequence number.
    pub sequence_width: usize,
    pub sequence_counter_key: String,
    pub retry_base_delay_ms: i64,
    pub retry_max_delay_ms: i64,
    pub sync_batch_size: usize,
    /// Shop timezone as minutes east of UTC. Loyalty months roll over at
    /// local midnight.
    pub shop_utc_offset_minutes: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            remote_url: None,
            api_key: None,
            remote_timeout_ms: 10_000,
            sync_interval_secs: 15,
            sequence_width: 6,
            sequence_counter_key: "order_sequence".to_string(),
            retry_base_delay_ms: 5_000,
            retry_max_delay_ms: 300_000,
            sync_batch_size: 50,
            shop_utc_offset_minutes: 0,
        }
    }
}

impl Config {
    /// Defaults overridden by `VALET_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        for (key, value) in std::env::vars() {
            if let Some(name) = key.strip_prefix("VALET_") {
                config.set(&name.to_ascii_lowercase(), &value);
            }
        }
        config
    }

    /// Apply overrides stored in `local_settings` (category `config`).
    pub fn apply_local_settings(&mut self, conn: &Connection) {
        match db::get_category_settings(conn, CONFIG_CATEGORY) {
            Ok(rows) => {
                for (key, value) in rows {
                    self.set(&key, &value);
                }
            }
            Err(e) => warn!(error = %e, "Failed to read config overrides from local settings"),
        }
    }

    fn set(&mut self, key: &str, raw: &str) {
        let value = raw.trim();
        let applied = match key {
            "remote_url" => {
                self.remote_url = Some(value.to_string()).filter(|v| !v.is_empty());
                true
            }
            "api_key" => {
                self.api_key = Some(value.to_string()).filter(|v| !v.is_empty());
                true
            }
            "remote_timeout_ms" => parse_into(value, &mut self.remote_timeout_ms),
            "sync_interval_secs" => parse_into(value, &mut self.sync_interval_secs),
            "sequence_width" => parse_into(value, &mut self.sequence_width),
            "sequence_counter_key" => {
                if !value.is_empty() {
                    self.sequence_counter_key = value.to_string();
                }
                true
            }
            "retry_base_delay_ms" => parse_into(value, &mut self.retry_base_delay_ms),
            "retry_max_delay_ms" => parse_into(value, &mut self.retry_max_delay_ms),
            "sync_batch_size" => parse_into(value, &mut self.sync_batch_size),
            "shop_utc_offset_minutes" => parse_into(value, &mut self.shop_utc_offset_minutes),
            // Unrelated VALET_* variables (log level etc.) are not config keys.
            _ => true,
        };
        if !applied {
            warn!(key, value, "Ignoring unparsable config value");
        }
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms.max(1))
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    pub fn is_remote_configured(&self) -> bool {
        self.remote_url.is_some() && self.api_key.is_some()
    }
}

fn parse_into<T: std::str::FromStr>(raw: &str, slot: &mut T) -> bool {
    match raw.parse::<T>() {
        Ok(parsed) => {
            *slot = parsed;
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.sequence_width, 6);
        assert_eq!(config.remote_timeout(), Duration::from_secs(10));
        assert!(!config.is_remote_configured());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("VALET_SEQUENCE_WIDTH", "8");
        std::env::set_var("VALET_REMOTE_URL", "https://shop.example");
        std::env::set_var("VALET_API_KEY", "k-123");
        std::env::set_var("VALET_SYNC_INTERVAL_SECS", "not-a-number");

        let config = Config::from_env();

        std::env::remove_var("VALET_SEQUENCE_WIDTH");
        std::env::remove_var("VALET_REMOTE_URL");
        std::env::remove_var("VALET_API_KEY");
        std::env::remove_var("VALET_SYNC_INTERVAL_SECS");

        assert_eq!(config.sequence_width, 8);
        assert_eq!(config.sync_interval_secs, 15);
        assert!(config.is_remote_configured());
    }

    #[test]
    #[serial]
    fn test_local_settings_override_env() {
        std::env::set_var("VALET_SEQUENCE_COUNTER_KEY", "from_env");
        let mut config = Config::from_env();
        std::env::remove_var("VALET_SEQUENCE_COUNTER_KEY");
        assert_eq!(config.sequence_counter_key, "from_env");

        let state = db::open_in_memory().unwrap();
        let conn = state.conn.lock().unwrap();
        db::set_setting(&conn, CONFIG_CATEGORY, "sequence_counter_key", "shop_a").unwrap();
        db::set_setting(&conn, CONFIG_CATEGORY, "retry_max_delay_ms", "60000").unwrap();
        db::set_setting(&conn, CONFIG_CATEGORY, "shop_utc_offset_minutes", "-300").unwrap();
        config.apply_local_settings(&conn);

        assert_eq!(config.sequence_counter_key, "shop_a");
        assert_eq!(config.retry_max_delay_ms, 60_000);
        assert_eq!(config.shop_utc_offset_minutes, -300);
    }
}
