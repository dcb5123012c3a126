use std::{fs, str::FromStr, time::Duration};

use multiplexer::MuxOptions;
use serde::Deserialize;
use tracing::warn;

pub const SETTINGS_FILE: &str = "mux.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    pub bind_addr: String,
    pub database_url: String,
    pub min_reconnect_interval_ms: u64,
    /// Zero disables the bound.
    pub max_queue_len: usize,
    pub subprotocol: String,
    pub file_fetch_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let mux = MuxOptions::default();
        Self {
            bind_addr: "127.0.0.1:7878".into(),
            database_url: "sqlite://./data/mux.db".into(),
            min_reconnect_interval_ms: mux.min_reconnect_interval.as_millis() as u64,
            max_queue_len: mux.max_queue_len.unwrap_or(0),
            subprotocol: mux.subprotocol,
            file_fetch_timeout_secs: multiplexer::fetch::DEFAULT_FETCH_TIMEOUT.as_secs(),
        }
    }
}

impl Settings {
    pub fn mux_options(&self) -> MuxOptions {
        MuxOptions {
            min_reconnect_interval: Duration::from_millis(self.min_reconnect_interval_ms),
            max_queue_len: (self.max_queue_len > 0).then_some(self.max_queue_len),
            subprotocol: self.subprotocol.clone(),
            initially_online: true,
        }
    }

    pub fn file_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.file_fetch_timeout_secs)
    }
}

pub fn load_settings() -> Settings {
    let file = fs::read_to_string(SETTINGS_FILE).ok();
    settings_from(file.as_deref(), |key| std::env::var(key).ok())
}

/// Defaults, then `mux.toml` keys, then environment variables. For each
/// setting the `APP__` variable wins over its plain alias.
pub fn settings_from(file: Option<&str>, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();

    if let Some(raw) = file {
        match toml::from_str::<toml::Table>(raw) {
            Ok(file_cfg) => {
                let get = |key: &str| file_cfg.get(key).map(value_string);
                if let Some(v) = get("bind_addr") {
                    settings.bind_addr = v;
                }
                if let Some(v) = get("database_url") {
                    settings.database_url = v;
                }
                if let Some(v) = get("subprotocol") {
                    settings.subprotocol = v;
                }
                parse_into(
                    &mut settings.min_reconnect_interval_ms,
                    "min_reconnect_interval_ms",
                    get("min_reconnect_interval_ms"),
                );
                parse_into(
                    &mut settings.max_queue_len,
                    "max_queue_len",
                    get("max_queue_len"),
                );
                parse_into(
                    &mut settings.file_fetch_timeout_secs,
                    "file_fetch_timeout_secs",
                    get("file_fetch_timeout_secs"),
                );
            }
            Err(error) => warn!(%error, "config: ignoring unreadable {SETTINGS_FILE}"),
        }
    }

    if let Some(v) = env("MUX_BIND") {
        settings.bind_addr = v;
    }
    if let Some(v) = env("APP__BIND_ADDR") {
        settings.bind_addr = v;
    }

    if let Some(v) = env("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = env("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(v) = env("APP__SUBPROTOCOL") {
        settings.subprotocol = v;
    }

    parse_into(
        &mut settings.min_reconnect_interval_ms,
        "APP__MIN_RECONNECT_INTERVAL_MS",
        env("APP__MIN_RECONNECT_INTERVAL_MS"),
    );
    parse_into(
        &mut settings.max_queue_len,
        "APP__MAX_QUEUE_LEN",
        env("APP__MAX_QUEUE_LEN"),
    );
    parse_into(
        &mut settings.file_fetch_timeout_secs,
        "APP__FILE_FETCH_TIMEOUT_SECS",
        env("APP__FILE_FETCH_TIMEOUT_SECS"),
    );

    settings
}

fn value_string(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_into<T: FromStr>(target: &mut T, key: &str, raw: Option<String>) {
    let Some(raw) = raw else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(parsed) => *target = parsed,
        Err(_) => warn!(key, value = %raw, "config: ignoring unparseable value"),
    }
}

/// Accepts a bare file path or a `sqlite:` URL and returns a `sqlite://` URL.
pub fn normalize_database_url(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return Settings::default().database_url;
    }
    if raw.starts_with("sqlite::memory:") || raw.contains("://") {
        return raw.to_string();
    }
    let path = raw.strip_prefix("sqlite:").unwrap_or(raw);
    format!("sqlite://{}", path.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
