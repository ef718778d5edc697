use std::{fs, path::Path, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

pub const DEFAULT_SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub api_base_url: String,
    pub push_url: Option<String>,
    pub reconnect_initial_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub resync_buffer_limit: usize,
    pub event_channel_capacity: usize,
    pub request_timeout_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:5000/api".into(),
            push_url: None,
            reconnect_initial_delay_ms: 500,
            reconnect_max_delay_ms: 30_000,
            connect_timeout_ms: 10_000,
            resync_buffer_limit: 512,
            event_channel_capacity: 1024,
            request_timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

impl SyncSettings {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(self.reconnect_initial_delay_ms),
            max_delay: Duration::from_millis(
                self.reconnect_max_delay_ms.max(self.reconnect_initial_delay_ms),
            ),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        let api = self.api_base_url.trim();
        if !(api.starts_with("http://") || api.starts_with("https://")) {
            bail!("api_base_url must start with http:// or https://, got '{api}'");
        }
        if let Some(push_url) = &self.push_url {
            let push = push_url.trim();
            let supported = ["ws://", "wss://", "http://", "https://"];
            if !supported.iter().any(|scheme| push.starts_with(scheme)) {
                bail!("push_url must be a ws(s):// or http(s):// url, got '{push}'");
            }
        }
        if self.reconnect_initial_delay_ms == 0 {
            bail!("reconnect_initial_delay_ms must be greater than zero");
        }
        if self.resync_buffer_limit == 0 || self.event_channel_capacity == 0 {
            bail!("resync_buffer_limit and event_channel_capacity must be greater than zero");
        }
        Ok(())
    }
}

pub fn load_settings(path: Option<&Path>) -> Result<SyncSettings> {
    let mut settings = match path {
        Some(path) => read_settings_file(path)?,
        None if Path::new(DEFAULT_SETTINGS_FILE).exists() => {
            read_settings_file(Path::new(DEFAULT_SETTINGS_FILE))?
        }
        None => SyncSettings::default(),
    };
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok())?;
    settings.validate()?;
    Ok(settings)
}

fn read_settings_file(path: &Path) -> Result<SyncSettings> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file '{}'", path.display()))?;
    parse_settings(&raw).with_context(|| format!("invalid settings file '{}'", path.display()))
}

pub fn parse_settings(raw: &str) -> Result<SyncSettings> {
    Ok(toml::from_str(raw)?)
}

/// `SYNC_*` names take precedence over the `APP__*` aliases.
pub fn apply_env_overrides(
    settings: &mut SyncSettings,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    let get = |name: &str| {
        lookup(&format!("SYNC_{name}")).or_else(|| lookup(&format!("APP__{name}")))
    };

    if let Some(v) = get("API_BASE_URL") {
        settings.api_base_url = v;
    }
    if let Some(v) = get("PUSH_URL") {
        settings.push_url = if v.trim().is_empty() { None } else { Some(v) };
    }
    if let Some(v) = get("RECONNECT_INITIAL_DELAY_MS") {
        settings.reconnect_initial_delay_ms = parse_number("RECONNECT_INITIAL_DELAY_MS", &v)?;
    }
    if let Some(v) = get("RECONNECT_MAX_DELAY_MS") {
        settings.reconnect_max_delay_ms = parse_number("RECONNECT_MAX_DELAY_MS", &v)?;
    }
    if let Some(v) = get("CONNECT_TIMEOUT_MS") {
        settings.connect_timeout_ms = parse_number("CONNECT_TIMEOUT_MS", &v)?;
    }
    if let Some(v) = get("RESYNC_BUFFER_LIMIT") {
        settings.resync_buffer_limit = parse_number("RESYNC_BUFFER_LIMIT", &v)?;
    }
    if let Some(v) = get("EVENT_CHANNEL_CAPACITY") {
        settings.event_channel_capacity = parse_number("EVENT_CHANNEL_CAPACITY", &v)?;
    }
    if let Some(v) = get("REQUEST_TIMEOUT_SECS") {
        settings.request_timeout_secs = parse_number("REQUEST_TIMEOUT_SECS", &v)?;
    }
    Ok(())
}

fn parse_number<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| anyhow!("environment override {name} is not a number: '{raw}'"))
}

#[cfg(test)]
#[path = "tests/settings_tests.rs"]
mod tests;
