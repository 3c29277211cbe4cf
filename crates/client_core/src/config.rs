use std::{fs, path::Path, time::Duration};

use anyhow::{anyhow, Context};
use serde::Deserialize;
use tracing::warn;
use url::Url;

pub const DEFAULT_CONFIG_FILE: &str = "client.toml";
const DEFAULT_ACCESS_TOKEN_TTL_SECS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub api_base_url: String,
    pub realtime_url: Option<String>,
    pub database_url: String,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub access_token_ttl_secs: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8080".into(),
            realtime_url: None,
            database_url: "sqlite://./data/chat_cache.db".into(),
            request_timeout_secs: 15,
            connect_timeout_secs: 10,
            access_token_ttl_secs: DEFAULT_ACCESS_TOKEN_TTL_SECS,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    api_base_url: Option<String>,
    realtime_url: Option<String>,
    database_url: Option<String>,
    request_timeout_secs: Option<u64>,
    connect_timeout_secs: Option<u64>,
    access_token_ttl_secs: Option<u64>,
}

impl ClientSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn access_token_ttl(&self) -> Duration {
        Duration::from_secs(self.access_token_ttl_secs)
    }

    /// Websocket base URL; derived from the API URL when not configured.
    pub fn realtime_base_url(&self) -> anyhow::Result<String> {
        if let Some(url) = &self.realtime_url {
            return Ok(url.trim_end_matches('/').to_string());
        }
        let mut url = Url::parse(&self.api_base_url)
            .with_context(|| format!("invalid api_base_url '{}'", self.api_base_url))?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => return Err(anyhow!("api_base_url must use http or https, got '{other}'")),
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("cannot derive a websocket url from '{}'", self.api_base_url))?;
        Ok(url.as_str().trim_end_matches('/').to_string())
    }

    fn merge_file(&mut self, file_cfg: FileSettings) {
        if let Some(v) = file_cfg.api_base_url {
            self.api_base_url = v;
        }
        if let Some(v) = file_cfg.realtime_url {
            self.realtime_url = Some(v);
        }
        if let Some(v) = file_cfg.database_url {
            self.database_url = v;
        }
        if let Some(v) = file_cfg.request_timeout_secs {
            self.request_timeout_secs = v;
        }
        if let Some(v) = file_cfg.connect_timeout_secs {
            self.connect_timeout_secs = v;
        }
        if let Some(v) = file_cfg.access_token_ttl_secs {
            self.access_token_ttl_secs = v;
        }
    }

    /// Applies `CHAT_*` overrides using `lookup` as the environment.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("CHAT_API_URL") {
            self.api_base_url = v;
        }
        if let Some(v) = lookup("CHAT_REALTIME_URL") {
            self.realtime_url = Some(v);
        }
        if let Some(v) = lookup("CHAT_DATABASE_URL") {
            self.database_url = v;
        }
        let numeric = [
            ("CHAT_REQUEST_TIMEOUT_SECS", &mut self.request_timeout_secs),
            ("CHAT_CONNECT_TIMEOUT_SECS", &mut self.connect_timeout_secs),
            ("CHAT_TOKEN_TTL_SECS", &mut self.access_token_ttl_secs),
        ];
        for (key, slot) in numeric {
            if let Some(raw) = lookup(key) {
                match raw.parse::<u64>() {
                    Ok(parsed) => *slot = parsed,
                    Err(_) => warn!(key, value = %raw, "config: ignoring non-numeric override"),
                }
            }
        }
    }
}

/// Defaults, then the TOML file at `path` (if present), then the environment.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<ClientSettings> {
    let mut settings = ClientSettings::default();
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));

    if path.exists() {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{}'", path.display()))?;
        let file_cfg: FileSettings = toml::from_str(&raw)
            .with_context(|| format!("invalid config file '{}'", path.display()))?;
        settings.merge_file(file_cfg);
    }

    settings.apply_env_overrides(|key| std::env::var(key).ok());
    settings.database_url = normalize_database_url(&settings.database_url);
    Ok(settings)
}

pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return ClientSettings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
