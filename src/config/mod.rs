//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::Endpoint;
use crate::channel::{Jitter, ReconnectPolicy};

pub use cli::{CliArgs, Command, CommonOverrides, GetArgs, MutateArgs, WatchArgs, params_object};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "portal-sync";
const ENV_PREFIX: &str = "PORTAL_SYNC";
const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8080/api/";
const DEFAULT_API_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CHANNEL_URL: &str = "ws://127.0.0.1:8080/socket";
const DEFAULT_CHANNEL_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_RECONNECT_BASE_MS: u64 = 1_000;
const DEFAULT_RECONNECT_CAP_MS: u64 = 30_000;
const DEFAULT_CACHE_KEEP_UNUSED_SECS: u64 = 60;
const DEFAULT_NOTIFICATION_EVENT: &str = "notification";
const DEFAULT_NOTIFICATION_TAG: &str = "Notifications";
const DEFAULT_NOTIFICATIONS_ENDPOINT: &str = "GET /notifications";

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub api: ApiSettings,
    pub channel: ChannelSettings,
    pub cache: CacheSettings,
    pub portal: PortalSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    /// Always ends with `/` so endpoint paths join beneath it.
    pub base_url: Url,
    pub request_timeout: Duration,
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub url: Url,
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub keep_unused_for: Duration,
}

#[derive(Debug, Clone)]
pub struct PortalSettings {
    pub notification_event: String,
    pub notification_tags: Vec<String>,
    pub notifications_endpoint: String,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(cli.command.overrides());

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    api: RawApiSettings,
    channel: RawChannelSettings,
    cache: RawCacheSettings,
    portal: RawPortalSettings,
    logging: RawLoggingSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &CommonOverrides) {
        if let Some(url) = overrides.api_base_url.as_ref() {
            self.api.base_url = Some(url.clone());
        }
        if let Some(token) = overrides.api_token.as_ref() {
            self.api.token = Some(token.clone());
        }
        if let Some(seconds) = overrides.api_request_timeout_seconds {
            self.api.request_timeout_seconds = Some(seconds);
        }
        if let Some(url) = overrides.channel_url.as_ref() {
            self.channel.url = Some(url.clone());
        }
        if let Some(seconds) = overrides.cache_keep_unused_seconds {
            self.cache.keep_unused_for_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            api,
            channel,
            cache,
            portal,
            logging,
        } = raw;

        Ok(Self {
            api: build_api_settings(api)?,
            channel: build_channel_settings(channel)?,
            cache: build_cache_settings(cache),
            portal: build_portal_settings(portal)?,
            logging: build_logging_settings(logging)?,
        })
    }
}

fn build_api_settings(api: RawApiSettings) -> Result<ApiSettings, LoadError> {
    let raw_url = api
        .base_url
        .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());
    let mut base_url = Url::parse(raw_url.trim())
        .map_err(|err| LoadError::invalid("api.base_url", format!("failed to parse: {err}")))?;
    if !matches!(base_url.scheme(), "http" | "https") {
        return Err(LoadError::invalid(
            "api.base_url",
            "scheme must be http or https",
        ));
    }
    if !base_url.path().ends_with('/') {
        let path = format!("{}/", base_url.path());
        base_url.set_path(&path);
    }

    let timeout_secs = api
        .request_timeout_seconds
        .unwrap_or(DEFAULT_API_REQUEST_TIMEOUT_SECS);
    let request_timeout = non_zero_secs(timeout_secs, "api.request_timeout_seconds")?;

    let token = api.token.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    Ok(ApiSettings {
        base_url,
        request_timeout,
        token,
    })
}

fn build_channel_settings(channel: RawChannelSettings) -> Result<ChannelSettings, LoadError> {
    let raw_url = channel
        .url
        .unwrap_or_else(|| DEFAULT_CHANNEL_URL.to_string());
    let url = Url::parse(raw_url.trim())
        .map_err(|err| LoadError::invalid("channel.url", format!("failed to parse: {err}")))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(LoadError::invalid("channel.url", "scheme must be ws or wss"));
    }

    let connect_timeout = non_zero_secs(
        channel
            .connect_timeout_seconds
            .unwrap_or(DEFAULT_CHANNEL_CONNECT_TIMEOUT_SECS),
        "channel.connect_timeout_seconds",
    )?;

    let base_ms = channel
        .reconnect_base_ms
        .unwrap_or(DEFAULT_RECONNECT_BASE_MS);
    if base_ms == 0 {
        return Err(LoadError::invalid(
            "channel.reconnect_base_ms",
            "must be greater than zero",
        ));
    }
    let cap_ms = channel.reconnect_cap_ms.unwrap_or(DEFAULT_RECONNECT_CAP_MS);
    if cap_ms < base_ms {
        return Err(LoadError::invalid(
            "channel.reconnect_cap_ms",
            "must not be smaller than channel.reconnect_base_ms",
        ));
    }

    Ok(ChannelSettings {
        url,
        connect_timeout,
        reconnect: ReconnectPolicy {
            base: Duration::from_millis(base_ms),
            cap: Duration::from_millis(cap_ms),
            jitter: channel.reconnect_jitter.unwrap_or_default(),
        },
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> CacheSettings {
    let seconds = cache
        .keep_unused_for_seconds
        .unwrap_or(DEFAULT_CACHE_KEEP_UNUSED_SECS);
    CacheSettings {
        keep_unused_for: Duration::from_secs(seconds),
    }
}

fn build_portal_settings(portal: RawPortalSettings) -> Result<PortalSettings, LoadError> {
    let notification_event = portal
        .notification_event
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| DEFAULT_NOTIFICATION_EVENT.to_string());
    if notification_event.is_empty() {
        return Err(LoadError::invalid(
            "portal.notification_event",
            "must not be empty",
        ));
    }

    let notification_tags = portal
        .notification_tags
        .unwrap_or_else(|| vec![DEFAULT_NOTIFICATION_TAG.to_string()]);
    if notification_tags.iter().any(|tag| tag.trim().is_empty()) {
        return Err(LoadError::invalid(
            "portal.notification_tags",
            "tags must not be empty",
        ));
    }

    let notifications_endpoint = portal
        .notifications_endpoint
        .unwrap_or_else(|| DEFAULT_NOTIFICATIONS_ENDPOINT.to_string());
    Endpoint::parse(&notifications_endpoint)
        .map_err(|err| LoadError::invalid("portal.notifications_endpoint", err.to_string()))?;

    Ok(PortalSettings {
        notification_event,
        notification_tags,
        notifications_endpoint,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn non_zero_secs(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_secs(value))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawApiSettings {
    base_url: Option<String>,
    request_timeout_seconds: Option<u64>,
    token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawChannelSettings {
    url: Option<String>,
    connect_timeout_seconds: Option<u64>,
    reconnect_base_ms: Option<u64>,
    reconnect_cap_ms: Option<u64>,
    reconnect_jitter: Option<Jitter>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    keep_unused_for_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPortalSettings {
    notification_event: Option<String>,
    notification_tags: Option<Vec<String>>,
    notifications_endpoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}
