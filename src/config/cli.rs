use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use serde_json::Value;

/// Command-line arguments for the portal-sync binary.
#[derive(Debug, Parser)]
#[command(
    name = "portal-sync",
    version,
    about = "Portal notification channel and query cache client"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "PORTAL_SYNC_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Open the push channel for a user and follow their notifications.
    Watch(WatchArgs),
    /// Fetch one read through the query cache and print it.
    Get(GetArgs),
    /// Run one mutation, invalidate its tags and print the backend response.
    Mutate(MutateArgs),
}

impl Command {
    pub fn overrides(&self) -> &CommonOverrides {
        match self {
            Self::Watch(args) => &args.overrides,
            Self::Get(args) => &args.overrides,
            Self::Mutate(args) => &args.overrides,
        }
    }
}

#[derive(Debug, Args, Clone)]
pub struct WatchArgs {
    #[command(flatten)]
    pub overrides: CommonOverrides,

    /// User whose channel session is opened.
    #[arg(long, value_name = "ID")]
    pub user: String,
}

#[derive(Debug, Args, Clone)]
pub struct GetArgs {
    #[command(flatten)]
    pub overrides: CommonOverrides,

    /// Read to perform, e.g. "GET /leaves".
    #[arg(value_name = "ENDPOINT")]
    pub endpoint: String,

    /// Request parameter as NAME=VALUE; VALUE is parsed as JSON when possible.
    #[arg(long = "param", value_name = "NAME=VALUE", value_parser = parse_param)]
    pub params: Vec<(String, Value)>,
}

#[derive(Debug, Args, Clone)]
pub struct MutateArgs {
    #[command(flatten)]
    pub overrides: CommonOverrides,

    /// Write to perform, e.g. "PATCH /leaves/5".
    #[arg(value_name = "ENDPOINT")]
    pub endpoint: String,

    /// Signed-in user performing the mutation.
    #[arg(long, value_name = "ID")]
    pub user: String,

    /// JSON request body.
    #[arg(long, value_name = "JSON")]
    pub body: Option<String>,

    /// Request parameter as NAME=VALUE; VALUE is parsed as JSON when possible.
    #[arg(long = "param", value_name = "NAME=VALUE", value_parser = parse_param)]
    pub params: Vec<(String, Value)>,

    /// Tag invalidated when the mutation succeeds. Repeatable.
    #[arg(long = "invalidates", value_name = "TAG")]
    pub invalidates: Vec<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CommonOverrides {
    /// Override the REST API base URL.
    #[arg(long = "api-base-url", value_name = "URL")]
    pub api_base_url: Option<String>,

    /// Override the bearer token sent to the REST API.
    #[arg(long = "api-token", value_name = "TOKEN")]
    pub api_token: Option<String>,

    /// Override the REST request timeout.
    #[arg(long = "api-request-timeout-seconds", value_name = "SECONDS")]
    pub api_request_timeout_seconds: Option<u64>,

    /// Override the push channel URL.
    #[arg(long = "channel-url", value_name = "URL")]
    pub channel_url: Option<String>,

    /// Override how long unused cache entries are kept.
    #[arg(long = "cache-keep-unused-seconds", value_name = "SECONDS")]
    pub cache_keep_unused_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got `{raw}`"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("parameter name is empty in `{raw}`"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

/// Collects `--param` pairs into a JSON object.
pub fn params_object(params: &[(String, Value)]) -> Value {
    Value::Object(params.iter().cloned().collect())
}
