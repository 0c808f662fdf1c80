use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::config_env::{
    EnvLookup, optional_trimmed_env, parse_bool_env, parse_u32_env, parse_usize_env,
    process_env, require_env,
};

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_HISTORY_WINDOW: usize = 10;
const MAX_HISTORY_WINDOW: usize = 100;

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,
    pub database_url: String,
    pub database_max_connections: u32,
    pub migrations_dir: PathBuf,
    pub history_window: usize,
    pub serialize_session_turns: bool,
    pub personalities_path: Option<PathBuf>,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required env var {0}")]
    MissingVar(String),
    #[error("invalid integer in env var {0}")]
    ParseInt(String),
    #[error("invalid boolean in env var {0}")]
    ParseBool(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&process_env)
    }

    pub fn from_lookup(lookup: EnvLookup<'_>) -> Result<Self, ConfigError> {
        let history_window = parse_usize_env(lookup, "HISTORY_WINDOW", DEFAULT_HISTORY_WINDOW)?;
        if history_window == 0 || history_window > MAX_HISTORY_WINDOW {
            return Err(ConfigError::InvalidConfiguration(format!(
                "HISTORY_WINDOW must be between 1 and {MAX_HISTORY_WINDOW}"
            )));
        }

        let log_format = match optional_trimmed_env(lookup, "LOG_FORMAT")
            .map(|value| value.to_ascii_lowercase())
            .as_deref()
        {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "LOG_FORMAT must be text or json, got {other}"
                )));
            }
        };

        let raw_bind_addr = optional_trimmed_env(lookup, "API_BIND_ADDR")
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = raw_bind_addr.parse::<SocketAddr>().map_err(|_| {
            ConfigError::InvalidConfiguration(format!(
                "API_BIND_ADDR must be a socket address such as {DEFAULT_BIND_ADDR}, got {raw_bind_addr}"
            ))
        })?;

        Ok(Self {
            bind_addr,
            database_url: require_env(lookup, "DATABASE_URL")?,
            database_max_connections: parse_u32_env(
                lookup,
                "DATABASE_MAX_CONNECTIONS",
                DEFAULT_DATABASE_MAX_CONNECTIONS,
            )?,
            migrations_dir: optional_trimmed_env(lookup, "MIGRATIONS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| {
                    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../db/migrations")
                }),
            history_window,
            serialize_session_turns: parse_bool_env(lookup, "SERIALIZE_SESSION_TURNS", true)?,
            personalities_path: optional_trimmed_env(lookup, "PERSONALITIES_PATH")
                .map(PathBuf::from),
            log_format,
        })
    }
}
