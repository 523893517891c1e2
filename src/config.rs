use dotenvy::dotenv;
use std::env;
use std::time::Duration;

pub const DEFAULT_SEARCH_API_URL: &str = "https://api.tavily.com/search";
pub const DEFAULT_MODEL_API_URL: &str = "http://localhost:11434/api/chat";
pub const DEFAULT_MODEL_NAME: &str = "deepseek-r1:1.5b";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(String),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

/// Process-wide settings, validated once before the server accepts connections.
#[derive(Debug, Clone)]
pub struct Config {
    pub search_api_key: String,
    pub search_api_url: String,
    pub model_api_url: String,
    pub model_name: String,
    pub bind_addr: String,
    pub stage_timeout: Duration,
    pub request_timeout: Duration,
    /// Retries per stage, at most one.
    pub upstream_retries: u32,
    /// Stop emitting answer snapshots once one has been shown after a thinking segment.
    pub freeze_answer: bool,
}

impl Config {
    pub fn from_env() -> Result<Config, ConfigError> {
        dotenv().ok(); // Load .env file if present
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup. Blank values count as absent.
    pub fn from_lookup<F>(lookup: F) -> Result<Config, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Config {
            search_api_key: get_env(&get, "TAVILY_API_KEY")?,
            search_api_url: get_env_or_default(&get, "SEARCH_API_URL", DEFAULT_SEARCH_API_URL),
            model_api_url: get_env_or_default(&get, "MODEL_API_URL", DEFAULT_MODEL_API_URL),
            model_name: get_env_or_default(&get, "MODEL_NAME", DEFAULT_MODEL_NAME),
            bind_addr: get_env_or_default(&get, "BIND_ADDR", DEFAULT_BIND_ADDR),
            stage_timeout: Duration::from_secs(parse_or(&get, "UPSTREAM_TIMEOUT_SECS", 60)?),
            request_timeout: Duration::from_secs(parse_or(&get, "REQUEST_TIMEOUT_SECS", 300)?),
            upstream_retries: parse_or(&get, "UPSTREAM_RETRIES", 1u32)?.min(1),
            freeze_answer: parse_or(&get, "REPORT_FREEZE_ANSWER", false)?,
        })
    }
}

fn get_env<G>(get: &G, key: &str) -> Result<String, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    get(key).ok_or_else(|| ConfigError::Missing(key.to_string()))
}

fn get_env_or_default<G>(get: &G, key: &str, default: &str) -> String
where
    G: Fn(&str) -> Option<String>,
{
    get(key).unwrap_or_else(|| default.to_string())
}

fn parse_or<G, T>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value: raw,
        }),
    }
}
