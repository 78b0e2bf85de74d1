use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";
const DEFAULT_LOG_FILTER: &str = "info";
const DEFAULT_CONFIRM_TTL_SECONDS: u64 = 172_800;
const DEFAULT_RESUBMIT_COOLDOWN_SECONDS: u64 = 60;
const DEFAULT_CONFIRM_BASE_URL: &str = "https://silksong-release.tracker";
const DEFAULT_EMAIL_PROVIDER_MODE: &str = "mock";
const DEFAULT_RESEND_API_BASE_URL: &str = "https://api.resend.com";
const DEFAULT_EMAIL_FROM: &str = "Silksong Release Tracker <updates@silksong-release.tracker>";
const DEFAULT_THROTTLE_SUBSCRIBE_LIMIT: usize = 10;
const DEFAULT_THROTTLE_SUBSCRIBE_WINDOW_SECONDS: i64 = 60;
const DEFAULT_THROTTLE_CONFIRM_LIMIT: usize = 30;
const DEFAULT_THROTTLE_CONFIRM_WINDOW_SECONDS: i64 = 60;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub log_filter: String,
    pub subscribe_store_path: Option<PathBuf>,
    pub token_secret: Option<String>,
    pub confirm_ttl_seconds: u64,
    pub resubmit_cooldown_seconds: u64,
    pub confirm_base_url: String,
    pub email_provider_mode: String,
    pub resend_api_key: Option<String>,
    pub resend_api_base_url: String,
    pub email_from: String,
    pub throttle_subscribe_limit: usize,
    pub throttle_subscribe_window_seconds: i64,
    pub throttle_confirm_limit: usize,
    pub throttle_confirm_window_seconds: i64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid TRACKER_BIND_ADDR value '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr_raw = env::var("TRACKER_BIND_ADDR")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());

        let bind_addr = bind_addr_raw
            .parse()
            .map_err(|source| ConfigError::InvalidBindAddr {
                value: bind_addr_raw,
                source,
            })?;

        let log_filter = env::var("TRACKER_LOG_FILTER")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        let subscribe_store_path = env::var("TRACKER_SUBSCRIBE_STORE_PATH")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);

        let token_secret = env::var("TRACKER_TOKEN_SECRET")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let confirm_ttl_seconds = env::var("TRACKER_CONFIRM_TTL_SECONDS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_CONFIRM_TTL_SECONDS)
            .max(1);

        let resubmit_cooldown_seconds = env::var("TRACKER_RESUBMIT_COOLDOWN_SECONDS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_RESUBMIT_COOLDOWN_SECONDS);

        let confirm_base_url = env::var("TRACKER_CONFIRM_BASE_URL")
            .ok()
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_CONFIRM_BASE_URL.to_string());

        let email_provider_mode = env::var("TRACKER_EMAIL_PROVIDER_MODE")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_EMAIL_PROVIDER_MODE.to_string())
            .trim()
            .to_lowercase();

        let resend_api_key = env::var("RESEND_API_KEY")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let resend_api_base_url = env::var("TRACKER_RESEND_API_BASE_URL")
            .ok()
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_RESEND_API_BASE_URL.to_string());

        let email_from = env::var("TRACKER_EMAIL_FROM")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_EMAIL_FROM.to_string());

        let throttle_subscribe_limit = env::var("TRACKER_THROTTLE_SUBSCRIBE_LIMIT")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(DEFAULT_THROTTLE_SUBSCRIBE_LIMIT)
            .max(1);

        let throttle_subscribe_window_seconds =
            env::var("TRACKER_THROTTLE_SUBSCRIBE_WINDOW_SECONDS")
                .ok()
                .and_then(|value| value.parse::<i64>().ok())
                .unwrap_or(DEFAULT_THROTTLE_SUBSCRIBE_WINDOW_SECONDS)
                .max(1);

        let throttle_confirm_limit = env::var("TRACKER_THROTTLE_CONFIRM_LIMIT")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(DEFAULT_THROTTLE_CONFIRM_LIMIT)
            .max(1);

        let throttle_confirm_window_seconds = env::var("TRACKER_THROTTLE_CONFIRM_WINDOW_SECONDS")
            .ok()
            .and_then(|value| value.parse::<i64>().ok())
            .unwrap_or(DEFAULT_THROTTLE_CONFIRM_WINDOW_SECONDS)
            .max(1);

        Ok(Self {
            bind_addr,
            log_filter,
            subscribe_store_path,
            token_secret,
            confirm_ttl_seconds,
            resubmit_cooldown_seconds,
            confirm_base_url,
            email_provider_mode,
            resend_api_key,
            resend_api_base_url,
            email_from,
            throttle_subscribe_limit,
            throttle_subscribe_window_seconds,
            throttle_confirm_limit,
            throttle_confirm_window_seconds,
        })
    }
}

#[cfg(test)]
impl Config {
    #[must_use]
    pub fn for_tests() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            log_filter: "debug".to_string(),
            subscribe_store_path: None,
            token_secret: Some("tracker-test-token-secret".to_string()),
            confirm_ttl_seconds: DEFAULT_CONFIRM_TTL_SECONDS,
            resubmit_cooldown_seconds: DEFAULT_RESUBMIT_COOLDOWN_SECONDS,
            confirm_base_url: "https://tracker.test".to_string(),
            email_provider_mode: "mock".to_string(),
            resend_api_key: None,
            resend_api_base_url: DEFAULT_RESEND_API_BASE_URL.to_string(),
            email_from: DEFAULT_EMAIL_FROM.to_string(),
            throttle_subscribe_limit: DEFAULT_THROTTLE_SUBSCRIBE_LIMIT,
            throttle_subscribe_window_seconds: DEFAULT_THROTTLE_SUBSCRIBE_WINDOW_SECONDS,
            throttle_confirm_limit: DEFAULT_THROTTLE_CONFIRM_LIMIT,
            throttle_confirm_window_seconds: DEFAULT_THROTTLE_CONFIRM_WINDOW_SECONDS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn test_fixture_uses_mock_transport_and_ephemeral_port() {
        let config = Config::for_tests();
        assert_eq!(config.bind_addr.port(), 0);
        assert_eq!(config.email_provider_mode, "mock");
        assert!(config.token_secret.is_some());
    }
}
