/// Configuration management
use crate::error::{ImError, Result};
use crate::session::SessionSettings;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_API_URL: &str = "http://127.0.0.1:8787/api/v1/im";
const DEFAULT_DEV_PORT: u16 = 8787;

/// Authenticated caller, threaded explicitly into everything that needs it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Backend user id of the caller
    pub user_id: String,

    /// Bearer token sent on every request
    pub token: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: token.into(),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the IM API (no trailing slash)
    pub api_base_url: String,

    /// Who we are
    pub identity: Identity,

    /// Polling fallback interval
    pub poll_interval: Duration,

    /// Messages per history page
    pub page_size: usize,

    /// Stream is considered dead after this long without any frame
    pub stream_idle_timeout: Duration,

    /// Delay before reopening a failed stream (None = stay on polling)
    pub stream_reconnect_delay: Option<Duration>,

    /// Per-request timeout for REST calls
    pub request_timeout: Duration,

    /// Admin used when creating a DM without an explicit admin
    pub default_admin_id: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            identity: Identity::default(),
            poll_interval: Duration::from_secs(2),
            page_size: 30,
            stream_idle_timeout: Duration::from_secs(45),
            stream_reconnect_delay: Some(Duration::from_secs(3)),
            request_timeout: Duration::from_secs(10),
            default_admin_id: None,
        }
    }
}

impl Config {
    /// Create config from command line arguments.
    ///
    /// Flags may appear anywhere; everything that is not a flag is returned
    /// as positional arguments (the command and its operands). Environment
    /// variables provide defaults, flags win over them.
    pub fn from_args(args: &[String]) -> Result<(Self, Vec<String>)> {
        let mut config = Self::default();
        config.apply_env();

        let mut positional = Vec::new();
        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--api-url" => {
                    config.api_base_url = flag_value(args, i, "--api-url")?.to_string();
                    i += 2;
                }
                "--token" => {
                    config.identity.token = flag_value(args, i, "--token")?.to_string();
                    i += 2;
                }
                "--user-id" => {
                    config.identity.user_id = flag_value(args, i, "--user-id")?.to_string();
                    i += 2;
                }
                "--admin-id" => {
                    config.default_admin_id = Some(flag_value(args, i, "--admin-id")?.to_string());
                    i += 2;
                }
                "--poll-ms" => {
                    let ms = flag_value(args, i, "--poll-ms")?
                        .parse::<u64>()
                        .map_err(|_| ImError::Config("--poll-ms must be a number".to_string()))?;
                    config.poll_interval = Duration::from_millis(ms);
                    i += 2;
                }
                "--page-size" => {
                    config.page_size = flag_value(args, i, "--page-size")?
                        .parse::<usize>()
                        .map_err(|_| ImError::Config("--page-size must be a number".to_string()))?;
                    i += 2;
                }
                "--no-reconnect" => {
                    config.stream_reconnect_delay = None;
                    i += 1;
                }
                other => {
                    positional.push(other.to_string());
                    i += 1;
                }
            }
        }

        config.validate()?;
        Ok((config, positional))
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("HOTELCHAT_API_URL") {
            self.api_base_url = url;
        }
        if let Ok(token) = std::env::var("HOTELCHAT_TOKEN") {
            self.identity.token = token;
        }
        if let Ok(user_id) = std::env::var("HOTELCHAT_USER_ID") {
            self.identity.user_id = user_id;
        }
        if let Ok(admin) = std::env::var("HOTELCHAT_ADMIN_ID") {
            self.default_admin_id = Some(admin);
        }
        if let Some(ms) = std::env::var("HOTELCHAT_POLL_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            self.poll_interval = Duration::from_millis(ms);
        }
    }

    /// Check the config is usable and normalise the base URL
    pub fn validate(&mut self) -> Result<()> {
        if !self.api_base_url.starts_with("http://") && !self.api_base_url.starts_with("https://") {
            return Err(ImError::Config(format!(
                "API URL must start with http:// or https://, got {}",
                self.api_base_url
            )));
        }
        while self.api_base_url.ends_with('/') {
            self.api_base_url.pop();
        }
        if self.poll_interval.is_zero() {
            return Err(ImError::Config("Poll interval must be positive".to_string()));
        }
        if self.page_size == 0 {
            return Err(ImError::Config("Page size must be at least 1".to_string()));
        }
        // The token doubles as the user id on the development backend
        if self.identity.user_id.is_empty() {
            self.identity.user_id = self.identity.token.clone();
        }
        Ok(())
    }

    /// Settings for the session controller
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            poll_interval: self.poll_interval,
            page_size: self.page_size,
            stream_reconnect_delay: self.stream_reconnect_delay,
            default_admin_id: self.default_admin_id.clone(),
        }
    }
}

/// Development backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevServerConfig {
    /// Listening address
    pub listen_addr: SocketAddr,

    /// Interval between `ping` frames on every open stream
    pub ping_interval: Duration,
}

impl Default for DevServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_DEV_PORT)),
            ping_interval: Duration::from_secs(15),
        }
    }
}

impl DevServerConfig {
    /// `hotelchat-devserver [port] [--ping-secs <n>]`
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut config = Self::default();

        if let Some(p) = std::env::var("HOTELCHAT_DEV_PORT")
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
        {
            config.listen_addr.set_port(p);
        }

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--ping-secs" => {
                    let secs = flag_value(args, i, "--ping-secs")?
                        .parse::<u64>()
                        .map_err(|_| ImError::Config("--ping-secs must be a number".to_string()))?;
                    config.ping_interval = Duration::from_secs(secs.max(1));
                    i += 2;
                }
                other => {
                    let port = other.parse::<u16>().map_err(|_| {
                        ImError::Config("Port must be a valid number (0-65535)".to_string())
                    })?;
                    config.listen_addr.set_port(port);
                    i += 1;
                }
            }
        }

        Ok(config)
    }
}

fn flag_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| ImError::Config(format!("{} requires an argument", flag)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_flags_and_positionals() {
        let (config, rest) = Config::from_args(&args(&[
            "hotelchat",
            "--api-url",
            "http://localhost:9000/im/",
            "tail",
            "--token",
            "owner-1",
            "conv-42",
            "--poll-ms",
            "500",
        ]))
        .unwrap();

        assert_eq!(config.api_base_url, "http://localhost:9000/im");
        assert_eq!(config.identity.token, "owner-1");
        assert_eq!(config.identity.user_id, "owner-1");
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(rest, vec!["tail".to_string(), "conv-42".to_string()]);
    }

    #[test]
    fn test_missing_flag_value() {
        let err = Config::from_args(&args(&["hotelchat", "--token"])).unwrap_err();
        assert!(matches!(err, ImError::Config(_)));
    }

    #[test]
    fn test_rejects_bad_url() {
        let err = Config::from_args(&args(&["hotelchat", "--api-url", "ftp://x"])).unwrap_err();
        assert!(matches!(err, ImError::Config(_)));
    }

    #[test]
    fn test_default_poll_interval_is_two_seconds() {
        let config = Config::default();
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.session_settings().page_size, 30);
    }

    #[test]
    fn test_dev_server_args() {
        let config = DevServerConfig::from_args(&args(&["devserver", "9191", "--ping-secs", "3"])).unwrap();
        assert_eq!(config.listen_addr.port(), 9191);
        assert_eq!(config.ping_interval, Duration::from_secs(3));
        assert!(DevServerConfig::from_args(&args(&["devserver", "nope"])).is_err());
    }
}
