use openai_realtime::types::AudioFormat;
use secrecy::SecretString;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    /// Externally reachable base URL, without a trailing slash.
    pub public_base_url: String,
    pub openai_api_key: SecretString,
    pub realtime_model: String,
    pub realtime_voice: String,
    pub model_audio_format: AudioFormat,
    pub twilio_account_sid: String,
    pub twilio_auth_token: SecretString,
    pub allowed_origins: Vec<String>,
    pub allowed_origin_patterns: Vec<String>,
    pub pending_config_ttl: Duration,
    pub session_setup_timeout: Duration,
    pub tool_timeout: Duration,
    pub log_level: Level,
}

fn required(name: &str) -> Result<String, ConfigError> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingVar(name.to_string()))
}

fn list(name: &str) -> Vec<String> {
    std::env::var(name)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn seconds(name: &str, default: u64) -> Result<Duration, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .ok_or_else(|| {
                ConfigError::InvalidValue(name.to_string(), format!("'{raw}' is not a positive integer"))
            }),
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let mut bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;
        if let Ok(port) = std::env::var("PORT") {
            let port = port
                .parse::<u16>()
                .map_err(|e| ConfigError::InvalidValue("PORT".to_string(), e.to_string()))?;
            bind_address.set_port(port);
        }

        let public_base_url = required("PUBLIC_BASE_URL")?
            .trim_end_matches('/')
            .to_string();
        if !(public_base_url.starts_with("https://") || public_base_url.starts_with("http://")) {
            return Err(ConfigError::InvalidValue(
                "PUBLIC_BASE_URL".to_string(),
                format!("'{public_base_url}' must start with http:// or https://"),
            ));
        }

        let openai_api_key = SecretString::from(required("OPENAI_API_KEY")?);
        let realtime_model = std::env::var("REALTIME_MODEL")
            .unwrap_or_else(|_| openai_realtime::DEFAULT_MODEL.to_string());
        let realtime_voice = std::env::var("REALTIME_VOICE").unwrap_or_else(|_| "alloy".to_string());

        let format_str = std::env::var("MODEL_AUDIO_FORMAT").unwrap_or_else(|_| "pcm16".to_string());
        let model_audio_format = match format_str.to_lowercase().as_str() {
            "pcm16" => AudioFormat::PCM16,
            "g711_ulaw" => AudioFormat::G711ULAW,
            other => {
                return Err(ConfigError::InvalidValue(
                    "MODEL_AUDIO_FORMAT".to_string(),
                    format!("'{other}' is not one of pcm16, g711_ulaw"),
                ));
            }
        };

        let twilio_account_sid = required("TWILIO_ACCOUNT_SID")?;
        let twilio_auth_token = SecretString::from(required("TWILIO_AUTH_TOKEN")?);

        let allowed_origins = list("ALLOWED_ORIGINS");
        let allowed_origin_patterns = list("ALLOWED_ORIGIN_PATTERNS");
        for pattern in &allowed_origin_patterns {
            regex::Regex::new(pattern).map_err(|e| {
                ConfigError::InvalidValue("ALLOWED_ORIGIN_PATTERNS".to_string(), e.to_string())
            })?;
        }

        let pending_config_ttl = seconds("PENDING_CONFIG_TTL_SECS", 300)?;
        let session_setup_timeout = seconds("SESSION_SETUP_TIMEOUT_SECS", 10)?;
        let tool_timeout = seconds("TOOL_TIMEOUT_SECS", 15)?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            public_base_url,
            openai_api_key,
            realtime_model,
            realtime_voice,
            model_audio_format,
            twilio_account_sid,
            twilio_auth_token,
            allowed_origins,
            allowed_origin_patterns,
            pending_config_ttl,
            session_setup_timeout,
            tool_timeout,
            log_level,
        })
    }

    /// The `wss://` (or `ws://`) form of the public base URL.
    pub fn public_ws_base(&self) -> String {
        if let Some(rest) = self.public_base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.public_base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.public_base_url.clone()
        }
    }
}
