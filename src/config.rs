use std::env;
use std::time::Duration;

/// Broker configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    /// Key for deriving session secrets. Generated at start when unset.
    pub session_secret: Option<String>,
    pub session_expiry_seconds: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Ok(Config {
            server_host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            server_port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidPort)?,
            session_secret: env::var("SESSION_SECRET").ok().filter(|s| !s.is_empty()),
            session_expiry_seconds: env::var("SESSION_EXPIRY_SECONDS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()
                .unwrap_or(300),
        })
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    pub fn session_expiry(&self) -> Duration {
        Duration::from_secs(self.session_expiry_seconds)
    }
}

/// Call participant configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub broker_url: String,
    pub room_id: Option<String>,
    pub stun_server: String,
    pub reconnect_delay_ms: u64,
    pub release_delay_ms: u64,
    pub error_peer_grace_ms: u64,
    /// Join voice with a silent microphone instead of listening only.
    pub send_silence: bool,
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let broker_url =
            env::var("BROKER_URL").unwrap_or_else(|_| "ws://127.0.0.1:8080/ws".to_string());
        if !broker_url.starts_with("ws://") && !broker_url.starts_with("wss://") {
            return Err(ConfigError::InvalidBrokerUrl(broker_url));
        }

        Ok(ClientConfig {
            broker_url,
            room_id: env::var("ROOM_ID").ok().filter(|s| !s.is_empty()),
            stun_server: env::var("STUN_SERVER")
                .unwrap_or_else(|_| "stun:stun.l.google.com:19302".to_string()),
            reconnect_delay_ms: env::var("RECONNECT_DELAY_MS")
                .unwrap_or_else(|_| "2000".to_string())
                .parse()
                .unwrap_or(2000),
            release_delay_ms: env::var("RELEASE_DELAY_MS")
                .unwrap_or_else(|_| "200".to_string())
                .parse()
                .unwrap_or(200),
            error_peer_grace_ms: env::var("ERROR_PEER_GRACE_MS")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .unwrap_or(3000),
            send_silence: env::var("SEND_SILENCE")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
        })
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn release_delay(&self) -> Duration {
        Duration::from_millis(self.release_delay_ms)
    }

    pub fn error_peer_grace(&self) -> Duration {
        Duration::from_millis(self.error_peer_grace_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            broker_url: "ws://127.0.0.1:8080/ws".to_string(),
            room_id: None,
            stun_server: "stun:stun.l.google.com:19302".to_string(),
            reconnect_delay_ms: 2000,
            release_delay_ms: 200,
            error_peer_grace_ms: 3000,
            send_silence: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid server port")]
    InvalidPort,
    #[error("BROKER_URL must be a ws:// or wss:// URL, got {0}")]
    InvalidBrokerUrl(String),
}
