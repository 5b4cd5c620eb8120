//! Configuration and identity storage

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::messaging::connector::DEFAULT_WS_URL;
use crate::messaging::{MessagingError, TransportSettings};
use crate::models::{Identity, UserId};
use crate::stomp::HeartBeat;

pub const DEFAULT_API_BASE: &str = "http://localhost:8080/api";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// REST base URL, e.g. `http://localhost:8080/api`
    pub api_base: String,
    /// Broker WebSocket endpoint (without `?user=`)
    pub ws_url: String,
    /// Logged-in user's email (sent in the WebSocket handshake)
    pub user_email: Option<String>,
    /// Logged-in user's numeric id (used in every message)
    pub user_id: Option<UserId>,
    /// Optional bearer token for REST calls
    pub auth_token: Option<String>,
    pub reconnect_delay_ms: u64,
    pub heartbeat_outgoing_ms: u64,
    pub heartbeat_incoming_ms: u64,
    pub heartbeat_tolerance: u32,
    pub connect_timeout_ms: u64,
    /// Log every STOMP frame at debug level
    pub trace_frames: bool,
    pub echo_window_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            user_email: None,
            user_id: None,
            auth_token: None,
            reconnect_delay_ms: 5000,
            heartbeat_outgoing_ms: 4000,
            heartbeat_incoming_ms: 4000,
            heartbeat_tolerance: 2,
            connect_timeout_ms: 10_000,
            trace_frames: false,
            echo_window_secs: 30,
        }
    }
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "social-chat", "social-chat")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from disk
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        Self::parse(&content)
    }

    fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir).context("Failed to create config directory")?;

        let path = Self::config_path()?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, content).context("Failed to write config file")?;

        // Set restrictive permissions on config file (may contain a token)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    /// The logged-in identity. Both email and id must be present.
    pub fn identity(&self) -> std::result::Result<Identity, MessagingError> {
        match (&self.user_email, self.user_id) {
            (Some(email), Some(id)) => Ok(Identity {
                id,
                email: email.clone(),
            }),
            _ => Err(MessagingError::NotLoggedIn),
        }
    }

    pub fn set_identity(&mut self, identity: &Identity) {
        self.user_email = Some(identity.email.clone());
        self.user_id = Some(identity.id);
    }

    pub fn clear_identity(&mut self) {
        self.user_email = None;
        self.user_id = None;
        self.auth_token = None;
    }

    pub fn transport_settings(&self) -> Result<TransportSettings> {
        let url = url::Url::parse(&self.ws_url)
            .with_context(|| format!("Invalid ws_url in config: {}", self.ws_url))?;
        Ok(TransportSettings {
            url,
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            heartbeat: HeartBeat::new(self.heartbeat_outgoing_ms, self.heartbeat_incoming_ms),
            heartbeat_tolerance: self.heartbeat_tolerance,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            trace_frames: self.trace_frames,
        })
    }

    pub fn echo_window(&self) -> Duration {
        Duration::from_secs(self.echo_window_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_take_defaults() {
        let config = Config::parse("user_email = \"a@b.c\"\nuser_id = 4\n").unwrap();
        assert_eq!(config.api_base, DEFAULT_API_BASE);
        assert_eq!(config.reconnect_delay_ms, 5000);
        assert_eq!(config.heartbeat_tolerance, 2);
        assert_eq!(
            config.identity().unwrap(),
            Identity {
                id: 4,
                email: "a@b.c".to_string()
            }
        );
    }

    #[test]
    fn test_identity_requires_email_and_id() {
        let mut config = Config::default();
        assert!(matches!(config.identity(), Err(MessagingError::NotLoggedIn)));
        config.user_email = Some("a@b.c".to_string());
        tokio_test::assert_err!(config.identity());
    }

    #[test]
    fn test_transport_settings_from_config() {
        let config = Config {
            heartbeat_outgoing_ms: 0,
            reconnect_delay_ms: 250,
            ..Default::default()
        };
        let settings = tokio_test::assert_ok!(config.transport_settings());
        assert_eq!(settings.url.as_str(), DEFAULT_WS_URL);
        assert_eq!(settings.heartbeat, HeartBeat::new(0, 4000));
        assert_eq!(settings.reconnect_delay, Duration::from_millis(250));

        let bad = Config {
            ws_url: "not a url".to_string(),
            ..Default::default()
        };
        tokio_test::assert_err!(bad.transport_settings());
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let mut config = Config::default();
        config.set_identity(&Identity {
            id: 9,
            email: "z@x.y".to_string(),
        });
        let text = toml::to_string_pretty(&config).unwrap();
        let back = Config::parse(&text).unwrap();
        assert_eq!(back.user_id, Some(9));
        back.identity().unwrap();
    }
}
