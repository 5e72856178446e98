//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, `__` between sections)
//! - Deployment-style variables (HOST, PORT, OPENAI_API_KEY, OPENAI_REALTIME_*)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment-style environment variables (PORT, OPENAI_API_KEY, ...)
//! 2. Environment variables (APP_SERVER__PORT, APP_REALTIME__MODEL, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
///
/// ## Sections:
/// - `server`: where the HTTP/WebSocket listener binds
/// - `realtime`: how to reach the upstream realtime voice provider
/// - `prompt`: the system prompt every conversation starts from
/// - `performance`: session limits and connection keep-alive tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub realtime: RealtimeConfig,
    pub prompt: PromptConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Upstream realtime provider settings.
///
/// ## Fields:
/// - `api_key`: bearer token sent on the upgrade request (never echoed back over HTTP)
/// - `endpoint`: base WebSocket URL, the model is appended as `?model=`
/// - `voice`: provider voice used for assistant audio
/// - `transcription_model` / `transcription_language`: input transcription settings
/// - `voice_style`: optional free-form style hint appended to the instructions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    pub api_key: String,
    pub endpoint: String,
    pub model: String,
    pub voice: String,
    pub transcription_model: String,
    pub transcription_language: String,
    pub voice_style: String,
}

/// System prompt sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    /// Used when `system_prompt_path` is missing or blank
    pub system_prompt: String,
    pub system_prompt_path: String,
}

/// Performance tuning configuration.
///
/// ## Tuning guidelines:
/// - Every browser connection holds one upstream socket while voice is active,
///   so `max_concurrent_sessions` bounds upstream usage as well
/// - `client_timeout_secs` must be larger than `heartbeat_interval_secs`
/// - `max_frame_bytes` caps a single client WebSocket frame (base64 audio chunks)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    pub max_frame_bytes: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
            },
            realtime: RealtimeConfig {
                api_key: String::new(),
                endpoint: "wss://api.openai.com/v1/realtime".to_string(),
                model: "gpt-realtime".to_string(),
                voice: "alloy".to_string(),
                transcription_model: "gpt-4o-mini-transcribe".to_string(),
                transcription_language: "en".to_string(),
                voice_style: String::new(),
            },
            prompt: PromptConfig {
                system_prompt: "You are a concise, friendly assistant. Keep answers helpful and brief."
                    .to_string(),
                system_prompt_path: "system-prompt.txt".to_string(),
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
                max_frame_bytes: 1024 * 1024,
            },
        }
    }
}

/// Deployment-style variables and the config key each one overrides.
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("OPENAI_API_KEY", "realtime.api_key"),
    ("OPENAI_REALTIME_MODEL", "realtime.model"),
    ("OPENAI_REALTIME_VOICE", "realtime.voice"),
    ("OPENAI_REALTIME_TRANSCRIPTION_LANGUAGE", "realtime.transcription_language"),
    ("OPENAI_REALTIME_VOICE_STYLE", "realtime.voice_style"),
];

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_REALTIME__VOICE=verse`: Override the assistant voice
    /// - `OPENAI_API_KEY=sk-...`: Upstream credentials
    /// - `PORT=3000`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        for (var, key) in ENV_OVERRIDES {
            if let Ok(value) = env::var(var) {
                settings = settings.set_override(*key, value)?;
            }
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Credentials are checked separately by [`AppConfig::require_credentials`]
    /// so that a default configuration is still structurally valid.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.performance.heartbeat_interval_secs >= self.performance.client_timeout_secs {
            return Err(anyhow::anyhow!(
                "Heartbeat interval must be shorter than the client timeout"
            ));
        }

        if self.realtime.model.trim().is_empty() {
            return Err(anyhow::anyhow!("Realtime model cannot be empty"));
        }

        if self.realtime.voice.trim().is_empty() {
            return Err(anyhow::anyhow!("Realtime voice cannot be empty"));
        }

        if !(self.realtime.endpoint.starts_with("wss://") || self.realtime.endpoint.starts_with("ws://")) {
            return Err(anyhow::anyhow!(
                "Realtime endpoint must be a ws:// or wss:// URL, got '{}'",
                self.realtime.endpoint
            ));
        }

        Ok(())
    }

    /// Fail fast when no upstream API key is available.
    pub fn require_credentials(&self) -> Result<()> {
        if self.realtime.api_key.trim().is_empty() {
            return Err(anyhow::anyhow!("Missing OPENAI_API_KEY in environment."));
        }
        Ok(())
    }

    /// Full upstream URL for a new realtime connection.
    pub fn connect_url(&self) -> String {
        format!("{}?model={}", self.realtime.endpoint, self.realtime.model)
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the fields present in the JSON are changed, for example
    /// `{"realtime": {"voice": "verse"}}` changes only the voice.
    /// The API key cannot be changed this way.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = u16::try_from(port)
                    .map_err(|_| anyhow::anyhow!("Server port {} is out of range", port))?;
            }
        }

        if let Some(realtime) = partial_config.get("realtime") {
            let text = |key: &str| realtime.get(key).and_then(|v| v.as_str()).map(str::to_string);
            if let Some(endpoint) = text("endpoint") {
                self.realtime.endpoint = endpoint;
            }
            if let Some(model) = text("model") {
                self.realtime.model = model;
            }
            if let Some(voice) = text("voice") {
                self.realtime.voice = voice;
            }
            if let Some(model) = text("transcription_model") {
                self.realtime.transcription_model = model;
            }
            if let Some(language) = text("transcription_language") {
                self.realtime.transcription_language = language;
            }
            if let Some(style) = text("voice_style") {
                self.realtime.voice_style = style;
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(sessions) = performance.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                self.performance.max_concurrent_sessions = sessions as usize;
            }
            if let Some(secs) = performance.get("heartbeat_interval_secs").and_then(|v| v.as_u64()) {
                self.performance.heartbeat_interval_secs = secs;
            }
            if let Some(secs) = performance.get("client_timeout_secs").and_then(|v| v.as_u64()) {
                self.performance.client_timeout_secs = secs;
            }
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.realtime.model, "gpt-realtime");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_has_no_credentials() {
        let mut config = AppConfig::default();
        assert!(config.require_credentials().is_err());

        config.realtime.api_key = "sk-test".to_string();
        assert!(config.require_credentials().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.realtime.endpoint = "https://api.openai.com/v1/realtime".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.performance.heartbeat_interval_secs = 90;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_connect_url_appends_model() {
        let config = AppConfig::default();
        assert_eq!(
            config.connect_url(),
            "wss://api.openai.com/v1/realtime?model=gpt-realtime"
        );
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"server": {"port": 9090}, "realtime": {"voice": "verse", "api_key": "ignored"}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.realtime.voice, "verse");
        assert_eq!(config.realtime.api_key, "");
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn test_config_update_rejects_invalid_result() {
        let mut config = AppConfig::default();
        assert!(config.update_from_json(r#"{"server": {"port": 70000}}"#).is_err());
        assert!(config.update_from_json(r#"{"realtime": {"model": " "}}"#).is_err());
    }
}
