//! # Configuration Management
//!
//! Loads application configuration from multiple sources, in priority order:
//! 1. Environment variables (APP_SERVER_HOST, APP_LIVE_MODEL, ...)
//! 2. Configuration file (config.toml, optional)
//! 3. Built-in defaults
//!
//! HOST and PORT are also honored without the APP_ prefix since deployment
//! platforms commonly inject them that way.
//!
//! The upstream API key is deliberately NOT part of this structure: it is
//! read straight from the environment at connect time and never serialized
//! into config responses.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub live: LiveConfig,
    pub audio: AudioConfig,
    pub performance: PerformanceConfig,
}

/// HTTP/WebSocket server bind settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Upstream live-model session settings.
///
/// ## Fields:
/// - `endpoint`: WebSocket URL of the bidirectional generation service
/// - `model`: model identifier sent in the setup frame
/// - `voice`: prebuilt voice name for synthesized speech
/// - `system_instruction`: persona text the assistant speaks as
/// - `api_key_env`: name of the environment variable holding the API key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    pub endpoint: String,
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    pub api_key_env: String,
}

/// Audio format settings for both directions of the session.
///
/// Capture (microphone to model) and playback (model to speakers) run at
/// different sample rates; both are fixed by the upstream protocol, so these
/// mostly exist to be visible in one place rather than to be tuned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub capture_rate: u32,
    pub playback_rate: u32,
    pub channels: usize,
    /// Samples per capture frame taken from the widget before encoding.
    pub frame_samples: usize,
}

/// Performance tuning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            live: LiveConfig {
                endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
                model: "gemini-2.5-flash-native-audio-preview-12-2025".to_string(),
                voice: "Zephyr".to_string(),
                system_instruction: "You are a knowledgeable, friendly voice guide for this \
                    portfolio. Answer questions about the projects and experience on display, \
                    keep responses short and conversational, and stay in a warm, professional \
                    register."
                    .to_string(),
                api_key_env: "GEMINI_API_KEY".to_string(),
            },
            audio: AudioConfig {
                capture_rate: 16_000,
                playback_rate: 24_000,
                channels: 1,
                frame_samples: 4096,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration: defaults, then config.toml, then environment.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Deployment platforms set these without the APP_ prefix.
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Resolve the upstream API key from the configured environment variable.
    pub fn api_key(&self) -> Result<String> {
        env::var(&self.live.api_key_env).map_err(|_| {
            anyhow::anyhow!(
                "upstream API key not found: set the {} environment variable",
                self.live.api_key_env
            )
        })
    }

    /// Sanity-check the loaded configuration before the server starts.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.live.endpoint.is_empty() || self.live.model.is_empty() {
            return Err(anyhow::anyhow!("Live endpoint and model must be set"));
        }

        if self.audio.capture_rate == 0 || self.audio.playback_rate == 0 {
            return Err(anyhow::anyhow!("Audio sample rates must be greater than 0"));
        }

        if self.audio.channels == 0 {
            return Err(anyhow::anyhow!("Audio channel count must be greater than 0"));
        }

        if self.audio.frame_samples == 0 {
            return Err(anyhow::anyhow!("Capture frame size must be greater than 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        Ok(())
    }

    /// Apply a partial update from a JSON body (runtime config endpoint).
    ///
    /// Only the fields present in the JSON change; the result is validated
    /// before it is accepted.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16;
            }
        }

        if let Some(live) = partial_config.get("live") {
            if let Some(model) = live.get("model").and_then(|v| v.as_str()) {
                self.live.model = model.to_string();
            }
            if let Some(voice) = live.get("voice").and_then(|v| v.as_str()) {
                self.live.voice = voice.to_string();
            }
            if let Some(instruction) = live.get("system_instruction").and_then(|v| v.as_str()) {
                self.live.system_instruction = instruction.to_string();
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(sessions) = performance
                .get("max_concurrent_sessions")
                .and_then(|v| v.as_u64())
            {
                self.performance.max_concurrent_sessions = sessions as usize;
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
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.audio.capture_rate, 16_000);
        assert_eq!(config.audio.playback_rate, 24_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.channels = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"live": {"voice": "Aoede"}, "server": {"port": 9090}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.live.voice, "Aoede");
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn test_config_update_rejects_invalid_result() {
        let mut config = AppConfig::default();
        let json = r#"{"performance": {"max_concurrent_sessions": 0}}"#;
        assert!(config.update_from_json(json).is_err());
    }
}
