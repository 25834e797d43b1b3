//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, `__` between nested keys)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Special environment variables (HOST, PORT, GEMINI_API_KEY / API_KEY)
//! 2. Environment variables (APP_SERVER__PORT, APP_LIVE__FRAME_SIZE, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## Sections:
//! - **server**: bind address
//! - **gemini**: API key, endpoints, timeouts for the hosted AI service
//! - **models**: model identifiers per feature
//! - **live**: realtime voice session (rates, frame size, queues, devices)
//! - **ollama**: optional self-hosted model backend

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub gemini: GeminiConfig,
    pub models: ModelsConfig,
    pub live: LiveConfig,
    pub ollama: OllamaConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Hosted generative-AI service settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeminiConfig {
    /// API key; empty means "not configured". Never echoed by the API.
    pub api_key: String,

    /// REST base, e.g. `https://generativelanguage.googleapis.com/v1beta`
    pub api_base: String,

    /// Realtime WebSocket endpoint (the key is appended as `?key=`)
    pub live_url: String,

    /// Upper bound for a single request/response call
    pub request_timeout_secs: u64,

    /// Delay between video operation polls
    pub video_poll_interval_secs: u64,

    /// Polls before a video generation is abandoned
    pub video_max_polls: u32,
}

/// Model identifiers used by each feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub policy: String,
    pub chat: String,
    pub reasoning: String,
    pub image: String,
    pub image_edit: String,
    pub video: String,
    pub tts: String,
    pub tts_voice: String,
    pub live: String,
}

/// Realtime voice session settings.
///
/// ## Devices:
/// - `capture`: `"none"` (always denied), `"wav"` (stream `capture_path`) or `"device"`
/// - `output`: `"clock"` (headless, optional `record_path` WAV) or `"device"`
///
/// Path-like strings are optional; an empty string means unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveConfig {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub frame_size: usize,
    pub outbound_queue_capacity: usize,
    pub max_reorder_pending: usize,
    pub connect_timeout_secs: u64,
    pub capture: String,
    pub capture_path: String,
    pub loop_capture: bool,
    pub output: String,
    pub record_path: String,
    pub transcribe_input: bool,
    pub system_instruction: String,
}

/// Optional self-hosted model backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OllamaConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub default_model: String,
}

const CAPTURE_KINDS: [&str; 3] = ["none", "wav", "device"];
const OUTPUT_KINDS: [&str; 2] = ["clock", "device"];

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            gemini: GeminiConfig {
                api_key: String::new(),
                api_base: "https://generativelanguage.googleapis.com/v1beta".to_string(),
                live_url: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
                request_timeout_secs: 120,
                video_poll_interval_secs: 10,
                video_max_polls: 60,
            },
            models: ModelsConfig {
                policy: "gemini-flash-lite-latest".to_string(),
                chat: "gemini-3-flash-preview".to_string(),
                reasoning: "gemini-3-pro-preview".to_string(),
                image: "gemini-3-pro-image-preview".to_string(),
                image_edit: "gemini-2.5-flash-image".to_string(),
                video: "veo-3.1-fast-generate-preview".to_string(),
                tts: "gemini-2.5-flash-preview-tts".to_string(),
                tts_voice: "Puck".to_string(),
                live: "gemini-2.5-flash-native-audio-preview-12-2025".to_string(),
            },
            live: LiveConfig {
                input_sample_rate: 16_000,
                output_sample_rate: 24_000,
                frame_size: 4096, // Matches a 4096-sample script processor
                outbound_queue_capacity: 32,
                max_reorder_pending: 64,
                connect_timeout_secs: 15,
                capture: "none".to_string(),
                capture_path: String::new(),
                loop_capture: false,
                output: "clock".to_string(),
                record_path: String::new(),
                transcribe_input: false,
                system_instruction: "You are the Hive Mind. You are the voice of the collective simulation. Speak with authority and vision.".to_string(),
            },
            ollama: OllamaConfig {
                enabled: false,
                endpoint: "http://localhost:11434".to_string(),
                default_model: "llama3.1:8b".to_string(),
            },
        }
    }
}

impl LiveConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn capture_path(&self) -> Option<PathBuf> {
        non_empty(&self.capture_path).map(PathBuf::from)
    }

    pub fn record_path(&self) -> Option<PathBuf> {
        non_empty(&self.record_path).map(PathBuf::from)
    }
}

impl GeminiConfig {
    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// Recursively overlay `patch` onto `base`. Objects merge key by key;
/// anything else replaces the value.
fn merge_json(base: &mut serde_json::Value, patch: &serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                merge_json(base.entry(key.clone()).or_insert(serde_json::Value::Null), value);
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_LIVE__CAPTURE=wav`: Stream a file instead of the microphone
    /// - `APP_OLLAMA__ENABLED=true`: Enable the local model backend
    /// - `HOST=0.0.0.0`, `PORT=3000`: Deployment platform conventions
    /// - `GEMINI_API_KEY=...` (or `API_KEY=...`): The hosted AI key
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Some(key) = env::var("GEMINI_API_KEY").or_else(|_| env::var("API_KEY")).ok() {
            settings = settings.set_override("gemini.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }

        let live = &self.live;
        if live.input_sample_rate == 0 || live.output_sample_rate == 0 {
            return Err(anyhow!("Live sample rates must be greater than 0"));
        }
        if live.frame_size == 0 {
            return Err(anyhow!("Live frame size must be greater than 0"));
        }
        if live.outbound_queue_capacity == 0 || live.max_reorder_pending == 0 {
            return Err(anyhow!("Live queue sizes must be greater than 0"));
        }
        if !CAPTURE_KINDS.contains(&live.capture.as_str()) {
            return Err(anyhow!(
                "Unknown capture kind '{}' (expected one of {:?})",
                live.capture,
                CAPTURE_KINDS
            ));
        }
        if !OUTPUT_KINDS.contains(&live.output.as_str()) {
            return Err(anyhow!(
                "Unknown output kind '{}' (expected one of {:?})",
                live.output,
                OUTPUT_KINDS
            ));
        }
        if live.capture == "wav" && live.capture_path().is_none() {
            return Err(anyhow!("WAV capture needs live.capture_path"));
        }

        if self.gemini.video_max_polls == 0 {
            return Err(anyhow!("Video polling needs at least one poll"));
        }

        let endpoint = self.ollama.endpoint.trim();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(anyhow!("Ollama endpoint must be an http(s) URL"));
        }

        Ok(())
    }

    /// Apply a partial JSON update (used for runtime config updates).
    ///
    /// Only the keys present are changed, e.g. `{"live": {"frame_size": 2048}}`.
    /// The merged result must still deserialize and validate; on failure the
    /// current configuration is left untouched.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let patch: serde_json::Value = serde_json::from_str(json_str)?;
        if !patch.is_object() {
            return Err(anyhow!("Configuration update must be a JSON object"));
        }

        let mut merged = serde_json::to_value(&*self)?;
        merge_json(&mut merged, &patch);

        let updated: AppConfig = serde_json::from_value(merged)?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Configuration as JSON with secrets removed.
    pub fn redacted(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(gemini) = value.get_mut("gemini").and_then(|g| g.as_object_mut()) {
            gemini.insert("api_key".to_string(), serde_json::Value::Null);
            gemini.insert("api_key_configured".to_string(), self.gemini.has_api_key().into());
        }
        value
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
        assert_eq!(config.live.input_sample_rate, 16_000);
        assert_eq!(config.live.output_sample_rate, 24_000);
        assert_eq!(config.live.frame_size, 4096);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.live.capture = "wav".to_string();
        assert!(config.validate().is_err());
        config.live.capture_path = "mic.wav".to_string();
        assert!(config.validate().is_ok());

        let mut config = AppConfig::default();
        config.live.output = "speaker".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.ollama.endpoint = "localhost:11434".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"server": {"port": 9090}, "live": {"frame_size": 2048}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.live.frame_size, 2048);
        // Other fields should remain unchanged
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.live.input_sample_rate, 16_000);
    }

    #[test]
    fn test_invalid_update_leaves_config_untouched() {
        let mut config = AppConfig::default();
        assert!(config.update_from_json(r#"{"live": {"frame_size": 0}}"#).is_err());
        assert!(config.update_from_json(r#"{"server": {"port": "eighty"}}"#).is_err());
        assert!(config.update_from_json("[1, 2]").is_err());
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_redacted_hides_api_key() {
        let mut config = AppConfig::default();
        config.gemini.api_key = "secret".to_string();

        let value = config.redacted();
        assert!(value["gemini"]["api_key"].is_null());
        assert_eq!(value["gemini"]["api_key_configured"], true);
        assert!(!value.to_string().contains("secret"));
    }
}
