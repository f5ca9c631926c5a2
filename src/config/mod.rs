//! Configuration for the ordering session
//!
//! Settings come from `.env` files, environment variables and YAML files.
//! Priority: YAML > ENV vars > .env values > defaults.
//!
//! # Modules
//! - `env`: Environment variable loading
//! - `yaml`: YAML configuration file loading and overlay
//!
//! # Example
//! ```rust,no_run
//! use voice_order_session::config::AppConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = AppConfig::from_env()?;
//!
//! // Load from YAML file with environment variables as the base
//! let config = AppConfig::from_file(&PathBuf::from("order.yaml"))?;
//! println!("Realtime endpoint: {}", config.realtime.url);
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

mod env;
mod yaml;

pub use yaml::YamlConfig;

use crate::core::order::{MAX_LINE_QUANTITY, OrderGateConfig, StaticMenu};
use crate::core::realtime::{
    FlowControlConfig, InputAudioTranscription, RouterConfig, SessionConfig, TurnMode,
};
use crate::core::reconnect::ReconnectionConfig;
use crate::core::session::SessionOptions;
use crate::core::session::state::StateTimeouts;
use crate::core::transport::{HttpTokenBroker, SdpSignaling};
use crate::errors::{ConfigError, ConfigResult};

/// Default realtime endpoint for SDP exchange.
pub const DEFAULT_REALTIME_URL: &str = "https://api.openai.com/v1/realtime";

/// Default realtime model.
pub const DEFAULT_REALTIME_MODEL: &str = "gpt-4o-realtime-preview";

/// Realtime model settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeSettings {
    /// Endpoint the SDP offer is posted to
    pub url: String,
    pub model: String,
    pub voice: Option<String>,
    pub instructions: Option<String>,
    /// Model used to transcribe caller audio (e.g. "whisper-1")
    pub transcription_model: Option<String>,
    pub turn_mode: TurnMode,
    pub temperature: Option<f32>,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_REALTIME_URL.to_string(),
            model: DEFAULT_REALTIME_MODEL.to_string(),
            voice: None,
            instructions: None,
            transcription_model: Some("whisper-1".to_string()),
            turn_mode: TurnMode::default(),
            temperature: None,
        }
    }
}

/// Ephemeral credential broker settings.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BrokerSettings {
    pub url: Option<String>,
    pub restaurant_id: Option<String>,
    /// Bearer key for the broker itself; zeroized on drop
    pub api_key: Option<String>,
}

/// Complete application configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub realtime: RealtimeSettings,
    pub broker: BrokerSettings,

    /// Per-state timers
    pub timeouts: StateTimeouts,
    /// Transport connect timeout (milliseconds)
    pub connect_timeout_ms: u64,
    /// Credential fetch timeout (milliseconds)
    pub credential_timeout_ms: u64,

    pub reconnection: ReconnectionConfig,
    pub flow: FlowControlConfig,
    /// Cart limits, lock timeouts and matcher tuning
    pub order: OrderGateConfig,

    /// YAML menu served by the static catalog
    pub menu_path: Option<PathBuf>,
    /// Acquire the microphone when the session starts
    pub capture_audio: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            realtime: RealtimeSettings::default(),
            broker: BrokerSettings::default(),
            timeouts: StateTimeouts::default(),
            connect_timeout_ms: 15_000,
            credential_timeout_ms: 10_000,
            reconnection: ReconnectionConfig::default(),
            flow: FlowControlConfig::default(),
            order: OrderGateConfig::default(),
            menu_path: None,
            capture_audio: true,
        }
    }
}

/// Zeroize the broker key when the configuration is dropped.
impl Drop for AppConfig {
    fn drop(&mut self) {
        use zeroize::Zeroize;

        if let Some(ref mut key) = self.broker.api_key {
            key.zeroize();
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// `.env` values are expected to be loaded already (the binary calls
    /// `dotenvy::dotenv()` at startup).
    ///
    /// # Errors
    /// Returns an error if a variable has an invalid format or the resulting
    /// configuration fails validation.
    pub fn from_env() -> ConfigResult<Self> {
        let config = env::load()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file with environment variables as the base.
    ///
    /// Priority order (highest to lowest):
    /// 1. YAML file values
    /// 2. Environment variables (actual ENV vars override .env values)
    /// 3. .env file values
    /// 4. Default values
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, an environment
    /// variable is malformed, or validation fails.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let yaml_config = YamlConfig::from_file(path)?;

        let mut config = env::load()?;
        yaml_config.apply(&mut config);

        config.validate()?;
        Ok(config)
    }

    /// Check that the merged configuration is usable.
    pub fn validate(&self) -> ConfigResult<()> {
        parse_url("realtime.url", &self.realtime.url)?;
        if self.realtime.model.trim().is_empty() {
            return Err(ConfigError::Invalid("realtime.model must not be empty".into()));
        }

        if let Some(url) = &self.broker.url {
            parse_url("broker.url", url)?;
            let has_restaurant = self
                .broker
                .restaurant_id
                .as_deref()
                .is_some_and(|id| !id.trim().is_empty());
            if !has_restaurant {
                return Err(ConfigError::Invalid(
                    "broker.restaurant_id is required when broker.url is set".into(),
                ));
            }
        }

        let matcher = &self.order.matcher;
        for (field, threshold) in [
            ("threshold", matcher.threshold),
            ("phonetic_threshold", matcher.phonetic_threshold),
        ] {
            if !(threshold > 0.0 && threshold <= 1.0) {
                return Err(ConfigError::Invalid(format!(
                    "order.matcher.{field} must be in (0, 1], got {threshold}"
                )));
            }
        }

        let limits = &self.order.limits;
        if limits.min_quantity == 0
            || limits.min_quantity > limits.max_quantity
            || limits.max_quantity > MAX_LINE_QUANTITY
        {
            return Err(ConfigError::Invalid(format!(
                "order quantity range {}..={} must lie within 1..={MAX_LINE_QUANTITY}",
                limits.min_quantity, limits.max_quantity
            )));
        }

        if self.order.lock_timeout_ms == 0 || self.order.catalog_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "order lock and catalog timeouts must be positive".into(),
            ));
        }
        if self.connect_timeout_ms == 0 || self.credential_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "connect and credential timeouts must be positive".into(),
            ));
        }

        if self.reconnection.enabled && self.reconnection.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "reconnection.max_attempts must be at least 1".into(),
            ));
        }

        if self.reconnection.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "reconnection.backoff_multiplier must be >= 1.0, got {}",
                self.reconnection.backoff_multiplier
            )));
        }

        if self.flow.max_unacked == 0 {
            return Err(ConfigError::Invalid("flow.max_unacked must be at least 1".into()));
        }

        Ok(())
    }

    /// Session configuration sent with `session.update`.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            modalities: Some(vec!["text".to_string(), "audio".to_string()]),
            instructions: self.realtime.instructions.clone(),
            voice: self.realtime.voice.clone(),
            input_audio_format: Some("g711_ulaw".to_string()),
            output_audio_format: Some("g711_ulaw".to_string()),
            input_audio_transcription: self
                .realtime
                .transcription_model
                .clone()
                .map(|model| InputAudioTranscription { model }),
            temperature: self.realtime.temperature,
            ..Default::default()
        }
    }

    /// Options for [`crate::core::session::SessionHandle::start`].
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            timeouts: self.timeouts.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            credential_timeout: Duration::from_millis(self.credential_timeout_ms),
            reconnection: self.reconnection.clone(),
            router: RouterConfig {
                turn_mode: self.realtime.turn_mode,
                session: self.session_config(),
                flow: self.flow,
            },
            gate: self.order.clone(),
            capture_audio: self.capture_audio,
        }
    }

    /// HTTP broker built from the `broker` section.
    pub fn token_broker(&self) -> ConfigResult<HttpTokenBroker> {
        let url = self
            .broker
            .url
            .as_deref()
            .ok_or_else(|| ConfigError::Invalid("broker.url is not configured".into()))?;
        let restaurant_id = self.broker.restaurant_id.as_deref().unwrap_or_default();

        let mut broker = HttpTokenBroker::new(url, restaurant_id)
            .with_timeout(Duration::from_millis(self.credential_timeout_ms));
        if let Some(api_key) = &self.broker.api_key {
            broker = broker.with_api_key(api_key.as_str());
        }
        Ok(broker)
    }

    /// SDP signaling client for the realtime endpoint.
    pub fn signaling(&self) -> SdpSignaling {
        SdpSignaling::new(self.realtime.url.as_str())
            .with_model(self.realtime.model.as_str())
            .with_timeout(Duration::from_millis(self.connect_timeout_ms))
    }

    /// Load the configured menu file.
    pub fn load_menu(&self) -> ConfigResult<StaticMenu> {
        let path = self
            .menu_path
            .as_ref()
            .ok_or_else(|| ConfigError::Invalid("menu_path is not configured".into()))?;
        StaticMenu::from_file(path).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

fn parse_url(field: &str, value: &str) -> ConfigResult<url::Url> {
    url::Url::parse(value)
        .map_err(|e| ConfigError::Invalid(format!("{field} is not a valid URL ({value}): {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    fn cleanup_env_vars() {
        unsafe {
            for key in env::KEYS {
                std::env::remove_var(key);
            }
        }
    }

    #[test]
    fn test_defaults_validate() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.order.matcher.threshold, 0.85);
        assert_eq!(config.order.limits.max_quantity, 100);
        assert_eq!(config.timeouts.idle_ms, 60_000);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.realtime.url = "not a url".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.broker.url = Some("https://broker.example.com/token".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("restaurant_id"));

        let mut config = AppConfig::default();
        config.order.matcher.threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.order.limits.min_quantity = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.order.limits.max_quantity = 101;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("1..=100"));

        let mut config = AppConfig::default();
        config.order.matcher.phonetic_threshold = 0.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.reconnection.max_attempts = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_attempts"));
    }

    #[test]
    fn test_session_options_carry_settings() {
        let mut config = AppConfig::default();
        config.realtime.turn_mode = TurnMode::PushToTalk;
        config.realtime.voice = Some("alloy".to_string());
        config.connect_timeout_ms = 5000;

        let options = config.session_options();
        assert_eq!(options.router.turn_mode, TurnMode::PushToTalk);
        assert_eq!(options.router.session.voice.as_deref(), Some("alloy"));
        assert_eq!(options.connect_timeout, Duration::from_secs(5));
        assert_eq!(
            options
                .router
                .session
                .input_audio_transcription
                .map(|t| t.model),
            Some("whisper-1".to_string())
        );
    }

    #[test]
    fn test_token_broker_requires_url() {
        let config = AppConfig::default();
        assert!(config.token_broker().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env() {
        cleanup_env_vars();
        unsafe {
            std::env::set_var("TOKEN_BROKER_URL", "https://broker.example.com/token");
            std::env::set_var("RESTAURANT_ID", "r-42");
            std::env::set_var("TURN_MODE", "push_to_talk");
            std::env::set_var("MATCH_THRESHOLD", "0.9");
            std::env::set_var("RECONNECT_MAX_ATTEMPTS", "7");
        }

        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.broker.restaurant_id.as_deref(), Some("r-42"));
        assert_eq!(config.realtime.turn_mode, TurnMode::PushToTalk);
        assert_eq!(config.order.matcher.threshold, 0.9);
        assert_eq!(config.reconnection.max_attempts, 7);
        assert!(config.token_broker().is_ok());

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_env_invalid_number() {
        cleanup_env_vars();
        unsafe {
            std::env::set_var("CONNECT_TIMEOUT_MS", "soon");
        }

        let err = AppConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { ref key, .. } if key == "CONNECT_TIMEOUT_MS"));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_yaml_overrides_env() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("order.yaml");
        fs::write(
            &config_path,
            r#"
realtime:
  model: "gpt-4o-mini-realtime-preview"
  voice: "verse"
order:
  max_quantity: 20
  aliases:
    feeta: feta
"#,
        )
        .unwrap();

        unsafe {
            std::env::set_var("REALTIME_MODEL", "env-model");
            std::env::set_var("REALTIME_VOICE", "alloy");
            std::env::set_var("MAX_QUANTITY", "50");
        }

        let config = AppConfig::from_file(&config_path).unwrap();
        assert_eq!(config.realtime.model, "gpt-4o-mini-realtime-preview");
        assert_eq!(config.realtime.voice.as_deref(), Some("verse"));
        assert_eq!(config.order.limits.max_quantity, 20);
        assert_eq!(
            config.order.matcher.aliases.get("feeta").map(String::as_str),
            Some("feta")
        );
        // defaults survive next to added aliases
        assert!(config.order.matcher.aliases.contains_key("fahita"));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_missing_file() {
        cleanup_env_vars();

        let result = AppConfig::from_file(Path::new("/nonexistent/order.yaml"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to read config file")
        );
    }

    #[test]
    #[serial]
    fn test_from_file_invalid_yaml() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("invalid.yaml");
        fs::write(&config_path, "realtime: [content").unwrap();

        let result = AppConfig::from_file(&config_path);
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_menu() {
        let temp_dir = TempDir::new().unwrap();
        let menu_path = temp_dir.path().join("menu.yaml");
        fs::write(
            &menu_path,
            "items:\n  - id: espresso\n    name: Espresso\n    price_cents: 350\n",
        )
        .unwrap();

        let mut config = AppConfig::default();
        config.menu_path = Some(menu_path);
        assert!(config.load_menu().is_ok());
        assert!(AppConfig::default().load_menu().is_err());
    }
}
