use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::AppConfig;
use super::env::parse_turn_mode;
use crate::core::realtime::FlowControlConfig;
use crate::core::session::state::StateTimeouts;
use crate::errors::{ConfigError, ConfigResult};
use tracing::warn;

/// Complete YAML configuration structure
///
/// All fields are optional so a file can carry only what it overrides.
/// Values present here win over environment variables.
///
/// # Example YAML structure
/// ```yaml
/// realtime:
///   url: "https://api.openai.com/v1/realtime"
///   model: "gpt-4o-realtime-preview"
///   voice: "verse"
///   instructions: "You take food orders for Olive & Thyme."
///   turn_mode: "server_vad"
///
/// broker:
///   url: "https://orders.example.com/api/realtime-token"
///   restaurant_id: "olive-thyme-01"
///   api_key: "broker-key"
///
/// session:
///   connect_timeout_ms: 15000
///   credential_timeout_ms: 10000
///   capture_audio: true
///
/// timeouts:
///   idle_ms: 60000
///   awaiting_response_ms: 15000
///
/// reconnection:
///   max_attempts: 5
///   initial_delay_ms: 1000
///
/// flow:
///   max_unacked: 3
///   queue_capacity: 64
///
/// order:
///   max_quantity: 100
///   lock_timeout_ms: 5000
///   match_threshold: 0.85
///   phonetic_threshold: 0.82
///   aliases:
///     fahita: fajita
///
/// menu:
///   path: "demos/menu.yaml"
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub realtime: Option<RealtimeYaml>,
    pub broker: Option<BrokerYaml>,
    pub session: Option<SessionYaml>,
    /// Whole section; absent states keep their defaults
    pub timeouts: Option<StateTimeouts>,
    pub reconnection: Option<ReconnectionYaml>,
    /// Whole section; absent fields keep their defaults
    pub flow: Option<FlowControlConfig>,
    pub order: Option<OrderYaml>,
    pub menu: Option<MenuYaml>,
}

/// Realtime model settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RealtimeYaml {
    pub url: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub instructions: Option<String>,
    pub transcription_model: Option<String>,
    pub turn_mode: Option<String>,
    pub temperature: Option<f32>,
}

/// Token broker settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct BrokerYaml {
    pub url: Option<String>,
    pub restaurant_id: Option<String>,
    pub api_key: Option<String>,
}

/// Session-wide timeouts and capture from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SessionYaml {
    pub connect_timeout_ms: Option<u64>,
    pub credential_timeout_ms: Option<u64>,
    pub capture_audio: Option<bool>,
}

/// Reconnection settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ReconnectionYaml {
    pub enabled: Option<bool>,
    pub max_attempts: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f32>,
    pub jitter: Option<bool>,
}

/// Cart and matcher settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct OrderYaml {
    pub min_quantity: Option<u32>,
    pub max_quantity: Option<u32>,
    pub max_notes_chars: Option<usize>,
    pub lock_timeout_ms: Option<u64>,
    pub catalog_timeout_ms: Option<u64>,
    pub match_threshold: Option<f64>,
    pub phonetic_threshold: Option<f64>,
    /// Merged into the default alias table (misheard → canonical)
    pub aliases: BTreeMap<String, String>,
}

/// Menu source from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct MenuYaml {
    pub path: Option<String>,
}

impl YamlConfig {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or the YAML is malformed.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        Self::from_yaml_str(&contents)
    }

    /// Parse configuration from YAML text. An empty document is an empty config.
    pub fn from_yaml_str(contents: &str) -> ConfigResult<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Overlay every value present here onto `config`.
    pub fn apply(self, config: &mut AppConfig) {
        if let Some(realtime) = self.realtime {
            if let Some(url) = realtime.url {
                config.realtime.url = url;
            }
            if let Some(model) = realtime.model {
                config.realtime.model = model;
            }
            if realtime.voice.is_some() {
                config.realtime.voice = realtime.voice;
            }
            if realtime.instructions.is_some() {
                config.realtime.instructions = realtime.instructions;
            }
            if realtime.transcription_model.is_some() {
                config.realtime.transcription_model = realtime.transcription_model;
            }
            if let Some(mode) = realtime.turn_mode {
                match parse_turn_mode(&mode) {
                    Some(turn_mode) => config.realtime.turn_mode = turn_mode,
                    None => warn!(
                        turn_mode = %mode,
                        "Unknown turn mode in config, keeping {:?}",
                        config.realtime.turn_mode
                    ),
                }
            }
            if realtime.temperature.is_some() {
                config.realtime.temperature = realtime.temperature;
            }
        }

        if let Some(broker) = self.broker {
            if broker.url.is_some() {
                config.broker.url = broker.url;
            }
            if broker.restaurant_id.is_some() {
                config.broker.restaurant_id = broker.restaurant_id;
            }
            if broker.api_key.is_some() {
                config.broker.api_key = broker.api_key;
            }
        }

        if let Some(session) = self.session {
            if let Some(ms) = session.connect_timeout_ms {
                config.connect_timeout_ms = ms;
            }
            if let Some(ms) = session.credential_timeout_ms {
                config.credential_timeout_ms = ms;
            }
            if let Some(capture) = session.capture_audio {
                config.capture_audio = capture;
            }
        }

        if let Some(timeouts) = self.timeouts {
            config.timeouts = timeouts;
        }

        if let Some(reconnection) = self.reconnection {
            let target = &mut config.reconnection;
            if let Some(enabled) = reconnection.enabled {
                target.enabled = enabled;
            }
            if let Some(max) = reconnection.max_attempts {
                target.max_attempts = max;
            }
            if let Some(ms) = reconnection.initial_delay_ms {
                target.initial_delay_ms = ms;
            }
            if let Some(ms) = reconnection.max_delay_ms {
                target.max_delay_ms = ms;
            }
            if let Some(multiplier) = reconnection.backoff_multiplier {
                target.backoff_multiplier = multiplier;
            }
            if let Some(jitter) = reconnection.jitter {
                target.jitter = jitter;
            }
        }

        if let Some(flow) = self.flow {
            config.flow = flow;
        }

        if let Some(order) = self.order {
            let target = &mut config.order;
            if let Some(min) = order.min_quantity {
                target.limits.min_quantity = min;
            }
            if let Some(max) = order.max_quantity {
                target.limits.max_quantity = max;
            }
            if let Some(chars) = order.max_notes_chars {
                target.limits.max_notes_chars = chars;
            }
            if let Some(ms) = order.lock_timeout_ms {
                target.lock_timeout_ms = ms;
            }
            if let Some(ms) = order.catalog_timeout_ms {
                target.catalog_timeout_ms = ms;
            }
            if let Some(threshold) = order.match_threshold {
                target.matcher.threshold = threshold;
            }
            if let Some(threshold) = order.phonetic_threshold {
                target.matcher.phonetic_threshold = threshold;
            }
            for (from, to) in order.aliases {
                target
                    .matcher
                    .aliases
                    .insert(from.to_lowercase(), to.to_lowercase());
            }
        }

        if let Some(menu) = self.menu
            && let Some(path) = menu.path
        {
            config.menu_path = Some(PathBuf::from(path));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::realtime::TurnMode;

    #[test]
    fn test_yaml_config_full() {
        let yaml = r#"
realtime:
  url: "https://realtime.example.com/v1/realtime"
  model: "gpt-4o-realtime-preview"
  voice: "verse"
  instructions: "Take orders."
  turn_mode: "push_to_talk"
broker:
  url: "https://broker.example.com/token"
  restaurant_id: "olive-thyme-01"
  api_key: "secret"
session:
  connect_timeout_ms: 8000
  capture_audio: false
timeouts:
  idle_ms: 30000
reconnection:
  max_attempts: 3
  jitter: true
flow:
  max_unacked: 2
order:
  max_quantity: 25
  match_threshold: 0.8
  phonetic_threshold: 0.75
  aliases:
    Gyro: gyros
menu:
  path: "demos/menu.yaml"
"#;
        let parsed = YamlConfig::from_yaml_str(yaml).unwrap();
        let mut config = AppConfig::default();
        parsed.apply(&mut config);

        assert_eq!(config.realtime.url, "https://realtime.example.com/v1/realtime");
        assert_eq!(config.realtime.voice.as_deref(), Some("verse"));
        assert_eq!(config.realtime.turn_mode, TurnMode::PushToTalk);
        assert_eq!(config.broker.restaurant_id.as_deref(), Some("olive-thyme-01"));
        assert_eq!(config.connect_timeout_ms, 8000);
        assert!(!config.capture_audio);
        assert_eq!(config.timeouts.idle_ms, 30000);
        // states absent from the section keep their defaults
        assert_eq!(config.timeouts.barge_in_ms, 2000);
        assert_eq!(config.reconnection.max_attempts, 3);
        assert!(config.reconnection.jitter);
        assert_eq!(config.reconnection.initial_delay_ms, 1000);
        assert_eq!(config.flow.max_unacked, 2);
        assert_eq!(config.flow.queue_capacity, 64);
        assert_eq!(config.order.limits.max_quantity, 25);
        assert_eq!(config.order.matcher.threshold, 0.8);
        assert_eq!(config.order.matcher.phonetic_threshold, 0.75);
        assert_eq!(
            config.order.matcher.aliases.get("gyro").map(String::as_str),
            Some("gyros")
        );
        assert_eq!(config.menu_path, Some(PathBuf::from("demos/menu.yaml")));
    }

    #[test]
    fn test_yaml_config_partial() {
        let parsed = YamlConfig::from_yaml_str("realtime:\n  voice: alloy\n").unwrap();
        let mut config = AppConfig::default();
        parsed.apply(&mut config);

        assert_eq!(config.realtime.voice.as_deref(), Some("alloy"));
        assert_eq!(config.realtime.model, super::super::DEFAULT_REALTIME_MODEL);
        assert!(config.broker.url.is_none());
    }

    #[test]
    fn test_yaml_config_empty() {
        let parsed = YamlConfig::from_yaml_str("").unwrap();
        assert!(parsed.realtime.is_none());
        assert!(parsed.order.is_none());
    }

    #[test]
    fn test_unknown_turn_mode_keeps_current() {
        let parsed = YamlConfig::from_yaml_str("realtime:\n  turn_mode: walkie\n").unwrap();
        let mut config = AppConfig::default();
        parsed.apply(&mut config);
        assert_eq!(config.realtime.turn_mode, TurnMode::ServerVad);
    }

    #[test]
    fn test_invalid_yaml() {
        let result = YamlConfig::from_yaml_str("order: [content");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
