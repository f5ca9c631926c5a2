//! Environment variable loading.

use std::path::PathBuf;
use std::str::FromStr;

use super::AppConfig;
use crate::core::realtime::TurnMode;
use crate::errors::{ConfigError, ConfigResult};

/// Every variable read by [`load`].
pub(super) const KEYS: &[&str] = &[
    "REALTIME_URL",
    "REALTIME_MODEL",
    "REALTIME_VOICE",
    "REALTIME_INSTRUCTIONS",
    "REALTIME_TRANSCRIPTION_MODEL",
    "TURN_MODE",
    "TOKEN_BROKER_URL",
    "RESTAURANT_ID",
    "TOKEN_BROKER_API_KEY",
    "CONNECT_TIMEOUT_MS",
    "CREDENTIAL_TIMEOUT_MS",
    "RECONNECT_ENABLED",
    "RECONNECT_MAX_ATTEMPTS",
    "RECONNECT_INITIAL_DELAY_MS",
    "RECONNECT_MAX_DELAY_MS",
    "CART_LOCK_TIMEOUT_MS",
    "CATALOG_TIMEOUT_MS",
    "MAX_QUANTITY",
    "MATCH_THRESHOLD",
    "PHONETIC_THRESHOLD",
    "MENU_PATH",
    "CAPTURE_AUDIO",
];

/// Build a configuration from defaults overlaid with environment variables.
pub(super) fn load() -> ConfigResult<AppConfig> {
    let mut config = AppConfig::default();

    if let Some(url) = var("REALTIME_URL") {
        config.realtime.url = url;
    }
    if let Some(model) = var("REALTIME_MODEL") {
        config.realtime.model = model;
    }
    if let Some(voice) = var("REALTIME_VOICE") {
        config.realtime.voice = Some(voice);
    }
    if let Some(instructions) = var("REALTIME_INSTRUCTIONS") {
        config.realtime.instructions = Some(instructions);
    }
    if let Some(model) = var("REALTIME_TRANSCRIPTION_MODEL") {
        config.realtime.transcription_model = Some(model);
    }
    if let Some(mode) = var("TURN_MODE") {
        config.realtime.turn_mode = parse_turn_mode(&mode).ok_or_else(|| ConfigError::InvalidEnv {
            key: "TURN_MODE".to_string(),
            message: format!("expected server_vad or push_to_talk, got {mode:?}"),
        })?;
    }

    config.broker.url = var("TOKEN_BROKER_URL");
    config.broker.restaurant_id = var("RESTAURANT_ID");
    config.broker.api_key = var("TOKEN_BROKER_API_KEY");

    if let Some(ms) = parse("CONNECT_TIMEOUT_MS")? {
        config.connect_timeout_ms = ms;
    }
    if let Some(ms) = parse("CREDENTIAL_TIMEOUT_MS")? {
        config.credential_timeout_ms = ms;
    }

    if let Some(enabled) = parse_bool("RECONNECT_ENABLED")? {
        config.reconnection.enabled = enabled;
    }
    if let Some(attempts) = parse("RECONNECT_MAX_ATTEMPTS")? {
        config.reconnection.max_attempts = attempts;
    }
    if let Some(ms) = parse("RECONNECT_INITIAL_DELAY_MS")? {
        config.reconnection.initial_delay_ms = ms;
    }
    if let Some(ms) = parse("RECONNECT_MAX_DELAY_MS")? {
        config.reconnection.max_delay_ms = ms;
    }

    if let Some(ms) = parse("CART_LOCK_TIMEOUT_MS")? {
        config.order.lock_timeout_ms = ms;
    }
    if let Some(ms) = parse("CATALOG_TIMEOUT_MS")? {
        config.order.catalog_timeout_ms = ms;
    }
    if let Some(max) = parse("MAX_QUANTITY")? {
        config.order.limits.max_quantity = max;
    }
    if let Some(threshold) = parse("MATCH_THRESHOLD")? {
        config.order.matcher.threshold = threshold;
    }
    if let Some(threshold) = parse("PHONETIC_THRESHOLD")? {
        config.order.matcher.phonetic_threshold = threshold;
    }

    config.menu_path = var("MENU_PATH").map(PathBuf::from);
    if let Some(capture) = parse_bool("CAPTURE_AUDIO")? {
        config.capture_audio = capture;
    }

    Ok(config)
}

pub(super) fn parse_turn_mode(value: &str) -> Option<TurnMode> {
    match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "server_vad" | "vad" => Some(TurnMode::ServerVad),
        "push_to_talk" | "ptt" => Some(TurnMode::PushToTalk),
        _ => None,
    }
}

/// Non-empty, trimmed value of `key`.
fn var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse<T>(key: &str) -> ConfigResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    var(key)
        .map(|raw| {
            raw.parse::<T>().map_err(|e| ConfigError::InvalidEnv {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            })
        })
        .transpose()
}

fn parse_bool(key: &str) -> ConfigResult<Option<bool>> {
    var(key)
        .map(|raw| match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidEnv {
                key: key.to_string(),
                message: format!("expected a boolean, got {raw:?}"),
            }),
        })
        .transpose()
}
