//! Runtime configuration.
//!
//! Values come from defaults, an optional TOML file, then environment
//! overrides, in that order.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, RoundtableError};

pub const ENV_BASE_URL: &str = "ROUNDTABLE_API_BASE_URL";
pub const ENV_LLM_API_KEY: &str = "ROUNDTABLE_LLM_API_KEY";
pub const ENV_AUTO_FALLBACK: &str = "ROUNDTABLE_AUTO_FALLBACK";

pub const DEFAULT_BASE_URL: &str = "http://localhost:3000/api";
pub const DEFAULT_MODEL: &str = "Qwen/QwQ-32B";
pub const DEFAULT_LLM_ENDPOINT: &str = "https://api.siliconflow.cn/v1/chat/completions";

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoundtableConfig {
    /// Base URL of the discussion backend, e.g. `http://localhost:3000/api`.
    pub base_url: String,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Bound on the single connectivity probe call.
    pub probe_timeout_ms: u64,
    /// Switch to the mock backend when the real one is unreachable.
    pub auto_fallback: bool,
    /// Consecutive real-mode connectivity failures before auto-fallback kicks in.
    pub fallback_after_failures: u32,
    pub default_model: String,
    /// Delay between proactively closing the stream and declaring the round complete.
    pub completion_grace_ms: u64,
    /// Where insights are persisted. `None` keeps them in memory only.
    pub insights_path: Option<PathBuf>,
    /// Synthesize insights automatically after each completed round.
    pub auto_insights: bool,
    pub llm: LlmConfig,
    pub mock: MockConfig,
}

impl Default for RoundtableConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout_ms: 30_000,
            connect_timeout_ms: 3_000,
            probe_timeout_ms: 5_000,
            auto_fallback: true,
            fallback_after_failures: 3,
            default_model: DEFAULT_MODEL.to_string(),
            completion_grace_ms: 500,
            insights_path: Some(PathBuf::from("roundtable_insights.json")),
            auto_insights: true,
            llm: LlmConfig::default(),
            mock: MockConfig::default(),
        }
    }
}

/// Non-streaming completion endpoint used for insight synthesis.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    pub endpoint: String,
    /// Model for synthesis; the discussion model is used when unset.
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_LLM_ENDPOINT.to_string(),
            model: None,
            api_key: None,
            temperature: 0.8,
            max_tokens: 3000,
            top_p: 0.9,
            timeout_ms: 60_000,
        }
    }
}

/// Timing of the simulated backend.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct MockConfig {
    pub latency_ms: u64,
    pub reply_interval_ms: u64,
    pub end_delay_ms: u64,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self { latency_ms: 1_000, reply_interval_ms: 2_000, end_delay_ms: 1_000 }
    }
}

impl MockConfig {
    /// No artificial delays at all.
    pub fn instant() -> Self {
        Self { latency_ms: 0, reply_interval_ms: 0, end_delay_ms: 0 }
    }
}

impl RoundtableConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| RoundtableError::Config(e.to_string()))
    }

    /// Load from an optional TOML file, then apply the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p).map_err(|e| {
                    RoundtableError::Config(format!("cannot read {}: {e}", p.display()))
                })?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        config.with_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup` (the environment in production).
    pub fn with_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(url) = lookup(ENV_BASE_URL).filter(|v| !v.trim().is_empty()) {
            self.base_url = url;
        }
        if let Some(key) = lookup(ENV_LLM_API_KEY).filter(|v| !v.trim().is_empty()) {
            self.llm.api_key = Some(key);
        }
        if let Some(flag) = lookup(ENV_AUTO_FALLBACK) {
            self.auto_fallback = match flag.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(RoundtableError::Config(format!(
                        "{ENV_AUTO_FALLBACK} must be a boolean, got '{other}'"
                    )))
                }
            };
        }
        Ok(self)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn completion_grace(&self) -> Duration {
        Duration::from_millis(self.completion_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_defaults() {
        let c = RoundtableConfig::default();
        assert_eq!(c.base_url, DEFAULT_BASE_URL);
        assert_eq!(c.probe_timeout(), Duration::from_secs(5));
        assert_eq!(c.completion_grace(), Duration::from_millis(500));
        assert!(c.auto_fallback);
        assert_eq!(c.mock.reply_interval_ms, 2_000);
        assert_eq!(c.llm.max_tokens, 3000);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let c = RoundtableConfig::from_toml_str(
            r#"
            base_url = "http://backend:9000/api"
            auto_fallback = false

            [mock]
            reply_interval_ms = 10
            "#,
        )
        .expect("parse");
        assert_eq!(c.base_url, "http://backend:9000/api");
        assert!(!c.auto_fallback);
        assert_eq!(c.mock.reply_interval_ms, 10);
        assert_eq!(c.mock.latency_ms, 1_000);
        assert_eq!(c.request_timeout_ms, 30_000);
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = RoundtableConfig::from_toml_str("base_url = [").unwrap_err();
        assert!(matches!(err, RoundtableError::Config(_)));
    }

    #[test]
    fn test_env_overrides_base_url_and_key() {
        let c = RoundtableConfig::default()
            .with_env_from(env(&[(ENV_BASE_URL, "http://env/api"), (ENV_LLM_API_KEY, "sk-1")]))
            .expect("env");
        assert_eq!(c.base_url, "http://env/api");
        assert_eq!(c.llm.api_key.as_deref(), Some("sk-1"));
    }

    #[test]
    fn test_blank_env_is_ignored() {
        let c = RoundtableConfig::default()
            .with_env_from(env(&[(ENV_BASE_URL, "  ")]))
            .expect("env");
        assert_eq!(c.base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn test_auto_fallback_env_parsing() {
        let off = RoundtableConfig::default()
            .with_env_from(env(&[(ENV_AUTO_FALLBACK, "off")]))
            .expect("env");
        assert!(!off.auto_fallback);
        let err = RoundtableConfig::default()
            .with_env_from(env(&[(ENV_AUTO_FALLBACK, "maybe")]))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_AUTO_FALLBACK));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("roundtable.toml");
        std::fs::write(&path, "default_model = \"kimik2\"\ncompletion_grace_ms = 250\n").expect("write");
        let c = RoundtableConfig::load(Some(&path)).expect("load");
        assert_eq!(c.default_model, "kimik2");
        assert_eq!(c.completion_grace_ms, 250);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let err = RoundtableConfig::load(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(matches!(err, RoundtableError::Config(_)));
    }
}
