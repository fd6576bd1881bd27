//! Configuration for the orchestrator runtime.
//!
//! Configuration is a TOML document; every section has defaults so an empty
//! document (or no document at all) yields a working, conservative setup.
//! The NLU API key is resolved from the environment at construction time and
//! is never serialized, logged, or embedded in traces.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::ConfigError;

/// Which NLU backend to construct.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NluBackend {
    /// Gemini HTTP API.
    Gemini,
    /// Deterministic keyword rules; no network, used offline and in tests.
    Rules,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NluConfig {
    pub provider: NluBackend,
    pub model: String,
    /// Base URL override for the Gemini endpoint (tests point this at a
    /// local fixture server).
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub timeout_seconds: u64,
}

impl Default for NluConfig {
    fn default() -> Self {
        Self {
            provider: NluBackend::Rules,
            model: "gemini-pro".to_string(),
            base_url: None,
            api_key_env: "GEMINI_API_KEY".to_string(),
            timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub allowed_capabilities: HashSet<String>,
    pub allowed_roots: Vec<PathBuf>,
    pub max_step_timeout_seconds: u64,
    pub require_confirmation_for_destructive: bool,
    /// Seconds to wait for a confirmation response before treating the step
    /// as denied.
    pub confirmation_timeout_seconds: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            allowed_capabilities: [
                "file-search",
                "dir-list",
                "process-list",
                "disk-usage",
                "git-status",
                "git-log",
                "browser-navigate",
                "browser-click",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            allowed_roots: vec![
                PathBuf::from("~/Desktop"),
                PathBuf::from("~/Documents"),
                PathBuf::from("~/Downloads"),
            ],
            max_step_timeout_seconds: 30,
            require_confirmation_for_destructive: true,
            confirmation_timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BrowserKind {
    Chrome,
    Firefox,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub default_browser: BrowserKind,
    pub headless: bool,
    /// WebDriver endpoint; driver bootstrap is external to this system.
    pub webdriver_url: String,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            default_browser: BrowserKind::Chrome,
            headless: false,
            webdriver_url: "http://localhost:9515".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    pub enabled: bool,
    pub store_path: PathBuf,
    /// Success-rate floor below which a pattern is flagged low-confidence.
    pub confidence_floor: f64,
    /// Minimum attempts before the floor applies.
    pub min_attempts: u64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            store_path: PathBuf::from("/tmp/adjutant_learning.json"),
            confidence_floor: 0.2,
            min_attempts: 5,
        }
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    pub nlu: NluConfig,
    pub safety: SafetyConfig,
    pub browser: BrowserConfig,
    pub learning: LearningConfig,
    pub max_concurrency: MaxConcurrency,
}

/// Newtype so `#[serde(default)]` can carry a non-zero default.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MaxConcurrency(pub usize);

impl Default for MaxConcurrency {
    fn default() -> Self {
        MaxConcurrency(4)
    }
}

impl AssistantConfig {
    /// Load from a TOML file; missing sections fall back to defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.safety.max_step_timeout_seconds)
    }

    pub fn nlu_timeout(&self) -> Duration {
        Duration::from_secs(self.nlu.timeout_seconds)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.safety.confirmation_timeout_seconds)
    }

    /// Resolve the NLU API key from the configured environment variable.
    /// Returns None when unset; the Gemini provider refuses to start without
    /// it, the rules provider never needs it.
    pub fn nlu_api_key(&self) -> Option<String> {
        std::env::var(&self.nlu.api_key_env).ok().filter(|k| !k.is_empty())
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    let Some(s) = path.to_str() else {
        return path.to_path_buf();
    };
    if s == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));
    }
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let cfg: AssistantConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.safety.max_step_timeout_seconds, 30);
        assert!(cfg.safety.require_confirmation_for_destructive);
        assert_eq!(cfg.browser.default_browser, BrowserKind::Chrome);
        assert_eq!(cfg.max_concurrency.0, 4);
        assert!(cfg.safety.allowed_capabilities.contains("file-search"));
    }

    #[test]
    fn partial_document_overrides_only_named_fields() {
        let cfg: AssistantConfig = toml::from_str(
            r#"
            [safety]
            max_step_timeout_seconds = 5
            allowed_capabilities = ["file-search"]

            [browser]
            default_browser = "firefox"
            headless = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.safety.max_step_timeout_seconds, 5);
        assert_eq!(cfg.safety.allowed_capabilities.len(), 1);
        assert_eq!(cfg.browser.default_browser, BrowserKind::Firefox);
        assert!(cfg.browser.headless);
        // untouched section keeps defaults
        assert!(cfg.learning.enabled);
    }

    #[test]
    fn expand_home_leaves_absolute_paths_alone() {
        assert_eq!(expand_home(Path::new("/tmp/x")), PathBuf::from("/tmp/x"));
    }

    #[test]
    fn expand_home_rewrites_tilde() {
        let expanded = expand_home(Path::new("~/Documents"));
        assert!(!expanded.to_string_lossy().starts_with('~'));
    }
}
