use crate::errors::{BrowserAgentError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub browser: BrowserConfig,
    pub extraction: ExtractionConfig,
    pub settle: SettleConfig,
    pub action: ActionConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub headless: bool,
    pub viewport: Viewport,
    pub user_agent: Option<String>,
    pub disable_images: bool,
    pub args: Vec<String>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Decorate container roles of scrollable elements (`scrollable, list`).
    pub decorate_scrollables: bool,
    pub include_bounding_boxes: bool,
    /// Capture a screenshot with every encoded id drawn over its element.
    pub render_overlay: bool,
    /// Upper bound for the locator's wait on a frame's document to load.
    pub frame_load_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettleConfig {
    pub quiet_window_ms: u64,
    pub sweep_interval_ms: u64,
    pub stalled_request_ms: u64,
    pub global_timeout_ms: u64,
    /// Fixed wait used when network events cannot be attached.
    pub fallback_wait_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionConfig {
    pub click_fallback: bool,
    /// Upper bound, in animation frames, for a chunk scroll to come to rest.
    pub scroll_settle_max_frames: u32,
    pub key_press_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub path: Option<PathBuf>,
    pub max_replay_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
    pub device_scale_factor: f64,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| {
            BrowserAgentError::ConfigurationError(format!("{}: {}", path.display(), e))
        })
    }
}

impl BrowserConfig {
    /// Upper bound for a single driver command, including replies from
    /// out-of-process frames.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl SettleConfig {
    pub fn quiet_window(&self) -> Duration {
        Duration::from_millis(self.quiet_window_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn stalled_request(&self) -> Duration {
        Duration::from_millis(self.stalled_request_ms)
    }

    pub fn global_timeout(&self) -> Duration {
        Duration::from_millis(self.global_timeout_ms)
    }

    pub fn with_global_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.global_timeout_ms = timeout_ms;
        self
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            viewport: Viewport::default(),
            user_agent: None,
            disable_images: false,
            args: vec![],
            timeout_ms: 30000,
        }
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            decorate_scrollables: true,
            include_bounding_boxes: false,
            render_overlay: false,
            frame_load_timeout_ms: 2000,
        }
    }
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            quiet_window_ms: 500,
            sweep_interval_ms: 500,
            stalled_request_ms: 2000,
            global_timeout_ms: 10000,
            fallback_wait_ms: 1000,
        }
    }
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            click_fallback: true,
            scroll_settle_max_frames: 120,
            key_press_delay_ms: 0,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            max_replay_attempts: 3,
        }
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            device_scale_factor: 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_settle_contract() {
        let config = Config::default();
        assert_eq!(config.settle.quiet_window(), Duration::from_millis(500));
        assert_eq!(config.settle.sweep_interval(), Duration::from_millis(500));
        assert_eq!(config.settle.stalled_request(), Duration::from_secs(2));
        assert_eq!(config.settle.global_timeout(), Duration::from_secs(10));
        assert_eq!(config.cache.max_replay_attempts, 3);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "settle": {{ "global_timeout_ms": 2500 }}, "browser": {{ "headless": false }} }}"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.settle.global_timeout_ms, 2500);
        assert_eq!(config.settle.quiet_window_ms, 500);
        assert!(!config.browser.headless);
        assert_eq!(config.browser.viewport.width, 1280);
    }

    #[test]
    fn test_browser_timeout_and_scale_factor() {
        let config: Config = serde_json::from_str(
            r#"{ "browser": { "timeout_ms": 5000, "viewport": { "device_scale_factor": 2.0 } } }"#,
        )
        .unwrap();
        assert_eq!(config.browser.timeout(), Duration::from_secs(5));
        assert_eq!(config.browser.viewport.device_scale_factor, 2.0);
        assert_eq!(config.browser.viewport.height, 720);
        assert_eq!(Config::default().browser.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_malformed_file_is_configuration_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(BrowserAgentError::ConfigurationError(_))
        ));
    }
}
