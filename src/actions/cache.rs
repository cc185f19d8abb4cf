use crate::errors::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Act,
    Navigate,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    pub message: String,
}

/// One recorded step. Serialized as a flat JSON record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedActionEntry {
    pub instruction: String,
    pub method: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    pub frame_index: u32,
    pub xpath: String,
    pub action_type: ActionType,
    #[serde(flatten)]
    pub outcome: ActionOutcome,
    pub url: String,
    pub timestamp: DateTime<Utc>,
}

impl CachedActionEntry {
    pub fn act(
        instruction: impl Into<String>,
        url: impl Into<String>,
        method: impl Into<String>,
        arguments: Vec<String>,
        frame_index: u32,
        xpath: impl Into<String>,
        outcome: ActionOutcome,
    ) -> Self {
        Self {
            instruction: instruction.into(),
            method: method.into(),
            arguments,
            frame_index,
            xpath: xpath.into(),
            action_type: ActionType::Act,
            outcome,
            url: url.into(),
            timestamp: Utc::now(),
        }
    }

    /// `url` is both the page the step ran on and its target.
    pub fn navigate(instruction: impl Into<String>, url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            instruction: instruction.into(),
            method: "navigate".to_string(),
            arguments: vec![url.clone()],
            frame_index: 0,
            xpath: String::new(),
            action_type: ActionType::Navigate,
            outcome: ActionOutcome {
                success: true,
                message: format!("Navigated to {}", url),
            },
            url,
            timestamp: Utc::now(),
        }
    }

    pub fn complete(instruction: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            method: "complete".to_string(),
            arguments: vec![],
            frame_index: 0,
            xpath: String::new(),
            action_type: ActionType::Complete,
            outcome: ActionOutcome {
                success: true,
                message: "Task complete".to_string(),
            },
            url: url.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn signature(&self) -> ActionSignature {
        ActionSignature::new(&self.url, &self.instruction)
    }
}

/// Cache key: page url without query or fragment plus the instruction,
/// whitespace-normalized and lower-cased.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActionSignature {
    pub url: String,
    pub instruction: String,
}

impl ActionSignature {
    pub fn new(url: &str, instruction: &str) -> Self {
        let url = match Url::parse(url) {
            Ok(mut parsed) => {
                parsed.set_query(None);
                parsed.set_fragment(None);
                parsed.to_string()
            }
            Err(_) => url
                .split(['?', '#'])
                .next()
                .unwrap_or_default()
                .to_string(),
        };
        let instruction = instruction
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        Self { url, instruction }
    }
}

#[derive(Debug, Default)]
pub struct ActionCache {
    entries: HashMap<ActionSignature, CachedActionEntry>,
    path: Option<PathBuf>,
}

impl ActionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads entries from `path`; a missing file starts an empty cache bound
    /// to that path.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut cache = Self {
            entries: HashMap::new(),
            path: Some(path.clone()),
        };
        if !path.exists() {
            debug!("No action cache at {}; starting empty", path.display());
            return Ok(cache);
        }

        let raw = std::fs::read_to_string(&path)?;
        let entries: Vec<CachedActionEntry> = serde_json::from_str(&raw)?;
        for entry in entries {
            cache.entries.insert(entry.signature(), entry);
        }
        info!("Loaded {} cached actions from {}", cache.len(), path.display());
        Ok(cache)
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut entries: Vec<&CachedActionEntry> = self.entries.values().collect();
        entries.sort_by_key(|e| e.timestamp);
        std::fs::write(path, serde_json::to_string_pretty(&entries)?)?;
        debug!("Saved {} cached actions to {}", entries.len(), path.display());
        Ok(())
    }

    /// Only successful steps are worth replaying.
    pub fn record(&mut self, entry: CachedActionEntry) -> bool {
        if !entry.outcome.success {
            debug!("Not caching failed step {:?}", entry.instruction);
            return false;
        }
        if let Some(previous) = self.entries.insert(entry.signature(), entry) {
            debug!("Replaced cached step {:?}", previous.instruction);
        }
        true
    }

    pub fn lookup(&self, url: &str, instruction: &str) -> Option<&CachedActionEntry> {
        self.entries.get(&ActionSignature::new(url, instruction))
    }

    pub fn remove(&mut self, url: &str, instruction: &str) -> Option<CachedActionEntry> {
        let removed = self.entries.remove(&ActionSignature::new(url, instruction));
        if removed.is_none() {
            warn!("No cached step for {:?} on {}", instruction, url);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::assert_ok;

    fn submit_entry(url: &str) -> CachedActionEntry {
        CachedActionEntry::act(
            "Click   the Submit button",
            url,
            "click",
            vec![],
            1,
            "/html[1]/body[1]/button[1]",
            ActionOutcome {
                success: true,
                message: "Clicked".into(),
            },
        )
    }

    #[test]
    fn test_signature_normalizes_url_and_instruction() {
        let a = ActionSignature::new("https://shop.test/cart?id=7#top", "Click  the\tSubmit button");
        let b = ActionSignature::new("https://shop.test/cart", "click the submit button");
        assert_eq!(a, b);
        assert_ne!(a, ActionSignature::new("https://shop.test/checkout", "click the submit button"));
    }

    #[test]
    fn test_entry_serializes_flat() {
        let value = serde_json::to_value(submit_entry("https://shop.test/cart")).unwrap();
        assert_eq!(value["action_type"], json!("act"));
        assert_eq!(value["success"], json!(true));
        assert_eq!(value["message"], json!("Clicked"));
        assert!(value.get("outcome").is_none());
    }

    #[test]
    fn test_failed_steps_are_not_cached() {
        let mut cache = ActionCache::new();
        let mut entry = submit_entry("https://shop.test/cart");
        entry.outcome.success = false;
        assert!(!cache.record(entry));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("actions.json");

        let mut cache = assert_ok!(ActionCache::load(&path));
        assert!(cache.is_empty());
        cache.record(submit_entry("https://shop.test/cart?session=1"));
        cache.record(CachedActionEntry::navigate("open the shop", "https://shop.test/"));
        assert_ok!(cache.save());

        let reloaded = assert_ok!(ActionCache::load(&path));
        assert_eq!(reloaded.len(), 2);
        let hit = reloaded
            .lookup("https://shop.test/cart?session=2", "click the submit button")
            .unwrap();
        assert_eq!(hit.frame_index, 1);
        assert_eq!(hit.xpath, "/html[1]/body[1]/button[1]");
        assert_eq!(
            reloaded.lookup("https://shop.test/", "Open the shop").unwrap().action_type,
            ActionType::Navigate
        );
    }

    #[test]
    fn test_remove() {
        let mut cache = ActionCache::new();
        cache.record(submit_entry("https://shop.test/cart"));
        assert!(cache.remove("https://shop.test/cart", "click the submit button").is_some());
        assert!(cache.remove("https://shop.test/cart", "click the submit button").is_none());
    }
}
