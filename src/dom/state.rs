use crate::dom::element::AccessibilityNode;
use crate::dom::frames::{FrameInfo, FrameMap};
use crate::types::{ElementRect, EncodedId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Result of one extraction pass. Ids in here are only valid against the
/// page as it was when the pass ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct A11yState {
    pub url: String,
    /// Serialized tree handed to the language model.
    pub tree: String,
    pub nodes: HashMap<EncodedId, AccessibilityNode>,
    pub xpaths: HashMap<EncodedId, String>,
    pub tag_names: HashMap<EncodedId, String>,
    /// Accessible names of the pass, DOM-seeded and then overwritten by the
    /// accessibility tree.
    #[serde(default)]
    pub names: HashMap<EncodedId, String>,
    pub frames: FrameMap,
    pub bounding_boxes: Option<HashMap<EncodedId, ElementRect>>,
    pub overlay_base64: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl A11yState {
    pub fn new(url: String) -> Self {
        Self {
            url,
            tree: String::new(),
            nodes: HashMap::new(),
            xpaths: HashMap::new(),
            tag_names: HashMap::new(),
            names: HashMap::new(),
            frames: FrameMap::new(),
            bounding_boxes: None,
            overlay_base64: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn node(&self, id: &EncodedId) -> Option<&AccessibilityNode> {
        self.nodes.get(id)
    }

    pub fn xpath(&self, id: &EncodedId) -> Option<&str> {
        self.xpaths.get(id).map(String::as_str)
    }

    pub fn name_of(&self, id: &EncodedId) -> Option<&str> {
        self.names.get(id).map(String::as_str)
    }

    pub fn frame(&self, frame_index: u32) -> Option<&FrameInfo> {
        self.frames.get(&frame_index)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn interactive_nodes(&self) -> Vec<(&EncodedId, &AccessibilityNode)> {
        let mut found: Vec<_> = self.nodes.iter().filter(|(_, n)| n.is_interactive()).collect();
        found.sort_by_key(|(id, _)| **id);
        found
    }

    pub fn find_nodes_by_name(&self, text: &str) -> Vec<(&EncodedId, &AccessibilityNode)> {
        let needle = text.to_lowercase();
        let mut found: Vec<_> = self
            .nodes
            .iter()
            .filter(|(_, n)| {
                n.name
                    .as_ref()
                    .map(|name| name.to_lowercase().contains(&needle))
                    .unwrap_or(false)
            })
            .collect();
        found.sort_by_key(|(id, _)| **id);
        found
    }

    pub fn set_overlay(&mut self, screenshot: String) {
        self.overlay_base64 = Some(screenshot);
    }
}
