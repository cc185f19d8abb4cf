use crate::core::session::CdpSession;
use crate::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// The browser driver this crate sits on top of.
///
/// Drivers own process lifecycle and tabs; this crate only asks them for
/// protocol sessions, the live frame list, and a few primitive operations.
#[async_trait]
pub trait BrowserTrait: Send + Sync {
    type TabHandle: Clone + Send + Sync;

    /// Launch a new browser instance
    async fn launch(&mut self, config: &crate::core::Config) -> Result<()>;

    /// Create a new tab/page
    async fn new_tab(&self) -> Result<Self::TabHandle>;

    /// Navigate to a URL
    async fn navigate(&self, tab: &Self::TabHandle, url: &str) -> Result<()>;

    /// Take a PNG screenshot of the viewport
    async fn take_screenshot(&self, tab: &Self::TabHandle) -> Result<Vec<u8>>;

    /// Get current URL
    async fn get_url(&self, tab: &Self::TabHandle) -> Result<String>;

    /// Protocol session bound to the tab's main frame.
    async fn page_session(&self, tab: &Self::TabHandle) -> Result<Arc<dyn CdpSession>>;

    /// Every frame the browser currently knows about for this tab, main frame included.
    async fn live_frames(&self, tab: &Self::TabHandle) -> Result<Vec<LiveFrame>>;

    /// Open an independent session for `frame`.
    ///
    /// Must fail with `BrowserAgentError::NotAttachable` when the frame lives
    /// in its parent's process and is therefore reachable through the parent.
    async fn attach_frame(
        &self,
        tab: &Self::TabHandle,
        frame: &LiveFrame,
    ) -> Result<Arc<dyn CdpSession>>;

    /// Check if browser is still running
    fn is_running(&self) -> bool;

    /// Close the browser
    async fn close(&mut self) -> Result<()>;
}

/// A frame as the driver sees it, before it is matched to a `FrameInfo`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveFrame {
    pub frame_id: String,
    pub parent_frame_id: Option<String>,
    pub url: String,
    pub name: Option<String>,
}

impl LiveFrame {
    pub fn is_main_frame(&self) -> bool {
        self.parent_frame_id.is_none()
    }
}

/// Flattens a `Page.getFrameTree` result into parent-before-child order.
pub fn frames_from_frame_tree(result: &Value) -> Vec<LiveFrame> {
    let mut frames = Vec::new();
    if let Some(tree) = result.get("frameTree") {
        collect_frame_tree(tree, &mut frames);
    }
    frames
}

fn collect_frame_tree(tree: &Value, out: &mut Vec<LiveFrame>) {
    if let Some(frame) = tree.get("frame") {
        let text = |key: &str| frame.get(key).and_then(Value::as_str).map(str::to_string);
        if let Some(frame_id) = text("id") {
            out.push(LiveFrame {
                frame_id,
                parent_frame_id: text("parentId"),
                url: text("url").unwrap_or_default(),
                name: text("name").filter(|n| !n.is_empty()),
            });
        }
    }

    if let Some(children) = tree.get("childFrames").and_then(Value::as_array) {
        for child in children {
            collect_frame_tree(child, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_tree_flattening() {
        let result = json!({
            "frameTree": {
                "frame": { "id": "main", "url": "https://a.test/" },
                "childFrames": [
                    {
                        "frame": { "id": "c1", "parentId": "main", "url": "https://a.test/c1", "name": "left" },
                        "childFrames": [
                            { "frame": { "id": "g1", "parentId": "c1", "url": "about:blank", "name": "" } }
                        ]
                    },
                    { "frame": { "id": "c2", "parentId": "main", "url": "https://b.test/" } }
                ]
            }
        });

        let frames = frames_from_frame_tree(&result);
        let ids: Vec<&str> = frames.iter().map(|f| f.frame_id.as_str()).collect();
        assert_eq!(ids, vec!["main", "c1", "g1", "c2"]);
        assert!(frames[0].is_main_frame());
        assert_eq!(frames[1].name.as_deref(), Some("left"));
        assert_eq!(frames[2].name, None);
        assert_eq!(frames[3].parent_frame_id.as_deref(), Some("main"));
    }
}
