use crate::core::config::ExtractionConfig;
use crate::core::{BrowserTrait, SessionHandle};
use crate::dom::backend_map::BackendIdMaps;
use crate::dom::frames::{
    discover_frames, frame_document, owning_session, DiscoveryContext, FrameInfo, FrameMap,
};
use crate::dom::state::A11yState;
use crate::dom::tree::{build_frame_tree, merge_frame_trees, FrameTree, RawAxNode};
use crate::errors::Result;
use crate::types::{ElementRect, EncodedId};
use crate::utils::javascript::SCROLLABLE_XPATHS;
use crate::utils::ScreenshotManager;
use futures::future::join_all;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Runs map building, frame discovery and tree building for every frame of a
/// page and assembles the pass into one `A11yState`.
pub struct DomProcessor {
    config: ExtractionConfig,
}

impl DomProcessor {
    pub fn new(config: ExtractionConfig) -> Self {
        Self { config }
    }

    pub async fn extract_state<B: BrowserTrait>(
        &self,
        browser: &B,
        tab: &B::TabHandle,
    ) -> Result<A11yState> {
        let url = browser.get_url(tab).await?;
        let root = SessionHandle::new(browser.page_session(tab).await?);

        let ctx = DiscoveryContext::new();
        let discovery = discover_frames(browser, tab, root.clone(), &ctx).await;
        let frames = discovery.frames;
        let mut maps = discovery.maps;

        let trees: Vec<FrameTree> = join_all(
            frames
                .values()
                .map(|frame| self.frame_tree(&frames, frame, &maps)),
        )
        .await;

        for node in trees.iter().flat_map(|t| t.roots.iter()).flat_map(|r| r.descendants()) {
            if let (Some(id), Some(name)) = (node.encoded_id, node.name.as_ref()) {
                maps.names.insert(id, name.clone());
            }
        }

        let (tree, nodes) = merge_frame_trees(&trees)?;

        let mut state = A11yState::new(url);
        state.tree = tree;
        state.nodes = nodes;

        if self.config.include_bounding_boxes || self.config.render_overlay {
            let boxes = collect_bounding_boxes(&frames, &state).await;
            if self.config.render_overlay {
                match ScreenshotManager::render_overlay(browser, tab, &*root, &boxes).await {
                    Ok(image) => state.set_overlay(image),
                    Err(e) => warn!("Overlay capture failed: {}", e),
                }
            }
            state.bounding_boxes = Some(boxes);
        }

        info!(
            "Extracted {} nodes across {} frames ({} with DOM fallback)",
            state.node_count(),
            frames.len(),
            trees.iter().filter(|t| t.used_dom_fallback).count()
        );

        let BackendIdMaps {
            xpaths,
            tag_names,
            names,
            ..
        } = maps;
        state.xpaths = xpaths;
        state.tag_names = tag_names;
        state.names = names;
        state.frames = frames;
        Ok(state)
    }

    async fn frame_tree(&self, frames: &FrameMap, frame: &FrameInfo, maps: &BackendIdMaps) -> FrameTree {
        let raw = fetch_ax_nodes(frames, frame).await;
        let scrollable = if self.config.decorate_scrollables {
            scrollable_backend_ids(frames, frame.frame_index, maps).await
        } else {
            HashSet::new()
        };
        build_frame_tree(&raw, frame.frame_index, maps, &scrollable)
    }
}

/// Raw accessibility nodes of one frame. Failures yield no nodes, which
/// leaves the frame to the DOM fallback.
async fn fetch_ax_nodes(frames: &FrameMap, frame: &FrameInfo) -> Vec<RawAxNode> {
    let params = match (&frame.session, &frame.frame_id) {
        (Some(_), _) => json!({}),
        (None, Some(frame_id)) => json!({ "frameId": frame_id }),
        (None, None) => {
            debug!(
                "Frame {} has no protocol frame id; skipping accessibility fetch",
                frame.frame_index
            );
            return Vec::new();
        }
    };
    let Some(session) = owning_session(frames, frame.frame_index) else {
        return Vec::new();
    };

    let response = match session.send("Accessibility.getFullAXTree", params).await {
        Ok(response) => response,
        Err(e) => {
            warn!(
                "Accessibility tree for frame {} unavailable: {}",
                frame.frame_index, e
            );
            return Vec::new();
        }
    };

    let nodes = response.get("nodes").cloned().unwrap_or(Value::Array(vec![]));
    match serde_json::from_value(nodes) {
        Ok(nodes) => nodes,
        Err(e) => {
            warn!(
                "Malformed accessibility nodes for frame {}: {}",
                frame.frame_index, e
            );
            Vec::new()
        }
    }
}

async fn scrollable_backend_ids(frames: &FrameMap, frame_index: u32, maps: &BackendIdMaps) -> HashSet<i64> {
    let document = match frame_document(frames, frame_index).await {
        Ok(document) => document,
        Err(e) => {
            debug!("No document for scrollable scan in frame {}: {}", frame_index, e);
            return HashSet::new();
        }
    };

    let result = document
        .session
        .call_function_on(&document.object_id, SCROLLABLE_XPATHS, vec![], true)
        .await;
    document.release().await;

    let xpaths: Vec<String> = match result {
        Ok(remote) => remote
            .value
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default(),
        Err(e) => {
            debug!("Scrollable scan failed in frame {}: {}", frame_index, e);
            return HashSet::new();
        }
    };

    let index = maps.xpath_index(frame_index);
    xpaths
        .iter()
        .filter_map(|xpath| index.get(xpath.as_str()))
        .map(|id| id.backend_node_id)
        .collect()
}

async fn collect_bounding_boxes(frames: &FrameMap, state: &A11yState) -> HashMap<EncodedId, ElementRect> {
    let mut boxes = HashMap::new();
    for (id, _) in state.interactive_nodes() {
        let Some(session) = owning_session(frames, id.frame_index) else {
            continue;
        };
        match session
            .send(
                "DOM.getContentQuads",
                json!({ "backendNodeId": id.backend_node_id }),
            )
            .await
        {
            Ok(response) => {
                if let Some(rect) = first_quad(&response) {
                    boxes.insert(*id, rect);
                }
            }
            Err(e) => debug!("No content quads for {}: {}", id, e),
        }
    }
    boxes
}

pub(crate) fn first_quad(response: &Value) -> Option<ElementRect> {
    let quad: Vec<f64> = response
        .get("quads")?
        .as_array()?
        .first()?
        .as_array()?
        .iter()
        .filter_map(Value::as_f64)
        .collect();
    ElementRect::from_quad(&quad).filter(|r| !r.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::BrowserTrait;
    use crate::errors::BrowserAgentError;
    use crate::testing::{FakeBrowser, FakeNode, FakeSession};

    fn same_origin_page() -> FakeBrowser {
        let root = FakeSession::new(
            "root",
            FakeNode::document(vec![FakeNode::element("html").children(vec![
                FakeNode::element("body").children(vec![
                    FakeNode::element("h1").text("Checkout"),
                    FakeNode::iframe("F1", "form.html", FakeNode::document(vec![
                        FakeNode::element("html").children(vec![FakeNode::element("body").children(vec![
                            FakeNode::element("input").attr("placeholder", "Email"),
                            FakeNode::element("button").text("Submit"),
                        ])]),
                    ])),
                ]),
            ])]),
        );
        FakeBrowser::new(root)
    }

    #[tokio::test]
    async fn test_same_origin_button_gets_child_frame_id() {
        let browser = same_origin_page();
        let tab = browser.new_tab().await.unwrap();
        let state = DomProcessor::new(ExtractionConfig::default())
            .extract_state(&browser, &tab)
            .await
            .unwrap();

        let found = state.find_nodes_by_name("Submit");
        let (id, node) = found
            .iter()
            .find(|(_, n)| n.role == "button")
            .copied()
            .expect("submit button surfaced");
        assert_eq!(node.role, "button");
        assert_ne!(id.frame_index, 0);
        assert_eq!(state.xpath(id), Some("/html[1]/body[1]/button[1]"));
        assert!(state.tree.contains(&format!("[{}] button: Submit", id)));
        assert!(state.tree.contains("\n\n"), "frames are separated by a blank line");
        assert_eq!(state.frame(id.frame_index).unwrap().parent_frame_index, Some(0));
    }

    #[tokio::test]
    async fn test_every_surfaced_id_is_unique_and_meaningful() {
        let browser = same_origin_page();
        let tab = browser.new_tab().await.unwrap();
        let state = DomProcessor::new(ExtractionConfig::default())
            .extract_state(&browser, &tab)
            .await
            .unwrap();

        let lines: Vec<&str> = state.tree.lines().filter(|l| l.trim_start().starts_with('[')).collect();
        let ids: HashSet<&str> = lines
            .iter()
            .filter_map(|l| l.trim_start().strip_prefix('[')?.split(']').next())
            .collect();
        assert_eq!(ids.len(), lines.len());
        assert_eq!(ids.len(), state.node_count());
        for node in state.nodes.values() {
            assert!(node.has_name() || node.is_interactive() || node.role != "generic");
        }
    }

    #[tokio::test]
    async fn test_names_map_survives_into_state() {
        let browser = same_origin_page();
        let tab = browser.new_tab().await.unwrap();
        let state = DomProcessor::new(ExtractionConfig::default())
            .extract_state(&browser, &tab)
            .await
            .unwrap();

        let (id, _) = state
            .find_nodes_by_name("Submit")
            .into_iter()
            .find(|(_, n)| n.role == "button")
            .unwrap();
        assert_eq!(state.name_of(id), Some("Submit"));
        let (email, _) = state
            .find_nodes_by_name("Email")
            .into_iter()
            .find(|(_, n)| n.role == "textbox")
            .unwrap();
        assert_eq!(state.name_of(email), Some("Email"));
    }

    #[tokio::test]
    async fn test_missing_accessibility_falls_back_to_dom() {
        let browser = same_origin_page();
        browser.root().fail_method("Accessibility.getFullAXTree");
        let tab = browser.new_tab().await.unwrap();
        let state = DomProcessor::new(ExtractionConfig::default())
            .extract_state(&browser, &tab)
            .await
            .unwrap();

        assert!(state.tree.contains("textbox: Email"));
        assert!(state.tree.contains("button: Submit"));
    }

    #[tokio::test]
    async fn test_bounding_boxes_and_overlay() {
        let browser = same_origin_page();
        let tab = browser.new_tab().await.unwrap();
        let config = ExtractionConfig {
            include_bounding_boxes: true,
            render_overlay: true,
            ..Default::default()
        };
        let state = DomProcessor::new(config).extract_state(&browser, &tab).await.unwrap();

        let boxes = state.bounding_boxes.as_ref().unwrap();
        assert!(!boxes.is_empty());
        assert!(state.overlay_base64.is_some());
        assert!(browser.root().log().iter().any(|entry| entry == "overlay:clear"));
    }

    #[tokio::test]
    async fn test_unusable_root_document_is_not_fatal() {
        let browser = same_origin_page();
        browser.root().fail_method("DOM.getDocument");
        let tab = browser.new_tab().await.unwrap();
        let result = DomProcessor::new(ExtractionConfig::default())
            .extract_state(&browser, &tab)
            .await;
        assert!(!matches!(result, Err(BrowserAgentError::DuplicateEncodedId(_))));
        assert!(result.unwrap().xpaths.is_empty());
    }
}
