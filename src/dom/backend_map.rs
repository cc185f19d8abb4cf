use crate::core::SessionHandle;
use crate::dom::frames::{DiscoveryContext, FrameInfo};
use crate::errors::Result;
use crate::types::EncodedId;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, warn};

const ELEMENT_NODE: i64 = 1;
const TEXT_NODE: i64 = 3;
const COMMENT_NODE: i64 = 8;
const DOCUMENT_TYPE_NODE: i64 = 10;
const DOCUMENT_FRAGMENT_NODE: i64 = 11;

/// Longest element text used to seed an accessible name.
const MAX_SEED_TEXT: usize = 80;

/// `DOM.Node`, reduced to what the walk reads.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomNode {
    #[serde(default)]
    pub node_id: i64,
    #[serde(default)]
    pub backend_node_id: i64,
    pub node_type: i64,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub local_name: String,
    #[serde(default)]
    pub node_value: String,
    #[serde(default)]
    pub attributes: Vec<String>,
    #[serde(default)]
    pub children: Vec<DomNode>,
    #[serde(default)]
    pub shadow_roots: Vec<DomNode>,
    pub content_document: Option<Box<DomNode>>,
    pub frame_id: Option<String>,
}

impl DomNode {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .chunks(2)
            .find(|pair| pair.len() == 2 && pair[0].eq_ignore_ascii_case(name))
            .map(|pair| pair[1].as_str())
    }

    pub fn tag_name(&self) -> String {
        if self.local_name.is_empty() {
            self.node_name.to_lowercase()
        } else {
            self.local_name.clone()
        }
    }

    /// XPath step name and the sibling-counter key it is indexed under.
    fn step(&self) -> Option<(i64, String)> {
        match self.node_type {
            ELEMENT_NODE => Some((ELEMENT_NODE, self.tag_name())),
            TEXT_NODE => Some((TEXT_NODE, "text()".to_string())),
            COMMENT_NODE => Some((COMMENT_NODE, "comment()".to_string())),
            _ => None,
        }
    }

    fn seed_name(&self) -> Option<String> {
        if self.node_type != ELEMENT_NODE {
            return None;
        }
        for attr in ["aria-label", "title", "alt", "placeholder"] {
            if let Some(value) = self.attribute(attr).map(str::trim).filter(|v| !v.is_empty()) {
                return Some(value.to_string());
            }
        }
        match self.children.as_slice() {
            [only] if only.node_type == TEXT_NODE => {
                let text = only.node_value.split_whitespace().collect::<Vec<_>>().join(" ");
                (!text.is_empty() && text.chars().count() <= MAX_SEED_TEXT).then_some(text)
            }
            _ => None,
        }
    }
}

/// Two DOM paths that led to the same backend node in one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdCollision {
    pub id: EncodedId,
    pub kept: String,
    pub dropped: String,
}

/// Identity maps of one extraction pass, keyed by frame-qualified node id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendIdMaps {
    pub tag_names: HashMap<EncodedId, String>,
    pub xpaths: HashMap<EncodedId, String>,
    pub names: HashMap<EncodedId, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub collisions: Vec<IdCollision>,
}

impl BackendIdMaps {
    pub fn is_empty(&self) -> bool {
        self.xpaths.is_empty()
    }

    pub fn xpath(&self, id: &EncodedId) -> Option<&str> {
        self.xpaths.get(id).map(String::as_str)
    }

    pub fn tag_name(&self, id: &EncodedId) -> Option<&str> {
        self.tag_names.get(id).map(String::as_str)
    }

    /// Reverse index of one frame's XPaths, used to map in-page XPaths back
    /// onto node ids.
    pub fn xpath_index(&self, frame_index: u32) -> HashMap<&str, EncodedId> {
        self.xpaths
            .iter()
            .filter(|(id, _)| id.frame_index == frame_index)
            .map(|(id, path)| (path.as_str(), *id))
            .collect()
    }

    fn record(&mut self, id: EncodedId, xpath: String, tag: String, name: Option<String>) {
        if let Some(existing) = self.xpaths.get(&id) {
            warn!(
                "Backend node {} reachable via two paths: {} and {}",
                id, existing, xpath
            );
            self.collisions.push(IdCollision {
                id,
                kept: existing.clone(),
                dropped: xpath,
            });
            return;
        }
        self.xpaths.insert(id, xpath);
        self.tag_names.insert(id, tag);
        if let Some(name) = name {
            self.names.insert(id, name);
        }
    }

    /// Folds another frame's maps into this one. Frames never share ids, so a
    /// key present on both sides is recorded as a collision.
    pub fn merge(&mut self, other: BackendIdMaps) {
        self.collisions.extend(other.collisions);
        let BackendIdMaps {
            mut tag_names,
            xpaths,
            mut names,
            ..
        } = other;
        for (id, xpath) in xpaths {
            let tag = tag_names.remove(&id).unwrap_or_default();
            let name = names.remove(&id);
            self.record(id, xpath, tag, name);
        }
    }
}

/// Everything one walk of one document produces.
#[derive(Debug, Default)]
pub struct FrameWalk {
    pub maps: BackendIdMaps,
    /// Same-origin frames found inside the document, parent-first.
    pub child_frames: Vec<FrameInfo>,
}

/// Fetches the full, shadow-piercing document of `session` and walks it.
///
/// Protocol failures are logged and produce an empty walk: the frame is
/// unusable for this pass but extraction carries on.
pub async fn build_backend_maps(
    session: &SessionHandle,
    frame_index: u32,
    ctx: &DiscoveryContext,
) -> FrameWalk {
    match fetch_or_log(session, frame_index).await {
        Some(document) => walk_document(&document, frame_index, ctx),
        None => FrameWalk::default(),
    }
}

/// [`fetch_document`], with failures logged against `frame_index`.
pub async fn fetch_or_log(session: &SessionHandle, frame_index: u32) -> Option<DomNode> {
    match fetch_document(session).await {
        Ok(document) => Some(document),
        Err(e) => {
            warn!(
                "DOM walk for frame {} on session {} failed: {}",
                frame_index,
                session.session_id(),
                e
            );
            None
        }
    }
}

pub async fn fetch_document(session: &SessionHandle) -> Result<DomNode> {
    let response = session
        .send("DOM.getDocument", json!({ "depth": -1, "pierce": true }))
        .await?;
    let root = response.get("root").cloned().unwrap_or_default();
    Ok(serde_json::from_value(root)?)
}

struct Pending<'a> {
    node: &'a DomNode,
    xpath: String,
    frame_index: u32,
}

/// Depth-first walk synthesizing a positional XPath for every node.
///
/// Same-origin `contentDocument`s are walked in place with a fresh frame index
/// from `ctx` and an XPath rooted at their own document.
pub fn walk_document(document: &DomNode, frame_index: u32, ctx: &DiscoveryContext) -> FrameWalk {
    let mut walk = FrameWalk::default();
    let mut stack = vec![Pending {
        node: document,
        xpath: String::new(),
        frame_index,
    }];

    while let Some(Pending {
        node,
        xpath,
        frame_index,
    }) = stack.pop()
    {
        if node.backend_node_id > 0 && node.node_type != DOCUMENT_FRAGMENT_NODE {
            let path = if xpath.is_empty() { "/".to_string() } else { xpath.clone() };
            walk.maps.record(
                EncodedId::new(frame_index, node.backend_node_id),
                path,
                node.tag_name(),
                node.seed_name(),
            );
        }

        if let Some(content) = node.content_document.as_deref() {
            let child_index = ctx.next_frame_index();
            debug!(
                "Same-origin frame {} (parent {}) at {}",
                child_index, frame_index, xpath
            );
            walk.child_frames.push(FrameInfo {
                frame_index: child_index,
                parent_frame_index: Some(frame_index),
                src: node.attribute("src").map(str::to_string),
                name: node.attribute("name").map(str::to_string).filter(|n| !n.is_empty()),
                xpath: xpath.clone(),
                content_document_backend_id: Some(content.backend_node_id),
                frame_id: node.frame_id.clone().or_else(|| content.frame_id.clone()),
                session: None,
                path: Vec::new(),
            });
            stack.push(Pending {
                node: content,
                xpath: String::new(),
                frame_index: child_index,
            });
        }

        // Pushed in reverse so siblings are visited in document order.
        let mut next = Vec::new();
        next.extend(child_steps(&node.children, &xpath, "/", frame_index));
        for shadow_root in &node.shadow_roots {
            next.extend(child_steps(&shadow_root.children, &xpath, "//", frame_index));
        }
        stack.extend(next.into_iter().rev());
    }

    walk
}

fn child_steps<'a>(
    children: &'a [DomNode],
    parent: &str,
    join: &str,
    frame_index: u32,
) -> Vec<Pending<'a>> {
    let mut counters: HashMap<(i64, String), usize> = HashMap::new();
    let mut out = Vec::with_capacity(children.len());

    for child in children {
        if child.node_type == DOCUMENT_TYPE_NODE {
            continue;
        }
        let Some(key) = child.step() else {
            continue;
        };
        let position = counters.entry(key.clone()).or_insert(0);
        *position += 1;
        out.push(Pending {
            node: child,
            xpath: format!("{}{}{}[{}]", parent, join, key.1, position),
            frame_index,
        });
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: serde_json::Value) -> DomNode {
        serde_json::from_value(value).unwrap()
    }

    fn sample_document() -> DomNode {
        parse(json!({
            "nodeId": 1, "backendNodeId": 1, "nodeType": 9, "nodeName": "#document",
            "children": [
                { "backendNodeId": 2, "nodeType": 10, "nodeName": "html" },
                { "backendNodeId": 3, "nodeType": 1, "nodeName": "HTML", "localName": "html", "children": [
                    { "backendNodeId": 4, "nodeType": 1, "nodeName": "BODY", "localName": "body", "children": [
                        { "backendNodeId": 5, "nodeType": 3, "nodeName": "#text", "nodeValue": "hello" },
                        { "backendNodeId": 6, "nodeType": 1, "nodeName": "DIV", "localName": "div" },
                        { "backendNodeId": 7, "nodeType": 8, "nodeName": "#comment", "nodeValue": "c" },
                        { "backendNodeId": 8, "nodeType": 3, "nodeName": "#text", "nodeValue": "world" },
                        { "backendNodeId": 9, "nodeType": 1, "nodeName": "DIV", "localName": "div",
                          "attributes": ["aria-label", "Second"] },
                        { "backendNodeId": 10, "nodeType": 1, "nodeName": "X-CARD", "localName": "x-card",
                          "shadowRoots": [
                            { "backendNodeId": 11, "nodeType": 11, "nodeName": "#document-fragment", "children": [
                                { "backendNodeId": 12, "nodeType": 1, "nodeName": "BUTTON", "localName": "button",
                                  "children": [ { "backendNodeId": 13, "nodeType": 3, "nodeName": "#text", "nodeValue": " Go " } ] }
                            ]}
                          ]},
                        { "backendNodeId": 14, "nodeType": 1, "nodeName": "IFRAME", "localName": "iframe",
                          "attributes": ["src", "child.html", "name", "kid"], "frameId": "F2",
                          "contentDocument": {
                            "backendNodeId": 15, "nodeType": 9, "nodeName": "#document",
                            "children": [
                              { "backendNodeId": 16, "nodeType": 1, "nodeName": "HTML", "localName": "html" }
                            ]
                          }}
                    ]}
                ]}
            ]
        }))
    }

    #[test]
    fn test_sibling_counters_are_per_node_type() {
        let ctx = DiscoveryContext::new();
        let walk = walk_document(&sample_document(), 0, &ctx);
        let xpath = |b: i64| walk.maps.xpath(&EncodedId::new(0, b)).map(str::to_string);

        assert_eq!(xpath(1).as_deref(), Some("/"));
        assert_eq!(xpath(3).as_deref(), Some("/html[1]"));
        assert_eq!(xpath(5).as_deref(), Some("/html[1]/body[1]/text()[1]"));
        assert_eq!(xpath(6).as_deref(), Some("/html[1]/body[1]/div[1]"));
        assert_eq!(xpath(7).as_deref(), Some("/html[1]/body[1]/comment()[1]"));
        assert_eq!(xpath(8).as_deref(), Some("/html[1]/body[1]/text()[2]"));
        assert_eq!(xpath(9).as_deref(), Some("/html[1]/body[1]/div[2]"));
        assert!(xpath(2).is_none(), "doctype is not addressable");
    }

    #[test]
    fn test_shadow_children_use_pierce_marker() {
        let ctx = DiscoveryContext::new();
        let walk = walk_document(&sample_document(), 0, &ctx);
        assert_eq!(
            walk.maps.xpath(&EncodedId::new(0, 12)),
            Some("/html[1]/body[1]/x-card[1]//button[1]")
        );
        assert!(walk.maps.xpath(&EncodedId::new(0, 11)).is_none());
        assert_eq!(
            walk.maps.names.get(&EncodedId::new(0, 12)).map(String::as_str),
            Some("Go")
        );
        assert_eq!(
            walk.maps.names.get(&EncodedId::new(0, 9)).map(String::as_str),
            Some("Second")
        );
    }

    #[test]
    fn test_same_origin_frame_gets_own_index_and_root() {
        let ctx = DiscoveryContext::new();
        let walk = walk_document(&sample_document(), 0, &ctx);

        assert_eq!(walk.child_frames.len(), 1);
        let frame = &walk.child_frames[0];
        assert_eq!(frame.frame_index, 1);
        assert_eq!(frame.parent_frame_index, Some(0));
        assert_eq!(frame.xpath, "/html[1]/body[1]/iframe[1]");
        assert_eq!(frame.src.as_deref(), Some("child.html"));
        assert_eq!(frame.name.as_deref(), Some("kid"));
        assert_eq!(frame.frame_id.as_deref(), Some("F2"));
        assert_eq!(frame.content_document_backend_id, Some(15));

        assert_eq!(walk.maps.xpath(&EncodedId::new(1, 16)), Some("/html[1]"));
        assert!(walk.maps.xpath(&EncodedId::new(0, 16)).is_none());
        assert_eq!(walk.maps.tag_name(&EncodedId::new(1, 16)), Some("html"));
    }

    #[test]
    fn test_xpath_index_is_per_frame() {
        let ctx = DiscoveryContext::new();
        let maps = walk_document(&sample_document(), 0, &ctx).maps;

        let root = maps.xpath_index(0);
        assert_eq!(root.get("/html[1]/body[1]/div[2]"), Some(&EncodedId::new(0, 9)));
        assert_eq!(root.get("/html[1]/body[1]/x-card[1]//button[1]"), Some(&EncodedId::new(0, 12)));
        assert_eq!(root.get("/html[1]"), Some(&EncodedId::new(0, 3)));

        let child = maps.xpath_index(1);
        assert_eq!(child.get("/html[1]"), Some(&EncodedId::new(1, 16)));
        assert_eq!(child.len(), 2);
        assert!(maps.xpath_index(5).is_empty());
    }

    #[test]
    fn test_merge_records_collisions() {
        let ctx = DiscoveryContext::new();
        let mut first = walk_document(&sample_document(), 0, &ctx).maps;
        let mut second = BackendIdMaps::default();
        second.record(EncodedId::new(0, 6), "/elsewhere[1]".into(), "div".into(), None);
        second.record(EncodedId::new(7, 1), "/".into(), "#document".into(), None);

        first.merge(second);
        assert_eq!(first.collisions.len(), 1);
        assert_eq!(first.collisions[0].kept, "/html[1]/body[1]/div[1]");
        assert_eq!(first.xpath(&EncodedId::new(7, 1)), Some("/"));
    }
}
