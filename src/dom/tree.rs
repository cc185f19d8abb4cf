use crate::dom::backend_map::BackendIdMaps;
use crate::dom::element::{is_interactive_role, AccessibilityNode};
use crate::errors::{BrowserAgentError, Result};
use crate::types::EncodedId;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::{debug, error};

/// `Accessibility.AXValue`; only the payload is read.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AxValue {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub value: Option<Value>,
}

impl AxValue {
    pub fn text(&self) -> Option<String> {
        match self.value.as_ref()? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// `Accessibility.AXNode` as returned by `getFullAXTree`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAxNode {
    pub node_id: String,
    #[serde(default)]
    pub ignored: bool,
    pub role: Option<AxValue>,
    pub name: Option<AxValue>,
    pub description: Option<AxValue>,
    pub value: Option<AxValue>,
    pub parent_id: Option<String>,
    #[serde(default)]
    pub child_ids: Vec<String>,
    #[serde(rename = "backendDOMNodeId")]
    pub backend_dom_node_id: Option<i64>,
}

/// Tag names the DOM fallback turns into nodes, with the role each one gets.
const FALLBACK_ROLES: &[(&str, &str)] = &[
    ("input", "textbox"),
    ("textarea", "textbox"),
    ("button", "button"),
    ("a", "link"),
    ("select", "combobox"),
];

/// Cleaned tree of one frame.
#[derive(Debug, Clone, Default)]
pub struct FrameTree {
    pub frame_index: u32,
    pub roots: Vec<AccessibilityNode>,
    /// True when the tree came from the DOM maps instead of accessibility data.
    pub used_dom_fallback: bool,
}

impl FrameTree {
    pub fn serialize(&self) -> String {
        serialize_tree(&self.roots)
    }

    pub fn index(&self) -> Result<HashMap<EncodedId, AccessibilityNode>> {
        index_tree(&self.roots)
    }
}

struct Converted {
    node_id: String,
    parent_id: Option<String>,
    child_ids: Vec<String>,
    node: AccessibilityNode,
}

/// Builds and cleans the accessibility tree of one frame.
pub fn build_frame_tree(
    raw: &[RawAxNode],
    frame_index: u32,
    maps: &BackendIdMaps,
    scrollable: &HashSet<i64>,
) -> FrameTree {
    let converted: Vec<Converted> = raw
        .iter()
        .filter_map(|node| convert(node, frame_index, maps, scrollable))
        .collect();

    let by_id: HashMap<&str, &Converted> =
        converted.iter().map(|c| (c.node_id.as_str(), c)).collect();

    let mut visiting = HashSet::new();
    let roots: Vec<AccessibilityNode> = converted
        .iter()
        .filter(|c| match c.parent_id.as_deref() {
            Some(parent) => !by_id.contains_key(parent),
            None => true,
        })
        .filter_map(|c| assemble(c, &by_id, &mut visiting))
        .collect();

    let mut roots: Vec<AccessibilityNode> = roots
        .into_iter()
        .filter_map(|root| clean_node(root, maps))
        .collect();

    let has_interactive = roots
        .iter()
        .flat_map(|r| r.descendants())
        .any(|n| n.is_interactive());

    let mut used_dom_fallback = false;
    if !has_interactive {
        let present: HashSet<EncodedId> = roots
            .iter()
            .flat_map(|r| r.descendants())
            .filter_map(|n| n.encoded_id)
            .collect();
        let fallback = fallback_nodes(frame_index, maps, &present);
        if !fallback.is_empty() {
            debug!(
                "Frame {} surfaced no interactive accessibility nodes; using {} DOM nodes",
                frame_index,
                fallback.len()
            );
            used_dom_fallback = true;
            roots.extend(fallback);
        }
    }

    FrameTree {
        frame_index,
        roots,
        used_dom_fallback,
    }
}

fn convert(
    raw: &RawAxNode,
    frame_index: u32,
    maps: &BackendIdMaps,
    scrollable: &HashSet<i64>,
) -> Option<Converted> {
    match raw.node_id.parse::<i64>() {
        Ok(id) if id >= 0 => {}
        _ => return None,
    }

    let mut role = raw
        .role
        .as_ref()
        .and_then(AxValue::text)
        .unwrap_or_default();
    let name = raw
        .name
        .as_ref()
        .and_then(AxValue::text)
        .filter(|n| !n.trim().is_empty());

    let has_children = !raw.child_ids.is_empty();
    if name.is_none() && !has_children && !is_interactive_role(&role) {
        return None;
    }

    if let Some(backend) = raw.backend_dom_node_id {
        if scrollable.contains(&backend) && !is_interactive_role(&role) {
            role = if matches!(role.as_str(), "generic" | "none" | "") {
                "scrollable".to_string()
            } else {
                format!("scrollable, {}", role)
            };
        }
    }

    let encoded_id = raw.backend_dom_node_id.map(|backend| {
        let id = EncodedId::new(frame_index, backend);
        if maps.xpath(&id).is_none() {
            debug!("Accessibility node {} has no XPath in this pass", id);
        }
        id
    });

    Some(Converted {
        node_id: raw.node_id.clone(),
        parent_id: raw.parent_id.clone(),
        child_ids: raw.child_ids.clone(),
        node: AccessibilityNode {
            role,
            name,
            description: raw.description.as_ref().and_then(AxValue::text).filter(|d| !d.is_empty()),
            value: raw.value.as_ref().and_then(AxValue::text).filter(|v| !v.is_empty()),
            encoded_id,
            children: Vec::new(),
        },
    })
}

fn assemble(
    current: &Converted,
    by_id: &HashMap<&str, &Converted>,
    visiting: &mut HashSet<String>,
) -> Option<AccessibilityNode> {
    if !visiting.insert(current.node_id.clone()) {
        debug!("Accessibility node {} reached twice; skipping", current.node_id);
        return None;
    }

    let children = current
        .child_ids
        .iter()
        .filter_map(|id| by_id.get(id.as_str()))
        .filter_map(|child| assemble(child, by_id, visiting))
        .collect();

    Some(AccessibilityNode {
        children,
        ..current.node.clone()
    })
}

fn normalize_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Drops `StaticText` children whose combined text repeats the parent's name.
fn drop_redundant_text(parent: &AccessibilityNode, children: Vec<AccessibilityNode>) -> Vec<AccessibilityNode> {
    let Some(target) = parent
        .name
        .as_deref()
        .map(normalize_whitespace)
        .filter(|n| !n.is_empty())
    else {
        return children;
    };

    let text_children: Vec<&AccessibilityNode> = children
        .iter()
        .filter(|c| c.role == "StaticText")
        .collect();
    if text_children.is_empty() || text_children.iter().any(|c| !c.children.is_empty()) {
        return children;
    }

    let combined = text_children
        .iter()
        .filter_map(|c| c.name.as_deref())
        .map(normalize_whitespace)
        .collect::<Vec<_>>()
        .join("");

    if combined == target || combined == target.replace(' ', "") {
        children.into_iter().filter(|c| c.role != "StaticText").collect()
    } else {
        children
    }
}

/// Cleans one subtree, returning a new value. `None` means pruned.
pub fn clean_node(node: AccessibilityNode, maps: &BackendIdMaps) -> Option<AccessibilityNode> {
    let mut node = node;
    let cleaned: Vec<AccessibilityNode> = std::mem::take(&mut node.children)
        .into_iter()
        .filter_map(|child| clean_node(child, maps))
        .collect();

    if node.is_structural() {
        match cleaned.len() {
            0 => return None,
            1 => return cleaned.into_iter().next(),
            _ => {
                if let Some(tag) = node.encoded_id.as_ref().and_then(|id| maps.tag_name(id)) {
                    node.role = tag.to_string();
                }
            }
        }
    }

    if node.role == "combobox"
        && node.encoded_id.as_ref().and_then(|id| maps.tag_name(id)) == Some("select")
    {
        node.role = "select".to_string();
    }

    node.children = drop_redundant_text(&node, cleaned);

    if node.is_meaningful() {
        Some(node)
    } else {
        None
    }
}

fn fallback_nodes(
    frame_index: u32,
    maps: &BackendIdMaps,
    present: &HashSet<EncodedId>,
) -> Vec<AccessibilityNode> {
    let mut nodes: Vec<AccessibilityNode> = maps
        .tag_names
        .iter()
        .filter(|(id, _)| id.frame_index == frame_index && !present.contains(id))
        .filter_map(|(id, tag)| {
            let role = FALLBACK_ROLES
                .iter()
                .find(|(t, _)| t.eq_ignore_ascii_case(tag))
                .map(|(_, role)| *role)?;
            let mut node = AccessibilityNode::new(role).with_id(*id);
            node.name = maps.names.get(id).cloned();
            Some(node)
        })
        .collect();
    nodes.sort_by_key(|n| n.encoded_id);
    nodes
}

/// Depth-first text rendering, two spaces of indent per level.
pub fn serialize_tree(roots: &[AccessibilityNode]) -> String {
    let mut lines = Vec::new();
    for root in roots {
        let mut stack = vec![(root, 0usize)];
        while let Some((node, depth)) = stack.pop() {
            lines.push(format!("{}{}", "  ".repeat(depth), node.label()));
            for child in node.children.iter().rev() {
                stack.push((child, depth + 1));
            }
        }
    }
    lines.join("\n")
}

/// Id → node index of a cleaned tree. A repeated id is a builder defect.
pub fn index_tree(roots: &[AccessibilityNode]) -> Result<HashMap<EncodedId, AccessibilityNode>> {
    let mut index = HashMap::new();
    for node in roots.iter().flat_map(|r| r.descendants()) {
        if let Some(id) = node.encoded_id {
            if index.insert(id, node.without_children()).is_some() {
                error!("Encoded id {} produced twice in one frame tree", id);
                return Err(BrowserAgentError::DuplicateEncodedId(id));
            }
        }
    }
    Ok(index)
}

/// Concatenates per-frame results: text joined by blank lines, indexes
/// merged by union. An id present in two frame results is rejected.
pub fn merge_frame_trees(
    trees: &[FrameTree],
) -> Result<(String, HashMap<EncodedId, AccessibilityNode>)> {
    let mut index = HashMap::new();
    let mut sections = Vec::new();

    for tree in trees {
        for (id, node) in tree.index()? {
            if index.insert(id, node).is_some() {
                error!(
                    "Encoded id {} appears in more than one frame result (frame {})",
                    id, tree.frame_index
                );
                return Err(BrowserAgentError::DuplicateEncodedId(id));
            }
        }
        let text = tree.serialize();
        if !text.is_empty() {
            sections.push(text);
        }
    }

    Ok((sections.join("\n\n"), index))
}
