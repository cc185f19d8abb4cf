use crate::types::EncodedId;
use serde::{Deserialize, Serialize};

/// Roles a user can act on directly. Nodes with these roles survive cleaning
/// even without a name or children.
pub const INTERACTIVE_ROLES: &[&str] = &[
    "button",
    "link",
    "textbox",
    "searchbox",
    "combobox",
    "listbox",
    "menuitem",
    "menuitemcheckbox",
    "menuitemradio",
    "option",
    "radio",
    "checkbox",
    "switch",
    "slider",
    "spinbutton",
    "tab",
    "treeitem",
    "gridcell",
    "columnheader",
    "rowheader",
    "select",
];

/// Wrapper roles that carry no meaning of their own.
pub const STRUCTURAL_ROLES: &[&str] = &["generic", "none"];

pub fn is_interactive_role(role: &str) -> bool {
    INTERACTIVE_ROLES.iter().any(|r| r.eq_ignore_ascii_case(role))
}

pub fn is_structural_role(role: &str) -> bool {
    STRUCTURAL_ROLES.contains(&role)
}

/// One node of the cleaned accessibility tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessibilityNode {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoded_id: Option<EncodedId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<AccessibilityNode>,
}

impl AccessibilityNode {
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            name: None,
            description: None,
            value: None,
            encoded_id: None,
            children: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_id(mut self, id: EncodedId) -> Self {
        self.encoded_id = Some(id);
        self
    }

    pub fn with_children(mut self, children: Vec<AccessibilityNode>) -> Self {
        self.children = children;
        self
    }

    pub fn has_name(&self) -> bool {
        self.name
            .as_deref()
            .map(|n| !n.trim().is_empty())
            .unwrap_or(false)
    }

    pub fn is_interactive(&self) -> bool {
        is_interactive_role(&self.role)
    }

    pub fn is_structural(&self) -> bool {
        is_structural_role(&self.role)
    }

    /// Named, has children, or can be acted on.
    pub fn is_meaningful(&self) -> bool {
        self.has_name() || !self.children.is_empty() || self.is_interactive()
    }

    /// Copy of this node with its subtree dropped, as stored in the id index.
    pub fn without_children(&self) -> Self {
        Self {
            children: Vec::new(),
            ..self.clone()
        }
    }

    /// Pre-order traversal of this node and its descendants.
    pub fn descendants(&self) -> Vec<&AccessibilityNode> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            out.push(node);
            stack.extend(node.children.iter().rev());
        }
        out
    }

    /// `"[id] role: name"`; nodes without an id drop the bracket.
    pub fn label(&self) -> String {
        let mut line = String::new();
        if let Some(id) = &self.encoded_id {
            line.push_str(&format!("[{}] ", id));
        }
        line.push_str(&self.role);
        if let Some(name) = self.name.as_deref().filter(|n| !n.trim().is_empty()) {
            line.push_str(": ");
            line.push_str(name);
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_format() {
        let node = AccessibilityNode::new("button")
            .with_name("Submit")
            .with_id(EncodedId::new(1, 12));
        assert_eq!(node.label(), "[1-12] button: Submit");
        assert_eq!(AccessibilityNode::new("list").label(), "list");
    }

    #[test]
    fn test_meaningful_nodes() {
        assert!(AccessibilityNode::new("button").is_meaningful());
        assert!(AccessibilityNode::new("paragraph").with_name("hi").is_meaningful());
        assert!(!AccessibilityNode::new("paragraph").with_name("  ").is_meaningful());
        assert!(!AccessibilityNode::new("generic").is_meaningful());
    }

    #[test]
    fn test_descendants_are_pre_order() {
        let tree = AccessibilityNode::new("main").with_children(vec![
            AccessibilityNode::new("a").with_children(vec![AccessibilityNode::new("a1")]),
            AccessibilityNode::new("b"),
        ]);
        let roles: Vec<&str> = tree.descendants().iter().map(|n| n.role.as_str()).collect();
        assert_eq!(roles, vec!["main", "a", "a1", "b"]);
    }
}
