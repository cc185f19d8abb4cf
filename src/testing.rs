//! In-memory stand-ins for a browser and its protocol sessions.
//!
//! `FakeSession` owns a small DOM and answers the protocol commands and
//! injected functions this crate sends: document and accessibility dumps,
//! XPath resolution, input events and network event delivery. Every
//! interaction is appended to a log that tests can inspect.

use crate::core::{BrowserTrait, CdpSession, Config, LiveFrame, NetworkEvent, Subscription};
use crate::errors::{BrowserAgentError, Result};
use crate::utils::javascript::{
    CONTENT_DOCUMENT, DOCUMENT_READY, FOCUS, FOCUS_AND_CLEAR, IS_CHECKED, OVERLAY_CLEAR,
    OVERLAY_SHOW, RESOLVE_XPATH, SCROLLABLE_XPATHS, SCROLL_CHUNK, SCROLL_TO_PERCENT,
    SELECT_OPTION, SET_VALUE, SYNTHETIC_CLICK,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

const DOCUMENT: i64 = 9;
const ELEMENT: i64 = 1;
const TEXT: i64 = 3;
const FRAGMENT: i64 = 11;

/// Every element gets a 10x10 box on the diagonal at `backend * 10`.
const BOX_SIZE: f64 = 10.0;

#[derive(Debug, Clone)]
enum Kind {
    Document,
    Element(String),
    Text(String),
}

/// Declarative page description, turned into a live DOM by `FakeSession::new`.
#[derive(Debug, Clone)]
pub struct FakeNode {
    kind: Kind,
    attrs: Vec<(String, String)>,
    children: Vec<FakeNode>,
    shadow: Option<Vec<FakeNode>>,
    content: Option<Box<FakeNode>>,
    frame_id: Option<String>,
    scroll: Option<(f64, f64)>,
}

impl FakeNode {
    fn of(kind: Kind) -> Self {
        Self {
            kind,
            attrs: Vec::new(),
            children: Vec::new(),
            shadow: None,
            content: None,
            frame_id: None,
            scroll: None,
        }
    }

    pub fn document(children: Vec<FakeNode>) -> Self {
        Self::of(Kind::Document).children(children)
    }

    pub fn element(tag: &str) -> Self {
        Self::of(Kind::Element(tag.to_lowercase()))
    }

    /// Same-origin iframe whose document is part of this session's DOM.
    pub fn iframe(frame_id: &str, src: &str, document: FakeNode) -> Self {
        let mut node = Self::element("iframe").attr("src", src);
        node.frame_id = Some(frame_id.to_string());
        node.content = Some(Box::new(document));
        node
    }

    /// Iframe rendered in another process; its document lives in the session
    /// registered with `FakeBrowser::with_remote`.
    pub fn remote_iframe(frame_id: &str, url: &str) -> Self {
        let mut node = Self::element("iframe").attr("src", url);
        node.frame_id = Some(frame_id.to_string());
        node
    }

    pub fn text(mut self, text: &str) -> Self {
        self.children.push(Self::of(Kind::Text(text.to_string())));
        self
    }

    pub fn attr(mut self, name: &str, value: &str) -> Self {
        self.attrs.push((name.to_string(), value.to_string()));
        self
    }

    pub fn children(mut self, children: Vec<FakeNode>) -> Self {
        self.children.extend(children);
        self
    }

    pub fn shadow(mut self, children: Vec<FakeNode>) -> Self {
        self.shadow = Some(children);
        self
    }

    pub fn scrollable(mut self, scroll_height: f64, client_height: f64) -> Self {
        self.scroll = Some((scroll_height, client_height));
        self
    }
}

#[derive(Debug, Clone)]
struct Node {
    backend: i64,
    node_type: i64,
    tag: String,
    text: String,
    attrs: Vec<(String, String)>,
    parent: Option<i64>,
    children: Vec<i64>,
    shadow_root: Option<i64>,
    content_document: Option<i64>,
    frame_id: Option<String>,
    scroll: Option<(f64, f64)>,
    scroll_top: f64,
    value: Option<String>,
    checked: bool,
}

impl Node {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn is_element(&self) -> bool {
        self.node_type == ELEMENT
    }

    fn scroll_range(&self) -> f64 {
        self.scroll.map(|(full, client)| (full - client).max(0.0)).unwrap_or(0.0)
    }
}

#[derive(Debug, Default)]
struct Dom {
    nodes: HashMap<i64, Node>,
    document: i64,
    focused: Option<i64>,
}

impl Dom {
    fn build(root: &FakeNode) -> Self {
        let mut dom = Dom::default();
        let mut next = 1;
        dom.document = dom.insert(root, None, &mut next);
        dom
    }

    fn insert(&mut self, source: &FakeNode, parent: Option<i64>, next: &mut i64) -> i64 {
        let backend = *next;
        *next += 1;
        let (node_type, tag, text) = match &source.kind {
            Kind::Document => (DOCUMENT, String::new(), String::new()),
            Kind::Element(tag) => (ELEMENT, tag.clone(), String::new()),
            Kind::Text(text) => (TEXT, String::new(), text.clone()),
        };
        self.nodes.insert(
            backend,
            Node {
                backend,
                node_type,
                tag,
                text,
                attrs: source.attrs.clone(),
                parent,
                children: Vec::new(),
                shadow_root: None,
                content_document: None,
                frame_id: source.frame_id.clone(),
                scroll: source.scroll,
                scroll_top: 0.0,
                value: None,
                checked: false,
            },
        );

        let children: Vec<i64> = source
            .children
            .iter()
            .map(|child| self.insert(child, Some(backend), next))
            .collect();

        let shadow_root = source.shadow.as_ref().map(|shadow| {
            let fragment = *next;
            *next += 1;
            let mut node = Node {
                backend: fragment,
                node_type: FRAGMENT,
                tag: String::new(),
                text: String::new(),
                attrs: Vec::new(),
                parent: Some(backend),
                children: Vec::new(),
                shadow_root: None,
                content_document: None,
                frame_id: None,
                scroll: None,
                scroll_top: 0.0,
                value: None,
                checked: false,
            };
            self.nodes.insert(fragment, node.clone());
            node.children = shadow
                .iter()
                .map(|child| self.insert(child, Some(fragment), next))
                .collect();
            self.nodes.insert(fragment, node);
            fragment
        });

        let content_document = source
            .content
            .as_deref()
            .map(|document| self.insert(document, None, next));

        if let Some(node) = self.nodes.get_mut(&backend) {
            node.children = children;
            node.shadow_root = shadow_root;
            node.content_document = content_document;
        }
        backend
    }

    fn node(&self, backend: i64) -> Option<&Node> {
        self.nodes.get(&backend)
    }

    fn node_mut(&mut self, backend: i64) -> Option<&mut Node> {
        self.nodes.get_mut(&backend)
    }

    fn protocol_node(&self, backend: i64) -> Value {
        let Some(node) = self.node(backend) else {
            return Value::Null;
        };
        let node_name = match node.node_type {
            DOCUMENT => "#document".to_string(),
            TEXT => "#text".to_string(),
            FRAGMENT => "#document-fragment".to_string(),
            _ => node.tag.to_uppercase(),
        };
        let attributes: Vec<&str> = node
            .attrs
            .iter()
            .flat_map(|(k, v)| [k.as_str(), v.as_str()])
            .collect();

        let mut out = json!({
            "nodeId": node.backend,
            "backendNodeId": node.backend,
            "nodeType": node.node_type,
            "nodeName": node_name,
            "localName": node.tag,
            "nodeValue": node.text,
            "attributes": attributes,
            "children": node.children.iter().map(|c| self.protocol_node(*c)).collect::<Vec<_>>(),
        });
        if let Some(shadow) = node.shadow_root {
            out["shadowRoots"] = json!([self.protocol_node(shadow)]);
        }
        if let Some(content) = node.content_document {
            out["contentDocument"] = self.protocol_node(content);
        }
        if let Some(frame_id) = &node.frame_id {
            out["frameId"] = json!(frame_id);
        }
        out
    }

    fn text_content(&self, backend: i64) -> String {
        let Some(node) = self.node(backend) else {
            return String::new();
        };
        if node.node_type == TEXT {
            return node.text.clone();
        }
        node.children.iter().map(|c| self.text_content(*c)).collect()
    }

    fn resolve_path(&self, from: i64, path: &str) -> Option<i64> {
        let mut parts = path.split("//");
        let mut current = self.walk(from, parts.next().unwrap_or_default())?;
        for part in parts {
            let shadow = self.node(current)?.shadow_root?;
            current = self.walk(shadow, part)?;
        }
        Some(current)
    }

    fn walk(&self, from: i64, part: &str) -> Option<i64> {
        let mut current = from;
        for step in part.split('/').filter(|s| !s.is_empty()) {
            let (name, index) = match step.rsplit_once('[') {
                Some((name, rest)) => (name, rest.trim_end_matches(']').parse::<usize>().ok()?),
                None => (step, 1),
            };
            let name = name.to_lowercase();
            current = self
                .node(current)?
                .children
                .iter()
                .copied()
                .filter(|c| {
                    self.node(*c).is_some_and(|n| match name.as_str() {
                        "text()" => n.node_type == TEXT,
                        "comment()" => false,
                        tag => n.is_element() && n.tag == tag,
                    })
                })
                .nth(index.checked_sub(1)?)?;
        }
        Some(current)
    }

    fn element_path(&self, backend: i64) -> String {
        let mut steps = Vec::new();
        let mut current = self.node(backend);
        while let Some(node) = current.filter(|n| n.is_element()) {
            let siblings = node
                .parent
                .and_then(|p| self.node(p))
                .map(|p| p.children.clone())
                .unwrap_or_default();
            let position = siblings
                .iter()
                .take_while(|s| **s != node.backend)
                .filter(|s| self.node(**s).is_some_and(|n| n.is_element() && n.tag == node.tag))
                .count()
                + 1;
            steps.push(format!("{}[{}]", node.tag, position));
            current = node.parent.and_then(|p| self.node(p));
        }
        steps.reverse();
        format!("/{}", steps.join("/"))
    }

    /// Elements of one document, not crossing into frames or shadow roots.
    fn document_elements(&self, document: i64) -> Vec<i64> {
        let mut out = Vec::new();
        let mut stack = vec![document];
        while let Some(current) = stack.pop() {
            let Some(node) = self.node(current) else {
                continue;
            };
            if node.is_element() {
                out.push(current);
            }
            stack.extend(node.children.iter().rev());
        }
        out
    }

    fn rect(&self, backend: i64) -> Option<[f64; 4]> {
        self.node(backend)
            .filter(|n| n.is_element())
            .map(|_| [backend as f64 * BOX_SIZE, backend as f64 * BOX_SIZE, BOX_SIZE, BOX_SIZE])
    }

    fn hit_test(&self, x: f64, y: f64) -> Option<i64> {
        let candidate = (x / BOX_SIZE).floor() as i64;
        let [left, top, width, height] = self.rect(candidate)?;
        (x >= left && x < left + width && y >= top && y < top + height).then_some(candidate)
    }

    fn activate(&mut self, backend: i64) {
        if let Some(node) = self.node_mut(backend) {
            let toggles = node.tag == "input"
                && matches!(node.attr("type"), Some("checkbox") | Some("radio"));
            if toggles {
                node.checked = !node.checked;
            }
        }
        self.focused = Some(backend);
    }

    fn ax_role(&self, node: &Node) -> &'static str {
        match node.node_type {
            DOCUMENT => "RootWebArea",
            TEXT => "StaticText",
            _ => match node.tag.as_str() {
                "button" => "button",
                "a" => "link",
                "input" => match node.attr("type") {
                    Some("checkbox") => "checkbox",
                    Some("radio") => "radio",
                    Some("submit") | Some("button") => "button",
                    _ => "textbox",
                },
                "textarea" => "textbox",
                "select" => "combobox",
                "option" => "option",
                "iframe" => "Iframe",
                "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => "heading",
                "ul" | "ol" => "list",
                "li" => "listitem",
                "p" => "paragraph",
                "img" => "image",
                "form" => "form",
                "nav" => "navigation",
                _ => "generic",
            },
        }
    }

    fn ax_name(&self, node: &Node) -> Option<String> {
        let normalized = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ");
        if node.node_type == TEXT {
            return Some(normalized(&node.text)).filter(|t| !t.is_empty());
        }
        for attr in ["aria-label", "placeholder", "title", "alt"] {
            if let Some(value) = node.attr(attr).filter(|v| !v.trim().is_empty()) {
                return Some(value.to_string());
            }
        }
        match node.tag.as_str() {
            "button" | "a" | "option" | "li" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                Some(normalized(&self.text_content(node.backend))).filter(|t| !t.is_empty())
            }
            _ => None,
        }
    }

    /// Flattened accessibility dump of one document.
    fn ax_nodes(&self, document: i64) -> Vec<Value> {
        let mut out = Vec::new();
        let mut stack = vec![(document, None::<i64>)];
        while let Some((current, parent)) = stack.pop() {
            let Some(node) = self.node(current) else {
                continue;
            };
            if node.node_type == TEXT && node.text.trim().is_empty() {
                continue;
            }

            let mut children: Vec<i64> = Vec::new();
            if node.tag != "iframe" {
                children.extend(node.children.iter().copied());
                if let Some(shadow) = node.shadow_root.and_then(|s| self.node(s)) {
                    children.extend(shadow.children.iter().copied());
                }
            }
            children.retain(|c| {
                self.node(*c)
                    .is_some_and(|n| n.node_type != TEXT || !n.text.trim().is_empty())
            });

            let mut ax = json!({
                "nodeId": current.to_string(),
                "ignored": false,
                "role": { "type": "role", "value": self.ax_role(node) },
                "childIds": children.iter().map(|c| c.to_string()).collect::<Vec<_>>(),
                "backendDOMNodeId": current,
            });
            if let Some(name) = self.ax_name(node) {
                ax["name"] = json!({ "type": "computedString", "value": name });
            }
            if let Some(value) = &node.value {
                ax["value"] = json!({ "type": "string", "value": value });
            }
            if let Some(parent) = parent {
                ax["parentId"] = json!(parent.to_string());
            }
            out.push(ax);

            for child in children.iter().rev() {
                stack.push((*child, Some(current)));
            }
        }
        out
    }

    fn document_for_frame(&self, frame_id: &str) -> Option<i64> {
        self.nodes
            .values()
            .find(|n| n.frame_id.as_deref() == Some(frame_id))
            .and_then(|n| n.content_document)
    }

    /// Iframes of this DOM, parent frame id included, in document order.
    fn frames(&self, parent_frame: &str) -> Vec<LiveFrame> {
        let mut out = Vec::new();
        self.collect_frames(self.document, parent_frame, &mut out);
        out
    }

    fn collect_frames(&self, document: i64, parent_frame: &str, out: &mut Vec<LiveFrame>) {
        let mut stack = vec![document];
        while let Some(current) = stack.pop() {
            let Some(node) = self.node(current) else {
                continue;
            };
            if let (Some(frame_id), "iframe") = (&node.frame_id, node.tag.as_str()) {
                out.push(LiveFrame {
                    frame_id: frame_id.clone(),
                    parent_frame_id: Some(parent_frame.to_string()),
                    url: node.attr("src").unwrap_or_default().to_string(),
                    name: node.attr("name").map(str::to_string),
                });
                if let Some(content) = node.content_document {
                    self.collect_frames(content, frame_id, out);
                }
            }
            stack.extend(node.children.iter().rev());
            if let Some(shadow) = node.shadow_root {
                stack.push(shadow);
            }
        }
    }
}

fn object_id(backend: i64) -> String {
    format!("node-{}", backend)
}

fn node_result(backend: Option<i64>) -> Value {
    match backend {
        Some(b) => json!({ "result": { "type": "object", "subtype": "node", "objectId": object_id(b) } }),
        None => json!({ "result": { "type": "object", "subtype": "null", "value": null } }),
    }
}

fn value_result(value: Value) -> Value {
    let kind = match &value {
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        _ => "object",
    };
    json!({ "result": { "type": kind, "value": value } })
}

type Sinks = Arc<Mutex<Vec<(u64, mpsc::UnboundedSender<NetworkEvent>)>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct FakeSession {
    id: String,
    dom: Mutex<Dom>,
    log: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    sinks: Sinks,
    next_subscription: AtomicU64,
}

impl FakeSession {
    pub fn new(id: &str, document: FakeNode) -> Self {
        Self {
            id: id.to_string(),
            dom: Mutex::new(Dom::build(&document)),
            log: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            delays: Mutex::new(HashMap::new()),
            sinks: Arc::new(Mutex::new(Vec::new())),
            next_subscription: AtomicU64::new(0),
        }
    }

    /// Makes every later `send` of `method` fail with a protocol error.
    pub fn fail_method(&self, method: &str) {
        lock(&self.failing).insert(method.to_string());
    }

    /// Makes every later `send` of `method` answer only after `delay`.
    pub fn delay_method(&self, method: &str, delay: Duration) {
        lock(&self.delays).insert(method.to_string(), delay);
    }

    pub fn log(&self) -> Vec<String> {
        lock(&self.log).clone()
    }

    pub fn clear_log(&self) {
        lock(&self.log).clear();
    }

    pub fn backend_id_of(&self, object_id: &str) -> Option<i64> {
        let backend = object_id.strip_prefix("node-")?.parse().ok()?;
        lock(&self.dom).node(backend).map(|n| n.backend)
    }

    pub fn backend_id_by_attr(&self, name: &str, value: &str) -> Option<i64> {
        let dom = lock(&self.dom);
        let mut ids: Vec<i64> = dom
            .nodes
            .values()
            .filter(|n| n.attr(name) == Some(value))
            .map(|n| n.backend)
            .collect();
        ids.sort();
        ids.first().copied()
    }

    pub fn value_of(&self, backend: i64) -> Option<String> {
        lock(&self.dom).node(backend).and_then(|n| n.value.clone())
    }

    pub fn emit(&self, event: NetworkEvent) {
        for (_, sink) in lock(&self.sinks).iter() {
            let _ = sink.send(event.clone());
        }
    }

    pub fn active_subscriptions(&self) -> usize {
        lock(&self.sinks).len()
    }

    fn record(&self, entry: String) {
        lock(&self.log).push(entry);
    }

    fn live_frames(&self, parent_frame: &str) -> Vec<LiveFrame> {
        lock(&self.dom).frames(parent_frame)
    }

    fn target(&self, params: &Value) -> Result<i64> {
        let dom = lock(&self.dom);
        let backend = match (params.get("objectId"), params.get("backendNodeId")) {
            (Some(object), _) => object
                .as_str()
                .and_then(|o| o.strip_prefix("node-"))
                .and_then(|b| b.parse::<i64>().ok()),
            (None, Some(backend)) => backend.as_i64(),
            _ => None,
        };
        backend
            .filter(|b| dom.node(*b).is_some())
            .ok_or_else(|| BrowserAgentError::Protocol("Could not find node with given id".into()))
    }

    fn evaluate_expression(&self, expression: &str) -> Result<Value> {
        if expression == "document" {
            let document = lock(&self.dom).document;
            return Ok(node_result(Some(document)));
        }
        if expression.starts_with(&format!("({})(", OVERLAY_SHOW)) {
            self.record("overlay:show".into());
            return Ok(value_result(json!(0)));
        }
        if expression == OVERLAY_CLEAR {
            self.record("overlay:clear".into());
            return Ok(value_result(json!(true)));
        }
        Ok(json!({
            "result": { "type": "undefined" },
            "exceptionDetails": { "text": format!("fake cannot evaluate {:?}", expression) }
        }))
    }

    fn call_function(&self, target: i64, declaration: &str, args: &[Value]) -> Result<Value> {
        let arg = |i: usize| args.get(i).cloned().unwrap_or(Value::Null);
        let mut dom = lock(&self.dom);

        if declaration == RESOLVE_XPATH {
            let path = arg(0).as_str().unwrap_or_default().to_string();
            return Ok(node_result(dom.resolve_path(target, &path)));
        }
        if declaration == CONTENT_DOCUMENT {
            drop(dom);
            self.record(format!("contentDocument:{}", target));
            let content = lock(&self.dom).node(target).and_then(|n| n.content_document);
            return Ok(node_result(content));
        }
        if declaration == DOCUMENT_READY {
            return Ok(value_result(json!(true)));
        }
        if declaration == SCROLLABLE_XPATHS {
            let paths: Vec<String> = dom
                .document_elements(target)
                .into_iter()
                .filter(|b| dom.node(*b).is_some_and(|n| n.scroll_range() > 0.0))
                .map(|b| dom.element_path(b))
                .collect();
            return Ok(value_result(json!(paths)));
        }
        if declaration == SYNTHETIC_CLICK {
            dom.activate(target);
            drop(dom);
            self.record(format!("synthetic_click:{}", target));
            return Ok(value_result(json!(true)));
        }
        if declaration == FOCUS {
            dom.focused = Some(target);
            return Ok(value_result(json!(true)));
        }
        if declaration == FOCUS_AND_CLEAR {
            dom.focused = Some(target);
            if let Some(node) = dom.node_mut(target) {
                node.value = Some(String::new());
            }
            return Ok(value_result(json!(true)));
        }
        if declaration == SET_VALUE {
            let text = arg(0).as_str().unwrap_or_default().to_string();
            if let Some(node) = dom.node_mut(target) {
                node.value = Some(text);
            }
            return Ok(value_result(json!(true)));
        }
        if declaration == IS_CHECKED {
            let checked = dom
                .node(target)
                .is_some_and(|n| n.checked || n.attr("aria-checked") == Some("true"));
            return Ok(value_result(json!(checked)));
        }
        if declaration == SELECT_OPTION {
            let wanted = arg(0).as_str().unwrap_or_default().trim().to_string();
            if dom.node(target).map(|n| n.tag.as_str()) != Some("select") {
                return Ok(value_result(json!({ "ok": false, "reason": "element is not a <select>" })));
            }
            let chosen = dom
                .document_elements(target)
                .into_iter()
                .filter_map(|b| dom.node(b))
                .filter(|n| n.tag == "option")
                .find(|n| {
                    n.attr("value") == Some(wanted.as_str())
                        || dom.text_content(n.backend).trim() == wanted
                        || n.attr("label") == Some(wanted.as_str())
                })
                .map(|n| {
                    n.attr("value")
                        .map(str::to_string)
                        .unwrap_or_else(|| dom.text_content(n.backend).trim().to_string())
                });
            return Ok(value_result(match chosen {
                Some(value) => {
                    if let Some(node) = dom.node_mut(target) {
                        node.value = Some(value.clone());
                    }
                    json!({ "ok": true, "value": value })
                }
                None => json!({ "ok": false, "reason": format!("no option matching {}", wanted) }),
            }));
        }
        if declaration == SCROLL_TO_PERCENT {
            let percent = arg(0).as_f64().unwrap_or(0.0);
            let Some(node) = dom.node_mut(target) else {
                return Ok(value_result(Value::Null));
            };
            let range = node.scroll_range();
            if range <= 0.0 || node.tag == "iframe" {
                return Ok(value_result(json!({ "scrolled": false, "top": node.scroll_top })));
            }
            node.scroll_top = range * percent / 100.0;
            return Ok(value_result(json!({ "scrolled": true, "top": node.scroll_top })));
        }
        if declaration == SCROLL_CHUNK {
            let direction = arg(0).as_f64().unwrap_or(1.0);
            let Some(node) = dom.node_mut(target) else {
                return Ok(value_result(Value::Null));
            };
            let viewport = node.scroll.map(|(_, client)| client).unwrap_or(0.0);
            node.scroll_top = (node.scroll_top + direction * viewport).clamp(0.0, node.scroll_range());
            return Ok(value_result(json!({ "top": node.scroll_top, "frames": 2 })));
        }

        Ok(json!({
            "result": { "type": "undefined" },
            "exceptionDetails": { "text": "fake cannot run this function" }
        }))
    }

    fn dispatch_mouse(&self, params: &Value) -> Value {
        let kind = params.get("type").and_then(Value::as_str).unwrap_or_default();
        let x = params.get("x").and_then(Value::as_f64).unwrap_or(-1.0);
        let y = params.get("y").and_then(Value::as_f64).unwrap_or(-1.0);

        let mut dom = lock(&self.dom);
        let hit = dom.hit_test(x, y);
        if let (Some(backend), "mouseReleased") = (hit, kind) {
            dom.activate(backend);
        }
        drop(dom);

        let target = hit.map(|b| b.to_string()).unwrap_or_else(|| "none".into());
        self.record(format!("mouse:{}:{}", kind, target));
        json!({})
    }
}

#[async_trait]
impl CdpSession for FakeSession {
    fn session_id(&self) -> &str {
        &self.id
    }

    async fn send(&self, method: &str, params: Value) -> Result<Value> {
        let delay = lock(&self.delays).get(method).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if lock(&self.failing).contains(method) {
            return Err(BrowserAgentError::Protocol(format!("{} failed", method)));
        }

        match method {
            "DOM.getDocument" => {
                let dom = lock(&self.dom);
                Ok(json!({ "root": dom.protocol_node(dom.document) }))
            }
            "Accessibility.getFullAXTree" => {
                let dom = lock(&self.dom);
                let document = match params.get("frameId").and_then(Value::as_str) {
                    Some(frame_id) => dom.document_for_frame(frame_id).ok_or_else(|| {
                        BrowserAgentError::Protocol(format!("No frame for given id {}", frame_id))
                    })?,
                    None => dom.document,
                };
                Ok(json!({ "nodes": dom.ax_nodes(document) }))
            }
            "DOM.describeNode" => {
                let target = self.target(&params)?;
                let dom = lock(&self.dom);
                let node = dom.node(target).map(|n| {
                    json!({
                        "backendNodeId": n.backend,
                        "nodeType": n.node_type,
                        "nodeName": n.tag.to_uppercase(),
                        "frameId": n.frame_id,
                    })
                });
                Ok(json!({ "node": node }))
            }
            "DOM.getContentQuads" => {
                let target = self.target(&params)?;
                let quads = match lock(&self.dom).rect(target) {
                    Some([x, y, w, h]) => vec![vec![x, y, x + w, y, x + w, y + h, x, y + h]],
                    None => vec![],
                };
                Ok(json!({ "quads": quads }))
            }
            "DOM.scrollIntoViewIfNeeded" => {
                self.target(&params)?;
                Ok(json!({}))
            }
            "Runtime.evaluate" => {
                let expression = params.get("expression").and_then(Value::as_str).unwrap_or_default();
                self.evaluate_expression(expression)
            }
            "Runtime.callFunctionOn" => {
                let target = self.target(&params)?;
                let declaration = params
                    .get("functionDeclaration")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let args: Vec<Value> = params
                    .get("arguments")
                    .and_then(Value::as_array)
                    .map(|a| a.iter().map(|v| v.get("value").cloned().unwrap_or(Value::Null)).collect())
                    .unwrap_or_default();
                self.call_function(target, declaration, &args)
            }
            "Input.dispatchMouseEvent" => Ok(self.dispatch_mouse(&params)),
            "Input.insertText" => {
                let text = params.get("text").and_then(Value::as_str).unwrap_or_default();
                {
                    let mut dom = lock(&self.dom);
                    let focused = dom.focused;
                    if let Some(node) = focused.and_then(|f| dom.node_mut(f)) {
                        node.value.get_or_insert_with(String::new).push_str(text);
                    }
                }
                self.record(format!("insertText:{}", text));
                Ok(json!({}))
            }
            "Input.dispatchKeyEvent" => {
                let kind = params.get("type").and_then(Value::as_str).unwrap_or_default();
                let key = params.get("key").and_then(Value::as_str).unwrap_or_default();
                self.record(format!("key:{}:{}", kind, key));
                Ok(json!({}))
            }
            "Runtime.releaseObject" | "Network.enable" | "Page.enable" | "DOM.enable"
            | "Accessibility.enable" => Ok(json!({})),
            other => Err(BrowserAgentError::Protocol(format!("fake does not implement {}", other))),
        }
    }

    async fn subscribe_network(
        &self,
        sink: mpsc::UnboundedSender<NetworkEvent>,
    ) -> Result<Subscription> {
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        lock(&self.sinks).push((id, sink));
        let sinks = self.sinks.clone();
        Ok(Subscription::new(move || {
            lock(&sinks).retain(|(sub, _)| *sub != id);
        }))
    }
}

/// A browser with one tab, a root session and any number of out-of-process
/// frames, each backed by its own `FakeSession`.
pub struct FakeBrowser {
    root: Arc<FakeSession>,
    remotes: Vec<(String, String, Arc<FakeSession>)>,
    attach_attempts: Mutex<Vec<String>>,
    url: Mutex<String>,
}

impl FakeBrowser {
    pub fn new(root: FakeSession) -> Self {
        Self {
            root: Arc::new(root),
            remotes: Vec::new(),
            attach_attempts: Mutex::new(Vec::new()),
            url: Mutex::new("https://fake.test/".to_string()),
        }
    }

    /// Registers `session` as the out-of-process document of `frame_id`.
    pub fn with_remote(mut self, frame_id: &str, url: &str, session: FakeSession) -> Self {
        self.remotes
            .push((frame_id.to_string(), url.to_string(), Arc::new(session)));
        self
    }

    pub fn root(&self) -> &FakeSession {
        &self.root
    }

    pub fn root_handle(&self) -> Arc<FakeSession> {
        self.root.clone()
    }

    pub fn remote_handle(&self, frame_id: &str) -> Option<Arc<FakeSession>> {
        self.remotes
            .iter()
            .find(|(id, _, _)| id == frame_id)
            .map(|(_, _, session)| session.clone())
    }

    /// Frame ids `attach_frame` was called with, in call order.
    pub fn attach_attempts(&self) -> Vec<String> {
        lock(&self.attach_attempts).clone()
    }

    pub fn current_url(&self) -> String {
        lock(&self.url).clone()
    }

    pub fn set_url(&self, url: &str) {
        *lock(&self.url) = url.to_string();
    }
}

#[async_trait]
impl BrowserTrait for FakeBrowser {
    type TabHandle = ();

    async fn launch(&mut self, _config: &Config) -> Result<()> {
        Ok(())
    }

    async fn new_tab(&self) -> Result<Self::TabHandle> {
        Ok(())
    }

    async fn navigate(&self, _tab: &Self::TabHandle, url: &str) -> Result<()> {
        self.set_url(url);
        Ok(())
    }

    async fn take_screenshot(&self, _tab: &Self::TabHandle) -> Result<Vec<u8>> {
        Ok(b"\x89PNG fake".to_vec())
    }

    async fn get_url(&self, _tab: &Self::TabHandle) -> Result<String> {
        Ok(self.current_url())
    }

    async fn page_session(&self, _tab: &Self::TabHandle) -> Result<Arc<dyn CdpSession>> {
        Ok(self.root.clone())
    }

    async fn live_frames(&self, _tab: &Self::TabHandle) -> Result<Vec<LiveFrame>> {
        let mut frames = vec![LiveFrame {
            frame_id: "main".to_string(),
            parent_frame_id: None,
            url: self.current_url(),
            name: None,
        }];
        frames.extend(self.root.live_frames("main"));
        for (frame_id, _, session) in &self.remotes {
            frames.extend(session.live_frames(frame_id));
        }
        Ok(frames)
    }

    async fn attach_frame(
        &self,
        _tab: &Self::TabHandle,
        frame: &LiveFrame,
    ) -> Result<Arc<dyn CdpSession>> {
        lock(&self.attach_attempts).push(frame.frame_id.clone());
        match self.remote_handle(&frame.frame_id) {
            Some(session) => Ok(session),
            None => Err(BrowserAgentError::NotAttachable(frame.frame_id.clone())),
        }
    }

    fn is_running(&self) -> bool {
        true
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FakeSession {
        FakeSession::new(
            "root",
            FakeNode::document(vec![FakeNode::element("html").children(vec![
                FakeNode::element("body").children(vec![
                    FakeNode::element("p").text("one"),
                    FakeNode::element("p").text("two"),
                    FakeNode::element("x-card").shadow(vec![FakeNode::element("span").text("inner")]),
                ]),
            ])]),
        )
    }

    #[test]
    fn test_backend_ids_are_preorder() {
        let session = sample();
        let dom = lock(&session.dom);
        assert_eq!(dom.document, 1);
        assert_eq!(dom.node(2).unwrap().tag, "html");
        assert_eq!(dom.node(3).unwrap().tag, "body");
        assert_eq!(dom.node(4).unwrap().tag, "p");
    }

    #[test]
    fn test_path_resolution_matches_positional_xpaths() {
        let session = sample();
        let dom = lock(&session.dom);
        let second = dom.resolve_path(dom.document, "/html[1]/body[1]/p[2]").unwrap();
        assert_eq!(dom.text_content(second), "two");
        assert_eq!(dom.element_path(second), "/html[1]/body[1]/p[2]");

        let inner = dom.resolve_path(dom.document, "/html[1]/body[1]/x-card[1]//span[1]").unwrap();
        assert_eq!(dom.text_content(inner), "inner");
        assert!(dom.resolve_path(dom.document, "/html[1]/body[1]/p[3]").is_none());
        assert_eq!(dom.resolve_path(dom.document, "/"), Some(dom.document));
    }

    #[tokio::test]
    async fn test_injected_failures_and_log() {
        let session = sample();
        session.fail_method("DOM.getDocument");
        assert!(session.send("DOM.getDocument", json!({})).await.is_err());

        session
            .send("Input.dispatchKeyEvent", json!({ "type": "keyDown", "key": "a" }))
            .await
            .unwrap();
        assert_eq!(session.log(), vec!["key:keyDown:a"]);
        session.clear_log();
        assert!(session.log().is_empty());
    }
}
