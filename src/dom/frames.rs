//! Frame graph discovery.
//!
//! Same-origin frames come out of the DOM walk of their parent document.
//! Out-of-process frames are found by asking the driver to attach every live
//! frame it reports as an independent session, in parent-to-child waves.
//!
//! Index assignment is deterministic: within a wave frames are numbered in
//! parent order, and the documents of newly attached frames are fetched
//! concurrently but walked one after another in that same order.

use crate::core::{BrowserTrait, LiveFrame, SessionHandle};
use crate::dom::backend_map::{build_backend_maps, fetch_or_log, walk_document, BackendIdMaps, FrameWalk};
use crate::errors::{BrowserAgentError, Result};
use crate::utils::javascript::{CONTENT_DOCUMENT, RESOLVE_XPATH};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info, warn};

pub const ROOT_FRAME_INDEX: u32 = 0;

/// Per-pass discovery state threaded through every walk.
#[derive(Debug)]
pub struct DiscoveryContext {
    next_index: AtomicU32,
}

impl DiscoveryContext {
    pub fn new() -> Self {
        Self {
            next_index: AtomicU32::new(ROOT_FRAME_INDEX + 1),
        }
    }

    pub fn next_frame_index(&self) -> u32 {
        self.next_index.fetch_add(1, Ordering::SeqCst)
    }

}

impl Default for DiscoveryContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameInfo {
    pub frame_index: u32,
    pub parent_frame_index: Option<u32>,
    pub src: Option<String>,
    pub name: Option<String>,
    /// XPath of the owning `<iframe>` in the parent document; empty for
    /// out-of-process frames.
    pub xpath: String,
    pub content_document_backend_id: Option<i64>,
    /// Protocol frame id, when the walk or the driver reported one.
    pub frame_id: Option<String>,
    /// Live session bound to this frame (root and out-of-process frames).
    #[serde(skip)]
    pub session: Option<SessionHandle>,
    pub path: Vec<String>,
}

impl FrameInfo {
    pub fn root(session: SessionHandle, frame_id: Option<String>, url: Option<String>) -> Self {
        Self {
            frame_index: ROOT_FRAME_INDEX,
            parent_frame_index: None,
            src: url,
            name: None,
            xpath: String::new(),
            content_document_backend_id: None,
            frame_id,
            session: Some(session),
            path: Vec::new(),
        }
    }

    pub fn is_out_of_process(&self) -> bool {
        self.parent_frame_index.is_some() && self.session.is_some()
    }

    pub fn label(&self) -> String {
        if self.frame_index == ROOT_FRAME_INDEX {
            return "root".to_string();
        }
        self.name
            .clone()
            .or_else(|| self.src.clone().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| format!("frame-{}", self.frame_index))
    }

    /// Compact description attached to resolution errors.
    pub fn metadata(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("frame {}", self.frame_index))
    }
}

pub type FrameMap = BTreeMap<u32, FrameInfo>;

/// Returns a copy of `frames` with every path filled in, root label first.
/// Parent cycles are logged and cut at the first repeated frame.
pub fn build_frame_paths(frames: &FrameMap) -> FrameMap {
    frames
        .iter()
        .map(|(index, frame)| {
            let mut path = Vec::new();
            let mut seen = HashSet::new();
            let mut current = Some(frame);

            while let Some(f) = current {
                if !seen.insert(f.frame_index) {
                    warn!(
                        "Circular parent reference while building path of frame {} (at frame {})",
                        index, f.frame_index
                    );
                    break;
                }
                path.push(f.label());
                current = f.parent_frame_index.and_then(|p| frames.get(&p));
            }
            path.reverse();

            (
                *index,
                FrameInfo {
                    path,
                    ..frame.clone()
                },
            )
        })
        .collect()
}

/// Output of a full discovery pass.
#[derive(Debug, Default)]
pub struct FrameDiscovery {
    pub frames: FrameMap,
    pub maps: BackendIdMaps,
}

impl FrameDiscovery {
    fn absorb(&mut self, walk: FrameWalk) {
        self.maps.merge(walk.maps);
        for child in walk.child_frames {
            self.frames.insert(child.frame_index, child);
        }
    }
}

/// Builds the frame map and identity maps of the page behind `tab`.
pub async fn discover_frames<B: BrowserTrait>(
    browser: &B,
    tab: &B::TabHandle,
    root: SessionHandle,
    ctx: &DiscoveryContext,
) -> FrameDiscovery {
    let live = match browser.live_frames(tab).await {
        Ok(frames) => frames,
        Err(e) => {
            warn!("Could not list live frames, using DOM walk only: {}", e);
            Vec::new()
        }
    };

    let main = live.iter().find(|f| f.is_main_frame());
    let mut discovery = FrameDiscovery::default();
    discovery.frames.insert(
        ROOT_FRAME_INDEX,
        FrameInfo::root(
            root.clone(),
            main.map(|f| f.frame_id.clone()),
            main.map(|f| f.url.clone()),
        ),
    );
    let root_walk = build_backend_maps(&root, ROOT_FRAME_INDEX, ctx).await;
    discovery.absorb(root_walk);

    let mut known: HashMap<String, u32> = HashMap::new();
    if let Some(main) = main {
        known.insert(main.frame_id.clone(), ROOT_FRAME_INDEX);
    }
    let mut pending: Vec<LiveFrame> = live.into_iter().filter(|f| !f.is_main_frame()).collect();
    let mut wave_number = 0;

    loop {
        let (mut wave, rest): (Vec<LiveFrame>, Vec<LiveFrame>) = pending
            .into_iter()
            .partition(|f| f.parent_frame_id.as_ref().is_some_and(|p| known.contains_key(p)));
        pending = rest;
        if wave.is_empty() {
            break;
        }
        // Stable: siblings keep the driver's document order.
        wave.sort_by_key(|f| f.parent_frame_id.as_ref().and_then(|p| known.get(p).copied()));
        wave_number += 1;
        debug!("Frame discovery wave {}: {} frames", wave_number, wave.len());

        let attachments = join_all(wave.iter().map(|frame| browser.attach_frame(tab, frame))).await;

        let mut attached = Vec::new();
        for (frame, attachment) in wave.iter().zip(attachments) {
            let Some(parent_index) = frame.parent_frame_id.as_ref().and_then(|p| known.get(p).copied())
            else {
                continue;
            };

            match attachment {
                Ok(session) => {
                    let frame_index = ctx.next_frame_index();
                    debug!(
                        "Out-of-process frame {} -> index {} (parent {})",
                        frame.frame_id, frame_index, parent_index
                    );
                    let session = SessionHandle::new(session);
                    discovery.frames.insert(
                        frame_index,
                        FrameInfo {
                            frame_index,
                            parent_frame_index: Some(parent_index),
                            src: Some(frame.url.clone()),
                            name: frame.name.clone(),
                            xpath: String::new(),
                            content_document_backend_id: None,
                            frame_id: Some(frame.frame_id.clone()),
                            session: Some(session.clone()),
                            path: Vec::new(),
                        },
                    );
                    known.insert(frame.frame_id.clone(), frame_index);
                    attached.push((frame_index, session));
                }
                Err(e) => {
                    if !matches!(e, BrowserAgentError::NotAttachable(_)) {
                        warn!("Attaching frame {} failed: {}", frame.frame_id, e);
                    }
                    match match_live_frame(&discovery.frames, frame, parent_index).await {
                        Some(index) => {
                            if let Some(info) = discovery.frames.get_mut(&index) {
                                info.frame_id.get_or_insert_with(|| frame.frame_id.clone());
                            }
                            known.insert(frame.frame_id.clone(), index);
                        }
                        None => debug!(
                            "Live frame {} has no walked counterpart; left to lazy resolution",
                            frame.frame_id
                        ),
                    }
                }
            }
        }

        let documents = join_all(
            attached
                .iter()
                .map(|(index, session)| fetch_or_log(session, *index)),
        )
        .await;
        for ((index, _), document) in attached.iter().zip(documents) {
            if let Some(document) = document {
                discovery.absorb(walk_document(&document, *index, ctx));
            }
        }
    }

    for frame in &pending {
        debug!(
            "Live frame {} unreachable: parent {:?} was never indexed",
            frame.frame_id, frame.parent_frame_id
        );
    }

    discovery.frames = build_frame_paths(&discovery.frames);
    info!(
        "Discovered {} frames ({} out-of-process), {} addressable nodes",
        discovery.frames.len(),
        discovery.frames.values().filter(|f| f.is_out_of_process()).count(),
        discovery.maps.xpaths.len()
    );
    discovery
}

fn src_matches(src: &str, url: &str) -> bool {
    let src = src.trim();
    if src.is_empty() {
        return false;
    }
    if src == url {
        return true;
    }
    let relative = src.trim_start_matches("./").trim_start_matches('/');
    match url::Url::parse(url) {
        Ok(parsed) => {
            let tail = match parsed.query() {
                Some(q) => format!("{}?{}", parsed.path(), q),
                None => parsed.path().to_string(),
            };
            !relative.is_empty() && tail.ends_with(relative)
        }
        Err(_) => false,
    }
}

/// Pairs a same-origin live frame with the `FrameInfo` its parent's walk
/// produced: protocol frame id, then `src`, then `name`, then by resolving
/// each candidate's iframe XPath and comparing the element's frame id.
async fn match_live_frame(frames: &FrameMap, live: &LiveFrame, parent_index: u32) -> Option<u32> {
    if let Some(found) = frames.values().find(|f| {
        f.parent_frame_index == Some(parent_index) && f.frame_id.as_deref() == Some(live.frame_id.as_str())
    }) {
        return Some(found.frame_index);
    }

    let candidates: Vec<&FrameInfo> = frames
        .values()
        .filter(|f| f.parent_frame_index == Some(parent_index))
        .filter(|f| f.session.is_none() && f.frame_id.is_none())
        .collect();

    let by_src: Vec<&FrameInfo> = candidates
        .iter()
        .copied()
        .filter(|f| f.src.as_deref().is_some_and(|s| src_matches(s, &live.url)))
        .collect();
    if by_src.len() == 1 {
        return Some(by_src[0].frame_index);
    }

    let pool = if by_src.is_empty() { candidates } else { by_src };
    let by_name: Vec<&FrameInfo> = pool
        .iter()
        .copied()
        .filter(|f| f.name.is_some() && f.name == live.name)
        .collect();
    if by_name.len() == 1 {
        return Some(by_name[0].frame_index);
    }

    let pool = if by_name.is_empty() { pool } else { by_name };
    for candidate in pool {
        match owner_frame_id(frames, candidate).await {
            Ok(Some(id)) if id == live.frame_id => return Some(candidate.frame_index),
            Ok(_) => {}
            Err(e) => debug!(
                "XPath verification of frame {} failed: {}",
                candidate.frame_index, e
            ),
        }
    }
    None
}

/// Protocol frame id of the element that owns `frame` in its parent document.
async fn owner_frame_id(frames: &FrameMap, frame: &FrameInfo) -> Result<Option<String>> {
    let parent = frame
        .parent_frame_index
        .ok_or(BrowserAgentError::FrameNotFound(frame.frame_index))?;
    let document = frame_document(frames, parent).await?;
    let element = document
        .session
        .call_function_on(&document.object_id, RESOLVE_XPATH, vec![json!(frame.xpath)], false)
        .await;
    document.release().await;

    let element = element?;
    let Some(object_id) = element.handle() else {
        return Ok(None);
    };
    let described = document
        .session
        .send("DOM.describeNode", json!({ "objectId": object_id }))
        .await;
    document.session.release_object(object_id).await;

    Ok(described?
        .get("node")
        .and_then(|n| n.get("frameId"))
        .and_then(|v| v.as_str())
        .map(str::to_string))
}

/// Session whose backend node ids cover `frame_index`: the frame's own, or
/// that of its nearest ancestor with one.
pub fn owning_session(frames: &FrameMap, frame_index: u32) -> Option<SessionHandle> {
    let mut seen = HashSet::new();
    let mut current = frames.get(&frame_index)?;
    loop {
        if let Some(session) = &current.session {
            return Some(session.clone());
        }
        if !seen.insert(current.frame_index) {
            return None;
        }
        current = frames.get(&current.parent_frame_index?)?;
    }
}

/// A remote handle to a frame's document and the session it lives in.
#[derive(Debug, Clone)]
pub struct FrameDocument {
    pub frame_index: u32,
    pub session: SessionHandle,
    pub object_id: String,
}

impl FrameDocument {
    pub async fn release(&self) {
        self.session.release_object(&self.object_id).await;
    }
}

/// Resolves the document of `frame_index`.
///
/// Frames with a bound session are used directly. Otherwise the ancestor
/// chain is climbed to the nearest frame that has one, and each iframe XPath
/// below it is evaluated in turn, descending through `contentDocument`.
pub async fn frame_document(frames: &FrameMap, frame_index: u32) -> Result<FrameDocument> {
    let target = frames
        .get(&frame_index)
        .ok_or(BrowserAgentError::FrameNotFound(frame_index))?;
    let failed = |reason: String| BrowserAgentError::FrameResolutionFailed {
        frame_index,
        reason,
        metadata: target.metadata(),
    };

    let mut descent = Vec::new();
    let mut seen = HashSet::new();
    let mut current = target;
    let session = loop {
        if let Some(session) = &current.session {
            break session.clone();
        }
        if !seen.insert(current.frame_index) {
            return Err(failed(format!(
                "circular parent chain at frame {}",
                current.frame_index
            )));
        }
        descent.push(current);
        let parent = current.parent_frame_index.ok_or_else(|| {
            failed(format!(
                "frame {} has no ancestor with a live session",
                current.frame_index
            ))
        })?;
        current = frames
            .get(&parent)
            .ok_or(BrowserAgentError::FrameNotFound(parent))?;
    };

    let document = session.evaluate("document", false).await?;
    let mut object_id = document
        .handle()
        .map(str::to_string)
        .ok_or_else(|| failed("anchor document unavailable".to_string()))?;

    for frame in descent.into_iter().rev() {
        let owner = session
            .call_function_on(&object_id, RESOLVE_XPATH, vec![json!(frame.xpath)], false)
            .await;
        session.release_object(&object_id).await;
        let owner = owner?;
        let owner_id = owner.handle().map(str::to_string).ok_or_else(|| {
            failed(format!(
                "iframe of frame {} not found at {}",
                frame.frame_index, frame.xpath
            ))
        })?;

        let content = session
            .call_function_on(&owner_id, CONTENT_DOCUMENT, vec![], false)
            .await;
        session.release_object(&owner_id).await;
        object_id = content?.handle().map(str::to_string).ok_or_else(|| {
            failed(format!(
                "frame {} has no accessible content document",
                frame.frame_index
            ))
        })?;
    }

    Ok(FrameDocument {
        frame_index,
        session,
        object_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::BrowserTrait;
    use crate::testing::{FakeBrowser, FakeNode, FakeSession};

    fn frame(index: u32, parent: Option<u32>, name: Option<&str>) -> FrameInfo {
        FrameInfo {
            frame_index: index,
            parent_frame_index: parent,
            src: None,
            name: name.map(str::to_string),
            xpath: String::new(),
            content_document_backend_id: None,
            frame_id: None,
            session: None,
            path: Vec::new(),
        }
    }

    #[test]
    fn test_paths_follow_parent_chain() {
        let mut frames = FrameMap::new();
        frames.insert(0, frame(0, None, None));
        frames.insert(1, frame(1, Some(0), Some("outer")));
        frames.insert(2, frame(2, Some(1), None));

        let built = build_frame_paths(&frames);
        assert_eq!(built[&2].path, vec!["root", "outer", "frame-2"]);
        assert_eq!(built[&0].path, vec!["root"]);
        assert!(frames[&2].path.is_empty(), "input is left untouched");
    }

    #[test]
    fn test_paths_survive_cycles() {
        let mut frames = FrameMap::new();
        frames.insert(1, frame(1, Some(2), Some("a")));
        frames.insert(2, frame(2, Some(1), Some("b")));

        let built = build_frame_paths(&frames);
        assert_eq!(built[&1].path, vec!["b", "a"]);
        assert_eq!(built[&2].path, vec!["a", "b"]);
    }

    #[test]
    fn test_src_matching() {
        assert!(src_matches("child.html", "https://a.test/dir/child.html"));
        assert!(src_matches("/x?y=1", "https://a.test/x?y=1"));
        assert!(!src_matches("other.html", "https://a.test/child.html"));
        assert!(!src_matches("", "about:blank"));
    }

    fn nested_page() -> FakeBrowser {
        // root -> same-origin "left" -> same-origin "inner"
        //      -> out-of-process "remote" -> two same-origin grandchildren
        let remote = FakeSession::new(
            "remote",
            FakeNode::document(vec![FakeNode::element("body").children(vec![
                FakeNode::iframe("G1", "g1.html", FakeNode::document(vec![
                    FakeNode::element("button").text("One"),
                ])),
                FakeNode::iframe("G2", "g2.html", FakeNode::document(vec![
                    FakeNode::element("button").text("Two"),
                ])),
            ])]),
        );
        let root = FakeSession::new(
            "root",
            FakeNode::document(vec![FakeNode::element("body").children(vec![
                FakeNode::iframe("L", "left.html", FakeNode::document(vec![
                    FakeNode::iframe("I", "inner.html", FakeNode::document(vec![
                        FakeNode::element("a").text("deep"),
                    ])),
                ]))
                .attr("name", "left"),
                FakeNode::remote_iframe("R", "https://other.test/remote"),
            ])]),
        );
        FakeBrowser::new(root).with_remote("R", "https://other.test/remote", remote)
    }

    #[tokio::test]
    async fn test_discovery_assigns_parents_before_children() {
        let browser = nested_page();
        let tab = browser.new_tab().await.unwrap();
        let root = SessionHandle::new(browser.page_session(&tab).await.unwrap());
        let ctx = DiscoveryContext::new();

        let discovery = discover_frames(&browser, &tab, root, &ctx).await;
        let frames = &discovery.frames;
        assert_eq!(frames.len(), 6);

        for info in frames.values() {
            if let Some(parent) = info.parent_frame_index {
                assert!(parent < info.frame_index, "frame {} before parent", info.frame_index);
                assert!(frames.contains_key(&parent));
            }
        }

        // Root walk claims 1 and 2, the out-of-process frame takes the next
        // free index, and its same-origin children follow it.
        let by_id = |id: &str| {
            frames
                .values()
                .find(|f| f.frame_id.as_deref() == Some(id))
                .map(|f| f.frame_index)
                .unwrap()
        };
        assert_eq!(by_id("L"), 1);
        assert_eq!(by_id("I"), 2);
        assert_eq!(by_id("R"), 3);
        assert_eq!(by_id("G1"), 4);
        assert_eq!(by_id("G2"), 5);
        assert!(frames[&3].is_out_of_process());
        assert_eq!(frames[&5].parent_frame_index, Some(3));
        assert_eq!(frames[&2].path, vec!["root", "left", "inner.html"]);

        assert_eq!(browser.attach_attempts(), vec!["L", "R", "I", "G1", "G2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_remote_keeps_its_children_first() {
        let remote = |id: &str, child: &str| {
            FakeSession::new(
                id,
                FakeNode::document(vec![FakeNode::element("body").children(vec![
                    FakeNode::iframe(child, &format!("{}.html", child), FakeNode::document(vec![
                        FakeNode::element("button").text(child),
                    ])),
                ])]),
            )
        };
        let slow = remote("ra", "CA");
        slow.delay_method("DOM.getDocument", std::time::Duration::from_millis(500));
        let root = FakeSession::new(
            "root",
            FakeNode::document(vec![FakeNode::element("body").children(vec![
                FakeNode::remote_iframe("RA", "https://a.test/"),
                FakeNode::remote_iframe("RB", "https://b.test/"),
            ])]),
        );
        let browser = FakeBrowser::new(root)
            .with_remote("RA", "https://a.test/", slow)
            .with_remote("RB", "https://b.test/", remote("rb", "CB"));
        let tab = browser.new_tab().await.unwrap();
        let root = SessionHandle::new(browser.page_session(&tab).await.unwrap());

        let discovery = discover_frames(&browser, &tab, root, &DiscoveryContext::new()).await;
        let by_id = |id: &str| {
            discovery
                .frames
                .values()
                .find(|f| f.frame_id.as_deref() == Some(id))
                .map(|f| f.frame_index)
                .unwrap()
        };
        assert_eq!(by_id("RA"), 1);
        assert_eq!(by_id("RB"), 2);
        assert_eq!(by_id("CA"), 3);
        assert_eq!(by_id("CB"), 4);
        assert_eq!(discovery.frames[&3].parent_frame_index, Some(1));
        assert_eq!(discovery.frames[&4].parent_frame_index, Some(2));
    }

    #[tokio::test]
    async fn test_frame_document_descends_lazily() {
        let browser = nested_page();
        let tab = browser.new_tab().await.unwrap();
        let root = SessionHandle::new(browser.page_session(&tab).await.unwrap());
        let discovery = discover_frames(&browser, &tab, root.clone(), &DiscoveryContext::new()).await;

        let doc = frame_document(&discovery.frames, 2).await.unwrap();
        assert!(doc.session.same_session(&root));

        let remote_child = frame_document(&discovery.frames, 4).await.unwrap();
        assert_eq!(remote_child.session.session_id(), "remote");
    }

    #[tokio::test]
    async fn test_broken_descent_is_typed_error() {
        let browser = nested_page();
        let tab = browser.new_tab().await.unwrap();
        let root = SessionHandle::new(browser.page_session(&tab).await.unwrap());
        let discovery = discover_frames(&browser, &tab, root, &DiscoveryContext::new()).await;

        let mut frames = discovery.frames.clone();
        if let Some(inner) = frames.get_mut(&2) {
            inner.xpath = "/iframe[9]".to_string();
        }
        match frame_document(&frames, 2).await {
            Err(BrowserAgentError::FrameResolutionFailed { frame_index, metadata, .. }) => {
                assert_eq!(frame_index, 2);
                assert!(metadata.contains("inner.html"));
            }
            other => panic!("unexpected {:?}", other.map(|d| d.frame_index)),
        }
        assert!(matches!(
            frame_document(&frames, 42).await,
            Err(BrowserAgentError::FrameNotFound(42))
        ));
    }
}
