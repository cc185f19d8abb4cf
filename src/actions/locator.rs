use crate::core::SessionHandle;
use crate::dom::frames::{frame_document, FrameMap};
use crate::dom::A11yState;
use crate::errors::{BrowserAgentError, Result};
use crate::types::EncodedId;
use crate::utils::javascript::{DOCUMENT_READY, RESOLVE_XPATH};
use crate::utils::JavaScriptRunner;
use regex::Regex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, error};

const READY_POLL_MS: u64 = 50;

/// A live, actionable reference to one element.
#[derive(Debug, Clone)]
pub struct ElementHandle {
    pub session: SessionHandle,
    pub object_id: String,
    pub frame_index: u32,
    pub xpath: String,
    pub encoded_id: Option<EncodedId>,
}

impl ElementHandle {
    pub async fn release(&self) {
        self.session.release_object(&self.object_id).await;
    }
}

fn text_segment_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(/text\(\)\[\d+\])+$").expect("static pattern"))
}

/// Interactions target elements, so trailing text-node steps are dropped.
pub fn trim_text_segments(xpath: &str) -> String {
    let trimmed = text_segment_pattern().replace(xpath, "").to_string();
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed
    }
}

/// Resolves encoded ids of one extraction pass to element handles.
pub struct ElementLocator<'a> {
    xpaths: &'a HashMap<EncodedId, String>,
    frames: &'a FrameMap,
    frame_load_timeout: Duration,
}

impl<'a> ElementLocator<'a> {
    pub fn new(
        xpaths: &'a HashMap<EncodedId, String>,
        frames: &'a FrameMap,
        frame_load_timeout: Duration,
    ) -> Self {
        Self {
            xpaths,
            frames,
            frame_load_timeout,
        }
    }

    pub fn for_state(state: &'a A11yState, frame_load_timeout: Duration) -> Self {
        Self::new(&state.xpaths, &state.frames, frame_load_timeout)
    }

    /// Validates a raw `frameIndex-backendNodeId` string, then resolves it.
    pub async fn resolve_str(&self, raw: &str) -> Result<ElementHandle> {
        let id = EncodedId::parse(raw)?;
        self.resolve(id).await
    }

    pub async fn resolve(&self, id: EncodedId) -> Result<ElementHandle> {
        let Some(xpath) = self.xpaths.get(&id) else {
            error!("No XPath recorded for encoded id {}", id);
            return Err(BrowserAgentError::ElementNotFound(id.to_string()));
        };
        let mut handle = self.resolve_xpath(id.frame_index, xpath).await?;
        handle.encoded_id = Some(id);
        Ok(handle)
    }

    /// Resolves an XPath inside a frame of this pass.
    pub async fn resolve_xpath(&self, frame_index: u32, xpath: &str) -> Result<ElementHandle> {
        let xpath = trim_text_segments(xpath);
        let document = frame_document(self.frames, frame_index).await?;

        let ready = JavaScriptRunner::wait_for_condition(
            &*document.session,
            &document.object_id,
            DOCUMENT_READY,
            self.frame_load_timeout.as_millis() as u64,
            READY_POLL_MS,
        )
        .await;
        match ready {
            Ok(true) => {}
            Ok(false) => debug!(
                "Frame {} still loading after {:?}; resolving anyway",
                frame_index, self.frame_load_timeout
            ),
            Err(e) => debug!("Ready-state check failed in frame {}: {}", frame_index, e),
        }

        let element = document
            .session
            .call_function_on(&document.object_id, RESOLVE_XPATH, vec![json!(xpath)], false)
            .await;
        document.release().await;

        let object_id = element?
            .handle()
            .map(str::to_string)
            .ok_or_else(|| {
                BrowserAgentError::ElementDetached(format!("{} in frame {}", xpath, frame_index))
            })?;

        Ok(ElementHandle {
            session: document.session,
            object_id,
            frame_index,
            xpath,
            encoded_id: None,
        })
    }
}
