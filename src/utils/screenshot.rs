use crate::core::{BrowserTrait, CdpSession};
use crate::errors::Result;
use crate::types::{ElementRect, EncodedId};
use crate::utils::javascript::{OVERLAY_CLEAR, OVERLAY_SHOW};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::json;
use std::collections::HashMap;

pub struct ScreenshotManager;

impl ScreenshotManager {
    pub async fn take_base64<B: BrowserTrait>(browser: &B, tab: &B::TabHandle) -> Result<String> {
        let screenshot_bytes = browser.take_screenshot(tab).await?;
        Ok(STANDARD.encode(screenshot_bytes))
    }

    /// Draws every root-frame box with its encoded id, captures the viewport
    /// and removes the overlay again. Returns the PNG as base64.
    pub async fn render_overlay<B: BrowserTrait>(
        browser: &B,
        tab: &B::TabHandle,
        session: &dyn CdpSession,
        boxes: &HashMap<EncodedId, ElementRect>,
    ) -> Result<String> {
        let labels: Vec<_> = overlay_boxes(boxes)
            .into_iter()
            .map(|(id, rect)| {
                json!({
                    "id": id.to_string(),
                    "x": rect.x,
                    "y": rect.y,
                    "width": rect.width,
                    "height": rect.height,
                })
            })
            .collect();

        let script = format!("({})({})", OVERLAY_SHOW, serde_json::Value::Array(labels));
        session.evaluate(&script, true).await?;

        let captured = Self::take_base64(browser, tab).await;

        if let Err(e) = session.evaluate(OVERLAY_CLEAR, true).await {
            tracing::warn!("Failed to remove overlay: {}", e);
        }

        captured
    }
}

/// Boxes drawn by the overlay: root-frame only (child-frame rects are in
/// their own viewport coordinates), non-empty, ordered by id.
fn overlay_boxes(boxes: &HashMap<EncodedId, ElementRect>) -> Vec<(EncodedId, ElementRect)> {
    let mut drawn: Vec<_> = boxes
        .iter()
        .filter(|(id, rect)| id.is_root_frame() && !rect.is_empty())
        .map(|(id, rect)| (*id, *rect))
        .collect();
    drawn.sort_by_key(|(id, _)| *id);
    drawn
}
