use crate::errors::{BrowserAgentError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Frame-qualified identity of a DOM node, rendered as `"frameIndex-backendNodeId"`.
///
/// Only meaningful inside the extraction pass that produced it: backend node
/// ids are reassigned by the browser on navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EncodedId {
    pub frame_index: u32,
    pub backend_node_id: i64,
}

impl EncodedId {
    pub fn new(frame_index: u32, backend_node_id: i64) -> Self {
        Self {
            frame_index,
            backend_node_id,
        }
    }

    /// Validates a raw id handed back by the language model or a caller.
    pub fn parse(raw: &str) -> Result<Self> {
        raw.parse()
    }

    pub fn is_root_frame(&self) -> bool {
        self.frame_index == 0
    }
}

fn encoded_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(\d+)-(\d+)$").expect("static pattern"))
}

impl FromStr for EncodedId {
    type Err = BrowserAgentError;

    fn from_str(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let captures = encoded_id_pattern()
            .captures(trimmed)
            .ok_or_else(|| BrowserAgentError::InvalidEncodedId(raw.to_string()))?;

        let frame_index = captures[1]
            .parse::<u32>()
            .map_err(|_| BrowserAgentError::InvalidEncodedId(raw.to_string()))?;
        let backend_node_id = captures[2]
            .parse::<i64>()
            .map_err(|_| BrowserAgentError::InvalidEncodedId(raw.to_string()))?;

        Ok(Self::new(frame_index, backend_node_id))
    }
}

impl fmt::Display for EncodedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.frame_index, self.backend_node_id)
    }
}

impl TryFrom<String> for EncodedId {
    type Error = BrowserAgentError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<EncodedId> for String {
    fn from(id: EncodedId) -> Self {
        id.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ElementRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl ElementRect {
    /// Builds the axis-aligned bounds of a protocol quad (`[x1,y1,…,x4,y4]`).
    pub fn from_quad(quad: &[f64]) -> Option<Self> {
        if quad.len() < 8 {
            return None;
        }
        let xs = [quad[0], quad[2], quad[4], quad[6]];
        let ys = [quad[1], quad[3], quad[5], quad[7]];
        let min_x = xs.iter().cloned().fold(f64::INFINITY, f64::min);
        let max_x = xs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let min_y = ys.iter().cloned().fold(f64::INFINITY, f64::min);
        let max_y = ys.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

        Some(Self {
            x: min_x,
            y: min_y,
            width: max_x - min_x,
            height: max_y - min_y,
        })
    }

    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }
}
