use crate::types::EncodedId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrowserAgentError {
    #[error("Browser launch failed: {0}")]
    LaunchFailed(String),

    #[error("Browser not launched")]
    BrowserNotLaunched,

    #[error("Tab creation failed: {0}")]
    TabCreationFailed(String),

    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Frame {0} is not attachable as an independent session")]
    NotAttachable(String),

    #[error("Invalid encoded id: {0}")]
    InvalidEncodedId(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("No element matches {0}")]
    ElementDetached(String),

    #[error("No current extraction pass to resolve {0} against; extract the tree first")]
    StaleState(String),

    #[error("Duplicate encoded id produced in one extraction pass: {0}")]
    DuplicateEncodedId(EncodedId),

    #[error("Frame not found: {0}")]
    FrameNotFound(u32),

    #[error("Frame resolution failed for frame {frame_index}: {reason} ({metadata})")]
    FrameResolutionFailed {
        frame_index: u32,
        reason: String,
        metadata: String,
    },

    #[error("JavaScript execution failed: {0}")]
    JavaScriptFailed(String),

    #[error("Screenshot failed: {0}")]
    ScreenshotFailed(String),

    #[error("Action error: {0}")]
    ActionError(#[from] crate::actions::ActionError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Anyhow error: {0}")]
    AnyhowError(String),
}

pub type Result<T> = std::result::Result<T, BrowserAgentError>;

// Convert anyhow::Error to BrowserAgentError
impl From<anyhow::Error> for BrowserAgentError {
    fn from(err: anyhow::Error) -> Self {
        BrowserAgentError::AnyhowError(err.to_string())
    }
}
