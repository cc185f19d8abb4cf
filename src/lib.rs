#![recursion_limit = "256"]

pub mod actions;
pub mod browser;
pub mod core;
pub mod dom;
pub mod errors;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;
pub mod utils;

pub use actions::{ActionCache, ActionDispatcher, ActionMethod, ActionResult, ElementLocator};
pub use browser::{BrowserSession, SettleDetector, SettleReport};
pub use core::{BrowserTrait, CdpSession, Config};
pub use dom::{A11yState, AccessibilityNode, DomProcessor, FrameInfo};
pub use errors::{BrowserAgentError, Result};
pub use types::*;
