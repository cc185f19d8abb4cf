#[cfg(feature = "chrome")]
pub mod chrome;
pub mod session;
pub mod settle;
#[cfg(feature = "chrome")]
pub mod targets;

#[cfg(feature = "chrome")]
pub use chrome::{ChromeBrowser, ChromeFrameSession, ChromeSession, ChromeTab};
pub use session::BrowserSession;
pub use settle::{SettleDetector, SettleReport, SettleState};
