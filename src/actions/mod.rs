pub mod base;
pub mod cache;
pub mod dispatcher;
pub mod locator;
pub mod replay;

pub use base::{ActionError, ActionResult};
pub use cache::{ActionCache, ActionOutcome, ActionSignature, ActionType, CachedActionEntry};
pub use dispatcher::{ActionDispatcher, ActionMethod};
pub use locator::{ElementHandle, ElementLocator};
pub use replay::{ReplayOutcome, ResolutionFallback, ResolvedAction};
