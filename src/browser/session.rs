use crate::actions::base::ActionResult;
use crate::actions::cache::{ActionCache, ActionOutcome, CachedActionEntry};
use crate::actions::dispatcher::{ActionDispatcher, ActionMethod};
use crate::actions::locator::ElementLocator;
use crate::actions::replay::{replay_entry, ReplayOutcome, ResolutionFallback};
use crate::browser::settle::{SettleDetector, SettleReport};
use crate::core::{BrowserTrait, Config};
use crate::dom::{A11yState, DomProcessor};
use crate::errors::{BrowserAgentError, Result};
use crate::types::EncodedId;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Orchestration-facing entry point: one browser tab plus the extraction,
/// dispatch, settle and cache machinery bound to it.
pub struct BrowserSession<B: BrowserTrait> {
    browser: Arc<B>,
    tab: B::TabHandle,
    config: Config,
    processor: DomProcessor,
    dispatcher: ActionDispatcher,
    settle: SettleDetector,
    cache: ActionCache,
    last_state: Option<A11yState>,
    session_id: String,
}

impl<B: BrowserTrait> BrowserSession<B> {
    pub async fn new(mut browser: B, config: Config) -> Result<Self> {
        browser.launch(&config).await?;
        let tab = browser.new_tab().await?;
        Self::from_parts(browser, tab, config)
    }

    /// Wraps an already launched browser and an open tab.
    pub fn from_parts(browser: B, tab: B::TabHandle, config: Config) -> Result<Self> {
        let cache = match (&config.cache.path, config.cache.enabled) {
            (Some(path), true) => ActionCache::load(path)?,
            _ => ActionCache::new(),
        };
        let session_id = uuid::Uuid::new_v4().to_string();
        debug!("Browser session {} ready", session_id);

        Ok(Self {
            browser: Arc::new(browser),
            tab,
            processor: DomProcessor::new(config.extraction.clone()),
            dispatcher: ActionDispatcher::new(config.action.clone()),
            settle: SettleDetector::new(config.settle.clone()),
            cache,
            config,
            last_state: None,
            session_id,
        })
    }

    pub fn browser(&self) -> &B {
        &self.browser
    }

    pub fn tab(&self) -> &B::TabHandle {
        &self.tab
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn cache(&self) -> &ActionCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut ActionCache {
        &mut self.cache
    }

    /// The snapshot ids are currently resolved against, if still valid.
    pub fn last_state(&self) -> Option<&A11yState> {
        self.last_state.as_ref()
    }

    pub(crate) fn dispatcher(&self) -> &ActionDispatcher {
        &self.dispatcher
    }

    pub(crate) fn frame_load_timeout(&self) -> Duration {
        Duration::from_millis(self.config.extraction.frame_load_timeout_ms)
    }

    pub(crate) fn invalidate(&mut self) {
        self.last_state = None;
    }

    pub async fn navigate(&mut self, url: &str) -> Result<SettleReport> {
        info!("Navigating to {}", url);
        self.browser.navigate(&self.tab, url).await?;
        self.invalidate();
        self.wait_until_settled(None).await
    }

    /// Runs a full extraction pass and keeps it as the snapshot that later
    /// ids are resolved against.
    pub async fn extract_tree(&mut self) -> Result<A11yState> {
        let state = self.processor.extract_state(&*self.browser, &self.tab).await?;
        self.last_state = Some(state.clone());
        Ok(state)
    }

    pub async fn wait_until_settled(&self, timeout_ms: Option<u64>) -> Result<SettleReport> {
        let session = self.browser.page_session(&self.tab).await?;
        Ok(self
            .settle
            .wait(&*session, timeout_ms.map(Duration::from_millis))
            .await)
    }

    /// Resolves `id` against the current snapshot and performs `method` on it.
    ///
    /// Unknown methods, malformed ids, ids missing from the snapshot and
    /// calls made without a current snapshot (none extracted yet, or the
    /// last one was consumed by an action or a navigation) are errors;
    /// everything else is reported through the returned result.
    pub async fn resolve_and_dispatch(
        &mut self,
        id: &str,
        method: &str,
        args: &[String],
    ) -> Result<ActionResult> {
        let (result, _) = self.run(id, method, args).await?;
        Ok(result)
    }

    /// Like [`resolve_and_dispatch`](Self::resolve_and_dispatch), and records
    /// the step in the action cache when caching is enabled.
    pub async fn act(
        &mut self,
        instruction: &str,
        id: &str,
        method: &str,
        args: &[String],
    ) -> Result<ActionResult> {
        let url = self.browser.get_url(&self.tab).await?;
        let (result, target) = self.run(id, method, args).await?;

        if let (true, Some((frame_index, xpath))) = (self.config.cache.enabled, target) {
            let recorded = self.cache.record(CachedActionEntry::act(
                instruction,
                url,
                method,
                args.to_vec(),
                frame_index,
                xpath,
                ActionOutcome {
                    success: result.success,
                    message: result.message.clone(),
                },
            ));
            if recorded {
                if let Err(e) = self.cache.save() {
                    warn!("Could not persist action cache: {}", e);
                }
            }
        }
        Ok(result)
    }

    pub async fn replay(
        &mut self,
        entry: &CachedActionEntry,
        fallback: Option<&dyn ResolutionFallback>,
    ) -> Result<ReplayOutcome> {
        replay_entry(self, entry, fallback).await
    }

    pub async fn close(self) -> Result<()> {
        if let Err(e) = self.cache.save() {
            warn!("Could not persist action cache: {}", e);
        }
        match Arc::try_unwrap(self.browser) {
            Ok(mut browser) => browser.close().await,
            Err(_) => {
                debug!("Browser still shared; leaving it open");
                Ok(())
            }
        }
    }

    async fn run(
        &mut self,
        id: &str,
        method: &str,
        args: &[String],
    ) -> Result<(ActionResult, Option<(u32, String)>)> {
        let method: ActionMethod = method.parse()?;
        let id = EncodedId::parse(id)?;

        // Ids are only meaningful against the pass that produced them.
        let Some(state) = self.last_state.take() else {
            warn!("Refusing to resolve {}: no current extraction pass", id);
            return Err(BrowserAgentError::StaleState(id.to_string()));
        };
        let outcome = self.dispatch_on_state(&state, id, method, args).await;
        if !matches!(outcome, Ok((_, Some(_)))) {
            self.last_state = Some(state);
        }
        outcome
    }

    /// Dispatches against a specific snapshot. Returns the frame index and
    /// XPath of the element acted on, when it could be resolved.
    pub(crate) async fn dispatch_on_state(
        &mut self,
        state: &A11yState,
        id: EncodedId,
        method: ActionMethod,
        args: &[String],
    ) -> Result<(ActionResult, Option<(u32, String)>)> {
        let locator = ElementLocator::for_state(state, self.frame_load_timeout());
        let handle = match locator.resolve(id).await {
            Ok(handle) => handle,
            Err(e) if e.is_fatal() => {
                error!("Cannot act on {}: {}", id, e);
                return Err(e);
            }
            Err(e) => {
                warn!("Could not resolve {}: {}", id, e);
                return Ok((ActionResult::failure(e.to_string()), None));
            }
        };

        let result = self.dispatcher.dispatch(&handle, method, args).await;
        handle.release().await;
        self.invalidate();
        Ok((result, Some((handle.frame_index, handle.xpath))))
    }
}

#[cfg(feature = "chrome")]
impl BrowserSession<crate::browser::ChromeBrowser> {
    /// Launches Chrome with `config` and opens one tab.
    pub async fn launch(config: Config) -> Result<Self> {
        Self::new(crate::browser::ChromeBrowser::new(), config).await
    }
}

impl<B: BrowserTrait> std::fmt::Debug for BrowserSession<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserSession")
            .field("session_id", &self.session_id)
            .field("cached_actions", &self.cache.len())
            .field("has_snapshot", &self.last_state.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::CacheConfig;
    use crate::testing::{FakeBrowser, FakeNode, FakeSession};
    use tokio_test::assert_ok;

    fn shop() -> FakeBrowser {
        FakeBrowser::new(FakeSession::new(
            "root",
            FakeNode::document(vec![FakeNode::element("html").children(vec![
                FakeNode::element("body").children(vec![
                    FakeNode::element("button").attr("id", "buy").text("Buy"),
                    FakeNode::iframe("F1", "form.html", FakeNode::document(vec![
                        FakeNode::element("html").children(vec![FakeNode::element("body").children(vec![
                            FakeNode::element("input").attr("placeholder", "Card number"),
                        ])]),
                    ])),
                ]),
            ])]),
        ))
    }

    fn button_id(state: &A11yState, name: &str) -> String {
        state
            .find_nodes_by_name(name)
            .into_iter()
            .find(|(_, n)| n.role == "button")
            .map(|(id, _)| id.to_string())
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_and_dispatch_click() {
        let browser = shop();
        let root = browser.root_handle();
        let mut session = BrowserSession::new(browser, Config::default()).await.unwrap();

        let state = session.extract_tree().await.unwrap();
        let id = button_id(&state, "Buy");
        let result = assert_ok!(session.resolve_and_dispatch(&id, "click", &[]).await);
        assert!(result.success, "{}", result.message);
        assert!(root.log().iter().any(|l| l.starts_with("mouse:mousePressed")));
        assert!(session.last_state().is_none(), "acting invalidates the snapshot");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fill_inside_same_origin_frame() {
        let browser = shop();
        let root = browser.root_handle();
        let mut session = BrowserSession::new(browser, Config::default()).await.unwrap();

        let state = session.extract_tree().await.unwrap();
        let (id, _) = state
            .find_nodes_by_name("Card number")
            .into_iter()
            .find(|(_, n)| n.role == "textbox")
            .unwrap();
        assert_eq!(id.frame_index, 1);
        let result = session
            .resolve_and_dispatch(&id.to_string(), "fill", &["4242".to_string()])
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(root.value_of(id.backend_node_id).as_deref(), Some("4242"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_policy() {
        let mut session = BrowserSession::new(shop(), Config::default()).await.unwrap();
        let state = session.extract_tree().await.unwrap();
        let id = button_id(&state, "Buy");

        let unsupported = session.resolve_and_dispatch(&id, "doubleClick", &[]).await;
        assert!(matches!(unsupported, Err(BrowserAgentError::ActionError(_))));

        let malformed = session.resolve_and_dispatch("buy-button", "click", &[]).await;
        assert!(matches!(malformed, Err(BrowserAgentError::InvalidEncodedId(_))));

        let missing = session.resolve_and_dispatch("0-424242", "click", &[]).await;
        assert!(matches!(missing, Err(BrowserAgentError::ElementNotFound(_))));

        // Operational failure: missing argument is a failed result, not an error.
        let result = session.resolve_and_dispatch(&id, "fill", &[]).await.unwrap();
        assert!(!result.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ids_from_a_consumed_pass_are_rejected() {
        let browser = shop();
        let root = browser.root_handle();
        let mut session = BrowserSession::new(browser, Config::default()).await.unwrap();

        let never_extracted = session.resolve_and_dispatch("0-4", "click", &[]).await;
        assert!(matches!(never_extracted, Err(BrowserAgentError::StaleState(_))));
        assert!(root.log().iter().all(|l| !l.starts_with("mouse:")));

        let state = session.extract_tree().await.unwrap();
        let id = button_id(&state, "Buy");
        let first = session.resolve_and_dispatch(&id, "click", &[]).await.unwrap();
        assert!(first.success);

        root.clear_log();
        let reused = session.resolve_and_dispatch(&id, "click", &[]).await;
        assert!(matches!(reused, Err(BrowserAgentError::StaleState(ref s)) if *s == id));
        assert!(reused.unwrap_err().is_fatal());
        assert!(root.log().iter().all(|l| !l.starts_with("mouse:")), "no silent re-extraction");
        assert!(session.last_state().is_none());

        let state = session.extract_tree().await.unwrap();
        let again = session.resolve_and_dispatch(&button_id(&state, "Buy"), "click", &[]).await;
        assert!(again.unwrap().success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_resolution_keeps_snapshot() {
        let mut session = BrowserSession::new(shop(), Config::default()).await.unwrap();
        let state = session.extract_tree().await.unwrap();
        let id = button_id(&state, "Buy");

        let missing = session.resolve_and_dispatch("0-424242", "click", &[]).await;
        assert!(matches!(missing, Err(BrowserAgentError::ElementNotFound(_))));
        assert!(session.last_state().is_some());
        let result = session.resolve_and_dispatch(&id, "click", &[]).await.unwrap();
        assert!(result.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grandchild_of_remote_frame_uses_remote_session() {
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
                FakeNode::remote_iframe("R", "https://other.test/remote"),
            ])]),
        );
        let browser = FakeBrowser::new(root).with_remote("R", "https://other.test/remote", remote);
        let root_log = browser.root_handle();
        let remote_log = browser.remote_handle("R").unwrap();
        let mut session = BrowserSession::new(browser, Config::default()).await.unwrap();

        let state = session.extract_tree().await.unwrap();
        let id = button_id(&state, "Two");
        let frame = state.frame(EncodedId::parse(&id).unwrap().frame_index).unwrap();
        assert_eq!(frame.path, vec!["root", "https://other.test/remote", "g2.html"]);

        root_log.clear_log();
        let result = session.resolve_and_dispatch(&id, "click", &[]).await.unwrap();
        assert!(result.success, "{}", result.message);
        assert!(remote_log.log().iter().any(|l| l.starts_with("mouse:mousePressed")));
        assert!(!root_log.log().iter().any(|l| l.starts_with("mouse:")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_act_records_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let config = Config {
            cache: CacheConfig {
                enabled: true,
                path: Some(path.clone()),
                ..Default::default()
            },
            ..Default::default()
        };
        let browser = shop();
        browser.set_url("https://shop.test/?ref=mail");
        let mut session = BrowserSession::new(browser, config).await.unwrap();

        let state = session.extract_tree().await.unwrap();
        let id = button_id(&state, "Buy");
        let result = session.act("Buy the thing", &id, "click", &[]).await.unwrap();
        assert!(result.success);

        let entry = session.cache().lookup("https://shop.test/", "buy the thing").unwrap();
        assert_eq!(entry.xpath, "/html[1]/body[1]/button[1]");
        assert_eq!(entry.frame_index, 0);

        let reloaded = ActionCache::load(&path).unwrap();
        assert_eq!(reloaded.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_navigate_invalidates_snapshot() {
        let mut session = BrowserSession::new(shop(), Config::default()).await.unwrap();
        session.extract_tree().await.unwrap();
        assert!(session.last_state().is_some());

        let report = session.navigate("https://shop.test/next").await.unwrap();
        assert!(report.state.is_terminal());
        assert!(session.last_state().is_none());
        assert_eq!(session.browser().current_url(), "https://shop.test/next");
    }
}
