use crate::browser::targets::{AttachedTarget, TargetRouter};
use crate::core::config::BrowserConfig;
use crate::core::{
    frames_from_frame_tree, BrowserTrait, CdpSession, Config, LiveFrame, NetworkEvent,
    Subscription,
};
use crate::errors::{BrowserAgentError, Result};
use async_trait::async_trait;
use headless_chrome::protocol::cdp::types::{Event, Method};
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::ffi::OsStr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Generates one `Method` impl per protocol command this crate sends, so
/// they can go through `Tab::call_method` with untyped JSON params.
macro_rules! raw_methods {
    ($($ty:ident => $name:literal),* $(,)?) => {
        $(
            #[derive(Debug, Serialize)]
            #[serde(transparent)]
            struct $ty(Value);

            impl Method for $ty {
                const NAME: &'static str = $name;
                type ReturnObject = Value;
            }
        )*

        fn call_raw(tab: &Tab, method: &str, params: Value) -> Result<Value> {
            match method {
                $(
                    $name => tab
                        .call_method($ty(params))
                        .map_err(|e| BrowserAgentError::Protocol(format!("{}: {}", $name, e))),
                )*
                other => Err(BrowserAgentError::Protocol(format!(
                    "{} is not wired into the Chrome adapter",
                    other
                ))),
            }
        }
    };
}

raw_methods! {
    DomGetDocument => "DOM.getDocument",
    DomDescribeNode => "DOM.describeNode",
    DomGetContentQuads => "DOM.getContentQuads",
    DomGetBoxModel => "DOM.getBoxModel",
    DomScrollIntoView => "DOM.scrollIntoViewIfNeeded",
    DomEnable => "DOM.enable",
    AxGetFullTree => "Accessibility.getFullAXTree",
    AxEnable => "Accessibility.enable",
    RuntimeEvaluate => "Runtime.evaluate",
    RuntimeCallFunctionOn => "Runtime.callFunctionOn",
    RuntimeReleaseObject => "Runtime.releaseObject",
    InputDispatchMouseEvent => "Input.dispatchMouseEvent",
    InputDispatchKeyEvent => "Input.dispatchKeyEvent",
    InputInsertText => "Input.insertText",
    NetworkEnable => "Network.enable",
    PageEnable => "Page.enable",
    PageGetFrameTree => "Page.getFrameTree",
    TargetSetAutoAttach => "Target.setAutoAttach",
    TargetAttachToTarget => "Target.attachToTarget",
    TargetSendMessageToTarget => "Target.sendMessageToTarget",
}

/// Protocol session over one headless_chrome tab. The underlying client is
/// blocking, so every call runs on the blocking pool.
pub struct ChromeSession {
    tab: Arc<Tab>,
    id: String,
}

impl ChromeSession {
    pub fn new(tab: Arc<Tab>) -> Self {
        let id = tab.get_target_id().to_string();
        Self { tab, id }
    }
}

async fn call_blocking(tab: &Arc<Tab>, method: &str, params: Value) -> Result<Value> {
    let tab = tab.clone();
    let method = method.to_string();
    tokio::task::spawn_blocking(move || call_raw(&tab, &method, params))
        .await
        .map_err(BrowserAgentError::from_any_error)?
}

fn decode_event(event: &Event) -> Option<NetworkEvent> {
    let (method, params) = match event {
        Event::NetworkRequestWillBeSent(e) => ("Network.requestWillBeSent", serde_json::to_value(&e.params)),
        Event::NetworkLoadingFinished(e) => ("Network.loadingFinished", serde_json::to_value(&e.params)),
        Event::NetworkLoadingFailed(e) => ("Network.loadingFailed", serde_json::to_value(&e.params)),
        Event::NetworkRequestServedFromCache(e) => {
            ("Network.requestServedFromCache", serde_json::to_value(&e.params))
        }
        Event::NetworkResponseReceived(e) => ("Network.responseReceived", serde_json::to_value(&e.params)),
        Event::PageFrameStoppedLoading(e) => ("Page.frameStoppedLoading", serde_json::to_value(&e.params)),
        _ => return None,
    };
    NetworkEvent::from_protocol(method, &params.ok()?)
}

#[async_trait]
impl CdpSession for ChromeSession {
    fn session_id(&self) -> &str {
        &self.id
    }

    async fn send(&self, method: &str, params: Value) -> Result<Value> {
        call_blocking(&self.tab, method, params).await
    }

    async fn subscribe_network(
        &self,
        sink: mpsc::UnboundedSender<NetworkEvent>,
    ) -> Result<Subscription> {
        let listener = Arc::new(move |event: &Event| {
            if let Some(decoded) = decode_event(event) {
                let _ = sink.send(decoded);
            }
        });
        let registered = self.tab.add_event_listener(listener)?;

        let tab = self.tab.clone();
        Ok(Subscription::new(move || {
            if let Err(e) = tab.remove_event_listener(&registered) {
                debug!("Removing network listener failed: {}", e);
            }
        }))
    }
}

/// `Target.*` events of the tab session, as protocol method and params.
fn target_event(event: &Event) -> Option<(&'static str, Value)> {
    let (method, params) = match event {
        Event::AttachedToTarget(e) => ("Target.attachedToTarget", serde_json::to_value(&e.params)),
        Event::DetachedFromTarget(e) => ("Target.detachedFromTarget", serde_json::to_value(&e.params)),
        Event::ReceivedMessageFromTarget(e) => {
            ("Target.receivedMessageFromTarget", serde_json::to_value(&e.params))
        }
        _ => return None,
    };
    Some((method, params.ok()?))
}

fn auto_attach_params() -> Value {
    json!({ "autoAttach": true, "waitForDebuggerOnStart": false, "flatten": false })
}

/// Session of an out-of-process frame, reached through the tab session.
pub struct ChromeFrameSession {
    tab: Arc<Tab>,
    router: Arc<TargetRouter>,
    session_id: String,
    timeout: Duration,
}

#[async_trait]
impl CdpSession for ChromeFrameSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn send(&self, method: &str, params: Value) -> Result<Value> {
        let (id, reply, envelope) = self.router.envelope(&self.session_id, method, params);
        if let Err(e) = call_blocking(&self.tab, "Target.sendMessageToTarget", envelope).await {
            self.router.forget(id);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, reply).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(BrowserAgentError::Protocol(format!(
                "{} on session {}: reply channel closed",
                method, self.session_id
            ))),
            Err(_) => {
                self.router.forget(id);
                Err(BrowserAgentError::Protocol(format!(
                    "{} on session {} timed out after {:?}",
                    method, self.session_id, self.timeout
                )))
            }
        }
    }

    async fn subscribe_network(
        &self,
        sink: mpsc::UnboundedSender<NetworkEvent>,
    ) -> Result<Subscription> {
        let id = self.router.subscribe(&self.session_id, sink);
        let router = self.router.clone();
        Ok(Subscription::new(move || router.unsubscribe(id)))
    }
}

/// Turns auto-attach on inside every newly attached frame target, so frames
/// nested in an out-of-process frame are reported too.
async fn auto_attach_nested(
    tab: Weak<Tab>,
    router: Arc<TargetRouter>,
    mut attached: mpsc::UnboundedReceiver<String>,
    timeout: Duration,
) {
    while let Some(session_id) = attached.recv().await {
        let Some(tab) = tab.upgrade() else {
            break;
        };
        let session = ChromeFrameSession {
            tab,
            router: router.clone(),
            session_id,
            timeout,
        };
        if let Err(e) = session.send("Target.setAutoAttach", auto_attach_params()).await {
            debug!("Auto-attach inside session {} failed: {}", session.session_id, e);
        }
    }
}

/// A tab plus the bookkeeping of the frame targets attached to it.
#[derive(Clone)]
pub struct ChromeTab {
    tab: Arc<Tab>,
    router: Arc<TargetRouter>,
}

impl ChromeTab {
    pub fn tab(&self) -> &Arc<Tab> {
        &self.tab
    }

    fn frame_session(&self, session_id: String, timeout: Duration) -> ChromeFrameSession {
        ChromeFrameSession {
            tab: self.tab.clone(),
            router: self.router.clone(),
            session_id,
            timeout,
        }
    }
}

pub struct ChromeBrowser {
    browser: Option<Browser>,
    timeout: Duration,
}

impl ChromeBrowser {
    pub fn new() -> Self {
        Self {
            browser: None,
            timeout: BrowserConfig::default().timeout(),
        }
    }

    fn inner(&self) -> Result<&Browser> {
        self.browser.as_ref().ok_or(BrowserAgentError::BrowserNotLaunched)
    }
}

impl Default for ChromeBrowser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrowserTrait for ChromeBrowser {
    type TabHandle = ChromeTab;

    async fn launch(&mut self, config: &Config) -> Result<()> {
        let viewport = &config.browser.viewport;
        let window_size_arg = format!("--window-size={},{}", viewport.width, viewport.height);
        let scale_arg = format!("--force-device-scale-factor={}", viewport.device_scale_factor);

        let user_agent_arg = config
            .browser
            .user_agent
            .as_ref()
            .map(|ua| format!("--user-agent={}", ua));

        let mut args = vec![
            OsStr::new("--no-sandbox"),
            OsStr::new("--disable-dev-shm-usage"),
            OsStr::new(&window_size_arg),
            OsStr::new(&scale_arg),
        ];

        if let Some(ref ua_arg) = user_agent_arg {
            args.push(OsStr::new(ua_arg));
        }

        if config.browser.disable_images {
            args.push(OsStr::new("--blink-settings=imagesEnabled=false"));
        }

        for arg in &config.browser.args {
            args.push(OsStr::new(arg));
        }

        let launch_options = LaunchOptions::default_builder()
            .headless(config.browser.headless)
            .args(args)
            .build()
            .map_err(|e| BrowserAgentError::LaunchFailed(e.to_string()))?;

        let browser = Browser::new(launch_options)
            .map_err(|e| BrowserAgentError::LaunchFailed(e.to_string()))?;

        self.browser = Some(browser);
        self.timeout = config.browser.timeout();
        Ok(())
    }

    async fn new_tab(&self) -> Result<Self::TabHandle> {
        let browser = self.inner()?.clone();
        let tab = tokio::task::spawn_blocking(move || browser.new_tab())
            .await
            .map_err(BrowserAgentError::from_any_error)?
            .map_err(|e| BrowserAgentError::TabCreationFailed(e.to_string()))?;
        tab.set_default_timeout(self.timeout);

        let router = Arc::new(TargetRouter::new());
        let (attached_tx, attached_rx) = mpsc::unbounded_channel();
        let listener_router = router.clone();
        let listener = Arc::new(move |event: &Event| {
            if let Some((method, params)) = target_event(event) {
                for session_id in listener_router.route(method, &params, None) {
                    let _ = attached_tx.send(session_id);
                }
            }
        });
        tab.add_event_listener(listener)?;
        tokio::spawn(auto_attach_nested(
            Arc::downgrade(&tab),
            router.clone(),
            attached_rx,
            self.timeout,
        ));

        call_blocking(&tab, "Target.setAutoAttach", auto_attach_params()).await?;
        Ok(ChromeTab { tab, router })
    }

    async fn navigate(&self, tab: &Self::TabHandle, url: &str) -> Result<()> {
        let tab = tab.tab.clone();
        let url = url.to_string();
        tokio::task::spawn_blocking(move || {
            tab.navigate_to(&url)
                .and_then(|t| t.wait_until_navigated())
                .map(|_| ())
                .map_err(|e| BrowserAgentError::NavigationFailed(e.to_string()))
        })
        .await
        .map_err(BrowserAgentError::from_any_error)?
    }

    async fn take_screenshot(&self, tab: &Self::TabHandle) -> Result<Vec<u8>> {
        let tab = tab.tab.clone();
        tokio::task::spawn_blocking(move || {
            tab.capture_screenshot(
                headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption::Png,
                None,
                None,
                true,
            )
            .map_err(|e| BrowserAgentError::ScreenshotFailed(e.to_string()))
        })
        .await
        .map_err(BrowserAgentError::from_any_error)?
    }

    async fn get_url(&self, tab: &Self::TabHandle) -> Result<String> {
        Ok(tab.tab.get_url())
    }

    async fn page_session(&self, tab: &Self::TabHandle) -> Result<Arc<dyn CdpSession>> {
        Ok(Arc::new(ChromeSession::new(tab.tab.clone())))
    }

    async fn live_frames(&self, tab: &Self::TabHandle) -> Result<Vec<LiveFrame>> {
        let tree = call_blocking(&tab.tab, "Page.getFrameTree", json!({})).await?;
        let mut frames = frames_from_frame_tree(&tree);
        let mut seen: HashSet<String> = frames.iter().map(|f| f.frame_id.clone()).collect();

        // Out-of-process frames report their own subtree; its root carries
        // the id of the parent frame in the other process.
        for target in tab.router.targets() {
            let session = tab.frame_session(target.session_id.clone(), self.timeout);
            let tree = match session.send("Page.getFrameTree", json!({})).await {
                Ok(tree) => tree,
                Err(e) => {
                    debug!("Frame tree of target {} unavailable: {}", target.target_id, e);
                    continue;
                }
            };
            for frame in frames_from_frame_tree(&tree) {
                if frame.is_main_frame() {
                    trace!("Target {} reported a parentless frame {}", target.target_id, frame.frame_id);
                    continue;
                }
                if seen.insert(frame.frame_id.clone()) {
                    frames.push(frame);
                }
            }
        }
        Ok(frames)
    }

    async fn attach_frame(
        &self,
        tab: &Self::TabHandle,
        frame: &LiveFrame,
    ) -> Result<Arc<dyn CdpSession>> {
        if let Some(target) = tab.router.target(&frame.frame_id) {
            return Ok(Arc::new(tab.frame_session(target.session_id, self.timeout)));
        }

        // Not auto-attached (yet). Frames in their parent's process have no
        // target of their own, so this fails for them.
        let params = json!({ "targetId": frame.frame_id, "flatten": false });
        let session_id = match call_blocking(&tab.tab, "Target.attachToTarget", params).await {
            Ok(reply) => reply.get("sessionId").and_then(Value::as_str).map(str::to_string),
            Err(e) => {
                trace!("Frame {} has no target of its own: {}", frame.frame_id, e);
                None
            }
        };
        let Some(session_id) = session_id else {
            return Err(BrowserAgentError::NotAttachable(frame.frame_id.clone()));
        };

        tab.router.register(AttachedTarget {
            target_id: frame.frame_id.clone(),
            session_id: session_id.clone(),
            parent_session: None,
            url: frame.url.clone(),
        });
        Ok(Arc::new(tab.frame_session(session_id, self.timeout)))
    }

    fn is_running(&self) -> bool {
        self.browser.is_some()
    }

    async fn close(&mut self) -> Result<()> {
        if self.browser.take().is_none() {
            warn!("Close requested on a browser that was never launched");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_attach_keeps_frame_sessions_wrapped() {
        let params = auto_attach_params();
        assert_eq!(params["autoAttach"], true);
        assert_eq!(params["flatten"], false);
        assert_eq!(params["waitForDebuggerOnStart"], false);
    }

    #[tokio::test]
    async fn test_launch_is_required_before_tabs() {
        let browser = ChromeBrowser::new();
        assert!(!browser.is_running());
        assert!(matches!(
            browser.new_tab().await,
            Err(BrowserAgentError::BrowserNotLaunched)
        ));
    }
}
