use crate::errors::{BrowserAgentError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A debugging-protocol session bound to one frame context.
///
/// The root page has one; every out-of-process frame gets its own. Same-origin
/// frames share the session of the nearest out-of-process ancestor.
#[async_trait]
pub trait CdpSession: Send + Sync {
    /// Stable identifier, used only for logging and equality checks in tests.
    fn session_id(&self) -> &str;

    /// Send a raw protocol command and return its `result` object.
    async fn send(&self, method: &str, params: Value) -> Result<Value>;

    /// Forward network and page-lifecycle events into `sink` until the
    /// returned guard is dropped.
    async fn subscribe_network(
        &self,
        sink: mpsc::UnboundedSender<NetworkEvent>,
    ) -> Result<Subscription>;

    async fn evaluate(&self, expression: &str, return_by_value: bool) -> Result<RemoteObject> {
        let response = self
            .send(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": return_by_value,
                    "awaitPromise": true,
                }),
            )
            .await?;
        RemoteObject::from_response(response)
    }

    async fn call_function_on(
        &self,
        object_id: &str,
        declaration: &str,
        arguments: Vec<Value>,
        return_by_value: bool,
    ) -> Result<RemoteObject> {
        let arguments: Vec<Value> = arguments
            .into_iter()
            .map(|value| json!({ "value": value }))
            .collect();
        let response = self
            .send(
                "Runtime.callFunctionOn",
                json!({
                    "objectId": object_id,
                    "functionDeclaration": declaration,
                    "arguments": arguments,
                    "returnByValue": return_by_value,
                    "awaitPromise": true,
                }),
            )
            .await?;
        RemoteObject::from_response(response)
    }

    async fn release_object(&self, object_id: &str) {
        if let Err(e) = self
            .send("Runtime.releaseObject", json!({ "objectId": object_id }))
            .await
        {
            tracing::debug!("releaseObject {} failed: {}", object_id, e);
        }
    }
}

/// `Runtime.RemoteObject`, reduced to the fields this crate reads.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteObject {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub subtype: Option<String>,
    pub object_id: Option<String>,
    pub value: Option<Value>,
    pub description: Option<String>,
}

impl RemoteObject {
    fn from_response(response: Value) -> Result<Self> {
        if let Some(details) = response.get("exceptionDetails") {
            let text = details
                .get("exception")
                .and_then(|e| e.get("description"))
                .and_then(Value::as_str)
                .or_else(|| details.get("text").and_then(Value::as_str))
                .unwrap_or("uncaught exception");
            return Err(BrowserAgentError::JavaScriptFailed(text.to_string()));
        }

        let result = response.get("result").cloned().unwrap_or(Value::Null);
        Ok(serde_json::from_value(result)?)
    }

    pub fn is_null(&self) -> bool {
        self.subtype.as_deref() == Some("null") || self.kind == "undefined"
    }

    /// The handle of a non-null object result.
    pub fn handle(&self) -> Option<&str> {
        if self.is_null() {
            None
        } else {
            self.object_id.as_deref()
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.value.as_ref().and_then(Value::as_bool)
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.value.as_ref().and_then(Value::as_f64)
    }

    pub fn as_str(&self) -> Option<&str> {
        self.value.as_ref().and_then(Value::as_str)
    }
}

/// Network and lifecycle signals consumed by the settle detector.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    RequestWillBeSent {
        request_id: String,
        url: String,
        resource_type: Option<String>,
        frame_id: Option<String>,
    },
    LoadingFinished {
        request_id: String,
    },
    LoadingFailed {
        request_id: String,
    },
    ServedFromCache {
        request_id: String,
    },
    ResponseReceived {
        request_id: String,
        url: String,
    },
    FrameStoppedLoading {
        frame_id: String,
    },
}

impl NetworkEvent {
    /// Decode a raw protocol event (`method` + `params`).
    pub fn from_protocol(method: &str, params: &Value) -> Option<Self> {
        let field = |name: &str| params.get(name).and_then(Value::as_str).map(str::to_string);
        let request_id = || field("requestId");

        match method {
            "Network.requestWillBeSent" => Some(NetworkEvent::RequestWillBeSent {
                request_id: request_id()?,
                url: params
                    .get("request")
                    .and_then(|r| r.get("url"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                resource_type: field("type"),
                frame_id: field("frameId"),
            }),
            "Network.loadingFinished" => Some(NetworkEvent::LoadingFinished {
                request_id: request_id()?,
            }),
            "Network.loadingFailed" => Some(NetworkEvent::LoadingFailed {
                request_id: request_id()?,
            }),
            "Network.requestServedFromCache" => Some(NetworkEvent::ServedFromCache {
                request_id: request_id()?,
            }),
            "Network.responseReceived" => Some(NetworkEvent::ResponseReceived {
                request_id: request_id()?,
                url: params
                    .get("response")
                    .and_then(|r| r.get("url"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            "Page.frameStoppedLoading" => Some(NetworkEvent::FrameStoppedLoading {
                frame_id: field("frameId")?,
            }),
            _ => None,
        }
    }
}

/// Scoped event subscription; the release hook runs exactly once, on drop.
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new<F>(release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            release: Some(Box::new(release)),
        }
    }

    pub fn noop() -> Self {
        Self { release: None }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.release.is_some())
            .finish()
    }
}

/// Shared, debuggable handle to a protocol session.
#[derive(Clone)]
pub struct SessionHandle(pub Arc<dyn CdpSession>);

impl SessionHandle {
    pub fn new(session: Arc<dyn CdpSession>) -> Self {
        Self(session)
    }

    pub fn same_session(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Deref for SessionHandle {
    type Target = dyn CdpSession;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SessionHandle")
            .field(&self.0.session_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_network_event_decoding() {
        let event = NetworkEvent::from_protocol(
            "Network.requestWillBeSent",
            &json!({
                "requestId": "r1",
                "type": "XHR",
                "frameId": "F1",
                "request": { "url": "https://example.com/api" }
            }),
        );
        assert_eq!(
            event,
            Some(NetworkEvent::RequestWillBeSent {
                request_id: "r1".into(),
                url: "https://example.com/api".into(),
                resource_type: Some("XHR".into()),
                frame_id: Some("F1".into()),
            })
        );

        assert!(NetworkEvent::from_protocol("Network.loadingFinished", &json!({})).is_none());
        assert!(NetworkEvent::from_protocol("Page.loadEventFired", &json!({})).is_none());
    }

    #[test]
    fn test_remote_object_exception_is_error() {
        let response = json!({
            "result": { "type": "object" },
            "exceptionDetails": { "text": "Uncaught", "exception": { "description": "TypeError: boom" } }
        });
        match RemoteObject::from_response(response) {
            Err(BrowserAgentError::JavaScriptFailed(msg)) => assert_eq!(msg, "TypeError: boom"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_remote_object_null_has_no_handle() {
        let null = RemoteObject::from_response(json!({
            "result": { "type": "object", "subtype": "null", "value": null }
        }))
        .unwrap();
        assert!(null.handle().is_none());

        let node = RemoteObject::from_response(json!({
            "result": { "type": "object", "subtype": "node", "objectId": "obj-1" }
        }))
        .unwrap();
        assert_eq!(node.handle(), Some("obj-1"));
    }

    #[test]
    fn test_subscription_releases_once_on_drop() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let subscription = Subscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(subscription);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
