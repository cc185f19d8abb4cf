//! Child-target bookkeeping for one Chrome tab.
//!
//! With site isolation on, cross-origin iframes run in their own renderer
//! and are exposed as `iframe` targets. The tab session auto-attaches to
//! them (non-flattened), so every command for such a frame travels as a
//! `Target.sendMessageToTarget` envelope and every reply or event comes back
//! wrapped in `Target.receivedMessageFromTarget`. `TargetRouter` tracks the
//! attached sessions, builds the envelopes and unwraps what comes back.

use crate::core::NetworkEvent;
use crate::errors::{BrowserAgentError, Result};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// An out-of-process frame the tab is attached to.
#[derive(Debug, Clone, PartialEq)]
pub struct AttachedTarget {
    /// Target id, equal to the protocol frame id of the iframe.
    pub target_id: String,
    pub session_id: String,
    /// Session the target was attached through; `None` for the tab session.
    pub parent_session: Option<String>,
    pub url: String,
}

type Reply = oneshot::Sender<Result<Value>>;

#[derive(Default)]
pub struct TargetRouter {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, Reply>>,
    attached: Mutex<Vec<AttachedTarget>>,
    sinks: Mutex<Vec<(u64, String, mpsc::UnboundedSender<NetworkEvent>)>>,
    next_subscription: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TargetRouter {
    pub fn new() -> Self {
        Self {
            // Tab-level ids are assigned by the driver; keep ours visibly apart.
            next_id: AtomicU64::new(1_000_000),
            ..Default::default()
        }
    }

    pub fn target(&self, target_id: &str) -> Option<AttachedTarget> {
        lock(&self.attached)
            .iter()
            .find(|t| t.target_id == target_id)
            .cloned()
    }

    /// Attached targets in attachment order.
    pub fn targets(&self) -> Vec<AttachedTarget> {
        lock(&self.attached).clone()
    }

    pub fn register(&self, target: AttachedTarget) {
        let mut attached = lock(&self.attached);
        attached.retain(|t| t.target_id != target.target_id);
        debug!(
            "Attached to frame target {} as session {}",
            target.target_id, target.session_id
        );
        attached.push(target);
    }

    /// Prepares a command for `session_id`: the returned receiver gets its
    /// reply and the value is the `Target.sendMessageToTarget` params to
    /// send on the tab session.
    pub fn envelope(
        &self,
        session_id: &str,
        method: &str,
        params: Value,
    ) -> (u64, oneshot::Receiver<Result<Value>>, Value) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);

        let mut message = json!({ "id": id, "method": method, "params": params }).to_string();
        let mut session = session_id.to_string();
        let mut seen = HashSet::new();
        loop {
            let outer = json!({ "sessionId": session, "message": message });
            let parent = self.parent_of(&session).filter(|_| seen.insert(session.clone()));
            match parent {
                Some(parent) => {
                    let relay = self.next_id.fetch_add(1, Ordering::SeqCst);
                    message = json!({
                        "id": relay,
                        "method": "Target.sendMessageToTarget",
                        "params": outer,
                    })
                    .to_string();
                    session = parent;
                }
                None => return (id, rx, outer),
            }
        }
    }

    /// Drops a command that will never be answered.
    pub fn forget(&self, id: u64) {
        lock(&self.pending).remove(&id);
    }

    pub fn subscribe(&self, session_id: &str, sink: mpsc::UnboundedSender<NetworkEvent>) -> u64 {
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        lock(&self.sinks).push((id, session_id.to_string(), sink));
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        lock(&self.sinks).retain(|(sub, _, _)| *sub != id);
    }

    fn parent_of(&self, session_id: &str) -> Option<String> {
        lock(&self.attached)
            .iter()
            .find(|t| t.session_id == session_id)
            .and_then(|t| t.parent_session.clone())
    }

    /// Feeds one `Target.*` event seen on `via` (`None` for the tab session).
    ///
    /// Returns the sessions of frame targets attached while handling it, so
    /// the caller can turn auto-attach on inside them as well.
    pub fn route(&self, method: &str, params: &Value, via: Option<&str>) -> Vec<String> {
        let text = |v: &Value, key: &str| v.get(key).and_then(Value::as_str).map(str::to_string);

        match method {
            "Target.attachedToTarget" => {
                let info = params.get("targetInfo").cloned().unwrap_or_default();
                let (Some(session_id), Some(target_id)) =
                    (text(params, "sessionId"), text(&info, "targetId"))
                else {
                    return Vec::new();
                };
                if text(&info, "type").as_deref() != Some("iframe") {
                    trace!("Ignoring attached {:?} target {}", text(&info, "type"), target_id);
                    return Vec::new();
                }
                self.register(AttachedTarget {
                    target_id,
                    session_id: session_id.clone(),
                    parent_session: via.map(str::to_string),
                    url: text(&info, "url").unwrap_or_default(),
                });
                vec![session_id]
            }
            "Target.detachedFromTarget" => {
                if let Some(session_id) = text(params, "sessionId") {
                    lock(&self.attached).retain(|t| t.session_id != session_id);
                    lock(&self.sinks).retain(|(_, s, _)| *s != session_id);
                }
                Vec::new()
            }
            "Target.receivedMessageFromTarget" => {
                let Some(session_id) = text(params, "sessionId") else {
                    return Vec::new();
                };
                let raw = params.get("message").and_then(Value::as_str).unwrap_or_default();
                let message: Value = match serde_json::from_str(raw) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("Unreadable message from session {}: {}", session_id, e);
                        return Vec::new();
                    }
                };
                self.unwrap_message(&session_id, &message)
            }
            _ => Vec::new(),
        }
    }

    fn unwrap_message(&self, session_id: &str, message: &Value) -> Vec<String> {
        if let Some(id) = message.get("id").and_then(Value::as_u64) {
            let Some(reply) = lock(&self.pending).remove(&id) else {
                return Vec::new();
            };
            let outcome = match message.get("error") {
                Some(error) => Err(BrowserAgentError::Protocol(
                    error
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| error.to_string()),
                )),
                None => Ok(message.get("result").cloned().unwrap_or_else(|| json!({}))),
            };
            let _ = reply.send(outcome);
            return Vec::new();
        }

        let Some(method) = message.get("method").and_then(Value::as_str) else {
            return Vec::new();
        };
        let params = message.get("params").cloned().unwrap_or_default();
        if let Some(event) = NetworkEvent::from_protocol(method, &params) {
            lock(&self.sinks)
                .iter()
                .filter(|(_, s, _)| s == session_id)
                .for_each(|(_, _, sink)| {
                    let _ = sink.send(event.clone());
                });
        }
        self.route(method, &params, Some(session_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attached(session: &str, target: &str, kind: &str) -> Value {
        json!({
            "sessionId": session,
            "targetInfo": { "targetId": target, "type": kind, "url": "https://other.test/" },
            "waitingForDebugger": false,
        })
    }

    fn from_target(session: &str, message: Value) -> Value {
        json!({ "sessionId": session, "message": message.to_string() })
    }

    #[test]
    fn test_only_iframe_targets_are_registered() {
        let router = TargetRouter::new();
        assert_eq!(
            router.route("Target.attachedToTarget", &attached("S1", "F1", "iframe"), None),
            vec!["S1"]
        );
        assert!(router
            .route("Target.attachedToTarget", &attached("S2", "W1", "worker"), None)
            .is_empty());

        let target = router.target("F1").unwrap();
        assert_eq!(target.session_id, "S1");
        assert_eq!(target.parent_session, None);
        assert!(router.target("W1").is_none());

        router.route("Target.detachedFromTarget", &json!({ "sessionId": "S1" }), None);
        assert!(router.targets().is_empty());
    }

    #[tokio::test]
    async fn test_replies_resolve_pending_commands() {
        let router = TargetRouter::new();
        router.route("Target.attachedToTarget", &attached("S1", "F1", "iframe"), None);

        let (id, rx, outer) = router.envelope("S1", "DOM.getDocument", json!({ "depth": -1 }));
        assert_eq!(outer["sessionId"], "S1");
        let inner: Value = serde_json::from_str(outer["message"].as_str().unwrap()).unwrap();
        assert_eq!(inner["method"], "DOM.getDocument");
        assert_eq!(inner["id"], id);

        router.route(
            "Target.receivedMessageFromTarget",
            &from_target("S1", json!({ "id": id, "result": { "root": { "nodeId": 1 } } })),
            None,
        );
        assert_eq!(rx.await.unwrap().unwrap()["root"]["nodeId"], 1);

        let (id, rx, _) = router.envelope("S1", "DOM.describeNode", json!({}));
        router.route(
            "Target.receivedMessageFromTarget",
            &from_target("S1", json!({ "id": id, "error": { "code": -32000, "message": "No node" } })),
            None,
        );
        assert!(matches!(rx.await.unwrap(), Err(BrowserAgentError::Protocol(m)) if m == "No node"));
    }

    #[tokio::test]
    async fn test_nested_targets_are_relayed_through_their_parent() {
        let router = TargetRouter::new();
        router.route("Target.attachedToTarget", &attached("S1", "F1", "iframe"), None);
        let nested = router.route(
            "Target.receivedMessageFromTarget",
            &from_target(
                "S1",
                json!({ "method": "Target.attachedToTarget", "params": attached("S2", "F2", "iframe") }),
            ),
            None,
        );
        assert_eq!(nested, vec!["S2"]);
        assert_eq!(router.target("F2").unwrap().parent_session.as_deref(), Some("S1"));

        let (id, rx, outer) = router.envelope("S2", "Page.getFrameTree", json!({}));
        assert_eq!(outer["sessionId"], "S1");
        let relay: Value = serde_json::from_str(outer["message"].as_str().unwrap()).unwrap();
        assert_eq!(relay["method"], "Target.sendMessageToTarget");
        assert_eq!(relay["params"]["sessionId"], "S2");

        let reply = from_target("S2", json!({ "id": id, "result": { "ok": true } }));
        router.route(
            "Target.receivedMessageFromTarget",
            &from_target("S1", json!({ "method": "Target.receivedMessageFromTarget", "params": reply })),
            None,
        );
        assert_eq!(rx.await.unwrap().unwrap()["ok"], true);
    }

    #[test]
    fn test_child_network_events_reach_only_their_session() {
        let router = TargetRouter::new();
        router.route("Target.attachedToTarget", &attached("S1", "F1", "iframe"), None);
        router.route("Target.attachedToTarget", &attached("S2", "F2", "iframe"), None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = router.subscribe("S1", tx);

        let event = |session: &str| {
            from_target(
                session,
                json!({
                    "method": "Network.loadingFinished",
                    "params": { "requestId": "r1", "timestamp": 1.0 },
                }),
            )
        };
        router.route("Target.receivedMessageFromTarget", &event("S2"), None);
        assert!(rx.try_recv().is_err());
        router.route("Target.receivedMessageFromTarget", &event("S1"), None);
        assert!(rx.try_recv().is_ok());

        router.unsubscribe(subscription);
        router.route("Target.receivedMessageFromTarget", &event("S1"), None);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_abandoned_commands_are_forgotten() {
        let router = TargetRouter::new();
        let (id, _rx, _) = router.envelope("S1", "DOM.enable", json!({}));
        router.forget(id);
        router.route(
            "Target.receivedMessageFromTarget",
            &from_target("S1", json!({ "id": id, "result": {} })),
            None,
        );
        assert!(lock(&router.pending).is_empty());
    }
}
