use crate::core::config::SettleConfig;
use crate::core::{CdpSession, NetworkEvent};
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleState {
    /// Requests are in flight.
    WaitingForQuiet,
    /// Nothing in flight; the quiet timer is running.
    QuietPending,
    Settled,
    TimedOut,
}

impl SettleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SettleState::Settled | SettleState::TimedOut)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SettleSignal {
    Network(NetworkEvent),
    /// The quiet timer armed at `generation` ran out.
    QuietElapsed { generation: u64 },
    Sweep,
    GlobalTimeout,
}

/// What the driver loop must do with the quiet timer after a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCommand {
    Keep,
    ArmQuiet { generation: u64 },
    CancelQuiet,
}

#[derive(Debug, Clone)]
struct InflightRequest {
    url: String,
    started_at: Instant,
}

/// Pure transition logic of the settle detector. Time only enters through
/// the `now` passed to [`SettleMachine::handle`].
#[derive(Debug)]
pub struct SettleMachine {
    state: SettleState,
    inflight: HashMap<String, InflightRequest>,
    document_by_frame: HashMap<String, String>,
    generation: u64,
    stalled_after: Duration,
}

impl SettleMachine {
    /// Starts in `QuietPending` at generation 0; the caller arms the first
    /// quiet timer.
    pub fn new(stalled_after: Duration) -> Self {
        Self {
            state: SettleState::QuietPending,
            inflight: HashMap::new(),
            document_by_frame: HashMap::new(),
            generation: 0,
            stalled_after,
        }
    }

    pub fn state(&self) -> SettleState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn outstanding(&self) -> usize {
        self.inflight.len()
    }

    pub fn handle(&mut self, signal: SettleSignal, now: Instant) -> TimerCommand {
        if self.state.is_terminal() {
            return TimerCommand::Keep;
        }

        match signal {
            SettleSignal::Network(event) => self.on_network(event, now),
            SettleSignal::QuietElapsed { generation } => {
                if self.state == SettleState::QuietPending && generation == self.generation {
                    self.state = SettleState::Settled;
                }
                TimerCommand::Keep
            }
            SettleSignal::Sweep => {
                let stalled: Vec<String> = self
                    .inflight
                    .iter()
                    .filter(|(_, r)| now.duration_since(r.started_at) > self.stalled_after)
                    .map(|(id, _)| id.clone())
                    .collect();
                for request_id in &stalled {
                    if let Some(request) = self.inflight.get(request_id) {
                        debug!("Forcing completion of stalled request {}", request.url);
                    }
                    self.forget(request_id);
                }
                self.after_completion()
            }
            SettleSignal::GlobalTimeout => {
                self.state = SettleState::TimedOut;
                TimerCommand::CancelQuiet
            }
        }
    }

    fn on_network(&mut self, event: NetworkEvent, now: Instant) -> TimerCommand {
        match event {
            NetworkEvent::RequestWillBeSent {
                request_id,
                url,
                resource_type,
                frame_id,
            } => {
                let streaming = matches!(
                    resource_type.as_deref(),
                    Some("WebSocket") | Some("EventSource")
                );
                if streaming || url.starts_with("data:") {
                    return TimerCommand::Keep;
                }
                if resource_type.as_deref() == Some("Document") {
                    if let Some(frame_id) = frame_id {
                        self.document_by_frame.insert(frame_id, request_id.clone());
                    }
                }
                self.inflight.insert(
                    request_id,
                    InflightRequest {
                        url,
                        started_at: now,
                    },
                );

                if self.state == SettleState::QuietPending {
                    self.state = SettleState::WaitingForQuiet;
                    self.generation += 1;
                    return TimerCommand::CancelQuiet;
                }
                TimerCommand::Keep
            }
            NetworkEvent::LoadingFinished { request_id }
            | NetworkEvent::LoadingFailed { request_id }
            | NetworkEvent::ServedFromCache { request_id } => {
                self.forget(&request_id);
                self.after_completion()
            }
            NetworkEvent::ResponseReceived { request_id, url } => {
                if url.starts_with("data:") {
                    self.forget(&request_id);
                }
                self.after_completion()
            }
            NetworkEvent::FrameStoppedLoading { frame_id } => {
                if let Some(request_id) = self.document_by_frame.remove(&frame_id) {
                    self.forget(&request_id);
                }
                self.after_completion()
            }
        }
    }

    fn forget(&mut self, request_id: &str) {
        self.inflight.remove(request_id);
        self.document_by_frame.retain(|_, id| id != request_id);
    }

    fn after_completion(&mut self) -> TimerCommand {
        if self.state == SettleState::WaitingForQuiet && self.inflight.is_empty() {
            self.state = SettleState::QuietPending;
            self.generation += 1;
            TimerCommand::ArmQuiet {
                generation: self.generation,
            }
        } else {
            TimerCommand::Keep
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SettleReport {
    pub state: SettleState,
    pub outstanding: usize,
    pub used_fallback: bool,
    pub elapsed: Duration,
}

/// Aborts the wrapped task when dropped.
struct TaskGuard(JoinHandle<()>);

impl TaskGuard {
    fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self(tokio::spawn(future))
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct SettleDetector {
    config: SettleConfig,
}

impl SettleDetector {
    pub fn new(config: SettleConfig) -> Self {
        Self { config }
    }

    /// Waits until the page has been network-quiet for the configured
    /// window, or `timeout` (default: the configured global timeout) runs
    /// out. Never fails; a session that cannot report network events gets
    /// a fixed wait instead.
    pub async fn wait(&self, session: &dyn CdpSession, timeout: Option<Duration>) -> SettleReport {
        let started = Instant::now();
        let timeout = timeout.unwrap_or_else(|| self.config.global_timeout());

        let (signal_tx, mut signals) = mpsc::unbounded_channel::<SettleSignal>();
        let (network_tx, mut network) = mpsc::unbounded_channel::<NetworkEvent>();

        let subscription = match session.subscribe_network(network_tx).await {
            Ok(subscription) => subscription,
            Err(e) => return self.fallback(started, timeout, &e.to_string()).await,
        };
        for method in ["Network.enable", "Page.enable"] {
            if let Err(e) = session.send(method, json!({})).await {
                drop(subscription);
                return self.fallback(started, timeout, &e.to_string()).await;
            }
        }

        let _forwarder = TaskGuard::spawn({
            let tx = signal_tx.clone();
            async move {
                while let Some(event) = network.recv().await {
                    if tx.send(SettleSignal::Network(event)).is_err() {
                        break;
                    }
                }
            }
        });
        let _sweeper = TaskGuard::spawn({
            let tx = signal_tx.clone();
            let period = self.config.sweep_interval();
            async move {
                loop {
                    tokio::time::sleep(period).await;
                    if tx.send(SettleSignal::Sweep).is_err() {
                        break;
                    }
                }
            }
        });
        let _global = TaskGuard::spawn({
            let tx = signal_tx.clone();
            async move {
                tokio::time::sleep(timeout).await;
                let _ = tx.send(SettleSignal::GlobalTimeout);
            }
        });

        let mut machine = SettleMachine::new(self.config.stalled_request());
        let mut quiet = Some(self.arm_quiet(&signal_tx, machine.generation()));

        while !machine.state().is_terminal() {
            let Some(signal) = signals.recv().await else {
                break;
            };
            match machine.handle(signal, Instant::now()) {
                TimerCommand::Keep => {}
                TimerCommand::ArmQuiet { generation } => {
                    quiet = Some(self.arm_quiet(&signal_tx, generation));
                }
                TimerCommand::CancelQuiet => quiet = None,
            }
        }
        drop(quiet);
        drop(subscription);

        let report = SettleReport {
            state: machine.state(),
            outstanding: machine.outstanding(),
            used_fallback: false,
            elapsed: started.elapsed(),
        };
        match report.state {
            SettleState::Settled => debug!("DOM settled after {:?}", report.elapsed),
            _ => warn!(
                "DOM settle timed out after {:?} with {} requests outstanding",
                report.elapsed, report.outstanding
            ),
        }
        report
    }

    fn arm_quiet(&self, tx: &mpsc::UnboundedSender<SettleSignal>, generation: u64) -> TaskGuard {
        let tx = tx.clone();
        let window = self.config.quiet_window();
        TaskGuard::spawn(async move {
            tokio::time::sleep(window).await;
            let _ = tx.send(SettleSignal::QuietElapsed { generation });
        })
    }

    async fn fallback(&self, started: Instant, timeout: Duration, reason: &str) -> SettleReport {
        let wait = Duration::from_millis(self.config.fallback_wait_ms).min(timeout);
        info!("Network events unavailable ({}); waiting {:?} instead", reason, wait);
        tokio::time::sleep(wait).await;
        SettleReport {
            state: SettleState::Settled,
            outstanding: 0,
            used_fallback: true,
            elapsed: started.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeNode, FakeSession};
    use std::sync::Arc;

    fn request(id: &str, url: &str, kind: Option<&str>) -> NetworkEvent {
        NetworkEvent::RequestWillBeSent {
            request_id: id.into(),
            url: url.into(),
            resource_type: kind.map(str::to_string),
            frame_id: Some("main".into()),
        }
    }

    fn finished(id: &str) -> NetworkEvent {
        NetworkEvent::LoadingFinished {
            request_id: id.into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_machine_ignores_stale_quiet_timers() {
        let now = Instant::now();
        let mut machine = SettleMachine::new(Duration::from_secs(2));
        assert_eq!(machine.state(), SettleState::QuietPending);

        let cmd = machine.handle(SettleSignal::Network(request("r1", "https://a.test/x", Some("XHR"))), now);
        assert_eq!(cmd, TimerCommand::CancelQuiet);
        assert_eq!(machine.state(), SettleState::WaitingForQuiet);

        machine.handle(SettleSignal::QuietElapsed { generation: 0 }, now);
        assert_eq!(machine.state(), SettleState::WaitingForQuiet);

        let cmd = machine.handle(SettleSignal::Network(finished("r1")), now);
        assert_eq!(cmd, TimerCommand::ArmQuiet { generation: 2 });
        machine.handle(SettleSignal::QuietElapsed { generation: 1 }, now);
        assert_eq!(machine.state(), SettleState::QuietPending);
        machine.handle(SettleSignal::QuietElapsed { generation: 2 }, now);
        assert_eq!(machine.state(), SettleState::Settled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_machine_request_bookkeeping() {
        let now = Instant::now();
        let mut machine = SettleMachine::new(Duration::from_secs(2));

        machine.handle(SettleSignal::Network(request("ws", "wss://a.test/", Some("WebSocket"))), now);
        machine.handle(SettleSignal::Network(request("img", "data:image/png;base64,AA", None)), now);
        assert_eq!(machine.outstanding(), 0);
        assert_eq!(machine.state(), SettleState::QuietPending);

        machine.handle(SettleSignal::Network(request("doc", "https://a.test/", Some("Document"))), now);
        machine.handle(
            SettleSignal::Network(NetworkEvent::FrameStoppedLoading {
                frame_id: "main".into(),
            }),
            now,
        );
        assert_eq!(machine.outstanding(), 0);

        machine.handle(SettleSignal::Network(request("slow", "https://a.test/slow", None)), now);
        machine.handle(SettleSignal::Sweep, now + Duration::from_millis(1500));
        assert_eq!(machine.outstanding(), 1);
        let cmd = machine.handle(SettleSignal::Sweep, now + Duration::from_millis(2500));
        assert_eq!(machine.outstanding(), 0);
        assert!(matches!(cmd, TimerCommand::ArmQuiet { .. }));

        machine.handle(SettleSignal::GlobalTimeout, now);
        assert_eq!(machine.state(), SettleState::TimedOut);
    }

    fn spawn_wait(
        session: Arc<FakeSession>,
        config: SettleConfig,
    ) -> tokio::task::JoinHandle<SettleReport> {
        tokio::spawn(async move { SettleDetector::new(config).wait(&*session, None).await })
    }

    fn blank_session() -> Arc<FakeSession> {
        Arc::new(FakeSession::new("root", FakeNode::document(vec![])))
    }

    #[tokio::test(start_paused = true)]
    async fn test_settles_one_quiet_window_after_last_request() {
        let session = blank_session();
        let task = spawn_wait(session.clone(), SettleConfig::default());

        tokio::time::sleep(Duration::from_millis(10)).await;
        session.emit(request("r1", "https://a.test/api", Some("XHR")));
        tokio::time::sleep(Duration::from_millis(300)).await;
        session.emit(finished("r1"));

        let report = task.await.unwrap();
        assert_eq!(report.state, SettleState::Settled);
        assert!(!report.used_fallback);
        assert!(report.elapsed >= Duration::from_millis(810), "{:?}", report.elapsed);
        assert!(report.elapsed <= Duration::from_millis(310 + 500 + 500), "{:?}", report.elapsed);
        assert_eq!(session.active_subscriptions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_request_is_swept() {
        let session = blank_session();
        let task = spawn_wait(session.clone(), SettleConfig::default());

        tokio::time::sleep(Duration::from_millis(10)).await;
        session.emit(request("stuck", "https://a.test/poll", Some("XHR")));

        let report = task.await.unwrap();
        assert_eq!(report.state, SettleState::Settled);
        assert!(report.elapsed >= Duration::from_millis(2500), "{:?}", report.elapsed);
        assert!(report.elapsed < Duration::from_millis(3100), "{:?}", report.elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_timeout_always_resolves() {
        let session = blank_session();
        let config = SettleConfig::default().with_global_timeout_ms(3000);
        let task = spawn_wait(session.clone(), config);

        let emitter = tokio::spawn({
            let session = session.clone();
            async move {
                for i in 0..60 {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    session.emit(request(&format!("r{}", i), "https://a.test/feed", Some("Fetch")));
                }
            }
        });

        let report = task.await.unwrap();
        assert_eq!(report.state, SettleState::TimedOut);
        assert!(report.outstanding > 0);
        assert!(report.elapsed >= Duration::from_millis(3000));
        assert!(report.elapsed < Duration::from_millis(3050), "{:?}", report.elapsed);
        assert_eq!(session.active_subscriptions(), 0);
        emitter.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignored_requests_do_not_block() {
        let session = blank_session();
        let task = spawn_wait(session.clone(), SettleConfig::default());

        tokio::time::sleep(Duration::from_millis(10)).await;
        session.emit(request("ws", "wss://a.test/live", Some("WebSocket")));
        session.emit(request("inline", "data:text/plain,hi", Some("Other")));

        let report = task.await.unwrap();
        assert_eq!(report.state, SettleState::Settled);
        assert!(report.elapsed >= Duration::from_millis(500));
        assert!(report.elapsed < Duration::from_millis(510), "{:?}", report.elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_failure_falls_back_to_fixed_wait() {
        let session = blank_session();
        session.fail_method("Network.enable");

        let report = SettleDetector::new(SettleConfig::default())
            .wait(&*session, None)
            .await;
        assert!(report.used_fallback);
        assert!(report.elapsed >= Duration::from_millis(1000));
        assert!(report.elapsed < Duration::from_millis(1010), "{:?}", report.elapsed);
        assert_eq!(session.active_subscriptions(), 0);
    }
}
