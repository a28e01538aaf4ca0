//! Tasks that run beside the control loop. Each owns a cancellation token
//! and is stopped explicitly at shutdown.

use super::Orchestrator;
use crate::interfaces::{deliver, Alert, AlertLevel, Notifier, Strategy};
use crate::state::{AppState, ControlCommand, WsMessage};
use portable_atomic::Ordering;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Spawned {
    name: &'static str,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub struct TaskSet {
    tasks: Vec<Spawned>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The closure receives the task's own token.
    pub fn spawn<F, Fut>(&mut self, name: &'static str, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(task(cancel.clone()));
        tracing::info!(task = name, "background task started");
        self.tasks.push(Spawned { name, cancel, handle });
    }

    /// Cancel every task, wait up to `grace` for each, abort the rest.
    /// Returns how many had to be aborted.
    pub async fn shutdown(self, grace: Duration) -> usize {
        for t in &self.tasks {
            t.cancel.cancel();
        }
        let mut aborted = 0;
        for t in self.tasks {
            let mut handle = t.handle;
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                tracing::warn!(task = t.name, grace = ?grace, "background task ignored cancellation; aborting");
                handle.abort();
                aborted += 1;
            } else {
                tracing::info!(task = t.name, "background task stopped");
            }
        }
        aborted
    }
}

// ── Analysis ──

/// Runs the strategy's research pass every `every`, first pass immediately.
/// A pass is bounded by the interval itself.
pub async fn run_analysis(strategy: Arc<dyn Strategy>, app: Arc<AppState>, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let pass = tokio::time::timeout(every, strategy.background_analysis());
        tokio::select! {
            _ = cancel.cancelled() => break,
            r = pass => match r {
                Ok(Ok(())) => tracing::debug!("background analysis pass complete"),
                Ok(Err(e)) => {
                    app.counters.errors_recovered.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, "background analysis failed");
                }
                Err(_) => tracing::warn!(limit = ?every, "background analysis timed out"),
            },
        }
    }

    tracing::info!("analysis task exiting");
}

// ── Notification listener ──

/// Operator-facing traffic in both directions: start/stop requests come in
/// on `control_rx`, loop events go out to the notifier. Emergencies and stop
/// hits are alerted at their source and are not repeated here.
pub async fn run_listener(
    orchestrator: Arc<Orchestrator>,
    mut control_rx: mpsc::Receiver<ControlCommand>,
    mut events: broadcast::Receiver<WsMessage>,
    notifier: Arc<dyn Notifier>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            cmd = control_rx.recv() => match cmd {
                Some(ControlCommand::Start { reply }) => {
                    let _ = reply.send(orchestrator.start().await);
                }
                Some(ControlCommand::Stop { reply }) => {
                    let _ = reply.send(orchestrator.stop().await);
                }
                None => break,
            },
            msg = events.recv() => match msg {
                Ok(msg) => {
                    if let Some(alert) = alert_for(&msg) {
                        deliver(notifier.as_ref(), alert).await;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "notification listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    tracing::info!("notification listener exiting");
}

fn alert_for(msg: &WsMessage) -> Option<Alert> {
    match msg {
        WsMessage::OrderFilled { ticker, side, quantity, price, reason, realized_pnl, .. } => {
            let pnl = realized_pnl.map(|p| format!(", pnl {p:.2}")).unwrap_or_default();
            Some(Alert::new(
                AlertLevel::Info,
                format!("{side} {ticker}"),
                format!("{quantity} @ {price:.2} ({reason}){pnl}"),
            ))
        }
        WsMessage::EngineStateMsg { state, reason } => {
            let level = if state == "running" { AlertLevel::Info } else { AlertLevel::Warning };
            Some(Alert::new(level, format!("Engine {state}"), reason.clone()))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::EngineResult;
    use crate::orchestrator::runner::tests::ScriptedStrategy;
    use crate::orchestrator::tests::orchestrator;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    #[derive(Default)]
    struct Recorder {
        titles: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl Notifier for Recorder {
        async fn notify(&self, alert: &Alert) -> EngineResult<()> {
            self.titles.lock().unwrap().push(alert.title.clone());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_analysis_runs_on_interval_until_cancelled() {
        let (_orch, app) = orchestrator();
        let strategy = Arc::new(ScriptedStrategy::default());
        let mut tasks = TaskSet::new();
        let s = strategy.clone();
        tasks.spawn("analysis", move |cancel| run_analysis(s, app, Duration::from_secs(60), cancel));

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(strategy.analyses.load(Ordering::SeqCst), 3, "passes at 0s, 60s, 120s");

        assert_eq!(tasks.shutdown(Duration::from_secs(1)).await, 0);
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(strategy.analyses.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_stuck_task() {
        let finished = Arc::new(AtomicBool::new(false));
        let mut tasks = TaskSet::new();
        tasks.spawn("polite", |cancel| async move { cancel.cancelled().await });
        let f = finished.clone();
        tasks.spawn("stuck", move |_cancel| async move {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            f.store(true, Ordering::SeqCst);
        });

        assert_eq!(tasks.shutdown(Duration::from_secs(2)).await, 1);
        tokio::time::sleep(Duration::from_secs(7_200)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_listener_serves_control_and_relays_events() {
        let (orch, app) = orchestrator();
        let orch = Arc::new(orch);
        let recorder = Arc::new(Recorder::default());
        let (control_tx, control_rx) = mpsc::channel(4);

        let mut tasks = TaskSet::new();
        let (o, events, n) = (orch.clone(), app.ws_tx.subscribe(), recorder.clone());
        tasks.spawn("listener", move |cancel| run_listener(o, control_rx, events, n, cancel));

        let (reply, rx) = oneshot::channel();
        control_tx.send(ControlCommand::Start { reply }).await.unwrap();
        assert!(rx.await.unwrap());
        assert!(orch.is_running().await);

        app.broadcast(WsMessage::OrderFilled {
            ticker: "SPY".into(),
            side: "sell".into(),
            quantity: 2.0,
            price: 510.0,
            reason: "trailing".into(),
            realized_pnl: Some(20.0),
            timestamp: "2026-06-10T14:00:00Z".into(),
        });
        let relayed = |title: &str| recorder.titles.lock().unwrap().iter().any(|t| t == title);
        tokio::time::timeout(Duration::from_secs(5), async {
            while !(relayed("Engine running") && relayed("sell SPY")) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("fill and state change relayed");

        let (reply, rx) = oneshot::channel();
        control_tx.send(ControlCommand::Stop { reply }).await.unwrap();
        assert!(rx.await.unwrap());
        assert!(!orch.is_running().await);

        assert_eq!(tasks.shutdown(Duration::from_secs(5)).await, 0);
    }

    #[test]
    fn test_emergencies_not_repeated() {
        let msg = WsMessage::Emergency {
            event_type: crate::emergency::EmergencyKind::FlashCrash,
            trigger_value: -6.0,
            detail: "NVDA".into(),
            timestamp: String::new(),
        };
        assert!(alert_for(&msg).is_none());
    }
}
