pub mod background;
pub mod runner;
pub mod scheduler;

use crate::emergency::RecoveryReport;
use chrono::Utc;
use runner::{ControlPlane, StepOutcome};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct RunHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the control loop task. At most one run at a time.
pub struct Orchestrator {
    plane: Arc<Mutex<ControlPlane>>,
    running: Mutex<Option<RunHandle>>,
    stop_timeout: std::time::Duration,
}

impl Orchestrator {
    pub fn new(plane: ControlPlane, stop_timeout: std::time::Duration) -> Self {
        Self {
            plane: Arc::new(Mutex::new(plane)),
            running: Mutex::new(None),
            stop_timeout,
        }
    }

    pub async fn recover(&self) -> RecoveryReport {
        self.plane.lock().await.recover(Utc::now()).await
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|run| !run.handle.is_finished())
    }

    /// Returns false when a run is already in progress.
    pub async fn start(&self) -> bool {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|run| !run.handle.is_finished()) {
            tracing::warn!("start ignored: control loop already running");
            return false;
        }

        self.plane.lock().await.begin_run(Utc::now());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(self.plane.clone(), cancel.clone()));
        *running = Some(RunHandle { cancel, handle });
        true
    }

    /// Cancel the sleep, let an in-flight step finish within the timeout,
    /// then abort. Returns false when nothing was running. The run slot stays
    /// locked until the plane reports stopped, so a concurrent `start` waits.
    pub async fn stop(&self) -> bool {
        let mut running = self.running.lock().await;
        let Some(run) = running.take() else {
            return false;
        };
        run.cancel.cancel();

        let mut handle = run.handle;
        if tokio::time::timeout(self.stop_timeout, &mut handle).await.is_err() {
            tracing::warn!(timeout = ?self.stop_timeout, "control loop did not stop in time; aborting");
            handle.abort();
        }
        self.plane.lock().await.end_run("stopped by operator");
        drop(running);
        tracing::info!("control loop stopped");
        true
    }
}

async fn run_loop(plane: Arc<Mutex<ControlPlane>>, cancel: CancellationToken) {
    tracing::info!("control loop task started");

    loop {
        if cancel.is_cancelled() {
            break;
        }
        let outcome = plane.lock().await.step(Utc::now()).await;
        match outcome {
            StepOutcome::Exit => {
                plane.lock().await.end_run("auto-stop");
                break;
            }
            StepOutcome::Sleep(wake) => {
                let delay = (wake - Utc::now()).to_std().unwrap_or(std::time::Duration::ZERO);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    tracing::info!("control loop task exiting");
}
