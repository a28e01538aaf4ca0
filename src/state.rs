use crate::config::AppConfig;
use crate::db::DbPool;
use crate::emergency::{EmergencyKind, EmergencyStatus};
use crate::market::MarketSessionClock;
use crate::orchestrator::scheduler::{DayState, Phase};
use crate::risk::budget::RiskBudgetState;
use crate::risk::pipeline::PipelineContext;
use crate::risk::trailing_stop::StopState;
use crate::risk::Portfolio;
use chrono::{DateTime, NaiveDate, Utc};
use portable_atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

// ── Control loop state ──

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    #[default]
    Stopped,
    Running,
    /// Runaway-loss shutdown: loop alive, trading off until next prep.
    Halted,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
            Self::Halted => write!(f, "halted"),
        }
    }
}

// ── Messages OUT of the control plane ──

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type")]
pub enum WsMessage {
    #[serde(rename = "engine_state")]
    EngineStateMsg { state: String, reason: String },

    #[serde(rename = "phase")]
    PhaseChange { phase: Phase, wake_at: String },

    #[serde(rename = "gate_check")]
    GateCheck {
        can_trade: bool,
        overall_action: String,
        blocking_gates: Vec<String>,
        summary: String,
        timestamp: String,
    },

    #[serde(rename = "order_filled")]
    OrderFilled {
        ticker: String,
        side: String,
        quantity: f64,
        price: f64,
        reason: String,
        realized_pnl: Option<f64>,
        timestamp: String,
    },

    #[serde(rename = "order_rejected")]
    OrderRejected { ticker: String, side: String, reason: String },

    #[serde(rename = "stop_triggered")]
    StopTriggered {
        ticker: String,
        stop_type: String,
        trigger_price: f64,
        stop_price: f64,
        quantity: f64,
    },

    #[serde(rename = "emergency")]
    Emergency {
        event_type: EmergencyKind,
        trigger_value: f64,
        detail: String,
        timestamp: String,
    },
}

// ── DB Commands (sent to writer task via bounded channel) ──

#[derive(Debug)]
pub enum DbCommand {
    InsertGateDecision {
        checked_at: String,
        scope: String,
        gate_name: String,
        passed: bool,
        action: String,
        message: String,
        details: String,
    },
    InsertBudgetSnapshot {
        as_of: String,
        monthly_budget_pct: f64,
        consumption_pct: f64,
        tier: u8,
        position_scale: f64,
        realized_losses: f64,
    },
    UpsertDailyPnl {
        date: NaiveDate,
        pnl: f64,
        pnl_pct: f64,
        total_value: f64,
    },
}

// ── Control requests (server -> orchestrator owner task) ──

#[derive(Debug)]
pub enum ControlCommand {
    Start { reply: oneshot::Sender<bool> },
    Stop { reply: oneshot::Sender<bool> },
}

// ── Snapshot for the status surface (sent via watch channel) ──

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ControlSnapshot {
    pub engine_state: EngineState,
    pub phase: Option<Phase>,
    pub next_wake: Option<DateTime<Utc>>,
    pub day: DayState,
    pub risk: Option<PipelineContext>,
    pub risk_status: serde_json::Value,
    pub emergency: Option<EmergencyStatus>,
    pub budget: Option<RiskBudgetState>,
    pub stops: Vec<(String, StopState)>,
    pub portfolio: Option<Portfolio>,
    pub updated_at: Option<DateTime<Utc>>,
}

// ── Performance Counters (lock-free) ──

pub struct PerfCounters {
    pub cycles_run: AtomicU64,
    pub monitor_ticks: AtomicU64,
    pub gate_checks: AtomicU64,
    pub orders_submitted: AtomicU64,
    pub orders_blocked: AtomicU64,
    pub emergency_events: AtomicU64,
    pub errors_recovered: AtomicU64,
    pub ws_messages_sent: AtomicU64,
}

impl PerfCounters {
    pub fn new() -> Self {
        Self {
            cycles_run: AtomicU64::new(0),
            monitor_ticks: AtomicU64::new(0),
            gate_checks: AtomicU64::new(0),
            orders_submitted: AtomicU64::new(0),
            orders_blocked: AtomicU64::new(0),
            emergency_events: AtomicU64::new(0),
            errors_recovered: AtomicU64::new(0),
            ws_messages_sent: AtomicU64::new(0),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        use portable_atomic::Ordering::Relaxed;
        serde_json::json!({
            "cycles_run": self.cycles_run.load(Relaxed),
            "monitor_ticks": self.monitor_ticks.load(Relaxed),
            "gate_checks": self.gate_checks.load(Relaxed),
            "orders_submitted": self.orders_submitted.load(Relaxed),
            "orders_blocked": self.orders_blocked.load(Relaxed),
            "emergency_events": self.emergency_events.load(Relaxed),
            "errors_recovered": self.errors_recovered.load(Relaxed),
            "ws_messages_sent": self.ws_messages_sent.load(Relaxed),
        })
    }
}

impl Default for PerfCounters {
    fn default() -> Self {
        Self::new()
    }
}

// ── Application shared state (channels, not locks) ──

pub struct AppState {
    pub config: AppConfig,
    pub db: DbPool,
    pub clock: MarketSessionClock,

    // Control loop -> status surface: latest snapshot
    pub snapshot_tx: watch::Sender<ControlSnapshot>,
    pub snapshot_rx: watch::Receiver<ControlSnapshot>,

    // Control loop -> WS clients
    pub ws_tx: broadcast::Sender<WsMessage>,

    // Control loop -> DB writer: audit writes
    pub db_tx: mpsc::Sender<DbCommand>,

    // Server -> orchestrator owner: start/stop
    pub control_tx: mpsc::Sender<ControlCommand>,

    pub counters: PerfCounters,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        db: DbPool,
        clock: MarketSessionClock,
        db_tx: mpsc::Sender<DbCommand>,
        control_tx: mpsc::Sender<ControlCommand>,
    ) -> Arc<Self> {
        let (ws_tx, _) = broadcast::channel(1024);
        let (snapshot_tx, snapshot_rx) = watch::channel(ControlSnapshot::default());

        Arc::new(Self {
            config,
            db,
            clock,
            snapshot_tx,
            snapshot_rx,
            ws_tx,
            db_tx,
            control_tx,
            counters: PerfCounters::new(),
        })
    }

    #[inline]
    pub fn broadcast(&self, msg: WsMessage) {
        self.counters.ws_messages_sent.fetch_add(1, Ordering::Relaxed);
        let _ = self.ws_tx.send(msg);
    }

    /// Audit writes are best-effort: a full channel drops the row.
    pub fn audit(&self, cmd: DbCommand) {
        if let Err(e) = self.db_tx.try_send(cmd) {
            tracing::warn!(error = %e, "audit write dropped");
        }
    }
}
