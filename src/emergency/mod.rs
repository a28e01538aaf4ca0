pub mod network;
pub mod protocol;

pub use protocol::EmergencyProtocol;

use chrono::{DateTime, Utc};
use std::collections::HashMap;

// ── Event kinds ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyKind {
    FlashCrash,
    CircuitBreaker,
    SystemCrash,
    NetworkFailure,
    RunawayLoss,
}

impl EmergencyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FlashCrash => "flash_crash",
            Self::CircuitBreaker => "circuit_breaker",
            Self::SystemCrash => "system_crash",
            Self::NetworkFailure => "network_failure",
            Self::RunawayLoss => "runaway_loss",
        }
    }
}

impl std::fmt::Display for EmergencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EmergencyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flash_crash" => Ok(Self::FlashCrash),
            "circuit_breaker" => Ok(Self::CircuitBreaker),
            "system_crash" => Ok(Self::SystemCrash),
            "network_failure" => Ok(Self::NetworkFailure),
            "runaway_loss" => Ok(Self::RunawayLoss),
            other => Err(format!("unknown emergency kind: {other}")),
        }
    }
}

/// One row of the append-only emergency log.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EmergencyEvent {
    pub id: Option<i64>,
    pub event_type: EmergencyKind,
    pub trigger_value: f64,
    pub action_taken: String,
    pub positions_affected: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl EmergencyEvent {
    pub fn new(event_type: EmergencyKind, trigger_value: f64, action_taken: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: None,
            event_type,
            trigger_value,
            action_taken: action_taken.into(),
            positions_affected: Vec::new(),
            created_at: now,
            resolved_at: None,
        }
    }

    pub fn with_positions(mut self, tickers: Vec<String>) -> Self {
        self.positions_affected = tickers;
        self
    }

    pub fn resolved(mut self, at: DateTime<Utc>) -> Self {
        self.resolved_at = Some(at);
        self
    }
}

/// Process-wide crisis state. Owned by the orchestrator's protocol instance
/// and rebuilt from the event log at startup.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct EmergencyState {
    pub circuit_breaker_active: bool,
    pub flash_crash_cooldowns: HashMap<String, DateTime<Utc>>,
    pub runaway_loss_shutdown: bool,
}

// ── Detector outputs ──

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FlashCrashCheck {
    Clear,
    Triggered { change_pct: f64, cooldown_until: DateTime<Utc> },
    CoolingDown { until: DateTime<Utc> },
    /// Price change unavailable; treated as crisis for this ticker.
    Unavailable,
}

impl FlashCrashCheck {
    pub fn blocks_buys(&self) -> bool {
        !matches!(self, FlashCrashCheck::Clear)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerTransition {
    Activated,
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct CircuitBreakerCheck {
    pub active: bool,
    pub transition: Option<BreakerTransition>,
    /// Indicators missing; entries suppressed for this tick.
    pub degraded: bool,
}

impl CircuitBreakerCheck {
    pub fn suppresses_entries(&self) -> bool {
        self.active || self.degraded
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RecoveryReport {
    pub unresolved_events: usize,
    pub circuit_breaker_restored: bool,
    pub runaway_shutdown_restored: bool,
    pub cooldowns_restored: usize,
    pub require_order_sync: bool,
    pub require_position_sync: bool,
    /// Event log unreadable; recovered into the conservative posture.
    pub degraded: bool,
    pub recovered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct NetworkRecovery {
    pub reconnected: bool,
    pub attempts: u32,
    pub waited_secs: u64,
    pub cancel_pending_orders: bool,
    pub liquidation_required: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RunawayLiquidation {
    pub daily_pnl_pct: f64,
    pub orders: Vec<crate::risk::Order>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct EmergencyStatus {
    pub circuit_breaker_active: bool,
    pub runaway_loss_shutdown: bool,
    pub cooldowns: Vec<(String, DateTime<Utc>)>,
    pub last_recovery: Option<RecoveryReport>,
    pub events_logged: u64,
    pub store_failures: u64,
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use crate::errors::{EngineError, EngineResult};
    use crate::interfaces::{Alert, ConnectivityCheck, EventStore, Notifier};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MemoryStore {
        pub events: Mutex<Vec<EmergencyEvent>>,
        pub fail: AtomicBool,
    }

    impl MemoryStore {
        pub fn count(&self, kind: EmergencyKind) -> usize {
            self.events.lock().unwrap().iter().filter(|e| e.event_type == kind).count()
        }

        pub fn seed(&self, event: EmergencyEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[async_trait::async_trait]
    impl EventStore for MemoryStore {
        async fn append_event(&self, event: &EmergencyEvent) -> EngineResult<i64> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(EngineError::Database("disk full".into()));
            }
            let mut events = self.events.lock().unwrap();
            let mut e = event.clone();
            e.id = Some(events.len() as i64 + 1);
            events.push(e);
            Ok(events.len() as i64)
        }

        async fn resolve_events(&self, kind: EmergencyKind, resolved_at: DateTime<Utc>) -> EngineResult<usize> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(EngineError::Database("disk full".into()));
            }
            let mut n = 0;
            for e in self.events.lock().unwrap().iter_mut() {
                if e.event_type == kind && e.resolved_at.is_none() {
                    e.resolved_at = Some(resolved_at);
                    n += 1;
                }
            }
            Ok(n)
        }

        async fn unresolved_events(&self) -> EngineResult<Vec<EmergencyEvent>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(EngineError::Database("disk full".into()));
            }
            Ok(self
                .events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.resolved_at.is_none())
                .cloned()
                .collect())
        }
    }

    #[derive(Default)]
    pub struct CountingNotifier {
        pub sent: AtomicUsize,
        pub fail: bool,
    }

    #[async_trait::async_trait]
    impl Notifier for CountingNotifier {
        async fn notify(&self, _alert: &Alert) -> EngineResult<()> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(EngineError::Network("webhook down".into()));
            }
            Ok(())
        }
    }

    /// Returns `true` starting with the `succeed_on`-th check (1-based); 0 never.
    pub struct ScriptedLink {
        pub succeed_on: usize,
        pub calls: AtomicUsize,
    }

    impl ScriptedLink {
        pub fn new(succeed_on: usize) -> Self {
            Self { succeed_on, calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait::async_trait]
    impl ConnectivityCheck for ScriptedLink {
        async fn is_reachable(&self) -> bool {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.succeed_on != 0 && n >= self.succeed_on
        }
    }
}
