use super::network::reconnect_with_backoff;
use super::{
    BreakerTransition, CircuitBreakerCheck, EmergencyEvent, EmergencyKind, EmergencyState, EmergencyStatus,
    FlashCrashCheck, NetworkRecovery, RecoveryReport, RunawayLiquidation,
};
use crate::config::EmergencyConfig;
use crate::interfaces::{deliver, Alert, AlertLevel, ConnectivityCheck, EventStore, MarketIndicators, Notifier};
use crate::risk::{Order, Portfolio};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// Five crisis detectors sharing one `EmergencyState`.
///
/// Each trigger writes exactly one durable event and sends one alert.
/// Nothing here returns an error: store and notifier failures are logged,
/// and missing inputs are read as "still in crisis".
pub struct EmergencyProtocol {
    cfg: EmergencyConfig,
    state: EmergencyState,
    store: Arc<dyn EventStore>,
    notifier: Arc<dyn Notifier>,
    last_recovery: Option<RecoveryReport>,
    events_logged: u64,
    store_failures: u64,
}

impl EmergencyProtocol {
    pub fn new(cfg: EmergencyConfig, store: Arc<dyn EventStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            cfg,
            state: EmergencyState::default(),
            store,
            notifier,
            last_recovery: None,
            events_logged: 0,
            store_failures: 0,
        }
    }

    pub fn state(&self) -> &EmergencyState {
        &self.state
    }

    pub fn flash_window_minutes(&self) -> i64 {
        self.cfg.flash_window_minutes
    }

    /// No new entries while the breaker is active or the day is shut down.
    pub fn can_open_positions(&self) -> bool {
        !self.state.circuit_breaker_active && !self.state.runaway_loss_shutdown
    }

    pub fn trading_halted(&self) -> bool {
        self.state.runaway_loss_shutdown
    }

    async fn record(&mut self, event: EmergencyEvent, alert: Alert) -> Option<i64> {
        tracing::warn!(
            event_type = %event.event_type,
            trigger = event.trigger_value,
            action = %event.action_taken,
            positions = ?event.positions_affected,
            "emergency event"
        );
        let id = match self.store.append_event(&event).await {
            Ok(id) => {
                self.events_logged += 1;
                Some(id)
            }
            Err(e) => {
                self.store_failures += 1;
                tracing::error!(error = %e, event_type = %event.event_type, "failed to persist emergency event");
                None
            }
        };
        deliver(self.notifier.as_ref(), alert).await;
        id
    }

    async fn resolve(&mut self, kind: EmergencyKind, now: DateTime<Utc>) {
        match self.store.resolve_events(kind, now).await {
            Ok(n) => tracing::info!(event_type = %kind, resolved = n, "emergency events resolved"),
            Err(e) => {
                self.store_failures += 1;
                tracing::error!(error = %e, event_type = %kind, "failed to resolve emergency events");
            }
        }
    }

    // ── 1. Flash crash ──

    /// Lazily drops an expired cooldown.
    pub fn is_in_cooldown(&mut self, ticker: &str, now: DateTime<Utc>) -> bool {
        match self.state.flash_crash_cooldowns.get(ticker) {
            Some(until) if *until > now => true,
            Some(_) => {
                self.state.flash_crash_cooldowns.remove(ticker);
                false
            }
            None => false,
        }
    }

    /// `change_pct` is the trailing-window change; `None` when the quote
    /// could not be read.
    pub async fn check_flash_crash(&mut self, ticker: &str, change_pct: Option<f64>, now: DateTime<Utc>) -> FlashCrashCheck {
        if self.is_in_cooldown(ticker, now) {
            let until = self.state.flash_crash_cooldowns[ticker];
            return FlashCrashCheck::CoolingDown { until };
        }

        let Some(change_pct) = change_pct.filter(|c| c.is_finite()) else {
            tracing::warn!(ticker = ticker, "flash crash check without price data");
            return FlashCrashCheck::Unavailable;
        };

        if change_pct > self.cfg.flash_crash_pct {
            return FlashCrashCheck::Clear;
        }

        let cooldown_until = now + Duration::minutes(self.cfg.flash_cooldown_minutes);
        self.state
            .flash_crash_cooldowns
            .insert(ticker.to_string(), cooldown_until);

        let action = format!("buy cooldown until {}", cooldown_until.to_rfc3339());
        let event = EmergencyEvent::new(EmergencyKind::FlashCrash, change_pct, action, now)
            .with_positions(vec![ticker.to_string()]);
        let alert = Alert::new(
            AlertLevel::Critical,
            format!("Flash crash: {ticker}"),
            format!(
                "{ticker} moved {change_pct:.2}% in {}m; buys paused {}m",
                self.cfg.flash_window_minutes, self.cfg.flash_cooldown_minutes
            ),
        );
        self.record(event, alert).await;

        FlashCrashCheck::Triggered { change_pct, cooldown_until }
    }

    // ── 2. Circuit breaker ──

    /// Edge-triggered with hysteresis: activates on VIX >= trigger or SPY <=
    /// trigger; releases only on VIX < release.
    pub async fn check_circuit_breaker(&mut self, indicators: MarketIndicators, now: DateTime<Utc>) -> CircuitBreakerCheck {
        let vix = indicators.vix.filter(|v| v.is_finite());
        let spy = indicators.spy_change_pct.filter(|v| v.is_finite());

        if !self.state.circuit_breaker_active {
            let vix_hit = vix.is_some_and(|v| v >= self.cfg.vix_trigger);
            let spy_hit = spy.is_some_and(|s| s <= self.cfg.spy_trigger_pct);
            if vix_hit || spy_hit {
                self.state.circuit_breaker_active = true;
                let trigger_value = if vix_hit { vix.unwrap_or_default() } else { spy.unwrap_or_default() };
                let reason = if vix_hit {
                    format!("VIX {trigger_value:.1} >= {:.1}", self.cfg.vix_trigger)
                } else {
                    format!("SPY {trigger_value:.2}% <= {:.2}%", self.cfg.spy_trigger_pct)
                };
                let event = EmergencyEvent::new(
                    EmergencyKind::CircuitBreaker,
                    trigger_value,
                    "suspend new entries; tighten trailing stops",
                    now,
                );
                let alert = Alert::new(AlertLevel::Critical, "Circuit breaker active", reason);
                self.record(event, alert).await;
                return CircuitBreakerCheck {
                    active: true,
                    transition: Some(BreakerTransition::Activated),
                    degraded: false,
                };
            }
            return CircuitBreakerCheck {
                active: false,
                transition: None,
                degraded: vix.is_none() && spy.is_none(),
            };
        }

        match vix {
            Some(v) if v < self.cfg.vix_release => {
                self.state.circuit_breaker_active = false;
                self.resolve(EmergencyKind::CircuitBreaker, now).await;
                tracing::info!(vix = v, "circuit breaker released");
                deliver(
                    self.notifier.as_ref(),
                    Alert::new(
                        AlertLevel::Info,
                        "Circuit breaker released",
                        format!("VIX {v:.1} < {:.1}", self.cfg.vix_release),
                    ),
                )
                .await;
                CircuitBreakerCheck {
                    active: false,
                    transition: Some(BreakerTransition::Released),
                    degraded: false,
                }
            }
            Some(_) => CircuitBreakerCheck { active: true, transition: None, degraded: false },
            None => CircuitBreakerCheck { active: true, transition: None, degraded: true },
        }
    }

    // ── 3. System-crash recovery ──

    /// Rebuild state from unresolved events. Never trusts in-memory broker
    /// state: both sync flags are always set.
    pub async fn recover(&mut self, now: DateTime<Utc>) -> RecoveryReport {
        self.state = EmergencyState::default();

        let mut report = RecoveryReport {
            unresolved_events: 0,
            circuit_breaker_restored: false,
            runaway_shutdown_restored: false,
            cooldowns_restored: 0,
            require_order_sync: true,
            require_position_sync: true,
            degraded: false,
            recovered_at: now,
        };

        match self.store.unresolved_events().await {
            Ok(events) => {
                report.unresolved_events = events.len();
                for e in &events {
                    match e.event_type {
                        EmergencyKind::CircuitBreaker => {
                            self.state.circuit_breaker_active = true;
                            report.circuit_breaker_restored = true;
                        }
                        EmergencyKind::RunawayLoss => {
                            self.state.runaway_loss_shutdown = true;
                            report.runaway_shutdown_restored = true;
                        }
                        EmergencyKind::FlashCrash => {
                            let until = e.created_at + Duration::minutes(self.cfg.flash_cooldown_minutes);
                            if until > now {
                                for ticker in &e.positions_affected {
                                    self.state.flash_crash_cooldowns.insert(ticker.clone(), until);
                                    report.cooldowns_restored += 1;
                                }
                            }
                        }
                        EmergencyKind::SystemCrash | EmergencyKind::NetworkFailure => {}
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "event log unreadable; recovering with circuit breaker active");
                self.store_failures += 1;
                self.state.circuit_breaker_active = true;
                report.degraded = true;
            }
        }

        let event = EmergencyEvent::new(
            EmergencyKind::SystemCrash,
            report.unresolved_events as f64,
            format!(
                "state rehydrated (breaker={}, shutdown={}, cooldowns={}); order and position sync requested",
                self.state.circuit_breaker_active, self.state.runaway_loss_shutdown, report.cooldowns_restored
            ),
            now,
        )
        .resolved(now);
        let alert = Alert::new(
            if report.degraded { AlertLevel::Critical } else { AlertLevel::Warning },
            "Control plane restarted",
            format!("{} unresolved emergency events restored", report.unresolved_events),
        );
        self.record(event, alert).await;

        self.last_recovery = Some(report.clone());
        report
    }

    // ── 4. Network failure ──

    /// Backoff reconnect bounded by the configured cap. Pending orders are
    /// always cancelled; hitting the cap requires liquidation.
    pub async fn handle_network_failure(&mut self, link: &dyn ConnectivityCheck, now: DateTime<Utc>) -> NetworkRecovery {
        let outcome = reconnect_with_backoff(link, &self.cfg.backoff_delays_secs, self.cfg.backoff_cap_secs).await;

        let liquidation_required = !outcome.reconnected;
        let action = if outcome.reconnected {
            format!("reconnected after {}s; cancel pending orders", outcome.waited_secs)
        } else {
            format!("no connectivity after {}s; cancel pending orders and liquidate", outcome.waited_secs)
        };
        let mut event = EmergencyEvent::new(EmergencyKind::NetworkFailure, outcome.waited_secs as f64, action, now);
        if outcome.reconnected {
            event = event.resolved(now + Duration::seconds(outcome.waited_secs as i64));
        }
        let alert = Alert::new(
            if outcome.reconnected { AlertLevel::Warning } else { AlertLevel::Critical },
            "Network failure",
            format!(
                "{} attempts over {}s, reconnected={}",
                outcome.attempts, outcome.waited_secs, outcome.reconnected
            ),
        );
        self.record(event, alert).await;

        NetworkRecovery {
            reconnected: outcome.reconnected,
            attempts: outcome.attempts,
            waited_secs: outcome.waited_secs,
            cancel_pending_orders: true,
            liquidation_required,
        }
    }

    // ── 5. Runaway loss ──

    /// Fires once per day when the daily loss reaches the runaway threshold.
    /// A portfolio the loss cannot be measured on halts the day without
    /// liquidating.
    pub async fn check_runaway_loss(&mut self, portfolio: &Portfolio, now: DateTime<Utc>) -> Option<RunawayLiquidation> {
        if self.state.runaway_loss_shutdown {
            return None;
        }
        let daily_pnl_pct = portfolio.daily_pnl_pct();
        if !(portfolio.total_value > 0.0 && portfolio.total_value.is_finite() && daily_pnl_pct.is_finite()) {
            return Some(self.halt_unmeasured(portfolio, now).await);
        }
        if daily_pnl_pct > self.cfg.runaway_loss_pct {
            return None;
        }
        Some(self.trigger_runaway_loss(portfolio, daily_pnl_pct, now).await)
    }

    async fn halt_unmeasured(&mut self, portfolio: &Portfolio, now: DateTime<Utc>) -> RunawayLiquidation {
        tracing::error!(
            total_value = portfolio.total_value,
            today_pnl = portfolio.today_pnl,
            "daily loss not measurable; halting trading for the day"
        );
        self.state.runaway_loss_shutdown = true;

        let trigger = if portfolio.total_value.is_finite() { portfolio.total_value } else { 0.0 };
        let event = EmergencyEvent::new(
            EmergencyKind::RunawayLoss,
            trigger,
            "portfolio value invalid; trading halted for the day, positions kept",
            now,
        );
        let alert = Alert::new(
            AlertLevel::Critical,
            "Runaway loss check failed",
            format!(
                "total value {} / today pnl {} unusable; no new entries until the next trading day",
                portfolio.total_value, portfolio.today_pnl
            ),
        );
        self.record(event, alert).await;

        RunawayLiquidation { daily_pnl_pct: f64::NAN, orders: Vec::new() }
    }

    pub async fn trigger_runaway_loss(&mut self, portfolio: &Portfolio, daily_pnl_pct: f64, now: DateTime<Utc>) -> RunawayLiquidation {
        self.state.runaway_loss_shutdown = true;

        let orders: Vec<Order> = portfolio
            .positions
            .iter()
            .filter(|p| p.quantity > 0.0)
            .map(|p| Order::sell_all(p, "runaway_loss"))
            .collect();
        let tickers: Vec<String> = orders.iter().map(|o| o.ticker.clone()).collect();

        let event = EmergencyEvent::new(
            EmergencyKind::RunawayLoss,
            daily_pnl_pct,
            format!("liquidate {} positions; trading halted for the day", orders.len()),
            now,
        )
        .with_positions(tickers);
        let alert = Alert::new(
            AlertLevel::Critical,
            "Runaway loss shutdown",
            format!("daily pnl {daily_pnl_pct:.2}%; liquidating {} positions", orders.len()),
        );
        self.record(event, alert).await;

        RunawayLiquidation { daily_pnl_pct, orders }
    }

    /// New trading day: lift the runaway shutdown.
    pub async fn reset_daily(&mut self, now: DateTime<Utc>) {
        if self.state.runaway_loss_shutdown {
            self.state.runaway_loss_shutdown = false;
            self.resolve(EmergencyKind::RunawayLoss, now).await;
            tracing::info!("runaway loss shutdown lifted for new trading day");
        }
        self.state.flash_crash_cooldowns.retain(|_, until| *until > now);
    }

    pub fn get_status(&self) -> EmergencyStatus {
        let mut cooldowns: Vec<(String, DateTime<Utc>)> = self
            .state
            .flash_crash_cooldowns
            .iter()
            .map(|(t, u)| (t.clone(), *u))
            .collect();
        cooldowns.sort_by(|a, b| a.0.cmp(&b.0));
        EmergencyStatus {
            circuit_breaker_active: self.state.circuit_breaker_active,
            runaway_loss_shutdown: self.state.runaway_loss_shutdown,
            cooldowns,
            last_recovery: self.last_recovery.clone(),
            events_logged: self.events_logged,
            store_failures: self.store_failures,
        }
    }
}
