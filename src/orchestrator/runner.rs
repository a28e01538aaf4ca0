use super::scheduler::{self, iso_week_of, DayState, Phase, Plan};
use crate::db;
use crate::emergency::{EmergencyKind, EmergencyProtocol, FlashCrashCheck, RecoveryReport};
use crate::errors::{EngineError, EngineResult};
use crate::interfaces::{
    deliver, Alert, AlertLevel, ConnectivityCheck, Fill, MarketDataProvider, MarketIndicators, Notifier, OrderExecutor,
    PortfolioProvider, Strategy,
};
use crate::risk::pipeline::RiskGatePipeline;
use crate::risk::trailing_stop::TrailingStopTracker;
use crate::risk::{GateResult, MarketData, Order, OrderSide, Portfolio};
use crate::state::{AppState, ControlSnapshot, DbCommand, EngineState, WsMessage};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use portable_atomic::Ordering;
use std::sync::Arc;

/// Everything the loop talks to but does not own.
pub struct Collaborators {
    pub portfolio: Arc<dyn PortfolioProvider>,
    pub market: Arc<dyn MarketDataProvider>,
    pub executor: Arc<dyn OrderExecutor>,
    pub strategy: Arc<dyn Strategy>,
    pub connectivity: Arc<dyn ConnectivityCheck>,
    pub notifier: Arc<dyn Notifier>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Sleep(DateTime<Utc>),
    Exit,
}

/// Owned loop state. One `step` = one planner decision plus its side effects.
/// Gate pipeline, stop tracker and emergency protocol live here and nowhere
/// else; readers see them through the published snapshot.
pub struct ControlPlane {
    app: Arc<AppState>,
    deps: Collaborators,
    pipeline: RiskGatePipeline,
    stops: TrailingStopTracker,
    emergency: EmergencyProtocol,
    day: DayState,
    engine_state: EngineState,
    /// Breaker active or indicators missing on the last monitor tick.
    entries_suppressed: bool,
    last_portfolio: Option<Portfolio>,
    phase: Option<Phase>,
    next_wake: Option<DateTime<Utc>>,
}

impl ControlPlane {
    pub fn new(
        app: Arc<AppState>,
        deps: Collaborators,
        pipeline: RiskGatePipeline,
        emergency: EmergencyProtocol,
    ) -> Self {
        let stops = TrailingStopTracker::new(&app.config.risk);
        Self {
            app,
            deps,
            pipeline,
            stops,
            emergency,
            day: DayState::default(),
            engine_state: EngineState::Stopped,
            entries_suppressed: false,
            last_portfolio: None,
            phase: None,
            next_wake: None,
        }
    }

    pub fn engine_state(&self) -> EngineState {
        self.engine_state
    }

    pub fn day(&self) -> &DayState {
        &self.day
    }

    fn set_engine_state(&mut self, state: EngineState, reason: &str) {
        if self.engine_state == state {
            return;
        }
        tracing::info!(from = %self.engine_state, to = %state, reason = reason, "engine state change");
        self.engine_state = state;
        self.app.broadcast(WsMessage::EngineStateMsg { state: state.to_string(), reason: reason.to_string() });
    }

    // ── Lifecycle ──

    /// Startup recovery: rebuild emergency state from the log, then drop any
    /// cached broker view.
    pub async fn recover(&mut self, now: DateTime<Utc>) -> RecoveryReport {
        let report = self.emergency.recover(now).await;
        if report.require_order_sync || report.require_position_sync {
            if let Err(e) = self.deps.executor.resync().await {
                tracing::warn!(error = %e, "broker resync after recovery failed");
            }
        }
        if report.unresolved_events > 0 {
            self.broadcast_emergency(
                EmergencyKind::SystemCrash,
                report.unresolved_events as f64,
                format!("recovered {} unresolved events", report.unresolved_events),
                now,
            );
        }
        self.publish(now);
        report
    }

    pub fn begin_run(&mut self, now: DateTime<Utc>) {
        let auto_stop = self.app.clock.auto_stop_after(now, self.app.config.schedule.auto_stop);
        self.day = DayState::new(auto_stop);
        self.phase = None;
        let state = if self.emergency.trading_halted() { EngineState::Halted } else { EngineState::Running };
        self.set_engine_state(state, "run started");
        tracing::info!(auto_stop = ?auto_stop, "control loop run starting");
        self.publish(now);
    }

    pub fn end_run(&mut self, reason: &str) {
        self.set_engine_state(EngineState::Stopped, reason);
        self.phase = None;
        self.next_wake = None;
        self.publish(Utc::now());
    }

    // ── One iteration ──

    pub fn plan(&self, now: DateTime<Utc>) -> Plan {
        scheduler::plan(now, &self.day, &self.app.clock, &self.app.config.schedule)
    }

    pub async fn step(&mut self, now: DateTime<Utc>) -> StepOutcome {
        let plan = self.plan(now);
        if plan.phase == Phase::Shutdown {
            tracing::info!("auto-stop time reached");
            return StepOutcome::Exit;
        }

        if self.phase != Some(plan.phase) {
            self.app.broadcast(WsMessage::PhaseChange { phase: plan.phase, wake_at: plan.wake_at.to_rfc3339() });
        }
        self.phase = Some(plan.phase);

        let wake = match self.run_plan(&plan, now).await {
            Ok(()) => plan.wake_at,
            Err(e) => self.recover_from_error(e, now).await,
        };
        self.next_wake = Some(wake);
        self.publish(now);
        StepOutcome::Sleep(wake)
    }

    async fn run_plan(&mut self, plan: &Plan, now: DateTime<Utc>) -> EngineResult<()> {
        let date = plan.trading_date.unwrap_or_else(|| self.app.clock.exchange_date(now));
        match plan.phase {
            Phase::Shutdown | Phase::Sleep => Ok(()),
            Phase::Weekly => {
                self.day.last_weekly = Some(iso_week_of(&self.app.clock, now));
                tracing::info!("weekly review");
                self.deps.strategy.weekly_review().await
            }
            Phase::Prep => self.prepare(date, now).await,
            Phase::EndOfDay => self.end_of_day(date, now).await,
            Phase::ContinuousAnalysis => {
                self.day.last_analysis_at = Some(now);
                self.deps.strategy.continuous_analysis().await
            }
            Phase::TradingCycle => {
                self.day.last_cycle_at = Some(now);
                self.trading_cycle(now).await?;
                self.monitor_tick(now).await
            }
            Phase::RegularMonitor | Phase::OffHoursMonitor => self.monitor_tick(now).await,
        }
    }

    /// An iteration failed: log, alert, and for connectivity errors run the
    /// network-failure procedure. Returns when to try again.
    async fn recover_from_error(&mut self, err: EngineError, now: DateTime<Utc>) -> DateTime<Utc> {
        tracing::error!(error = %err, phase = ?self.phase, "loop iteration failed");
        self.app.counters.errors_recovered.fetch_add(1, Ordering::Relaxed);
        deliver(
            self.deps.notifier.as_ref(),
            Alert::new(AlertLevel::Warning, "Control loop error", err.to_string()),
        )
        .await;

        let retry = Duration::seconds(self.app.config.schedule.retry_secs as i64);
        if !err.is_network() {
            return now + retry;
        }

        let recovery = self.emergency.handle_network_failure(self.deps.connectivity.as_ref(), now).await;
        self.broadcast_emergency(
            EmergencyKind::NetworkFailure,
            recovery.waited_secs as f64,
            format!("reconnected={} after {} attempts", recovery.reconnected, recovery.attempts),
            now,
        );
        match self.deps.executor.cancel_all_pending().await {
            Ok(n) => tracing::info!(cancelled = n, "pending orders cancelled after network failure"),
            Err(e) => tracing::error!(error = %e, "cancel pending orders failed"),
        }
        if recovery.reconnected {
            if let Err(e) = self.deps.executor.resync().await {
                tracing::warn!(error = %e, "broker resync after reconnect failed");
            }
        } else if recovery.liquidation_required {
            self.liquidate_all("network_failure", now).await;
        }

        now + Duration::seconds(recovery.waited_secs as i64) + retry
    }

    // ── Phases ──

    async fn prepare(&mut self, date: NaiveDate, now: DateTime<Utc>) -> EngineResult<()> {
        self.day.prepared_for = Some(date);
        self.day.last_cycle_at = None;
        self.day.last_analysis_at = None;

        self.emergency.reset_daily(now).await;
        if self.engine_state == EngineState::Halted {
            self.set_engine_state(EngineState::Running, "new trading day");
        }

        match self.pipeline.budget_mut().get_consumption(date).await {
            Ok(s) => tracing::info!(tier = s.current_tier, consumption = s.consumption_pct, "budget at open"),
            Err(e) => tracing::warn!(error = %e, "budget unavailable at prep; order checks will fail closed"),
        }

        self.deps.executor.resync().await?;
        self.deps.strategy.prepare_day(date).await?;
        tracing::info!(date = %date, "trading day prepared");
        Ok(())
    }

    async fn end_of_day(&mut self, date: NaiveDate, now: DateTime<Utc>) -> EngineResult<()> {
        self.day.eod_done_for = Some(date);
        let portfolio = self.deps.portfolio.get_portfolio_summary().await?;

        self.app.audit(DbCommand::UpsertDailyPnl {
            date,
            pnl: portfolio.today_pnl,
            pnl_pct: portfolio.daily_pnl_pct(),
            total_value: portfolio.total_value,
        });

        match self.pipeline.budget_mut().update_budget(date).await {
            Ok(s) => self.app.audit(DbCommand::InsertBudgetSnapshot {
                as_of: s.as_of.to_string(),
                monthly_budget_pct: s.monthly_budget_pct,
                consumption_pct: s.consumption_pct,
                tier: s.current_tier,
                position_scale: s.position_scale,
                realized_losses: s.realized_losses,
            }),
            Err(e) => tracing::warn!(error = %e, "end-of-day budget update failed"),
        }

        self.deps.strategy.end_of_day(&portfolio).await?;
        tracing::info!(
            date = %date,
            pnl = portfolio.today_pnl,
            pnl_pct = portfolio.daily_pnl_pct(),
            at = %now,
            "end of day recorded"
        );
        self.last_portfolio = Some(portfolio);
        Ok(())
    }

    /// Daily closes for held tickers. Connectivity errors abort the cycle;
    /// anything else just leaves the ticker on VaR's fallback volatility.
    async fn fetch_market_data(&self, portfolio: &Portfolio) -> EngineResult<MarketData> {
        let days = self.pipeline.var_lookback_days() + 1;
        let mut data = MarketData::default();
        for p in &portfolio.positions {
            match self.deps.market.get_price_history(&p.ticker, days).await {
                Ok(closes) => {
                    data.price_history.insert(p.ticker.clone(), closes);
                }
                Err(e) if e.is_network() => return Err(e),
                Err(e) => tracing::warn!(ticker = %p.ticker, error = %e, "price history unavailable"),
            }
        }
        Ok(data)
    }

    async fn trading_cycle(&mut self, now: DateTime<Utc>) -> EngineResult<()> {
        self.app.counters.cycles_run.fetch_add(1, Ordering::Relaxed);

        let mut portfolio = self.deps.portfolio.get_portfolio_summary().await?;
        let market_data = self.fetch_market_data(&portfolio).await?;
        let result = self.pipeline.check_all(&portfolio, Some(&market_data)).await;
        self.app.counters.gate_checks.fetch_add(1, Ordering::Relaxed);
        self.audit_gates("cycle", &result.gate_results, now);
        self.app.broadcast(WsMessage::GateCheck {
            can_trade: result.can_trade,
            overall_action: result.overall_action.to_string(),
            blocking_gates: result.blocking_gates.clone(),
            summary: result.summary(),
            timestamp: result.checked_at.to_rfc3339(),
        });
        self.last_portfolio = Some(portfolio.clone());

        if !result.can_trade {
            tracing::info!(blocking = ?result.blocking_gates, "no new orders this cycle");
            return Ok(());
        }
        if self.emergency.trading_halted() {
            tracing::info!("runaway loss shutdown in effect; skipping proposals");
            return Ok(());
        }

        let proposals = self.deps.strategy.propose_orders(&portfolio).await?;
        let today = self.app.clock.exchange_date(now);

        for mut order in proposals {
            if order.side == OrderSide::Buy {
                if let Some(reason) = self.entry_block_reason() {
                    self.reject(&order, reason);
                    continue;
                }
                let flash = self.flash_check(&order.ticker, now).await?;
                if flash.blocks_buys() {
                    self.reject(&order, format!("flash crash guard: {flash:?}"));
                    continue;
                }
            }

            let check = self.pipeline.check_order(&order, &portfolio, today).await;
            self.app.counters.gate_checks.fetch_add(1, Ordering::Relaxed);
            self.audit_gates("order", &check.results, now);
            if !check.approved {
                let failed: Vec<&str> =
                    check.results.iter().filter(|r| !r.passed).map(|r| r.gate_name.as_str()).collect();
                self.reject(&order, format!("risk checks failed: {}", failed.join(", ")));
                continue;
            }

            if order.side == OrderSide::Buy {
                let scale = check.scale.min(result.position_scale());
                let quantity = (order.quantity * scale).floor();
                if quantity < 1.0 {
                    self.reject(&order, format!("size x{scale:.2} leaves less than one share"));
                    continue;
                }
                if quantity < order.quantity {
                    tracing::info!(ticker = %order.ticker, from = order.quantity, to = quantity, "order scaled down");
                }
                order.quantity = quantity;
            }

            self.execute_order(&order, now).await?;
            portfolio = self.deps.portfolio.get_portfolio_summary().await?;
        }

        self.last_portfolio = Some(portfolio);
        Ok(())
    }

    fn entry_block_reason(&self) -> Option<String> {
        if !self.emergency.can_open_positions() {
            let why = if self.emergency.trading_halted() { "runaway loss shutdown" } else { "circuit breaker active" };
            return Some(why.into());
        }
        if self.entries_suppressed {
            return Some("market indicators unavailable".into());
        }
        None
    }

    /// Trailing-window move for one ticker. A missing quote is passed on as
    /// `None` and comes back `Unavailable`, which blocks buys.
    async fn flash_check(&mut self, ticker: &str, now: DateTime<Utc>) -> EngineResult<FlashCrashCheck> {
        let window = self.emergency.flash_window_minutes();
        let change = match self.deps.market.get_recent_change_pct(ticker, window).await {
            Ok(c) => Some(c),
            Err(e) if e.is_network() => return Err(e),
            Err(e) => {
                tracing::warn!(ticker = ticker, error = %e, "recent change unavailable");
                None
            }
        };
        let check = self.emergency.check_flash_crash(ticker, change, now).await;
        if let FlashCrashCheck::Triggered { change_pct, cooldown_until } = &check {
            self.broadcast_emergency(
                EmergencyKind::FlashCrash,
                *change_pct,
                format!("{ticker} buys blocked until {}", cooldown_until.to_rfc3339()),
                now,
            );
        }
        Ok(check)
    }

    fn reject(&self, order: &Order, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::info!(ticker = %order.ticker, side = %order.side, reason = %reason, "order rejected");
        self.app.counters.orders_blocked.fetch_add(1, Ordering::Relaxed);
        self.app.broadcast(WsMessage::OrderRejected {
            ticker: order.ticker.clone(),
            side: order.side.to_string(),
            reason,
        });
    }

    /// Submit and keep the stop tracker in line with the fill.
    async fn execute_order(&mut self, order: &Order, now: DateTime<Utc>) -> EngineResult<Fill> {
        let fill = self.deps.executor.submit(order).await?;
        self.app.counters.orders_submitted.fetch_add(1, Ordering::Relaxed);

        match fill.side {
            OrderSide::Buy => {
                if self.stops.add_quantity(&fill.ticker, fill.quantity).is_none() {
                    self.stops.register(&fill.ticker, fill.price, fill.quantity);
                }
            }
            OrderSide::Sell => {
                if let Some(left) = self.stops.get(&fill.ticker).map(|s| s.quantity - fill.quantity) {
                    if left <= 1e-9 {
                        self.stops.remove(&fill.ticker);
                    } else {
                        self.stops.set_quantity(&fill.ticker, left);
                    }
                }
            }
        }

        tracing::info!(
            ticker = %fill.ticker,
            side = %fill.side,
            qty = fill.quantity,
            price = fill.price,
            reason = %order.reason,
            "order filled"
        );
        self.app.broadcast(WsMessage::OrderFilled {
            ticker: fill.ticker.clone(),
            side: fill.side.to_string(),
            quantity: fill.quantity,
            price: fill.price,
            reason: order.reason.clone(),
            realized_pnl: fill.realized_pnl,
            timestamp: now.to_rfc3339(),
        });

        if let Some(pnl) = fill.realized_pnl {
            self.record_closed_trade(&fill, pnl, &order.reason, now).await?;
        }
        Ok(fill)
    }

    /// Ledger write for a realized exit. Synchronous: the next `check_order`
    /// in the same cycle must already see the loss.
    async fn record_closed_trade(&self, fill: &Fill, pnl: f64, reason: &str, now: DateTime<Utc>) -> EngineResult<()> {
        let record = db::ClosedTradeRecord {
            id: fill.order_id.clone(),
            ticker: fill.ticker.clone(),
            quantity: fill.quantity,
            exit_price: fill.price,
            pnl,
            reason: reason.to_string(),
            closed_at: now,
            trade_date: self.app.clock.exchange_date(now),
        };
        if let Err(e) = db::insert_closed_trade(&self.app.db, &record) {
            tracing::error!(ticker = %record.ticker, pnl = pnl, error = %e, "closed trade not recorded");
            deliver(
                self.deps.notifier.as_ref(),
                Alert::new(
                    AlertLevel::Critical,
                    "Trade ledger write failed",
                    format!("{} pnl {pnl:.2} missing from budget accounting: {e}", record.ticker),
                ),
            )
            .await;
            return Err(e);
        }
        Ok(())
    }

    async fn liquidate_all(&mut self, reason: &str, now: DateTime<Utc>) {
        let portfolio = match self.deps.portfolio.get_portfolio_summary().await {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "liquidation skipped: portfolio unavailable");
                return;
            }
        };
        for p in portfolio.positions.iter().filter(|p| p.quantity > 0.0) {
            if let Err(e) = self.execute_order(&Order::sell_all(p, reason), now).await {
                tracing::error!(ticker = %p.ticker, error = %e, "liquidation order failed");
            }
        }
    }

    // ── Monitoring ──

    async fn monitor_tick(&mut self, now: DateTime<Utc>) -> EngineResult<()> {
        self.app.counters.monitor_ticks.fetch_add(1, Ordering::Relaxed);

        // circuit breaker
        let indicators = match self.deps.market.get_market_indicators().await {
            Ok(i) => i,
            Err(e) if e.is_network() => return Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "market indicators unavailable");
                MarketIndicators::default()
            }
        };
        let breaker = self.emergency.check_circuit_breaker(indicators, now).await;
        self.entries_suppressed = breaker.suppresses_entries();
        let tightened = self.app.config.risk.tightened_trailing_pct;
        self.stops.set_trailing_override(breaker.active.then_some(tightened));
        if let Some(transition) = breaker.transition {
            self.broadcast_emergency(
                EmergencyKind::CircuitBreaker,
                indicators.vix.unwrap_or(f64::NAN),
                format!("{transition:?}").to_lowercase(),
                now,
            );
        }

        // runaway loss
        let portfolio = self.deps.portfolio.get_portfolio_summary().await?;
        if let Some(liquidation) = self.emergency.check_runaway_loss(&portfolio, now).await {
            self.broadcast_emergency(
                EmergencyKind::RunawayLoss,
                liquidation.daily_pnl_pct,
                format!("liquidating {} positions", liquidation.orders.len()),
                now,
            );
            if let Err(e) = self.deps.executor.cancel_all_pending().await {
                tracing::error!(error = %e, "cancel pending orders failed");
            }
            for order in &liquidation.orders {
                if let Err(e) = self.execute_order(order, now).await {
                    tracing::error!(ticker = %order.ticker, error = %e, "runaway liquidation order failed");
                }
            }
            self.set_engine_state(EngineState::Halted, "runaway loss shutdown");
            self.last_portfolio = self.deps.portfolio.get_portfolio_summary().await.ok();
            return Ok(());
        }

        // trailing stops
        let mut triggered = Vec::new();
        for p in portfolio.positions.iter().filter(|p| p.quantity > 0.0) {
            if !self.stops.is_tracked(&p.ticker) {
                self.stops.register(&p.ticker, p.entry_price, p.quantity);
            }
            let price = p.last_price();
            self.stops.update_price(&p.ticker, price);
            if let Some(trigger) = self.stops.check_stop(&p.ticker, price) {
                triggered.push(trigger);
            }
        }
        for ticker in self.stops.tracked_tickers() {
            if portfolio.position(&ticker).map_or(true, |p| p.quantity <= 0.0) {
                self.stops.remove(&ticker);
            }
        }
        for trigger in triggered {
            self.app.broadcast(WsMessage::StopTriggered {
                ticker: trigger.ticker.clone(),
                stop_type: trigger.stop_type.to_string(),
                trigger_price: trigger.trigger_price,
                stop_price: trigger.stop_price,
                quantity: trigger.quantity,
            });
            match self.execute_order(&trigger.to_order(), now).await {
                Ok(fill) => {
                    deliver(
                        self.deps.notifier.as_ref(),
                        Alert::new(
                            AlertLevel::Warning,
                            format!("{} stop hit", trigger.ticker),
                            format!("sold {} @ {:.2} (stop {:.2})", fill.quantity, fill.price, trigger.stop_price),
                        ),
                    )
                    .await;
                }
                Err(e) if e.is_network() => return Err(e),
                Err(e) => tracing::error!(ticker = %trigger.ticker, error = %e, "stop order failed"),
            }
        }

        // flash crash: held tickers plus the watchlist
        let mut tickers: Vec<String> = portfolio.positions.iter().map(|p| p.ticker.clone()).collect();
        for t in &self.app.config.watchlist {
            if !tickers.contains(t) {
                tickers.push(t.clone());
            }
        }
        for ticker in tickers {
            self.flash_check(&ticker, now).await?;
        }

        self.last_portfolio = Some(portfolio);
        Ok(())
    }

    // ── Outputs ──

    fn audit_gates(&self, scope: &str, results: &[GateResult], now: DateTime<Utc>) {
        let checked_at = db::ts(now);
        for r in results {
            self.app.audit(DbCommand::InsertGateDecision {
                checked_at: checked_at.clone(),
                scope: scope.to_string(),
                gate_name: r.gate_name.clone(),
                passed: r.passed,
                action: r.action.to_string(),
                message: r.message.clone(),
                details: serde_json::to_string(&r.details).unwrap_or_default(),
            });
        }
    }

    fn broadcast_emergency(&self, kind: EmergencyKind, trigger_value: f64, detail: String, now: DateTime<Utc>) {
        self.app.counters.emergency_events.fetch_add(1, Ordering::Relaxed);
        self.app.broadcast(WsMessage::Emergency {
            event_type: kind,
            trigger_value,
            detail,
            timestamp: now.to_rfc3339(),
        });
    }

    pub fn publish(&self, now: DateTime<Utc>) {
        let mut stops: Vec<_> = self.stops.snapshot().into_iter().collect();
        stops.sort_by(|a, b| a.0.cmp(&b.0));
        let snapshot = ControlSnapshot {
            engine_state: self.engine_state,
            phase: self.phase,
            next_wake: self.next_wake,
            day: self.day.clone(),
            risk: Some(self.pipeline.get_context()),
            risk_status: self.pipeline.get_status(),
            emergency: Some(self.emergency.get_status()),
            budget: self.pipeline.budget().last_state(),
            stops,
            portfolio: self.last_portfolio.clone(),
            updated_at: Some(now),
        };
        let _ = self.app.snapshot_tx.send(snapshot);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::emergency::fakes::{CountingNotifier, MemoryStore, ScriptedLink};
    use crate::interfaces::TradeHistory;
    use crate::market::{HolidayCalendar, MarketSessionClock};
    use crate::risk::fixtures::{buy, portfolio, position};
    use crate::risk::Position;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    // ── Fakes ──

    #[derive(Default)]
    pub struct FakeBroker {
        pub portfolio: Mutex<Portfolio>,
        pub submitted: Mutex<Vec<Order>>,
        pub cancels: AtomicUsize,
        pub resyncs: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl PortfolioProvider for FakeBroker {
        async fn get_portfolio_summary(&self) -> EngineResult<Portfolio> {
            Ok(self.portfolio.lock().unwrap().clone())
        }
    }

    #[async_trait::async_trait]
    impl OrderExecutor for FakeBroker {
        async fn submit(&self, order: &Order) -> EngineResult<Fill> {
            let mut pf = self.portfolio.lock().unwrap();
            let mut submitted = self.submitted.lock().unwrap();
            submitted.push(order.clone());
            let notional = order.notional();
            let realized_pnl = match order.side {
                OrderSide::Buy => {
                    pf.cash -= notional;
                    match pf.positions.iter_mut().find(|p| p.ticker == order.ticker) {
                        Some(p) => {
                            p.quantity += order.quantity;
                            p.market_value += notional;
                        }
                        None => pf.positions.push(Position {
                            ticker: order.ticker.clone(),
                            quantity: order.quantity,
                            market_value: notional,
                            entry_price: order.limit_price,
                        }),
                    }
                    None
                }
                OrderSide::Sell => {
                    pf.cash += notional;
                    let p = pf.positions.iter_mut().find(|p| p.ticker == order.ticker).unwrap();
                    let pnl = (order.limit_price - p.entry_price) * order.quantity;
                    p.quantity -= order.quantity;
                    p.market_value = p.quantity * order.limit_price;
                    pf.positions.retain(|p| p.quantity > 0.0);
                    Some(pnl)
                }
            };
            Ok(Fill {
                order_id: format!("fake-{}", submitted.len()),
                ticker: order.ticker.clone(),
                side: order.side,
                quantity: order.quantity,
                price: order.limit_price,
                realized_pnl,
            })
        }

        async fn cancel_all_pending(&self) -> EngineResult<usize> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        }

        async fn resync(&self) -> EngineResult<()> {
            self.resyncs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub struct FakeMarket {
        pub indicators: Mutex<MarketIndicators>,
        pub changes: Mutex<HashMap<String, f64>>,
        pub down: AtomicBool,
    }

    impl Default for FakeMarket {
        fn default() -> Self {
            Self {
                indicators: Mutex::new(MarketIndicators { vix: Some(15.0), spy_change_pct: Some(0.2) }),
                changes: Mutex::new(HashMap::new()),
                down: AtomicBool::new(false),
            }
        }
    }

    impl FakeMarket {
        fn check(&self) -> EngineResult<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(EngineError::Network("connection refused".into()));
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl MarketDataProvider for FakeMarket {
        async fn get_price_history(&self, _ticker: &str, _days: usize) -> EngineResult<Vec<f64>> {
            self.check()?;
            Err(EngineError::MarketData("no history".into()))
        }

        async fn get_last_price(&self, _ticker: &str) -> EngineResult<f64> {
            self.check()?;
            Ok(100.0)
        }

        async fn get_recent_change_pct(&self, ticker: &str, _minutes: i64) -> EngineResult<f64> {
            self.check()?;
            Ok(self.changes.lock().unwrap().get(ticker).copied().unwrap_or(0.0))
        }

        async fn get_market_indicators(&self) -> EngineResult<MarketIndicators> {
            self.check()?;
            Ok(*self.indicators.lock().unwrap())
        }
    }

    #[derive(Default)]
    pub struct ScriptedStrategy {
        pub orders: Vec<Order>,
        pub proposals: AtomicUsize,
        pub preps: AtomicUsize,
        pub eods: AtomicUsize,
        pub analyses: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Strategy for ScriptedStrategy {
        async fn prepare_day(&self, _today: NaiveDate) -> EngineResult<()> {
            self.preps.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn propose_orders(&self, _portfolio: &Portfolio) -> EngineResult<Vec<Order>> {
            self.proposals.fetch_add(1, Ordering::SeqCst);
            Ok(self.orders.clone())
        }

        async fn end_of_day(&self, _portfolio: &Portfolio) -> EngineResult<()> {
            self.eods.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn background_analysis(&self) -> EngineResult<()> {
            self.analyses.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    // ── Harness ──

    struct Harness {
        plane: ControlPlane,
        app: Arc<AppState>,
        broker: Arc<FakeBroker>,
        market: Arc<FakeMarket>,
        strategy: Arc<ScriptedStrategy>,
        store: Arc<MemoryStore>,
        audit_rx: mpsc::Receiver<DbCommand>,
    }

    impl Harness {
        fn drain_audit(&mut self) -> Vec<DbCommand> {
            let mut out = Vec::new();
            while let Ok(cmd) = self.audit_rx.try_recv() {
                out.push(cmd);
            }
            out
        }
    }

    pub(crate) fn test_app(db_tx: mpsc::Sender<DbCommand>) -> Arc<AppState> {
        let cfg = AppConfig::default();
        let clock = MarketSessionClock::new(cfg.exchange_tz, cfg.operator_tz, HolidayCalendar::nyse());
        let (control_tx, _control_rx) = mpsc::channel(4);
        AppState::new(cfg, db::open_in_memory().unwrap(), clock, db_tx, control_tx)
    }

    fn harness(pf: Portfolio, orders: Vec<Order>, reachable_on: usize) -> Harness {
        let (db_tx, audit_rx) = mpsc::channel(256);
        let app = test_app(db_tx);
        let broker = Arc::new(FakeBroker { portfolio: Mutex::new(pf), ..Default::default() });
        let market = Arc::new(FakeMarket::default());
        let strategy = Arc::new(ScriptedStrategy { orders, ..Default::default() });
        let store = Arc::new(MemoryStore::default());
        let notifier = Arc::new(CountingNotifier::default());

        let deps = Collaborators {
            portfolio: broker.clone(),
            market: market.clone(),
            executor: broker.clone(),
            strategy: strategy.clone(),
            connectivity: Arc::new(ScriptedLink::new(reachable_on)),
            notifier: notifier.clone(),
        };
        let ledger = Arc::new(db::SqliteStore::new(app.db.clone()));
        let pipeline = RiskGatePipeline::new(&app.config.risk, ledger);
        let emergency = EmergencyProtocol::new(app.config.emergency.clone(), store.clone(), notifier);
        let plane = ControlPlane::new(app.clone(), deps, pipeline, emergency);
        Harness { plane, app, broker, market, strategy, store, audit_rx }
    }

    fn kst(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        chrono_tz::Asia::Seoul
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn june10() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 6, 10).unwrap()
    }

    /// 10:00 EDT on a regular trading day.
    fn regular_now() -> DateTime<Utc> {
        kst(2026, 6, 10, 23, 0)
    }

    fn cash_only(today_pnl: f64) -> Portfolio {
        portfolio(10_000.0, 10_000.0, today_pnl, vec![])
    }

    // ── Tests ──

    #[tokio::test]
    async fn test_daily_loss_block_skips_proposals() {
        let mut h = harness(cash_only(-160.0), vec![buy("SPY", 10.0, 100.0)], 1);
        h.plane.trading_cycle(regular_now()).await.unwrap();
        assert_eq!(h.strategy.proposals.load(Ordering::SeqCst), 0);
        assert!(h.broker.submitted.lock().unwrap().is_empty());

        let audits = h.drain_audit();
        assert!(audits.iter().any(|c| matches!(
            c,
            DbCommand::InsertGateDecision { gate_name, passed: false, .. } if gate_name == "daily_loss"
        )));
    }

    #[tokio::test]
    async fn test_reduce_halves_buy_size() {
        let mut h = harness(cash_only(-120.0), vec![buy("SPY", 10.0, 100.0)], 1);
        h.plane.trading_cycle(regular_now()).await.unwrap();

        let submitted = h.broker.submitted.lock().unwrap().clone();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].quantity, 5.0);
        let stop = h.plane.stops.get("SPY").copied().unwrap();
        assert_eq!(stop.quantity, 5.0);
        assert!((stop.stop_price - 95.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_scaled_to_zero_is_rejected() {
        let mut h = harness(cash_only(-120.0), vec![buy("SPY", 1.0, 100.0)], 1);
        h.plane.trading_cycle(regular_now()).await.unwrap();
        assert!(h.broker.submitted.lock().unwrap().is_empty());
        assert_eq!(h.app.counters.orders_blocked.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_trailing_stop_fires_sell() {
        let mut pf = cash_only(-100.0);
        pf.cash = 9_100.0;
        pf.positions.push(Position {
            ticker: "AAPL".into(),
            quantity: 10.0,
            market_value: 900.0,
            entry_price: 100.0,
        });
        let mut h = harness(pf, vec![], 1);

        h.plane.monitor_tick(regular_now()).await.unwrap();

        let submitted = h.broker.submitted.lock().unwrap().clone();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].side, OrderSide::Sell);
        assert_eq!(submitted[0].quantity, 10.0);
        assert_eq!(submitted[0].reason, "initial_stop");
        assert!(!h.plane.stops.is_tracked("AAPL"));

        let ledger = db::SqliteStore::new(h.app.db.clone());
        let trades = ledger.recent_closed_trades(5).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].ticker, "AAPL");
        assert!((trades[0].pnl + 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_realized_loss_counts_against_budget_immediately() {
        let held = Position { ticker: "AAPL".into(), quantity: 10.0, market_value: 900.0, entry_price: 100.0 };
        let mut h = harness(portfolio(10_000.0, 9_100.0, -100.0, vec![held]), vec![], 1);
        let now = regular_now();

        let before = h.plane.pipeline.budget_mut().get_consumption(june10()).await.unwrap();
        assert_eq!(before.realized_losses, 0.0);

        h.plane.monitor_tick(now).await.unwrap();

        let after = h.plane.pipeline.budget_mut().get_consumption(june10()).await.unwrap();
        assert!((after.realized_losses - 100.0).abs() < 1e-9);
        assert!(after.consumption_pct > 0.0);
    }

    #[tokio::test]
    async fn test_circuit_breaker_blocks_buys_and_tightens_stops() {
        let pf = portfolio(10_000.0, 9_000.0, 0.0, vec![position("QQQ", 10.0, 100.0)]);
        let mut h = harness(pf, vec![buy("SPY", 10.0, 100.0)], 1);
        *h.market.indicators.lock().unwrap() = MarketIndicators { vix: Some(40.0), spy_change_pct: Some(-1.0) };

        let now = regular_now();
        h.plane.monitor_tick(now).await.unwrap();
        assert!(h.plane.emergency.state().circuit_breaker_active);
        assert_eq!(h.store.count(EmergencyKind::CircuitBreaker), 1);

        h.plane.trading_cycle(now + Duration::minutes(1)).await.unwrap();
        assert!(h.broker.submitted.lock().unwrap().is_empty());
        assert_eq!(h.app.counters.orders_blocked.load(Ordering::Relaxed), 1);

        // tightened trail: 100 * 0.995
        let stop = h.plane.stops.get("QQQ").copied().unwrap();
        assert!((stop.stop_price - 99.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_flash_crash_cools_down_ticker() {
        let mut h = harness(cash_only(0.0), vec![buy("SPY", 10.0, 100.0)], 1);
        h.market.changes.lock().unwrap().insert("SPY".into(), -6.0);
        let now = regular_now();

        h.plane.monitor_tick(now).await.unwrap();
        assert_eq!(h.store.count(EmergencyKind::FlashCrash), 1);

        h.plane.trading_cycle(now).await.unwrap();
        assert!(h.broker.submitted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_runaway_loss_liquidates_and_halts() {
        let pf = portfolio(10_000.0, 8_000.0, -600.0, vec![position("SPY", 4.0, 500.0)]);
        let mut h = harness(pf, vec![buy("QQQ", 1.0, 100.0)], 1);
        let now = regular_now();
        h.plane.set_engine_state(EngineState::Running, "test");

        h.plane.monitor_tick(now).await.unwrap();
        assert_eq!(h.plane.engine_state(), EngineState::Halted);
        assert_eq!(h.store.count(EmergencyKind::RunawayLoss), 1);
        assert!(h.broker.portfolio.lock().unwrap().positions.is_empty());
        assert_eq!(h.broker.cancels.load(Ordering::SeqCst), 1);

        // second tick does not fire again
        h.plane.monitor_tick(now + Duration::minutes(5)).await.unwrap();
        assert_eq!(h.store.count(EmergencyKind::RunawayLoss), 1);

        // next day's prep lifts the shutdown
        h.plane.prepare(NaiveDate::from_ymd_opt(2026, 6, 11).unwrap(), now + Duration::hours(23)).await.unwrap();
        assert_eq!(h.plane.engine_state(), EngineState::Running);
        assert!(!h.plane.emergency.trading_halted());
        assert_eq!(h.strategy.preps.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_error_runs_recovery() {
        let mut h = harness(cash_only(0.0), vec![], 1);
        h.market.down.store(true, Ordering::SeqCst);
        let now = regular_now();
        h.plane.day = DayState {
            prepared_for: Some(june10()),
            last_weekly: Some(iso_week_of(&h.app.clock, now)),
            ..Default::default()
        };

        let outcome = h.plane.step(now).await;
        // one 5s backoff wait, then the 60s retry
        assert_eq!(outcome, StepOutcome::Sleep(now + Duration::seconds(65)));
        assert_eq!(h.store.count(EmergencyKind::NetworkFailure), 1);
        assert_eq!(h.broker.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(h.broker.resyncs.load(Ordering::SeqCst), 1);
        assert_eq!(h.app.counters.errors_recovered.load(Ordering::Relaxed), 1);
        assert_eq!(h.plane.day().last_cycle_at, Some(now));
    }

    #[tokio::test]
    async fn test_end_of_day_persists_pnl_and_budget() {
        let mut h = harness(cash_only(42.0), vec![], 1);
        h.plane.end_of_day(june10(), kst(2026, 6, 11, 5, 30)).await.unwrap();
        assert_eq!(h.strategy.eods.load(Ordering::SeqCst), 1);
        assert_eq!(h.plane.day().eod_done_for, Some(june10()));

        let audits = h.drain_audit();
        assert!(audits.iter().any(|c| matches!(
            c,
            DbCommand::UpsertDailyPnl { date, pnl, .. } if *date == june10() && (*pnl - 42.0).abs() < 1e-9
        )));
        assert!(audits.iter().any(|c| matches!(c, DbCommand::InsertBudgetSnapshot { tier: 1, .. })));
    }

    #[tokio::test]
    async fn test_step_prepares_then_exits_at_auto_stop() {
        let mut h = harness(cash_only(0.0), vec![], 1);
        let start = kst(2026, 6, 10, 22, 0);
        h.plane.begin_run(start);
        h.plane.day.last_weekly = Some(iso_week_of(&h.app.clock, start));
        assert_eq!(h.plane.day().auto_stop_at, Some(kst(2026, 6, 11, 6, 30)));

        let outcome = h.plane.step(start).await;
        assert_eq!(outcome, StepOutcome::Sleep(start));
        assert_eq!(h.plane.day().prepared_for, Some(june10()));
        assert_eq!(h.strategy.preps.load(Ordering::SeqCst), 1);

        let snap = h.app.snapshot_rx.borrow().clone();
        assert_eq!(snap.engine_state, EngineState::Running);
        assert_eq!(snap.phase, Some(Phase::Prep));

        assert_eq!(h.plane.step(kst(2026, 6, 11, 6, 30)).await, StepOutcome::Exit);
    }
}
