use super::budget::RiskBudget;
use super::concentration::{ConcentrationLimiter, ConcentrationLimits};
use super::daily_loss::DailyLossLimiter;
use super::streak::{LosingStreakDetector, StreakRules};
use super::var::ValueAtRiskGate;
use super::{ErrorPolicy, GateAction, GateResult, MarketData, Order, Portfolio, RiskGate};
use crate::config::RiskConfig;
use crate::interfaces::TradeHistory;
use chrono::{DateTime, NaiveDate, Utc};
use smallvec::SmallVec;
use std::sync::Arc;

/// Scale applied when a gate asks to reduce without naming a size.
const DEFAULT_REDUCE_SCALE: f64 = 0.5;

#[derive(Debug, Clone, serde::Serialize)]
pub struct PipelineResult {
    pub can_trade: bool,
    pub gate_results: SmallVec<[GateResult; 4]>,
    pub blocking_gates: Vec<String>,
    pub overall_action: GateAction,
    pub checked_at: DateTime<Utc>,
}

impl PipelineResult {
    fn from_results(gate_results: SmallVec<[GateResult; 4]>, checked_at: DateTime<Utc>) -> Self {
        let blocking_gates: Vec<String> = gate_results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| r.gate_name.clone())
            .collect();
        let overall_action = gate_results
            .iter()
            .map(|r| r.action)
            .max()
            .unwrap_or(GateAction::Allow);
        Self {
            can_trade: blocking_gates.is_empty(),
            gate_results,
            blocking_gates,
            overall_action,
            checked_at,
        }
    }

    /// Size multiplier the cycle-level result imposes on new entries.
    pub fn position_scale(&self) -> f64 {
        match self.overall_action {
            GateAction::Allow => 1.0,
            GateAction::Reduce => DEFAULT_REDUCE_SCALE,
            GateAction::Block | GateAction::Halt => 0.0,
        }
    }

    pub fn summary(&self) -> String {
        self.gate_results
            .iter()
            .filter(|r| r.action != GateAction::Allow)
            .map(|r| format!("[{}] {}", r.gate_name, r.message))
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

/// Outcome of the per-order second pass.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OrderCheck {
    pub approved: bool,
    pub action: GateAction,
    /// Multiplier for the order quantity, in [0, 1].
    pub scale: f64,
    pub results: SmallVec<[GateResult; 2]>,
}

/// Read-only context handed to the decision layer.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PipelineContext {
    pub can_trade: bool,
    pub overall_action: GateAction,
    pub position_scale: f64,
    pub blocking_gates: Vec<String>,
    pub warnings: Vec<String>,
    pub checked_at: Option<DateTime<Utc>>,
}

/// Composes the four portfolio gates plus the order-shaped checks.
pub struct RiskGatePipeline {
    daily_loss: DailyLossLimiter,
    concentration: ConcentrationLimiter,
    streak: LosingStreakDetector,
    var: ValueAtRiskGate,
    budget: RiskBudget,
    last_result: Option<PipelineResult>,
}

impl RiskGatePipeline {
    pub fn new(cfg: &RiskConfig, history: Arc<dyn TradeHistory>) -> Self {
        Self {
            daily_loss: DailyLossLimiter::new(cfg.loss_levels.clone()),
            concentration: ConcentrationLimiter::new(ConcentrationLimits::from(cfg)),
            streak: LosingStreakDetector::new(StreakRules::from(cfg), history.clone()),
            var: ValueAtRiskGate::new(cfg),
            budget: RiskBudget::new(cfg, history),
            last_result: None,
        }
    }

    pub fn var_lookback_days(&self) -> usize {
        self.var.lookback_days()
    }

    pub fn budget(&self) -> &RiskBudget {
        &self.budget
    }

    pub fn budget_mut(&mut self) -> &mut RiskBudget {
        &mut self.budget
    }

    /// Cycle-level pass. VaR runs only when `market_data` is supplied.
    pub async fn check_all(&mut self, portfolio: &Portfolio, market_data: Option<&MarketData>) -> PipelineResult {
        let now = Utc::now();
        let mut results: SmallVec<[GateResult; 4]> = SmallVec::new();

        if let Err(e) = portfolio.validate() {
            tracing::error!(error = %e, "portfolio snapshot rejected");
            results.push(GateResult::from_error("portfolio_validation", ErrorPolicy::FailClosed, &e));
            let result = PipelineResult::from_results(results, now);
            self.last_result = Some(result.clone());
            return result;
        }

        let gates: [&mut dyn RiskGate; 4] = [
            &mut self.daily_loss,
            &mut self.concentration,
            &mut self.streak,
            &mut self.var,
        ];

        for gate in gates {
            if gate.requires_market_data() && market_data.is_none() {
                continue;
            }
            let result = match gate.check(portfolio, market_data).await {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!(gate = gate.name(), policy = ?gate.error_policy(), error = %e, "gate error");
                    GateResult::from_error(gate.name(), gate.error_policy(), &e)
                }
            };
            results.push(result);
        }

        let result = PipelineResult::from_results(results, now);
        if result.can_trade {
            tracing::info!(overall = %result.overall_action, "risk gates passed");
        } else {
            tracing::warn!(
                overall = %result.overall_action,
                blocking = ?result.blocking_gates,
                summary = %result.summary(),
                "risk gates blocked trading"
            );
        }
        self.last_result = Some(result.clone());
        result
    }

    /// Per-order pass: concentration on the projected portfolio and the
    /// monthly budget. Runs for every candidate, even after `check_all`
    /// passed. Both checks fail closed.
    pub async fn check_order(&mut self, order: &Order, portfolio: &Portfolio, today: NaiveDate) -> OrderCheck {
        let mut results: SmallVec<[GateResult; 2]> = SmallVec::new();

        results.push(match self.concentration.check_order(order, portfolio) {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(ticker = %order.ticker, error = %e, "concentration order check failed");
                GateResult::from_error(ConcentrationLimiter::NAME, ErrorPolicy::FailClosed, &e)
            }
        });
        results.push(match self.budget.check_order(order, today).await {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(ticker = %order.ticker, error = %e, "budget order check failed");
                GateResult::from_error(RiskBudget::NAME, ErrorPolicy::FailClosed, &e)
            }
        });

        let approved = results.iter().all(|r| r.passed);
        let action = results.iter().map(|r| r.action).max().unwrap_or(GateAction::Allow);
        let scale = if approved {
            results
                .iter()
                .map(|r| match r.details.get("scale").and_then(|v| v.as_f64()) {
                    Some(s) => s.clamp(0.0, 1.0),
                    None if r.action == GateAction::Reduce => DEFAULT_REDUCE_SCALE,
                    None => 1.0,
                })
                .fold(1.0, f64::min)
        } else {
            0.0
        };

        if !approved {
            tracing::warn!(ticker = %order.ticker, action = %action, "order rejected by risk checks");
        }

        OrderCheck { approved, action, scale, results }
    }

    pub fn last_result(&self) -> Option<&PipelineResult> {
        self.last_result.as_ref()
    }

    pub fn get_status(&self) -> serde_json::Value {
        serde_json::json!({
            "gates": {
                "daily_loss": self.daily_loss.status(),
                "concentration": self.concentration.status(),
                "losing_streak": self.streak.status(),
                "value_at_risk": self.var.status(),
            },
            "budget": self.budget.get_status(),
            "last_result": self.last_result,
        })
    }

    pub fn get_context(&self) -> PipelineContext {
        match &self.last_result {
            Some(r) => PipelineContext {
                can_trade: r.can_trade,
                overall_action: r.overall_action,
                position_scale: r.position_scale(),
                blocking_gates: r.blocking_gates.clone(),
                warnings: r
                    .gate_results
                    .iter()
                    .filter(|g| g.action != GateAction::Allow)
                    .map(|g| g.message.clone())
                    .collect(),
                checked_at: Some(r.checked_at),
            },
            None => PipelineContext {
                can_trade: false,
                overall_action: GateAction::Allow,
                position_scale: 0.0,
                blocking_gates: Vec::new(),
                warnings: vec!["risk gates not yet evaluated".into()],
                checked_at: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::fixtures::{buy, portfolio, position};
    use crate::risk::streak::tests::FakeHistory;

    fn pipeline(history: FakeHistory) -> RiskGatePipeline {
        RiskGatePipeline::new(&RiskConfig::default(), Arc::new(history))
    }

    fn healthy() -> Portfolio {
        portfolio(10_000.0, 6_000.0, 10.0, vec![position("SPY", 4.0, 500.0), position("QQQ", 8.0, 250.0)])
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 18).unwrap()
    }

    #[tokio::test]
    async fn test_healthy_portfolio_can_trade() {
        let mut p = pipeline(FakeHistory::default());
        let r = p.check_all(&healthy(), None).await;
        assert!(r.can_trade);
        assert_eq!(r.overall_action, GateAction::Allow);
        assert_eq!(r.gate_results.len(), 3, "VaR skipped without market data");
    }

    #[tokio::test]
    async fn test_var_runs_with_market_data() {
        let mut p = pipeline(FakeHistory::default());
        let r = p.check_all(&healthy(), Some(&MarketData::default())).await;
        assert_eq!(r.gate_results.len(), 4);
        assert!(r.gate_results.iter().any(|g| g.gate_name == ValueAtRiskGate::NAME));
    }

    #[tokio::test]
    async fn test_streak_failure_fails_open() {
        let mut p = pipeline(FakeHistory { fail: true, ..Default::default() });
        let r = p.check_all(&healthy(), None).await;
        assert!(r.can_trade);
        let streak = r.gate_results.iter().find(|g| g.gate_name == LosingStreakDetector::NAME).unwrap();
        assert!(streak.passed);
        assert_eq!(streak.action, GateAction::Allow);
    }

    #[tokio::test]
    async fn test_overall_action_is_max_severity() {
        let mut p = pipeline(FakeHistory { trades: vec![-1.0; 3], ..Default::default() });
        // -2.5% daily -> halt; streak 3 -> reduce
        let mut pf = healthy();
        pf.today_pnl = -250.0;
        let r = p.check_all(&pf, None).await;
        assert!(!r.can_trade);
        assert_eq!(r.overall_action, GateAction::Halt);
        assert_eq!(r.blocking_gates, vec![DailyLossLimiter::NAME.to_string()]);
    }

    #[tokio::test]
    async fn test_reduce_keeps_trading_with_scale() {
        let mut p = pipeline(FakeHistory::default());
        let mut pf = healthy();
        pf.today_pnl = -120.0;
        let r = p.check_all(&pf, None).await;
        assert!(r.can_trade);
        assert_eq!(r.overall_action, GateAction::Reduce);
        assert!((r.position_scale() - 0.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_invalid_snapshot_fails_closed() {
        let mut p = pipeline(FakeHistory::default());
        let r = p.check_all(&portfolio(0.0, 0.0, 0.0, vec![]), None).await;
        assert!(!r.can_trade);
        assert_eq!(r.overall_action, GateAction::Block);
    }

    #[tokio::test]
    async fn test_check_order_blocks_new_ticker_at_ceiling() {
        let mut p = pipeline(FakeHistory::default());
        let pf = portfolio(
            10_000.0,
            5_000.0,
            0.0,
            vec![position("A", 10.0, 100.0), position("B", 10.0, 100.0), position("C", 10.0, 100.0)],
        );
        let check = p.check_order(&buy("NEW", 20.0, 100.0), &pf, today()).await;
        assert!(!check.approved);
        assert_eq!(check.action, GateAction::Block);
        assert_eq!(check.scale, 0.0);
    }

    #[tokio::test]
    async fn test_check_order_takes_smallest_scale() {
        // budget tier 2 (40% consumed) -> 0.70
        let mut p = pipeline(FakeHistory { month: vec![-200.0], ..Default::default() });
        let check = p.check_order(&buy("IWM", 5.0, 200.0), &healthy(), today()).await;
        assert!(check.approved);
        assert!((check.scale - 0.70).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_check_order_budget_failure_fails_closed() {
        let mut p = pipeline(FakeHistory { fail: true, ..Default::default() });
        let check = p.check_order(&buy("IWM", 1.0, 100.0), &healthy(), today()).await;
        assert!(!check.approved);
    }

    #[tokio::test]
    async fn test_context_before_first_check_is_closed() {
        let p = pipeline(FakeHistory::default());
        let ctx = p.get_context();
        assert!(!ctx.can_trade);
        assert!(p.get_status()["last_result"].is_null());
    }
}
