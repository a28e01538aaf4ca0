use super::{ErrorPolicy, GateAction, GateResult, MarketData, Portfolio, RiskGate};
use crate::config::RiskConfig;
use crate::errors::GateError;
use crate::interfaces::TradeHistory;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StreakState {
    pub current_streak: u32,
    pub daily_loss_days: u32,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct StreakRules {
    pub reduce_at: u32,
    pub block_at: u32,
    pub halt_at: u32,
    pub loss_days_block: u32,
    pub lookback_trades: usize,
}

impl From<&RiskConfig> for StreakRules {
    fn from(cfg: &RiskConfig) -> Self {
        Self {
            reduce_at: cfg.streak_reduce,
            block_at: cfg.streak_block,
            halt_at: cfg.streak_halt,
            loss_days_block: cfg.loss_days_block,
            lookback_trades: cfg.streak_lookback_trades,
        }
    }
}

impl StreakRules {
    /// Loss-day streak outranks the trade streak; trade thresholds are
    /// evaluated most severe first.
    pub fn classify(&self, state: StreakState) -> (GateAction, String) {
        if state.daily_loss_days >= self.loss_days_block {
            return (
                GateAction::Block,
                format!("{} consecutive losing days", state.daily_loss_days),
            );
        }
        let n = state.current_streak;
        let action = if n >= self.halt_at {
            GateAction::Halt
        } else if n >= self.block_at {
            GateAction::Block
        } else if n >= self.reduce_at {
            GateAction::Reduce
        } else {
            GateAction::Allow
        };
        (action, format!("{n} consecutive losing trades"))
    }
}

/// Count leading losses in a newest-first series, stopping at the first
/// non-loss.
pub fn trailing_losses<I: IntoIterator<Item = f64>>(pnls: I) -> u32 {
    pnls.into_iter().take_while(|p| *p < 0.0).count() as u32
}

/// Losing streak detector. Advisory: fail-open.
pub struct LosingStreakDetector {
    rules: StreakRules,
    history: Arc<dyn TradeHistory>,
    last_state: Option<StreakState>,
}

impl LosingStreakDetector {
    pub const NAME: &'static str = "losing_streak";

    pub fn new(rules: StreakRules, history: Arc<dyn TradeHistory>) -> Self {
        Self {
            rules,
            history,
            last_state: None,
        }
    }

    pub async fn compute_state(&self) -> Result<StreakState, GateError> {
        let trades = self.history.recent_closed_trades(self.rules.lookback_trades).await?;
        let days = self
            .history
            .recent_daily_pnl(self.rules.loss_days_block.max(1) as usize + 7)
            .await?;

        Ok(StreakState {
            current_streak: trailing_losses(trades.iter().map(|t| t.pnl)),
            daily_loss_days: trailing_losses(days.iter().map(|d| d.pnl)),
        })
    }
}

#[async_trait::async_trait]
impl RiskGate for LosingStreakDetector {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn error_policy(&self) -> ErrorPolicy {
        ErrorPolicy::FailOpen
    }

    async fn check(
        &mut self,
        _portfolio: &Portfolio,
        _market_data: Option<&MarketData>,
    ) -> Result<GateResult, GateError> {
        let state = self.compute_state().await?;
        self.last_state = Some(state);

        let (action, message) = self.rules.classify(state);
        if action != GateAction::Allow {
            tracing::warn!(
                streak = state.current_streak,
                loss_days = state.daily_loss_days,
                action = %action,
                "losing streak detected"
            );
        }

        let passed = matches!(action, GateAction::Allow | GateAction::Reduce);
        Ok(GateResult::new(Self::NAME, passed, action, message)
            .with_detail("current_streak", state.current_streak)
            .with_detail("daily_loss_days", state.daily_loss_days))
    }

    fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "rules": self.rules,
            "last_state": self.last_state,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::errors::{EngineError, EngineResult};
    use crate::interfaces::{ClosedTrade, DailyPnl};
    use chrono::{Duration, NaiveDate, Utc};

    /// In-memory ledger; `fail` simulates a broken data source.
    #[derive(Default)]
    pub struct FakeHistory {
        pub trades: Vec<f64>,
        pub days: Vec<f64>,
        pub month: Vec<f64>,
        pub fail: bool,
    }

    #[async_trait::async_trait]
    impl TradeHistory for FakeHistory {
        async fn recent_closed_trades(&self, limit: usize) -> EngineResult<Vec<ClosedTrade>> {
            if self.fail {
                return Err(EngineError::Database("offline".into()));
            }
            Ok(self
                .trades
                .iter()
                .take(limit)
                .enumerate()
                .map(|(i, pnl)| ClosedTrade {
                    ticker: "SPY".into(),
                    pnl: *pnl,
                    closed_at: Utc::now() - Duration::hours(i as i64),
                })
                .collect())
        }

        async fn recent_daily_pnl(&self, days: usize) -> EngineResult<Vec<DailyPnl>> {
            if self.fail {
                return Err(EngineError::Database("offline".into()));
            }
            let base = NaiveDate::from_ymd_opt(2026, 3, 20).unwrap();
            Ok(self
                .days
                .iter()
                .take(days)
                .enumerate()
                .map(|(i, pnl)| DailyPnl { date: base - Duration::days(i as i64), pnl: *pnl })
                .collect())
        }

        async fn realized_pnl_between(&self, _start: NaiveDate, _end: NaiveDate) -> EngineResult<Vec<f64>> {
            if self.fail {
                return Err(EngineError::Database("offline".into()));
            }
            Ok(self.month.clone())
        }
    }

    fn detector(trades: Vec<f64>, days: Vec<f64>) -> LosingStreakDetector {
        let history = FakeHistory { trades, days, ..Default::default() };
        LosingStreakDetector::new(StreakRules::from(&RiskConfig::default()), Arc::new(history))
    }

    async fn run(trades: Vec<f64>, days: Vec<f64>) -> GateResult {
        detector(trades, days)
            .check(&Portfolio::default(), None)
            .await
            .unwrap()
    }

    #[test]
    fn test_trailing_losses_stops_at_first_win() {
        assert_eq!(trailing_losses([-1.0, -2.0, 3.0, -4.0]), 2);
        assert_eq!(trailing_losses([0.0, -1.0]), 0);
        assert_eq!(trailing_losses(Vec::<f64>::new()), 0);
    }

    #[tokio::test]
    async fn test_three_losses_reduce() {
        let r = run(vec![-1.0, -1.0, -1.0, 5.0], vec![]).await;
        assert_eq!(r.action, GateAction::Reduce);
        assert!(r.passed);
    }

    #[tokio::test]
    async fn test_five_losses_block() {
        let r = run(vec![-1.0; 5], vec![]).await;
        assert_eq!(r.action, GateAction::Block);
        assert!(!r.passed);
    }

    #[tokio::test]
    async fn test_seven_losses_halt() {
        let r = run(vec![-1.0; 8], vec![]).await;
        assert_eq!(r.action, GateAction::Halt);
    }

    #[tokio::test]
    async fn test_three_loss_days_block_without_trade_streak() {
        let r = run(vec![10.0, -1.0], vec![-5.0, -3.0, -2.0, 8.0]).await;
        assert_eq!(r.action, GateAction::Block);
        assert_eq!(r.details["daily_loss_days"], 3);
    }

    #[tokio::test]
    async fn test_loss_days_take_priority_over_halt_streak() {
        let r = run(vec![-1.0; 7], vec![-1.0, -1.0, -1.0]).await;
        assert_eq!(r.action, GateAction::Block);
    }

    #[tokio::test]
    async fn test_two_loss_days_do_not_block() {
        let r = run(vec![1.0], vec![-1.0, -1.0, 4.0, -1.0]).await;
        assert_eq!(r.action, GateAction::Allow);
    }

    #[tokio::test]
    async fn test_data_source_failure_is_error_with_fail_open_policy() {
        let history = FakeHistory { fail: true, ..Default::default() };
        let mut gate = LosingStreakDetector::new(StreakRules::from(&RiskConfig::default()), Arc::new(history));
        assert_eq!(gate.error_policy(), ErrorPolicy::FailOpen);
        assert!(gate.check(&Portfolio::default(), None).await.is_err());
    }
}
