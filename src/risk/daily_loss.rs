use super::{ErrorPolicy, GateAction, GateResult, MarketData, Portfolio, RiskGate};
use crate::errors::GateError;

/// One tier of the daily loss ladder. `threshold_pct` is negative.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct LossLevel {
    pub threshold_pct: f64,
    pub action: GateAction,
}

/// Daily loss limiter.
///
/// daily_pnl_pct = today_pnl / total_value * 100
///
/// Every level with `daily_pnl_pct <= threshold_pct` is breached; the most
/// negative breached threshold decides the action. Only a `reduce` outcome
/// keeps `passed = true`. Fail-closed.
pub struct DailyLossLimiter {
    levels: Vec<LossLevel>,
    last_pnl_pct: Option<f64>,
    last_level: Option<LossLevel>,
}

impl DailyLossLimiter {
    pub const NAME: &'static str = "daily_loss";

    pub fn new(levels: Vec<LossLevel>) -> Self {
        Self {
            levels,
            last_pnl_pct: None,
            last_level: None,
        }
    }

    /// Most severe breached level for a given daily PnL percentage.
    pub fn breached_level(&self, daily_pnl_pct: f64) -> Option<LossLevel> {
        self.levels
            .iter()
            .filter(|l| daily_pnl_pct <= l.threshold_pct)
            .min_by(|a, b| a.threshold_pct.total_cmp(&b.threshold_pct))
            .copied()
    }

    pub fn evaluate(&mut self, portfolio: &Portfolio) -> Result<GateResult, GateError> {
        if !portfolio.total_value.is_finite() || portfolio.total_value <= 0.0 {
            return Err(GateError::InvalidInput(format!(
                "total_value must be positive, got {}",
                portfolio.total_value
            )));
        }
        let pnl_pct = portfolio.daily_pnl_pct();
        if !pnl_pct.is_finite() {
            return Err(GateError::Computation("daily pnl pct is not finite".into()));
        }

        let level = self.breached_level(pnl_pct);
        self.last_pnl_pct = Some(pnl_pct);
        self.last_level = level;

        let result = match level {
            None => GateResult::allow(Self::NAME, format!("daily pnl {pnl_pct:.2}% within limits")),
            Some(level) => {
                tracing::warn!(
                    pnl_pct = pnl_pct,
                    threshold = level.threshold_pct,
                    action = %level.action,
                    "daily loss level breached"
                );
                GateResult::new(
                    Self::NAME,
                    level.action == GateAction::Reduce,
                    level.action,
                    format!(
                        "daily pnl {pnl_pct:.2}% breached {:.2}% -> {}",
                        level.threshold_pct, level.action
                    ),
                )
                .with_detail("threshold_pct", level.threshold_pct)
            }
        };

        Ok(result.with_detail("daily_pnl_pct", pnl_pct))
    }
}

#[async_trait::async_trait]
impl RiskGate for DailyLossLimiter {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn error_policy(&self) -> ErrorPolicy {
        ErrorPolicy::FailClosed
    }

    async fn check(
        &mut self,
        portfolio: &Portfolio,
        _market_data: Option<&MarketData>,
    ) -> Result<GateResult, GateError> {
        self.evaluate(portfolio)
    }

    fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "levels": self.levels,
            "last_pnl_pct": self.last_pnl_pct,
            "last_level": self.last_level,
        })
    }
}
