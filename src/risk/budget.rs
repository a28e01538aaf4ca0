use super::{GateAction, GateResult, Order, OrderSide};
use crate::config::RiskConfig;
use crate::errors::GateError;
use crate::interfaces::TradeHistory;
use chrono::{Datelike, NaiveDate};
use std::sync::Arc;

/// Consumption bands: (upper edge inclusive, scale). Above the last edge the
/// budget is exhausted.
const TIERS: [(f64, f64); 4] = [(30.0, 1.0), (60.0, 0.70), (80.0, 0.40), (100.0, 0.0)];

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct RiskBudgetState {
    pub monthly_budget_pct: f64,
    pub consumption_pct: f64,
    pub current_tier: u8,
    pub position_scale: f64,
    pub realized_losses: f64,
    pub budget_amount: f64,
    pub as_of: NaiveDate,
}

/// Map a consumption percentage onto (tier, scale).
pub fn tier_for(consumption_pct: f64) -> (u8, f64) {
    for (i, (edge, scale)) in TIERS.iter().enumerate() {
        if consumption_pct <= *edge {
            return (i as u8 + 1, *scale);
        }
    }
    (4, 0.0)
}

/// Monthly loss-budget tracker.
///
/// consumption% = realized_losses(month) / (initial_capital * |budget%| / 100) * 100
///
/// Consumption is recomputed from the ledger on every call; the cached state
/// only feeds `status()` and the EOD snapshot. Fail-closed.
pub struct RiskBudget {
    monthly_budget_pct: f64,
    initial_capital: f64,
    history: Arc<dyn TradeHistory>,
    last_state: Option<RiskBudgetState>,
}

impl RiskBudget {
    pub const NAME: &'static str = "risk_budget";

    pub fn new(cfg: &RiskConfig, history: Arc<dyn TradeHistory>) -> Self {
        Self {
            monthly_budget_pct: cfg.monthly_budget_pct,
            initial_capital: cfg.initial_capital,
            history,
            last_state: None,
        }
    }

    pub async fn get_consumption(&mut self, today: NaiveDate) -> Result<RiskBudgetState, GateError> {
        let budget_amount = self.initial_capital * self.monthly_budget_pct.abs() / 100.0;
        if !budget_amount.is_finite() || budget_amount <= 0.0 {
            return Err(GateError::InvalidInput(format!("budget amount {budget_amount} not positive")));
        }

        let month_start = today
            .with_day(1)
            .ok_or_else(|| GateError::Computation(format!("no first day for {today}")))?;
        let pnls = self.history.realized_pnl_between(month_start, today).await?;

        let realized_losses: f64 = pnls.iter().filter(|p| **p < 0.0).map(|p| -p).sum();
        if !realized_losses.is_finite() {
            return Err(GateError::Computation("realized losses not finite".into()));
        }

        let consumption_pct = realized_losses * 100.0 / budget_amount;
        let (current_tier, position_scale) = tier_for(consumption_pct);
        let state = RiskBudgetState {
            monthly_budget_pct: self.monthly_budget_pct,
            consumption_pct,
            current_tier,
            position_scale,
            realized_losses,
            budget_amount,
            as_of: today,
        };
        self.last_state = Some(state);
        Ok(state)
    }

    pub async fn check_order(&mut self, order: &Order, today: NaiveDate) -> Result<GateResult, GateError> {
        if order.side == OrderSide::Sell {
            return Ok(GateResult::allow(Self::NAME, "sell does not consume budget"));
        }

        let state = self.get_consumption(today).await?;
        let result = if state.current_tier >= 4 || state.consumption_pct >= 100.0 {
            tracing::warn!(consumption = state.consumption_pct, "monthly risk budget exhausted");
            GateResult::new(
                Self::NAME,
                false,
                GateAction::Block,
                format!("budget tier {} ({:.1}% consumed): no new entries", state.current_tier, state.consumption_pct),
            )
        } else if state.current_tier >= 3 {
            GateResult::new(
                Self::NAME,
                true,
                GateAction::Reduce,
                format!("budget tier 3 ({:.1}% consumed): size x{:.2}", state.consumption_pct, state.position_scale),
            )
        } else {
            GateResult::allow(
                Self::NAME,
                format!("budget tier {} ({:.1}% consumed)", state.current_tier, state.consumption_pct),
            )
        };

        Ok(result
            .with_detail("tier", state.current_tier)
            .with_detail("scale", state.position_scale)
            .with_detail("consumption_pct", state.consumption_pct))
    }

    /// EOD refresh. Returns the state for the caller to persist.
    pub async fn update_budget(&mut self, today: NaiveDate) -> Result<RiskBudgetState, GateError> {
        let state = self.get_consumption(today).await?;
        tracing::info!(
            tier = state.current_tier,
            consumption = state.consumption_pct,
            scale = state.position_scale,
            "risk budget updated"
        );
        Ok(state)
    }

    pub fn last_state(&self) -> Option<RiskBudgetState> {
        self.last_state
    }

    pub fn get_status(&self) -> serde_json::Value {
        serde_json::json!({
            "monthly_budget_pct": self.monthly_budget_pct,
            "initial_capital": self.initial_capital,
            "last_state": self.last_state,
        })
    }
}
