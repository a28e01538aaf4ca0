use super::{ErrorPolicy, GateAction, GateResult, MarketData, Order, OrderSide, Portfolio, RiskGate};
use crate::config::RiskConfig;
use crate::errors::GateError;

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct ConcentrationLimits {
    pub max_positions: usize,
    pub min_cash_pct: f64,
    pub total_max_pct: f64,
    pub single_max_pct: f64,
}

impl From<&RiskConfig> for ConcentrationLimits {
    fn from(cfg: &RiskConfig) -> Self {
        Self {
            max_positions: cfg.max_positions,
            min_cash_pct: cfg.min_cash_pct,
            total_max_pct: cfg.total_max_pct,
            single_max_pct: cfg.single_max_pct,
        }
    }
}

/// Portfolio concentration limits. Every breach is reported, never
/// short-circuited. Fail-closed.
pub struct ConcentrationLimiter {
    limits: ConcentrationLimits,
    last_violations: Vec<String>,
}

impl ConcentrationLimiter {
    pub const NAME: &'static str = "concentration";

    pub fn new(limits: ConcentrationLimits) -> Self {
        Self {
            limits,
            last_violations: Vec::new(),
        }
    }

    pub fn limits(&self) -> ConcentrationLimits {
        self.limits
    }

    fn violations(&self, portfolio: &Portfolio) -> Vec<String> {
        let l = &self.limits;
        let total = portfolio.total_value;
        let mut out = Vec::new();

        let count = portfolio.positions.len();
        if count > l.max_positions {
            out.push(format!("position count {count} > max {}", l.max_positions));
        }

        let cash_pct = portfolio.cash / total * 100.0;
        if cash_pct < l.min_cash_pct {
            out.push(format!("cash {cash_pct:.1}% < min {:.1}%", l.min_cash_pct));
        }

        let invested_pct = portfolio.invested_value() / total * 100.0;
        if invested_pct > l.total_max_pct {
            out.push(format!("invested {invested_pct:.1}% > max {:.1}%", l.total_max_pct));
        }

        for p in &portfolio.positions {
            let pct = p.market_value / total * 100.0;
            if pct > l.single_max_pct {
                out.push(format!("{} {pct:.1}% > single max {:.1}%", p.ticker, l.single_max_pct));
            }
        }

        out
    }

    pub fn evaluate(&mut self, portfolio: &Portfolio) -> Result<GateResult, GateError> {
        if !portfolio.total_value.is_finite() || portfolio.total_value <= 0.0 {
            return Err(GateError::InvalidInput("total_value must be positive".into()));
        }

        let violations = self.violations(portfolio);
        self.last_violations = violations.clone();

        if violations.is_empty() {
            return Ok(GateResult::allow(Self::NAME, "concentration within limits")
                .with_detail("position_count", portfolio.positions.len()));
        }

        tracing::warn!(violations = ?violations, "concentration limits breached");
        Ok(GateResult::new(Self::NAME, false, GateAction::Block, violations.join("; "))
            .with_detail("violations", violations)
            .with_detail("position_count", portfolio.positions.len()))
    }

    /// Pre-validate a proposed order against the projected post-trade
    /// portfolio.
    ///
    /// A brand-new ticker beyond `max_positions` blocks outright. Value
    /// breaches return `reduce` with the largest notional that still fits.
    pub fn check_order(&self, order: &Order, portfolio: &Portfolio) -> Result<GateResult, GateError> {
        if !portfolio.total_value.is_finite() || portfolio.total_value <= 0.0 {
            return Err(GateError::InvalidInput("total_value must be positive".into()));
        }
        if !order.notional().is_finite() || order.quantity <= 0.0 || order.limit_price <= 0.0 {
            return Err(GateError::InvalidInput(format!("{}: invalid order size/price", order.ticker)));
        }

        if order.side == OrderSide::Sell {
            return Ok(GateResult::allow(Self::NAME, "sell reduces exposure"));
        }

        let l = &self.limits;
        let total = portfolio.total_value;
        let existing = portfolio.position(&order.ticker).map(|p| p.market_value);

        if existing.is_none() && portfolio.positions.len() >= l.max_positions {
            return Ok(GateResult::new(
                Self::NAME,
                false,
                GateAction::Block,
                format!(
                    "new ticker {} would exceed max positions {}",
                    order.ticker, l.max_positions
                ),
            )
            .with_detail("position_count", portfolio.positions.len()));
        }

        let notional = order.notional();
        let projected_cash = portfolio.cash - notional;
        let projected_invested = portfolio.invested_value() + notional;
        let projected_single = existing.unwrap_or(0.0) + notional;

        let mut breaches = Vec::new();
        if projected_cash / total * 100.0 < l.min_cash_pct {
            breaches.push(format!(
                "cash after order {:.1}% < min {:.1}%",
                projected_cash / total * 100.0,
                l.min_cash_pct
            ));
        }
        if projected_invested / total * 100.0 > l.total_max_pct {
            breaches.push(format!(
                "invested after order {:.1}% > max {:.1}%",
                projected_invested / total * 100.0,
                l.total_max_pct
            ));
        }
        if projected_single / total * 100.0 > l.single_max_pct {
            breaches.push(format!(
                "{} after order {:.1}% > single max {:.1}%",
                order.ticker,
                projected_single / total * 100.0,
                l.single_max_pct
            ));
        }

        if breaches.is_empty() {
            return Ok(GateResult::allow(Self::NAME, "order within concentration limits"));
        }

        let max_notional = [
            portfolio.cash - l.min_cash_pct / 100.0 * total,
            l.total_max_pct / 100.0 * total - portfolio.invested_value(),
            l.single_max_pct / 100.0 * total - existing.unwrap_or(0.0),
        ]
        .into_iter()
        .fold(f64::INFINITY, f64::min)
        .max(0.0);

        Ok(GateResult::new(Self::NAME, true, GateAction::Reduce, breaches.join("; "))
            .with_detail("max_notional", max_notional)
            .with_detail("scale", (max_notional / notional).clamp(0.0, 1.0)))
    }
}

#[async_trait::async_trait]
impl RiskGate for ConcentrationLimiter {
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
            "limits": self.limits,
            "last_violations": self.last_violations,
        })
    }
}
