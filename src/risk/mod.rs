pub mod budget;
pub mod concentration;
pub mod daily_loss;
pub mod pipeline;
pub mod streak;
pub mod trailing_stop;
pub mod var;

pub use daily_loss::LossLevel;

use crate::errors::GateError;
use std::collections::HashMap;

// ── Gate actions (total order: allow < reduce < block < halt) ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GateAction {
    Allow,
    Reduce,
    Block,
    Halt,
}

impl std::fmt::Display for GateAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Reduce => write!(f, "reduce"),
            Self::Block => write!(f, "block"),
            Self::Halt => write!(f, "halt"),
        }
    }
}

impl std::str::FromStr for GateAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" => Ok(Self::Allow),
            "reduce" => Ok(Self::Reduce),
            "block" => Ok(Self::Block),
            "halt" => Ok(Self::Halt),
            other => Err(format!("unknown gate action: {other}")),
        }
    }
}

/// What the pipeline substitutes when a gate cannot finish its check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Advisory gate: an error yields `allow`.
    FailOpen,
    /// Capital-preservation gate: an error yields `block`.
    FailClosed,
}

// ── Gate output ──

pub type Details = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, serde::Serialize)]
pub struct GateResult {
    pub passed: bool,
    pub action: GateAction,
    pub message: String,
    pub gate_name: String,
    pub details: Details,
}

impl GateResult {
    pub fn allow(gate_name: &str, message: impl Into<String>) -> Self {
        Self {
            passed: true,
            action: GateAction::Allow,
            message: message.into(),
            gate_name: gate_name.to_string(),
            details: Details::new(),
        }
    }

    pub fn new(gate_name: &str, passed: bool, action: GateAction, message: impl Into<String>) -> Self {
        Self {
            passed,
            action,
            message: message.into(),
            gate_name: gate_name.to_string(),
            details: Details::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    /// Synthetic result for a gate that returned an error.
    pub fn from_error(gate_name: &str, policy: ErrorPolicy, err: &GateError) -> Self {
        match policy {
            ErrorPolicy::FailOpen => Self::allow(gate_name, format!("check skipped (fail-open): {err}"))
                .with_detail("error", err.to_string()),
            ErrorPolicy::FailClosed => Self::new(
                gate_name,
                false,
                GateAction::Block,
                format!("check failed (fail-closed): {err}"),
            )
            .with_detail("error", err.to_string()),
        }
    }
}

// ── Portfolio / order value objects ──

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Position {
    pub ticker: String,
    pub quantity: f64,
    pub market_value: f64,
    pub entry_price: f64,
}

impl Position {
    #[inline]
    pub fn last_price(&self) -> f64 {
        if self.quantity.abs() < 1e-12 {
            self.entry_price
        } else {
            self.market_value / self.quantity
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Portfolio {
    pub total_value: f64,
    pub cash: f64,
    pub today_pnl: f64,
    pub positions: Vec<Position>,
}

impl Portfolio {
    /// Validated once at the pipeline boundary so gates can trust the numbers.
    pub fn validate(&self) -> Result<(), GateError> {
        if !self.total_value.is_finite() || self.total_value <= 0.0 {
            return Err(GateError::InvalidInput(format!("total_value must be positive, got {}", self.total_value)));
        }
        if !self.cash.is_finite() || !self.today_pnl.is_finite() {
            return Err(GateError::InvalidInput("cash / today_pnl not finite".into()));
        }
        for p in &self.positions {
            if p.ticker.is_empty() {
                return Err(GateError::InvalidInput("position with empty ticker".into()));
            }
            if !p.market_value.is_finite() || !p.quantity.is_finite() || !p.entry_price.is_finite() {
                return Err(GateError::InvalidInput(format!("{}: non-finite position values", p.ticker)));
            }
        }
        Ok(())
    }

    #[inline]
    pub fn daily_pnl_pct(&self) -> f64 {
        if self.total_value <= 0.0 {
            return 0.0;
        }
        self.today_pnl / self.total_value * 100.0
    }

    pub fn position(&self, ticker: &str) -> Option<&Position> {
        self.positions.iter().find(|p| p.ticker == ticker)
    }

    pub fn invested_value(&self) -> f64 {
        self.positions.iter().map(|p| p.market_value).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Order {
    pub ticker: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub limit_price: f64,
    /// Free-form origin tag (strategy name, "trailing_stop", "runaway_loss", ...)
    pub reason: String,
}

impl Order {
    #[inline]
    pub fn notional(&self) -> f64 {
        self.quantity * self.limit_price
    }

    pub fn sell_all(position: &Position, reason: &str) -> Self {
        Self {
            ticker: position.ticker.clone(),
            side: OrderSide::Sell,
            quantity: position.quantity,
            limit_price: position.last_price(),
            reason: reason.to_string(),
        }
    }
}

/// Daily close series per ticker, oldest first. Prefetched by the caller so
/// the VaR gate never does IO.
#[derive(Debug, Clone, Default)]
pub struct MarketData {
    pub price_history: HashMap<String, Vec<f64>>,
}

// ── Gate seam ──

/// One independent risk check. Gates never see each other's state; the only
/// mutable state a gate owns is its diagnostic cache for `status()`.
#[async_trait::async_trait]
pub trait RiskGate: Send {
    fn name(&self) -> &'static str;

    fn error_policy(&self) -> ErrorPolicy;

    /// VaR-style gates need price history and are skipped without it.
    fn requires_market_data(&self) -> bool {
        false
    }

    async fn check(
        &mut self,
        portfolio: &Portfolio,
        market_data: Option<&MarketData>,
    ) -> Result<GateResult, GateError>;

    fn status(&self) -> serde_json::Value;
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn position(ticker: &str, quantity: f64, price: f64) -> Position {
        Position {
            ticker: ticker.to_string(),
            quantity,
            market_value: quantity * price,
            entry_price: price,
        }
    }

    pub fn portfolio(total_value: f64, cash: f64, today_pnl: f64, positions: Vec<Position>) -> Portfolio {
        Portfolio { total_value, cash, today_pnl, positions }
    }

    pub fn buy(ticker: &str, quantity: f64, price: f64) -> Order {
        Order {
            ticker: ticker.to_string(),
            side: OrderSide::Buy,
            quantity,
            limit_price: price,
            reason: "test".into(),
        }
    }
}
