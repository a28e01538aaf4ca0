use super::{Order, OrderSide};
use crate::config::RiskConfig;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StopType {
    Initial,
    Trailing,
}

impl std::fmt::Display for StopType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initial => write!(f, "initial"),
            Self::Trailing => write!(f, "trailing"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct StopState {
    pub entry_price: f64,
    pub quantity: f64,
    pub high_price: f64,
    pub stop_price: f64,
    pub stop_type: StopType,
}

/// Terminal output of `check_stop`: sell everything.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct StopTrigger {
    pub ticker: String,
    pub trigger_price: f64,
    pub stop_price: f64,
    pub stop_type: StopType,
    pub quantity: f64,
    pub entry_price: f64,
}

impl StopTrigger {
    pub fn to_order(&self) -> Order {
        Order {
            ticker: self.ticker.clone(),
            side: OrderSide::Sell,
            quantity: self.quantity,
            limit_price: self.trigger_price,
            reason: format!("{}_stop", self.stop_type),
        }
    }
}

/// Per-ticker stop state machine: no_position -> initial -> trailing.
///
/// stop_price and high_price never decrease. A fired stop removes the entry.
pub struct TrailingStopTracker {
    initial_pct: f64,
    trailing_pct: f64,
    /// Circuit-breaker tightening; overrides `trailing_pct` while set.
    trailing_override: Option<f64>,
    stops: HashMap<String, StopState>,
}

impl TrailingStopTracker {
    pub fn new(cfg: &RiskConfig) -> Self {
        Self {
            initial_pct: cfg.initial_stop_pct,
            trailing_pct: cfg.trailing_stop_pct,
            trailing_override: None,
            stops: HashMap::new(),
        }
    }

    pub fn register(&mut self, ticker: &str, entry_price: f64, quantity: f64) -> StopState {
        let state = StopState {
            entry_price,
            quantity,
            high_price: entry_price,
            stop_price: entry_price * (1.0 + self.initial_pct / 100.0),
            stop_type: StopType::Initial,
        };
        tracing::info!(ticker = ticker, entry = entry_price, stop = state.stop_price, "stop registered");
        self.stops.insert(ticker.to_string(), state);
        state
    }

    /// Scale-in: quantity grows, stop and high are untouched.
    pub fn add_quantity(&mut self, ticker: &str, quantity: f64) -> Option<StopState> {
        let state = self.stops.get_mut(ticker)?;
        state.quantity += quantity;
        Some(*state)
    }

    /// Broker is the source of truth for size after partial sells.
    pub fn set_quantity(&mut self, ticker: &str, quantity: f64) {
        if let Some(state) = self.stops.get_mut(ticker) {
            state.quantity = quantity;
        }
    }

    /// Ratchet high and stop upward. Unknown tickers are ignored.
    pub fn update_price(&mut self, ticker: &str, price: f64) -> Option<StopState> {
        if !price.is_finite() || price <= 0.0 {
            return self.stops.get(ticker).copied();
        }
        let pct = self.trailing_override.unwrap_or(self.trailing_pct);
        let state = self.stops.get_mut(ticker)?;

        if price > state.high_price {
            state.high_price = price;
        }
        let candidate = price * (1.0 + pct / 100.0);
        if candidate > state.stop_price {
            state.stop_price = candidate;
            state.stop_type = StopType::Trailing;
        }
        Some(*state)
    }

    /// Fires when `price <= stop_price`; consumes the tracked state.
    /// Bad quotes never fire and leave the state in place.
    pub fn check_stop(&mut self, ticker: &str, price: f64) -> Option<StopTrigger> {
        let state = self.stops.get(ticker)?;
        if !price.is_finite() || price <= 0.0 {
            tracing::warn!(ticker = ticker, price = price, "stop check skipped: bad quote");
            return None;
        }
        if price > state.stop_price {
            return None;
        }
        let state = self.stops.remove(ticker)?;
        tracing::warn!(
            ticker = ticker,
            price = price,
            stop = state.stop_price,
            stop_type = %state.stop_type,
            "stop triggered"
        );
        Some(StopTrigger {
            ticker: ticker.to_string(),
            trigger_price: price,
            stop_price: state.stop_price,
            stop_type: state.stop_type,
            quantity: state.quantity,
            entry_price: state.entry_price,
        })
    }

    pub fn remove(&mut self, ticker: &str) -> Option<StopState> {
        self.stops.remove(ticker)
    }

    pub fn is_tracked(&self, ticker: &str) -> bool {
        self.stops.contains_key(ticker)
    }

    pub fn get(&self, ticker: &str) -> Option<&StopState> {
        self.stops.get(ticker)
    }

    /// Circuit breaker active -> trail at `pct` (e.g. -0.5); `None` restores
    /// the configured distance. Existing stops only tighten on the next update.
    pub fn set_trailing_override(&mut self, pct: Option<f64>) {
        self.trailing_override = pct;
    }

    pub fn tracked_tickers(&self) -> Vec<String> {
        self.stops.keys().cloned().collect()
    }

    pub fn snapshot(&self) -> HashMap<String, StopState> {
        self.stops.clone()
    }
}
