//! Collaborator seams. Everything behind these traits (broker, quote service,
//! decision layer, alert delivery, persistence) lives outside the control
//! plane; the loop only ever talks to them through these signatures.
use crate::emergency::{EmergencyEvent, EmergencyKind};
use crate::errors::EngineResult;
use crate::risk::{Order, OrderSide, Portfolio};
use chrono::{DateTime, NaiveDate, Utc};

// ── Value types crossing the seams ──

#[derive(Debug, Clone, serde::Serialize)]
pub struct ClosedTrade {
    pub ticker: String,
    pub pnl: f64,
    pub closed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct DailyPnl {
    pub date: NaiveDate,
    pub pnl: f64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Fill {
    pub order_id: String,
    pub ticker: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub price: f64,
    /// Realized PnL for sells, `None` for buys.
    pub realized_pnl: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct MarketIndicators {
    pub vix: Option<f64>,
    pub spy_change_pct: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub title: String,
    pub body: String,
}

impl Alert {
    pub fn new(level: AlertLevel, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            level,
            title: title.into(),
            body: body.into(),
        }
    }
}

// ── Consumed interfaces ──

/// Must be read-consistent within one call.
#[async_trait::async_trait]
pub trait PortfolioProvider: Send + Sync {
    async fn get_portfolio_summary(&self) -> EngineResult<Portfolio>;
}

#[async_trait::async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Daily closes, oldest first.
    async fn get_price_history(&self, ticker: &str, days: usize) -> EngineResult<Vec<f64>>;

    async fn get_last_price(&self, ticker: &str) -> EngineResult<f64>;

    /// Percent change over the trailing `minutes`.
    async fn get_recent_change_pct(&self, ticker: &str, minutes: i64) -> EngineResult<f64>;

    async fn get_market_indicators(&self) -> EngineResult<MarketIndicators>;
}

#[async_trait::async_trait]
pub trait OrderExecutor: Send + Sync {
    async fn submit(&self, order: &Order) -> EngineResult<Fill>;

    /// Returns the number of orders cancelled.
    async fn cancel_all_pending(&self) -> EngineResult<usize>;

    /// Drop any cached broker state and re-read orders/positions.
    async fn resync(&self) -> EngineResult<()>;
}

/// Read side of the trade ledger.
#[async_trait::async_trait]
pub trait TradeHistory: Send + Sync {
    /// Newest first.
    async fn recent_closed_trades(&self, limit: usize) -> EngineResult<Vec<ClosedTrade>>;

    /// Completed trading days, newest first.
    async fn recent_daily_pnl(&self, days: usize) -> EngineResult<Vec<DailyPnl>>;

    /// Realized PnL of each trade closed within `[start, end]` (inclusive dates).
    async fn realized_pnl_between(&self, start: NaiveDate, end: NaiveDate) -> EngineResult<Vec<f64>>;
}

/// Append-only emergency event log.
#[async_trait::async_trait]
pub trait EventStore: Send + Sync {
    async fn append_event(&self, event: &EmergencyEvent) -> EngineResult<i64>;

    /// Stamp `resolved_at` on every open event of `kind`; returns rows touched.
    async fn resolve_events(&self, kind: EmergencyKind, resolved_at: DateTime<Utc>) -> EngineResult<usize>;

    async fn unresolved_events(&self) -> EngineResult<Vec<EmergencyEvent>>;
}

/// Fire-and-forget delivery. Callers bound and swallow failures.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: &Alert) -> EngineResult<()>;
}

/// Real connectivity check for the network-failure handler.
#[async_trait::async_trait]
pub trait ConnectivityCheck: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// The external decision layer (news, LLM, RAG). Default hooks do nothing.
#[async_trait::async_trait]
pub trait Strategy: Send + Sync {
    async fn prepare_day(&self, _today: NaiveDate) -> EngineResult<()> {
        Ok(())
    }

    async fn propose_orders(&self, portfolio: &Portfolio) -> EngineResult<Vec<Order>>;

    async fn continuous_analysis(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn end_of_day(&self, _portfolio: &Portfolio) -> EngineResult<()> {
        Ok(())
    }

    async fn weekly_review(&self) -> EngineResult<()> {
        Ok(())
    }

    /// Research pass run by the background analysis task, off the loop and
    /// without its lock. Must not place orders.
    async fn background_analysis(&self) -> EngineResult<()> {
        Ok(())
    }
}

/// Delivers an alert with a hard time bound. Never fails the caller.
pub async fn deliver(notifier: &dyn Notifier, alert: Alert) {
    let fut = notifier.notify(&alert);
    match tokio::time::timeout(std::time::Duration::from_secs(5), fut).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, title = %alert.title, "alert delivery failed"),
        Err(_) => tracing::warn!(title = %alert.title, "alert delivery timed out"),
    }
}
