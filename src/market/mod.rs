pub mod calendar;
pub mod clock;

pub use calendar::HolidayCalendar;
pub use clock::MarketSessionClock;

use chrono::{DateTime, Utc};

/// Exchange session, in exchange-local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    PreMarket,
    Regular,
    AfterMarket,
    Closed,
}

impl std::fmt::Display for SessionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PreMarket => write!(f, "pre_market"),
            Self::Regular => write!(f, "regular"),
            Self::AfterMarket => write!(f, "after_market"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Read-only view of the operator's trading window at one instant.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct OperatingWindow {
    pub is_active: bool,
    /// Whether the current exchange-local date is a trading day.
    pub is_trading_day: bool,
    /// The active window, or the next one when inactive.
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
    pub next_window_start: Option<DateTime<Utc>>,
    pub is_dst: bool,
    pub session: SessionType,
}
