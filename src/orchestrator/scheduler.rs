use crate::config::ScheduleConfig;
use crate::market::{MarketSessionClock, SessionType};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Shutdown,
    Weekly,
    Prep,
    EndOfDay,
    ContinuousAnalysis,
    TradingCycle,
    RegularMonitor,
    OffHoursMonitor,
    Sleep,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Shutdown => "shutdown",
            Self::Weekly => "weekly",
            Self::Prep => "prep",
            Self::EndOfDay => "end_of_day",
            Self::ContinuousAnalysis => "continuous_analysis",
            Self::TradingCycle => "trading_cycle",
            Self::RegularMonitor => "regular_monitor",
            Self::OffHoursMonitor => "off_hours_monitor",
            Self::Sleep => "sleep",
        };
        f.write_str(s)
    }
}

/// Per-run bookkeeping the planner reads. The runner writes it after each
/// branch executes.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DayState {
    pub auto_stop_at: Option<DateTime<Utc>>,
    /// Exchange date of the last preparation.
    pub prepared_for: Option<NaiveDate>,
    pub eod_done_for: Option<NaiveDate>,
    /// ISO (year, week) of the last weekly review, operator-local.
    pub last_weekly: Option<(i32, u32)>,
    pub last_analysis_at: Option<DateTime<Utc>>,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

impl DayState {
    pub fn new(auto_stop_at: Option<DateTime<Utc>>) -> Self {
        Self { auto_stop_at, ..Default::default() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Plan {
    pub phase: Phase,
    /// When the loop should plan again after running `phase`.
    pub wake_at: DateTime<Utc>,
    /// Exchange date a prep or end-of-day branch applies to.
    pub trading_date: Option<NaiveDate>,
}

impl Plan {
    fn at(phase: Phase, wake_at: DateTime<Utc>) -> Self {
        Self { phase, wake_at, trading_date: None }
    }

    fn on(phase: Phase, now: DateTime<Utc>, date: NaiveDate) -> Self {
        Self { phase, wake_at: now, trading_date: Some(date) }
    }
}

pub fn iso_week_of(clock: &MarketSessionClock, ts: DateTime<Utc>) -> (i32, u32) {
    let w = ts.with_timezone(&clock.operator_tz()).iso_week();
    (w.year(), w.week())
}

/// Pure scheduling decision: exactly one branch per call, first match wins.
///
/// Order: auto-stop, weekly review, preparation, end of day, continuous
/// analysis, regular session, pre/after-market monitoring, closed sleep.
pub fn plan(now: DateTime<Utc>, day: &DayState, clock: &MarketSessionClock, cfg: &ScheduleConfig) -> Plan {
    let mins = Duration::minutes;
    let cap = |t: DateTime<Utc>| -> DateTime<Utc> {
        let t = t.max(now + Duration::seconds(1));
        match day.auto_stop_at {
            Some(stop) if stop < t => stop.max(now),
            _ => t,
        }
    };

    if day.auto_stop_at.is_some_and(|stop| now >= stop) {
        return Plan::at(Phase::Shutdown, now);
    }

    let local = now.with_timezone(&clock.operator_tz());
    if local.weekday() == cfg.weekly_day
        && local.hour() >= cfg.weekly_hour
        && day.last_weekly != Some(iso_week_of(clock, now))
    {
        return Plan::at(Phase::Weekly, now);
    }

    let window = clock.current_window(now);
    if let Some((start, _)) = window {
        let date = clock.exchange_date(start);
        if day.prepared_for != Some(date) {
            return Plan::on(Phase::Prep, now, date);
        }
    }

    let session = clock.session_type(now);
    let ex_date = clock.exchange_date(now);
    let after_close = clock.regular_close(ex_date).is_some_and(|close| now >= close);
    if session != SessionType::Regular
        && clock.is_trading_day(ex_date)
        && after_close
        && day.eod_done_for != Some(ex_date)
    {
        return Plan::on(Phase::EndOfDay, now, ex_date);
    }

    if window.is_some() && session != SessionType::Regular {
        let due = day
            .last_analysis_at
            .map_or(true, |t| now >= t + mins(cfg.analysis_interval_minutes));
        if due {
            return Plan::at(Phase::ContinuousAnalysis, now);
        }
    }

    match session {
        SessionType::Regular if window.is_some() => match day.last_cycle_at {
            Some(t) if now < t + mins(cfg.cycle_minutes) => {
                let next_cycle = t + mins(cfg.cycle_minutes);
                Plan::at(Phase::RegularMonitor, cap((now + mins(cfg.monitor_minutes)).min(next_cycle)))
            }
            _ => Plan::at(Phase::TradingCycle, cap(now + mins(cfg.monitor_minutes))),
        },
        SessionType::Regular | SessionType::PreMarket | SessionType::AfterMarket => {
            Plan::at(Phase::OffHoursMonitor, cap(now + mins(cfg.extended_monitor_minutes)))
        }
        SessionType::Closed => {
            let mut wake = now + mins(cfg.max_poll_minutes);
            if let Some(next) = clock.next_operating_window_start(now).filter(|t| *t > now) {
                wake = wake.min(next);
            }
            if window.is_some() {
                if let Some(t) = day.last_analysis_at {
                    wake = wake.min(t + mins(cfg.analysis_interval_minutes));
                }
            }
            Plan::at(Phase::Sleep, cap(wake))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::HolidayCalendar;
    use chrono::TimeZone;

    fn clock() -> MarketSessionClock {
        MarketSessionClock::new(chrono_tz::America::New_York, chrono_tz::Asia::Seoul, HolidayCalendar::nyse())
    }

    fn kst(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        chrono_tz::Asia::Seoul
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn prepared(d: NaiveDate) -> DayState {
        DayState { prepared_for: Some(d), last_weekly: Some((2026, 24)), ..Default::default() }
    }

    #[test]
    fn test_auto_stop_wins() {
        let now = kst(2026, 6, 11, 6, 30);
        let day = DayState::new(Some(now));
        let p = plan(now, &day, &clock(), &ScheduleConfig::default());
        assert_eq!(p.phase, Phase::Shutdown);
    }

    #[test]
    fn test_weekly_once_per_week() {
        let c = clock();
        let cfg = ScheduleConfig::default();
        let now = kst(2026, 6, 13, 10, 0);
        let mut day = DayState { eod_done_for: Some(date(2026, 6, 12)), ..Default::default() };
        assert_eq!(plan(now, &day, &c, &cfg).phase, Phase::Weekly);

        day.last_weekly = Some(iso_week_of(&c, now));
        let p = plan(now, &day, &c, &cfg);
        assert_eq!(p.phase, Phase::Sleep);
        assert_eq!(p.wake_at, now + Duration::minutes(60));

        // before the configured hour
        let early = kst(2026, 6, 13, 5, 0);
        let fresh = DayState { eod_done_for: Some(date(2026, 6, 12)), ..Default::default() };
        assert_ne!(plan(early, &fresh, &c, &cfg).phase, Phase::Weekly);
    }

    #[test]
    fn test_prep_at_window_start() {
        let c = clock();
        let cfg = ScheduleConfig::default();
        let now = kst(2026, 6, 10, 22, 0);
        let day = DayState { last_weekly: Some((2026, 24)), ..Default::default() };
        let p = plan(now, &day, &c, &cfg);
        assert_eq!(p.phase, Phase::Prep);
        assert_eq!(p.trading_date, Some(date(2026, 6, 10)));

        // prepared, pre-market inside the window: analysis first, then monitoring
        let day = prepared(date(2026, 6, 10));
        assert_eq!(plan(now, &day, &c, &cfg).phase, Phase::ContinuousAnalysis);

        let day = DayState { last_analysis_at: Some(now), ..prepared(date(2026, 6, 10)) };
        let p = plan(now, &day, &c, &cfg);
        assert_eq!(p.phase, Phase::OffHoursMonitor);
        assert_eq!(p.wake_at, now + Duration::minutes(5));
    }

    #[test]
    fn test_regular_cycle_and_subticks() {
        let c = clock();
        let cfg = ScheduleConfig::default();
        let now = kst(2026, 6, 10, 23, 0);
        let day = prepared(date(2026, 6, 10));
        let p = plan(now, &day, &c, &cfg);
        assert_eq!(p.phase, Phase::TradingCycle);
        assert_eq!(p.wake_at, now + Duration::minutes(5));

        let day = DayState { last_cycle_at: Some(now - Duration::minutes(5)), ..prepared(date(2026, 6, 10)) };
        let p = plan(now, &day, &c, &cfg);
        assert_eq!(p.phase, Phase::RegularMonitor);
        assert_eq!(p.wake_at, now + Duration::minutes(5));

        let day = DayState { last_cycle_at: Some(now - Duration::minutes(12)), ..prepared(date(2026, 6, 10)) };
        let p = plan(now, &day, &c, &cfg);
        assert_eq!(p.phase, Phase::RegularMonitor);
        assert_eq!(p.wake_at, now + Duration::minutes(3));

        let day = DayState { last_cycle_at: Some(now - Duration::minutes(15)), ..prepared(date(2026, 6, 10)) };
        assert_eq!(plan(now, &day, &c, &cfg).phase, Phase::TradingCycle);
    }

    #[test]
    fn test_end_of_day_after_close() {
        let c = clock();
        let cfg = ScheduleConfig::default();
        // 16:30 EDT
        let now = kst(2026, 6, 11, 5, 30);
        let day = prepared(date(2026, 6, 10));
        let p = plan(now, &day, &c, &cfg);
        assert_eq!(p.phase, Phase::EndOfDay);
        assert_eq!(p.trading_date, Some(date(2026, 6, 10)));

        let day = DayState {
            eod_done_for: Some(date(2026, 6, 10)),
            last_analysis_at: Some(now),
            ..prepared(date(2026, 6, 10))
        };
        assert_eq!(plan(now, &day, &c, &cfg).phase, Phase::OffHoursMonitor);
    }

    #[test]
    fn test_closed_sleeps_until_window() {
        let c = clock();
        let cfg = ScheduleConfig { max_poll_minutes: 600, ..Default::default() };
        // 03:30 EDT
        let now = kst(2026, 6, 11, 16, 30);
        let day = DayState { eod_done_for: Some(date(2026, 6, 10)), ..prepared(date(2026, 6, 10)) };
        let p = plan(now, &day, &c, &cfg);
        assert_eq!(p.phase, Phase::Sleep);
        assert_eq!(p.wake_at, kst(2026, 6, 11, 22, 0));

        let capped = DayState { auto_stop_at: Some(now + Duration::minutes(20)), ..day };
        assert_eq!(plan(now, &capped, &c, &cfg).wake_at, now + Duration::minutes(20));
    }
}
