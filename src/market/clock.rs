use super::{HolidayCalendar, OperatingWindow, SessionType};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::{OffsetComponents, Tz};

// ── Exchange session boundaries (exchange-local) ──

const PRE_MARKET_OPEN: (u32, u32) = (4, 0);
const REGULAR_OPEN: (u32, u32) = (9, 30);
const REGULAR_CLOSE: (u32, u32) = (16, 0);
const AFTER_MARKET_CLOSE: (u32, u32) = (20, 0);

// ── Operating window (operator-local) ──

const WINDOW_START_DST: (u32, u32) = (22, 0);
const WINDOW_START_STD: (u32, u32) = (23, 0);
const WINDOW_END: (u32, u32) = (7, 0);

/// Forward scan bound for the next valid window.
const WINDOW_SCAN_DAYS: i64 = 8;

fn hm(t: (u32, u32)) -> NaiveTime {
    NaiveTime::from_hms_opt(t.0, t.1, 0).unwrap_or(NaiveTime::MIN)
}

/// Pure time arithmetic over two IANA zones and a holiday set.
#[derive(Debug, Clone)]
pub struct MarketSessionClock {
    exchange_tz: Tz,
    operator_tz: Tz,
    calendar: HolidayCalendar,
}

impl MarketSessionClock {
    pub fn new(exchange_tz: Tz, operator_tz: Tz, calendar: HolidayCalendar) -> Self {
        Self { exchange_tz, operator_tz, calendar }
    }

    pub fn operator_tz(&self) -> Tz {
        self.operator_tz
    }

    pub fn calendar(&self) -> &HolidayCalendar {
        &self.calendar
    }

    pub fn exchange_date(&self, ts: DateTime<Utc>) -> NaiveDate {
        ts.with_timezone(&self.exchange_tz).date_naive()
    }

    pub fn operator_date(&self, ts: DateTime<Utc>) -> NaiveDate {
        ts.with_timezone(&self.operator_tz).date_naive()
    }

    fn at_operator(&self, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
        self.operator_tz
            .from_local_datetime(&date.and_time(time))
            .earliest()
            .map(|t| t.with_timezone(&Utc))
    }

    fn at_exchange(&self, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
        self.exchange_tz
            .from_local_datetime(&date.and_time(time))
            .earliest()
            .map(|t| t.with_timezone(&Utc))
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        self.calendar.is_trading_day(date)
    }

    pub fn is_dst(&self, ts: DateTime<Utc>) -> bool {
        let offset = self.exchange_tz.offset_from_utc_datetime(&ts.naive_utc());
        offset.dst_offset() != Duration::zero()
    }

    pub fn session_type(&self, ts: DateTime<Utc>) -> SessionType {
        let local = ts.with_timezone(&self.exchange_tz);
        if !self.is_trading_day(local.date_naive()) {
            return SessionType::Closed;
        }
        let t = local.time();
        if t >= hm(PRE_MARKET_OPEN) && t < hm(REGULAR_OPEN) {
            SessionType::PreMarket
        } else if t >= hm(REGULAR_OPEN) && t < hm(REGULAR_CLOSE) {
            SessionType::Regular
        } else if t >= hm(REGULAR_CLOSE) && t < hm(AFTER_MARKET_CLOSE) {
            SessionType::AfterMarket
        } else {
            SessionType::Closed
        }
    }

    /// Regular-session close on an exchange date.
    pub fn regular_close(&self, date: NaiveDate) -> Option<DateTime<Utc>> {
        self.at_exchange(date, hm(REGULAR_CLOSE))
    }

    /// The window opening on operator date `date`, as `(start, end)`.
    /// `None` when its start falls on a non-trading exchange date.
    pub fn window_for(&self, date: NaiveDate) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let sample = self.at_operator(date, hm(WINDOW_START_DST))?;
        let start_time = if self.is_dst(sample) { WINDOW_START_DST } else { WINDOW_START_STD };
        let start = self.at_operator(date, hm(start_time))?;
        let end = self.at_operator(date.succ_opt()?, hm(WINDOW_END))?;
        if !self.is_trading_day(self.exchange_date(start)) {
            return None;
        }
        Some((start, end))
    }

    pub fn current_window(&self, now: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let today = self.operator_date(now);
        [today.pred_opt(), Some(today)]
            .into_iter()
            .flatten()
            .filter_map(|d| self.window_for(d))
            .find(|(start, end)| *start <= now && now < *end)
    }

    pub fn is_in_window(&self, now: DateTime<Utc>) -> bool {
        self.current_window(now).is_some()
    }

    fn next_window(&self, now: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let today = self.operator_date(now);
        (0..WINDOW_SCAN_DAYS)
            .filter_map(|i| today.checked_add_signed(Duration::days(i)))
            .filter_map(|d| self.window_for(d))
            .find(|(start, _)| *start > now)
    }

    /// Inside a window: that window's start. Otherwise the next valid start.
    pub fn next_operating_window_start(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.current_window(now)
            .or_else(|| self.next_window(now))
            .map(|(start, _)| start)
    }

    pub fn get_operating_window_info(&self, now: DateTime<Utc>) -> OperatingWindow {
        let current = self.current_window(now);
        let next = self.next_window(now);
        let shown = current.or(next);
        OperatingWindow {
            is_active: current.is_some(),
            is_trading_day: self.is_trading_day(self.exchange_date(now)),
            window_start: shown.map(|w| w.0),
            window_end: shown.map(|w| w.1),
            next_window_start: current.map(|w| w.0).or(next.map(|w| w.0)),
            is_dst: self.is_dst(now),
            session: self.session_type(now),
        }
    }

    /// First operator-local `at` strictly after `started`.
    pub fn auto_stop_after(&self, started: DateTime<Utc>, at: NaiveTime) -> Option<DateTime<Utc>> {
        let date = self.operator_date(started);
        let same_day = self.at_operator(date, at)?;
        if same_day > started {
            return Some(same_day);
        }
        self.at_operator(date.succ_opt()?, at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock() -> MarketSessionClock {
        MarketSessionClock::new(chrono_tz::America::New_York, chrono_tz::Asia::Seoul, HolidayCalendar::nyse())
    }

    fn kst(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        chrono_tz::Asia::Seoul
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_window_follows_exchange_dst() {
        let c = clock();
        // EDT: window opens 22:00 KST
        assert!(c.is_in_window(kst(2026, 6, 10, 22, 15)));
        // EST: window opens 23:00 KST
        assert!(!c.is_in_window(kst(2026, 1, 14, 22, 15)));
        assert!(c.is_in_window(kst(2026, 1, 14, 23, 5)));
    }

    #[test]
    fn test_window_spans_midnight() {
        let c = clock();
        assert!(c.is_in_window(kst(2026, 6, 11, 3, 0)));
        assert!(c.is_in_window(kst(2026, 6, 11, 6, 59)));
        assert!(!c.is_in_window(kst(2026, 6, 11, 7, 0)));
    }

    #[test]
    fn test_window_invalid_on_non_trading_dates() {
        let c = clock();
        // Saturday exchange date
        assert!(c.window_for(NaiveDate::from_ymd_opt(2026, 6, 13).unwrap()).is_none());
        // Thanksgiving
        assert!(c.window_for(NaiveDate::from_ymd_opt(2026, 11, 26).unwrap()).is_none());
        assert!(!c.is_in_window(kst(2026, 11, 26, 23, 30)));
    }

    #[test]
    fn test_next_window_start() {
        let c = clock();
        let now = kst(2026, 1, 14, 22, 15);
        assert_eq!(c.next_operating_window_start(now), Some(kst(2026, 1, 14, 23, 0)));

        let inside = kst(2026, 6, 11, 2, 0);
        assert_eq!(c.next_operating_window_start(inside), Some(kst(2026, 6, 10, 22, 0)));

        // Saturday morning -> Monday evening
        let sat = kst(2026, 6, 13, 10, 0);
        assert_eq!(c.next_operating_window_start(sat), Some(kst(2026, 6, 15, 22, 0)));
    }

    #[test]
    fn test_session_types() {
        let c = clock();
        assert_eq!(c.session_type(utc(2026, 6, 10, 13, 15)), SessionType::PreMarket);
        assert_eq!(c.session_type(utc(2026, 6, 10, 14, 0)), SessionType::Regular);
        assert_eq!(c.session_type(utc(2026, 6, 10, 20, 30)), SessionType::AfterMarket);
        assert_eq!(c.session_type(utc(2026, 6, 11, 1, 0)), SessionType::Closed);
        assert_eq!(c.session_type(utc(2026, 6, 13, 15, 0)), SessionType::Closed);
    }

    #[test]
    fn test_is_dst() {
        let c = clock();
        assert!(c.is_dst(utc(2026, 3, 10, 12, 0)));
        assert!(!c.is_dst(utc(2026, 1, 14, 12, 0)));
        assert!(!c.is_dst(utc(2026, 11, 2, 12, 0)));
    }

    #[test]
    fn test_window_info() {
        let c = clock();
        let info = c.get_operating_window_info(kst(2026, 6, 10, 23, 0));
        assert!(info.is_active);
        assert!(info.is_dst);
        assert_eq!(info.window_start, Some(kst(2026, 6, 10, 22, 0)));
        assert_eq!(info.window_end, Some(kst(2026, 6, 11, 7, 0)));
        assert_eq!(info.session, SessionType::Regular);

        let off = c.get_operating_window_info(kst(2026, 6, 11, 12, 0));
        assert!(!off.is_active);
        assert_eq!(off.next_window_start, Some(kst(2026, 6, 11, 22, 0)));
    }

    #[test]
    fn test_auto_stop_after() {
        let c = clock();
        let at = NaiveTime::from_hms_opt(6, 30, 0).unwrap();
        assert_eq!(c.auto_stop_after(kst(2026, 6, 10, 22, 0), at), Some(kst(2026, 6, 11, 6, 30)));
        assert_eq!(c.auto_stop_after(kst(2026, 6, 11, 5, 0), at), Some(kst(2026, 6, 11, 6, 30)));
        assert_eq!(c.auto_stop_after(kst(2026, 6, 11, 6, 30), at), Some(kst(2026, 6, 12, 6, 30)));
    }
}
