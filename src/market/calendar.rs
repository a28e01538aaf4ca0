use chrono::{Datelike, NaiveDate, Weekday};
use std::collections::HashMap;

/// Full-day NYSE closures, keyed by year. Early closes still trade and are
/// not listed.
fn nyse_closures(year: i32) -> &'static [(u32, u32, &'static str)] {
    match year {
        2025 => &[
            (1, 1, "New Year's Day"),
            (1, 9, "National Day of Mourning"),
            (1, 20, "Martin Luther King Jr. Day"),
            (2, 17, "Washington's Birthday"),
            (4, 18, "Good Friday"),
            (5, 26, "Memorial Day"),
            (6, 19, "Juneteenth"),
            (7, 4, "Independence Day"),
            (9, 1, "Labor Day"),
            (11, 27, "Thanksgiving Day"),
            (12, 25, "Christmas Day"),
        ],
        2026 => &[
            (1, 1, "New Year's Day"),
            (1, 19, "Martin Luther King Jr. Day"),
            (2, 16, "Washington's Birthday"),
            (4, 3, "Good Friday"),
            (5, 25, "Memorial Day"),
            (6, 19, "Juneteenth"),
            (7, 3, "Independence Day (observed)"),
            (9, 7, "Labor Day"),
            (11, 26, "Thanksgiving Day"),
            (12, 25, "Christmas Day"),
        ],
        2027 => &[
            (1, 1, "New Year's Day"),
            (1, 18, "Martin Luther King Jr. Day"),
            (2, 15, "Washington's Birthday"),
            (3, 26, "Good Friday"),
            (5, 31, "Memorial Day"),
            (6, 18, "Juneteenth (observed)"),
            (7, 5, "Independence Day (observed)"),
            (9, 6, "Labor Day"),
            (11, 25, "Thanksgiving Day"),
            (12, 24, "Christmas Day (observed)"),
        ],
        _ => &[],
    }
}

/// Exchange holiday set: built-in NYSE closures plus operator-supplied dates.
#[derive(Debug, Clone, Default)]
pub struct HolidayCalendar {
    holidays: HashMap<NaiveDate, String>,
}

impl HolidayCalendar {
    pub fn nyse() -> Self {
        let mut cal = Self::default();
        for year in 2025..=2027 {
            for &(month, day, name) in nyse_closures(year) {
                if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
                    cal.holidays.insert(date, name.to_string());
                }
            }
        }
        cal
    }

    pub fn with_extra(mut self, dates: &[NaiveDate]) -> Self {
        for d in dates {
            self.holidays.entry(*d).or_insert_with(|| "custom closure".to_string());
        }
        self
    }

    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        self.holidays.contains_key(&date)
    }

    pub fn holiday_name(&self, date: NaiveDate) -> Option<&str> {
        self.holidays.get(&date).map(|s| s.as_str())
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.is_holiday(date)
    }
}
