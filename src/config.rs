use crate::errors::{EngineError, EngineResult};
use crate::risk::{GateAction, LossLevel};
use chrono::{NaiveDate, NaiveTime, Weekday};
use chrono_tz::Tz;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub exchange_tz: Tz,
    pub operator_tz: Tz,
    pub extra_holidays: Vec<NaiveDate>,
    pub risk: RiskConfig,
    pub emergency: EmergencyConfig,
    pub schedule: ScheduleConfig,
    pub data_dir: PathBuf,
    pub server_port: u16,
    pub market_data_url: Option<String>,
    pub market_data_api_key: String,
    pub broker_health_url: Option<String>,
    pub webhook_url: Option<String>,
    pub paper_capital: f64,
    pub watchlist: Vec<String>,
}

/// Thresholds for the gate pipeline, the budget and the stop tracker.
#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub loss_levels: Vec<LossLevel>,
    pub max_positions: usize,
    pub min_cash_pct: f64,
    pub total_max_pct: f64,
    pub single_max_pct: f64,
    pub streak_reduce: u32,
    pub streak_block: u32,
    pub streak_halt: u32,
    pub loss_days_block: u32,
    pub streak_lookback_trades: usize,
    pub var_confidence: f64,
    pub var_max_pct: f64,
    pub var_lookback_days: usize,
    pub initial_stop_pct: f64,
    pub trailing_stop_pct: f64,
    pub tightened_trailing_pct: f64,
    pub monthly_budget_pct: f64,
    pub initial_capital: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            loss_levels: vec![
                LossLevel { threshold_pct: -1.0, action: GateAction::Reduce },
                LossLevel { threshold_pct: -1.5, action: GateAction::Block },
                LossLevel { threshold_pct: -2.0, action: GateAction::Halt },
            ],
            max_positions: 3,
            min_cash_pct: 40.0,
            total_max_pct: 60.0,
            single_max_pct: 30.0,
            streak_reduce: 3,
            streak_block: 5,
            streak_halt: 7,
            loss_days_block: 3,
            streak_lookback_trades: 20,
            var_confidence: 0.95,
            var_max_pct: 3.0,
            var_lookback_days: 20,
            initial_stop_pct: -5.0,
            trailing_stop_pct: -3.0,
            tightened_trailing_pct: -0.5,
            monthly_budget_pct: -5.0,
            initial_capital: 10_000.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmergencyConfig {
    pub flash_crash_pct: f64,
    pub flash_window_minutes: i64,
    pub flash_cooldown_minutes: i64,
    pub vix_trigger: f64,
    pub vix_release: f64,
    pub spy_trigger_pct: f64,
    pub runaway_loss_pct: f64,
    pub backoff_delays_secs: Vec<u64>,
    pub backoff_cap_secs: u64,
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            flash_crash_pct: -5.0,
            flash_window_minutes: 5,
            flash_cooldown_minutes: 60,
            vix_trigger: 35.0,
            vix_release: 30.0,
            spy_trigger_pct: -3.0,
            runaway_loss_pct: -5.0,
            backoff_delays_secs: vec![5, 10, 20, 40, 60],
            backoff_cap_secs: 180,
        }
    }
}

/// Loop cadence. All minute values are wall-clock minutes.
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub cycle_minutes: i64,
    pub monitor_minutes: i64,
    pub analysis_interval_minutes: i64,
    pub max_poll_minutes: i64,
    pub extended_monitor_minutes: i64,
    pub retry_secs: u64,
    pub auto_stop: NaiveTime,
    pub weekly_day: Weekday,
    pub weekly_hour: u32,
    pub stop_timeout_secs: u64,
    /// Grace for background tasks and the audit writer at shutdown.
    pub task_grace_secs: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cycle_minutes: 15,
            monitor_minutes: 5,
            analysis_interval_minutes: 30,
            max_poll_minutes: 60,
            extended_monitor_minutes: 5,
            retry_secs: 60,
            auto_stop: NaiveTime::from_hms_opt(6, 30, 0).unwrap_or(NaiveTime::MIN),
            weekly_day: Weekday::Sat,
            weekly_hour: 6,
            stop_timeout_secs: 30,
            task_grace_secs: 5,
            shutdown_timeout_secs: 60,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            exchange_tz: chrono_tz::America::New_York,
            operator_tz: chrono_tz::Asia::Seoul,
            extra_holidays: Vec::new(),
            risk: RiskConfig::default(),
            emergency: EmergencyConfig::default(),
            schedule: ScheduleConfig::default(),
            data_dir: PathBuf::from("data"),
            server_port: 3001,
            market_data_url: None,
            market_data_api_key: String::new(),
            broker_health_url: None,
            webhook_url: None,
            paper_capital: 10_000.0,
            watchlist: vec!["SPY".into(), "QQQ".into()],
        }
    }
}

impl AppConfig {
    pub fn from_env() -> EngineResult<Self> {
        dotenvy::dotenv().ok();

        let rd = RiskConfig::default();
        let risk = RiskConfig {
            loss_levels: match std::env::var("LOSS_LEVELS") {
                Ok(raw) => parse_loss_levels(&raw)?,
                Err(_) => rd.loss_levels,
            },
            max_positions: parse_or("MAX_POSITIONS", rd.max_positions)?,
            min_cash_pct: parse_or("MIN_CASH_PCT", rd.min_cash_pct)?,
            total_max_pct: parse_or("TOTAL_MAX_PCT", rd.total_max_pct)?,
            single_max_pct: parse_or("SINGLE_MAX_PCT", rd.single_max_pct)?,
            streak_reduce: parse_or("STREAK_REDUCE", rd.streak_reduce)?,
            streak_block: parse_or("STREAK_BLOCK", rd.streak_block)?,
            streak_halt: parse_or("STREAK_HALT", rd.streak_halt)?,
            loss_days_block: parse_or("LOSS_DAYS_BLOCK", rd.loss_days_block)?,
            streak_lookback_trades: parse_or("STREAK_LOOKBACK_TRADES", rd.streak_lookback_trades)?,
            var_confidence: parse_or("VAR_CONFIDENCE", rd.var_confidence)?,
            var_max_pct: parse_or("VAR_MAX_PCT", rd.var_max_pct)?,
            var_lookback_days: parse_or("VAR_LOOKBACK_DAYS", rd.var_lookback_days)?,
            initial_stop_pct: parse_or("INITIAL_STOP_PCT", rd.initial_stop_pct)?,
            trailing_stop_pct: parse_or("TRAILING_STOP_PCT", rd.trailing_stop_pct)?,
            tightened_trailing_pct: parse_or("TIGHTENED_TRAILING_PCT", rd.tightened_trailing_pct)?,
            monthly_budget_pct: parse_or("MONTHLY_BUDGET_PCT", rd.monthly_budget_pct)?,
            initial_capital: parse_or("INITIAL_CAPITAL", rd.initial_capital)?,
        };
        if risk.monthly_budget_pct >= 0.0 {
            return Err(EngineError::Config("MONTHLY_BUDGET_PCT must be negative".into()));
        }
        if !(0.5..1.0).contains(&risk.var_confidence) {
            return Err(EngineError::Config("VAR_CONFIDENCE must be in [0.5, 1)".into()));
        }

        let ed = EmergencyConfig::default();
        let emergency = EmergencyConfig {
            flash_crash_pct: parse_or("FLASH_CRASH_PCT", ed.flash_crash_pct)?,
            flash_window_minutes: parse_or("FLASH_WINDOW_MINUTES", ed.flash_window_minutes)?,
            flash_cooldown_minutes: parse_or("FLASH_COOLDOWN_MINUTES", ed.flash_cooldown_minutes)?,
            vix_trigger: parse_or("VIX_TRIGGER", ed.vix_trigger)?,
            vix_release: parse_or("VIX_RELEASE", ed.vix_release)?,
            spy_trigger_pct: parse_or("SPY_TRIGGER_PCT", ed.spy_trigger_pct)?,
            runaway_loss_pct: parse_or("RUNAWAY_LOSS_PCT", ed.runaway_loss_pct)?,
            backoff_delays_secs: ed.backoff_delays_secs,
            backoff_cap_secs: parse_or("BACKOFF_CAP_SECS", ed.backoff_cap_secs)?,
        };
        if emergency.vix_release > emergency.vix_trigger {
            return Err(EngineError::Config("VIX_RELEASE must not exceed VIX_TRIGGER".into()));
        }

        let sd = ScheduleConfig::default();
        let schedule = ScheduleConfig {
            cycle_minutes: parse_or("CYCLE_MINUTES", sd.cycle_minutes)?,
            monitor_minutes: parse_or("MONITOR_MINUTES", sd.monitor_minutes)?,
            analysis_interval_minutes: parse_or("ANALYSIS_INTERVAL_MINUTES", sd.analysis_interval_minutes)?,
            max_poll_minutes: parse_or("MAX_POLL_MINUTES", sd.max_poll_minutes)?,
            extended_monitor_minutes: parse_or("EXTENDED_MONITOR_MINUTES", sd.extended_monitor_minutes)?,
            retry_secs: parse_or("RETRY_SECS", sd.retry_secs)?,
            auto_stop: match std::env::var("AUTO_STOP") {
                Ok(raw) => NaiveTime::parse_from_str(&raw, "%H:%M")
                    .map_err(|e| EngineError::Config(format!("AUTO_STOP: {e}")))?,
                Err(_) => sd.auto_stop,
            },
            weekly_day: parse_or("WEEKLY_DAY", sd.weekly_day)?,
            weekly_hour: parse_or("WEEKLY_HOUR", sd.weekly_hour)?,
            stop_timeout_secs: parse_or("STOP_TIMEOUT_SECS", sd.stop_timeout_secs)?,
            task_grace_secs: parse_or("TASK_GRACE_SECS", sd.task_grace_secs)?,
            shutdown_timeout_secs: parse_or("SHUTDOWN_TIMEOUT_SECS", sd.shutdown_timeout_secs)?,
        };
        if schedule.monitor_minutes <= 0 || schedule.cycle_minutes < schedule.monitor_minutes {
            return Err(EngineError::Config("MONITOR_MINUTES must be in (0, CYCLE_MINUTES]".into()));
        }

        let extra_holidays = env_var_or("EXTRA_HOLIDAYS", "")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .map_err(|e| EngineError::Config(format!("EXTRA_HOLIDAYS {s}: {e}")))
            })
            .collect::<EngineResult<Vec<_>>>()?;

        let watchlist = env_var_or("WATCHLIST", "SPY,QQQ")
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            exchange_tz: parse_or("EXCHANGE_TZ", chrono_tz::America::New_York)?,
            operator_tz: parse_or("OPERATOR_TZ", chrono_tz::Asia::Seoul)?,
            extra_holidays,
            risk,
            emergency,
            schedule,
            data_dir: PathBuf::from(env_var_or("DATA_DIR", "data")),
            server_port: parse_or("SERVER_PORT", 3001)?,
            market_data_url: optional_env("MARKET_DATA_URL"),
            market_data_api_key: env_var_or("MARKET_DATA_API_KEY", ""),
            broker_health_url: optional_env("BROKER_HEALTH_URL"),
            webhook_url: optional_env("ALERT_WEBHOOK_URL"),
            paper_capital: parse_or("PAPER_CAPITAL", 10_000.0)?,
            watchlist,
        })
    }
}

/// `-1.0:reduce,-1.5:block,-2.0:halt`
pub fn parse_loss_levels(raw: &str) -> EngineResult<Vec<LossLevel>> {
    let levels = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (pct, action) = entry
                .split_once(':')
                .ok_or_else(|| EngineError::Config(format!("LOSS_LEVELS entry {entry}: expected pct:action")))?;
            let threshold_pct = pct
                .trim()
                .parse::<f64>()
                .map_err(|e| EngineError::Config(format!("LOSS_LEVELS {pct}: {e}")))?;
            if threshold_pct >= 0.0 {
                return Err(EngineError::Config(format!("LOSS_LEVELS {pct}: threshold must be negative")));
            }
            let action = action
                .trim()
                .parse::<GateAction>()
                .map_err(|e| EngineError::Config(format!("LOSS_LEVELS: {e}")))?;
            Ok(LossLevel { threshold_pct, action })
        })
        .collect::<EngineResult<Vec<_>>>()?;

    if levels.is_empty() {
        return Err(EngineError::Config("LOSS_LEVELS is empty".into()));
    }
    Ok(levels)
}

fn parse_or<T>(key: &str, default: T) -> EngineResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| EngineError::Config(format!("{key}: {e}"))),
        Err(_) => Ok(default),
    }
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
