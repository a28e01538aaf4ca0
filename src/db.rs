use crate::emergency::{EmergencyEvent, EmergencyKind};
use crate::errors::{EngineError, EngineResult};
use crate::interfaces::{ClosedTrade, DailyPnl, EventStore, TradeHistory};
use crate::state::DbCommand;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub type DbPool = Arc<Mutex<Connection>>;

const SCHEMA: &str = include_str!("../migrations/001_init.sql");

pub fn init_db(data_dir: &Path) -> EngineResult<DbPool> {
    std::fs::create_dir_all(data_dir).map_err(|e| EngineError::Database(format!("create dir: {e}")))?;
    let db_path = data_dir.join("riskdeck.db");
    let conn = Connection::open(&db_path)?;

    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA cache_size=-16000;")?;
    conn.execute_batch(SCHEMA)?;

    tracing::info!("database initialized at {}", db_path.display());
    Ok(Arc::new(Mutex::new(conn)))
}

pub fn open_in_memory() -> EngineResult<DbPool> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(SCHEMA)?;
    Ok(Arc::new(Mutex::new(conn)))
}

pub fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(raw: &str) -> EngineResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| EngineError::Parse(format!("timestamp {raw}: {e}")))
}

fn lock(db: &DbPool) -> EngineResult<std::sync::MutexGuard<'_, Connection>> {
    db.lock().map_err(|e| EngineError::Database(format!("lock poisoned: {e}")))
}

/// Dedicated audit writer. Reads commands from the bounded channel.
/// Emergency events and closed trades bypass this task: they must be durable
/// before the caller moves on. On cancellation the channel is closed and
/// whatever is already queued is still written.
pub async fn run_db_writer(db: DbPool, mut rx: mpsc::Receiver<DbCommand>, cancel: CancellationToken) {
    tracing::info!("db writer task started");

    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(cmd) => write_logged(&db, cmd),
                None => break,
            },
            _ = cancel.cancelled() => {
                rx.close();
                let mut drained = 0usize;
                while let Some(cmd) = rx.recv().await {
                    write_logged(&db, cmd);
                    drained += 1;
                }
                tracing::info!(drained = drained, "db writer drained queue");
                break;
            }
        }
    }

    tracing::info!("db writer task shutting down");
}

fn write_logged(db: &DbPool, cmd: DbCommand) {
    if let Err(e) = execute_command(db, cmd) {
        tracing::error!("db write error: {e}");
    }
}

pub fn execute_command(db: &DbPool, cmd: DbCommand) -> EngineResult<()> {
    let conn = lock(db)?;

    match cmd {
        DbCommand::InsertGateDecision { checked_at, scope, gate_name, passed, action, message, details } => {
            conn.execute(
                "INSERT INTO gate_decisions (checked_at, scope, gate_name, passed, action, message, details)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![checked_at, scope, gate_name, passed, action, message, details],
            )?;
        }
        DbCommand::InsertBudgetSnapshot {
            as_of, monthly_budget_pct, consumption_pct, tier, position_scale, realized_losses,
        } => {
            conn.execute(
                "INSERT INTO risk_budget_snapshots (as_of, monthly_budget_pct, consumption_pct, tier, position_scale, realized_losses)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![as_of, monthly_budget_pct, consumption_pct, tier, position_scale, realized_losses],
            )?;
        }
        DbCommand::UpsertDailyPnl { date, pnl, pnl_pct, total_value } => {
            conn.execute(
                "INSERT INTO daily_pnl (date, pnl, pnl_pct, total_value, updated_at)
                 VALUES (?1, ?2, ?3, ?4, datetime('now'))
                 ON CONFLICT(date) DO UPDATE SET pnl = ?2, pnl_pct = ?3, total_value = ?4, updated_at = datetime('now')",
                rusqlite::params![date.format("%Y-%m-%d").to_string(), pnl, pnl_pct, total_value],
            )?;
        }
    }
    Ok(())
}

// ── Trade ledger ──

/// One realized exit. Budget and streak gates read these rows back, so they
/// are written on the loop's own path, never through the audit channel.
#[derive(Debug, Clone)]
pub struct ClosedTradeRecord {
    pub id: String,
    pub ticker: String,
    pub quantity: f64,
    pub exit_price: f64,
    pub pnl: f64,
    pub reason: String,
    pub closed_at: DateTime<Utc>,
    /// Exchange-local session date.
    pub trade_date: NaiveDate,
}

pub fn insert_closed_trade(db: &DbPool, trade: &ClosedTradeRecord) -> EngineResult<()> {
    let conn = lock(db)?;
    conn.execute(
        "INSERT OR REPLACE INTO closed_trades (id, ticker, quantity, exit_price, pnl, reason, closed_at, trade_date)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            trade.id,
            trade.ticker,
            trade.quantity,
            trade.exit_price,
            trade.pnl,
            trade.reason,
            ts(trade.closed_at),
            trade.trade_date.format("%Y-%m-%d").to_string(),
        ],
    )?;
    Ok(())
}

// ── Emergency log ──

struct EventRow {
    id: i64,
    event_type: String,
    trigger_value: f64,
    action_taken: String,
    positions_affected: String,
    created_at: String,
    resolved_at: Option<String>,
}

impl EventRow {
    fn into_event(self) -> EngineResult<EmergencyEvent> {
        Ok(EmergencyEvent {
            id: Some(self.id),
            event_type: self.event_type.parse::<EmergencyKind>().map_err(EngineError::Parse)?,
            trigger_value: self.trigger_value,
            action_taken: self.action_taken,
            positions_affected: serde_json::from_str(&self.positions_affected)?,
            created_at: parse_ts(&self.created_at)?,
            resolved_at: self.resolved_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

const EVENT_COLUMNS: &str =
    "id, event_type, trigger_value, action_taken, positions_affected, created_at, resolved_at";

fn query_events(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> EngineResult<Vec<EmergencyEvent>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| {
        Ok(EventRow {
            id: row.get(0)?,
            event_type: row.get(1)?,
            trigger_value: row.get(2)?,
            action_taken: row.get(3)?,
            positions_affected: row.get(4)?,
            created_at: row.get(5)?,
            resolved_at: row.get(6)?,
        })
    })?;
    rows.map(|r| r?.into_event()).collect()
}

pub fn insert_event(db: &DbPool, event: &EmergencyEvent) -> EngineResult<i64> {
    let conn = lock(db)?;
    conn.execute(
        "INSERT INTO emergency_events (event_type, trigger_value, action_taken, positions_affected, created_at, resolved_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            event.event_type.as_str(),
            event.trigger_value,
            event.action_taken,
            serde_json::to_string(&event.positions_affected)?,
            ts(event.created_at),
            event.resolved_at.map(ts),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn resolve_open_events(db: &DbPool, kind: EmergencyKind, at: DateTime<Utc>) -> EngineResult<usize> {
    let conn = lock(db)?;
    let n = conn.execute(
        "UPDATE emergency_events SET resolved_at = ?1 WHERE event_type = ?2 AND resolved_at IS NULL",
        rusqlite::params![ts(at), kind.as_str()],
    )?;
    Ok(n)
}

pub fn get_unresolved_events(db: &DbPool) -> EngineResult<Vec<EmergencyEvent>> {
    let conn = lock(db)?;
    let sql = format!("SELECT {EVENT_COLUMNS} FROM emergency_events WHERE resolved_at IS NULL ORDER BY id");
    query_events(&conn, &sql, [])
}

// ── Query helpers (for server REST reads -- these DO lock, but only from cold path) ──

pub fn get_recent_events(db: &DbPool, limit: usize) -> EngineResult<Vec<EmergencyEvent>> {
    let conn = lock(db)?;
    let sql = format!("SELECT {EVENT_COLUMNS} FROM emergency_events ORDER BY id DESC LIMIT ?1");
    query_events(&conn, &sql, rusqlite::params![limit as i64])
}

pub fn get_recent_decisions(db: &DbPool, gate: Option<&str>, limit: usize) -> EngineResult<Vec<GateDecisionRow>> {
    let conn = lock(db)?;
    let (sql, params): (&str, Vec<Box<dyn rusqlite::types::ToSql>>) = match gate {
        Some(name) => (
            "SELECT checked_at, scope, gate_name, passed, action, message FROM gate_decisions WHERE gate_name = ?1 ORDER BY id DESC LIMIT ?2",
            vec![Box::new(name.to_string()), Box::new(limit as i64)],
        ),
        None => (
            "SELECT checked_at, scope, gate_name, passed, action, message FROM gate_decisions ORDER BY id DESC LIMIT ?1",
            vec![Box::new(limit as i64)],
        ),
    };
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
        Ok(GateDecisionRow {
            checked_at: row.get(0)?,
            scope: row.get(1)?,
            gate_name: row.get(2)?,
            passed: row.get(3)?,
            action: row.get(4)?,
            message: row.get(5)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn get_budget_snapshots(db: &DbPool, limit: usize) -> EngineResult<Vec<BudgetSnapshotRow>> {
    let conn = lock(db)?;
    let mut stmt = conn.prepare(
        "SELECT as_of, consumption_pct, tier, position_scale, realized_losses FROM risk_budget_snapshots ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(rusqlite::params![limit as i64], |row| {
        Ok(BudgetSnapshotRow {
            as_of: row.get(0)?,
            consumption_pct: row.get(1)?,
            tier: row.get(2)?,
            position_scale: row.get(3)?,
            realized_losses: row.get(4)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

// ── Row types ──

#[derive(Debug, Clone, serde::Serialize)]
pub struct GateDecisionRow {
    pub checked_at: String,
    pub scope: String,
    pub gate_name: String,
    pub passed: bool,
    pub action: String,
    pub message: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BudgetSnapshotRow {
    pub as_of: String,
    pub consumption_pct: f64,
    pub tier: i64,
    pub position_scale: f64,
    pub realized_losses: f64,
}

// ── Store: the collaborator-facing view of the database ──

/// SQLite-backed event log and trade ledger.
#[derive(Clone)]
pub struct SqliteStore {
    db: DbPool,
}

impl SqliteStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    fn closed_trades(&self, limit: usize) -> EngineResult<Vec<ClosedTrade>> {
        let conn = lock(&self.db)?;
        let mut stmt =
            conn.prepare("SELECT ticker, pnl, closed_at FROM closed_trades ORDER BY closed_at DESC, rowid DESC LIMIT ?1")?;
        let rows = stmt.query_map(rusqlite::params![limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?, row.get::<_, String>(2)?))
        })?;
        rows.map(|r| {
            let (ticker, pnl, closed_at) = r?;
            Ok(ClosedTrade { ticker, pnl, closed_at: parse_ts(&closed_at)? })
        })
        .collect()
    }

    fn daily_pnl(&self, days: usize) -> EngineResult<Vec<DailyPnl>> {
        let conn = lock(&self.db)?;
        let mut stmt = conn.prepare("SELECT date, pnl FROM daily_pnl ORDER BY date DESC LIMIT ?1")?;
        let rows = stmt.query_map(rusqlite::params![days as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?;
        rows.map(|r| {
            let (date, pnl) = r?;
            let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
                .map_err(|e| EngineError::Parse(format!("daily_pnl date {date}: {e}")))?;
            Ok(DailyPnl { date, pnl })
        })
        .collect()
    }

    fn pnl_between(&self, start: NaiveDate, end: NaiveDate) -> EngineResult<Vec<f64>> {
        let conn = lock(&self.db)?;
        let mut stmt =
            conn.prepare("SELECT pnl FROM closed_trades WHERE trade_date BETWEEN ?1 AND ?2")?;
        let rows = stmt.query_map(
            rusqlite::params![start.format("%Y-%m-%d").to_string(), end.format("%Y-%m-%d").to_string()],
            |row| row.get::<_, f64>(0),
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

#[async_trait::async_trait]
impl EventStore for SqliteStore {
    async fn append_event(&self, event: &EmergencyEvent) -> EngineResult<i64> {
        insert_event(&self.db, event)
    }

    async fn resolve_events(&self, kind: EmergencyKind, resolved_at: DateTime<Utc>) -> EngineResult<usize> {
        resolve_open_events(&self.db, kind, resolved_at)
    }

    async fn unresolved_events(&self) -> EngineResult<Vec<EmergencyEvent>> {
        get_unresolved_events(&self.db)
    }
}

#[async_trait::async_trait]
impl TradeHistory for SqliteStore {
    async fn recent_closed_trades(&self, limit: usize) -> EngineResult<Vec<ClosedTrade>> {
        self.closed_trades(limit)
    }

    async fn recent_daily_pnl(&self, days: usize) -> EngineResult<Vec<DailyPnl>> {
        self.daily_pnl(days)
    }

    async fn realized_pnl_between(&self, start: NaiveDate, end: NaiveDate) -> EngineResult<Vec<f64>> {
        self.pnl_between(start, end)
    }
}
