mod config;
mod db;
mod emergency;
mod errors;
mod feeds;
mod interfaces;
mod market;
mod notifier;
mod orchestrator;
mod paper;
mod risk;
mod server;
mod state;

use crate::emergency::EmergencyProtocol;
use crate::interfaces::{MarketDataProvider, Notifier, Strategy};
use crate::market::{HolidayCalendar, MarketSessionClock};
use crate::orchestrator::background::{self, TaskSet};
use crate::orchestrator::runner::{Collaborators, ControlPlane};
use crate::orchestrator::Orchestrator;
use crate::risk::pipeline::RiskGatePipeline;
use crate::state::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    // Early stderr line in case tracing init fails
    eprintln!("[riskdeck] binary started, setting up logging...");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("riskdeck control plane starting");

    let cfg = match config::AppConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("config error: {e}");
            std::process::exit(1);
        }
    };

    let db_pool = match db::init_db(&cfg.data_dir) {
        Ok(d) => d,
        Err(e) => {
            tracing::error!("database init error: {e}");
            std::process::exit(1);
        }
    };

    let clock = MarketSessionClock::new(
        cfg.exchange_tz,
        cfg.operator_tz,
        HolidayCalendar::nyse().with_extra(&cfg.extra_holidays),
    );

    // Bounded channels
    let (db_tx, db_rx) = mpsc::channel::<DbCommand>(1024);
    let (control_tx, control_rx) = mpsc::channel::<ControlCommand>(16);

    let app_state = AppState::new(cfg.clone(), db_pool.clone(), clock.clone(), db_tx, control_tx);

    // ── Collaborators ──

    let store = Arc::new(db::SqliteStore::new(db_pool.clone()));

    let market: Arc<dyn MarketDataProvider> = match &cfg.market_data_url {
        Some(url) => Arc::new(feeds::HttpMarketData::new(url, &cfg.market_data_api_key)),
        None => {
            tracing::warn!("MARKET_DATA_URL not set; entries stay blocked until a quote source is configured");
            Arc::new(feeds::Unconfigured)
        }
    };
    let notifier: Arc<dyn Notifier> = match &cfg.webhook_url {
        Some(url) => Arc::new(notifier::WebhookNotifier::new(url)),
        None => Arc::new(notifier::LogNotifier),
    };
    let health_url = cfg.broker_health_url.clone().or_else(|| cfg.market_data_url.clone());
    let broker = Arc::new(paper::PaperBroker::new(cfg.paper_capital, market.clone(), clock));

    let strategy: Arc<dyn Strategy> = Arc::new(paper::PassiveStrategy);

    let deps = Collaborators {
        portfolio: broker.clone(),
        market,
        executor: broker,
        strategy: strategy.clone(),
        connectivity: Arc::new(feeds::HttpHealthCheck::new(health_url)),
        notifier: notifier.clone(),
    };

    let pipeline = RiskGatePipeline::new(&cfg.risk, store.clone());
    let protocol = EmergencyProtocol::new(cfg.emergency.clone(), store, notifier.clone());
    let plane = ControlPlane::new(app_state.clone(), deps, pipeline, protocol);
    let orchestrator = Arc::new(Orchestrator::new(
        plane,
        Duration::from_secs(cfg.schedule.stop_timeout_secs),
    ));

    // ── Spawn tasks ──

    // 1. DB writer task (dedicated, owns audit writes)
    let writer_cancel = CancellationToken::new();
    let db_pool_writer = db_pool.clone();
    let writer = tokio::spawn(db::run_db_writer(db_pool_writer, db_rx, writer_cancel.clone()));

    // 2. Crash recovery, then start the loop
    let report = orchestrator.recover().await;
    tracing::info!(
        unresolved = report.unresolved_events,
        breaker = report.circuit_breaker_restored,
        runaway = report.runaway_shutdown_restored,
        degraded = report.degraded,
        "startup recovery complete"
    );
    orchestrator.start().await;

    // 3. Background analysis and the notification listener
    let mut tasks = TaskSet::new();
    let analysis_every = Duration::from_secs(cfg.schedule.analysis_interval_minutes.max(1) as u64 * 60);
    let (analysis_strategy, analysis_app) = (strategy.clone(), app_state.clone());
    tasks.spawn("analysis", move |cancel| {
        background::run_analysis(analysis_strategy, analysis_app, analysis_every, cancel)
    });
    let (listener_orch, events) = (orchestrator.clone(), app_state.ws_tx.subscribe());
    tasks.spawn("notification_listener", move |cancel| {
        background::run_listener(listener_orch, control_rx, events, notifier, cancel)
    });

    // 4. Axum HTTP + WS server
    let app = server::router(app_state.clone());
    let addr = format!("0.0.0.0:{}", cfg.server_port);
    tracing::info!("server listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| {
            tracing::error!("bind error: {e}");
            std::process::exit(1);
        });

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("server error: {e}");
        }
    });

    // 5. Ctrl-C: stop the loop, the background tasks, then flush audit
    // writes, all bounded by the global shutdown timeout
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("signal handler error: {e}");
    }
    tracing::info!("shutdown requested");

    let grace = Duration::from_secs(cfg.schedule.task_grace_secs);
    let shutdown = Duration::from_secs(cfg.schedule.shutdown_timeout_secs);
    let graceful = async {
        orchestrator.stop().await;
        let aborted = tasks.shutdown(grace).await;
        writer_cancel.cancel();
        if tokio::time::timeout(grace, writer).await.is_err() {
            tracing::error!("db writer did not drain in time");
        }
        aborted
    };
    match tokio::time::timeout(shutdown, graceful).await {
        Ok(aborted) => tracing::info!(aborted_tasks = aborted, "riskdeck stopped"),
        Err(_) => {
            tracing::error!(timeout = ?shutdown, "graceful shutdown timed out; forcing exit");
            std::process::exit(1);
        }
    }
    std::process::exit(0);
}
