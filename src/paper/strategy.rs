use crate::errors::EngineResult;
use crate::interfaces::Strategy;
use crate::risk::{Order, Portfolio};
use chrono::NaiveDate;

/// Default decision layer: never proposes entries. Stops, emergency
/// handling and bookkeeping still run around it.
pub struct PassiveStrategy;

#[async_trait::async_trait]
impl Strategy for PassiveStrategy {
    async fn prepare_day(&self, today: NaiveDate) -> EngineResult<()> {
        tracing::info!(date = %today, "passive strategy: nothing to prepare");
        Ok(())
    }

    async fn propose_orders(&self, portfolio: &Portfolio) -> EngineResult<Vec<Order>> {
        tracing::debug!(positions = portfolio.positions.len(), "passive strategy: no proposals");
        Ok(Vec::new())
    }

    async fn background_analysis(&self) -> EngineResult<()> {
        tracing::debug!("passive strategy: no research configured");
        Ok(())
    }

    async fn end_of_day(&self, portfolio: &Portfolio) -> EngineResult<()> {
        tracing::info!(
            total = portfolio.total_value,
            pnl = portfolio.today_pnl,
            pnl_pct = portfolio.daily_pnl_pct(),
            "passive strategy: day closed"
        );
        Ok(())
    }
}
