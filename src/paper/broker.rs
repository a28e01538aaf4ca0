use crate::errors::{EngineError, EngineResult};
use crate::interfaces::{Fill, MarketDataProvider, OrderExecutor, PortfolioProvider};
use crate::market::MarketSessionClock;
use crate::risk::{Order, OrderSide, Portfolio, Position};
use chrono::{NaiveDate, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy)]
struct Lot {
    quantity: f64,
    avg_price: f64,
    last_price: f64,
}

#[derive(Debug)]
struct Book {
    cash: f64,
    lots: BTreeMap<String, Lot>,
    /// Exchange date and equity at the first read of that day.
    day_start: Option<(NaiveDate, f64)>,
    fills: u64,
}

impl Book {
    fn equity(&self) -> f64 {
        self.cash + self.lots.values().map(|l| l.quantity * l.last_price).sum::<f64>()
    }
}

/// In-process account for paper mode. Orders fill immediately at their
/// limit price; positions are marked to the feed on every read.
pub struct PaperBroker {
    market: Arc<dyn MarketDataProvider>,
    clock: MarketSessionClock,
    book: Mutex<Book>,
}

impl PaperBroker {
    pub fn new(capital: f64, market: Arc<dyn MarketDataProvider>, clock: MarketSessionClock) -> Self {
        tracing::info!(capital = capital, "paper account opened");
        Self {
            market,
            clock,
            book: Mutex::new(Book { cash: capital, lots: BTreeMap::new(), day_start: None, fills: 0 }),
        }
    }

    fn book(&self) -> EngineResult<MutexGuard<'_, Book>> {
        self.book
            .lock()
            .map_err(|e| EngineError::StateCorruption(format!("paper book poisoned: {e}")))
    }

    fn summarize(&self, book: &mut Book, today: NaiveDate) -> Portfolio {
        let equity = book.equity();
        let start = match book.day_start {
            Some((d, v)) if d == today => v,
            _ => {
                book.day_start = Some((today, equity));
                equity
            }
        };
        Portfolio {
            total_value: equity,
            cash: book.cash,
            today_pnl: equity - start,
            positions: book
                .lots
                .iter()
                .map(|(ticker, lot)| Position {
                    ticker: ticker.clone(),
                    quantity: lot.quantity,
                    market_value: lot.quantity * lot.last_price,
                    entry_price: lot.avg_price,
                })
                .collect(),
        }
    }
}

#[async_trait::async_trait]
impl PortfolioProvider for PaperBroker {
    async fn get_portfolio_summary(&self) -> EngineResult<Portfolio> {
        let tickers: Vec<String> = self.book()?.lots.keys().cloned().collect();

        let mut marks = Vec::with_capacity(tickers.len());
        for ticker in tickers {
            match self.market.get_last_price(&ticker).await {
                Ok(price) => marks.push((ticker, price)),
                Err(e) if e.is_network() => return Err(e),
                Err(e) => tracing::warn!(ticker = %ticker, error = %e, "mark unavailable; keeping last price"),
            }
        }

        let mut book = self.book()?;
        for (ticker, price) in marks {
            if let Some(lot) = book.lots.get_mut(&ticker) {
                lot.last_price = price;
            }
        }
        let today = self.clock.exchange_date(Utc::now());
        Ok(self.summarize(&mut book, today))
    }
}

#[async_trait::async_trait]
impl OrderExecutor for PaperBroker {
    async fn submit(&self, order: &Order) -> EngineResult<Fill> {
        if !(order.quantity > 0.0 && order.limit_price > 0.0 && order.notional().is_finite()) {
            return Err(EngineError::BrokerApi { status: 400, body: format!("{}: invalid size/price", order.ticker) });
        }

        let mut book = self.book()?;
        let price = order.limit_price;
        let (quantity, realized_pnl) = match order.side {
            OrderSide::Buy => {
                let notional = order.notional();
                if notional > book.cash + 1e-9 {
                    return Err(EngineError::BrokerApi {
                        status: 400,
                        body: format!("insufficient cash: need {notional:.2}, have {:.2}", book.cash),
                    });
                }
                book.cash -= notional;
                let lot = book
                    .lots
                    .entry(order.ticker.clone())
                    .or_insert(Lot { quantity: 0.0, avg_price: price, last_price: price });
                let total = lot.quantity + order.quantity;
                lot.avg_price = (lot.avg_price * lot.quantity + price * order.quantity) / total;
                lot.quantity = total;
                lot.last_price = price;
                (order.quantity, None)
            }
            OrderSide::Sell => {
                let Some(lot) = book.lots.get_mut(&order.ticker) else {
                    return Err(EngineError::BrokerApi { status: 400, body: format!("{}: no position", order.ticker) });
                };
                let quantity = order.quantity.min(lot.quantity);
                let pnl = (price - lot.avg_price) * quantity;
                lot.quantity -= quantity;
                lot.last_price = price;
                if lot.quantity <= 1e-9 {
                    book.lots.remove(&order.ticker);
                }
                book.cash += quantity * price;
                (quantity, Some(pnl))
            }
        };

        book.fills += 1;
        Ok(Fill {
            order_id: uuid::Uuid::new_v4().to_string(),
            ticker: order.ticker.clone(),
            side: order.side,
            quantity,
            price,
            realized_pnl,
        })
    }

    async fn cancel_all_pending(&self) -> EngineResult<usize> {
        // fills are immediate; nothing rests
        Ok(0)
    }

    async fn resync(&self) -> EngineResult<()> {
        let book = self.book()?;
        tracing::info!(cash = book.cash, positions = book.lots.len(), fills = book.fills, "paper book resynced");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::MarketIndicators;
    use crate::market::HolidayCalendar;
    use crate::risk::fixtures::buy;

    #[derive(Default)]
    struct Marks {
        prices: Mutex<BTreeMap<String, f64>>,
    }

    #[async_trait::async_trait]
    impl MarketDataProvider for Marks {
        async fn get_price_history(&self, _ticker: &str, _days: usize) -> EngineResult<Vec<f64>> {
            Ok(vec![])
        }

        async fn get_last_price(&self, ticker: &str) -> EngineResult<f64> {
            self.prices
                .lock()
                .unwrap()
                .get(ticker)
                .copied()
                .ok_or_else(|| EngineError::MarketData("no quote".into()))
        }

        async fn get_recent_change_pct(&self, _ticker: &str, _minutes: i64) -> EngineResult<f64> {
            Ok(0.0)
        }

        async fn get_market_indicators(&self) -> EngineResult<MarketIndicators> {
            Ok(MarketIndicators::default())
        }
    }

    fn broker() -> (PaperBroker, Arc<Marks>) {
        let marks = Arc::new(Marks::default());
        let clock =
            MarketSessionClock::new(chrono_tz::America::New_York, chrono_tz::Asia::Seoul, HolidayCalendar::nyse());
        (PaperBroker::new(10_000.0, marks.clone(), clock), marks)
    }

    fn sell(ticker: &str, quantity: f64, price: f64) -> Order {
        Order { side: OrderSide::Sell, ..buy(ticker, quantity, price) }
    }

    #[tokio::test]
    async fn test_buy_mark_and_today_pnl() {
        let (b, marks) = broker();
        let start = b.get_portfolio_summary().await.unwrap();
        assert_eq!(start.total_value, 10_000.0);
        assert_eq!(start.today_pnl, 0.0);

        b.submit(&buy("SPY", 4.0, 500.0)).await.unwrap();
        marks.prices.lock().unwrap().insert("SPY".into(), 490.0);

        let pf = b.get_portfolio_summary().await.unwrap();
        assert_eq!(pf.cash, 8_000.0);
        assert_eq!(pf.positions[0].market_value, 1_960.0);
        assert_eq!(pf.positions[0].entry_price, 500.0);
        assert!((pf.today_pnl + 40.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_sell_realizes_against_average_cost() {
        let (b, _) = broker();
        b.submit(&buy("QQQ", 2.0, 100.0)).await.unwrap();
        b.submit(&buy("QQQ", 2.0, 110.0)).await.unwrap();

        let fill = b.submit(&sell("QQQ", 3.0, 120.0)).await.unwrap();
        assert_eq!(fill.quantity, 3.0);
        assert!((fill.realized_pnl.unwrap() - 45.0).abs() < 1e-9);

        // oversell clamps to what is held
        let fill = b.submit(&sell("QQQ", 5.0, 90.0)).await.unwrap();
        assert_eq!(fill.quantity, 1.0);
        assert!(b.get_portfolio_summary().await.unwrap().positions.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_bad_orders() {
        let (b, _) = broker();
        assert!(b.submit(&buy("SPY", 100.0, 500.0)).await.is_err(), "insufficient cash");
        assert!(b.submit(&sell("SPY", 1.0, 500.0)).await.is_err(), "no position");
        assert!(b.submit(&buy("SPY", 0.0, 500.0)).await.is_err());
    }
}
