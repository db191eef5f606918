use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use tracing::{instrument, warn};

use crate::market_clock::MarketClock;
use crate::order::{split_lots, Order, OrderType, Side};
use crate::store::OrderStore;

/// One unvalidated row as produced by the external spreadsheet collaborator.
/// Fields are strings because the source is lenient about formatting; parsing
/// and validation happen entirely in the `Ingester`.
#[derive(Debug, Clone)]
pub struct SourceRow {
    pub symbol: String,
    pub exchange: Option<String>,
    pub order_type: String,
    pub price: Option<String>,
    pub date: String,
    pub time: String,
    pub quantity: String,
    pub lots: Option<String>,
}

/// Boundary contract for the external feed. Only this contract is in scope;
/// fetch/parsing specifics (spreadsheet auth, range selection) live outside
/// this crate.
#[async_trait]
pub trait SourceReader: Send + Sync {
    async fn fetch_rows(&self) -> anyhow::Result<(Vec<SourceRow>, Vec<SourceRow>)>;
}

const DEFAULT_EXCHANGE: &str = "NSE";

/// Periodically pulls rows from a `SourceReader`, normalizes them into
/// `Order`s, stamps the AMO decision, and inserts them into the `OrderStore`.
/// Holds no cross-cycle state: a failed cycle is simply retried from scratch
/// on the next tick.
pub struct Ingester {
    source: Arc<dyn SourceReader>,
    store: Arc<dyn OrderStore>,
    clock: MarketClock,
    grace: chrono::Duration,
}

impl Ingester {
    pub fn new(source: Arc<dyn SourceReader>, store: Arc<dyn OrderStore>, clock: MarketClock, grace: chrono::Duration) -> Self {
        Self { source, store, clock, grace }
    }

    #[instrument(skip(self))]
    pub async fn run_once(&self) {
        let (buy, sell) = match self.source.fetch_rows().await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "source fetch failed, skipping this ingest cycle");
                return;
            }
        };

        for row in buy.into_iter() {
            self.ingest_row(row, Side::Buy).await;
        }
        for row in sell.into_iter() {
            self.ingest_row(row, Side::Sell).await;
        }
    }

    async fn ingest_row(&self, row: SourceRow, side: Side) {
        let exchange = row.exchange.clone().unwrap_or_else(|| DEFAULT_EXCHANGE.to_string());

        if row.symbol.trim().is_empty() {
            warn!("discarding row with missing symbol");
            return;
        }

        let order_type = match row.order_type.trim().to_ascii_lowercase().as_str() {
            "limit" => OrderType::Limit,
            _ => OrderType::Market,
        };

        let price = match order_type {
            OrderType::Limit => match row.price.as_deref().and_then(|p| p.trim().parse::<Decimal>().ok()) {
                Some(price) if price > Decimal::ZERO => price,
                _ => {
                    warn!(symbol = %row.symbol, "discarding limit row with unparseable or non-positive price");
                    return;
                }
            },
            OrderType::Market => Decimal::ZERO,
        };

        let scheduled_instant = match self.parse_scheduled_instant(&row.date, &row.time) {
            Some(instant) => instant,
            None => {
                warn!(symbol = %row.symbol, date = %row.date, time = %row.time, "discarding row with unparseable date/time");
                return;
            }
        };

        if scheduled_instant <= Utc::now() {
            warn!(symbol = %row.symbol, "discarding row scheduled in the past");
            return;
        }

        let total_quantity: u32 = match row.quantity.trim().parse() {
            Ok(q) if q > 0 => q,
            _ => {
                warn!(symbol = %row.symbol, "discarding row with non-positive quantity");
                return;
            }
        };

        // Malformed lot fields default to a single lot; the source is lenient.
        let lots: u32 = row
            .lots
            .as_deref()
            .and_then(|l| l.trim().parse().ok())
            .filter(|l| *l >= 1)
            .unwrap_or(1);

        let is_amo = self.clock.is_amo(scheduled_instant);
        let expiry_instant = scheduled_instant + self.grace;
        let created_instant = Utc::now();

        for (lot_index, quantity) in split_lots(total_quantity, lots).into_iter().enumerate() {
            let order = Order {
                id: Order::derive_id(&row.symbol, &exchange, scheduled_instant, lot_index as u32),
                symbol: row.symbol.clone(),
                exchange: exchange.clone(),
                side,
                order_type,
                price,
                quantity,
                scheduled_instant,
                is_amo,
                created_instant,
            };
            if let Err(e) = self.store.insert(order, expiry_instant).await {
                warn!(error = %e, symbol = %row.symbol, "failed to insert order, skipping");
            }
        }
    }

    fn parse_scheduled_instant(&self, date: &str, time: &str) -> Option<DateTime<Utc>> {
        let date = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d").ok()?;
        let time = NaiveTime::parse_from_str(time.trim(), "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(time.trim(), "%H:%M"))
            .ok()?;
        let naive = date.and_time(time);
        self.clock.timezone_local(naive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryOrderStore;
    use chrono::NaiveTime;
    use chrono_tz::Tz;

    struct StaticSource {
        buy: Vec<SourceRow>,
        sell: Vec<SourceRow>,
    }

    #[async_trait]
    impl SourceReader for StaticSource {
        async fn fetch_rows(&self) -> anyhow::Result<(Vec<SourceRow>, Vec<SourceRow>)> {
            Ok((self.buy.clone(), self.sell.clone()))
        }
    }

    fn clock() -> MarketClock {
        MarketClock::new(
            "Asia/Kolkata".parse().unwrap(),
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(15, 30, 0).unwrap(),
        )
    }

    fn future_row(lots: Option<&str>) -> SourceRow {
        let future = Utc::now() + chrono::Duration::days(1);
        let tz: Tz = "Asia/Kolkata".parse().unwrap();
        let local = future.with_timezone(&tz);
        SourceRow {
            symbol: "XYZ".to_string(),
            exchange: None,
            order_type: "limit".to_string(),
            price: Some("100.50".to_string()),
            date: local.format("%Y-%m-%d").to_string(),
            time: "10:00:00".to_string(),
            quantity: "10".to_string(),
            lots: lots.map(|s| s.to_string()),
        }
    }

    #[tokio::test]
    async fn lot_split_produces_correct_quantities() {
        let store: Arc<dyn OrderStore> = Arc::new(InMemoryOrderStore::new());
        let source: Arc<dyn SourceReader> = Arc::new(StaticSource {
            buy: vec![future_row(Some("3"))],
            sell: vec![],
        });
        let ingester = Ingester::new(source, Arc::clone(&store), clock(), chrono::Duration::seconds(10));
        ingester.run_once().await;

        let due = store.due(Utc::now() + chrono::Duration::days(2)).await.unwrap();
        let mut quantities: Vec<u32> = due.iter().map(|o| o.quantity).collect();
        quantities.sort_unstable();
        assert_eq!(quantities, vec![3, 3, 4]);
        assert_eq!(quantities.iter().sum::<u32>(), 10);
    }

    #[tokio::test]
    async fn past_scheduled_row_is_discarded() {
        let store: Arc<dyn OrderStore> = Arc::new(InMemoryOrderStore::new());
        let mut row = future_row(None);
        row.date = (Utc::now() - chrono::Duration::days(1)).format("%Y-%m-%d").to_string();
        row.time = "00:00:00".to_string();
        let source: Arc<dyn SourceReader> = Arc::new(StaticSource { buy: vec![row], sell: vec![] });
        let ingester = Ingester::new(source, Arc::clone(&store), clock(), chrono::Duration::seconds(10));
        ingester.run_once().await;

        let due = store.due(Utc::now() + chrono::Duration::days(2)).await.unwrap();
        assert!(due.is_empty());
    }

    #[tokio::test]
    async fn missing_symbol_is_discarded() {
        let store: Arc<dyn OrderStore> = Arc::new(InMemoryOrderStore::new());
        let mut row = future_row(None);
        row.symbol = "  ".to_string();
        let source: Arc<dyn SourceReader> = Arc::new(StaticSource { buy: vec![row], sell: vec![] });
        let ingester = Ingester::new(source, Arc::clone(&store), clock(), chrono::Duration::seconds(10));
        ingester.run_once().await;

        let due = store.due(Utc::now() + chrono::Duration::days(2)).await.unwrap();
        assert!(due.is_empty());
    }
}
