use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveTime, Utc};
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;

use trade_dispatcher::broker::{BrokerClient, MockBrokerClient};
use trade_dispatcher::dispatcher::Dispatcher;
use trade_dispatcher::ingester::{Ingester, SourceRow};
use trade_dispatcher::market_clock::MarketClock;
use trade_dispatcher::order::{split_lots, Order, OrderType, Side};
use trade_dispatcher::rate_gate::RateGate;
use trade_dispatcher::source_reader::MockSourceReader;
use trade_dispatcher::store::{InMemoryOrderStore, OrderStore};

fn market_clock() -> MarketClock {
    MarketClock::new(
        "Asia/Kolkata".parse().unwrap(),
        NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
        NaiveTime::from_hms_opt(15, 30, 0).unwrap(),
    )
}

fn future_row(hour: u32, minute: u32, quantity: &str, lots: Option<&str>) -> SourceRow {
    let tz: chrono_tz::Tz = "Asia/Kolkata".parse().unwrap();
    let local_now = Utc::now().with_timezone(&tz);
    let tomorrow = local_now.date_naive() + chrono::Duration::days(1);
    SourceRow {
        symbol: "XYZ".to_string(),
        exchange: None,
        order_type: "limit".to_string(),
        price: Some("100.00".to_string()),
        date: tomorrow.format("%Y-%m-%d").to_string(),
        time: format!("{hour:02}:{minute:02}:00"),
        quantity: quantity.to_string(),
        lots: lots.map(|s| s.to_string()),
    }
}

/// Scenario: a regular order during market hours dispatches via place_regular
/// and is removed from the store on success.
#[tokio::test]
async fn regular_order_during_market_hours_dispatches_and_clears() {
    let store: Arc<dyn OrderStore> = Arc::new(InMemoryOrderStore::new());
    let clock = market_clock();
    let source = Arc::new(MockSourceReader::new(vec![future_row(10, 0, "5", None)], vec![]));
    let ingester = Ingester::new(source, Arc::clone(&store), clock, chrono::Duration::seconds(10));
    ingester.run_once().await;

    let broker: Arc<dyn BrokerClient> = Arc::new(MockBrokerClient::new());
    let rate_gate = Arc::new(RateGate::new(100.0, 100));
    let dispatcher = Dispatcher::new(Arc::clone(&store), broker, rate_gate, 5, Duration::from_secs(30));

    // Force the order due by querying far enough in the future.
    let far_future = Utc::now() + chrono::Duration::days(2);
    let cancel = CancellationToken::new();
    let outcomes = dispatcher.run_once(far_future, &cancel).await;

    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].success);
    assert_eq!(dispatcher.run_once(far_future, &cancel).await.len(), 0);
}

/// Scenario: an after-hours row is stamped is_amo=true at ingestion time.
#[tokio::test]
async fn after_hours_row_stamps_amo() {
    let store: Arc<dyn OrderStore> = Arc::new(InMemoryOrderStore::new());
    let clock = market_clock();
    let source = Arc::new(MockSourceReader::new(vec![future_row(18, 0, "5", None)], vec![]));
    let ingester = Ingester::new(source, Arc::clone(&store), clock, chrono::Duration::seconds(10));
    ingester.run_once().await;

    let due = store.due(Utc::now() + chrono::Duration::days(2)).await.unwrap();
    assert_eq!(due.len(), 1);
    assert!(due[0].is_amo);
}

/// Scenario: a source row with total_quantity=10, lots=3 yields {4, 3, 3}.
#[test]
fn lot_split_matches_scenario() {
    let mut lots = split_lots(10, 3);
    lots.sort_unstable_by(|a, b| b.cmp(a));
    assert_eq!(lots, vec![4, 3, 3]);
}

/// Scenario: rate gating of 10 orders at 3rps/burst3 spans at least 3s.
#[tokio::test]
async fn rate_gating_spans_expected_window() {
    let store: Arc<dyn OrderStore> = Arc::new(InMemoryOrderStore::new());
    let now = Utc::now();
    for i in 0..10 {
        let order = Order {
            id: format!("order-{i}"),
            symbol: "XYZ".to_string(),
            exchange: "NSE".to_string(),
            side: Side::Buy,
            order_type: OrderType::Market,
            price: Decimal::ZERO,
            quantity: 1,
            scheduled_instant: now - chrono::Duration::seconds(1),
            is_amo: false,
            created_instant: now,
        };
        store.insert(order, now + chrono::Duration::seconds(60)).await.unwrap();
    }

    let broker: Arc<dyn BrokerClient> = Arc::new(MockBrokerClient::new());
    let rate_gate = Arc::new(RateGate::new(3.0, 3));
    let dispatcher = Dispatcher::new(Arc::clone(&store), broker, rate_gate, 10, Duration::from_secs(30));

    let cancel = CancellationToken::new();
    let start = tokio::time::Instant::now();
    let outcomes = dispatcher.run_once(now, &cancel).await;
    let elapsed = start.elapsed();

    assert_eq!(outcomes.iter().filter(|o| o.success).count(), 10);
    assert!(elapsed >= Duration::from_secs(3), "elapsed was {elapsed:?}");
}

/// Scenario: crash-and-resume exclusivity across a lock's TTL.
#[tokio::test]
async fn crash_and_resume_preserves_exclusivity() {
    let store: Arc<dyn OrderStore> = Arc::new(InMemoryOrderStore::new());
    let ttl = Duration::from_millis(100);

    // Dispatcher A acquires the lock and "crashes" (never unlocks or removes).
    assert!(store.try_lock("K", ttl).await.unwrap());

    // Dispatcher B cannot acquire before the TTL elapses.
    assert!(!store.try_lock("K", ttl).await.unwrap());

    tokio::time::sleep(Duration::from_millis(120)).await;

    // After TTL expiry, B acquires and would dispatch, then remove.
    assert!(store.try_lock("K", ttl).await.unwrap());
    store.remove("K").await.unwrap();

    // No third dispatch: the record is gone.
    assert!(store.get("K").await.unwrap().is_none());
}

/// Scenario: a row scheduled in the past is rejected at ingestion.
#[tokio::test]
async fn past_scheduled_row_is_rejected() {
    let store: Arc<dyn OrderStore> = Arc::new(InMemoryOrderStore::new());
    let clock = market_clock();
    let mut row = future_row(10, 0, "5", None);
    row.date = (Utc::now() - chrono::Duration::days(1)).format("%Y-%m-%d").to_string();
    row.time = "00:00:00".to_string();

    let source = Arc::new(MockSourceReader::new(vec![row], vec![]));
    let ingester = Ingester::new(source, Arc::clone(&store), clock, chrono::Duration::seconds(10));
    ingester.run_once().await;

    let due = store.due(Utc::now() + chrono::Duration::days(2)).await.unwrap();
    assert!(due.is_empty());
}
