//! Full-pipeline session against the paper broker: synthetic ticks form a
//! swing low, the filter nominates it, the entry rests one tick below and a
//! break fills it, arms the stop, and an adverse move closes the trade.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveTime, TimeZone, Utc};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::time::sleep;

use premia_broker::{Broker, PaperBroker};
use premia_cli::alerts::AlertManager;
use premia_cli::engine::{Engine, EngineOutcome, JournalHandle, ShutdownSignal};
use premia_config::AppConfig;
use premia_core::{BrokerOrderStatus, Tick, TickSource};
use premia_journal::{FileJournal, JournalEvent};

const SYMBOL: &str = "NIFTY06FEB2624200CE";

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    // Wall-clock independent session so the test passes at any hour.
    config.session.clock.open = NaiveTime::from_hms_opt(0, 0, 0).unwrap();
    config.session.clock.force_exit = NaiveTime::from_hms_opt(23, 59, 58).unwrap();
    config.session.clock.close = NaiveTime::from_hms_opt(23, 59, 59).unwrap();
    config.engine.orderbook_poll_secs = 1;
    config.engine.risk_check_secs = 1;
    config.engine.position_reconcile_secs = 300;
    config.engine.heartbeat_secs = 300;
    config.engine.watchdog_secs = 300;
    config.orders.retry_delay = Duration::from_millis(5);
    config
}

struct TickFeeder {
    tx: mpsc::Sender<Tick>,
    session_volume: i64,
}

impl TickFeeder {
    fn new(tx: mpsc::Sender<Tick>) -> Self {
        Self {
            tx,
            session_volume: 0,
        }
    }

    async fn tick(&mut self, minute: u32, second: u32, price: Decimal, volume_step: i64) {
        self.session_volume += volume_step;
        let tick = Tick {
            symbol: SYMBOL.into(),
            ts: Utc.with_ymd_and_hms(2026, 2, 2, 5, minute, second).unwrap(),
            last_price: price,
            session_volume: self.session_volume,
            source: TickSource::Primary,
        };
        self.tx.send(tick).await.expect("engine is listening");
    }

    /// Six ticks tracing the bar `[open, high, low, .., close]`.
    async fn minute(&mut self, minute: u32, prices: [i64; 6], volume_step: i64) {
        for (i, price) in prices.into_iter().enumerate() {
            self.tick(minute, i as u32, Decimal::from(price), volume_step)
                .await;
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn paper_session_runs_entry_to_exit() {
    let dir = tempfile::tempdir().unwrap();
    let journal_path = dir.path().join("journal.jsonl");

    let mut config = test_config();
    config.journal.path = journal_path.clone();

    let broker: Arc<dyn Broker> = Arc::new(PaperBroker::default());
    let journal = JournalHandle::spawn(Box::new(FileJournal::open(&journal_path).unwrap()));
    let alerts = Arc::new(AlertManager::new(config.alerting.clone()));
    let engine = Engine::new(
        config,
        vec![SYMBOL.to_string()],
        broker.clone(),
        journal,
        alerts,
    );

    let (tx, rx) = mpsc::channel(4_096);
    let shutdown = ShutdownSignal::new();
    let engine_task = tokio::spawn(engine.run(rx, shutdown.clone()));

    let mut feeder = TickFeeder::new(tx);
    // A low open builds the session VWAP near 120 (heavy volume), the first
    // dip confirms a swing low at 119 that fails the premium gate, the
    // rally to 141 confirms a swing high, and the pullback low at 130
    // confirms the tradable swing: 7.6% over VWAP, stop 11 points away.
    feeder.minute(0, [120, 121, 119, 120, 120, 120], 2_000).await;
    feeder.minute(1, [120, 121, 119, 120, 120, 120], 2_000).await;
    feeder.minute(2, [120, 122, 120, 121, 121, 121], 2_000).await;
    feeder.minute(3, [122, 123, 121, 122, 122, 122], 2_000).await;
    feeder.minute(4, [124, 135, 123, 130, 133, 134], 2).await;
    feeder.minute(5, [135, 141, 134, 139, 140, 140], 2).await;
    feeder.minute(6, [139, 140, 133, 135, 137, 136], 2).await;
    feeder.minute(7, [138, 139, 130, 133, 132, 131], 2).await;
    feeder.minute(8, [132, 140, 131, 137, 138, 139], 2).await;
    feeder.minute(9, [135, 140, 132, 136, 138, 139], 2).await;
    // First tick of minute 10 closes the confirming bar; the entry order
    // should appear one tick under the swing low.
    feeder.tick(10, 0, Decimal::from(131), 2).await;
    sleep(Duration::from_millis(300)).await;

    let book = broker.orderbook().await.unwrap();
    assert_eq!(book.len(), 1, "resting entry expected: {book:?}");
    assert_eq!(book[0].status, BrokerOrderStatus::Open);
    assert_eq!(book[0].price, Some(Decimal::new(12_995, 2)));
    assert_eq!(book[0].quantity, 585);

    // The swing breaks: the resting order fills at its limit.
    feeder.tick(10, 5, Decimal::new(12_990, 2), 2).await;
    sleep(Duration::from_millis(1_500)).await;

    let book = broker.orderbook().await.unwrap();
    let entry = &book[0];
    assert_eq!(entry.status, BrokerOrderStatus::Complete);
    let stop = book
        .iter()
        .find(|o| o.trigger_price.is_some())
        .expect("protective stop armed");
    assert_eq!(stop.trigger_price, Some(Decimal::from(141)));
    assert_eq!(stop.price, Some(Decimal::from(144)));
    assert_eq!(stop.quantity, 585);

    // Adverse rally through the trigger stops the trade out.
    feeder.tick(10, 20, Decimal::new(14_150, 2), 2).await;
    sleep(Duration::from_millis(1_500)).await;
    assert!(broker.positionbook().await.unwrap().is_empty());

    shutdown.trigger();
    let outcome = engine_task.await.unwrap().unwrap();
    assert_eq!(outcome, EngineOutcome::Clean);

    let records = FileJournal::read_all(&journal_path).unwrap();
    let has = |pred: &dyn Fn(&JournalEvent) -> bool| records.iter().any(|r| pred(&r.event));
    assert!(has(&|e| matches!(e, JournalEvent::SwingConfirmed { price, .. } if *price == Decimal::from(130))));
    assert!(has(&|e| matches!(e, JournalEvent::CandidateGated { entry_price, .. } if *entry_price == Decimal::from(130))));
    assert!(has(&|e| matches!(e, JournalEvent::OrderPlaced { limit_price, quantity, .. }
        if *limit_price == Decimal::new(12_995, 2) && *quantity == 585)));
    assert!(has(&|e| matches!(e, JournalEvent::OrderFilled { price, .. } if *price == Decimal::new(12_995, 2))));
    assert!(has(&|e| matches!(e, JournalEvent::PositionOpened { stop_trigger, .. } if *stop_trigger == Decimal::from(141))));
    assert!(has(&|e| matches!(e, JournalEvent::PositionClosed { exit_price, .. } if *exit_price == Decimal::new(14_150, 2))));
    assert!(has(&|e| matches!(e, JournalEvent::SessionSummary { summary } if summary.trades == 1)));
}

#[tokio::test(flavor = "multi_thread")]
async fn thin_premium_swing_is_never_traded() {
    let dir = tempfile::tempdir().unwrap();
    let journal_path = dir.path().join("journal.jsonl");
    let mut config = test_config();
    config.journal.path = journal_path.clone();

    let broker: Arc<dyn Broker> = Arc::new(PaperBroker::default());
    let journal = JournalHandle::spawn(Box::new(FileJournal::open(&journal_path).unwrap()));
    let alerts = Arc::new(AlertManager::new(config.alerting.clone()));
    let engine = Engine::new(
        config,
        vec![SYMBOL.to_string()],
        broker.clone(),
        journal,
        alerts,
    );

    let (tx, rx) = mpsc::channel(4_096);
    let shutdown = ShutdownSignal::new();
    let engine_task = tokio::spawn(engine.run(rx, shutdown.clone()));

    // Flat tape: the swing low sits on top of VWAP, so the premium gate
    // rejects it and nothing ever reaches the broker.
    let mut feeder = TickFeeder::new(tx);
    feeder.minute(0, [130, 131, 129, 130, 130, 130], 100).await;
    feeder.minute(1, [130, 131, 129, 130, 130, 130], 100).await;
    feeder.minute(2, [130, 132, 130, 131, 131, 131], 100).await;
    feeder.minute(3, [131, 133, 131, 132, 132, 132], 100).await;
    feeder.tick(4, 0, Decimal::from(132), 100).await;
    sleep(Duration::from_millis(300)).await;

    assert!(broker.orderbook().await.unwrap().is_empty());

    shutdown.trigger();
    let outcome = engine_task.await.unwrap().unwrap();
    assert_eq!(outcome, EngineOutcome::Clean);
}
