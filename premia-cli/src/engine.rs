//! The coordinator: one task owning every piece of mutable decision state,
//! fed by bounded channels and a handful of interval timers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use premia_broker::{Broker, PaperBroker};
use premia_config::AppConfig;
use premia_core::{
    OptionSide, OptionSymbol, OrderId, Position, Price, SessionClock, Swing, Symbol, Tick,
};
use premia_execution::{Admission, ExecEvent, OrderManager};
use premia_feed::{BarAggregator, FeedEvent, FeedSupervisor};
use premia_journal::{Journal, JournalEvent};
use premia_risk::{HaltReason, PositionTracker, RiskGovernor};
use premia_strategy::{FilterEngine, GateOutcome, SwingDetector, SwingEvent};

use crate::alerts::{AlertKind, AlertManager};

/// Consecutive saturated drains before the engine declares the ingress
/// queue unrecoverable.
const SATURATION_ABORT_AFTER: u32 = 8;

/// Cooperative shutdown flag shared with signal handlers and I/O tasks.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<ShutdownInner>,
}

#[derive(Default)]
struct ShutdownInner {
    triggered: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    #[must_use]
    pub fn triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        while !self.triggered() {
            self.inner.notify.notified().await;
        }
    }
}

/// How the engine ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EngineOutcome {
    Clean,
    Aborted,
}

enum JournalCommand {
    Append(JournalEvent),
    Flush(oneshot::Sender<()>),
}

/// Fire-and-forget journal writer; append errors surface on later
/// iterations through the log, never on the decision path.
#[derive(Clone)]
pub struct JournalHandle {
    tx: mpsc::UnboundedSender<JournalCommand>,
}

impl JournalHandle {
    pub fn spawn(journal: Box<dyn Journal>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    JournalCommand::Append(event) => {
                        if let Err(err) = journal.append(event) {
                            error!(error = %err, "journal append failed");
                        }
                    }
                    JournalCommand::Flush(ack) => {
                        if let Err(err) = journal.flush() {
                            error!(error = %err, "journal flush failed");
                        }
                        let _ = ack.send(());
                    }
                }
            }
            let _ = journal.flush();
        });
        Self { tx }
    }

    pub fn append(&self, event: JournalEvent) {
        let _ = self.tx.send(JournalCommand::Append(event));
    }

    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(JournalCommand::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

/// Everything the coordinator owns.
pub struct Engine {
    config: AppConfig,
    clock: SessionClock,
    symbols: Vec<Symbol>,
    broker: Arc<dyn Broker>,
    aggregator: BarAggregator,
    supervisor: FeedSupervisor,
    detectors: HashMap<Symbol, SwingDetector>,
    filter: FilterEngine,
    orders: OrderManager,
    tracker: PositionTracker,
    governor: RiskGovernor,
    journal: JournalHandle,
    alerts: Arc<AlertManager>,
    session_start: chrono::DateTime<Utc>,
    previous_best: HashMap<OptionSide, Option<Symbol>>,
    saturated_drains: u32,
    halt_handled: bool,
}

impl Engine {
    pub fn new(
        config: AppConfig,
        symbols: Vec<Symbol>,
        broker: Arc<dyn Broker>,
        journal: JournalHandle,
        alerts: Arc<AlertManager>,
    ) -> Self {
        let now = Utc::now();
        let clock = config.session.clock;
        let supervisor = FeedSupervisor::new(
            chrono::Duration::seconds(config.feed.stale_after_secs as i64),
            chrono::Duration::seconds(config.feed.switchback_secs as i64),
            now,
        );
        let filter = FilterEngine::new(config.filter.clone());
        let orders = OrderManager::new(config.orders.clone());
        let tracker = PositionTracker::new(config.risk.r_value);
        let governor = RiskGovernor::new(config.risk.clone(), clock);
        Self {
            config,
            clock,
            symbols,
            broker,
            aggregator: BarAggregator::new(),
            supervisor,
            detectors: HashMap::new(),
            filter,
            orders,
            tracker,
            governor,
            journal,
            alerts,
            session_start: now,
            previous_best: HashMap::new(),
            saturated_drains: 0,
            halt_handled: false,
        }
    }

    /// Main loop: runs until shutdown, the tick channel closes, or the data
    /// watchdog aborts.
    pub async fn run(
        mut self,
        mut ticks: mpsc::Receiver<Tick>,
        shutdown: ShutdownSignal,
    ) -> Result<EngineOutcome> {
        let engine_cfg = self.config.engine.clone();
        let mut orderbook_timer = make_interval(engine_cfg.orderbook_poll_secs);
        let mut position_timer = make_interval(engine_cfg.position_reconcile_secs);
        let mut risk_timer = make_interval(engine_cfg.risk_check_secs);
        let mut heartbeat_timer = make_interval(engine_cfg.heartbeat_secs);
        let mut watchdog_timer = make_interval(engine_cfg.watchdog_secs);

        info!(
            symbols = self.symbols.len(),
            broker = self.broker.name(),
            "engine loop started"
        );

        let mut outcome = EngineOutcome::Clean;
        loop {
            tokio::select! {
                maybe_tick = ticks.recv() => {
                    match maybe_tick {
                        Some(tick) => {
                            self.on_tick(tick).await;
                            let drained = self
                                .drain_backlog(&mut ticks, engine_cfg.tick_channel_capacity)
                                .await;
                            if drained >= engine_cfg.tick_channel_soft_limit {
                                self.saturated_drains += 1;
                                warn!(drained, streak = self.saturated_drains, "tick queue saturated");
                                if self.saturated_drains >= SATURATION_ABORT_AFTER {
                                    error!("tick ingress persistently saturated, aborting");
                                    self.alerts.notify(
                                        AlertKind::Critical,
                                        "Data watchdog abort",
                                        "Tick queue stayed saturated; engine is shutting down.",
                                    ).await;
                                    outcome = EngineOutcome::Aborted;
                                    break;
                                }
                            } else {
                                self.saturated_drains = 0;
                            }
                        }
                        None => {
                            warn!("tick channel closed");
                            if self.clock.is_open(Utc::now()) {
                                outcome = EngineOutcome::Aborted;
                            }
                            break;
                        }
                    }
                }
                _ = orderbook_timer.tick() => self.poll_orderbook().await,
                _ = position_timer.tick() => self.reconcile_positions().await,
                _ = risk_timer.tick() => self.run_risk_check().await,
                _ = heartbeat_timer.tick() => self.heartbeat(),
                _ = watchdog_timer.tick() => {
                    if self.run_watchdog().await {
                        outcome = EngineOutcome::Aborted;
                        break;
                    }
                }
                _ = shutdown.wait() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        self.shutdown().await;
        Ok(outcome)
    }

    async fn drain_backlog(&mut self, ticks: &mut mpsc::Receiver<Tick>, limit: usize) -> usize {
        let mut drained = 0;
        while drained < limit {
            match ticks.try_recv() {
                Ok(tick) => {
                    self.on_tick(tick).await;
                    drained += 1;
                }
                Err(_) => break,
            }
        }
        drained
    }

    async fn on_tick(&mut self, tick: Tick) {
        let now = Utc::now();
        let (forward, feed_event) = self.supervisor.route(&tick, now);
        if let Some(event) = feed_event {
            self.announce_feed_event(&event).await;
        }
        if !forward {
            return;
        }

        // Paper mode: the simulated market advances on the same stream.
        if let Some(paper) = self.broker.as_any().downcast_ref::<PaperBroker>() {
            paper.on_tick(&tick.symbol, tick.last_price);
        }

        if let Some(bar) = self.aggregator.on_tick(&tick) {
            info!(
                symbol = %bar.symbol,
                open = %bar.open,
                high = %bar.high,
                low = %bar.low,
                close = %bar.close,
                vwap = %bar.vwap_at_close,
                "[BAR] minute closed"
            );
            self.tracker.mark(&bar.symbol, bar.mid());
            let detector = self
                .detectors
                .entry(bar.symbol.clone())
                .or_insert_with(|| SwingDetector::new(bar.symbol.clone()));
            let swing_events = detector.on_bar_close(&bar);
            for event in swing_events {
                self.on_swing_event(event);
            }
        }

        self.evaluate_and_sync().await;
    }

    fn on_swing_event(&mut self, event: SwingEvent) {
        match &event {
            SwingEvent::Confirmed(Swing {
                symbol,
                kind,
                price,
                vwap_at_formation,
                ..
            }) => {
                info!(%symbol, ?kind, %price, "[SWING] confirmed");
                self.journal.append(JournalEvent::SwingConfirmed {
                    symbol: symbol.clone(),
                    kind: *kind,
                    price: *price,
                    vwap_at_formation: *vwap_at_formation,
                });
            }
            SwingEvent::Updated {
                symbol, kind, price, ..
            } => {
                info!(%symbol, ?kind, %price, "[SWING] updated in place");
                self.journal.append(JournalEvent::SwingUpdated {
                    symbol: symbol.clone(),
                    kind: *kind,
                    price: *price,
                });
            }
            SwingEvent::Broken {
                symbol,
                kind,
                price,
                breaking_price,
            } => {
                info!(%symbol, ?kind, %price, %breaking_price, "[SWING] level violated");
                self.journal.append(JournalEvent::SwingBroken {
                    symbol: symbol.clone(),
                    kind: *kind,
                    price: *price,
                    breaking_price: *breaking_price,
                });
            }
        }
        match self.filter.on_swing_event(&event) {
            Some(GateOutcome::Gated(candidate)) => {
                self.journal.append(JournalEvent::CandidateGated {
                    symbol: candidate.symbol.clone(),
                    side: candidate.side,
                    entry_price: candidate.entry_price,
                    vwap_at_formation: candidate.vwap_at_formation,
                });
            }
            Some(GateOutcome::Rejected {
                symbol,
                reason,
                removed_existing: true,
            }) => {
                self.journal.append(JournalEvent::CandidateDisqualified {
                    symbol,
                    reason: format!("replacement swing failed static gate: {reason}"),
                });
            }
            _ => {}
        }
    }

    async fn evaluate_and_sync(&mut self) {
        let busy = self.orders.busy_symbols();
        let best = self.filter.evaluate(&self.aggregator, &busy);
        for side in OptionSide::BOTH {
            let current = best.get(side).map(|c| c.symbol.clone());
            let previous = self.previous_best.entry(side).or_default();
            if *previous != current {
                match (previous.as_deref(), current.as_deref()) {
                    (Some(old), None) => {
                        info!(side = %side, symbol = %old, "[FILTER] best candidate disqualified");
                        self.journal.append(JournalEvent::CandidateDisqualified {
                            symbol: old.to_string(),
                            reason: "stop distance left the 2-10% band".into(),
                        });
                    }
                    (_, Some(new)) => {
                        info!(side = %side, symbol = %new, "[FILTER] best candidate selected");
                    }
                    _ => {}
                }
                *previous = current;
            }
        }

        let admission = if self.governor.is_halted() {
            Admission::default()
        } else {
            let pending_ce = usize::from(self.orders.pending(OptionSide::Ce).is_some());
            let pending_pe = usize::from(self.orders.pending(OptionSide::Pe).is_some());
            Admission {
                ce: self.governor.admits(&self.tracker, OptionSide::Ce, pending_pe),
                pe: self.governor.admits(&self.tracker, OptionSide::Pe, pending_ce),
            }
        };
        let events = self.orders.sync(self.broker.as_ref(), &best, admission).await;
        self.apply_exec_events(events).await;
    }

    async fn poll_orderbook(&mut self) {
        let events = self
            .orders
            .reconcile_orders(self.broker.as_ref(), &self.aggregator)
            .await;
        let had_closures = events.iter().any(|e| {
            matches!(
                e,
                ExecEvent::PositionClosed { .. } | ExecEvent::StopArmFailed { .. }
            )
        });
        self.apply_exec_events(events).await;
        if had_closures {
            self.run_risk_check().await;
        }
    }

    async fn reconcile_positions(&mut self) {
        let events = self
            .orders
            .reconcile_positions(self.broker.as_ref(), &self.aggregator, self.session_start)
            .await;
        self.apply_exec_events(events).await;
    }

    async fn apply_exec_events(&mut self, events: Vec<ExecEvent>) {
        for event in events {
            match event {
                ExecEvent::EntryPlaced {
                    side,
                    symbol,
                    order_id,
                    limit_price,
                    quantity,
                } => {
                    self.journal.append(JournalEvent::OrderPlaced {
                        symbol,
                        side,
                        order_id,
                        limit_price,
                        quantity,
                    });
                }
                ExecEvent::EntryModified {
                    symbol,
                    order_id,
                    limit_price,
                    ..
                } => {
                    self.journal.append(JournalEvent::OrderModified {
                        symbol,
                        order_id,
                        limit_price,
                    });
                }
                ExecEvent::EntryCancelled {
                    symbol,
                    order_id,
                    reason,
                    ..
                } => {
                    self.journal.append(JournalEvent::OrderCancelled {
                        symbol,
                        order_id,
                        reason,
                    });
                }
                ExecEvent::EntryRejected { side, symbol, reason } => {
                    self.alerts
                        .notify(
                            AlertKind::Broker,
                            "Entry rejected",
                            &format!("{side} entry on {symbol} rejected: {reason}"),
                        )
                        .await;
                }
                ExecEvent::PositionOpened {
                    position,
                    entry_order_id,
                    actual_r,
                } => {
                    self.on_position_opened(position, entry_order_id, actual_r).await;
                }
                ExecEvent::StopArmed {
                    symbol,
                    order_id,
                    trigger,
                    limit,
                    quantity,
                } => {
                    let side = OptionSymbol::parse(&symbol)
                        .map(|s| s.side)
                        .unwrap_or(OptionSide::Ce);
                    info!(%trigger, %limit, "[ORDER] protective stop journaled");
                    self.journal.append(JournalEvent::OrderPlaced {
                        symbol,
                        side,
                        order_id,
                        limit_price: limit,
                        quantity,
                    });
                }
                ExecEvent::StopArmFailed {
                    symbol,
                    consecutive_failures,
                } => {
                    self.alerts
                        .notify(
                            AlertKind::Critical,
                            "Protective stop failed",
                            &format!(
                                "{symbol} is open without a stop ({consecutive_failures} consecutive failures)"
                            ),
                        )
                        .await;
                }
                ExecEvent::StopReplaced { symbol, order_id } => {
                    self.alerts
                        .notify(
                            AlertKind::Critical,
                            "Protective stop re-placed",
                            &format!("Stop for {symbol} vanished at the broker; re-armed as {order_id}"),
                        )
                        .await;
                }
                ExecEvent::PositionClosed {
                    symbol,
                    side,
                    quantity,
                    entry_price,
                    exit_price,
                    reason,
                } => {
                    let r_multiple = self
                        .tracker
                        .on_closed(&symbol, exit_price, &reason)
                        .unwrap_or_default();
                    self.filter.remove(&symbol);
                    self.journal.append(JournalEvent::PositionClosed {
                        symbol: symbol.clone(),
                        side,
                        quantity,
                        entry_price,
                        exit_price,
                        r_multiple,
                        reason: reason.clone(),
                    });
                    self.alerts
                        .notify(
                            AlertKind::Trade,
                            "Position closed",
                            &format!(
                                "{symbol} x{quantity} covered at {exit_price} ({reason}); R={r_multiple}"
                            ),
                        )
                        .await;
                }
                ExecEvent::PositionAdopted {
                    symbol,
                    quantity,
                    avg_price,
                } => {
                    self.alerts
                        .notify(
                            AlertKind::Critical,
                            "Adopted broker position",
                            &format!("Unknown short {symbol} x{quantity} @ {avg_price} taken over"),
                        )
                        .await;
                }
                ExecEvent::AuthOutage => {
                    self.alerts
                        .notify(
                            AlertKind::Critical,
                            "Broker session lost",
                            "Placements suspended until the gateway session recovers.",
                        )
                        .await;
                }
            }
        }
    }

    async fn on_position_opened(
        &mut self,
        position: Position,
        entry_order_id: OrderId,
        actual_r: Price,
    ) {
        self.tracker.on_opened(&position);
        self.filter.remove(&position.symbol);
        self.journal.append(JournalEvent::OrderFilled {
            symbol: position.symbol.clone(),
            order_id: entry_order_id,
            price: position.entry_price,
            quantity: position.quantity,
        });
        self.journal.append(JournalEvent::PositionOpened {
            symbol: position.symbol.clone(),
            side: position.side,
            quantity: position.quantity,
            entry_price: position.entry_price,
            stop_trigger: position.stop_trigger,
        });
        self.alerts
            .notify(
                AlertKind::Trade,
                "Short entry filled",
                &format!(
                    "{} x{} @ {} (risk {} per full stop)",
                    position.symbol, position.quantity, position.entry_price, actual_r
                ),
            )
            .await;
    }

    async fn run_risk_check(&mut self) {
        let now = Utc::now();
        if let Some(reason) =
            self.governor
                .check(&self.tracker, self.orders.consecutive_stop_failures(), now)
        {
            self.execute_halt(reason).await;
        }
    }

    async fn execute_halt(&mut self, reason: HaltReason) {
        if self.halt_handled {
            return;
        }
        self.halt_handled = true;
        warn!(%reason, "[RISK] session halt, flattening");
        let mut events = self
            .orders
            .cancel_all_pending(self.broker.as_ref(), &reason.to_string())
            .await;
        events.extend(
            self.orders
                .flatten_all(self.broker.as_ref(), &reason.to_string())
                .await,
        );
        self.apply_exec_events(events).await;
        self.filter.clear();
        // Harvest the cover fills promptly rather than on the next poll.
        self.poll_orderbook_without_risk().await;
        let summary = self.tracker.summary();
        self.journal.append(JournalEvent::RiskHalt {
            reason: reason.to_string(),
            session_r: self.tracker.session_r(),
        });
        self.journal.append(JournalEvent::SessionSummary {
            summary: summary.clone(),
        });
        self.alerts
            .notify(
                AlertKind::Critical,
                "Session halted",
                &format!(
                    "{reason}: {} trades, {} wins, session R {}",
                    summary.trades, summary.wins, summary.session_r
                ),
            )
            .await;
    }

    async fn poll_orderbook_without_risk(&mut self) {
        let events = self
            .orders
            .reconcile_orders(self.broker.as_ref(), &self.aggregator)
            .await;
        self.apply_exec_events(events).await;
    }

    async fn announce_feed_event(&self, event: &FeedEvent) {
        match event {
            FeedEvent::FailedOver { idle_secs } => {
                self.alerts
                    .notify(
                        AlertKind::Feed,
                        "Feed failover",
                        &format!("Primary silent for {idle_secs}s; backup feed is active."),
                    )
                    .await;
            }
            FeedEvent::SwitchedBack { stable_secs } => {
                self.alerts
                    .notify(
                        AlertKind::Feed,
                        "Feed recovered",
                        &format!("Primary stable for {stable_secs}s; switched back."),
                    )
                    .await;
            }
        }
    }

    fn heartbeat(&self) {
        let now = Utc::now();
        let coverage = self.supervisor.coverage(
            self.symbols.len(),
            now,
            chrono::Duration::seconds(self.config.feed.max_tick_age_secs as i64),
        );
        info!(
            open_positions = self.tracker.open_count(None),
            session_r = %self.tracker.session_r(),
            coverage_pct = coverage * 100.0,
            dropped_ticks = self.aggregator.dropped_ticks(),
            active_source = ?self.supervisor.active(),
            "heartbeat"
        );
    }

    /// Returns true when the engine must abort.
    async fn run_watchdog(&mut self) -> bool {
        let now = Utc::now();
        if let Some(event) = self.supervisor.check_staleness(now) {
            self.announce_feed_event(&event).await;
        }
        if !self.clock.is_open(now) {
            return false;
        }
        let stale_window =
            chrono::Duration::seconds(self.config.feed.stale_data_timeout_secs as i64);
        let coverage = self.supervisor.coverage(
            self.symbols.len(),
            now,
            chrono::Duration::seconds(self.config.feed.max_tick_age_secs as i64),
        );
        let both_stale = self.supervisor.both_stale(now, stale_window);
        // Before the first tick, coverage is trivially zero; the both-stale
        // clock (anchored at startup) covers a feed that never connects.
        let coverage_low =
            self.supervisor.has_seen_data() && coverage < self.config.feed.min_coverage;
        if both_stale || coverage_low {
            error!(
                both_stale,
                coverage,
                "[RISK] data watchdog tripped, halting session"
            );
            self.alerts
                .notify(
                    AlertKind::Critical,
                    "Data watchdog tripped",
                    &format!(
                        "both_stale={both_stale} coverage={coverage:.0}; flattening and stopping"
                    ),
                )
                .await;
            self.governor.force_halt(HaltReason::DataStale);
            self.execute_halt(HaltReason::DataStale).await;
            return true;
        }
        false
    }

    async fn shutdown(mut self) {
        info!("engine shutdown sequence started");
        let timeout = Duration::from_secs(self.config.engine.shutdown_timeout_secs);
        let cleanup = async {
            let mut events = self
                .orders
                .cancel_all_pending(self.broker.as_ref(), "shutdown")
                .await;
            if self.clock.is_open(Utc::now()) && !self.governor.is_halted() {
                events.extend(self.orders.flatten_all(self.broker.as_ref(), "shutdown").await);
            }
            events.extend(
                self.orders
                    .reconcile_orders(self.broker.as_ref(), &self.aggregator)
                    .await,
            );
            events
        };
        match tokio::time::timeout(timeout, cleanup).await {
            Ok(events) => self.apply_exec_events(events).await,
            Err(_) => {
                error!("shutdown cleanup exceeded its deadline");
                self.alerts
                    .notify(
                        AlertKind::Critical,
                        "Shutdown incomplete",
                        "Order cleanup did not finish inside the shutdown window; check the broker book.",
                    )
                    .await;
            }
        }
        let summary = self.tracker.summary();
        info!(
            trades = summary.trades,
            session_r = %summary.session_r,
            "session summary"
        );
        self.journal
            .append(JournalEvent::SessionSummary { summary });
        self.journal.flush().await;
        info!("engine stopped");
    }
}

fn make_interval(secs: u64) -> tokio::time::Interval {
    let mut timer = interval(Duration::from_secs(secs.max(1)));
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}
