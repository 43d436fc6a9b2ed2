//! Order lifecycle management: the per-side pending-entry state machine,
//! protective stop arming, and reconciliation against the broker's books.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use premia_broker::{Broker, BrokerError, BrokerResult};
use premia_core::{
    BrokerOrder, BrokerOrderStatus, BrokerPosition, OptionSide, OptionSymbol, OrderId,
    OrderRequest, Position, PositionStatus, Price, Qty, Side, Symbol,
};
use premia_strategy::{BestPerSide, DynamicCandidate, MarketView};

/// Knobs for order placement and maintenance.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OrderConfig {
    /// Exchange tick; the entry rests one tick under the swing.
    pub tick_size: Price,
    /// Limit-price churn below this is suppressed.
    pub modification_threshold: Price,
    pub max_retries: u32,
    #[serde(with = "humantime_millis")]
    pub retry_delay: Duration,
    /// Protective stop limit sits this far above its trigger.
    pub stop_limit_offset: Price,
    /// Rupee buffer over the highest high when re-deriving a stop trigger.
    pub sl_buffer: Price,
    /// Skip placements whose estimated margin exceeds available funds.
    pub margin_check: bool,
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            tick_size: Decimal::new(5, 2),
            modification_threshold: Decimal::ONE,
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
            stop_limit_offset: Decimal::from(3),
            sl_buffer: Decimal::ONE,
            margin_check: true,
        }
    }
}

mod humantime_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(de)?))
    }
}

/// Which sides the risk governor currently admits new entries for.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Admission {
    pub ce: bool,
    pub pe: bool,
}

impl Admission {
    #[must_use]
    pub fn all() -> Self {
        Self { ce: true, pe: true }
    }

    #[must_use]
    pub fn get(&self, side: OptionSide) -> bool {
        match side {
            OptionSide::Ce => self.ce,
            OptionSide::Pe => self.pe,
        }
    }
}

/// A resting entry order for one option side.
#[derive(Clone, Debug)]
pub struct PendingEntry {
    pub side: OptionSide,
    pub symbol: Symbol,
    pub order_id: OrderId,
    pub limit_price: Price,
    pub quantity: Qty,
    pub candidate: DynamicCandidate,
    pub placed_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
struct StopRecord {
    order_id: OrderId,
    trigger: Price,
    limit: Price,
    quantity: Qty,
}

/// State transitions surfaced to the coordinator for journaling, risk
/// accounting and notification.
#[derive(Clone, Debug)]
pub enum ExecEvent {
    EntryPlaced {
        side: OptionSide,
        symbol: Symbol,
        order_id: OrderId,
        limit_price: Price,
        quantity: Qty,
    },
    EntryModified {
        side: OptionSide,
        symbol: Symbol,
        order_id: OrderId,
        limit_price: Price,
    },
    EntryCancelled {
        side: OptionSide,
        symbol: Symbol,
        order_id: OrderId,
        reason: String,
    },
    EntryRejected {
        side: OptionSide,
        symbol: Symbol,
        reason: String,
    },
    PositionOpened {
        position: Position,
        entry_order_id: OrderId,
        actual_r: Price,
    },
    StopArmed {
        symbol: Symbol,
        order_id: OrderId,
        trigger: Price,
        limit: Price,
        quantity: Qty,
    },
    /// Critical: an open position is running without its stop.
    StopArmFailed {
        symbol: Symbol,
        consecutive_failures: u32,
    },
    StopReplaced {
        symbol: Symbol,
        order_id: OrderId,
    },
    PositionClosed {
        symbol: Symbol,
        side: OptionSide,
        quantity: Qty,
        entry_price: Price,
        exit_price: Price,
        reason: String,
    },
    PositionAdopted {
        symbol: Symbol,
        quantity: Qty,
        avg_price: Price,
    },
    AuthOutage,
}

/// Owns pending entries, protective stops and the engine's position records.
pub struct OrderManager {
    config: OrderConfig,
    pending: HashMap<OptionSide, PendingEntry>,
    stops: HashMap<Symbol, StopRecord>,
    covers: HashMap<OrderId, Symbol>,
    positions: HashMap<Symbol, Position>,
    processed_fills: HashSet<OrderId>,
    consecutive_stop_failures: u32,
    auth_outage: bool,
}

impl OrderManager {
    #[must_use]
    pub fn new(config: OrderConfig) -> Self {
        Self {
            config,
            pending: HashMap::new(),
            stops: HashMap::new(),
            covers: HashMap::new(),
            positions: HashMap::new(),
            processed_fills: HashSet::new(),
            consecutive_stop_failures: 0,
            auth_outage: false,
        }
    }

    #[must_use]
    pub fn pending(&self, side: OptionSide) -> Option<&PendingEntry> {
        self.pending.get(&side)
    }

    #[must_use]
    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    #[must_use]
    pub fn open_position_count(&self, side: Option<OptionSide>) -> usize {
        self.positions
            .values()
            .filter(|p| {
                matches!(p.status, PositionStatus::Active | PositionStatus::Degraded)
                    && side.map_or(true, |s| p.side == s)
            })
            .count()
    }

    /// Symbols with an open (or closing) position. These never re-nominate;
    /// a symbol with a merely resting entry keeps nominating so the diff
    /// can hold or migrate that order.
    #[must_use]
    pub fn busy_symbols(&self) -> HashSet<Symbol> {
        self.positions
            .values()
            .filter(|p| p.status != PositionStatus::Closed)
            .map(|p| p.symbol.clone())
            .collect()
    }

    #[must_use]
    pub fn consecutive_stop_failures(&self) -> u32 {
        self.consecutive_stop_failures
    }

    #[must_use]
    pub fn auth_outage(&self) -> bool {
        self.auth_outage
    }

    /// Diff both sides against the filter's current best and converge the
    /// broker state towards it.
    pub async fn sync(
        &mut self,
        broker: &dyn Broker,
        best: &BestPerSide,
        admission: Admission,
    ) -> Vec<ExecEvent> {
        let mut events = Vec::new();
        for side in OptionSide::BOTH {
            let target = if admission.get(side) {
                best.get(side).cloned()
            } else {
                None
            };
            self.sync_side(broker, side, target, &mut events).await;
        }
        events
    }

    async fn sync_side(
        &mut self,
        broker: &dyn Broker,
        side: OptionSide,
        target: Option<DynamicCandidate>,
        events: &mut Vec<ExecEvent>,
    ) {
        match (self.pending.contains_key(&side), target) {
            (false, None) => {}
            (false, Some(candidate)) => {
                self.place_entry(broker, side, candidate, events).await;
            }
            (true, None) => {
                self.cancel_entry(broker, side, "no qualifying candidate", events)
                    .await;
            }
            (true, Some(candidate)) => {
                let pending = self.pending.get(&side).expect("checked above");
                let limit_price = candidate.entry_price - self.config.tick_size;
                if pending.symbol == candidate.symbol {
                    let delta = (pending.limit_price - limit_price).abs();
                    if delta > self.config.modification_threshold {
                        self.modify_entry(broker, side, limit_price, events).await;
                    }
                } else {
                    // Replace: never leave two live entries on one side, so
                    // the cancel must be confirmed before the new placement.
                    let replaced = self
                        .cancel_entry(broker, side, "better candidate on side", events)
                        .await;
                    if replaced {
                        self.place_entry(broker, side, candidate, events).await;
                    }
                }
            }
        }
    }

    async fn place_entry(
        &mut self,
        broker: &dyn Broker,
        side: OptionSide,
        candidate: DynamicCandidate,
        events: &mut Vec<ExecEvent>,
    ) {
        if self.auth_outage {
            return;
        }
        let limit_price = candidate.entry_price - self.config.tick_size;
        if self.config.margin_check {
            match broker.funds().await {
                Ok(funds) => {
                    let required = candidate.entry_price * Decimal::from(candidate.quantity);
                    if funds < required {
                        warn!(
                            symbol = %candidate.symbol,
                            %funds,
                            %required,
                            "[ORDER] insufficient margin, skipping placement"
                        );
                        return;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "[ORDER] margin check failed, proceeding unverified");
                }
            }
        }
        let request =
            OrderRequest::limit(candidate.symbol.clone(), Side::Sell, limit_price, candidate.quantity);
        match self.submit_with_retry(broker, &request).await {
            Ok(order_id) => {
                info!(
                    side = %side,
                    symbol = %candidate.symbol,
                    %order_id,
                    limit = %limit_price,
                    qty = candidate.quantity,
                    "[ORDER] entry placed"
                );
                events.push(ExecEvent::EntryPlaced {
                    side,
                    symbol: candidate.symbol.clone(),
                    order_id: order_id.clone(),
                    limit_price,
                    quantity: candidate.quantity,
                });
                self.pending.insert(
                    side,
                    PendingEntry {
                        side,
                        symbol: candidate.symbol.clone(),
                        order_id,
                        limit_price,
                        quantity: candidate.quantity,
                        candidate,
                        placed_at: Utc::now(),
                    },
                );
            }
            Err(err) => {
                self.note_auth(&err, events);
                error!(side = %side, symbol = %candidate.symbol, error = %err, "[ORDER] entry placement failed");
                events.push(ExecEvent::EntryRejected {
                    side,
                    symbol: candidate.symbol,
                    reason: err.to_string(),
                });
            }
        }
    }

    async fn modify_entry(
        &mut self,
        broker: &dyn Broker,
        side: OptionSide,
        limit_price: Price,
        events: &mut Vec<ExecEvent>,
    ) {
        let Some(pending) = self.pending.get_mut(&side) else {
            return;
        };
        match broker
            .modify(&pending.order_id, Some(limit_price), None)
            .await
        {
            Ok(()) => {
                info!(
                    side = %side,
                    symbol = %pending.symbol,
                    order_id = %pending.order_id,
                    limit = %limit_price,
                    "[ORDER] entry modified"
                );
                pending.limit_price = limit_price;
                events.push(ExecEvent::EntryModified {
                    side,
                    symbol: pending.symbol.clone(),
                    order_id: pending.order_id.clone(),
                    limit_price,
                });
            }
            Err(err) => {
                warn!(side = %side, error = %err, "[ORDER] modify failed, keeping resting price");
                self.note_auth(&err, events);
            }
        }
    }

    /// Cancel the side's pending entry. Returns true once the slot is clear.
    async fn cancel_entry(
        &mut self,
        broker: &dyn Broker,
        side: OptionSide,
        reason: &str,
        events: &mut Vec<ExecEvent>,
    ) -> bool {
        let Some(pending) = self.pending.get(&side).cloned() else {
            return true;
        };
        match broker.cancel(&pending.order_id).await {
            Ok(()) => {
                info!(
                    side = %side,
                    symbol = %pending.symbol,
                    order_id = %pending.order_id,
                    %reason,
                    "[ORDER] entry cancelled"
                );
                self.pending.remove(&side);
                events.push(ExecEvent::EntryCancelled {
                    side,
                    symbol: pending.symbol,
                    order_id: pending.order_id,
                    reason: reason.to_string(),
                });
                true
            }
            Err(err) => {
                self.note_auth(&err, events);
                // The order may have gone terminal under us; the slot only
                // clears once the book confirms it is not open.
                warn!(side = %side, error = %err, "[ORDER] cancel errored, verifying against book");
                match self.verify_not_open(broker, &pending.order_id).await {
                    Some(order) if order.status == BrokerOrderStatus::Complete => {
                        // Raced a fill; route it through normal fill handling
                        // on the next reconcile pass.
                        warn!(order_id = %pending.order_id, "[ORDER] cancel raced a fill");
                        false
                    }
                    Some(order) if order.status == BrokerOrderStatus::Open => false,
                    _ => {
                        self.pending.remove(&side);
                        events.push(ExecEvent::EntryCancelled {
                            side,
                            symbol: pending.symbol,
                            order_id: pending.order_id,
                            reason: format!("{reason} (confirmed gone after cancel error)"),
                        });
                        true
                    }
                }
            }
        }
    }

    async fn verify_not_open(&self, broker: &dyn Broker, order_id: &str) -> Option<BrokerOrder> {
        for _ in 0..self.config.max_retries {
            match broker.orderbook().await {
                Ok(book) => {
                    return book.into_iter().find(|o| o.order_id == order_id);
                }
                Err(err) => {
                    warn!(error = %err, "[ORDER] orderbook fetch failed during cancel verify");
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        }
        None
    }

    async fn submit_with_retry(
        &self,
        broker: &dyn Broker,
        request: &OrderRequest,
    ) -> BrokerResult<OrderId> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match broker.place(request).await {
                Ok(order_id) => return Ok(order_id),
                Err(err) if err.is_transient() && attempt < self.config.max_retries => {
                    warn!(
                        symbol = %request.symbol,
                        attempt,
                        error = %err,
                        "[ORDER] transient placement failure, retrying"
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn note_auth(&mut self, err: &BrokerError, events: &mut Vec<ExecEvent>) {
        if err.is_auth() && !self.auth_outage {
            self.auth_outage = true;
            error!("[ORDER] broker session lost, suspending placements");
            events.push(ExecEvent::AuthOutage);
        }
    }

    /// Poll the order book and converge local state: fills open positions
    /// and arm stops, terminal entries clear their slot, vanished stops are
    /// re-placed.
    pub async fn reconcile_orders(
        &mut self,
        broker: &dyn Broker,
        market: &dyn MarketView,
    ) -> Vec<ExecEvent> {
        let mut events = Vec::new();
        let book = match broker.orderbook().await {
            Ok(book) => {
                self.auth_outage = false;
                book
            }
            Err(err) => {
                self.note_auth(&err, &mut events);
                warn!(error = %err, "[RECONCILE] orderbook poll failed");
                return events;
            }
        };
        let by_id: HashMap<&str, &BrokerOrder> =
            book.iter().map(|o| (o.order_id.as_str(), o)).collect();

        // Pending entries.
        for side in OptionSide::BOTH {
            let Some(pending) = self.pending.get(&side).cloned() else {
                continue;
            };
            match by_id.get(pending.order_id.as_str()) {
                None => {
                    warn!(
                        side = %side,
                        order_id = %pending.order_id,
                        "[RECONCILE] entry missing from book, treating as cancelled"
                    );
                    self.pending.remove(&side);
                    events.push(ExecEvent::EntryCancelled {
                        side,
                        symbol: pending.symbol,
                        order_id: pending.order_id,
                        reason: "missing from broker book".into(),
                    });
                }
                Some(order) => match order.status {
                    BrokerOrderStatus::Open => {}
                    BrokerOrderStatus::Complete => {
                        self.pending.remove(&side);
                        self.handle_entry_fill(broker, market, &pending, order, &mut events)
                            .await;
                    }
                    BrokerOrderStatus::Rejected | BrokerOrderStatus::Cancelled => {
                        warn!(
                            side = %side,
                            order_id = %pending.order_id,
                            status = ?order.status,
                            "[RECONCILE] entry went terminal without fill"
                        );
                        self.pending.remove(&side);
                        events.push(ExecEvent::EntryCancelled {
                            side,
                            symbol: pending.symbol,
                            order_id: pending.order_id,
                            reason: format!("{:?} at broker", order.status),
                        });
                    }
                },
            }
        }

        // Protective stops.
        let stop_symbols: Vec<Symbol> = self.stops.keys().cloned().collect();
        for symbol in stop_symbols {
            let record = self.stops.get(&symbol).cloned().expect("stop exists");
            match by_id.get(record.order_id.as_str()) {
                Some(order) if order.status == BrokerOrderStatus::Open => {}
                Some(order) if order.status == BrokerOrderStatus::Complete => {
                    self.stops.remove(&symbol);
                    let exit_price = order.avg_price.unwrap_or(record.limit);
                    self.close_position(&symbol, exit_price, "protective stop filled", &mut events);
                }
                _ => {
                    // Missing or cancelled while the position is open: the
                    // position is naked. Re-place immediately.
                    if self
                        .positions
                        .get(&symbol)
                        .map_or(false, |p| p.status != PositionStatus::Closed)
                    {
                        error!(%symbol, "[RECONCILE] protective stop vanished, re-placing");
                        self.stops.remove(&symbol);
                        self.arm_stop(broker, &symbol, record.trigger, record.quantity, &mut events)
                            .await;
                        if let Some(record) = self.stops.get(&symbol) {
                            events.push(ExecEvent::StopReplaced {
                                symbol: symbol.clone(),
                                order_id: record.order_id.clone(),
                            });
                        }
                    } else {
                        self.stops.remove(&symbol);
                    }
                }
            }
        }

        // Market covers issued by flattening.
        let cover_ids: Vec<OrderId> = self.covers.keys().cloned().collect();
        for order_id in cover_ids {
            let Some(order) = by_id.get(order_id.as_str()) else {
                continue;
            };
            if order.status == BrokerOrderStatus::Complete {
                let symbol = self.covers.remove(&order_id).expect("cover tracked");
                let exit_price = order.avg_price.unwrap_or(Decimal::ZERO);
                self.close_position(&symbol, exit_price, "market cover filled", &mut events);
            } else if order.status.is_terminal() {
                let symbol = self.covers.remove(&order_id).expect("cover tracked");
                error!(%symbol, order_id = %order_id, status = ?order.status, "[RECONCILE] cover order failed");
            }
        }

        events
    }

    async fn handle_entry_fill(
        &mut self,
        broker: &dyn Broker,
        market: &dyn MarketView,
        pending: &PendingEntry,
        order: &BrokerOrder,
        events: &mut Vec<ExecEvent>,
    ) {
        if !self.processed_fills.insert(pending.order_id.clone()) {
            return;
        }
        let quantity = if order.filled_quantity > 0 {
            order.filled_quantity
        } else {
            pending.quantity
        };
        let entry_price = order.avg_price.unwrap_or(pending.limit_price);
        // Refresh the stop off the live highest high; the resting candidate
        // may be minutes old. Never let it drop below the placed trigger.
        let live_trigger = market
            .highest_high_since(&pending.symbol, pending.candidate.swing_minute)
            .map(|hh| hh + self.config.sl_buffer);
        let trigger = live_trigger
            .map(|t| t.max(pending.candidate.sl_trigger))
            .unwrap_or(pending.candidate.sl_trigger);
        info!(
            side = %pending.side,
            symbol = %pending.symbol,
            %entry_price,
            qty = quantity,
            "[FILL] entry complete"
        );
        let mut position = Position {
            symbol: pending.symbol.clone(),
            side: pending.side,
            quantity,
            entry_price,
            entry_ts: Utc::now(),
            stop_order_id: None,
            stop_trigger: trigger,
            status: PositionStatus::Active,
            exit_price: None,
            r_multiple: None,
        };
        let armed = self
            .arm_stop(broker, &pending.symbol, trigger, quantity, events)
            .await;
        if let Some(order_id) = armed {
            position.stop_order_id = Some(order_id);
        } else {
            position.status = PositionStatus::Degraded;
        }
        events.push(ExecEvent::PositionOpened {
            position: position.clone(),
            entry_order_id: pending.order_id.clone(),
            actual_r: pending.candidate.actual_r,
        });
        self.positions.insert(pending.symbol.clone(), position);
    }

    async fn arm_stop(
        &mut self,
        broker: &dyn Broker,
        symbol: &str,
        trigger: Price,
        quantity: Qty,
        events: &mut Vec<ExecEvent>,
    ) -> Option<OrderId> {
        let limit = trigger + self.config.stop_limit_offset;
        let request = OrderRequest::stop_limit(symbol, Side::Buy, trigger, limit, quantity);
        match self.submit_with_retry(broker, &request).await {
            Ok(order_id) => {
                info!(%symbol, %order_id, %trigger, %limit, "[ORDER] protective stop armed");
                self.stops.insert(
                    symbol.to_string(),
                    StopRecord {
                        order_id: order_id.clone(),
                        trigger,
                        limit,
                        quantity,
                    },
                );
                self.consecutive_stop_failures = 0;
                events.push(ExecEvent::StopArmed {
                    symbol: symbol.to_string(),
                    order_id: order_id.clone(),
                    trigger,
                    limit,
                    quantity,
                });
                Some(order_id)
            }
            Err(err) => {
                self.consecutive_stop_failures += 1;
                self.note_auth(&err, events);
                error!(
                    %symbol,
                    error = %err,
                    failures = self.consecutive_stop_failures,
                    "[ORDER] protective stop placement failed"
                );
                events.push(ExecEvent::StopArmFailed {
                    symbol: symbol.to_string(),
                    consecutive_failures: self.consecutive_stop_failures,
                });
                None
            }
        }
    }

    fn close_position(
        &mut self,
        symbol: &str,
        exit_price: Price,
        reason: &str,
        events: &mut Vec<ExecEvent>,
    ) {
        let Some(position) = self.positions.get_mut(symbol) else {
            return;
        };
        if position.status == PositionStatus::Closed {
            return;
        }
        position.status = PositionStatus::Closed;
        position.exit_price = Some(exit_price);
        info!(
            %symbol,
            %exit_price,
            %reason,
            "[EXIT] position closed"
        );
        events.push(ExecEvent::PositionClosed {
            symbol: symbol.to_string(),
            side: position.side,
            quantity: position.quantity,
            entry_price: position.entry_price,
            exit_price,
            reason: reason.to_string(),
        });
    }

    /// Position-book reconciliation; the broker is authoritative for
    /// existence. Internally known positions missing at the broker close
    /// out; unknown short positions are adopted under a synthetic stop.
    pub async fn reconcile_positions(
        &mut self,
        broker: &dyn Broker,
        market: &dyn MarketView,
        session_start: DateTime<Utc>,
    ) -> Vec<ExecEvent> {
        let mut events = Vec::new();
        let book = match broker.positionbook().await {
            Ok(book) => book,
            Err(err) => {
                self.note_auth(&err, &mut events);
                warn!(error = %err, "[RECONCILE] positionbook poll failed");
                return events;
            }
        };
        let broker_shorts: HashMap<&str, &BrokerPosition> = book
            .iter()
            .filter(|p| p.quantity < 0)
            .map(|p| (p.symbol.as_str(), p))
            .collect();

        // Vanished positions: closed behind our back (stop filled during an
        // outage, manual intervention). Infer the exit from the stop order.
        let open_symbols: Vec<Symbol> = self
            .positions
            .iter()
            .filter(|(_, p)| {
                matches!(
                    p.status,
                    PositionStatus::Active | PositionStatus::Degraded | PositionStatus::Closing
                )
            })
            .map(|(s, _)| s.clone())
            .collect();
        for symbol in open_symbols {
            if broker_shorts.contains_key(symbol.as_str()) {
                continue;
            }
            let exit_price = match self.stop_exit_price(broker, &symbol).await {
                Some(price) => price,
                None => self
                    .positions
                    .get(&symbol)
                    .map(|p| p.entry_price)
                    .unwrap_or_default(),
            };
            warn!(%symbol, "[RECONCILE] position missing at broker, closing internally");
            if let Some(record) = self.stops.remove(&symbol) {
                let _ = broker.cancel(&record.order_id).await;
            }
            self.close_position(&symbol, exit_price, "missing at broker", &mut events);
        }

        // Adopted positions: the broker says we are short something we do
        // not know about. Take it over and protect it.
        for (symbol, broker_position) in broker_shorts {
            let known = self
                .positions
                .get(symbol)
                .map_or(false, |p| p.status != PositionStatus::Closed);
            if known {
                continue;
            }
            let quantity = broker_position.quantity.unsigned_abs() as i64;
            warn!(
                %symbol,
                qty = quantity,
                "[RECONCILE] adopting unknown broker position"
            );
            let trigger = market
                .highest_high_since(symbol, session_start)
                .unwrap_or(broker_position.avg_price)
                + self.config.sl_buffer;
            let side = OptionSymbol::parse(symbol)
                .map(|s| s.side)
                .unwrap_or(OptionSide::Ce);
            let mut position = Position {
                symbol: symbol.to_string(),
                side,
                quantity,
                entry_price: broker_position.avg_price,
                entry_ts: Utc::now(),
                stop_order_id: None,
                stop_trigger: trigger,
                status: PositionStatus::Active,
                exit_price: None,
                r_multiple: None,
            };
            if !self.stops.contains_key(symbol) {
                if let Some(order_id) = self
                    .arm_stop(broker, symbol, trigger, quantity, &mut events)
                    .await
                {
                    position.stop_order_id = Some(order_id);
                } else {
                    position.status = PositionStatus::Degraded;
                }
            }
            events.push(ExecEvent::PositionAdopted {
                symbol: symbol.to_string(),
                quantity,
                avg_price: broker_position.avg_price,
            });
            self.positions.insert(symbol.to_string(), position);
        }

        events
    }

    async fn stop_exit_price(&self, broker: &dyn Broker, symbol: &str) -> Option<Price> {
        let record = self.stops.get(symbol)?;
        let book = broker.orderbook().await.ok()?;
        book.into_iter()
            .find(|o| o.order_id == record.order_id && o.status == BrokerOrderStatus::Complete)
            .and_then(|o| o.avg_price)
    }

    /// Cancel both pending entries (risk halt, cutoff, shutdown).
    pub async fn cancel_all_pending(&mut self, broker: &dyn Broker, reason: &str) -> Vec<ExecEvent> {
        let mut events = Vec::new();
        for side in OptionSide::BOTH {
            self.cancel_entry(broker, side, reason, &mut events).await;
        }
        events
    }

    /// Market-cover every open position after pulling its stop.
    pub async fn flatten_all(&mut self, broker: &dyn Broker, reason: &str) -> Vec<ExecEvent> {
        let mut events = Vec::new();
        let open: Vec<(Symbol, Qty)> = self
            .positions
            .iter()
            .filter(|(_, p)| {
                matches!(p.status, PositionStatus::Active | PositionStatus::Degraded)
            })
            .map(|(s, p)| (s.clone(), p.quantity))
            .collect();
        for (symbol, quantity) in open {
            if let Some(record) = self.stops.remove(&symbol) {
                if let Err(err) = broker.cancel(&record.order_id).await {
                    warn!(%symbol, error = %err, "[EXIT] stop cancel failed before cover");
                }
            }
            let request = OrderRequest::market(symbol.clone(), Side::Buy, quantity);
            match self.submit_with_retry(broker, &request).await {
                Ok(order_id) => {
                    info!(%symbol, %order_id, %reason, "[EXIT] market cover submitted");
                    if let Some(position) = self.positions.get_mut(&symbol) {
                        position.status = PositionStatus::Closing;
                    }
                    self.covers.insert(order_id, symbol);
                }
                Err(err) => {
                    self.note_auth(&err, &mut events);
                    error!(%symbol, error = %err, "[EXIT] market cover failed");
                }
            }
        }
        events
    }
}
