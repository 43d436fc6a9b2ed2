//! In-memory broker used for paper trading and tests.
//!
//! Orders rest until the simulated market trades through them:
//! - SELL limits fill at the limit once a trade prints at or below it (the
//!   entry flow: the order sits one tick under a swing low and a break
//!   fills it at a known price);
//! - BUY stop-limits fill once a trade prints at or above the trigger;
//! - markets fill immediately at the last traded price.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{debug, info};
use uuid::Uuid;

use premia_core::{
    BrokerOrder, BrokerOrderStatus, BrokerPosition, OrderId, OrderRequest, OrderType, Price, Side,
    Symbol,
};

use crate::{Broker, BrokerError, BrokerResult};

#[derive(Default)]
struct PaperState {
    orders: HashMap<OrderId, BrokerOrder>,
    order_sequence: Vec<OrderId>,
    positions: HashMap<Symbol, BrokerPosition>,
    last_prices: HashMap<Symbol, Price>,
}

impl PaperState {
    fn apply_fill(&mut self, symbol: &str, side: Side, quantity: i64, price: Price) {
        let entry = self
            .positions
            .entry(symbol.to_string())
            .or_insert_with(|| BrokerPosition {
                symbol: symbol.to_string(),
                quantity: 0,
                avg_price: Decimal::ZERO,
            });
        let signed = match side {
            Side::Buy => quantity,
            Side::Sell => -quantity,
        };
        let prev_qty = entry.quantity;
        let new_qty = prev_qty + signed;
        // Average price only tracks the opening direction; flips restart it.
        if prev_qty == 0 || prev_qty.signum() == signed.signum() {
            let prev_notional = entry.avg_price * Decimal::from(prev_qty.abs());
            let add_notional = price * Decimal::from(quantity);
            let total = prev_qty.abs() + quantity;
            if total > 0 {
                entry.avg_price = (prev_notional + add_notional) / Decimal::from(total);
            }
        } else if new_qty != 0 && prev_qty.signum() != new_qty.signum() {
            entry.avg_price = price;
        }
        entry.quantity = new_qty;
        if entry.quantity == 0 {
            self.positions.remove(symbol);
        }
    }

    fn try_fill(order: &mut BrokerOrder, traded: Price) -> Option<(Side, i64, Price)> {
        if order.status != BrokerOrderStatus::Open {
            return None;
        }
        let fill_price = match (order.side, order.trigger_price, order.price) {
            // Resting sell: a print at or below the limit crosses it.
            (Side::Sell, None, Some(limit)) if traded <= limit => limit,
            // Protective buy stop-limit: trigger at or below the print arms
            // it; fill capped at the limit.
            (Side::Buy, Some(trigger), Some(limit)) if traded >= trigger => traded.min(limit),
            (Side::Buy, None, Some(limit)) if traded <= limit => limit,
            _ => return None,
        };
        order.status = BrokerOrderStatus::Complete;
        order.filled_quantity = order.quantity;
        order.avg_price = Some(fill_price);
        Some((order.side, order.quantity, fill_price))
    }
}

/// Simulated broker backed by the live tick stream.
pub struct PaperBroker {
    state: Mutex<PaperState>,
    starting_cash: Price,
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new(Decimal::from(1_000_000))
    }
}

impl PaperBroker {
    #[must_use]
    pub fn new(starting_cash: Price) -> Self {
        Self {
            state: Mutex::new(PaperState::default()),
            starting_cash,
        }
    }

    /// Advance the simulated market. Resting orders that the trade crosses
    /// complete at their resting price.
    pub fn on_tick(&self, symbol: &str, price: Price) {
        let mut state = self.state.lock().expect("paper state lock");
        state.last_prices.insert(symbol.to_string(), price);
        let ids: Vec<OrderId> = state.order_sequence.clone();
        for id in ids {
            let Some(order) = state.orders.get_mut(&id) else {
                continue;
            };
            if order.symbol != symbol {
                continue;
            }
            if let Some((side, qty, fill_price)) = PaperState::try_fill(order, price) {
                info!(order_id = %id, %symbol, %fill_price, "paper order filled");
                state.apply_fill(symbol, side, qty, fill_price);
            }
        }
    }

    /// Force a position into the book, bypassing order flow. Test hook for
    /// reconciliation paths.
    pub fn seed_position(&self, symbol: &str, quantity: i64, avg_price: Price) {
        let mut state = self.state.lock().expect("paper state lock");
        state.positions.insert(
            symbol.to_string(),
            BrokerPosition {
                symbol: symbol.to_string(),
                quantity,
                avg_price,
            },
        );
    }
}

#[async_trait]
impl Broker for PaperBroker {
    fn name(&self) -> &str {
        "paper"
    }

    async fn place(&self, request: &OrderRequest) -> BrokerResult<OrderId> {
        if request.quantity <= 0 {
            return Err(BrokerError::Permanent("non-positive quantity".into()));
        }
        if matches!(request.order_type, OrderType::Limit) && request.price.is_none() {
            return Err(BrokerError::Permanent("limit order without price".into()));
        }
        if matches!(request.order_type, OrderType::StopLimit)
            && (request.price.is_none() || request.trigger_price.is_none())
        {
            return Err(BrokerError::Permanent(
                "stop-limit order without trigger/limit".into(),
            ));
        }
        let id = Uuid::new_v4().to_string();
        let mut state = self.state.lock().expect("paper state lock");
        let last = state.last_prices.get(&request.symbol).copied();
        let mut order = BrokerOrder {
            order_id: id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            status: BrokerOrderStatus::Open,
            quantity: request.quantity,
            filled_quantity: 0,
            price: request.price,
            trigger_price: request.trigger_price,
            avg_price: None,
        };
        match request.order_type {
            OrderType::Market => {
                let fill_price = last.ok_or_else(|| {
                    BrokerError::Permanent(format!("no market price for {}", request.symbol))
                })?;
                order.status = BrokerOrderStatus::Complete;
                order.filled_quantity = order.quantity;
                order.avg_price = Some(fill_price);
                state.apply_fill(&request.symbol, request.side, request.quantity, fill_price);
                info!(order_id = %id, symbol = %request.symbol, %fill_price, "paper market order filled");
            }
            OrderType::Limit | OrderType::StopLimit => {
                // A marketable order fills against the last print right away.
                if let Some(traded) = last {
                    if let Some((side, qty, fill_price)) = PaperState::try_fill(&mut order, traded)
                    {
                        state.apply_fill(&request.symbol, side, qty, fill_price);
                        debug!(order_id = %id, symbol = %request.symbol, "paper order marketable at placement");
                    }
                }
            }
        }
        state.order_sequence.push(id.clone());
        state.orders.insert(id.clone(), order);
        Ok(id)
    }

    async fn modify(
        &self,
        order_id: &str,
        price: Option<Price>,
        trigger: Option<Price>,
    ) -> BrokerResult<()> {
        let mut state = self.state.lock().expect("paper state lock");
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| BrokerError::Permanent(format!("unknown order {order_id}")))?;
        if order.status.is_terminal() {
            return Err(BrokerError::Permanent(format!(
                "order {order_id} already {:?}",
                order.status
            )));
        }
        if let Some(price) = price {
            order.price = Some(price);
        }
        if let Some(trigger) = trigger {
            order.trigger_price = Some(trigger);
        }
        Ok(())
    }

    async fn cancel(&self, order_id: &str) -> BrokerResult<()> {
        let mut state = self.state.lock().expect("paper state lock");
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| BrokerError::Permanent(format!("unknown order {order_id}")))?;
        if order.status.is_terminal() {
            return Err(BrokerError::Permanent(format!(
                "order {order_id} already {:?}",
                order.status
            )));
        }
        order.status = BrokerOrderStatus::Cancelled;
        Ok(())
    }

    async fn orderbook(&self) -> BrokerResult<Vec<BrokerOrder>> {
        let state = self.state.lock().expect("paper state lock");
        Ok(state
            .order_sequence
            .iter()
            .filter_map(|id| state.orders.get(id).cloned())
            .collect())
    }

    async fn positionbook(&self) -> BrokerResult<Vec<BrokerPosition>> {
        let state = self.state.lock().expect("paper state lock");
        let mut book: Vec<BrokerPosition> = state.positions.values().cloned().collect();
        book.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(book)
    }

    async fn funds(&self) -> BrokerResult<Price> {
        Ok(self.starting_cash)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SYMBOL: &str = "NIFTY06FEB2624200CE";

    fn dec(units: i64, cents: u32) -> Decimal {
        Decimal::new(units * 100 + i64::from(cents), 2)
    }

    #[tokio::test]
    async fn sell_limit_rests_until_break() {
        let broker = PaperBroker::default();
        broker.on_tick(SYMBOL, dec(130, 10));
        let id = broker
            .place(&OrderRequest::limit(SYMBOL, Side::Sell, dec(129, 95), 585))
            .await
            .unwrap();
        let book = broker.orderbook().await.unwrap();
        assert_eq!(book[0].status, BrokerOrderStatus::Open);

        broker.on_tick(SYMBOL, dec(129, 90));
        let book = broker.orderbook().await.unwrap();
        let order = book.iter().find(|o| o.order_id == id).unwrap();
        assert_eq!(order.status, BrokerOrderStatus::Complete);
        assert_eq!(order.avg_price, Some(dec(129, 95)));

        let positions = broker.positionbook().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, -585);
    }

    #[tokio::test]
    async fn buy_stop_limit_triggers_above() {
        let broker = PaperBroker::default();
        broker.on_tick(SYMBOL, dec(130, 0));
        broker
            .place(&OrderRequest::limit(SYMBOL, Side::Sell, dec(129, 95), 65))
            .await
            .unwrap();
        broker.on_tick(SYMBOL, dec(129, 0));
        let stop_id = broker
            .place(&OrderRequest::stop_limit(
                SYMBOL,
                Side::Buy,
                dec(141, 0),
                dec(144, 0),
                65,
            ))
            .await
            .unwrap();
        broker.on_tick(SYMBOL, dec(140, 0));
        let book = broker.orderbook().await.unwrap();
        assert_eq!(
            book.iter().find(|o| o.order_id == stop_id).unwrap().status,
            BrokerOrderStatus::Open
        );
        broker.on_tick(SYMBOL, dec(141, 50));
        let book = broker.orderbook().await.unwrap();
        let stop = book.iter().find(|o| o.order_id == stop_id).unwrap();
        assert_eq!(stop.status, BrokerOrderStatus::Complete);
        assert_eq!(stop.avg_price, Some(dec(141, 50)));
        // Short opened then covered: flat book.
        assert!(broker.positionbook().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn market_orders_need_a_price() {
        let broker = PaperBroker::default();
        let err = broker
            .place(&OrderRequest::market(SYMBOL, Side::Buy, 65))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        broker.on_tick(SYMBOL, dec(120, 0));
        let id = broker
            .place(&OrderRequest::market(SYMBOL, Side::Buy, 65))
            .await
            .unwrap();
        let book = broker.orderbook().await.unwrap();
        assert_eq!(
            book.iter().find(|o| o.order_id == id).unwrap().status,
            BrokerOrderStatus::Complete
        );
    }

    #[tokio::test]
    async fn cancel_and_modify_respect_terminal_states() {
        let broker = PaperBroker::default();
        broker.on_tick(SYMBOL, dec(130, 0));
        let id = broker
            .place(&OrderRequest::limit(SYMBOL, Side::Sell, dec(129, 95), 65))
            .await
            .unwrap();
        broker
            .modify(&id, Some(dec(126, 45)), None)
            .await
            .unwrap();
        broker.cancel(&id).await.unwrap();
        assert!(broker.cancel(&id).await.is_err());
        assert!(broker.modify(&id, Some(dec(125, 0)), None).await.is_err());
        // Cancelled orders never fill.
        broker.on_tick(SYMBOL, dec(120, 0));
        let book = broker.orderbook().await.unwrap();
        assert_eq!(book[0].status, BrokerOrderStatus::Cancelled);
    }
}
