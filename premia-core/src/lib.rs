//! Fundamental data types shared across the entire workspace.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub mod session;
pub mod symbol;

pub use session::SessionClock;
pub use symbol::{strike_window, OptionSymbol, SymbolError};

/// Alias for price precision.
pub type Price = Decimal;
/// Traded quantity in contract units (NFO contracts trade whole units).
pub type Qty = i64;
/// Alias used for human-readable option symbols (e.g. `NIFTY06FEB2624200CE`).
pub type Symbol = String;
/// Unique identifier assigned to orders by the broker gateway.
pub type OrderId = String;

/// Option side of a contract. The engine shorts premium on both.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OptionSide {
    Ce,
    Pe,
}

impl OptionSide {
    /// Both sides in a fixed iteration order.
    pub const BOTH: [Self; 2] = [Self::Ce, Self::Pe];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ce => "CE",
            Self::Pe => "PE",
        }
    }
}

impl std::fmt::Display for OptionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which upstream feed a tick arrived on.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickSource {
    Primary,
    Backup,
}

/// A single quote update from the market data feed.
///
/// `session_volume` is the cumulative traded volume for the session as
/// reported by the exchange; the bar aggregator differences consecutive
/// values to recover per-bar volume.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Tick {
    pub symbol: Symbol,
    pub ts: DateTime<Utc>,
    pub last_price: Price,
    pub session_volume: i64,
    pub source: TickSource,
}

/// One-minute OHLCV bar carrying the session VWAP as of its close.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Bar {
    pub symbol: Symbol,
    pub minute_start: DateTime<Utc>,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    pub volume: i64,
    pub vwap_at_close: Price,
    pub tick_count: u32,
}

impl Bar {
    /// Typical price used for the session VWAP accumulation.
    #[must_use]
    pub fn typical_price(&self) -> Price {
        (self.high + self.low + self.close) / Decimal::from(3)
    }

    /// Midpoint of the bar's range, used to mark open positions.
    #[must_use]
    pub fn mid(&self) -> Price {
        (self.high + self.low) / Decimal::from(2)
    }
}

/// Whether a swing marks a local maximum or minimum.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwingKind {
    High,
    Low,
}

impl SwingKind {
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::High => Self::Low,
            Self::Low => Self::High,
        }
    }
}

/// A confirmed swing extreme for one symbol.
///
/// `vwap_at_formation` is frozen when the swing is first confirmed and
/// survives in-place price updates.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Swing {
    pub symbol: Symbol,
    pub kind: SwingKind,
    pub price: Price,
    pub formed_at: DateTime<Utc>,
    pub vwap_at_formation: Price,
}

/// Buy/sell direction of an order.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

/// Order execution style supported by the gateway.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    StopLimit,
}

/// Product bucket; positions in the intraday bucket are auto-squared by the
/// exchange at session end.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Product {
    #[default]
    Intraday,
    Normal,
}

/// Desired order placement parameters.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Qty,
    pub price: Option<Price>,
    pub trigger_price: Option<Price>,
    pub product: Product,
}

impl OrderRequest {
    /// A plain limit order.
    #[must_use]
    pub fn limit(symbol: impl Into<Symbol>, side: Side, price: Price, quantity: Qty) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
            trigger_price: None,
            product: Product::Intraday,
        }
    }

    /// A stop-limit order that rests until `trigger` trades.
    #[must_use]
    pub fn stop_limit(
        symbol: impl Into<Symbol>,
        side: Side,
        trigger: Price,
        limit: Price,
        quantity: Qty,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::StopLimit,
            quantity,
            price: Some(limit),
            trigger_price: Some(trigger),
            product: Product::Intraday,
        }
    }

    /// A market order.
    #[must_use]
    pub fn market(symbol: impl Into<Symbol>, side: Side, quantity: Qty) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            trigger_price: None,
            product: Product::Intraday,
        }
    }
}

/// Lifecycle state of an order as reported by the broker.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BrokerOrderStatus {
    Open,
    Complete,
    Rejected,
    Cancelled,
}

impl BrokerOrderStatus {
    /// True when the order can no longer trade.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Open)
    }
}

/// One row of the broker's order book.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct BrokerOrder {
    pub order_id: OrderId,
    pub symbol: Symbol,
    pub side: Side,
    pub status: BrokerOrderStatus,
    pub quantity: Qty,
    pub filled_quantity: Qty,
    pub price: Option<Price>,
    pub trigger_price: Option<Price>,
    pub avg_price: Option<Price>,
}

/// One row of the broker's position book. Quantity is signed (short < 0).
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct BrokerPosition {
    pub symbol: Symbol,
    pub quantity: Qty,
    pub avg_price: Price,
}

/// Execution information derived from a completed order.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Fill {
    pub order_id: OrderId,
    pub symbol: Symbol,
    pub side: Side,
    pub price: Price,
    pub quantity: Qty,
    pub ts: DateTime<Utc>,
}

/// Lifecycle of an internally tracked position.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Active,
    /// Entry filled but the protective stop could not be armed.
    Degraded,
    Closing,
    Closed,
}

/// A short option position opened by an entry fill.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Position {
    pub symbol: Symbol,
    pub side: OptionSide,
    pub quantity: Qty,
    pub entry_price: Price,
    pub entry_ts: DateTime<Utc>,
    pub stop_order_id: Option<OrderId>,
    pub stop_trigger: Price,
    pub status: PositionStatus,
    pub exit_price: Option<Price>,
    pub r_multiple: Option<Decimal>,
}
