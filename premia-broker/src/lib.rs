//! Broker-gateway abstraction used by the rest of the workspace.
//!
//! Two implementations: [`PaperBroker`] for simulation and
//! [`GatewayBroker`] for the live REST gateway. The error taxonomy maps
//! directly onto the engine's retry policy.

use std::any::Any;

use async_trait::async_trait;
use thiserror::Error;

use premia_core::{BrokerOrder, BrokerPosition, OrderId, OrderRequest, Price};

mod gateway;
mod paper;
pub mod ws;

pub use gateway::{GatewayBroker, GatewayConfig};
pub use paper::PaperBroker;

/// Convenience alias for broker results.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Failure classes a broker call can produce. The class, not the message,
/// decides whether the caller retries.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Network trouble, timeouts, gateway 5xx. Worth retrying.
    #[error("transient broker error: {0}")]
    Transient(String),
    /// Business rejects: bad symbol, margin, RMS block. Never retried.
    #[error("permanent broker error: {0}")]
    Permanent(String),
    /// Session/token expiry. Escalated to the login collaborator.
    #[error("broker auth error: {0}")]
    Auth(String),
}

impl BrokerError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

/// Order and position surface of the broker gateway.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Human-friendly name for logs.
    fn name(&self) -> &str;

    /// Submit a new order, returning the broker's order id.
    async fn place(&self, request: &OrderRequest) -> BrokerResult<OrderId>;

    /// Amend price and/or trigger of a resting order.
    async fn modify(
        &self,
        order_id: &str,
        price: Option<Price>,
        trigger: Option<Price>,
    ) -> BrokerResult<()>;

    /// Cancel a resting order.
    async fn cancel(&self, order_id: &str) -> BrokerResult<()>;

    /// Full order book for this strategy's session.
    async fn orderbook(&self) -> BrokerResult<Vec<BrokerOrder>>;

    /// Net open positions. The broker is authoritative for existence.
    async fn positionbook(&self) -> BrokerResult<Vec<BrokerPosition>>;

    /// Available cash margin.
    async fn funds(&self) -> BrokerResult<Price>;

    /// Helper for downcasting to a concrete client.
    fn as_any(&self) -> &dyn Any;
}
