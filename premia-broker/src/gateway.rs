//! REST client for the broker gateway.
//!
//! The gateway fronts the actual broker session (login, TOTP, exchange
//! connectivity); this client only speaks its JSON API and classifies
//! failures for the engine's retry policy.

use std::any::Any;
use std::num::NonZeroU32;

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use premia_core::{
    BrokerOrder, BrokerOrderStatus, BrokerPosition, OrderId, OrderRequest, OrderType, Price,
    Product, Side,
};

use crate::{Broker, BrokerError, BrokerResult};

const DEFAULT_REQUESTS_PER_SECOND: u32 = 8;

/// Connection settings for the gateway.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GatewayConfig {
    pub rest_url: String,
    pub ws_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_strategy_tag")]
    pub strategy_tag: String,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
}

fn default_strategy_tag() -> String {
    "premia".to_string()
}

fn default_requests_per_second() -> u32 {
    DEFAULT_REQUESTS_PER_SECOND
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            rest_url: "http://127.0.0.1:5000/api/v1".into(),
            ws_url: "ws://127.0.0.1:8765".into(),
            api_key: String::new(),
            strategy_tag: default_strategy_tag(),
            requests_per_second: DEFAULT_REQUESTS_PER_SECOND,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default = "Option::default")]
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct PlacedOrder {
    orderid: String,
}

#[derive(Debug, Deserialize)]
struct GatewayOrderRow {
    orderid: String,
    symbol: String,
    action: String,
    order_status: String,
    quantity: i64,
    #[serde(default)]
    filled_quantity: i64,
    #[serde(default)]
    price: Option<Price>,
    #[serde(default)]
    trigger_price: Option<Price>,
    #[serde(default)]
    average_price: Option<Price>,
}

#[derive(Debug, Deserialize)]
struct GatewayPositionRow {
    symbol: String,
    quantity: i64,
    #[serde(default)]
    average_price: Price,
}

#[derive(Debug, Deserialize)]
struct FundsRow {
    availablecash: Price,
}

/// Live order surface over the gateway's REST API.
pub struct GatewayBroker {
    http: reqwest::Client,
    config: GatewayConfig,
    limiter: DefaultDirectRateLimiter,
}

impl GatewayBroker {
    #[must_use]
    pub fn new(config: GatewayConfig) -> Self {
        let quota = NonZeroU32::new(config.requests_per_second.max(1))
            .map(Quota::per_second)
            .expect("non-zero request quota");
        Self {
            http: reqwest::Client::new(),
            config,
            limiter: RateLimiter::direct(quota),
        }
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> BrokerResult<T> {
        self.limiter.until_ready().await;
        let url = format!("{}/{}", self.config.rest_url.trim_end_matches('/'), path);
        let mut body = body;
        if let Some(map) = body.as_object_mut() {
            map.insert("apikey".into(), json!(self.config.api_key));
            map.insert("strategy".into(), json!(self.config.strategy_tag));
        }
        debug!(%path, "gateway request");
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|err| BrokerError::Transient(format!("gateway unreachable: {err}")))?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(BrokerError::Auth(format!("gateway rejected session: {status}")));
        }
        if status.is_server_error() {
            return Err(BrokerError::Transient(format!("gateway error: {status}")));
        }
        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|err| BrokerError::Transient(format!("malformed gateway payload: {err}")))?;
        if envelope.status != "success" {
            let message = envelope.message.unwrap_or_else(|| "unspecified".into());
            return Err(BrokerError::Permanent(message));
        }
        envelope
            .data
            .ok_or_else(|| BrokerError::Transient("gateway response missing data".into()))
    }

    fn price_type(order_type: OrderType) -> &'static str {
        match order_type {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::StopLimit => "SL",
        }
    }

    fn action(side: Side) -> &'static str {
        match side {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    fn product(product: Product) -> &'static str {
        match product {
            Product::Intraday => "MIS",
            Product::Normal => "NRML",
        }
    }

    fn parse_status(raw: &str) -> BrokerOrderStatus {
        match raw.to_ascii_lowercase().as_str() {
            "complete" | "filled" | "triggered" => BrokerOrderStatus::Complete,
            "rejected" => BrokerOrderStatus::Rejected,
            "cancelled" | "canceled" => BrokerOrderStatus::Cancelled,
            _ => BrokerOrderStatus::Open,
        }
    }
}

#[async_trait]
impl Broker for GatewayBroker {
    fn name(&self) -> &str {
        "gateway"
    }

    async fn place(&self, request: &OrderRequest) -> BrokerResult<OrderId> {
        let mut body = json!({
            "symbol": request.symbol,
            "exchange": "NFO",
            "action": Self::action(request.side),
            "price_type": Self::price_type(request.order_type),
            "product": Self::product(request.product),
            "quantity": request.quantity,
        });
        if let Some(price) = request.price {
            body["price"] = json!(price);
        }
        if let Some(trigger) = request.trigger_price {
            body["trigger_price"] = json!(trigger);
        }
        let placed: PlacedOrder = self.post("order/place", body).await?;
        Ok(placed.orderid)
    }

    async fn modify(
        &self,
        order_id: &str,
        price: Option<Price>,
        trigger: Option<Price>,
    ) -> BrokerResult<()> {
        let mut body = json!({ "orderid": order_id });
        if let Some(price) = price {
            body["price"] = json!(price);
        }
        if let Some(trigger) = trigger {
            body["trigger_price"] = json!(trigger);
        }
        let _: serde_json::Value = self.post("order/modify", body).await?;
        Ok(())
    }

    async fn cancel(&self, order_id: &str) -> BrokerResult<()> {
        let _: serde_json::Value = self
            .post("order/cancel", json!({ "orderid": order_id }))
            .await?;
        Ok(())
    }

    async fn orderbook(&self) -> BrokerResult<Vec<BrokerOrder>> {
        let rows: Vec<GatewayOrderRow> = self.post("orderbook", json!({})).await?;
        Ok(rows
            .into_iter()
            .map(|row| BrokerOrder {
                order_id: row.orderid,
                symbol: row.symbol,
                side: if row.action.eq_ignore_ascii_case("BUY") {
                    Side::Buy
                } else {
                    Side::Sell
                },
                status: Self::parse_status(&row.order_status),
                quantity: row.quantity,
                filled_quantity: row.filled_quantity,
                price: row.price,
                trigger_price: row.trigger_price,
                avg_price: row.average_price,
            })
            .collect())
    }

    async fn positionbook(&self) -> BrokerResult<Vec<BrokerPosition>> {
        let rows: Vec<GatewayPositionRow> = self.post("positionbook", json!({})).await?;
        Ok(rows
            .into_iter()
            .filter(|row| row.quantity != 0)
            .map(|row| BrokerPosition {
                symbol: row.symbol,
                quantity: row.quantity,
                avg_price: row.average_price,
            })
            .collect())
    }

    async fn funds(&self) -> BrokerResult<Price> {
        let funds: FundsRow = self.post("funds", json!({})).await?;
        Ok(funds.availablecash)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_covers_gateway_vocabulary() {
        assert_eq!(
            GatewayBroker::parse_status("complete"),
            BrokerOrderStatus::Complete
        );
        assert_eq!(
            GatewayBroker::parse_status("TRIGGERED"),
            BrokerOrderStatus::Complete
        );
        assert_eq!(
            GatewayBroker::parse_status("canceled"),
            BrokerOrderStatus::Cancelled
        );
        assert_eq!(GatewayBroker::parse_status("open"), BrokerOrderStatus::Open);
        assert_eq!(
            GatewayBroker::parse_status("trigger pending"),
            BrokerOrderStatus::Open
        );
    }

    #[test]
    fn wire_tokens_match_gateway_contract() {
        assert_eq!(GatewayBroker::price_type(OrderType::StopLimit), "SL");
        assert_eq!(GatewayBroker::action(Side::Sell), "SELL");
        assert_eq!(GatewayBroker::product(Product::Intraday), "MIS");
    }
}
