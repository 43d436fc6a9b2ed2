//! Startup-only anchor detection: at-the-money strike plus expiry token.

use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::json;
use tracing::info;

use premia_broker::GatewayConfig;

/// What the engine subscribes around.
#[derive(Clone, Debug, PartialEq)]
pub struct Anchor {
    pub atm_strike: i64,
    /// `DDMMMYY` token, e.g. `06FEB26`.
    pub expiry: String,
}

/// Round the spot to the nearest round-hundred strike.
#[must_use]
pub fn atm_from_spot(spot: Decimal) -> i64 {
    let hundreds = (spot / Decimal::from(100))
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    (hundreds * Decimal::from(100)).to_i64().unwrap_or(0)
}

/// Convert the gateway's `DD-MMM-YY` expiry listing into the symbol token.
#[must_use]
pub fn expiry_token(listed: &str) -> String {
    listed.replace('-', "").to_ascii_uppercase()
}

/// Pick the nearest expiry at or after today from the gateway's listing.
pub fn nearest_expiry(listed: &[String], today: NaiveDate) -> Result<String> {
    let mut dated: Vec<(NaiveDate, &String)> = listed
        .iter()
        .filter_map(|raw| {
            NaiveDate::parse_from_str(raw, "%d-%b-%y")
                .ok()
                .map(|date| (date, raw))
        })
        .filter(|(date, _)| *date >= today)
        .collect();
    dated.sort();
    dated
        .first()
        .map(|(_, raw)| expiry_token(raw))
        .ok_or_else(|| anyhow!("no future expiry in gateway listing"))
}

/// Query the gateway for the spot quote and the expiry calendar.
pub async fn detect(gateway: &GatewayConfig, underlying: &str) -> Result<Anchor> {
    let client = reqwest::Client::new();
    let base = gateway.rest_url.trim_end_matches('/');

    let quote: serde_json::Value = client
        .post(format!("{base}/quote"))
        .json(&json!({
            "apikey": gateway.api_key,
            "symbol": format!("{underlying} 50"),
            "exchange": "NSE",
        }))
        .send()
        .await
        .context("spot quote request failed")?
        .json()
        .await
        .context("spot quote payload unreadable")?;
    let spot = quote
        .pointer("/data/ltp")
        .and_then(|v| v.as_str().map(str::to_string).or_else(|| v.as_f64().map(|f| f.to_string())))
        .and_then(|s| s.parse::<Decimal>().ok())
        .ok_or_else(|| anyhow!("gateway quote missing ltp"))?;

    let expiries: serde_json::Value = client
        .post(format!("{base}/expiry"))
        .json(&json!({
            "apikey": gateway.api_key,
            "symbol": underlying,
            "exchange": "NFO",
        }))
        .send()
        .await
        .context("expiry listing request failed")?
        .json()
        .await
        .context("expiry listing payload unreadable")?;
    let listed: Vec<String> = expiries
        .pointer("/data")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let today = Utc::now().date_naive();
    let anchor = Anchor {
        atm_strike: atm_from_spot(spot),
        expiry: nearest_expiry(&listed, today)?,
    };
    info!(spot = %spot, atm = anchor.atm_strike, expiry = %anchor.expiry, "anchor detected");
    Ok(anchor)
}
