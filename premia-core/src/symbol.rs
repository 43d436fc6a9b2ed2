//! NFO option symbol formatting and parsing.
//!
//! The gateway expects the bit-exact format `NIFTY<DDMMMYY><STRIKE><CE|PE>`,
//! e.g. `NIFTY06FEB2624200CE`: uppercase English month token, integer strike.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::OptionSide;

const MONTHS: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];

/// Errors raised when decoding a symbol string.
#[derive(Debug, Error, PartialEq)]
pub enum SymbolError {
    #[error("symbol too short: {0}")]
    TooShort(String),
    #[error("unknown option side suffix in {0}")]
    BadSide(String),
    #[error("missing or non-numeric strike in {0}")]
    BadStrike(String),
    #[error("invalid expiry token '{0}'")]
    BadExpiry(String),
}

/// Decomposed option symbol.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct OptionSymbol {
    pub underlying: String,
    /// Expiry token in `DDMMMYY` form, e.g. `06FEB26`.
    pub expiry: String,
    pub strike: i64,
    pub side: OptionSide,
}

impl OptionSymbol {
    pub fn new(
        underlying: impl Into<String>,
        expiry: impl Into<String>,
        strike: i64,
        side: OptionSide,
    ) -> Result<Self, SymbolError> {
        let expiry = expiry.into();
        validate_expiry(&expiry)?;
        Ok(Self {
            underlying: underlying.into(),
            expiry,
            strike,
            side,
        })
    }

    /// Decode the gateway wire format. The underlying is the leading
    /// alphabetic run, followed by a fixed 7-character expiry token; the
    /// strike digits run up to the 2-character side suffix.
    pub fn parse(raw: &str) -> Result<Self, SymbolError> {
        if raw.len() < 12 {
            return Err(SymbolError::TooShort(raw.to_string()));
        }
        let (head, side_token) = raw.split_at(raw.len() - 2);
        let side = match side_token {
            "CE" => OptionSide::Ce,
            "PE" => OptionSide::Pe,
            _ => return Err(SymbolError::BadSide(raw.to_string())),
        };
        let underlying_len = head
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(head.len());
        let (underlying, rest) = head.split_at(underlying_len);
        if underlying.is_empty() || rest.len() < 7 {
            return Err(SymbolError::TooShort(raw.to_string()));
        }
        let (expiry, strike_digits) = rest.split_at(7);
        validate_expiry(expiry)?;
        if strike_digits.is_empty() {
            return Err(SymbolError::BadStrike(raw.to_string()));
        }
        let strike: i64 = strike_digits
            .parse()
            .map_err(|_| SymbolError::BadStrike(raw.to_string()))?;
        Ok(Self {
            underlying: underlying.to_string(),
            expiry: expiry.to_string(),
            strike,
            side,
        })
    }

    /// True when the strike sits on a round-hundred level. The tie-break
    /// prefers these strikes because their books are deeper.
    #[must_use]
    pub fn is_round_hundred(&self) -> bool {
        self.strike % 100 == 0
    }

    /// Encode into the gateway wire format.
    #[must_use]
    pub fn to_symbol(&self) -> String {
        format!(
            "{}{}{}{}",
            self.underlying,
            self.expiry,
            self.strike,
            self.side.as_str()
        )
    }
}

impl std::fmt::Display for OptionSymbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_symbol())
    }
}

fn validate_expiry(token: &str) -> Result<(), SymbolError> {
    let bytes = token.as_bytes();
    let ok = token.len() == 7
        && bytes[0].is_ascii_digit()
        && bytes[1].is_ascii_digit()
        && MONTHS.contains(&&token[2..5])
        && bytes[5].is_ascii_digit()
        && bytes[6].is_ascii_digit();
    if ok {
        Ok(())
    } else {
        Err(SymbolError::BadExpiry(token.to_string()))
    }
}

/// Build the subscription window of ±`span` strikes around the at-the-money
/// anchor at `interval` point spacing, both sides per strike.
#[must_use]
pub fn strike_window(
    underlying: &str,
    expiry: &str,
    atm_strike: i64,
    span: i64,
    interval: i64,
) -> Vec<OptionSymbol> {
    let mut out = Vec::with_capacity((span as usize * 2 + 1) * 2);
    for step in -span..=span {
        let strike = atm_strike + step * interval;
        for side in OptionSide::BOTH {
            out.push(OptionSymbol {
                underlying: underlying.to_string(),
                expiry: expiry.to_string(),
                strike,
                side,
            });
        }
    }
    out
}
