//! Folds the tick stream into one-minute OHLCV bars with session VWAP.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use premia_core::session::minute_floor;
use premia_core::{Bar, Price, Symbol, Tick};

/// A minute needs at least this many ticks to produce a usable bar; thinner
/// minutes are discarded rather than forward-filled.
const MIN_TICKS_PER_BAR: u32 = 5;

/// Bars retained per symbol.
const MAX_BARS_PER_SYMBOL: usize = 400;

/// Largest credible timestamp jump between consecutive ticks of one symbol.
/// Anything beyond a full session length is feed corruption.
const MAX_TS_JUMP_SECS: i64 = 6 * 3600 + 15 * 60;

#[derive(Debug, Default)]
struct MinuteAccum {
    minute: Option<DateTime<Utc>>,
    open: Price,
    high: Price,
    low: Price,
    close: Price,
    volume: i64,
    ticks: u32,
}

#[derive(Debug, Default)]
struct SymbolState {
    accum: MinuteAccum,
    last_ts: Option<DateTime<Utc>>,
    last_session_volume: Option<i64>,
    cum_tp_vol: Decimal,
    cum_vol: Decimal,
    vwap: Option<Price>,
    history: Vec<Bar>,
}

/// Per-symbol tick-to-bar aggregation with a session-cumulative VWAP.
#[derive(Debug, Default)]
pub struct BarAggregator {
    states: HashMap<Symbol, SymbolState>,
    dropped_ticks: u64,
    discarded_bars: u64,
}

impl BarAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one tick. Returns the previous minute's bar when this tick
    /// crossed a minute boundary and the closed minute was well-formed.
    pub fn on_tick(&mut self, tick: &Tick) -> Option<Bar> {
        if tick.last_price <= Decimal::ZERO {
            self.dropped_ticks += 1;
            warn!(symbol = %tick.symbol, price = %tick.last_price, "dropping non-positive tick");
            return None;
        }
        let state = self.states.entry(tick.symbol.clone()).or_default();
        if let Some(last_ts) = state.last_ts {
            let jump = (tick.ts - last_ts).num_seconds().abs();
            if jump > MAX_TS_JUMP_SECS {
                self.dropped_ticks += 1;
                warn!(symbol = %tick.symbol, jump_secs = jump, "dropping tick with implausible timestamp");
                return None;
            }
        }
        state.last_ts = Some(tick.ts);

        let minute = minute_floor(tick.ts);
        let mut emitted = None;
        if state.accum.minute != Some(minute) {
            if let Some(prev_minute) = state.accum.minute {
                if state.accum.ticks >= MIN_TICKS_PER_BAR {
                    emitted = Some(Self::close_bar(&tick.symbol, state, prev_minute));
                } else {
                    self.discarded_bars += 1;
                    debug!(
                        symbol = %tick.symbol,
                        ticks = state.accum.ticks,
                        "discarding thin minute"
                    );
                }
            }
            state.accum = MinuteAccum {
                minute: Some(minute),
                open: tick.last_price,
                high: tick.last_price,
                low: tick.last_price,
                close: tick.last_price,
                volume: 0,
                ticks: 0,
            };
        }

        let volume_delta = match state.last_session_volume {
            Some(prev) => (tick.session_volume - prev).max(0),
            None => 0,
        };
        state.last_session_volume = Some(tick.session_volume);

        let accum = &mut state.accum;
        accum.high = accum.high.max(tick.last_price);
        accum.low = accum.low.min(tick.last_price);
        accum.close = tick.last_price;
        accum.volume += volume_delta;
        accum.ticks += 1;

        emitted
    }

    fn close_bar(symbol: &str, state: &mut SymbolState, minute: DateTime<Utc>) -> Bar {
        let accum = &state.accum;
        let typical = (accum.high + accum.low + accum.close) / Decimal::from(3);
        let bar_volume = Decimal::from(accum.volume);
        state.cum_tp_vol += typical * bar_volume;
        state.cum_vol += bar_volume;
        let vwap = if state.cum_vol > Decimal::ZERO {
            state.cum_tp_vol / state.cum_vol
        } else {
            typical
        };
        state.vwap = Some(vwap);
        let bar = Bar {
            symbol: symbol.to_string(),
            minute_start: minute,
            open: accum.open,
            high: accum.high,
            low: accum.low,
            close: accum.close,
            volume: accum.volume,
            vwap_at_close: vwap,
            tick_count: accum.ticks,
        };
        state.history.push(bar.clone());
        if state.history.len() > MAX_BARS_PER_SYMBOL {
            let excess = state.history.len() - MAX_BARS_PER_SYMBOL;
            state.history.drain(..excess);
        }
        bar
    }

    /// High of the current, still-accumulating minute. This is what makes
    /// the stop-distance gate react intra-minute.
    #[must_use]
    pub fn live_high(&self, symbol: &str) -> Option<Price> {
        self.states
            .get(symbol)
            .filter(|s| s.accum.minute.is_some() && s.accum.ticks > 0)
            .map(|s| s.accum.high)
    }

    /// Closed bars for a symbol, oldest first.
    #[must_use]
    pub fn history(&self, symbol: &str) -> &[Bar] {
        self.states
            .get(symbol)
            .map(|s| s.history.as_slice())
            .unwrap_or(&[])
    }

    /// Session VWAP as of the last closed bar.
    #[must_use]
    pub fn session_vwap(&self, symbol: &str) -> Option<Price> {
        self.states.get(symbol).and_then(|s| s.vwap)
    }

    #[must_use]
    pub fn dropped_ticks(&self) -> u64 {
        self.dropped_ticks
    }

    #[must_use]
    pub fn discarded_bars(&self) -> u64 {
        self.discarded_bars
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use premia_core::TickSource;

    fn tick(symbol: &str, minute: u32, second: u32, price: i64, session_volume: i64) -> Tick {
        Tick {
            symbol: symbol.into(),
            ts: Utc
                .with_ymd_and_hms(2026, 2, 2, 5, minute, second)
                .unwrap(),
            last_price: Decimal::from(price),
            session_volume,
            source: TickSource::Primary,
        }
    }

    fn feed_minute(agg: &mut BarAggregator, minute: u32, prices: &[i64]) -> Option<Bar> {
        let mut emitted = None;
        for (i, price) in prices.iter().enumerate() {
            let t = tick("NIFTY06FEB2624200CE", minute, i as u32, *price, (minute as i64) * 100 + i as i64);
            if let Some(bar) = agg.on_tick(&t) {
                emitted = Some(bar);
            }
        }
        emitted
    }

    #[test]
    fn emits_bar_on_minute_rollover() {
        let mut agg = BarAggregator::new();
        assert!(feed_minute(&mut agg, 0, &[130, 132, 128, 131, 129, 130]).is_none());
        let bar = feed_minute(&mut agg, 1, &[131, 131, 131, 131, 131]).expect("bar");
        assert_eq!(bar.open, Decimal::from(130));
        assert_eq!(bar.high, Decimal::from(132));
        assert_eq!(bar.low, Decimal::from(128));
        assert_eq!(bar.close, Decimal::from(130));
        assert_eq!(bar.tick_count, 6);
        assert_eq!(agg.history("NIFTY06FEB2624200CE").len(), 1);
    }

    #[test]
    fn thin_minutes_are_discarded() {
        let mut agg = BarAggregator::new();
        assert!(feed_minute(&mut agg, 0, &[130, 131, 132]).is_none());
        assert!(feed_minute(&mut agg, 1, &[130, 130, 130, 130, 130]).is_none());
        assert_eq!(agg.discarded_bars(), 1);
        assert!(agg.history("NIFTY06FEB2624200CE").is_empty());
    }

    #[test]
    fn vwap_accumulates_across_bars() {
        let mut agg = BarAggregator::new();
        feed_minute(&mut agg, 0, &[100, 100, 100, 100, 100, 100]);
        let first = feed_minute(&mut agg, 1, &[200, 200, 200, 200, 200, 200]).unwrap();
        // single closed bar: VWAP equals its typical price
        assert_eq!(first.vwap_at_close, Decimal::from(100));
        let second = feed_minute(&mut agg, 2, &[100, 100, 100, 100, 100]).unwrap();
        assert!(second.vwap_at_close > Decimal::from(100));
        assert!(second.vwap_at_close < Decimal::from(200));
        assert_eq!(agg.session_vwap("NIFTY06FEB2624200CE"), Some(second.vwap_at_close));
    }

    #[test]
    fn live_high_tracks_current_minute() {
        let mut agg = BarAggregator::new();
        feed_minute(&mut agg, 0, &[130, 140, 135]);
        assert_eq!(
            agg.live_high("NIFTY06FEB2624200CE"),
            Some(Decimal::from(140))
        );
        assert_eq!(agg.live_high("NIFTY06FEB2624300CE"), None);
    }

    #[test]
    fn malformed_ticks_are_counted() {
        let mut agg = BarAggregator::new();
        let mut bad = tick("NIFTY06FEB2624200CE", 0, 0, 0, 0);
        bad.last_price = Decimal::ZERO;
        assert!(agg.on_tick(&bad).is_none());
        let good = tick("NIFTY06FEB2624200CE", 0, 1, 130, 10);
        agg.on_tick(&good);
        let mut jumped = tick("NIFTY06FEB2624200CE", 0, 2, 131, 20);
        jumped.ts = good.ts + chrono::Duration::hours(12);
        assert!(agg.on_tick(&jumped).is_none());
        assert_eq!(agg.dropped_ticks(), 2);
    }

    #[test]
    fn volume_differences_session_cumulative() {
        let mut agg = BarAggregator::new();
        for (i, vol) in [1_000, 1_050, 1_050, 1_200, 1_150, 1_300].iter().enumerate() {
            let t = tick("NIFTY06FEB2624200CE", 0, i as u32, 130, *vol);
            agg.on_tick(&t);
        }
        let bar = feed_minute(&mut agg, 1, &[130, 130, 130, 130, 130]).unwrap();
        // first tick contributes zero; negative deltas clamp to zero
        assert_eq!(bar.volume, 50 + 0 + 150 + 0 + 150);
    }
}
