//! Three-stage entry filter.
//!
//! Stage 1 gates a freshly confirmed swing low on price band and VWAP
//! premium; the surviving candidate is immutable until invalidated. Stage 2
//! re-prices the stop distance on every tick from the highest high since the
//! swing (closed bars plus the live minute). Stage 3 picks at most one best
//! candidate per option side.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use premia_core::{OptionSide, OptionSymbol, Price, Qty, Symbol, SwingKind};
use premia_feed::BarAggregator;

use crate::swing::SwingEvent;

/// Read side of the market state needed by the dynamic gate.
pub trait MarketView: Send + Sync {
    /// Highest traded price since `from` (inclusive), across closed bars and
    /// the live, still-forming minute.
    fn highest_high_since(&self, symbol: &str, from: DateTime<Utc>) -> Option<Price>;
}

impl MarketView for BarAggregator {
    fn highest_high_since(&self, symbol: &str, from: DateTime<Utc>) -> Option<Price> {
        let closed = self
            .history(symbol)
            .iter()
            .filter(|bar| bar.minute_start >= from)
            .map(|bar| bar.high)
            .max();
        match (closed, self.live_high(symbol)) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Tunable filter parameters.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FilterConfig {
    pub min_entry_price: Price,
    pub max_entry_price: Price,
    /// Minimum `(price - vwap) / vwap` at swing formation.
    pub min_vwap_premium: Decimal,
    pub min_sl_percent: Decimal,
    pub max_sl_percent: Decimal,
    pub target_sl_points: Decimal,
    /// Rupee buffer added above the highest high to form the stop trigger.
    pub sl_buffer: Price,
    /// Fixed rupee risk unit per trade.
    pub r_value: Price,
    pub lot_size: Qty,
    pub max_lots: Qty,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_entry_price: Decimal::from(100),
            max_entry_price: Decimal::from(300),
            min_vwap_premium: Decimal::new(4, 2),
            min_sl_percent: Decimal::new(2, 2),
            max_sl_percent: Decimal::new(10, 2),
            target_sl_points: Decimal::from(10),
            sl_buffer: Decimal::ONE,
            r_value: Decimal::from(6_500),
            lot_size: 65,
            max_lots: 10,
        }
    }
}

/// A swing low that survived the static gate. Immutable apart from in-place
/// swing price migrations.
#[derive(Clone, Debug, PartialEq)]
pub struct StaticCandidate {
    pub symbol: Symbol,
    pub side: OptionSide,
    pub strike: i64,
    pub entry_price: Price,
    pub vwap_at_formation: Price,
    pub swing_minute: DateTime<Utc>,
}

/// A candidate that also passed the dynamic stop-distance gate, fully priced
/// and sized for this evaluation.
#[derive(Clone, Debug, PartialEq)]
pub struct DynamicCandidate {
    pub symbol: Symbol,
    pub side: OptionSide,
    pub strike: i64,
    pub entry_price: Price,
    pub swing_minute: DateTime<Utc>,
    pub highest_high: Price,
    pub sl_trigger: Price,
    pub sl_points: Decimal,
    pub sl_percent: Decimal,
    pub lots: Qty,
    pub quantity: Qty,
    pub actual_r: Price,
}

/// Stage-3 output: at most one best candidate per side.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BestPerSide {
    pub ce: Option<DynamicCandidate>,
    pub pe: Option<DynamicCandidate>,
}

impl BestPerSide {
    #[must_use]
    pub fn get(&self, side: OptionSide) -> Option<&DynamicCandidate> {
        match side {
            OptionSide::Ce => self.ce.as_ref(),
            OptionSide::Pe => self.pe.as_ref(),
        }
    }
}

/// Result of feeding a swing event through the static gate.
#[derive(Clone, Debug, PartialEq)]
pub enum GateOutcome {
    Gated(StaticCandidate),
    Rejected {
        symbol: Symbol,
        reason: String,
        removed_existing: bool,
    },
    PriceMigrated {
        symbol: Symbol,
        entry_price: Price,
    },
}

/// Holds the static-candidate pool and runs all three stages.
pub struct FilterEngine {
    config: FilterConfig,
    pool: HashMap<Symbol, StaticCandidate>,
}

impl FilterEngine {
    #[must_use]
    pub fn new(config: FilterConfig) -> Self {
        Self {
            config,
            pool: HashMap::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    #[must_use]
    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }

    /// Stage 1. Only swing lows can gate in; swing highs and price
    /// violations leave the pool untouched (a violated level either fills
    /// the resting entry or migrates lower via an in-place update).
    pub fn on_swing_event(&mut self, event: &SwingEvent) -> Option<GateOutcome> {
        match event {
            SwingEvent::Confirmed(swing) if swing.kind == SwingKind::Low => {
                Some(self.gate(&swing.symbol, swing.price, swing.vwap_at_formation, swing.formed_at))
            }
            SwingEvent::Updated {
                symbol,
                kind: SwingKind::Low,
                price,
                at,
            } => {
                let candidate = self.pool.get_mut(symbol)?;
                candidate.entry_price = *price;
                candidate.swing_minute = *at;
                debug!(%symbol, price = %price, "[FILTER] candidate entry migrated with swing update");
                Some(GateOutcome::PriceMigrated {
                    symbol: symbol.clone(),
                    entry_price: *price,
                })
            }
            _ => None,
        }
    }

    fn gate(
        &mut self,
        symbol: &str,
        price: Price,
        vwap: Price,
        formed_at: DateTime<Utc>,
    ) -> GateOutcome {
        let reject = |pool: &mut HashMap<Symbol, StaticCandidate>, reason: String| {
            let removed_existing = pool.remove(symbol).is_some();
            info!(%symbol, %reason, removed_existing, "[FILTER] swing low rejected by static gate");
            GateOutcome::Rejected {
                symbol: symbol.to_string(),
                reason,
                removed_existing,
            }
        };

        let parsed = match OptionSymbol::parse(symbol) {
            Ok(parsed) => parsed,
            Err(err) => return reject(&mut self.pool, format!("unparseable symbol: {err}")),
        };
        if price < self.config.min_entry_price || price > self.config.max_entry_price {
            return reject(
                &mut self.pool,
                format!(
                    "price {price} outside {}-{}",
                    self.config.min_entry_price, self.config.max_entry_price
                ),
            );
        }
        if vwap <= Decimal::ZERO {
            return reject(&mut self.pool, "no session VWAP at formation".into());
        }
        let premium = (price - vwap) / vwap;
        if premium < self.config.min_vwap_premium {
            return reject(&mut self.pool, format!("vwap premium {premium} below floor"));
        }

        let candidate = StaticCandidate {
            symbol: symbol.to_string(),
            side: parsed.side,
            strike: parsed.strike,
            entry_price: price,
            vwap_at_formation: vwap,
            swing_minute: formed_at,
        };
        info!(
            %symbol,
            entry = %price,
            vwap = %vwap,
            premium = %premium,
            "[FILTER] swing low gated into candidate pool"
        );
        self.pool.insert(symbol.to_string(), candidate.clone());
        GateOutcome::Gated(candidate)
    }

    /// Drop a symbol from the pool (entry filled, or its swing died).
    pub fn remove(&mut self, symbol: &str) -> bool {
        self.pool.remove(symbol).is_some()
    }

    /// Empty the pool (session cutoff or risk halt).
    pub fn clear(&mut self) {
        self.pool.clear();
    }

    /// Stages 2 and 3. `skip` holds symbols with an open position or an
    /// in-flight opening; they never re-nominate.
    pub fn evaluate(&self, market: &dyn MarketView, skip: &HashSet<Symbol>) -> BestPerSide {
        let mut ce: Vec<DynamicCandidate> = Vec::new();
        let mut pe: Vec<DynamicCandidate> = Vec::new();
        for candidate in self.pool.values() {
            if skip.contains(&candidate.symbol) {
                continue;
            }
            let Some(dynamic) = self.price_candidate(candidate, market) else {
                continue;
            };
            match dynamic.side {
                OptionSide::Ce => ce.push(dynamic),
                OptionSide::Pe => pe.push(dynamic),
            }
        }
        BestPerSide {
            ce: self.pick_best(ce),
            pe: self.pick_best(pe),
        }
    }

    /// Stage 2 for one candidate.
    fn price_candidate(
        &self,
        candidate: &StaticCandidate,
        market: &dyn MarketView,
    ) -> Option<DynamicCandidate> {
        let highest_high =
            market.highest_high_since(&candidate.symbol, candidate.swing_minute)?;
        let sl_trigger = highest_high + self.config.sl_buffer;
        let sl_points = sl_trigger - candidate.entry_price;
        if sl_points <= Decimal::ZERO || candidate.entry_price <= Decimal::ZERO {
            return None;
        }
        let sl_percent = sl_points / candidate.entry_price;
        if sl_percent < self.config.min_sl_percent || sl_percent > self.config.max_sl_percent {
            return None;
        }
        let lots_wanted = self.config.r_value / (sl_points * Decimal::from(self.config.lot_size));
        let lots = lots_wanted.floor().to_i64()?.min(self.config.max_lots);
        if lots < 1 {
            return None;
        }
        let quantity = lots * self.config.lot_size;
        let actual_r = sl_points * Decimal::from(quantity);
        Some(DynamicCandidate {
            symbol: candidate.symbol.clone(),
            side: candidate.side,
            strike: candidate.strike,
            entry_price: candidate.entry_price,
            swing_minute: candidate.swing_minute,
            highest_high,
            sl_trigger,
            sl_points,
            sl_percent,
            lots,
            quantity,
            actual_r,
        })
    }

    /// Stage 3: distance to the target stop, round-hundred strikes, highest
    /// entry, then symbol order so equal tuples resolve the same way on
    /// every run.
    fn pick_best(&self, candidates: Vec<DynamicCandidate>) -> Option<DynamicCandidate> {
        let target = self.config.target_sl_points;
        candidates.into_iter().min_by(|a, b| {
            let a_dist = (a.sl_points - target).abs();
            let b_dist = (b.sl_points - target).abs();
            a_dist
                .cmp(&b_dist)
                .then_with(|| {
                    let a_round = u8::from(a.strike % 100 != 0);
                    let b_round = u8::from(b.strike % 100 != 0);
                    a_round.cmp(&b_round)
                })
                .then_with(|| b.entry_price.cmp(&a.entry_price))
                .then_with(|| a.symbol.cmp(&b.symbol))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use premia_core::Swing;

    fn minute(m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 2, 5, m, 0).unwrap()
    }

    fn low_swing(symbol: &str, price: i64, vwap: i64) -> SwingEvent {
        SwingEvent::Confirmed(Swing {
            symbol: symbol.into(),
            kind: SwingKind::Low,
            price: Decimal::from(price),
            formed_at: minute(0),
            vwap_at_formation: Decimal::from(vwap),
        })
    }

    struct FixedMarket(HashMap<Symbol, Price>);

    impl MarketView for FixedMarket {
        fn highest_high_since(&self, symbol: &str, _from: DateTime<Utc>) -> Option<Price> {
            self.0.get(symbol).copied()
        }
    }

    fn market(entries: &[(&str, i64)]) -> FixedMarket {
        FixedMarket(
            entries
                .iter()
                .map(|(s, h)| (s.to_string(), Decimal::from(*h)))
                .collect(),
        )
    }

    fn market_frac(entries: &[(&str, (i64, u32))]) -> FixedMarket {
        FixedMarket(
            entries
                .iter()
                .map(|(s, (units, cents))| {
                    (
                        s.to_string(),
                        Decimal::new(units * 100 + i64::from(*cents), 2),
                    )
                })
                .collect(),
        )
    }

    #[test]
    fn static_gate_accepts_priced_premium() {
        let mut engine = FilterEngine::new(FilterConfig::default());
        // 130 over 124 VWAP: 4.84% premium, inside the 100-300 band.
        let outcome = engine.on_swing_event(&low_swing("NIFTY06FEB2624200CE", 130, 124));
        assert!(matches!(outcome, Some(GateOutcome::Gated(_))));
        assert_eq!(engine.pool_len(), 1);
    }

    #[test]
    fn static_gate_rejects_thin_premium_and_price_band() {
        let mut engine = FilterEngine::new(FilterConfig::default());
        // 3.2% premium
        let outcome = engine.on_swing_event(&low_swing("NIFTY06FEB2624200CE", 129, 125));
        assert!(matches!(outcome, Some(GateOutcome::Rejected { .. })));
        // price outside band
        let outcome = engine.on_swing_event(&low_swing("NIFTY06FEB2624300CE", 320, 280));
        assert!(matches!(outcome, Some(GateOutcome::Rejected { .. })));
        assert_eq!(engine.pool_len(), 0);
    }

    #[test]
    fn failing_replacement_swing_invalidates_symbol() {
        let mut engine = FilterEngine::new(FilterConfig::default());
        engine.on_swing_event(&low_swing("NIFTY06FEB2624200CE", 130, 124));
        assert_eq!(engine.pool_len(), 1);
        let outcome = engine.on_swing_event(&low_swing("NIFTY06FEB2624200CE", 120, 119));
        assert!(matches!(
            outcome,
            Some(GateOutcome::Rejected {
                removed_existing: true,
                ..
            })
        ));
        assert_eq!(engine.pool_len(), 0);
    }

    #[test]
    fn swing_update_migrates_price_without_regating() {
        let mut engine = FilterEngine::new(FilterConfig::default());
        engine.on_swing_event(&low_swing("NIFTY06FEB2624200CE", 130, 124));
        // The migrated price would fail the gate's premium check against the
        // frozen VWAP; the candidate must survive regardless.
        let outcome = engine.on_swing_event(&SwingEvent::Updated {
            symbol: "NIFTY06FEB2624200CE".into(),
            kind: SwingKind::Low,
            price: Decimal::new(12_650, 2),
            at: minute(3),
        });
        assert!(matches!(outcome, Some(GateOutcome::PriceMigrated { .. })));
        let best = engine.evaluate(
            &market_frac(&[("NIFTY06FEB2624200CE", (132, 0))]),
            &HashSet::new(),
        );
        let ce = best.ce.expect("still nominated");
        assert_eq!(ce.entry_price, Decimal::new(12_650, 2));
    }

    #[test]
    fn dynamic_gate_prices_and_sizes() {
        let mut engine = FilterEngine::new(FilterConfig::default());
        engine.on_swing_event(&low_swing("NIFTY06FEB2624200CE", 130, 124));
        let best = engine.evaluate(&market(&[("NIFTY06FEB2624200CE", 140)]), &HashSet::new());
        let ce = best.ce.expect("qualified");
        assert_eq!(ce.sl_trigger, Decimal::from(141));
        assert_eq!(ce.sl_points, Decimal::from(11));
        // 11 / 130 = 8.46%
        assert!(ce.sl_percent > Decimal::new(8, 2) && ce.sl_percent < Decimal::new(9, 2));
        assert_eq!(ce.lots, 9); // floor(6500 / (11 * 65))
        assert_eq!(ce.quantity, 585);
        assert_eq!(ce.actual_r, Decimal::from(585 * 11));
        assert!(best.pe.is_none());
    }

    #[test]
    fn dynamic_gate_disqualifies_wide_and_thin_stops() {
        let mut engine = FilterEngine::new(FilterConfig::default());
        engine.on_swing_event(&low_swing("NIFTY06FEB2624200CE", 130, 124));
        // 10.3%: above the cap.
        let best = engine.evaluate(
            &market_frac(&[("NIFTY06FEB2624200CE", (142, 39))]),
            &HashSet::new(),
        );
        assert!(best.ce.is_none());
        assert_eq!(engine.pool_len(), 1, "disqualified candidates stay pooled");
        // Back inside the band later: requalifies.
        let best = engine.evaluate(&market(&[("NIFTY06FEB2624200CE", 140)]), &HashSet::new());
        assert!(best.ce.is_some());
        // 1.5 points: under the 2% floor.
        let best = engine.evaluate(
            &market_frac(&[("NIFTY06FEB2624200CE", (130, 95))]),
            &HashSet::new(),
        );
        assert!(best.ce.is_none());
    }

    #[test]
    fn tie_break_prefers_target_distance_then_round_strike() {
        let mut engine = FilterEngine::new(FilterConfig::default());
        engine.on_swing_event(&low_swing("NIFTY06FEB2624200CE", 130, 124));
        engine.on_swing_event(&low_swing("NIFTY06FEB2624150CE", 130, 124));
        // 24200 at 14 points (dist 4), 24150 at 10.5 points (dist 0.5).
        let best = engine.evaluate(
            &market_frac(&[
                ("NIFTY06FEB2624200CE", (143, 0)),
                ("NIFTY06FEB2624150CE", (139, 50)),
            ]),
            &HashSet::new(),
        );
        assert_eq!(best.ce.unwrap().strike, 24_150);

        // Equal distance: the round-hundred strike wins.
        let best = engine.evaluate(
            &market_frac(&[
                ("NIFTY06FEB2624200CE", (140, 50)),
                ("NIFTY06FEB2624150CE", (140, 50)),
            ]),
            &HashSet::new(),
        );
        assert_eq!(best.ce.unwrap().strike, 24_200);
    }

    #[test]
    fn tie_break_is_deterministic_on_equal_tuples() {
        let mut engine = FilterEngine::new(FilterConfig::default());
        engine.on_swing_event(&low_swing("NIFTY06FEB2624200CE", 130, 124));
        engine.on_swing_event(&low_swing("NIFTY06FEB2624300CE", 130, 124));
        let view = market(&[
            ("NIFTY06FEB2624200CE", 140),
            ("NIFTY06FEB2624300CE", 140),
        ]);
        for _ in 0..8 {
            let best = engine.evaluate(&view, &HashSet::new());
            assert_eq!(best.ce.as_ref().unwrap().strike, 24_200);
        }
    }

    #[test]
    fn open_positions_never_renominate() {
        let mut engine = FilterEngine::new(FilterConfig::default());
        engine.on_swing_event(&low_swing("NIFTY06FEB2624200CE", 130, 124));
        let mut skip = HashSet::new();
        skip.insert("NIFTY06FEB2624200CE".to_string());
        let best = engine.evaluate(&market(&[("NIFTY06FEB2624200CE", 140)]), &skip);
        assert!(best.ce.is_none());
    }

    #[test]
    fn live_minute_high_moves_the_gate_before_bar_close() {
        use premia_core::{Tick, TickSource};

        let mut engine = FilterEngine::new(FilterConfig::default());
        engine.on_swing_event(&low_swing("NIFTY06FEB2624200CE", 130, 124));

        let mut agg = BarAggregator::new();
        let tick = |m: u32, s: u32, price: Decimal| Tick {
            symbol: "NIFTY06FEB2624200CE".into(),
            ts: Utc.with_ymd_and_hms(2026, 2, 2, 5, m, s).unwrap(),
            last_price: price,
            session_volume: 0,
            source: TickSource::Primary,
        };
        // One closed bar with high 140, then a spike inside the live minute.
        for s in 0..6 {
            agg.on_tick(&tick(0, s, Decimal::from(138 + i64::from(s % 3))));
        }
        agg.on_tick(&tick(1, 0, Decimal::from(139)));
        let best = engine.evaluate(&agg, &HashSet::new());
        let before = best.ce.expect("qualified").sl_percent;

        agg.on_tick(&tick(1, 10, Decimal::new(14_239, 2)));
        let best = engine.evaluate(&agg, &HashSet::new());
        // 142.39 + 1 = 143.39 trigger: 10.3%, out of band mid-minute.
        assert!(best.ce.is_none());
        assert!(before < Decimal::new(10, 2));
    }

    #[test]
    fn sides_are_grouped_independently() {
        let mut engine = FilterEngine::new(FilterConfig::default());
        engine.on_swing_event(&low_swing("NIFTY06FEB2624200CE", 130, 124));
        engine.on_swing_event(&low_swing("NIFTY06FEB2624200PE", 150, 140));
        let best = engine.evaluate(
            &market(&[
                ("NIFTY06FEB2624200CE", 140),
                ("NIFTY06FEB2624200PE", 160),
            ]),
            &HashSet::new(),
        );
        assert!(best.ce.is_some());
        assert!(best.pe.is_some());
    }
}
