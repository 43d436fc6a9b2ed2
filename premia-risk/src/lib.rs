//! Position accounting in R units and the session risk governor.
//!
//! The halt latch and the session summary accumulator live here and only
//! here; the rest of the engine consults the governor instead of holding
//! its own copies.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use premia_core::{OptionSide, Position, Price, Qty, SessionClock, Symbol};

/// Session risk limits.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RiskConfig {
    /// Fixed rupee value of one R.
    pub r_value: Price,
    pub max_positions: usize,
    pub max_ce_positions: usize,
    pub max_pe_positions: usize,
    pub daily_target_r: Decimal,
    pub daily_stop_r: Decimal,
    /// Consecutive protective-stop failures tolerated before halting.
    pub max_stop_failures: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            r_value: Decimal::from(6_500),
            max_positions: 5,
            max_ce_positions: 3,
            max_pe_positions: 3,
            daily_target_r: Decimal::from(5),
            daily_stop_r: Decimal::from(-5),
            max_stop_failures: 3,
        }
    }
}

#[derive(Clone, Debug)]
struct OpenRecord {
    side: OptionSide,
    quantity: Qty,
    entry_price: Price,
    last_mark: Option<Price>,
}

/// One completed round trip.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ClosedTrade {
    pub symbol: Symbol,
    pub side: OptionSide,
    pub quantity: Qty,
    pub entry_price: Price,
    pub exit_price: Price,
    pub r_multiple: Decimal,
    pub reason: String,
}

/// Session rollup published on halt and at shutdown.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct SessionSummary {
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub realized_r: Decimal,
    pub unrealized_r: Decimal,
    pub session_r: Decimal,
    pub open_positions: usize,
}

/// Mirrors the engine's position records for R accounting.
pub struct PositionTracker {
    r_value: Price,
    open: HashMap<Symbol, OpenRecord>,
    closed: Vec<ClosedTrade>,
    realized_r: Decimal,
}

impl PositionTracker {
    #[must_use]
    pub fn new(r_value: Price) -> Self {
        Self {
            r_value,
            open: HashMap::new(),
            closed: Vec::new(),
            realized_r: Decimal::ZERO,
        }
    }

    pub fn on_opened(&mut self, position: &Position) {
        self.open.insert(
            position.symbol.clone(),
            OpenRecord {
                side: position.side,
                quantity: position.quantity,
                entry_price: position.entry_price,
                last_mark: None,
            },
        );
    }

    /// Record a close and return its R multiple.
    pub fn on_closed(
        &mut self,
        symbol: &str,
        exit_price: Price,
        reason: &str,
    ) -> Option<Decimal> {
        let record = self.open.remove(symbol)?;
        let r_multiple = (record.entry_price - exit_price) * Decimal::from(record.quantity)
            / self.r_value;
        self.realized_r += r_multiple;
        info!(
            %symbol,
            r = %r_multiple,
            session_r = %self.realized_r,
            "[RISK] trade closed"
        );
        self.closed.push(ClosedTrade {
            symbol: symbol.to_string(),
            side: record.side,
            quantity: record.quantity,
            entry_price: record.entry_price,
            exit_price,
            r_multiple,
            reason: reason.to_string(),
        });
        Some(r_multiple)
    }

    /// Mark an open position with the latest mid-of-bar price.
    pub fn mark(&mut self, symbol: &str, mid: Price) {
        if let Some(record) = self.open.get_mut(symbol) {
            record.last_mark = Some(mid);
        }
    }

    #[must_use]
    pub fn realized_r(&self) -> Decimal {
        self.realized_r
    }

    /// Unrealized R across open shorts from their latest marks.
    #[must_use]
    pub fn unrealized_r(&self) -> Decimal {
        self.open
            .values()
            .filter_map(|record| {
                let mark = record.last_mark?;
                Some((record.entry_price - mark) * Decimal::from(record.quantity) / self.r_value)
            })
            .sum()
    }

    /// Realized plus unrealized R for the session.
    #[must_use]
    pub fn session_r(&self) -> Decimal {
        self.realized_r + self.unrealized_r()
    }

    #[must_use]
    pub fn open_count(&self, side: Option<OptionSide>) -> usize {
        self.open
            .values()
            .filter(|record| side.map_or(true, |s| record.side == s))
            .count()
    }

    #[must_use]
    pub fn closed_trades(&self) -> &[ClosedTrade] {
        &self.closed
    }

    #[must_use]
    pub fn summary(&self) -> SessionSummary {
        let wins = self
            .closed
            .iter()
            .filter(|t| t.r_multiple > Decimal::ZERO)
            .count();
        SessionSummary {
            trades: self.closed.len(),
            wins,
            losses: self.closed.len() - wins,
            realized_r: self.realized_r,
            unrealized_r: self.unrealized_r(),
            session_r: self.session_r(),
            open_positions: self.open.len(),
        }
    }
}

/// Why the session latched shut.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    DailyTarget,
    DailyStop,
    SessionCutoff,
    StopFailures,
    DataStale,
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::DailyTarget => "daily target reached",
            Self::DailyStop => "daily stop reached",
            Self::SessionCutoff => "session cutoff",
            Self::StopFailures => "repeated stop failures",
            Self::DataStale => "market data stalled",
        };
        f.write_str(label)
    }
}

/// Entry admission and the session halt latch.
pub struct RiskGovernor {
    config: RiskConfig,
    clock: SessionClock,
    halted: Option<HaltReason>,
}

impl RiskGovernor {
    #[must_use]
    pub fn new(config: RiskConfig, clock: SessionClock) -> Self {
        Self {
            config,
            clock,
            halted: None,
        }
    }

    #[must_use]
    pub fn halted(&self) -> Option<HaltReason> {
        self.halted
    }

    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    /// Whether an entry slot (new or already resting) may be occupied on
    /// `side` right now. The side's own resting order is the prospective
    /// position being judged, so only the opposite side's pending order
    /// consumes extra cap room.
    #[must_use]
    pub fn admits(
        &self,
        tracker: &PositionTracker,
        side: OptionSide,
        pending_other_side: usize,
    ) -> bool {
        if self.is_halted() {
            return false;
        }
        if tracker.open_count(None) + pending_other_side >= self.config.max_positions {
            return false;
        }
        let side_cap = match side {
            OptionSide::Ce => self.config.max_ce_positions,
            OptionSide::Pe => self.config.max_pe_positions,
        };
        tracker.open_count(Some(side)) < side_cap
    }

    /// Evaluate halt conditions. Returns the reason only on the transition
    /// into the halted state; the latch never clears within a session.
    pub fn check(
        &mut self,
        tracker: &PositionTracker,
        stop_failures: u32,
        now: DateTime<Utc>,
    ) -> Option<HaltReason> {
        if self.halted.is_some() {
            return None;
        }
        let session_r = tracker.session_r();
        let reason = if session_r >= self.config.daily_target_r {
            Some(HaltReason::DailyTarget)
        } else if session_r <= self.config.daily_stop_r {
            Some(HaltReason::DailyStop)
        } else if self.clock.is_past_cutoff(now) {
            Some(HaltReason::SessionCutoff)
        } else if stop_failures >= self.config.max_stop_failures {
            Some(HaltReason::StopFailures)
        } else {
            None
        };
        if let Some(reason) = reason {
            warn!(%reason, session_r = %session_r, "[RISK] halt latch set");
            self.halted = Some(reason);
        }
        reason
    }

    /// Force the latch (shutdown, invariant violation).
    pub fn force_halt(&mut self, reason: HaltReason) {
        if self.halted.is_none() {
            warn!(%reason, "[RISK] halt latch forced");
            self.halted = Some(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use premia_core::{session::ist, PositionStatus};

    const CE: &str = "NIFTY06FEB2624200CE";
    const PE: &str = "NIFTY06FEB2624200PE";

    fn position(symbol: &str, side: OptionSide, qty: Qty, entry: i64) -> Position {
        Position {
            symbol: symbol.into(),
            side,
            quantity: qty,
            entry_price: Decimal::from(entry),
            entry_ts: Utc::now(),
            stop_order_id: None,
            stop_trigger: Decimal::from(entry + 11),
            status: PositionStatus::Active,
            exit_price: None,
            r_multiple: None,
        }
    }

    fn tracker() -> PositionTracker {
        PositionTracker::new(Decimal::from(6_500))
    }

    fn governor() -> RiskGovernor {
        RiskGovernor::new(RiskConfig::default(), SessionClock::default())
    }

    fn mid_session() -> DateTime<Utc> {
        ist()
            .with_ymd_and_hms(2026, 2, 2, 11, 0, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn realized_r_from_round_trip() {
        let mut tracker = tracker();
        tracker.on_opened(&position(CE, OptionSide::Ce, 585, 130));
        // Short covered 11 points lower: (130 - 119) * 585 / 6500 = 0.99
        let r = tracker.on_closed(CE, Decimal::from(119), "stop").unwrap();
        assert_eq!(r, Decimal::new(99, 2));
        assert_eq!(tracker.realized_r(), Decimal::new(99, 2));
        assert_eq!(tracker.open_count(None), 0);
    }

    #[test]
    fn unrealized_r_follows_marks() {
        let mut tracker = tracker();
        tracker.on_opened(&position(CE, OptionSide::Ce, 650, 130));
        assert_eq!(tracker.unrealized_r(), Decimal::ZERO);
        tracker.mark(CE, Decimal::from(120));
        // (130 - 120) * 650 / 6500 = 1R
        assert_eq!(tracker.unrealized_r(), Decimal::from(1));
        assert_eq!(tracker.session_r(), Decimal::from(1));
    }

    #[test]
    fn caps_limit_total_and_per_side() {
        let mut tracker = tracker();
        let governor = governor();
        for i in 0..3 {
            tracker.on_opened(&position(
                &format!("NIFTY06FEB262410{i}CE"),
                OptionSide::Ce,
                65,
                130,
            ));
        }
        // Third CE open: side cap reached.
        assert!(!governor.admits(&tracker, OptionSide::Ce, 0));
        assert!(governor.admits(&tracker, OptionSide::Pe, 0));

        tracker.on_opened(&position(PE, OptionSide::Pe, 65, 150));
        tracker.on_opened(&position("NIFTY06FEB2624300PE", OptionSide::Pe, 65, 150));
        // Five open in total: everything is rejected.
        assert!(!governor.admits(&tracker, OptionSide::Pe, 0));
        assert!(!governor.admits(&tracker, OptionSide::Ce, 0));
    }

    #[test]
    fn opposite_pending_consumes_total_cap_room() {
        let mut tracker = tracker();
        let governor = governor();
        tracker.on_opened(&position(CE, OptionSide::Ce, 65, 130));
        tracker.on_opened(&position("NIFTY06FEB2624100CE", OptionSide::Ce, 65, 130));
        tracker.on_opened(&position(PE, OptionSide::Pe, 65, 150));
        tracker.on_opened(&position("NIFTY06FEB2624300PE", OptionSide::Pe, 65, 150));
        // Four open. A resting PE entry is the prospective fifth, so a CE
        // slot on top of it would breach the total cap.
        assert!(!governor.admits(&tracker, OptionSide::Ce, 1));
        assert!(governor.admits(&tracker, OptionSide::Ce, 0));
    }

    #[test]
    fn halts_at_daily_target() {
        let mut tracker = tracker();
        let mut governor = governor();
        // Three closes worth +2.1, +1.6, +1.4 R.
        for (symbol, entry, exit, qty) in [
            ("NIFTY06FEB2624100CE", 130, 109, 650),
            ("NIFTY06FEB2624200CE", 150, 134, 650),
            ("NIFTY06FEB2624300CE", 140, 126, 650),
        ] {
            tracker.on_opened(&position(symbol, OptionSide::Ce, qty, entry));
            tracker.on_closed(symbol, Decimal::from(exit), "stop");
        }
        assert_eq!(tracker.realized_r(), Decimal::new(51, 1));
        let reason = governor.check(&tracker, 0, mid_session());
        assert_eq!(reason, Some(HaltReason::DailyTarget));
        // Latched: subsequent checks stay quiet, admission stays shut.
        assert_eq!(governor.check(&tracker, 0, mid_session()), None);
        assert!(!governor.admits(&tracker, OptionSide::Ce, 0));
    }

    #[test]
    fn halts_at_daily_stop_and_cutoff_and_stop_failures() {
        let mut stopped_tracker = tracker();
        let mut governor = governor();
        stopped_tracker.on_opened(&position(CE, OptionSide::Ce, 650, 130));
        stopped_tracker.mark(CE, Decimal::from(182)); // -5.2R unrealized
        assert_eq!(
            governor.check(&stopped_tracker, 0, mid_session()),
            Some(HaltReason::DailyStop)
        );

        let mut governor = RiskGovernor::new(RiskConfig::default(), SessionClock::default());
        let after_cutoff = ist()
            .with_ymd_and_hms(2026, 2, 2, 15, 16, 0)
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            governor.check(&tracker(), 0, after_cutoff),
            Some(HaltReason::SessionCutoff)
        );

        let mut governor = RiskGovernor::new(RiskConfig::default(), SessionClock::default());
        assert_eq!(
            governor.check(&tracker(), 3, mid_session()),
            Some(HaltReason::StopFailures)
        );
    }

    #[test]
    fn summary_rolls_up_session() {
        let mut tracker = tracker();
        tracker.on_opened(&position(CE, OptionSide::Ce, 650, 130));
        tracker.on_closed(CE, Decimal::from(120), "stop");
        tracker.on_opened(&position(PE, OptionSide::Pe, 650, 150));
        tracker.on_closed(PE, Decimal::from(160), "stop");
        tracker.on_opened(&position("NIFTY06FEB2624300CE", OptionSide::Ce, 650, 140));
        tracker.mark("NIFTY06FEB2624300CE", Decimal::from(135));

        let summary = tracker.summary();
        assert_eq!(summary.trades, 2);
        assert_eq!(summary.wins, 1);
        assert_eq!(summary.losses, 1);
        assert_eq!(summary.open_positions, 1);
        assert_eq!(summary.session_r, summary.realized_r + summary.unrealized_r);
    }
}
