//! Watch-based swing confirmation with strict alternation.
//!
//! A pending candidate is the most extreme bar seen since the last
//! alternation. Its watch counter advances on later bars that close away
//! from it (strictly higher high AND strictly higher close for a low
//! candidate; the mirror image for a high). Two watches confirm. Between
//! alternations a more extreme bar that itself earns two watches moves the
//! active swing in place instead of creating a new one.

use chrono::{DateTime, Utc};
use tracing::debug;

use premia_core::{Bar, Price, Swing, SwingKind, Symbol};

/// Confirmation threshold for a pending candidate.
const WATCH_CONFIRMATIONS: u32 = 2;

/// State transitions emitted on bar close, in emission order: updates first,
/// then confirmations, then violations.
#[derive(Clone, Debug, PartialEq)]
pub enum SwingEvent {
    Confirmed(Swing),
    Updated {
        symbol: Symbol,
        kind: SwingKind,
        price: Price,
        at: DateTime<Utc>,
    },
    /// Price traded through the active swing level. Informational: the swing
    /// itself only dies when the break has an entry consequence or the level
    /// migrates via an in-place update.
    Broken {
        symbol: Symbol,
        kind: SwingKind,
        price: Price,
        breaking_price: Price,
    },
}

#[derive(Clone, Debug)]
struct Candidate {
    index: usize,
    high: Price,
    low: Price,
    close: Price,
    vwap: Price,
    minute: DateTime<Utc>,
    watch: u32,
}

impl Candidate {
    fn from_bar(index: usize, bar: &Bar) -> Self {
        Self {
            index,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            vwap: bar.vwap_at_close,
            minute: bar.minute_start,
            watch: 0,
        }
    }
}

#[derive(Clone, Debug)]
struct ActiveSwing {
    swing: Swing,
    violated: bool,
}

/// One detector instance per subscribed symbol.
pub struct SwingDetector {
    symbol: Symbol,
    bars: Vec<Bar>,
    base_index: usize,
    max_window: usize,
    last_confirmed: Option<SwingKind>,
    active_low: Option<ActiveSwing>,
    active_high: Option<ActiveSwing>,
    pending_low: Option<Candidate>,
    pending_high: Option<Candidate>,
}

impl SwingDetector {
    #[must_use]
    pub fn new(symbol: impl Into<Symbol>) -> Self {
        Self {
            symbol: symbol.into(),
            bars: Vec::new(),
            base_index: 0,
            // One trading session is 375 minutes; keep headroom.
            max_window: 400,
            last_confirmed: None,
            active_low: None,
            active_high: None,
            pending_low: None,
            pending_high: None,
        }
    }

    /// The currently active swing low, if any.
    #[must_use]
    pub fn active_low(&self) -> Option<&Swing> {
        self.active_low.as_ref().map(|a| &a.swing)
    }

    /// Process one closed bar and return the resulting transitions.
    pub fn on_bar_close(&mut self, bar: &Bar) -> Vec<SwingEvent> {
        let index = self.base_index + self.bars.len();
        self.bars.push(bar.clone());
        if self.bars.len() > self.max_window {
            self.bars.remove(0);
            self.base_index += 1;
        }

        let mut events = Vec::new();

        self.advance_watches(bar);
        self.reanchor_low(index, bar);
        self.reanchor_high(index, bar);
        self.try_update_in_place(&mut events);
        self.try_confirm(&mut events);
        self.detect_violations(bar, &mut events);

        events
    }

    fn advance_watches(&mut self, bar: &Bar) {
        if let Some(cand) = self.pending_low.as_mut() {
            if bar.high > cand.high && bar.close > cand.close {
                cand.watch += 1;
            }
        }
        if let Some(cand) = self.pending_high.as_mut() {
            if bar.low < cand.low && bar.close < cand.close {
                cand.watch += 1;
            }
        }
    }

    fn reanchor_low(&mut self, index: usize, bar: &Bar) {
        let tracking = match (self.last_confirmed, &self.active_low) {
            // A low may confirm next: track the window extreme.
            (None, _) | (Some(SwingKind::High), _) => true,
            // Update path: only bars beneath the active level qualify.
            (Some(SwingKind::Low), Some(active)) => bar.low < active.swing.price,
            // Level already consumed by a break; wait for alternation.
            (Some(SwingKind::Low), None) => false,
        };
        if !tracking {
            return;
        }
        let more_extreme = self
            .pending_low
            .as_ref()
            .map_or(true, |cand| bar.low < cand.low);
        if more_extreme {
            self.pending_low = Some(Candidate::from_bar(index, bar));
        }
    }

    fn reanchor_high(&mut self, index: usize, bar: &Bar) {
        let tracking = match (self.last_confirmed, &self.active_high) {
            (None, _) | (Some(SwingKind::Low), _) => true,
            (Some(SwingKind::High), Some(active)) => bar.high > active.swing.price,
            (Some(SwingKind::High), None) => false,
        };
        if !tracking {
            return;
        }
        let more_extreme = self
            .pending_high
            .as_ref()
            .map_or(true, |cand| bar.high > cand.high);
        if more_extreme {
            self.pending_high = Some(Candidate::from_bar(index, bar));
        }
    }

    fn try_update_in_place(&mut self, events: &mut Vec<SwingEvent>) {
        if self.last_confirmed == Some(SwingKind::Low) {
            let confirmed = self
                .pending_low
                .as_ref()
                .filter(|c| c.watch >= WATCH_CONFIRMATIONS)
                .cloned();
            if let (Some(cand), Some(active)) = (confirmed, self.active_low.as_mut()) {
                if cand.low < active.swing.price {
                    active.swing.price = cand.low;
                    active.swing.formed_at = cand.minute;
                    active.violated = false;
                    debug!(symbol = %self.symbol, price = %cand.low, "swing low updated in place");
                    events.push(SwingEvent::Updated {
                        symbol: self.symbol.clone(),
                        kind: SwingKind::Low,
                        price: cand.low,
                        at: cand.minute,
                    });
                    let from = cand.index + 1;
                    self.pending_low = None;
                    self.pending_high = self.recompute_candidate(SwingKind::High, from);
                }
            }
        }
        if self.last_confirmed == Some(SwingKind::High) {
            let confirmed = self
                .pending_high
                .as_ref()
                .filter(|c| c.watch >= WATCH_CONFIRMATIONS)
                .cloned();
            if let (Some(cand), Some(active)) = (confirmed, self.active_high.as_mut()) {
                if cand.high > active.swing.price {
                    active.swing.price = cand.high;
                    active.swing.formed_at = cand.minute;
                    active.violated = false;
                    events.push(SwingEvent::Updated {
                        symbol: self.symbol.clone(),
                        kind: SwingKind::High,
                        price: cand.high,
                        at: cand.minute,
                    });
                    let from = cand.index + 1;
                    self.pending_high = None;
                    self.pending_low = self.recompute_candidate(SwingKind::Low, from);
                }
            }
        }
    }

    fn try_confirm(&mut self, events: &mut Vec<SwingEvent>) {
        if self.last_confirmed != Some(SwingKind::Low) {
            let confirmed = self
                .pending_low
                .as_ref()
                .filter(|c| c.watch >= WATCH_CONFIRMATIONS)
                .cloned();
            if let Some(cand) = confirmed {
                let swing = Swing {
                    symbol: self.symbol.clone(),
                    kind: SwingKind::Low,
                    price: cand.low,
                    formed_at: cand.minute,
                    vwap_at_formation: cand.vwap,
                };
                debug!(symbol = %self.symbol, price = %cand.low, "swing low confirmed");
                events.push(SwingEvent::Confirmed(swing.clone()));
                self.active_low = Some(ActiveSwing {
                    swing,
                    violated: false,
                });
                self.last_confirmed = Some(SwingKind::Low);
                self.pending_low = None;
                self.pending_high = self.recompute_candidate(SwingKind::High, cand.index + 1);
                return;
            }
        }
        if self.last_confirmed != Some(SwingKind::High) {
            let confirmed = self
                .pending_high
                .as_ref()
                .filter(|c| c.watch >= WATCH_CONFIRMATIONS)
                .cloned();
            if let Some(cand) = confirmed {
                let swing = Swing {
                    symbol: self.symbol.clone(),
                    kind: SwingKind::High,
                    price: cand.high,
                    formed_at: cand.minute,
                    vwap_at_formation: cand.vwap,
                };
                debug!(symbol = %self.symbol, price = %cand.high, "swing high confirmed");
                events.push(SwingEvent::Confirmed(swing.clone()));
                self.active_high = Some(ActiveSwing {
                    swing,
                    violated: false,
                });
                self.last_confirmed = Some(SwingKind::High);
                self.pending_high = None;
                self.pending_low = self.recompute_candidate(SwingKind::Low, cand.index + 1);
            }
        }
    }

    fn detect_violations(&mut self, bar: &Bar, events: &mut Vec<SwingEvent>) {
        if let Some(active) = self.active_low.as_mut() {
            if !active.violated && bar.low <= active.swing.price {
                active.violated = true;
                events.push(SwingEvent::Broken {
                    symbol: self.symbol.clone(),
                    kind: SwingKind::Low,
                    price: active.swing.price,
                    breaking_price: bar.low,
                });
            }
        }
        if let Some(active) = self.active_high.as_mut() {
            if !active.violated && bar.high >= active.swing.price {
                active.violated = true;
                events.push(SwingEvent::Broken {
                    symbol: self.symbol.clone(),
                    kind: SwingKind::High,
                    price: active.swing.price,
                    breaking_price: bar.high,
                });
            }
        }
    }

    /// Rebuild the pending candidate of `kind` from the window starting at
    /// absolute bar index `from`, replaying watch counts from later bars.
    fn recompute_candidate(&self, kind: SwingKind, from: usize) -> Option<Candidate> {
        let start = from.saturating_sub(self.base_index);
        let window = self.bars.get(start..)?;
        if window.is_empty() {
            return None;
        }
        let (offset, extreme) = window.iter().enumerate().fold(
            None::<(usize, &Bar)>,
            |best, (i, bar)| match (kind, best) {
                (_, None) => Some((i, bar)),
                (SwingKind::Low, Some((_, b))) if bar.low < b.low => Some((i, bar)),
                (SwingKind::High, Some((_, b))) if bar.high > b.high => Some((i, bar)),
                (_, Some(best)) => Some(best),
            },
        )?;
        let mut cand = Candidate::from_bar(self.base_index + start + offset, extreme);
        for later in &window[offset + 1..] {
            match kind {
                SwingKind::Low if later.high > cand.high && later.close > cand.close => {
                    cand.watch += 1;
                }
                SwingKind::High if later.low < cand.low && later.close < cand.close => {
                    cand.watch += 1;
                }
                _ => {}
            }
        }
        Some(cand)
    }
}
