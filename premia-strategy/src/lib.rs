//! Decision pipeline: per-symbol swing confirmation feeding the
//! three-stage entry filter.

mod filter;
mod swing;

pub use filter::{
    BestPerSide, DynamicCandidate, FilterConfig, FilterEngine, GateOutcome, MarketView,
    StaticCandidate,
};
pub use swing::{SwingDetector, SwingEvent};
