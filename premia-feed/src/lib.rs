//! Market data plumbing: dual-source supervision and bar aggregation.

mod bars;
mod supervisor;

pub use bars::BarAggregator;
pub use supervisor::{FeedEvent, FeedSupervisor};
