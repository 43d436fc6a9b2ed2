//! Dual-source tick routing with automatic failover and switchback.
//!
//! The primary feed's tick times are tracked even while the backup is
//! active; switchback only trusts those, never backup traffic.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use premia_core::{Symbol, Tick, TickSource};

/// Source transition surfaced to the coordinator for logging/notification.
#[derive(Clone, Debug, PartialEq)]
pub enum FeedEvent {
    FailedOver { idle_secs: i64 },
    SwitchedBack { stable_secs: i64 },
}

/// Routes ticks from two independent sources into one downstream stream.
pub struct FeedSupervisor {
    active: TickSource,
    stale_after: Duration,
    switchback_after: Duration,
    started_at: DateTime<Utc>,
    last_primary_tick: Option<DateTime<Utc>>,
    last_backup_tick: Option<DateTime<Utc>>,
    primary_live_since: Option<DateTime<Utc>>,
    last_tick_by_symbol: HashMap<Symbol, DateTime<Utc>>,
}

impl FeedSupervisor {
    #[must_use]
    pub fn new(stale_after: Duration, switchback_after: Duration, now: DateTime<Utc>) -> Self {
        Self {
            active: TickSource::Primary,
            stale_after,
            switchback_after,
            started_at: now,
            last_primary_tick: None,
            last_backup_tick: None,
            primary_live_since: None,
            last_tick_by_symbol: HashMap::new(),
        }
    }

    #[must_use]
    pub fn active(&self) -> TickSource {
        self.active
    }

    /// Route one tick. Returns whether it should flow downstream, plus any
    /// source transition it caused.
    pub fn route(&mut self, tick: &Tick, now: DateTime<Utc>) -> (bool, Option<FeedEvent>) {
        let mut event = None;
        match tick.source {
            TickSource::Primary => {
                let prev = self.last_primary_tick;
                self.last_primary_tick = Some(now);
                if self.active == TickSource::Backup {
                    // Continuity window: a gap wider than the stale threshold
                    // restarts the stability clock.
                    let continuous = prev.is_some_and(|p| now - p <= self.stale_after);
                    if !continuous {
                        self.primary_live_since = Some(now);
                        info!("primary ticks resumed, monitoring for switchback");
                    }
                    let since = self.primary_live_since.unwrap_or(now);
                    if now - since >= self.switchback_after {
                        let stable_secs = (now - since).num_seconds();
                        self.active = TickSource::Primary;
                        // Drop stale bookkeeping so the fresh regime cannot
                        // immediately re-trigger failover.
                        self.last_primary_tick = Some(now);
                        self.primary_live_since = None;
                        info!(stable_secs, "switched back to primary feed");
                        event = Some(FeedEvent::SwitchedBack { stable_secs });
                    }
                }
            }
            TickSource::Backup => {
                self.last_backup_tick = Some(now);
            }
        }
        let forward = tick.source == self.active;
        if forward {
            self.last_tick_by_symbol.insert(tick.symbol.clone(), now);
        }
        (forward, event)
    }

    /// Timer-driven staleness evaluation; catches a primary that went fully
    /// silent (no ticks to route).
    pub fn check_staleness(&mut self, now: DateTime<Utc>) -> Option<FeedEvent> {
        if self.active != TickSource::Primary {
            return None;
        }
        let reference = self.last_primary_tick.unwrap_or(self.started_at);
        let idle = now - reference;
        if idle > self.stale_after {
            self.active = TickSource::Backup;
            self.primary_live_since = None;
            let idle_secs = idle.num_seconds();
            warn!(idle_secs, "primary feed stale, failing over to backup");
            return Some(FeedEvent::FailedOver { idle_secs });
        }
        None
    }

    /// Immediate failover on a reported connection drop.
    pub fn primary_disconnected(&mut self, now: DateTime<Utc>) -> Option<FeedEvent> {
        if self.active != TickSource::Primary {
            return None;
        }
        self.active = TickSource::Backup;
        self.primary_live_since = None;
        let idle_secs = self
            .last_primary_tick
            .map(|t| (now - t).num_seconds())
            .unwrap_or(0);
        warn!("primary feed connection dropped, failing over to backup");
        Some(FeedEvent::FailedOver { idle_secs })
    }

    /// True once either source has delivered at least one tick. Coverage
    /// checks are meaningless before this.
    #[must_use]
    pub fn has_seen_data(&self) -> bool {
        self.last_primary_tick.is_some() || self.last_backup_tick.is_some()
    }

    /// True when neither source has delivered a tick within `timeout`.
    #[must_use]
    pub fn both_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        let primary_dead = self
            .last_primary_tick
            .map_or(now - self.started_at > timeout, |t| now - t > timeout);
        let backup_dead = self
            .last_backup_tick
            .map_or(now - self.started_at > timeout, |t| now - t > timeout);
        primary_dead && backup_dead
    }

    /// Fraction of `subscribed` symbols with a forwarded tick younger than
    /// `max_age`. Used by the data watchdog.
    #[must_use]
    pub fn coverage(&self, subscribed: usize, now: DateTime<Utc>, max_age: Duration) -> f64 {
        if subscribed == 0 {
            return 1.0;
        }
        let fresh = self
            .last_tick_by_symbol
            .values()
            .filter(|t| now - **t <= max_age)
            .count();
        fresh as f64 / subscribed as f64
    }
}
