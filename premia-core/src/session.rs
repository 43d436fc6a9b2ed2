//! Trading session clock for the NSE cash/derivatives session (IST).

use chrono::{DateTime, FixedOffset, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// IST has no DST; a fixed offset is sufficient.
#[must_use]
pub fn ist() -> FixedOffset {
    FixedOffset::east_opt(5 * 3600 + 30 * 60).expect("IST offset is valid")
}

/// Session boundaries in exchange-local time.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct SessionClock {
    pub open: NaiveTime,
    /// Hard flattening cutoff; no entries survive past this point.
    pub force_exit: NaiveTime,
    pub close: NaiveTime,
}

impl Default for SessionClock {
    fn default() -> Self {
        Self {
            open: NaiveTime::from_hms_opt(9, 15, 0).unwrap(),
            force_exit: NaiveTime::from_hms_opt(15, 15, 0).unwrap(),
            close: NaiveTime::from_hms_opt(15, 30, 0).unwrap(),
        }
    }
}

impl SessionClock {
    /// Exchange-local wall-clock time of a timestamp.
    #[must_use]
    pub fn local_time(&self, ts: DateTime<Utc>) -> NaiveTime {
        ts.with_timezone(&ist()).time()
    }

    /// True while the market is trading.
    #[must_use]
    pub fn is_open(&self, ts: DateTime<Utc>) -> bool {
        let t = self.local_time(ts);
        t >= self.open && t <= self.close
    }

    /// True once the forced-flattening cutoff has been reached.
    #[must_use]
    pub fn is_past_cutoff(&self, ts: DateTime<Utc>) -> bool {
        self.local_time(ts) >= self.force_exit
    }
}

/// Floor a timestamp to its wall-clock minute. IST is a whole-minute offset,
/// so flooring in UTC lands on the same boundary the exchange uses.
#[must_use]
pub fn minute_floor(ts: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_opt(ts.timestamp() - i64::from(ts.second()), 0)
        .single()
        .unwrap_or(ts)
}
