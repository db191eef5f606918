use chrono::{DateTime, Datelike, Duration, NaiveDateTime, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketState {
    Open,
    ClosedPre,
    ClosedPost,
    Weekend,
}

/// Pure classifier over an instant in the configured market timezone. Holds no
/// mutable state; every call is independent of every other.
#[derive(Debug, Clone)]
pub struct MarketClock {
    timezone: Tz,
    open: NaiveTime,
    close: NaiveTime,
}

impl MarketClock {
    pub fn new(timezone: Tz, open: NaiveTime, close: NaiveTime) -> Self {
        Self { timezone, open, close }
    }

    pub fn classify(&self, instant: DateTime<Utc>) -> MarketState {
        let local = instant.with_timezone(&self.timezone);
        if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return MarketState::Weekend;
        }
        let t = local.time();
        if t < self.open {
            MarketState::ClosedPre
        } else if t > self.close {
            MarketState::ClosedPost
        } else {
            MarketState::Open
        }
    }

    /// `is_amo` rule: anything not classified `Open` routes to the AMO channel.
    pub fn is_amo(&self, instant: DateTime<Utc>) -> bool {
        self.classify(instant) != MarketState::Open
    }

    /// Interprets a naive date/time as local to the configured market
    /// timezone, returning the resulting absolute instant. Source-timezone
    /// parsing is done once here so downstream components stay timezone-agnostic.
    pub fn timezone_local(&self, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
        self.timezone
            .from_local_datetime(&naive)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Next instant classified `Open`, skipping weekends. Logging helper only;
    /// never consulted for dispatch decisions.
    pub fn next_open(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        let mut day = from.with_timezone(&self.timezone).date_naive();
        loop {
            let weekday_ok = !matches!(day.weekday(), Weekday::Sat | Weekday::Sun);
            if weekday_ok {
                if let Some(candidate) = day.and_time(self.open).and_local_timezone(self.timezone).single() {
                    let candidate_utc = candidate.with_timezone(&Utc);
                    if candidate_utc >= from {
                        return candidate_utc;
                    }
                }
            }
            day += Duration::days(1);
        }
    }
}
