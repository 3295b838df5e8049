use crate::error::ValidationError;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

const SECS_PER_MINUTE: u32 = 60;
const SECS_PER_HOUR: u32 = 60 * SECS_PER_MINUTE;
const SECS_PER_DAY: u32 = 24 * SECS_PER_HOUR;
const SECS_PER_WEEK: u32 = 7 * SECS_PER_DAY;

/// Candle interval measured in whole seconds.
///
/// Parsed from `<count><unit>` where unit is one of `s`, `m`, `h`, `d`, `w` (eg/ "1m", "15m",
/// "4h"). Always displayed in canonical form using the largest unit that divides it exactly, so
/// "60s" and "1m" are the same [`Timeframe`].
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timeframe {
    secs: u32,
}

impl Timeframe {
    pub const S1: Self = Self { secs: 1 };
    pub const M1: Self = Self { secs: SECS_PER_MINUTE };
    pub const M5: Self = Self { secs: 5 * SECS_PER_MINUTE };
    pub const M15: Self = Self { secs: 15 * SECS_PER_MINUTE };
    pub const H1: Self = Self { secs: SECS_PER_HOUR };
    pub const D1: Self = Self { secs: SECS_PER_DAY };

    /// Construct a [`Timeframe`] from a number of seconds, which must be non-zero.
    pub fn from_secs(secs: u32) -> Option<Self> {
        (secs > 0).then_some(Self { secs })
    }

    pub fn secs(&self) -> u32 {
        self.secs
    }

    pub fn duration(&self) -> TimeDelta {
        TimeDelta::seconds(i64::from(self.secs))
    }

    /// Start of the bucket `time` falls into: `floor(time / interval) * interval`.
    ///
    /// Millisecond precision with floor division, so timestamps before the Unix epoch still map
    /// to the bucket that contains them.
    pub fn bucket_start(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        let interval_ms = i64::from(self.secs) * 1_000;
        let start_ms = time.timestamp_millis().div_euclid(interval_ms) * interval_ms;
        DateTime::from_timestamp_millis(start_ms).unwrap_or(time)
    }

    /// Number of whole intervals between two bucket starts.
    pub fn intervals_between(&self, earlier: DateTime<Utc>, later: DateTime<Utc>) -> u64 {
        let delta_secs = (later - earlier).num_seconds();
        if delta_secs <= 0 {
            0
        } else {
            delta_secs as u64 / u64::from(self.secs)
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (count, unit) = [
            (SECS_PER_WEEK, 'w'),
            (SECS_PER_DAY, 'd'),
            (SECS_PER_HOUR, 'h'),
            (SECS_PER_MINUTE, 'm'),
        ]
        .into_iter()
        .find(|(unit_secs, _)| self.secs % unit_secs == 0)
        .map(|(unit_secs, unit)| (self.secs / unit_secs, unit))
        .unwrap_or((self.secs, 's'));

        write!(f, "{count}{unit}")
    }
}

impl FromStr for Timeframe {
    type Err = ValidationError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::Timeframe(input.to_string());

        let trimmed = input.trim();
        let unit = trimmed.chars().last().ok_or_else(invalid)?;
        let unit_secs = match unit.to_ascii_lowercase() {
            's' => 1,
            'm' => SECS_PER_MINUTE,
            'h' => SECS_PER_HOUR,
            'd' => SECS_PER_DAY,
            'w' => SECS_PER_WEEK,
            _ => return Err(invalid()),
        };

        let count = trimmed[..trimmed.len() - unit.len_utf8()]
            .parse::<u32>()
            .map_err(|_| invalid())?;

        count
            .checked_mul(unit_secs)
            .and_then(Self::from_secs)
            .ok_or_else(invalid)
    }
}

impl TryFrom<String> for Timeframe {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(value: Timeframe) -> Self {
        value.to_string()
    }
}
