//! WaitExpr - 相対時間の表現（"+5 seconds" など）
//!
//! dispatch の遅延指定や retry の待ち時間指定に使う。
//!
//! # 受け付ける形式
//! - `now`
//! - `+N unit` / `N unit`（unit: second/minute/hour/day/week、複数形・短縮形も可）
//! - `Ns`, `Nm`, `Nh`, `Nd`, `Nw`

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitParseError {
    #[error("empty wait expression")]
    Empty,

    #[error("invalid wait amount in '{0}'")]
    InvalidAmount(String),

    #[error("unknown time unit '{unit}' in '{input}'")]
    UnknownUnit { unit: String, input: String },

    #[error("negative wait '{0}' is not allowed")]
    Negative(String),
}

/// A non-negative relative delay, at most [`WaitExpr::MAX`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WaitExpr {
    seconds: i64,
}

impl WaitExpr {
    /// No delay.
    pub const NOW: WaitExpr = WaitExpr { seconds: 0 };

    /// 上限は 100 年（36500 日）。これ以上は書き間違いとみなす
    pub const MAX: WaitExpr = WaitExpr {
        seconds: 36_500 * 86_400,
    };

    /// Clamped into `0..=MAX`.
    pub fn seconds(seconds: i64) -> Self {
        Self {
            seconds: seconds.clamp(0, Self::MAX.seconds),
        }
    }

    pub fn from_std(duration: std::time::Duration) -> Self {
        Self::seconds(i64::try_from(duration.as_secs()).unwrap_or(i64::MAX))
    }

    pub fn parse(input: &str) -> Result<Self, WaitParseError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(WaitParseError::Empty);
        }
        if trimmed.eq_ignore_ascii_case("now") {
            return Ok(Self::NOW);
        }
        if trimmed.starts_with('-') {
            return Err(WaitParseError::Negative(input.to_string()));
        }

        let body = trimmed.trim_start_matches('+').trim_start();
        let split = body
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(body.len());
        let (amount, unit) = body.split_at(split);

        let amount: i64 = amount
            .parse()
            .map_err(|_| WaitParseError::InvalidAmount(input.to_string()))?;

        let unit = unit.trim().to_ascii_lowercase();
        let per_unit = match unit.as_str() {
            "" | "s" | "sec" | "secs" | "second" | "seconds" => 1,
            "m" | "min" | "mins" | "minute" | "minutes" => 60,
            "h" | "hr" | "hrs" | "hour" | "hours" => 3_600,
            "d" | "day" | "days" => 86_400,
            "w" | "week" | "weeks" => 604_800,
            _ => {
                return Err(WaitParseError::UnknownUnit {
                    unit,
                    input: input.to_string(),
                });
            }
        };

        amount
            .checked_mul(per_unit)
            .filter(|secs| *secs <= Self::MAX.seconds)
            .map(Self::seconds)
            .ok_or_else(|| WaitParseError::InvalidAmount(input.to_string()))
    }

    pub fn as_duration(&self) -> Duration {
        // seconds は MAX 以下に丸めてあるので try_seconds は失敗しない
        Duration::try_seconds(self.seconds).unwrap_or_else(Duration::zero)
    }

    pub fn as_secs(&self) -> i64 {
        self.seconds
    }

    /// `from + self`, or `None` when that falls off the calendar.
    pub fn after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        from.checked_add_signed(self.as_duration())
    }
}

impl Default for WaitExpr {
    fn default() -> Self {
        Self::NOW
    }
}

impl FromStr for WaitExpr {
    type Err = WaitParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for WaitExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.seconds == 0 {
            f.write_str("now")
        } else {
            write!(f, "+{} seconds", self.seconds)
        }
    }
}

impl Serialize for WaitExpr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for WaitExpr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
