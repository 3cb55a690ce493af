//! Recurrence specification: a closed variant parsed once at the API boundary.
//!
//! Grammar (case-insensitive):
//! - `none` or empty → one-shot (parses to `None`)
//! - `minutely`, `hourly`, `daily`, `weekly`, `monthly`, `yearly`/`annually`
//! - a bare unit: `minute`, `hour`, `day`, `week`, `fortnight`, `month`, `year`
//! - `every <unit>` or `every <N> <unit>[s]` with N ≥ 1

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ChimeError, Result};

/// Calendar unit a recurrence advances by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl TimeUnit {
    fn from_word(word: &str) -> Option<Self> {
        let unit = match word {
            "min" | "mins" | "minute" | "minutes" => TimeUnit::Minute,
            "hr" | "hrs" | "hour" | "hours" => TimeUnit::Hour,
            "day" | "days" => TimeUnit::Day,
            "week" | "weeks" => TimeUnit::Week,
            "month" | "months" => TimeUnit::Month,
            "year" | "years" => TimeUnit::Year,
            _ => return None,
        };
        Some(unit)
    }

    fn adverb(self) -> &'static str {
        match self {
            TimeUnit::Minute => "minutely",
            TimeUnit::Hour => "hourly",
            TimeUnit::Day => "daily",
            TimeUnit::Week => "weekly",
            TimeUnit::Month => "monthly",
            TimeUnit::Year => "yearly",
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimeUnit::Minute => "minute",
            TimeUnit::Hour => "hour",
            TimeUnit::Day => "day",
            TimeUnit::Week => "week",
            TimeUnit::Month => "month",
            TimeUnit::Year => "year",
        };
        f.write_str(name)
    }
}

/// How a task repeats after it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Recurrence {
    /// A fixed named interval ("hourly", "daily", ...).
    Named(TimeUnit),
    /// Every `n` units, `n` ≥ 1.
    Every { n: u32, unit: TimeUnit },
}

impl Recurrence {
    /// Parse a recurrence spec. `Ok(None)` means one-shot.
    pub fn parse(spec: &str) -> Result<Option<Self>> {
        let normalized = spec.trim().to_lowercase();
        let words: Vec<&str> = normalized.split_whitespace().collect();
        let invalid = || ChimeError::InvalidRecurrence(spec.trim().to_string());

        let recurrence = match words.as_slice() {
            [] | ["none"] => return Ok(None),
            ["minutely"] => Recurrence::Named(TimeUnit::Minute),
            ["hourly"] => Recurrence::Named(TimeUnit::Hour),
            ["daily"] => Recurrence::Named(TimeUnit::Day),
            ["weekly"] => Recurrence::Named(TimeUnit::Week),
            ["monthly"] => Recurrence::Named(TimeUnit::Month),
            ["yearly"] | ["annually"] => Recurrence::Named(TimeUnit::Year),
            ["fortnight"] | ["fortnightly"] | ["every", "fortnight"] => Recurrence::Every {
                n: 2,
                unit: TimeUnit::Week,
            },
            [word] | ["every", word] => {
                Recurrence::Named(TimeUnit::from_word(word).ok_or_else(invalid)?)
            }
            ["every", count, word] => {
                let n: u32 = count.parse().map_err(|_| invalid())?;
                if n == 0 {
                    return Err(invalid());
                }
                let unit = TimeUnit::from_word(word).ok_or_else(invalid)?;
                Recurrence::Every { n, unit }
            }
            _ => return Err(invalid()),
        };
        Ok(Some(recurrence))
    }

    /// Unit and multiplier this recurrence advances by.
    pub fn step(&self) -> (u32, TimeUnit) {
        match *self {
            Recurrence::Named(unit) => (1, unit),
            Recurrence::Every { n, unit } => (n, unit),
        }
    }
}

impl fmt::Display for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recurrence::Named(unit) => f.write_str(unit.adverb()),
            Recurrence::Every { n: 1, unit } => write!(f, "every 1 {unit}"),
            Recurrence::Every { n, unit } => write!(f, "every {n} {unit}s"),
        }
    }
}

impl From<Recurrence> for String {
    fn from(r: Recurrence) -> Self {
        r.to_string()
    }
}

impl TryFrom<String> for Recurrence {
    type Error = ChimeError;

    fn try_from(value: String) -> Result<Self> {
        Recurrence::parse(&value)?
            .ok_or_else(|| ChimeError::InvalidRecurrence(format!("'{value}' is not recurring")))
    }
}
