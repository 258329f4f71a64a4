//! Five-field cron expressions evaluated in UTC.
//!
//! Supports `*`, `*/n`, `a-b`, `a-b/n`, comma lists, month and weekday
//! names, and the `@hourly`, `@daily`, `@weekly`, `@monthly`, `@yearly`
//! macros. When both day-of-month and day-of-week are restricted a time
//! matches if either does, as in classic cron.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use std::fmt;
use std::str::FromStr;

use crate::{Result, VaultError};

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];
/// Search horizon for `next_after`; covers leap-day-only schedules
const MAX_SEARCH_YEARS: i32 = 5;

/// Allowed values of one field, as a bitset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CronField {
    bits: u64,
    /// Written as `*` (or `*/1`), which matters for the day-field OR rule
    wildcard: bool,
}

impl CronField {
    fn parse(raw: &str, min: u32, max: u32, names: &[&str], name_base: u32) -> std::result::Result<Self, String> {
        let mut bits = 0u64;
        let wildcard = raw == "*";

        for part in raw.split(',') {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step
                        .parse()
                        .map_err(|_| format!("invalid step '{step}'"))?;
                    if step == 0 {
                        return Err("step must be positive".to_string());
                    }
                    (range, step)
                }
                None => (part, 1),
            };

            let (lo, hi) = if range == "*" {
                (min, max)
            } else if let Some((a, b)) = range.split_once('-') {
                (
                    parse_value(a, names, name_base)?,
                    parse_value(b, names, name_base)?,
                )
            } else {
                let v = parse_value(range, names, name_base)?;
                // `5/15` means from 5 to the end in steps of 15
                (v, if step > 1 { max } else { v })
            };

            if lo < min || hi > max || lo > hi {
                return Err(format!("'{part}' is outside {min}-{max}"));
            }
            let mut v = lo;
            while v <= hi {
                bits |= 1 << v;
                v += step;
            }
        }
        Ok(Self { bits, wildcard })
    }

    pub fn contains(&self, value: u32) -> bool {
        value < 64 && self.bits & (1 << value) != 0
    }

    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }
}

fn parse_value(raw: &str, names: &[&str], name_base: u32) -> std::result::Result<u32, String> {
    if let Ok(v) = raw.parse() {
        return Ok(v);
    }
    let lower = raw.to_ascii_lowercase();
    names
        .iter()
        .position(|n| *n == lower)
        .map(|idx| idx as u32 + name_base)
        .ok_or_else(|| format!("invalid value '{raw}'"))
}

/// A parsed schedule expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let trimmed = expr.trim();
        let expanded = match trimmed {
            "@hourly" => "0 * * * *",
            "@daily" | "@midnight" => "0 0 * * *",
            "@weekly" => "0 0 * * 0",
            "@monthly" => "0 0 1 * *",
            "@yearly" | "@annually" => "0 0 1 1 *",
            other => other,
        };
        let error = |reason: String| VaultError::Cron {
            expr: expr.to_string(),
            reason,
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(error(format!("expected 5 fields, found {}", fields.len())));
        }

        let mut day_of_week = CronField::parse(fields[4], 0, 7, &DAY_NAMES, 0).map_err(error)?;
        // 7 is an alias for Sunday
        if day_of_week.contains(7) {
            day_of_week.bits = (day_of_week.bits & !(1 << 7)) | 1;
        }

        Ok(Self {
            source: trimmed.to_string(),
            minute: CronField::parse(fields[0], 0, 59, &[], 0).map_err(error)?,
            hour: CronField::parse(fields[1], 0, 23, &[], 0).map_err(error)?,
            day_of_month: CronField::parse(fields[2], 1, 31, &[], 0).map_err(error)?,
            month: CronField::parse(fields[3], 1, 12, &MONTH_NAMES, 1).map_err(error)?,
            day_of_week,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    fn day_matches(&self, t: &DateTime<Utc>) -> bool {
        let dom = self.day_of_month.contains(t.day());
        let dow = self.day_of_week.contains(t.weekday().num_days_from_sunday());
        match (self.day_of_month.is_wildcard(), self.day_of_week.is_wildcard()) {
            (false, false) => dom || dow,
            (true, false) => dow,
            (false, true) => dom,
            (true, true) => true,
        }
    }

    pub fn matches(&self, t: &DateTime<Utc>) -> bool {
        self.minute.contains(t.minute())
            && self.hour.contains(t.hour())
            && self.month.contains(t.month())
            && self.day_matches(t)
    }

    /// First matching minute strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let horizon = start.year() + MAX_SEARCH_YEARS;
        let mut t = start;

        while t.year() <= horizon {
            if !self.month.contains(t.month()) {
                let (year, month) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()?;
                continue;
            }
            if !self.day_matches(&t) {
                t = (t + Duration::days(1)).with_hour(0)?.with_minute(0)?;
                continue;
            }
            if !self.hour.contains(t.hour()) {
                t = (t + Duration::hours(1)).with_minute(0)?;
                continue;
            }
            if !self.minute.contains(t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }
}

impl FromStr for CronExpr {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
