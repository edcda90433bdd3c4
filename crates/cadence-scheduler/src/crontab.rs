//! Five-field crontab parsing and next-fire computation.
//!
//! Field order is `minute hour day-of-month day-of-week month-of-year`.
//! Day-of-month and day-of-week must both match for a day to qualify.
//! Evaluation walks local wall-clock time in the requested zone, so a
//! `0 9 * * *` entry keeps firing at 09:00 local across DST transitions.

use std::fmt;

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc,
};
use chrono_tz::Tz;

use crate::error::CrontabError;
use crate::types::CrontabSpec;

/// Search horizon for the next occurrence. Anything further out is treated
/// as unsatisfiable (e.g. `0 0 31 2 *`).
const SEARCH_HORIZON_DAYS: i64 = 5 * 366;

const DAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];
const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

#[derive(Debug, Clone, Copy)]
struct FieldKind {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
}

const MINUTE: FieldKind = FieldKind { name: "minute", min: 0, max: 59, names: &[] };
const HOUR: FieldKind = FieldKind { name: "hour", min: 0, max: 23, names: &[] };
const DAY_OF_MONTH: FieldKind = FieldKind { name: "day_of_month", min: 1, max: 31, names: &[] };
// 7 is accepted as an alias for Sunday and folded onto 0 after expansion.
const DAY_OF_WEEK: FieldKind = FieldKind { name: "day_of_week", min: 0, max: 7, names: &DAY_NAMES };
const MONTH_OF_YEAR: FieldKind = FieldKind {
    name: "month_of_year",
    min: 1,
    max: 12,
    names: &MONTH_NAMES,
};

/// Set of allowed values for one field, as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet(u64);

impl FieldSet {
    fn contains(self, value: u32) -> bool {
        value < 64 && self.0 & (1 << value) != 0
    }

    fn parse(raw: &str, kind: FieldKind) -> Result<Self, CrontabError> {
        let mut bits = 0u64;
        for item in raw.split(',') {
            bits |= parse_item(item.trim(), kind)?;
        }
        if kind.name == DAY_OF_WEEK.name && bits & (1 << 7) != 0 {
            bits = (bits & !(1 << 7)) | 1;
        }
        Ok(Self(bits))
    }
}

fn parse_item(item: &str, kind: FieldKind) -> Result<u64, CrontabError> {
    let syntax = || CrontabError::Syntax {
        field: kind.name,
        value: item.to_string(),
    };
    if item.is_empty() {
        return Err(syntax());
    }

    let (range, step) = match item.split_once('/') {
        Some((range, step)) => {
            let step: u32 = step.parse().map_err(|_| syntax())?;
            if step == 0 {
                return Err(CrontabError::ZeroStep { field: kind.name });
            }
            (range, step)
        }
        None => (item, 1),
    };

    let (lo, hi) = if range == "*" {
        (kind.min, kind.max)
    } else if let Some((a, b)) = range.split_once('-') {
        (parse_value(a, kind)?, parse_value(b, kind)?)
    } else {
        let start = parse_value(range, kind)?;
        // `5/15` means "from 5 to the end, every 15".
        if item.contains('/') {
            (start, kind.max)
        } else {
            (start, start)
        }
    };
    if lo > hi {
        return Err(syntax());
    }

    let mut bits = 0u64;
    let mut v = lo;
    while v <= hi {
        bits |= 1 << v;
        match v.checked_add(step) {
            Some(next) => v = next,
            None => break,
        }
    }
    Ok(bits)
}

fn parse_value(raw: &str, kind: FieldKind) -> Result<u32, CrontabError> {
    let lower = raw.to_ascii_lowercase();
    let value = if let Some(idx) = kind.names.iter().position(|n| *n == lower) {
        idx as u32 + if kind.name == MONTH_OF_YEAR.name { 1 } else { 0 }
    } else {
        raw.parse::<u32>().map_err(|_| CrontabError::Syntax {
            field: kind.name,
            value: raw.to_string(),
        })?
    };
    if value < kind.min || value > kind.max {
        return Err(CrontabError::OutOfRange {
            field: kind.name,
            value,
            min: kind.min,
            max: kind.max,
        });
    }
    Ok(value)
}

/// A validated crontab schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Crontab {
    spec: CrontabSpec,
    minute: FieldSet,
    hour: FieldSet,
    day_of_month: FieldSet,
    day_of_week: FieldSet,
    month_of_year: FieldSet,
}

impl Crontab {
    /// Parse a whitespace-separated five-field expression.
    pub fn parse(expression: &str) -> Result<Self, CrontabError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let [minute, hour, day_of_month, day_of_week, month_of_year] = fields[..] else {
            return Err(CrontabError::FieldCount(fields.len()));
        };
        Self::from_spec(&CrontabSpec {
            minute: minute.to_string(),
            hour: hour.to_string(),
            day_of_month: day_of_month.to_string(),
            day_of_week: day_of_week.to_string(),
            month_of_year: month_of_year.to_string(),
        })
    }

    /// Validate the persisted per-field form.
    pub fn from_spec(spec: &CrontabSpec) -> Result<Self, CrontabError> {
        Ok(Self {
            minute: FieldSet::parse(&spec.minute, MINUTE)?,
            hour: FieldSet::parse(&spec.hour, HOUR)?,
            day_of_month: FieldSet::parse(&spec.day_of_month, DAY_OF_MONTH)?,
            day_of_week: FieldSet::parse(&spec.day_of_week, DAY_OF_WEEK)?,
            month_of_year: FieldSet::parse(&spec.month_of_year, MONTH_OF_YEAR)?,
            spec: spec.clone(),
        })
    }

    pub fn spec(&self) -> &CrontabSpec {
        &self.spec
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        self.month_of_year.contains(date.month())
            && self.day_of_month.contains(date.day())
            && self.day_of_week.contains(date.weekday().num_days_from_sunday())
    }

    /// Earliest instant strictly after `after` that satisfies every field,
    /// evaluated in `tz` local time.
    ///
    /// Local times skipped by a DST gap never fire; a repeated local time
    /// fires once, at its first occurrence. Returns `None` when nothing
    /// matches within the search horizon.
    pub fn next_due(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&tz).naive_local();
        let mut t = local
            .with_second(0)?
            .with_nanosecond(0)?
            .checked_add_signed(Duration::minutes(1))?;
        let horizon = t.checked_add_signed(Duration::days(SEARCH_HORIZON_DAYS))?;

        while t <= horizon {
            if !self.month_of_year.contains(t.month()) {
                t = first_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hour.contains(t.hour()) {
                t = t.date().and_hms_opt(t.hour(), 0, 0)? + Duration::hours(1);
                continue;
            }
            if !self.minute.contains(t.minute()) {
                t += Duration::minutes(1);
                continue;
            }

            let candidate = match tz.from_local_datetime(&t) {
                LocalResult::Single(dt) => Some(dt),
                LocalResult::Ambiguous(earliest, _) => Some(earliest),
                LocalResult::None => None,
            };
            if let Some(dt) = candidate.map(|dt| dt.with_timezone(&Utc)) {
                if dt > after {
                    return Some(dt);
                }
            }
            t += Duration::minutes(1);
        }
        None
    }
}

impl fmt::Display for Crontab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.spec)
    }
}

fn first_of_next_month(t: NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}
