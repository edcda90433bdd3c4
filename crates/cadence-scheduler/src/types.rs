use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Unit of an interval policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    Days,
    Hours,
    Minutes,
    Seconds,
    Microseconds,
}

impl IntervalUnit {
    /// `every` units as a duration. `None` on overflow.
    pub fn span(self, every: u64) -> Option<Duration> {
        let every = i64::try_from(every).ok()?;
        match self {
            IntervalUnit::Days => Duration::try_days(every),
            IntervalUnit::Hours => Duration::try_hours(every),
            IntervalUnit::Minutes => Duration::try_minutes(every),
            IntervalUnit::Seconds => Duration::try_seconds(every),
            IntervalUnit::Microseconds => Some(Duration::microseconds(every)),
        }
    }
}

impl fmt::Display for IntervalUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IntervalUnit::Days => "days",
            IntervalUnit::Hours => "hours",
            IntervalUnit::Minutes => "minutes",
            IntervalUnit::Seconds => "seconds",
            IntervalUnit::Microseconds => "microseconds",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for IntervalUnit {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "days" => Ok(IntervalUnit::Days),
            "hours" => Ok(IntervalUnit::Hours),
            "minutes" => Ok(IntervalUnit::Minutes),
            "seconds" => Ok(IntervalUnit::Seconds),
            "microseconds" => Ok(IntervalUnit::Microseconds),
            other => Err(format!("unknown interval unit: {other}")),
        }
    }
}

/// Crontab fields exactly as stored. Not validated until the engine compiles
/// the entry, so a malformed row can still be loaded and disabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrontabSpec {
    #[serde(default = "star")]
    pub minute: String,
    #[serde(default = "star")]
    pub hour: String,
    #[serde(default = "star")]
    pub day_of_month: String,
    #[serde(default = "star")]
    pub day_of_week: String,
    #[serde(default = "star")]
    pub month_of_year: String,
}

fn star() -> String {
    "*".to_string()
}

impl Default for CrontabSpec {
    fn default() -> Self {
        Self {
            minute: star(),
            hour: star(),
            day_of_month: star(),
            day_of_week: star(),
            month_of_year: star(),
        }
    }
}

impl fmt::Display for CrontabSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.minute, self.hour, self.day_of_month, self.day_of_week, self.month_of_year
        )
    }
}

/// When an entry fires. Exactly one variant per entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Policy {
    /// Fire every `every` units after the previous run.
    Interval { every: u64, unit: IntervalUnit },
    /// Fire on crontab matches.
    Crontab(CrontabSpec),
}

/// Opaque routing information passed through to the dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingHints {
    pub queue: Option<String>,
    pub exchange: Option<String>,
    pub routing_key: Option<String>,
    pub priority: Option<u8>,
}

impl RoutingHints {
    /// Flatten the populated hints into a string map.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        if let Some(ref q) = self.queue {
            map.insert("queue".to_string(), q.clone());
        }
        if let Some(ref e) = self.exchange {
            map.insert("exchange".to_string(), e.clone());
        }
        if let Some(ref k) = self.routing_key {
            map.insert("routing_key".to_string(), k.clone());
        }
        if let Some(p) = self.priority {
            map.insert("priority".to_string(), p.to_string());
        }
        map
    }
}

/// A persisted schedule row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodicTask {
    /// UUID v7 string, primary key.
    pub id: String,
    /// Unique human-readable name; key of the engine's working set.
    pub name: String,
    /// Name the dispatcher routes on.
    pub task: String,
    /// JSON-encoded positional arguments (must decode to an array).
    pub args: String,
    /// JSON-encoded keyword arguments (must decode to an object).
    pub kwargs: String,
    pub routing: RoutingHints,
    pub policy: Policy,
    /// The entry is never due before this instant.
    pub start_time: Option<DateTime<Utc>>,
    /// Absolute expiry hint forwarded to the dispatcher.
    pub expire_at: Option<DateTime<Utc>>,
    /// Relative expiry hint (seconds after dispatch) forwarded to the dispatcher.
    pub expire_after_secs: Option<u64>,
    pub one_off: bool,
    pub enabled: bool,
    pub total_run_count: u64,
    pub last_run_time: Option<DateTime<Utc>>,
    pub description: Option<String>,
    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
}

/// Input for [`ScheduleStore::create`](crate::store::ScheduleStore::create).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPeriodicTask {
    pub name: String,
    pub task: String,
    #[serde(default = "empty_args")]
    pub args: String,
    #[serde(default = "empty_kwargs")]
    pub kwargs: String,
    #[serde(default)]
    pub routing: RoutingHints,
    pub policy: Policy,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expire_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expire_after_secs: Option<u64>,
    #[serde(default)]
    pub one_off: bool,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
}

fn empty_args() -> String {
    "[]".to_string()
}
fn empty_kwargs() -> String {
    "{}".to_string()
}
fn enabled_default() -> bool {
    true
}

impl NewPeriodicTask {
    /// Enabled, no arguments, no routing hints.
    pub fn new(name: impl Into<String>, task: impl Into<String>, policy: Policy) -> Self {
        Self {
            name: name.into(),
            task: task.into(),
            args: empty_args(),
            kwargs: empty_kwargs(),
            routing: RoutingHints::default(),
            policy,
            start_time: None,
            expire_at: None,
            expire_after_secs: None,
            one_off: false,
            enabled: true,
            description: None,
        }
    }
}

/// Partial update for [`ScheduleStore::update`](crate::store::ScheduleStore::update).
/// `None` leaves the column untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeriodicTaskPatch {
    pub task: Option<String>,
    pub args: Option<String>,
    pub kwargs: Option<String>,
    pub routing: Option<RoutingHints>,
    pub policy: Option<Policy>,
    pub start_time: Option<Option<DateTime<Utc>>>,
    pub expire_at: Option<Option<DateTime<Utc>>>,
    pub expire_after_secs: Option<Option<u64>>,
    pub one_off: Option<bool>,
    pub enabled: Option<bool>,
    pub total_run_count: Option<u64>,
    pub last_run_time: Option<Option<DateTime<Utc>>>,
    pub description: Option<Option<String>>,
}

/// Counters the engine owns and writes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeState {
    pub last_run_time: Option<DateTime<Utc>>,
    pub total_run_count: u64,
    pub enabled: bool,
}
