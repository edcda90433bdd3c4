//! In-memory schedule entry: a compiled [`PeriodicTask`] plus the due-time
//! decision logic.

use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde_json::{Map, Value};

use crate::crontab::Crontab;
use crate::dispatch::DispatchRequest;
use crate::error::{Result, SchedulerError};
use crate::types::{PeriodicTask, Policy, RuntimeState};

/// Recheck delay for a disabled entry, in case it is re-enabled externally.
pub const DISABLED_RECHECK: Duration = Duration::from_secs(5);

/// Recheck delay for an entry that can never fire again (spent one-off,
/// unsatisfiable crontab).
pub const PARKED_RECHECK: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone)]
enum Schedule {
    Interval(chrono::Duration),
    Crontab(Crontab),
}

/// Outcome of [`ScheduleEntry::is_due`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueCheck {
    pub due: bool,
    /// How long until the entry should be looked at again.
    pub next_check: Duration,
}

impl DueCheck {
    fn not_due(next_check: Duration) -> Self {
        Self {
            due: false,
            next_check,
        }
    }
}

/// One job's timing policy, runtime counters and decoded arguments.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    record: PeriodicTask,
    schedule: Schedule,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    tz: Tz,
}

impl ScheduleEntry {
    /// Validate a stored row and build its runtime form.
    ///
    /// Fails with `InvalidExpression` for a malformed crontab, `InvalidPolicy`
    /// for a zero or overflowing interval and `InvalidArgs` when `args` /
    /// `kwargs` do not decode to a JSON array / object.
    pub fn compile(record: PeriodicTask, tz: Tz) -> Result<Self> {
        let schedule = match &record.policy {
            Policy::Interval { every, unit } => {
                let span = unit
                    .span(*every)
                    .filter(|span| *span > chrono::Duration::zero())
                    .ok_or_else(|| {
                        SchedulerError::InvalidPolicy(format!("every {every} {unit}"))
                    })?;
                Schedule::Interval(span)
            }
            Policy::Crontab(spec) => Schedule::Crontab(Crontab::from_spec(spec)?),
        };
        let args: Vec<Value> = serde_json::from_str(&record.args)
            .map_err(|e| SchedulerError::InvalidArgs(format!("args: {e}")))?;
        let kwargs: Map<String, Value> = serde_json::from_str(&record.kwargs)
            .map_err(|e| SchedulerError::InvalidArgs(format!("kwargs: {e}")))?;

        Ok(Self {
            record,
            schedule,
            args,
            kwargs,
            tz,
        })
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn record(&self) -> &PeriodicTask {
        &self.record
    }

    pub fn enabled(&self) -> bool {
        self.record.enabled
    }

    pub fn total_run_count(&self) -> u64 {
        self.record.total_run_count
    }

    pub fn last_run_time(&self) -> Option<DateTime<Utc>> {
        self.record.last_run_time
    }

    pub fn runtime_state(&self) -> RuntimeState {
        RuntimeState {
            last_run_time: self.record.last_run_time,
            total_run_count: self.record.total_run_count,
            enabled: self.record.enabled,
        }
    }

    /// Replace the runtime counters, e.g. to keep unflushed progress across a reload.
    pub fn restore_runtime_state(&mut self, state: RuntimeState) {
        self.record.last_run_time = state.last_run_time;
        self.record.total_run_count = state.total_run_count;
        self.record.enabled = state.enabled;
    }

    /// Reference point for the next occurrence. Entries that never ran count
    /// from their creation time.
    fn baseline(&self) -> DateTime<Utc> {
        self.record.last_run_time.unwrap_or(self.record.created_time)
    }

    /// Decide whether the entry fires at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> DueCheck {
        if !self.record.enabled {
            return DueCheck::not_due(DISABLED_RECHECK);
        }
        if let Some(start) = self.record.start_time {
            if now < start {
                return DueCheck::not_due(until(now, start));
            }
        }
        if self.record.one_off && self.record.total_run_count > 0 {
            return DueCheck::not_due(PARKED_RECHECK);
        }

        match &self.schedule {
            Schedule::Interval(span) => {
                let Some(next) = self.baseline().checked_add_signed(*span) else {
                    return DueCheck::not_due(PARKED_RECHECK);
                };
                if next <= now {
                    DueCheck {
                        due: true,
                        next_check: span.to_std().unwrap_or(PARKED_RECHECK),
                    }
                } else {
                    DueCheck::not_due(until(now, next))
                }
            }
            Schedule::Crontab(cron) => match cron.next_due(self.baseline(), self.tz) {
                Some(next) if next <= now => DueCheck {
                    due: true,
                    next_check: cron
                        .next_due(now, self.tz)
                        .map_or(PARKED_RECHECK, |after| until(now, after)),
                },
                Some(next) => DueCheck::not_due(until(now, next)),
                None => DueCheck::not_due(PARKED_RECHECK),
            },
        }
    }

    /// Record a fire at `now`. One-off entries disable themselves; their run
    /// count is kept so the fire stays visible.
    pub fn advance(&mut self, now: DateTime<Utc>) {
        self.record.last_run_time = Some(now);
        self.record.total_run_count += 1;
        if self.record.one_off {
            self.record.enabled = false;
        }
    }

    /// Build the hand-off for the dispatcher.
    pub fn dispatch_request(&self, now: DateTime<Utc>) -> DispatchRequest {
        let expires = self.record.expire_at.or_else(|| {
            self.record
                .expire_after_secs
                .and_then(|secs| i64::try_from(secs).ok())
                .and_then(chrono::Duration::try_seconds)
                .and_then(|after| now.checked_add_signed(after))
        });
        DispatchRequest {
            entry: self.record.name.clone(),
            task: self.record.task.clone(),
            args: self.args.clone(),
            kwargs: self.kwargs.clone(),
            routing_hints: self.record.routing.to_map(),
            expires,
            scheduled_at: now,
        }
    }
}

fn until(now: DateTime<Utc>, then: DateTime<Utc>) -> Duration {
    (then - now).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CrontabSpec, IntervalUnit, RoutingHints};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn record(policy: Policy) -> PeriodicTask {
        PeriodicTask {
            id: "id-1".to_string(),
            name: "entry".to_string(),
            task: "reports.build".to_string(),
            args: "[1, 2]".to_string(),
            kwargs: r#"{"fast": true}"#.to_string(),
            routing: RoutingHints::default(),
            policy,
            start_time: None,
            expire_at: None,
            expire_after_secs: None,
            one_off: false,
            enabled: true,
            total_run_count: 0,
            last_run_time: None,
            description: None,
            created_time: t0(),
            updated_time: t0(),
        }
    }

    fn every_secs(n: u64) -> Policy {
        Policy::Interval {
            every: n,
            unit: IntervalUnit::Seconds,
        }
    }

    fn utc_tz() -> Tz {
        "UTC".parse().unwrap()
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    #[test]
    fn interval_due_exactly_at_span() {
        let mut rec = record(every_secs(10));
        rec.last_run_time = Some(t0());
        let entry = ScheduleEntry::compile(rec, utc_tz()).unwrap();

        assert!(!entry.is_due(t0() + secs(9)).due);
        let check = entry.is_due(t0() + secs(10));
        assert!(check.due);
        assert_eq!(check.next_check, Duration::from_secs(10));
        assert!(entry.is_due(t0() + secs(25)).due);
    }

    #[test]
    fn interval_next_check_shrinks_towards_due() {
        let mut rec = record(every_secs(60));
        rec.last_run_time = Some(t0());
        let entry = ScheduleEntry::compile(rec, utc_tz()).unwrap();

        let mut previous = Duration::MAX;
        for elapsed in 0..60 {
            let check = entry.is_due(t0() + secs(elapsed));
            assert!(!check.due);
            assert_eq!(check.next_check, Duration::from_secs((60 - elapsed) as u64));
            assert!(check.next_check < previous);
            previous = check.next_check;
        }
        assert!(entry.is_due(t0() + secs(60)).due);
    }

    #[test]
    fn never_run_entry_counts_from_creation() {
        let entry = ScheduleEntry::compile(record(every_secs(5)), utc_tz()).unwrap();
        assert!(!entry.is_due(t0() + secs(4)).due);
        assert!(entry.is_due(t0() + secs(5)).due);
    }

    #[test]
    fn crontab_midnight_boundaries() {
        let spec = CrontabSpec {
            minute: "0".to_string(),
            hour: "0".to_string(),
            ..Default::default()
        };
        let mut rec = record(Policy::Crontab(spec));
        let prev_midnight = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        rec.last_run_time = Some(prev_midnight);
        let entry = ScheduleEntry::compile(rec, utc_tz()).unwrap();

        let before = Utc.with_ymd_and_hms(2024, 6, 1, 23, 59, 59).unwrap();
        let check = entry.is_due(before);
        assert!(!check.due);
        assert_eq!(check.next_check, Duration::from_secs(1));

        let after = Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 1).unwrap();
        let check = entry.is_due(after);
        assert!(check.due);
        assert_eq!(check.next_check, Duration::from_secs(24 * 3600 - 1));
    }

    #[test]
    fn disabled_entry_rechecks_soon() {
        let mut rec = record(every_secs(1));
        rec.enabled = false;
        let entry = ScheduleEntry::compile(rec, utc_tz()).unwrap();
        let check = entry.is_due(t0() + secs(100));
        assert_eq!(check, DueCheck::not_due(DISABLED_RECHECK));
    }

    #[test]
    fn start_time_defers_entry() {
        let mut rec = record(every_secs(1));
        rec.start_time = Some(t0() + secs(30));
        let entry = ScheduleEntry::compile(rec, utc_tz()).unwrap();

        let check = entry.is_due(t0() + secs(10));
        assert!(!check.due);
        assert_eq!(check.next_check, Duration::from_secs(20));
        assert!(entry.is_due(t0() + secs(30)).due);
    }

    #[test]
    fn one_off_fires_at_most_once() {
        let mut rec = record(every_secs(5));
        rec.one_off = true;
        let mut entry = ScheduleEntry::compile(rec, utc_tz()).unwrap();

        let fire_at = t0() + secs(5);
        assert!(entry.is_due(fire_at).due);
        entry.advance(fire_at);

        assert!(!entry.enabled());
        assert_eq!(entry.total_run_count(), 1);
        for later in [5, 10, 3600, 86_400 * 30] {
            assert!(!entry.is_due(fire_at + secs(later)).due);
        }

        // Re-enabled externally without resetting the counter: still parked.
        let mut state = entry.runtime_state();
        state.enabled = true;
        entry.restore_runtime_state(state);
        assert_eq!(
            entry.is_due(fire_at + secs(60)),
            DueCheck::not_due(PARKED_RECHECK)
        );
    }

    #[test]
    fn advance_updates_counters() {
        let mut entry = ScheduleEntry::compile(record(every_secs(5)), utc_tz()).unwrap();
        entry.advance(t0() + secs(5));
        entry.advance(t0() + secs(10));
        assert_eq!(entry.total_run_count(), 2);
        assert_eq!(entry.last_run_time(), Some(t0() + secs(10)));
        assert!(entry.enabled());
    }

    #[test]
    fn malformed_crontab_fails_to_compile() {
        let spec = CrontabSpec {
            minute: "x".to_string(),
            hour: "x".to_string(),
            day_of_month: "x".to_string(),
            ..Default::default()
        };
        let err = ScheduleEntry::compile(record(Policy::Crontab(spec)), utc_tz()).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidExpression(_)));
    }

    #[test]
    fn bad_arguments_fail_to_compile() {
        let mut rec = record(every_secs(5));
        rec.args = r#"{"not": "a list"}"#.to_string();
        assert!(matches!(
            ScheduleEntry::compile(rec, utc_tz()).unwrap_err(),
            SchedulerError::InvalidArgs(_)
        ));

        let mut rec = record(every_secs(5));
        rec.kwargs = "not json".to_string();
        assert!(matches!(
            ScheduleEntry::compile(rec, utc_tz()).unwrap_err(),
            SchedulerError::InvalidArgs(_)
        ));
    }

    #[test]
    fn zero_interval_fails_to_compile() {
        assert!(matches!(
            ScheduleEntry::compile(record(every_secs(0)), utc_tz()).unwrap_err(),
            SchedulerError::InvalidPolicy(_)
        ));
    }

    #[test]
    fn interval_beyond_calendar_range_is_parked() {
        let policy = Policy::Interval {
            every: 100_000_000,
            unit: IntervalUnit::Days,
        };
        let entry = ScheduleEntry::compile(record(policy), utc_tz()).unwrap();
        let check = entry.is_due(t0() + secs(1));
        assert!(!check.due);
        assert_eq!(check.next_check, PARKED_RECHECK);
    }

    #[test]
    fn unrepresentable_expiry_is_dropped() {
        let mut rec = record(every_secs(5));
        rec.expire_after_secs = Some(9_000_000_000_000);
        let entry = ScheduleEntry::compile(rec, utc_tz()).unwrap();
        assert_eq!(entry.dispatch_request(t0()).expires, None);
    }

    #[test]
    fn dispatch_request_carries_hints_and_expiry() {
        let mut rec = record(every_secs(5));
        rec.routing = RoutingHints {
            queue: Some("reports".to_string()),
            routing_key: Some("reports.daily".to_string()),
            ..Default::default()
        };
        rec.expire_after_secs = Some(30);
        let entry = ScheduleEntry::compile(rec, utc_tz()).unwrap();

        let req = entry.dispatch_request(t0());
        assert_eq!(req.task, "reports.build");
        assert_eq!(req.args, vec![Value::from(1), Value::from(2)]);
        assert_eq!(req.kwargs["fast"], Value::Bool(true));
        assert_eq!(req.routing_hints["queue"], "reports");
        assert_eq!(req.routing_hints["routing_key"], "reports.daily");
        assert_eq!(req.expires, Some(t0() + secs(30)));
    }
}
