//! Persistence of schedule entries.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, SubsecRound, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, Transaction, TransactionBehavior};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::db::init_db;
use crate::error::{Result, SchedulerError};
use crate::types::{
    NewPeriodicTask, PeriodicTask, PeriodicTaskPatch, Policy, RoutingHints, RuntimeState,
};

/// Storage seam between the engine and the schedule table.
///
/// Every create / update / delete bumps the change marker. Runtime write-back
/// does not, so the engine's own flushes never trigger a reload.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// All rows with `enabled = true`.
    async fn load_enabled(&self) -> Result<Vec<PeriodicTask>>;

    async fn create(&self, task: NewPeriodicTask) -> Result<PeriodicTask>;

    async fn update(&self, id: &str, patch: PeriodicTaskPatch) -> Result<PeriodicTask>;

    async fn delete(&self, id: &str) -> Result<()>;

    /// Write back the engine-owned counters. The row is re-read under an
    /// exclusive lock and merged: the newer run wins the counters, and
    /// `enabled` only ever goes from true to false. A disable is ignored when
    /// the row was edited after `state.last_run_time`.
    async fn save_runtime_state(&self, id: &str, state: RuntimeState) -> Result<()>;

    async fn get_change_marker(&self) -> Result<Option<DateTime<Utc>>>;

    /// Advance the marker. The new value is always strictly greater than the
    /// previous one, even if the clock has not moved.
    async fn bump_change_marker(&self) -> Result<DateTime<Utc>>;
}

const SELECT_COLUMNS: &str = "SELECT id, name, task, args, kwargs, queue, exchange, routing_key,
        priority, policy, start_time, expire_at, expire_after_secs, one_off, enabled,
        total_run_count, last_run_time, description, created_time, updated_time
 FROM periodic_tasks";

/// SQLite-backed [`ScheduleStore`].
///
/// Wraps a single connection in a `Mutex`; every operation is a short
/// statement or transaction, so the lock is never held across an await.
pub struct SqliteScheduleStore {
    db: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl SqliteScheduleStore {
    /// Wrap an open connection, initialising the schema if needed.
    pub fn new(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            clock,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every row, enabled or not, ordered by name.
    pub fn list_all(&self) -> Result<Vec<PeriodicTask>> {
        let db = self.conn();
        let mut stmt = db.prepare(&format!("{SELECT_COLUMNS} ORDER BY name"))?;
        let rows = stmt
            .query_map([], RawRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|raw| match raw.decode() {
                Ok(task) => Some(task),
                Err((raw, e)) => {
                    warn!(entry = %raw.name, "undecodable policy column: {e}");
                    None
                }
            })
            .collect())
    }

    pub fn get(&self, id: &str) -> Result<PeriodicTask> {
        let db = self.conn();
        fetch(&db, "id", id)
    }

    pub fn get_by_name(&self, name: &str) -> Result<PeriodicTask> {
        let db = self.conn();
        fetch(&db, "name", name)
    }

    /// Admin enable / disable. Bumps the change marker.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<PeriodicTask> {
        self.update(
            id,
            PeriodicTaskPatch {
                enabled: Some(enabled),
                ..Default::default()
            },
        )
        .await
    }
}

#[async_trait]
impl ScheduleStore for SqliteScheduleStore {
    #[instrument(skip(self))]
    async fn load_enabled(&self) -> Result<Vec<PeriodicTask>> {
        let mut db = self.conn();
        let raws = {
            let mut stmt = db.prepare_cached(&format!("{SELECT_COLUMNS} WHERE enabled = 1"))?;
            let rows = stmt
                .query_map([], RawRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut tasks = Vec::with_capacity(raws.len());
        let mut broken = Vec::new();
        for raw in raws {
            match raw.decode() {
                Ok(task) => tasks.push(task),
                Err((raw, e)) => {
                    warn!(entry = %raw.name, "undecodable policy column, disabling: {e}");
                    broken.push(raw.id);
                }
            }
        }
        if !broken.is_empty() {
            let tx = db.transaction()?;
            for id in &broken {
                tx.execute("UPDATE periodic_tasks SET enabled = 0 WHERE id = ?1", [id])?;
            }
            tx.commit()?;
        }

        debug!(count = tasks.len(), "loaded enabled entries");
        Ok(tasks)
    }

    #[instrument(skip(self, task), fields(name = %task.name))]
    async fn create(&self, task: NewPeriodicTask) -> Result<PeriodicTask> {
        let now = self.clock.now();
        let record = PeriodicTask {
            id: Uuid::now_v7().to_string(),
            name: task.name,
            task: task.task,
            args: task.args,
            kwargs: task.kwargs,
            routing: task.routing,
            policy: task.policy,
            start_time: task.start_time,
            expire_at: task.expire_at,
            expire_after_secs: task.expire_after_secs,
            one_off: task.one_off,
            enabled: task.enabled,
            total_run_count: 0,
            last_run_time: None,
            description: task.description,
            created_time: now,
            updated_time: now,
        };
        let policy = policy_json(&record.policy)?;

        let mut db = self.conn();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let inserted = tx.execute(
            "INSERT INTO periodic_tasks
             (id, name, task, args, kwargs, queue, exchange, routing_key, priority, policy,
              start_time, expire_at, expire_after_secs, one_off, enabled,
              total_run_count, last_run_time, description, created_time, updated_time)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,0,NULL,?16,?17,?17)",
            rusqlite::params![
                record.id,
                record.name,
                record.task,
                record.args,
                record.kwargs,
                record.routing.queue,
                record.routing.exchange,
                record.routing.routing_key,
                record.routing.priority.map(i64::from),
                policy,
                record.start_time.map(ts),
                record.expire_at.map(ts),
                record.expire_after_secs.map(to_i64),
                record.one_off,
                record.enabled,
                record.description,
                ts(now),
            ],
        );
        match inserted {
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                return Err(SchedulerError::DuplicateName(record.name));
            }
            other => {
                other?;
            }
        }
        bump_marker(&tx, now)?;
        tx.commit()?;

        info!(id = %record.id, "entry created");
        Ok(record)
    }

    #[instrument(skip(self, patch))]
    async fn update(&self, id: &str, patch: PeriodicTaskPatch) -> Result<PeriodicTask> {
        let now = self.clock.now();
        let mut db = self.conn();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut record = fetch(&tx, "id", id)?;

        if let Some(task) = patch.task {
            record.task = task;
        }
        if let Some(args) = patch.args {
            record.args = args;
        }
        if let Some(kwargs) = patch.kwargs {
            record.kwargs = kwargs;
        }
        if let Some(routing) = patch.routing {
            record.routing = routing;
        }
        if let Some(policy) = patch.policy {
            record.policy = policy;
        }
        if let Some(start_time) = patch.start_time {
            record.start_time = start_time;
        }
        if let Some(expire_at) = patch.expire_at {
            record.expire_at = expire_at;
        }
        if let Some(expire_after_secs) = patch.expire_after_secs {
            record.expire_after_secs = expire_after_secs;
        }
        if let Some(one_off) = patch.one_off {
            record.one_off = one_off;
        }
        if let Some(enabled) = patch.enabled {
            record.enabled = enabled;
        }
        if let Some(total_run_count) = patch.total_run_count {
            record.total_run_count = total_run_count;
        }
        if let Some(last_run_time) = patch.last_run_time {
            record.last_run_time = last_run_time;
        }
        if let Some(description) = patch.description {
            record.description = description;
        }
        record.updated_time = now;

        tx.execute(
            "UPDATE periodic_tasks SET
                task=?1, args=?2, kwargs=?3, queue=?4, exchange=?5, routing_key=?6,
                priority=?7, policy=?8, start_time=?9, expire_at=?10, expire_after_secs=?11,
                one_off=?12, enabled=?13, total_run_count=?14, last_run_time=?15,
                description=?16, updated_time=?17
             WHERE id=?18",
            rusqlite::params![
                record.task,
                record.args,
                record.kwargs,
                record.routing.queue,
                record.routing.exchange,
                record.routing.routing_key,
                record.routing.priority.map(i64::from),
                policy_json(&record.policy)?,
                record.start_time.map(ts),
                record.expire_at.map(ts),
                record.expire_after_secs.map(to_i64),
                record.one_off,
                record.enabled,
                to_i64(record.total_run_count),
                record.last_run_time.map(ts),
                record.description,
                ts(now),
                record.id,
            ],
        )?;
        bump_marker(&tx, now)?;
        tx.commit()?;

        info!(name = %record.name, "entry updated");
        Ok(record)
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &str) -> Result<()> {
        let now = self.clock.now();
        let mut db = self.conn();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let n = tx.execute("DELETE FROM periodic_tasks WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::EntryNotFound(id.to_string()));
        }
        bump_marker(&tx, now)?;
        tx.commit()?;
        info!("entry deleted");
        Ok(())
    }

    #[instrument(skip(self, state))]
    async fn save_runtime_state(&self, id: &str, state: RuntimeState) -> Result<()> {
        let mut db = self.conn();
        // IMMEDIATE takes the write lock before the read, so an admin edit
        // cannot slip in between the read and the write below.
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let stored = tx
            .query_row(
                "SELECT last_run_time, total_run_count, enabled, updated_time
                 FROM periodic_tasks WHERE id = ?1",
                [id],
                |row| {
                    Ok((
                        opt_ts(row, 0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, bool>(2)?,
                        req_ts(row, 3)?,
                    ))
                },
            )
            .optional()?;
        let Some((stored_last, stored_count, stored_enabled, stored_updated)) = stored else {
            return Err(SchedulerError::EntryNotFound(id.to_string()));
        };

        let ours_newer = match (state.last_run_time, stored_last) {
            (Some(ours), Some(theirs)) => ours >= theirs,
            (Some(_), None) => true,
            (None, _) => false,
        };
        let (last_run_time, total_run_count) = if ours_newer {
            (state.last_run_time, to_i64(state.total_run_count))
        } else {
            (stored_last, stored_count)
        };
        // An admin edit made after our last run outranks our disable, e.g. a
        // spent one-off re-enabled before this flush.
        let edited_after_run = state
            .last_run_time
            .is_some_and(|ours| stored_updated > ours);
        let enabled = stored_enabled && (state.enabled || edited_after_run);

        tx.execute(
            "UPDATE periodic_tasks SET last_run_time=?1, total_run_count=?2, enabled=?3
             WHERE id=?4",
            rusqlite::params![last_run_time.map(ts), total_run_count, enabled, id],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn get_change_marker(&self) -> Result<Option<DateTime<Utc>>> {
        let db = self.conn();
        read_marker(&db)
    }

    async fn bump_change_marker(&self) -> Result<DateTime<Utc>> {
        let now = self.clock.now();
        let mut db = self.conn();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let marker = bump_marker(&tx, now)?;
        tx.commit()?;
        Ok(marker)
    }
}

fn read_marker(conn: &Connection) -> Result<Option<DateTime<Utc>>> {
    let marker = conn
        .query_row(
            "SELECT last_update FROM periodic_tasks_changed WHERE id = 1",
            [],
            |row| req_ts(row, 0),
        )
        .optional()?;
    Ok(marker)
}

fn bump_marker(tx: &Transaction<'_>, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    // Compare at the stored precision.
    let now = now.trunc_subsecs(6);
    let marker = match read_marker(tx)? {
        Some(previous) if previous >= now => previous + Duration::microseconds(1),
        _ => now,
    };
    tx.execute(
        "INSERT INTO periodic_tasks_changed (id, last_update) VALUES (1, ?1)
         ON CONFLICT(id) DO UPDATE SET last_update = excluded.last_update",
        [ts(marker)],
    )?;
    Ok(marker)
}

fn fetch(conn: &Connection, column: &str, value: &str) -> Result<PeriodicTask> {
    let raw = conn
        .query_row(
            &format!("{SELECT_COLUMNS} WHERE {column} = ?1"),
            [value],
            RawRow::from_row,
        )
        .optional()?
        .ok_or_else(|| SchedulerError::EntryNotFound(value.to_string()))?;
    raw.decode()
        .map_err(|(_, e)| SchedulerError::InvalidPolicy(e.to_string()))
}

fn policy_json(policy: &Policy) -> Result<String> {
    serde_json::to_string(policy).map_err(|e| SchedulerError::InvalidPolicy(e.to_string()))
}

/// Timestamps are stored as fixed-precision RFC 3339 so they sort as text.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn req_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    parse_ts(idx, &row.get::<_, String>(idx)?)
}

fn opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|s| parse_ts(idx, &s))
        .transpose()
}

/// A row with the policy column still undecoded.
struct RawRow {
    id: String,
    name: String,
    policy: String,
    task: PeriodicTask,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let id: String = row.get(0)?;
        let name: String = row.get(1)?;
        let policy: String = row.get(9)?;
        let task = PeriodicTask {
            id: id.clone(),
            name: name.clone(),
            task: row.get(2)?,
            args: row.get(3)?,
            kwargs: row.get(4)?,
            routing: RoutingHints {
                queue: row.get(5)?,
                exchange: row.get(6)?,
                routing_key: row.get(7)?,
                priority: row
                    .get::<_, Option<i64>>(8)?
                    .and_then(|p| u8::try_from(p).ok()),
            },
            // Placeholder until `decode` parses the JSON column.
            policy: Policy::Crontab(Default::default()),
            start_time: opt_ts(row, 10)?,
            expire_at: opt_ts(row, 11)?,
            expire_after_secs: row
                .get::<_, Option<i64>>(12)?
                .and_then(|s| u64::try_from(s).ok()),
            one_off: row.get(13)?,
            enabled: row.get(14)?,
            total_run_count: u64::try_from(row.get::<_, i64>(15)?).unwrap_or_default(),
            last_run_time: opt_ts(row, 16)?,
            description: row.get(17)?,
            created_time: req_ts(row, 18)?,
            updated_time: req_ts(row, 19)?,
        };
        Ok(Self {
            id,
            name,
            policy,
            task,
        })
    }

    fn decode(self) -> std::result::Result<PeriodicTask, (Self, serde_json::Error)> {
        match serde_json::from_str::<Policy>(&self.policy) {
            Ok(policy) => {
                let mut task = self.task;
                task.policy = policy;
                Ok(task)
            }
            Err(e) => Err((self, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::{CrontabSpec, IntervalUnit};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn store() -> (SqliteScheduleStore, ManualClock) {
        let clock = ManualClock::new(t0());
        let store = SqliteScheduleStore::new(
            Connection::open_in_memory().unwrap(),
            Arc::new(clock.clone()),
        )
        .unwrap();
        (store, clock)
    }

    fn every_five() -> Policy {
        Policy::Interval {
            every: 5,
            unit: IntervalUnit::Seconds,
        }
    }

    #[tokio::test]
    async fn create_then_load_round_trips() {
        let (store, _) = store();
        let mut new = NewPeriodicTask::new(
            "nightly-report",
            "reports.build",
            Policy::Crontab(CrontabSpec {
                minute: "30".to_string(),
                hour: "2".to_string(),
                ..Default::default()
            }),
        );
        new.args = r#"["daily"]"#.to_string();
        new.routing.queue = Some("reports".to_string());
        new.routing.priority = Some(7);
        new.expire_after_secs = Some(600);

        let created = store.create(new.clone()).await.unwrap();
        let loaded = store.load_enabled().await.unwrap();
        assert_eq!(loaded.len(), 1);
        let got = &loaded[0];
        assert_eq!(got, &created);
        assert_eq!(got.name, new.name);
        assert_eq!(got.task, new.task);
        assert_eq!(got.policy, new.policy);
        assert_eq!(got.args, new.args);
        assert_eq!(got.routing, new.routing);
        assert_eq!(got.expire_after_secs, Some(600));
        assert_eq!(got.total_run_count, 0);
        assert_eq!(got.last_run_time, None);
        assert_eq!(got.created_time, t0());
    }

    #[tokio::test]
    async fn load_enabled_skips_disabled_rows() {
        let (store, _) = store();
        let mut off = NewPeriodicTask::new("off", "noop", every_five());
        off.enabled = false;
        store.create(off).await.unwrap();
        let on = store
            .create(NewPeriodicTask::new("on", "noop", every_five()))
            .await
            .unwrap();

        let loaded = store.load_enabled().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, on.id);

        store.set_enabled(&on.id, false).await.unwrap();
        assert!(store.load_enabled().await.unwrap().is_empty());
        assert_eq!(store.list_all().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let (store, _) = store();
        store
            .create(NewPeriodicTask::new("a", "noop", every_five()))
            .await
            .unwrap();
        let err = store
            .create(NewPeriodicTask::new("a", "other", every_five()))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateName(name) if name == "a"));
    }

    #[tokio::test]
    async fn mutations_bump_the_marker_monotonically() {
        let (store, _) = store();
        assert_eq!(store.get_change_marker().await.unwrap(), None);

        let entry = store
            .create(NewPeriodicTask::new("a", "noop", every_five()))
            .await
            .unwrap();
        let m1 = store.get_change_marker().await.unwrap().unwrap();

        // Clock has not moved; the marker still advances.
        store
            .update(
                &entry.id,
                PeriodicTaskPatch {
                    task: Some("renamed".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let m2 = store.get_change_marker().await.unwrap().unwrap();
        assert!(m2 > m1);

        store.delete(&entry.id).await.unwrap();
        let m3 = store.get_change_marker().await.unwrap().unwrap();
        assert!(m3 > m2);

        let m4 = store.bump_change_marker().await.unwrap();
        assert!(m4 > m3);
    }

    #[tokio::test]
    async fn marker_advances_within_one_microsecond() {
        let (store, clock) = store();
        clock.set(t0() + Duration::nanoseconds(500));

        store
            .create(NewPeriodicTask::new("a", "noop", every_five()))
            .await
            .unwrap();
        let m1 = store.get_change_marker().await.unwrap().unwrap();
        store
            .create(NewPeriodicTask::new("b", "noop", every_five()))
            .await
            .unwrap();
        let m2 = store.get_change_marker().await.unwrap().unwrap();
        assert!(m2 > m1, "{m2} must be after {m1}");

        let m3 = store.bump_change_marker().await.unwrap();
        assert!(m3 > m2);
        assert_eq!(store.get_change_marker().await.unwrap(), Some(m3));
    }

    #[tokio::test]
    async fn runtime_write_back_leaves_marker_alone() {
        let (store, clock) = store();
        let entry = store
            .create(NewPeriodicTask::new("a", "noop", every_five()))
            .await
            .unwrap();
        let marker = store.get_change_marker().await.unwrap();

        clock.advance(Duration::seconds(5));
        store
            .save_runtime_state(
                &entry.id,
                RuntimeState {
                    last_run_time: Some(clock.now()),
                    total_run_count: 1,
                    enabled: true,
                },
            )
            .await
            .unwrap();

        assert_eq!(store.get_change_marker().await.unwrap(), marker);
        let saved = store.get(&entry.id).unwrap();
        assert_eq!(saved.total_run_count, 1);
        assert_eq!(saved.last_run_time, Some(t0() + Duration::seconds(5)));
    }

    #[tokio::test]
    async fn write_back_merges_with_concurrent_admin_edit() {
        let (store, _) = store();
        let entry = store
            .create(NewPeriodicTask::new("a", "noop", every_five()))
            .await
            .unwrap();

        // Admin disables and changes the task while the engine holds stale state.
        store
            .update(
                &entry.id,
                PeriodicTaskPatch {
                    enabled: Some(false),
                    task: Some("noop.v2".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .save_runtime_state(
                &entry.id,
                RuntimeState {
                    last_run_time: Some(t0() + Duration::seconds(5)),
                    total_run_count: 1,
                    enabled: true,
                },
            )
            .await
            .unwrap();

        let saved = store.get(&entry.id).unwrap();
        assert!(!saved.enabled, "write-back must not re-enable");
        assert_eq!(saved.task, "noop.v2");
        assert_eq!(saved.total_run_count, 1);
    }

    #[tokio::test]
    async fn spent_one_off_write_back_disables_row() {
        let (store, clock) = store();
        let mut once = NewPeriodicTask::new("once", "noop", every_five());
        once.one_off = true;
        let entry = store.create(once).await.unwrap();

        clock.advance(Duration::seconds(5));
        store
            .save_runtime_state(
                &entry.id,
                RuntimeState {
                    last_run_time: Some(clock.now()),
                    total_run_count: 1,
                    enabled: false,
                },
            )
            .await
            .unwrap();

        let saved = store.get(&entry.id).unwrap();
        assert!(!saved.enabled);
        assert_eq!(saved.total_run_count, 1);
    }

    #[tokio::test]
    async fn admin_reenable_after_fire_survives_write_back() {
        let (store, clock) = store();
        let mut once = NewPeriodicTask::new("once", "noop", every_five());
        once.one_off = true;
        let entry = store.create(once).await.unwrap();

        // The engine fires at t0+5 but has not flushed yet.
        clock.advance(Duration::seconds(5));
        let fired_at = clock.now();
        clock.advance(Duration::seconds(1));
        store
            .update(
                &entry.id,
                PeriodicTaskPatch {
                    enabled: Some(true),
                    total_run_count: Some(0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        store
            .save_runtime_state(
                &entry.id,
                RuntimeState {
                    last_run_time: Some(fired_at),
                    total_run_count: 1,
                    enabled: false,
                },
            )
            .await
            .unwrap();

        let saved = store.get(&entry.id).unwrap();
        assert!(saved.enabled, "admin re-enable must win over the stale disable");
        assert_eq!(saved.last_run_time, Some(fired_at));
    }

    #[tokio::test]
    async fn older_write_back_does_not_clobber_newer_run() {
        let (store, _) = store();
        let entry = store
            .create(NewPeriodicTask::new("a", "noop", every_five()))
            .await
            .unwrap();
        let newer = RuntimeState {
            last_run_time: Some(t0() + Duration::seconds(10)),
            total_run_count: 2,
            enabled: true,
        };
        let older = RuntimeState {
            last_run_time: Some(t0() + Duration::seconds(5)),
            total_run_count: 1,
            enabled: true,
        };
        store.save_runtime_state(&entry.id, newer).await.unwrap();
        store.save_runtime_state(&entry.id, older).await.unwrap();

        let saved = store.get(&entry.id).unwrap();
        assert_eq!(saved.total_run_count, 2);
        assert_eq!(saved.last_run_time, newer.last_run_time);
    }

    #[tokio::test]
    async fn write_back_to_deleted_row_is_not_found() {
        let (store, _) = store();
        let err = store
            .save_runtime_state(
                "missing",
                RuntimeState {
                    last_run_time: None,
                    total_run_count: 0,
                    enabled: false,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::EntryNotFound(_)));
    }

    #[tokio::test]
    async fn undecodable_policy_row_is_disabled_on_load() {
        let (store, _) = store();
        let entry = store
            .create(NewPeriodicTask::new("corrupt", "noop", every_five()))
            .await
            .unwrap();
        store
            .conn()
            .execute(
                "UPDATE periodic_tasks SET policy = '{\"kind\":\"solar\"}' WHERE id = ?1",
                [&entry.id],
            )
            .unwrap();

        assert!(store.load_enabled().await.unwrap().is_empty());
        let enabled: bool = store
            .conn()
            .query_row(
                "SELECT enabled FROM periodic_tasks WHERE id = ?1",
                [&entry.id],
                |row| row.get(0),
            )
            .unwrap();
        assert!(!enabled);
    }
}
