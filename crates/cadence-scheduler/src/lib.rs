//! `cadence-scheduler`: persistent periodic-task scheduler ("beat").
//!
//! # Overview
//!
//! Schedule entries live in a SQLite `periodic_tasks` table. The
//! [`engine::SchedulerEngine`] keeps an in-memory working set, wakes when the
//! earliest entry is due (or after `max_interval`), hands fired entries to a
//! [`dispatch::Dispatcher`] and writes run counters back. Admin edits bump a
//! change marker; the engine reloads only when the marker moves.
//!
//! Several engines may run against the same store. A TTL lease
//! ([`lock::LeaderLock`]) makes sure only one of them dispatches.
//!
//! # Policies
//!
//! | Variant    | Behaviour                                                  |
//! |------------|------------------------------------------------------------|
//! | `Interval` | Every N days / hours / minutes / seconds / microseconds    |
//! | `Crontab`  | Five-field crontab evaluated in the configured time zone   |

pub mod clock;
pub mod crontab;
pub mod db;
pub mod dispatch;
pub mod engine;
pub mod entry;
pub mod error;
pub mod lock;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use crontab::Crontab;
pub use dispatch::{ChannelDispatcher, DispatchRequest, Dispatcher, RedisQueueDispatcher};
pub use engine::{EngineSettings, SchedulerEngine};
pub use entry::ScheduleEntry;
pub use error::{CrontabError, Result, SchedulerError};
pub use lock::{Coordinator, LeaderLock, MemoryCoordinator, RedisCoordinator};
pub use store::{ScheduleStore, SqliteScheduleStore};
pub use types::{
    CrontabSpec, IntervalUnit, NewPeriodicTask, PeriodicTask, PeriodicTaskPatch, Policy,
    RoutingHints, RuntimeState,
};
