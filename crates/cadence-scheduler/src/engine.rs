use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use cadence_core::config::{
    CadenceConfig, DEFAULT_LOCK_KEY, DEFAULT_LOCK_TTL_SECS, DEFAULT_MAX_INTERVAL_SECS,
    DEFAULT_STANDBY_POLL_SECS,
};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    clock::Clock,
    dispatch::Dispatcher,
    entry::ScheduleEntry,
    error::{Result, SchedulerError},
    lock::{Coordinator, LeaderLock},
    store::ScheduleStore,
    types::RuntimeState,
};

/// Tick loop tuning, validated.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Zone crontab entries are evaluated in.
    pub timezone: Tz,
    /// Longest sleep between two ticks.
    pub max_interval: Duration,
    /// Minimum spacing between dirty-set flushes. Zero flushes every tick.
    pub sync_every: Duration,
    /// Sleep between leadership attempts while not leader.
    pub standby_poll: Duration,
    pub lock_key: String,
    pub lock_ttl: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            timezone: Tz::UTC,
            max_interval: Duration::from_secs(DEFAULT_MAX_INTERVAL_SECS),
            sync_every: Duration::ZERO,
            standby_poll: Duration::from_secs(DEFAULT_STANDBY_POLL_SECS),
            lock_key: DEFAULT_LOCK_KEY.to_string(),
            lock_ttl: Duration::from_secs(DEFAULT_LOCK_TTL_SECS),
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &CadenceConfig) -> Result<Self> {
        let sched = &config.scheduler;
        let timezone: Tz = sched.timezone.parse().map_err(|e| {
            SchedulerError::InvalidConfig(format!("unknown timezone {:?}: {e}", sched.timezone))
        })?;
        if sched.max_interval_secs == 0 {
            return Err(SchedulerError::InvalidConfig(
                "scheduler.max_interval_secs must be positive".to_string(),
            ));
        }
        if config.lock.ttl_secs == 0 {
            return Err(SchedulerError::InvalidConfig(
                "lock.ttl_secs must be positive".to_string(),
            ));
        }
        if config.lock.ttl_secs <= sched.max_interval_secs {
            // The lease is renewed once per tick; a TTL shorter than the
            // longest sleep would let it lapse between ticks.
            warn!(
                ttl_secs = config.lock.ttl_secs,
                max_interval_secs = sched.max_interval_secs,
                "lock TTL does not exceed the tick interval; leadership will flap"
            );
        }
        Ok(Self {
            timezone,
            max_interval: Duration::from_secs(sched.max_interval_secs),
            sync_every: Duration::from_secs(sched.sync_every_secs),
            standby_poll: Duration::from_secs(sched.standby_poll_secs.max(1)),
            lock_key: config.lock.key.clone(),
            lock_ttl: Duration::from_secs(config.lock.ttl_secs),
        })
    }
}

/// The working set of one engine instance.
#[derive(Debug, Default)]
pub struct SchedulerState {
    entries: HashMap<String, ScheduleEntry>,
    /// Min-heap of (next check, entry name).
    heap: BinaryHeap<Reverse<(DateTime<Utc>, String)>>,
    dirty: HashSet<String>,
    /// `None` until the first load; then the marker the working set reflects.
    last_seen_marker: Option<Option<DateTime<Utc>>>,
    last_flush: Option<DateTime<Utc>>,
}

impl SchedulerState {
    pub fn entry(&self, name: &str) -> Option<&ScheduleEntry> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names currently waiting in the heap, sorted.
    pub fn scheduled_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .heap
            .iter()
            .map(|Reverse((_, name))| name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn is_dirty(&self, name: &str) -> bool {
        self.dirty.contains(name)
    }

    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }

    fn push(&mut self, at: DateTime<Utc>, name: String) {
        self.heap.push(Reverse((at, name)));
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.heap.clear();
        self.dirty.clear();
        self.last_seen_marker = None;
    }
}

/// Persistent periodic scheduler: decides which entries are due, hands them
/// to the dispatcher and writes run history back to the store.
///
/// Several engines may share one store; the leader lock lets only one of
/// them dispatch at a time.
pub struct SchedulerEngine {
    store: Arc<dyn ScheduleStore>,
    lock: LeaderLock,
    dispatcher: Arc<dyn Dispatcher>,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
    state: SchedulerState,
}

impl SchedulerEngine {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        coordinator: Arc<dyn Coordinator>,
        dispatcher: Arc<dyn Dispatcher>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self {
        let lock = LeaderLock::new(coordinator, settings.lock_key.clone(), settings.lock_ttl);
        Self {
            store,
            lock,
            dispatcher,
            clock,
            settings,
            state: SchedulerState::default(),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.lock.is_held()
    }

    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Main event loop. Ticks until `shutdown` broadcasts `true`, then
    /// flushes and releases leadership.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(lock_key = %self.settings.lock_key, "beat engine started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            let wait = self.tick().await;
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("beat engine shutting down");
        self.shutdown().await;
    }

    /// One loop iteration. Returns how long to sleep before the next one.
    pub async fn tick(&mut self) -> Duration {
        if !self.ensure_leadership().await {
            return self.settings.standby_poll;
        }

        if let Err(e) = self.sync_schedule().await {
            warn!(error = %e, "schedule refresh failed, keeping last snapshot");
        }

        let now = self.clock.now();
        self.dispatch_due(now).await;

        if self.flush_window_open(now) {
            self.flush(now).await;
        }

        self.next_wake(self.clock.now())
    }

    /// Final best-effort flush, then release the lock.
    pub async fn shutdown(&mut self) {
        if self.lock.is_held() {
            let now = self.clock.now();
            let pending = self.flush(now).await;
            if pending > 0 {
                warn!(pending, "unflushed entries left at shutdown");
            }
        }
        if let Err(e) = self.lock.release().await {
            warn!(error = %e, "failed to release leadership");
        }
    }

    /// Become or stay leader. Returns whether this instance may
    /// dispatch on this tick.
    async fn ensure_leadership(&mut self) -> bool {
        if self.lock.is_held() {
            match self.lock.extend().await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => warn!(error = %e, "lease renewal failed, stepping down"),
            }
            self.step_down().await;
            return false;
        }

        match self.lock.acquire().await {
            Ok(true) => {
                // Another leader may have advanced counters meanwhile.
                self.state.clear();
                true
            }
            Ok(false) => {
                debug!("standing by, another instance is leader");
                false
            }
            Err(e) => {
                warn!(error = %e, "leader lock unavailable");
                false
            }
        }
    }

    async fn step_down(&mut self) {
        let now = self.clock.now();
        let pending = self.flush(now).await;
        if pending > 0 {
            warn!(pending, "dropping unflushed entries after losing leadership");
        }
        self.state.clear();
    }

    /// Reload the working set when the change marker moved.
    async fn sync_schedule(&mut self) -> Result<()> {
        let marker = self.store.get_change_marker().await?;
        if self.state.last_seen_marker == Some(marker) {
            return Ok(());
        }
        if !self.state.dirty.is_empty() {
            let now = self.clock.now();
            self.flush(now).await;
        }
        self.reload().await?;
        self.state.last_seen_marker = Some(marker);
        Ok(())
    }

    async fn reload(&mut self) -> Result<()> {
        let rows = self.store.load_enabled().await?;
        let now = self.clock.now();
        let mut entries = HashMap::with_capacity(rows.len());

        for row in rows {
            let name = row.name.clone();
            let id = row.id.clone();
            // No run time: the stored counters win the merge and the
            // disable is applied unconditionally.
            let disabled = RuntimeState {
                last_run_time: None,
                total_run_count: 0,
                enabled: false,
            };

            match ScheduleEntry::compile(row, self.settings.timezone) {
                Ok(mut entry) => {
                    if self.state.dirty.contains(&name) {
                        if let Some(previous) = self.state.entries.get(&name) {
                            if previous.last_run_time() > entry.last_run_time() {
                                entry.restore_runtime_state(previous.runtime_state());
                            }
                        }
                    }
                    entries.insert(name, entry);
                }
                Err(e) => {
                    error!(entry = %name, error = %e, "invalid schedule entry, disabling");
                    if let Err(e) = self.store.save_runtime_state(&id, disabled).await {
                        warn!(entry = %name, error = %e, "could not persist disabled state");
                    }
                }
            }
        }

        self.state.dirty.retain(|name| entries.contains_key(name));
        self.state.heap.clear();
        for name in entries.keys() {
            self.state.push(now, name.clone());
        }
        self.state.entries = entries;

        info!(count = self.state.entries.len(), "schedule reloaded");
        Ok(())
    }

    /// Fire every entry whose check time has come.
    async fn dispatch_due(&mut self, now: DateTime<Utc>) {
        while let Some(Reverse((at, _))) = self.state.heap.peek() {
            if *at > now {
                break;
            }
            let Some(Reverse((_, name))) = self.state.heap.pop() else {
                break;
            };
            let Some(entry) = self.state.entries.get_mut(&name) else {
                continue;
            };

            let check = entry.is_due(now);
            if check.due {
                let request = entry.dispatch_request(now);
                info!(entry = %name, task = %request.task, "dispatching entry");
                if let Err(e) = self.dispatcher.dispatch(request).await {
                    error!(entry = %name, error = %e, "dispatch failed");
                }
                entry.advance(now);
                self.state.dirty.insert(name.clone());
                if !entry.enabled() {
                    debug!(entry = %name, "one-off entry spent");
                    continue;
                }
            }
            self.state.push(later(now, check.next_check), name);
        }
    }

    fn flush_window_open(&self, now: DateTime<Utc>) -> bool {
        if self.state.dirty.is_empty() {
            return false;
        }
        match self.state.last_flush {
            Some(last) => (now - last)
                .to_std()
                .map_or(true, |since| since >= self.settings.sync_every),
            None => true,
        }
    }

    /// Write dirty counters back. Failed writes stay dirty for the
    /// next tick. Returns the number still dirty.
    async fn flush(&mut self, now: DateTime<Utc>) -> usize {
        let names: Vec<String> = self.state.dirty.iter().cloned().collect();
        for name in names {
            let Some(entry) = self.state.entries.get(&name) else {
                self.state.dirty.remove(&name);
                continue;
            };
            match self
                .store
                .save_runtime_state(entry.id(), entry.runtime_state())
                .await
            {
                Ok(()) => {
                    let spent = !entry.enabled();
                    self.state.dirty.remove(&name);
                    if spent {
                        self.state.entries.remove(&name);
                    }
                }
                Err(SchedulerError::EntryNotFound(_)) => {
                    warn!(entry = %name, "entry deleted before write-back");
                    self.state.dirty.remove(&name);
                    self.state.entries.remove(&name);
                }
                Err(e) => {
                    warn!(entry = %name, error = %e, "write-back failed, will retry");
                }
            }
        }
        self.state.last_flush = Some(now);
        self.state.dirty.len()
    }

    /// Sleep until the earliest check, capped at `max_interval`.
    fn next_wake(&self, now: DateTime<Utc>) -> Duration {
        self.state
            .heap
            .peek()
            .map(|Reverse((at, _))| (*at - now).to_std().unwrap_or(Duration::ZERO))
            .map_or(self.settings.max_interval, |d| d.min(self.settings.max_interval))
    }
}

fn later(now: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|by| now.checked_add_signed(by))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
