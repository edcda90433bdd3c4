//! Operator commands that edit the schedule table directly.
//!
//! Every mutation goes through the store, so a running beat picks it up on
//! its next change-marker poll.

use anyhow::{bail, Context};
use cadence_scheduler::{
    Crontab, IntervalUnit, NewPeriodicTask, PeriodicTask, Policy, RoutingHints, ScheduleStore,
    SqliteScheduleStore,
};
use clap::Args;
use serde_json::{Map, Value};

#[derive(Args)]
pub struct AddArgs {
    /// Unique entry name
    name: String,
    /// Task identifier handed to the dispatcher
    task: String,
    /// Repeat every N units
    #[arg(long, conflicts_with = "cron", required_unless_present = "cron")]
    every: Option<u64>,
    /// Unit for --every: days, hours, minutes, seconds, microseconds
    #[arg(long, default_value = "seconds")]
    unit: IntervalUnit,
    /// Five-field crontab: minute hour day-of-month day-of-week month-of-year
    #[arg(long)]
    cron: Option<String>,
    /// Positional arguments as a JSON array
    #[arg(long, default_value = "[]")]
    args: String,
    /// Keyword arguments as a JSON object
    #[arg(long, default_value = "{}")]
    kwargs: String,
    #[arg(long)]
    queue: Option<String>,
    #[arg(long)]
    priority: Option<u8>,
    /// Jobs not started this many seconds after dispatch are dropped
    #[arg(long)]
    expire_after: Option<u64>,
    /// Fire once, then disable
    #[arg(long)]
    one_off: bool,
    #[arg(long)]
    description: Option<String>,
    /// Create the entry disabled
    #[arg(long)]
    disabled: bool,
}

impl AddArgs {
    fn into_new_task(self) -> anyhow::Result<NewPeriodicTask> {
        let policy = match (self.cron, self.every) {
            (Some(expr), _) => {
                let cron = Crontab::parse(&expr).context("invalid --cron expression")?;
                Policy::Crontab(cron.spec().clone())
            }
            (None, Some(every)) => {
                if every == 0 || self.unit.span(every).is_none() {
                    bail!("--every must be a positive interval that fits in a duration");
                }
                Policy::Interval {
                    every,
                    unit: self.unit,
                }
            }
            (None, None) => bail!("either --every or --cron is required"),
        };

        serde_json::from_str::<Vec<Value>>(&self.args).context("--args must be a JSON array")?;
        serde_json::from_str::<Map<String, Value>>(&self.kwargs)
            .context("--kwargs must be a JSON object")?;

        let mut task = NewPeriodicTask::new(self.name, self.task, policy);
        task.args = self.args;
        task.kwargs = self.kwargs;
        task.routing = RoutingHints {
            queue: self.queue,
            priority: self.priority,
            ..Default::default()
        };
        task.expire_after_secs = self.expire_after;
        task.one_off = self.one_off;
        task.enabled = !self.disabled;
        task.description = self.description;
        Ok(task)
    }
}

pub fn list(store: &SqliteScheduleStore, all: bool) -> anyhow::Result<()> {
    let tasks = store.list_all()?;
    let shown: Vec<&PeriodicTask> = tasks.iter().filter(|t| all || t.enabled).collect();
    if shown.is_empty() {
        println!("no schedule entries");
        return Ok(());
    }
    for t in shown {
        let last = t
            .last_run_time
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:<24} {:<8} {:<20} {:<28} runs={:<6} last={}",
            t.name,
            if t.enabled { "enabled" } else { "disabled" },
            t.task,
            describe(&t.policy),
            t.total_run_count,
            last
        );
    }
    Ok(())
}

fn describe(policy: &Policy) -> String {
    match policy {
        Policy::Interval { every, unit } => format!("every {every} {unit}"),
        Policy::Crontab(spec) => format!("cron {spec}"),
    }
}

pub async fn add(store: &SqliteScheduleStore, args: AddArgs) -> anyhow::Result<()> {
    let created = store.create(args.into_new_task()?).await?;
    println!("added {} ({})", created.name, created.id);
    Ok(())
}

pub async fn set_enabled(
    store: &SqliteScheduleStore,
    name: &str,
    enabled: bool,
) -> anyhow::Result<()> {
    let task = store.get_by_name(name)?;
    store.set_enabled(&task.id, enabled).await?;
    println!(
        "{} {}",
        if enabled { "enabled" } else { "disabled" },
        task.name
    );
    Ok(())
}

pub async fn remove(store: &SqliteScheduleStore, name: &str) -> anyhow::Result<()> {
    let task = store.get_by_name(name)?;
    store.delete(&task.id).await?;
    println!("removed {}", task.name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_scheduler::CrontabSpec;
    use clap::Parser;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        add: AddArgs,
    }

    fn parse(argv: &[&str]) -> anyhow::Result<NewPeriodicTask> {
        let mut full = vec!["add"];
        full.extend_from_slice(argv);
        Wrapper::try_parse_from(full)?.add.into_new_task()
    }

    #[test]
    fn builds_interval_entry() {
        let task = parse(&["heartbeat", "ops.ping", "--every", "30", "--queue", "ops"]).unwrap();
        assert_eq!(
            task.policy,
            Policy::Interval {
                every: 30,
                unit: IntervalUnit::Seconds
            }
        );
        assert_eq!(task.routing.queue.as_deref(), Some("ops"));
        assert!(task.enabled);
    }

    #[test]
    fn builds_crontab_entry() {
        let task = parse(&["nightly", "reports.build", "--cron", "30 2 * * mon-fri"]).unwrap();
        assert_eq!(
            task.policy,
            Policy::Crontab(CrontabSpec {
                minute: "30".to_string(),
                hour: "2".to_string(),
                day_of_week: "mon-fri".to_string(),
                ..Default::default()
            })
        );
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse(&["a", "t", "--cron", "x x x"]).is_err());
        assert!(parse(&["a", "t", "--every", "0"]).is_err());
        assert!(parse(&["a", "t", "--every", "5", "--args", "{}"]).is_err());
        assert!(parse(&["a", "t"]).is_err());
    }
}
