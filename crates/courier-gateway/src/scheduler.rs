use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use courier_core::{AgentRunner, ConversationKey};
use cron::Schedule;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::{SharedConfig, TaskConfig, TriggerConfig, resolve_config_path};
use crate::dedup::{DEFAULT_CAPACITY, DedupFilter};
use crate::executor::{TurnOutcome, run_turn};
use crate::registry::SessionRegistry;
use crate::sinks::{SinkContext, SinkOutput, build_sinks};
use crate::sources::{KeywordFilter, build_sources};

pub(crate) fn parse_cron(expr: &str) -> Result<Schedule> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    let full_expr = match fields.len() {
        5 => format!("0 {expr} *"),
        6 => format!("0 {expr}"),
        7 => expr.to_owned(),
        _ => anyhow::bail!("invalid cron expression (expected 5-7 fields): {expr}"),
    };
    Schedule::from_str(&full_expr)
        .map_err(|e| anyhow::anyhow!("invalid cron expression '{expr}': {e}"))
}

pub(crate) fn parse_timezone(name: Option<&str>) -> Result<Tz> {
    match name {
        None => Ok(Tz::UTC),
        Some(name) => name
            .parse::<Tz>()
            .map_err(|e| anyhow::anyhow!("unknown timezone '{name}': {e}")),
    }
}

/// How a task is scheduled, parsed from its trigger config.
#[derive(Debug, Clone)]
pub(crate) enum Trigger {
    Cron { schedule: Schedule, timezone: Tz },
    Poll { interval: Duration },
}

impl Trigger {
    pub(crate) fn from_task(task: &TaskConfig) -> Result<Self> {
        match &task.trigger {
            TriggerConfig::Cron(expr) => Ok(Self::Cron {
                schedule: parse_cron(expr)?,
                timezone: parse_timezone(task.timezone.as_deref())?,
            }),
            TriggerConfig::Poll { interval_secs } => {
                anyhow::ensure!(*interval_secs > 0, "poll interval must be positive");
                Ok(Self::Poll {
                    interval: Duration::from_secs(*interval_secs),
                })
            }
        }
    }

    /// When a newly planned task first fires: the next cron slot after
    /// `now`, or immediately for poll triggers.
    fn first_fire(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Cron { .. } => self.fire_after(now),
            Self::Poll { .. } => Some(now),
        }
    }

    /// The fire time following a fire at `fired_at`.
    fn fire_after(&self, fired_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Cron { schedule, timezone } => schedule
                .after(&fired_at.with_timezone(timezone))
                .next()
                .map(|t| t.with_timezone(&Utc)),
            Self::Poll { interval } => chrono::Duration::from_std(*interval)
                .ok()
                .and_then(|interval| fired_at.checked_add_signed(interval)),
        }
    }
}

/// How often to re-check config when nothing is due sooner.
const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(10);

pub(crate) async fn run_scheduler(
    config: SharedConfig,
    executor: Arc<TaskExecutor>,
    shutdown: CancellationToken,
) {
    info!("scheduler started");

    let mut last_tasks: Vec<TaskConfig> = Vec::new();
    let mut planned: Vec<(TaskConfig, Trigger)> = Vec::new();
    // Next fire time per task name. Every task keeps its own entry, so
    // tasks sharing a fire time all fire.
    let mut next_due: HashMap<String, DateTime<Utc>> = HashMap::new();

    loop {
        // Re-read tasks on each iteration so hot-reloaded changes are picked
        // up without a restart.
        let snapshot = config.load();
        if snapshot.tasks != last_tasks {
            planned = plan_tasks(&snapshot.tasks);
            next_due = replan_due(&planned, &last_tasks, &next_due, Utc::now());
            if !snapshot.tasks.is_empty() {
                info!(
                    count = planned.len(),
                    total = snapshot.tasks.len(),
                    "scheduler tasks updated"
                );
            }
            last_tasks = snapshot.tasks.clone();
        }
        drop(snapshot);

        let Some((name, fire_time)) = next_due
            .iter()
            .min_by_key(|(_, due)| **due)
            .map(|(name, due)| (name.clone(), *due))
        else {
            tokio::select! {
                () = tokio::time::sleep(CONFIG_POLL_INTERVAL) => continue,
                () = shutdown.cancelled() => {
                    info!("scheduler shutting down");
                    return;
                }
            }
        };

        let delay = (fire_time - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        // Cap sleep so we notice config changes within CONFIG_POLL_INTERVAL.
        let capped = delay.min(CONFIG_POLL_INTERVAL);

        debug!(
            task.name = %name,
            fire_time = %fire_time,
            delay_secs = delay.as_secs(),
            "scheduler sleeping until next task"
        );

        tokio::select! {
            () = tokio::time::sleep(capped) => {
                fire_due_tasks(&planned, &mut next_due, &executor, Utc::now());
            }
            () = shutdown.cancelled() => {
                info!("scheduler shutting down");
                return;
            }
        }
    }
}

/// Due times for a new plan. Tasks whose config is unchanged keep their
/// pending due time; new or edited tasks are scheduled from `now`.
fn replan_due(
    planned: &[(TaskConfig, Trigger)],
    previous_tasks: &[TaskConfig],
    previous_due: &HashMap<String, DateTime<Utc>>,
    now: DateTime<Utc>,
) -> HashMap<String, DateTime<Utc>> {
    planned
        .iter()
        .filter_map(|(task, trigger)| {
            let kept = previous_tasks
                .contains(task)
                .then(|| previous_due.get(&task.name).copied())
                .flatten();
            kept.or_else(|| trigger.first_fire(now))
                .map(|due| (task.name.clone(), due))
        })
        .collect()
}

/// Fire every task whose due time has passed and schedule its next fire.
fn fire_due_tasks(
    planned: &[(TaskConfig, Trigger)],
    next_due: &mut HashMap<String, DateTime<Utc>>,
    executor: &Arc<TaskExecutor>,
    now: DateTime<Utc>,
) {
    for (task, trigger) in planned {
        let Some(due) = next_due.get(&task.name).copied() else {
            continue;
        };
        if due > now {
            continue;
        }
        match trigger.fire_after(now) {
            Some(next) => {
                next_due.insert(task.name.clone(), next);
            }
            None => {
                next_due.remove(&task.name);
            }
        }
        let task = task.clone();
        let executor = Arc::clone(executor);
        tokio::spawn(async move {
            executor.fire(&task).await;
        });
    }
}

/// Parse triggers, logging and skipping invalid tasks once per config change.
fn plan_tasks(tasks: &[TaskConfig]) -> Vec<(TaskConfig, Trigger)> {
    let mut planned = Vec::new();
    for task in tasks {
        match Trigger::from_task(task) {
            Ok(trigger) => planned.push((task.clone(), trigger)),
            Err(e) => {
                error!(task.name = %task.name, error = %e, "skipping task with invalid trigger");
            }
        }
    }
    planned
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TaskRunOutcome {
    Completed { delivered: bool },
    /// A previous run of the task is still in flight.
    Skipped,
    /// The task's sources produced nothing new.
    NoNewItems,
    Failed(String),
}

/// Executes pipeline tasks through the shared session machinery.
pub(crate) struct TaskExecutor {
    registry: Arc<SessionRegistry>,
    runner: Arc<dyn AgentRunner>,
    sinks: SinkContext,
    seen: Mutex<HashMap<String, Arc<DedupFilter>>>,
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("sinks", &self.sinks)
            .finish_non_exhaustive()
    }
}

impl TaskExecutor {
    pub(crate) fn new(
        registry: Arc<SessionRegistry>,
        runner: Arc<dyn AgentRunner>,
        sinks: SinkContext,
    ) -> Self {
        Self {
            registry,
            runner,
            sinks,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) async fn fire(&self, task: &TaskConfig) -> TaskRunOutcome {
        let span = info_span!("task_fired", task.name = %task.name);
        async {
            let outcome = self.fire_inner(task).await;
            match &outcome {
                TaskRunOutcome::Completed { delivered } => info!(delivered, "task completed"),
                TaskRunOutcome::Skipped => info!("task still running, skipping this fire"),
                TaskRunOutcome::NoNewItems => debug!("no new source items, task not run"),
                TaskRunOutcome::Failed(reason) => error!(reason = %reason, "task failed"),
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn fire_inner(&self, task: &TaskConfig) -> TaskRunOutcome {
        let key = ConversationKey::task(&task.name);
        let Some(mut guard) = self.registry.mark_busy(&key) else {
            return TaskRunOutcome::Skipped;
        };

        let prompt = match self.load_prompt(task) {
            Ok(prompt) => prompt,
            Err(e) => return TaskRunOutcome::Failed(format!("{e:#}")),
        };
        let sinks = match build_sinks(&task.sinks, &self.sinks) {
            Ok(sinks) => sinks,
            Err(e) => return TaskRunOutcome::Failed(format!("{e:#}")),
        };

        let prompt = if task.sources.is_empty() {
            prompt
        } else {
            let items = self.new_items(task).await;
            if items.is_empty() {
                return TaskRunOutcome::NoNewItems;
            }
            info!(items = items.len(), "new source items");
            compose_prompt(&prompt, &items)
        };

        if task.fresh_session {
            guard.start_fresh();
        }

        let mut output = SinkOutput::new(&task.name, sinks);
        match run_turn(
            self.runner.as_ref(),
            guard,
            prompt,
            task.executor.allowed_tools.clone(),
            &mut output,
        )
        .await
        {
            TurnOutcome::SpawnFailed => TaskRunOutcome::Failed("agent failed to start".to_owned()),
            TurnOutcome::Finished { delivered, .. } => TaskRunOutcome::Completed { delivered },
        }
    }

    fn load_prompt(&self, task: &TaskConfig) -> Result<String> {
        match (&task.executor.prompt, &task.executor.prompt_file) {
            (Some(prompt), None) => Ok(prompt.clone()),
            (None, Some(file)) => {
                let path = resolve_config_path(&self.sinks.config_dir, file);
                std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read prompt file {}", path.display()))
            }
            (Some(_), Some(_)) => anyhow::bail!("task sets both prompt and prompt_file"),
            (None, None) => anyhow::bail!("task has no prompt or prompt_file"),
        }
    }

    /// Poll every source and keep items that pass the filter and have not
    /// been seen by this task before.
    async fn new_items(&self, task: &TaskConfig) -> Vec<String> {
        let filter = KeywordFilter::new(task.filter.as_ref());
        let seen = self.seen_ring(&task.name);
        let mut items = Vec::new();

        for source in build_sources(&task.sources, &self.sinks.config_dir) {
            match source.poll().await {
                Ok(polled) => items.extend(
                    polled
                        .into_iter()
                        .filter(|item| filter.matches(item))
                        .filter(|item| seen.admit(item)),
                ),
                Err(e) => warn!(
                    source = %source.describe(),
                    error = %format!("{e:#}"),
                    "source poll failed"
                ),
            }
        }
        items
    }

    fn seen_ring(&self, task: &str) -> Arc<DedupFilter> {
        let mut seen = self.seen.lock().expect("seen items lock poisoned");
        Arc::clone(
            seen.entry(task.to_owned())
                .or_insert_with(|| Arc::new(DedupFilter::new(DEFAULT_CAPACITY))),
        )
    }
}

fn compose_prompt(prompt: &str, items: &[String]) -> String {
    let mut composed = prompt.trim_end().to_owned();
    composed.push_str("\n\n");
    for item in items {
        composed.push_str("- ");
        composed.push_str(item);
        composed.push('\n');
    }
    composed
}
