//! Concurrent execution of layer tasks.
//!
//! One task per `(device, layer)`. A task runs its commands sequentially, in
//! catalog order, on one session. Tasks run concurrently up to the configured
//! bound and never abort each other; only a jump-host failure cancels the
//! whole run.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{debug, error, info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::catalog::{CommandClass, CommandSpec, Layer};
use crate::config::CollectorConfig;
use crate::device::{Device, Platform};
use crate::error::{CollectError, ConnectError, FailureKind};
use crate::output::{OutputHandler, RunLayout, command_slug};
use crate::parsing::{ParseOutcome, ParseStatus, ParsingPipeline};
use crate::report::{CommandRecord, CommandStatus, LayerReport};
use crate::session::{ConnectionManager, Session};

/// Lifecycle of a layer task. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    /// Some commands failed, others produced data.
    Degraded,
    Failed(FailureKind),
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Degraded | TaskState::Failed(_)
        )
    }

    /// Applies a transition, rejecting anything but
    /// `pending -> running -> {succeeded, degraded, failed}` and
    /// `pending -> failed` (cancelled before start).
    pub fn transition(&mut self, next: TaskState) -> Result<(), CollectError> {
        let legal = match (*self, next) {
            (TaskState::Pending, TaskState::Running) => true,
            (TaskState::Pending, TaskState::Failed(_)) => true,
            (TaskState::Running, next) => next.is_terminal(),
            _ => false,
        };
        if !legal {
            return Err(CollectError::Internal(format!(
                "illegal task transition {self:?} -> {next:?}"
            )));
        }
        *self = next;
        Ok(())
    }

    /// Final state for a task's command records.
    pub fn settle(commands: &[CommandRecord]) -> TaskState {
        if commands.iter().any(|c| c.status == CommandStatus::Cancelled) {
            return TaskState::Failed(FailureKind::Cancelled);
        }
        if commands.iter().all(CommandRecord::is_ok) {
            return TaskState::Succeeded;
        }
        if commands.iter().any(CommandRecord::is_ok) {
            return TaskState::Degraded;
        }
        let kind = commands
            .iter()
            .find_map(|c| c.failure_kind)
            .unwrap_or(FailureKind::Internal);
        TaskState::Failed(kind)
    }
}

/// All commands of one layer on one device.
#[derive(Debug, Clone)]
pub struct LayerTask {
    pub device: Arc<Device>,
    pub layer: Layer,
    pub commands: Vec<CommandSpec>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskProgress {
    pub device_id: String,
    pub layer: Layer,
    pub completed: usize,
    pub total: usize,
    pub state: TaskState,
}

/// Snapshot published on the progress channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunProgress {
    pub tasks: Vec<TaskProgress>,
    pub settled: usize,
}

impl RunProgress {
    pub fn commands_completed(&self) -> usize {
        self.tasks.iter().map(|t| t.completed).sum()
    }
}

/// Result of executing every task of a run.
#[derive(Debug)]
pub struct ExecutionOutcome {
    /// One report per task, in task order.
    pub reports: Vec<(Arc<Device>, LayerReport)>,
    /// First fatal (jump host) error, if any.
    pub fatal: Option<String>,
}

pub struct TaskExecutor {
    manager: Arc<ConnectionManager>,
    pipeline: Arc<ParsingPipeline>,
    output: Arc<OutputHandler>,
    concurrency: usize,
    command_retries: u32,
    config: Arc<CollectorConfig>,
    progress: Arc<watch::Sender<RunProgress>>,
}

struct Worker {
    manager: Arc<ConnectionManager>,
    pipeline: Arc<ParsingPipeline>,
    output: Arc<OutputHandler>,
    config: Arc<CollectorConfig>,
    command_retries: u32,
    layout: Arc<RunLayout>,
    progress: Arc<watch::Sender<RunProgress>>,
    cancel: CancellationToken,
    fatal: Arc<Mutex<Option<String>>>,
}

impl TaskExecutor {
    pub fn new(
        manager: Arc<ConnectionManager>,
        pipeline: Arc<ParsingPipeline>,
        output: Arc<OutputHandler>,
        config: &CollectorConfig,
    ) -> Self {
        let (progress, _) = watch::channel(RunProgress::default());
        Self {
            manager,
            pipeline,
            output,
            concurrency: config.concurrency.max(1),
            command_retries: config.command_retries,
            config: Arc::new(config.clone()),
            progress: Arc::new(progress),
        }
    }

    /// Publishes progress on an existing channel instead of a private one.
    pub fn with_progress(mut self, progress: Arc<watch::Sender<RunProgress>>) -> Self {
        self.progress = progress;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<RunProgress> {
        self.progress.subscribe()
    }

    /// Runs every task to completion.
    ///
    /// Never fails: every task yields a report, panicked tasks included.
    pub async fn run(
        &self,
        layout: &RunLayout,
        tasks: Vec<LayerTask>,
        cancel: &CancellationToken,
    ) -> ExecutionOutcome {
        self.progress.send_replace(RunProgress {
            tasks: tasks
                .iter()
                .map(|t| TaskProgress {
                    device_id: t.device.id.clone(),
                    layer: t.layer,
                    completed: 0,
                    total: t.commands.len(),
                    state: TaskState::Pending,
                })
                .collect(),
            settled: 0,
        });

        let worker = Arc::new(Worker {
            manager: self.manager.clone(),
            pipeline: self.pipeline.clone(),
            output: self.output.clone(),
            config: self.config.clone(),
            command_retries: self.command_retries,
            layout: Arc::new(layout.clone()),
            progress: self.progress.clone(),
            cancel: cancel.clone(),
            fatal: Arc::new(Mutex::new(None)),
        });
        let admission = Arc::new(Semaphore::new(self.concurrency));
        let mut join_set: JoinSet<(usize, LayerReport)> = JoinSet::new();
        let mut task_ids = HashMap::new();

        for (idx, task) in tasks.iter().enumerate() {
            let worker = worker.clone();
            let admission = admission.clone();
            let task = task.clone();
            let handle = join_set.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = worker.cancel.cancelled() => None,
                    permit = admission.acquire_owned() => permit.ok(),
                };
                let report = match permit {
                    Some(_permit) => worker.run_task(idx, &task).await,
                    None => worker.skip_task(idx, &task, FailureKind::Cancelled, "cancelled before start"),
                };
                (idx, report)
            });
            task_ids.insert(handle.id(), idx);
        }

        let mut reports: Vec<Option<LayerReport>> = vec![None; tasks.len()];
        while let Some(joined) = join_set.join_next_with_id().await {
            match joined {
                Ok((_, (idx, report))) => reports[idx] = Some(report),
                Err(err) => {
                    let Some(&idx) = task_ids.get(&err.id()) else {
                        error!("unknown layer task failed: {}", err);
                        continue;
                    };
                    error!(
                        "{} {} task failed: {}",
                        tasks[idx].device.id, tasks[idx].layer, err
                    );
                    let reason = format!("task failed: {err}");
                    reports[idx] =
                        Some(worker.skip_task(idx, &tasks[idx], FailureKind::Internal, &reason));
                }
            }
        }

        let fatal = match worker.fatal.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        ExecutionOutcome {
            reports: tasks
                .into_iter()
                .zip(reports)
                .map(|(task, report)| {
                    let report = report.unwrap_or_else(|| LayerReport {
                        layer: task.layer,
                        state: TaskState::Failed(FailureKind::Internal),
                        completeness: 0.0,
                        session_acquired: false,
                        connect_retries: 0,
                        duration_ms: 0,
                        commands: Vec::new(),
                        error: Some("task produced no report".to_string()),
                    });
                    (task.device, report)
                })
                .collect(),
            fatal,
        }
    }
}

impl Worker {
    async fn run_task(&self, idx: usize, task: &LayerTask) -> LayerReport {
        let mut state = TaskState::Pending;
        self.set_state(idx, &mut state, TaskState::Running);
        debug!("{} {} started", task.device.id, task.layer);

        let started = Instant::now();
        let mut session: Option<Session> = None;
        let mut session_acquired = false;
        let mut connect_retries = 0;
        let mut last_error = None;
        let mut slugs = HashSet::new();
        let mut commands = Vec::with_capacity(task.commands.len());

        for spec in &task.commands {
            let slug = unique_slug(&mut slugs, &spec.command);
            let record = if self.cancel.is_cancelled() {
                CommandRecord::skipped(&spec.command, slug, FailureKind::Cancelled, "run cancelled")
            } else {
                self.run_command(
                    task,
                    spec,
                    slug,
                    &mut session,
                    &mut session_acquired,
                    &mut connect_retries,
                )
                .await
            };
            if let Some(err) = record.error.as_ref()
                && !record.is_ok()
            {
                last_error = Some(err.clone());
            }
            commands.push(record);
            self.progress.send_modify(|p| {
                if let Some(t) = p.tasks.get_mut(idx) {
                    t.completed += 1;
                }
            });
        }

        if let Some(session) = session.take() {
            self.manager.release(session).await;
        }

        let final_state = TaskState::settle(&commands);
        self.set_state(idx, &mut state, final_state);
        match final_state {
            TaskState::Succeeded => debug!("{} {} succeeded", task.device.id, task.layer),
            other => info!("{} {} finished {:?}", task.device.id, task.layer, other),
        }

        LayerReport {
            layer: task.layer,
            state,
            completeness: LayerReport::completeness_of(&commands),
            session_acquired,
            connect_retries,
            duration_ms: started.elapsed().as_millis() as u64,
            commands,
            error: if state == TaskState::Succeeded {
                None
            } else {
                last_error
            },
        }
    }

    /// Report for a task that never ran.
    fn skip_task(&self, idx: usize, task: &LayerTask, kind: FailureKind, reason: &str) -> LayerReport {
        let mut slugs = HashSet::new();
        let commands = task
            .commands
            .iter()
            .map(|spec| {
                let slug = unique_slug(&mut slugs, &spec.command);
                CommandRecord::skipped(&spec.command, slug, kind, reason)
            })
            .collect::<Vec<_>>();
        let state = TaskState::Failed(kind);
        self.progress.send_modify(|p| {
            if let Some(t) = p.tasks.get_mut(idx) {
                t.state = state;
            }
            p.settled += 1;
        });
        LayerReport {
            layer: task.layer,
            state,
            completeness: LayerReport::completeness_of(&commands),
            session_acquired: false,
            connect_retries: 0,
            duration_ms: 0,
            commands,
            error: Some(reason.to_string()),
        }
    }

    fn set_state(&self, idx: usize, state: &mut TaskState, next: TaskState) {
        if let Err(e) = state.transition(next) {
            warn!("{}", e);
            return;
        }
        let settled = next.is_terminal();
        self.progress.send_modify(|p| {
            if let Some(t) = p.tasks.get_mut(idx) {
                t.state = next;
            }
            if settled {
                p.settled += 1;
            }
        });
    }

    async fn acquire(&self, device: &Device) -> Result<Session, ConnectError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ConnectError::Cancelled),
            session = self.manager.acquire(device) => session,
        }
    }

    /// Records the first fatal error and cancels the run.
    fn abort_run(&self, err: &ConnectError) {
        let mut guard = match self.fatal.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.is_none() {
            error!("jump host failure, aborting run: {}", err);
            *guard = Some(err.to_string());
        }
        self.cancel.cancel();
    }

    async fn run_command(
        &self,
        task: &LayerTask,
        spec: &CommandSpec,
        slug: String,
        session: &mut Option<Session>,
        session_acquired: &mut bool,
        connect_retries: &mut u32,
    ) -> CommandRecord {
        let device = task.device.as_ref();
        let timeout = spec.timeout(&self.config);
        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            if session.is_none() {
                match self.acquire(device).await {
                    Ok(fresh) => {
                        *session_acquired = true;
                        *connect_retries += fresh.connect_retries();
                        *session = Some(fresh);
                    }
                    Err(err) => {
                        if err.is_fatal() {
                            self.abort_run(&err);
                        } else if !matches!(err, ConnectError::Cancelled) {
                            warn!("{} {}: no session: {}", device.id, task.layer, err);
                        }
                        let mut record = CommandRecord::skipped(
                            &spec.command,
                            slug,
                            err.failure_kind(),
                            &err.to_string(),
                        );
                        record.attempts = attempts;
                        record.duration_ms = elapsed_ms(started);
                        return record;
                    }
                }
            }
            let Some(active) = session.as_mut() else {
                continue;
            };

            attempts += 1;
            match self.manager.execute(active, &spec.command, timeout).await {
                Ok(output) => {
                    return self
                        .collect_output(task, spec, slug, output.content, output.success, attempts, started)
                        .await;
                }
                Err(ConnectError::ExecTimeout(partial)) => {
                    if let Some(stale) = session.take() {
                        self.manager.release(stale).await;
                    }
                    if attempts <= self.command_retries && !self.cancel.is_cancelled() {
                        warn!(
                            "{} '{}' timed out after {:?}, retrying on a fresh session ({}/{})",
                            device.id, spec.command, timeout, attempts, self.command_retries
                        );
                        continue;
                    }
                    warn!("{} '{}' timed out after {:?}", device.id, spec.command, timeout);
                    let err = ConnectError::ExecTimeout(format!("no prompt within {timeout:?}"));
                    return self
                        .failed_with_output(task, slug, spec, partial, &err, attempts, started)
                        .await;
                }
                Err(err) => {
                    if let Some(stale) = session.take() {
                        self.manager.release(stale).await;
                    }
                    if err.is_fatal() {
                        self.abort_run(&err);
                    }
                    warn!("{} '{}' failed: {}", device.id, spec.command, err);
                    let mut record = CommandRecord::skipped(
                        &spec.command,
                        slug,
                        err.failure_kind(),
                        &err.to_string(),
                    );
                    record.attempts = attempts;
                    record.duration_ms = elapsed_ms(started);
                    return record;
                }
            }
        }
    }

    /// Runs the parsing pipeline. Bulk outputs are parsed on the blocking
    /// pool so a full table dump does not stall the runtime.
    async fn interpret(
        &self,
        platform: Platform,
        spec: &CommandSpec,
        content: String,
    ) -> (ParseOutcome, String) {
        if spec.class != CommandClass::Bulk {
            let outcome = self.pipeline.process(platform, spec, &content);
            return (outcome, content);
        }
        let raw = Arc::new(content);
        let (pipeline, owned_spec, shared) = (self.pipeline.clone(), spec.clone(), raw.clone());
        let outcome =
            tokio::task::spawn_blocking(move || pipeline.process(platform, &owned_spec, &shared))
                .await
                .unwrap_or_else(|e| {
                    warn!("parsing '{}' failed: {}", spec.command, e);
                    ParseOutcome::raw_only(Some(format!("parser task failed: {e}")))
                });
        let content = Arc::try_unwrap(raw).unwrap_or_else(|shared| shared.as_ref().clone());
        (outcome, content)
    }

    #[allow(clippy::too_many_arguments)]
    async fn collect_output(
        &self,
        task: &LayerTask,
        spec: &CommandSpec,
        slug: String,
        content: String,
        success: bool,
        attempts: u32,
        started: Instant,
    ) -> CommandRecord {
        let device = task.device.as_ref();
        let (outcome, content) = self.interpret(device.platform, spec, content).await;

        let (status, failure_kind, payload, error) = if outcome.status == ParseStatus::NotConfigured {
            info!(
                "{} '{}' not configured: {}",
                device.id,
                spec.command,
                outcome.error.as_deref().unwrap_or("")
            );
            (CommandStatus::NotConfigured, None, None, None)
        } else if !success {
            let first_line = content.lines().find(|l| l.trim_start().starts_with('%'));
            let reason = format!(
                "device rejected command: {}",
                first_line.unwrap_or("error line in output").trim()
            );
            warn!("{} '{}': {}", device.id, spec.command, reason);
            (CommandStatus::Failed, Some(FailureKind::Rejected), None, Some(reason))
        } else {
            (CommandStatus::Succeeded, None, outcome.payload.clone(), outcome.error.clone())
        };
        let parse_status = if status == CommandStatus::Failed {
            ParseStatus::RawOnly
        } else {
            outcome.status
        };
        let parser = payload.as_ref().and(outcome.parser);

        let mut record = CommandRecord {
            command: spec.command.clone(),
            slug: slug.clone(),
            status,
            failure_kind,
            parse_status: Some(parse_status),
            parser,
            bytes: content.len() as u64,
            compressed: false,
            raw_artifact: None,
            json_artifact: None,
            attempts,
            duration_ms: 0,
            error,
        };
        self.persist(task, &slug, content, payload, &mut record).await;
        record.duration_ms = elapsed_ms(started);
        record
    }

    #[allow(clippy::too_many_arguments)]
    async fn failed_with_output(
        &self,
        task: &LayerTask,
        slug: String,
        spec: &CommandSpec,
        partial: String,
        err: &ConnectError,
        attempts: u32,
        started: Instant,
    ) -> CommandRecord {
        let mut record =
            CommandRecord::skipped(&spec.command, slug.clone(), err.failure_kind(), &err.to_string());
        record.attempts = attempts;
        record.bytes = partial.len() as u64;
        if !partial.is_empty() {
            self.persist(task, &slug, partial, None, &mut record).await;
        }
        record.duration_ms = elapsed_ms(started);
        record
    }

    async fn persist(
        &self,
        task: &LayerTask,
        slug: &str,
        raw: String,
        payload: Option<serde_json::Value>,
        record: &mut CommandRecord,
    ) {
        match self
            .output
            .write_command(&self.layout, &task.device.id, task.layer, slug, raw, payload)
            .await
        {
            Ok(artifact) => {
                record.compressed = artifact.compressed;
                record.raw_artifact = Some(artifact.raw_path);
                record.json_artifact = artifact.json_path;
            }
            Err(e) => {
                warn!("{} '{}': artifact write failed: {}", task.device.id, record.command, e);
                record.status = CommandStatus::Failed;
                record.failure_kind = Some(FailureKind::Internal);
                record.error = Some(format!("artifact write failed: {e}"));
            }
        }
    }
}

fn unique_slug(used: &mut HashSet<String>, command: &str) -> String {
    let base = command_slug(command);
    let mut slug = base.clone();
    let mut n = 2;
    while !used.insert(slug.clone()) {
        slug = format!("{base}_{n}");
        n += 1;
    }
    slug
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_state_moves_forward_only() {
        let mut state = TaskState::Pending;
        assert!(state.transition(TaskState::Succeeded).is_err());
        state.transition(TaskState::Running).expect("start");
        assert!(state.transition(TaskState::Pending).is_err());
        assert!(state.transition(TaskState::Running).is_err());
        state.transition(TaskState::Degraded).expect("settle");
        assert!(state.transition(TaskState::Succeeded).is_err());
        assert_eq!(state, TaskState::Degraded);

        let mut cancelled = TaskState::Pending;
        cancelled
            .transition(TaskState::Failed(FailureKind::Cancelled))
            .expect("cancel before start");
    }

    fn record(status: CommandStatus, kind: Option<FailureKind>) -> CommandRecord {
        let mut r = CommandRecord::skipped("show x", "show_x".to_string(), FailureKind::Internal, "");
        r.status = status;
        r.failure_kind = kind;
        r
    }

    #[test]
    fn settle_classifies_layer_outcome() {
        assert_eq!(TaskState::settle(&[]), TaskState::Succeeded);
        assert_eq!(
            TaskState::settle(&[
                record(CommandStatus::Succeeded, None),
                record(CommandStatus::NotConfigured, None),
            ]),
            TaskState::Succeeded
        );
        assert_eq!(
            TaskState::settle(&[
                record(CommandStatus::Succeeded, None),
                record(CommandStatus::Failed, Some(FailureKind::Timeout)),
            ]),
            TaskState::Degraded
        );
        assert_eq!(
            TaskState::settle(&[record(CommandStatus::Failed, Some(FailureKind::Auth))]),
            TaskState::Failed(FailureKind::Auth)
        );
        assert_eq!(
            TaskState::settle(&[
                record(CommandStatus::Succeeded, None),
                record(CommandStatus::Cancelled, Some(FailureKind::Cancelled)),
            ]),
            TaskState::Failed(FailureKind::Cancelled)
        );
    }

    #[test]
    fn duplicate_slugs_in_a_layer_are_numbered() {
        let mut used = HashSet::new();
        assert_eq!(unique_slug(&mut used, "show ip route"), "show_ip_route");
        assert_eq!(unique_slug(&mut used, "show  ip route"), "show_ip_route_2");
        assert_eq!(unique_slug(&mut used, "show ip-route"), "show_ip_route_3");
    }

    #[test]
    fn task_state_serializes_failure_kind() {
        let json = serde_json::to_string(&TaskState::Failed(FailureKind::Auth)).expect("json");
        assert_eq!(json, r#"{"failed":"auth"}"#);
        let json = serde_json::to_string(&TaskState::Succeeded).expect("json");
        assert_eq!(json, r#""succeeded""#);
    }
}
