//! Executor: runs the pending tasks of a queue.
//!
//! lock → load → recover stale `running` → validate → order → dispatch →
//! record. The store is saved after every status transition so a crash
//! leaves an accurate record. Failures are data: a failed task poisons its
//! dependents and, in transactional mode only, stops dispatch.

use super::error::{EngineError, QueueError, StoreError};
use super::resolver::{readiness, resolve_params, DependencyGraph, Readiness};
use super::state::QueueStore;
use super::types::*;
use super::validator::validate_queue;
use crate::actions::{ActionExecutor, ActionOutcome};
use crate::provenance::eventlog::{generate_run_id, now_iso8601};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Configuration for one run.
pub struct ExecuteConfig<'a> {
    pub store: &'a QueueStore,
    pub actions: Arc<dyn ActionExecutor>,
    pub mode: ExecutionMode,
    pub dry_run: bool,
    /// Concurrent dispatch bound for parallel mode
    pub max_workers: usize,
}

/// Outcome of one dispatched task.
struct Dispatched {
    index: u32,
    outcome: ActionOutcome,
    elapsed: Duration,
}

/// Shared context for recording transitions.
struct RunCtx<'a> {
    store: &'a QueueStore,
    queue: Queue,
    run_id: String,
    reports: BTreeMap<u32, TaskReport>,
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl RunCtx<'_> {
    fn report(&mut self, index: u32) -> Option<&mut TaskReport> {
        self.reports.get_mut(&index)
    }

    fn mark_running(&mut self, index: u32, params: Params, wave: usize) -> Result<(), StoreError> {
        let Some(task) = self.queue.get_mut(index) else {
            return Ok(());
        };
        task.status = TaskStatus::Running;
        let action = task.action;
        self.store.save(&self.queue)?;
        if let Some(report) = self.report(index) {
            report.status = TaskStatus::Running;
            report.wave = Some(wave);
            report.params = params;
        }
        self.store.record(QueueEvent::TaskStarted {
            run_id: self.run_id.clone(),
            index,
            action,
        });
        tracing::debug!(index, %action, wave, "dispatching task");
        Ok(())
    }

    /// Record a dispatch outcome. Returns whether the task completed.
    fn finish(&mut self, done: Dispatched) -> Result<bool, StoreError> {
        let duration_ms = millis(done.elapsed);
        if done.outcome.success {
            let result = done.outcome.result.unwrap_or_default();
            if let Some(task) = self.queue.get_mut(done.index) {
                task.status = TaskStatus::Completed;
                task.result = Some(result.clone());
                task.error = None;
                task.finished_at = Some(now_iso8601());
            }
            self.store.save(&self.queue)?;
            if let Some(report) = self.report(done.index) {
                report.status = TaskStatus::Completed;
                report.result = Some(result);
                report.duration_ms = Some(duration_ms);
            }
            self.store.record(QueueEvent::TaskCompleted {
                run_id: self.run_id.clone(),
                index: done.index,
                duration_ms,
            });
            tracing::info!(index = done.index, duration_ms, "task completed");
            Ok(true)
        } else {
            let error = QueueError::Execution {
                index: done.index,
                message: done
                    .outcome
                    .error
                    .unwrap_or_else(|| "action failed without an error message".to_string()),
            };
            self.fail(&error, Some(duration_ms), false)?;
            Ok(false)
        }
    }

    /// Fail a task without dispatching it.
    fn poison(&mut self, error: QueueError) -> Result<(), StoreError> {
        tracing::warn!(index = error.task_index(), error = %error, "task poisoned");
        self.fail(&error, None, true)
    }

    fn fail(
        &mut self,
        cause: &QueueError,
        duration_ms: Option<u64>,
        poisoned: bool,
    ) -> Result<(), StoreError> {
        let index = cause.task_index();
        let error = cause.detail();
        if let Some(task) = self.queue.get_mut(index) {
            task.status = TaskStatus::Failed;
            task.error = Some(error.clone());
            task.result = None;
            task.finished_at = Some(now_iso8601());
        }
        self.store.save(&self.queue)?;
        if let Some(report) = self.report(index) {
            report.status = TaskStatus::Failed;
            report.error = Some(error.clone());
            report.duration_ms = duration_ms;
            report.poisoned = poisoned;
        }
        let run_id = self.run_id.clone();
        if poisoned {
            self.store.record(QueueEvent::TaskPoisoned {
                run_id,
                index,
                error,
            });
        } else {
            tracing::warn!(index, kind = cause.kind(), error = %error, "task failed");
            self.store.record(QueueEvent::TaskFailed {
                run_id,
                index,
                error,
            });
        }
        Ok(())
    }

    fn is_pending(&self, index: u32) -> bool {
        self.queue
            .get(index)
            .is_some_and(|t| t.status == TaskStatus::Pending)
    }
}

async fn dispatch(
    actions: Arc<dyn ActionExecutor>,
    index: u32,
    action: Action,
    params: Params,
) -> Dispatched {
    let start = Instant::now();
    let outcome = tokio::task::spawn_blocking(move || actions.invoke(action, &params))
        .await
        .unwrap_or_else(|e| ActionOutcome::failed(format!("action handler panicked: {}", e)));
    Dispatched {
        index,
        outcome,
        elapsed: start.elapsed(),
    }
}

/// Mark tasks left `running` by a dead process as failed.
fn recover_interrupted(queue: &mut Queue) -> Vec<u32> {
    let mut recovered = Vec::new();
    for task in queue
        .tasks
        .iter_mut()
        .filter(|t| t.status == TaskStatus::Running)
    {
        task.status = TaskStatus::Failed;
        task.error = Some("interrupted: a previous run stopped while this task was running".into());
        task.finished_at = Some(now_iso8601());
        recovered.push(task.index);
    }
    recovered
}

/// Execute the pending tasks of the queue.
pub async fn execute(cfg: &ExecuteConfig<'_>) -> Result<RunReport, EngineError> {
    let start = Instant::now();
    let _lock = cfg.store.lock()?;
    let mut queue = cfg.store.load()?;

    if !cfg.dry_run {
        let recovered = recover_interrupted(&mut queue);
        if !recovered.is_empty() {
            tracing::warn!(tasks = ?recovered, "marked interrupted tasks as failed");
            cfg.store.save(&queue)?;
        }
    }

    let validation = validate_queue(&queue);
    if !validation.valid {
        return Err(EngineError::Invalid(validation));
    }

    let graph = DependencyGraph::from_queue(&queue);
    let waves = graph
        .waves()
        .map_err(|e| EngineError::Runtime(e.to_string()))?;
    let wave_of: FxHashMap<u32, usize> = waves
        .iter()
        .enumerate()
        .flat_map(|(w, ids)| ids.iter().map(move |i| (*i, w + 1)))
        .collect();

    let participants: Vec<u32> = queue
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .map(|t| t.index)
        .collect();

    let reports: BTreeMap<u32, TaskReport> = participants
        .iter()
        .filter_map(|&i| queue.get(i))
        .map(|t| {
            let params = if cfg.dry_run {
                resolve_params(t, &queue).unwrap_or_else(|_| t.params.clone())
            } else {
                t.params.clone()
            };
            let report = TaskReport {
                index: t.index,
                action: t.action,
                status: TaskStatus::Pending,
                wave: wave_of.get(&t.index).copied(),
                params,
                result: None,
                error: None,
                duration_ms: None,
                poisoned: false,
            };
            (t.index, report)
        })
        .collect();

    let run_id = generate_run_id();
    tracing::info!(
        run_id = %run_id,
        mode = %cfg.mode,
        tasks = participants.len(),
        waves = waves.len(),
        dry_run = cfg.dry_run,
        "run started"
    );

    let mut ctx = RunCtx {
        store: cfg.store,
        queue,
        run_id,
        reports,
    };

    let mut halted_at = None;
    if !cfg.dry_run && !participants.is_empty() {
        ctx.store.record(QueueEvent::RunStarted {
            run_id: ctx.run_id.clone(),
            mode: cfg.mode,
            tasks: participants.len(),
            docqueue_version: env!("CARGO_PKG_VERSION").to_string(),
        });
        let order = graph
            .execution_order()
            .map_err(|e| EngineError::Runtime(e.to_string()))?;
        match cfg.mode {
            ExecutionMode::Sequential => {
                run_sequential(&mut ctx, &order, &wave_of, &cfg.actions, false).await?;
            }
            ExecutionMode::Transactional => {
                halted_at = run_sequential(&mut ctx, &order, &wave_of, &cfg.actions, true).await?;
            }
            ExecutionMode::Parallel => {
                run_parallel(&mut ctx, &participants, &cfg.actions, cfg.max_workers).await?;
            }
        }
    }

    let tasks: Vec<TaskReport> = ctx.reports.into_values().collect();
    let count = |s: TaskStatus| {
        u32::try_from(tasks.iter().filter(|t| t.status == s).count()).unwrap_or(u32::MAX)
    };
    let summary = RunSummary {
        completed: count(TaskStatus::Completed),
        failed: count(TaskStatus::Failed),
        skipped: count(TaskStatus::Pending),
    };
    let total_ms = millis(start.elapsed());

    if !cfg.dry_run && !tasks.is_empty() {
        ctx.store.record(QueueEvent::RunCompleted {
            run_id: ctx.run_id.clone(),
            completed: summary.completed,
            failed: summary.failed,
            skipped: summary.skipped,
            total_ms,
        });
    }
    tracing::info!(
        run_id = %ctx.run_id,
        completed = summary.completed,
        failed = summary.failed,
        skipped = summary.skipped,
        total_ms,
        "run finished"
    );

    Ok(RunReport {
        run_id: ctx.run_id,
        mode: cfg.mode,
        dry_run: cfg.dry_run,
        success: summary.failed == 0,
        halted_at,
        summary,
        tasks,
    })
}

/// Dispatch in topological order, one at a time. Returns the halting task
/// when `halt_on_failure` stopped the run.
async fn run_sequential(
    ctx: &mut RunCtx<'_>,
    order: &[u32],
    wave_of: &FxHashMap<u32, usize>,
    actions: &Arc<dyn ActionExecutor>,
    halt_on_failure: bool,
) -> Result<Option<u32>, EngineError> {
    for &index in order {
        if !ctx.is_pending(index) {
            continue;
        }
        let Some(task) = ctx.queue.get(index).cloned() else {
            continue;
        };

        let params = match readiness(&task, &ctx.queue) {
            Readiness::Ready => resolve_params(&task, &ctx.queue),
            Readiness::Poisoned(e) => Err(e),
            Readiness::Waiting => {
                tracing::warn!(
                    index,
                    "dependency still pending in ordered run; leaving task pending"
                );
                continue;
            }
        };

        let completed = match params {
            Err(e) => {
                ctx.poison(e)?;
                false
            }
            Ok(params) => {
                let wave = wave_of.get(&index).copied().unwrap_or(1);
                ctx.mark_running(index, params.clone(), wave)?;
                let done = dispatch(Arc::clone(actions), index, task.action, params).await;
                ctx.finish(done)?
            }
        };

        if !completed && halt_on_failure {
            tracing::warn!(index, "transactional run halted");
            return Ok(Some(index));
        }
    }
    Ok(None)
}

/// Dispatch waves of ready tasks on a bounded pool. The wave barrier is the
/// only synchronization point.
async fn run_parallel(
    ctx: &mut RunCtx<'_>,
    participants: &[u32],
    actions: &Arc<dyn ActionExecutor>,
    max_workers: usize,
) -> Result<(), EngineError> {
    let sem = Arc::new(Semaphore::new(max_workers.max(1)));
    let mut wave = 0usize;

    loop {
        let mut ready: Vec<(u32, Action, Params)> = Vec::new();
        let mut poisoned_any = false;

        for &index in participants {
            if !ctx.is_pending(index) {
                continue;
            }
            let Some(task) = ctx.queue.get(index).cloned() else {
                continue;
            };
            let params = match readiness(&task, &ctx.queue) {
                Readiness::Waiting => continue,
                Readiness::Ready => resolve_params(&task, &ctx.queue),
                Readiness::Poisoned(e) => Err(e),
            };
            match params {
                Ok(params) => ready.push((index, task.action, params)),
                Err(e) => {
                    ctx.poison(e)?;
                    poisoned_any = true;
                }
            }
        }

        if ready.is_empty() {
            if poisoned_any {
                continue;
            }
            break;
        }

        wave += 1;
        tracing::info!(wave, tasks = ready.len(), "wave started");
        for (index, _, params) in &ready {
            ctx.mark_running(*index, params.clone(), wave)?;
        }

        let mut futs = FuturesUnordered::new();
        for (index, action, params) in ready {
            let sem = Arc::clone(&sem);
            let actions = Arc::clone(actions);
            futs.push(async move {
                let _permit = sem
                    .acquire_owned()
                    .await
                    .map_err(|_| EngineError::Runtime("semaphore closed unexpectedly".into()))?;
                Ok::<_, EngineError>(dispatch(actions, index, action, params).await)
            });
        }

        while let Some(done) = futs.next().await {
            ctx.finish(done?)?;
        }
    }
    Ok(())
}
