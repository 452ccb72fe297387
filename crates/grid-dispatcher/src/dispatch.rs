//! Background loops: dispatch, aging and retention.
//!
//! Each loop runs until the shutdown watch flips. Executions run on their own tokio tasks, outside
//! the scheduler lock, bounded by a semaphore of worker slots.

use crate::AppState;
use chrono::Utc;
use futures_util::FutureExt;
use grid_core::executor::ExecutionFailure;
use grid_core::scheduler::{FailureOutcome, PriorityTaskScheduler, SchedulerError};
use grid_core::task::{FailureInfo, Task};
use grid_core::{TaskId, TaskState};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast::error::RecvError, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub aging_interval: Duration,
    pub reaper_interval: Duration,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_millis(200),
            aging_interval: Duration::from_secs(5),
            reaper_interval: Duration::from_secs(30),
        }
    }
}

pub(crate) async fn dispatch_loop(
    state: AppState,
    opts: DispatchOptions,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let slots = Arc::new(Semaphore::new(opts.concurrency.max(1)));
    let mut running = JoinSet::new();

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        while let Ok(permit) = slots.clone().try_acquire_owned() {
            let Some(task) = state.scheduler.claim_next(Utc::now()) else {
                break;
            };
            tracing::debug!(
                event = "grid.dispatch.claimed",
                task_id = %task.id,
                backend = %task.backend,
                attempt = task.attempt,
                "task dispatched"
            );
            running.spawn(execute(state.clone(), task, permit));
        }

        tokio::select! {
            _ = state.wakeup.notified() => {}
            _ = tokio::time::sleep(opts.poll_interval) => {}
            Some(joined) = running.join_next(), if !running.is_empty() => {
                if let Err(err) = joined {
                    tracing::error!(
                        event = "grid.dispatch.execution_aborted",
                        error = %err,
                        "execution task ended abnormally"
                    );
                }
            }
            _ = shutdown_rx.changed() => {}
        }
    }

    running.shutdown().await;
    Ok(())
}

async fn execute(state: AppState, task: Task, _permit: OwnedSemaphorePermit) {
    let scheduler = state.scheduler.as_ref();
    let Some(executor) = state.executors.resolve(&task.backend) else {
        // Backends are checked at submit; only a registry rebuilt under a live queue gets here.
        report_failure(
            scheduler,
            &task.id,
            FailureInfo {
                retryable: false,
                message: format!("backend unavailable: {}", task.backend),
            },
        );
        state.wakeup.notify_one();
        return;
    };

    // A panicking backend still reports an outcome, so the task cannot stay RUNNING.
    let run = AssertUnwindSafe(executor.execute(&task.payload))
        .catch_unwind()
        .map(|res| res.unwrap_or_else(|payload| Err(panicked(&task, payload.as_ref()))));
    let outcome = tokio::select! {
        res = run => Some(res),
        _ = cancelled(scheduler, &task.id) => None,
    };

    match outcome {
        None => {
            scheduler.abandon(&task.id);
            tracing::info!(
                event = "grid.dispatch.execution_dropped",
                task_id = %task.id,
                "task cancelled while running; execution dropped"
            );
        }
        Some(Ok(output)) => match scheduler.mark_completed(&task.id, output, Utc::now()) {
            Ok(_) => {}
            Err(err @ SchedulerError::InvalidTransition { .. }) => {
                tracing::debug!(
                    event = "grid.dispatch.late_result_discarded",
                    task_id = %task.id,
                    error = %err,
                    "late result discarded"
                );
            }
            Err(err) => {
                tracing::warn!(
                    event = "grid.dispatch.report_failed",
                    task_id = %task.id,
                    error = %err,
                    "could not record completion"
                );
            }
        },
        Some(Err(failure)) => {
            tracing::debug!(
                event = "grid.dispatch.execution_failed",
                task_id = %task.id,
                retryable = failure.retryable,
                error = %failure,
                "execution failed"
            );
            report_failure(scheduler, &task.id, failure.into());
        }
    }

    state.wakeup.notify_one();
}

fn panicked(task: &Task, payload: &(dyn Any + Send)) -> ExecutionFailure {
    let detail = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload");
    tracing::error!(
        event = "grid.dispatch.execution_panicked",
        task_id = %task.id,
        backend = %task.backend,
        panic = detail,
        "backend panicked"
    );
    ExecutionFailure::fatal(format!("backend {} panicked: {detail}", task.backend))
}

fn report_failure(scheduler: &PriorityTaskScheduler, id: &TaskId, failure: FailureInfo) {
    match scheduler.mark_failed(id, failure, Utc::now()) {
        Ok(FailureOutcome::Requeued { .. } | FailureOutcome::Failed(_)) => {}
        Err(err @ SchedulerError::InvalidTransition { .. }) => {
            tracing::debug!(
                event = "grid.dispatch.late_result_discarded",
                task_id = %id,
                error = %err,
                "late failure discarded"
            );
        }
        Err(err) => {
            tracing::warn!(
                event = "grid.dispatch.report_failed",
                task_id = %id,
                error = %err,
                "could not record failure"
            );
        }
    }
}

/// Resolves once `id` is cancelled.
async fn cancelled(scheduler: &PriorityTaskScheduler, id: &TaskId) {
    let Ok((snapshot, mut rx)) = scheduler.watch(id) else {
        return;
    };
    if snapshot.status == TaskState::Cancelled {
        return;
    }
    loop {
        match rx.recv().await {
            Ok(update) if update.task_id == *id && update.status == TaskState::Cancelled => {
                return
            }
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => {
                let gone = scheduler
                    .query(id)
                    .map_or(true, |r| r.status == TaskState::Cancelled);
                if gone {
                    return;
                }
            }
            Err(RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

pub(crate) async fn aging_loop(
    state: AppState,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown_rx.changed() => {}
        }
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        if state.scheduler.age(Utc::now()) > 0 {
            state.wakeup.notify_one();
        }
    }
}

pub(crate) async fn retention_loop(
    state: AppState,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown_rx.changed() => {}
        }
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        let pruned = state.scheduler.prune_terminal(Utc::now());
        if pruned > 0 {
            tracing::debug!(
                event = "grid.dispatch.pruned",
                pruned,
                "dropped expired terminal tasks"
            );
        }
    }
}
