//! Priority task scheduler with anti-starvation aging, bounded retries and circuit-breaker gated
//! dispatch.
//!
//! All task state lives behind one mutex. Selection, aging and transitions are linearized by it;
//! execution itself never runs under the lock. Every operation takes `now` explicitly so callers
//! (and tests) control time.

use crate::breaker::{Admission, CircuitBreaker, CircuitSnapshot};
use crate::role::Role;
use crate::task::{FailureInfo, NewTask, Task, TaskId, TaskResult, TaskState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 1024;
// 2^20 x base is already far beyond any sane backoff.
const MAX_BACKOFF_SHIFT: u32 = 20;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub starvation_threshold: Duration,
    pub retention: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            starvation_threshold: Duration::from_secs(30),
            retention: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("task id already exists: {0}")]
    DuplicateId(TaskId),

    #[error("role {0} may not submit tasks")]
    SubmitNotPermitted(Role),

    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("circuit open; dispatch of {0} deferred")]
    CircuitOpen(TaskId),

    #[error("cannot {action} task {task_id} in state {from}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskState,
        action: &'static str,
    },
}

/// What happened to a task after a reported execution failure.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    Requeued {
        attempt: u32,
        eligible_after: DateTime<Utc>,
    },
    Failed(TaskResult),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cancelled {
    pub previous: TaskState,
    pub result: TaskResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub queued: usize,
    pub running: usize,
    pub tracked: usize,
    pub circuit: CircuitSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    effective_rank: i64,
    enqueued_at: DateTime<Utc>,
    seq: u64,
}

#[derive(Debug)]
struct Entry {
    task: Task,
    seq: u64,
    // Set between mark_running and the execution outcome being reported, even if the task was
    // cancelled meanwhile; the breaker still needs that outcome.
    in_flight: Option<Admission>,
}

impl Entry {
    fn key(&self) -> QueueKey {
        QueueKey {
            effective_rank: self.task.effective_rank(),
            enqueued_at: self.task.enqueued_at,
            seq: self.seq,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    tasks: HashMap<TaskId, Entry>,
    queue: BTreeMap<QueueKey, TaskId>,
    next_seq: u64,
}

impl Inner {
    fn candidate(&self, now: DateTime<Utc>) -> Option<&TaskId> {
        self.queue.values().find(|id| {
            self.tasks
                .get(*id)
                .is_some_and(|e| e.task.eligible_after <= now)
        })
    }

    fn entry_mut(&mut self, id: &TaskId) -> Result<&mut Entry, SchedulerError> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| SchedulerError::NotFound(id.clone()))
    }

    fn dequeue(&mut self, id: &TaskId) {
        if let Some(entry) = self.tasks.get(id) {
            self.queue.remove(&entry.key());
        }
    }

    fn requeue(&mut self, id: &TaskId) {
        if let Some(entry) = self.tasks.get(id) {
            self.queue.insert(entry.key(), id.clone());
        }
    }
}

#[derive(Debug)]
pub struct PriorityTaskScheduler {
    cfg: SchedulerConfig,
    breaker: Arc<CircuitBreaker>,
    inner: Mutex<Inner>,
    events: broadcast::Sender<TaskResult>,
}

impl PriorityTaskScheduler {
    pub fn new(cfg: SchedulerConfig, breaker: Arc<CircuitBreaker>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            cfg,
            breaker,
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.cfg
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn enqueue(&self, new: NewTask, now: DateTime<Utc>) -> Result<TaskResult, SchedulerError> {
        // Authorization happens at the call boundary; this only re-checks the invariant.
        if !new.owner_role.can_submit() {
            return Err(SchedulerError::SubmitNotPermitted(new.owner_role));
        }

        let mut inner = self.lock();
        if inner.tasks.contains_key(&new.id) {
            return Err(SchedulerError::DuplicateId(new.id));
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let entry = Entry {
            task: Task::accept(new, now),
            seq,
            in_flight: None,
        };
        let id = entry.task.id.clone();
        let snapshot = entry.task.to_result();
        inner.queue.insert(entry.key(), id.clone());
        inner.tasks.insert(id.clone(), entry);
        self.publish(snapshot.clone());
        drop(inner);

        tracing::debug!(
            event = "grid.scheduler.enqueued",
            task_id = %id,
            priority = ?snapshot.priority,
            "task enqueued"
        );
        Ok(snapshot)
    }

    pub fn query(&self, id: &TaskId) -> Result<TaskResult, SchedulerError> {
        self.lock()
            .tasks
            .get(id)
            .map(|e| e.task.to_result())
            .ok_or_else(|| SchedulerError::NotFound(id.clone()))
    }

    /// Full task record, for the dispatch path and diagnostics.
    pub fn task(&self, id: &TaskId) -> Option<Task> {
        self.lock().tasks.get(id).map(|e| e.task.clone())
    }

    /// Current snapshot plus a subscription to later changes, taken atomically so no transition
    /// can fall between the two.
    pub fn watch(
        &self,
        id: &TaskId,
    ) -> Result<(TaskResult, broadcast::Receiver<TaskResult>), SchedulerError> {
        let inner = self.lock();
        let snapshot = inner
            .tasks
            .get(id)
            .map(|e| e.task.to_result())
            .ok_or_else(|| SchedulerError::NotFound(id.clone()))?;
        Ok((snapshot, self.events.subscribe()))
    }

    pub fn cancel(&self, id: &TaskId, now: DateTime<Utc>) -> Result<Cancelled, SchedulerError> {
        let mut inner = self.lock();
        let previous = inner.entry_mut(id)?.task.state;
        if !matches!(previous, TaskState::Queued | TaskState::Running) {
            return Err(SchedulerError::InvalidTransition {
                task_id: id.clone(),
                from: previous,
                action: "cancel",
            });
        }

        inner.dequeue(id);
        let entry = inner.entry_mut(id)?;
        entry.task.state = TaskState::Cancelled;
        entry.task.finished_at = Some(now);
        let result = entry.task.to_result();
        self.publish(result.clone());
        drop(inner);

        tracing::info!(
            event = "grid.scheduler.cancelled",
            task_id = %id,
            previous = %previous,
            "task cancelled"
        );
        Ok(Cancelled { previous, result })
    }

    /// Pure selection: the task that would dispatch next at `now`, honoring backoff gates and the
    /// breaker. Mutates nothing, including the breaker's half-open trial slot.
    pub fn next_dispatch_candidate(&self, now: DateTime<Utc>) -> Option<Task> {
        if !self.breaker.would_admit(now) {
            return None;
        }
        let inner = self.lock();
        let id = inner.candidate(now)?;
        inner.tasks.get(id).map(|e| e.task.clone())
    }

    /// Select, admit through the breaker and mark running in one step.
    ///
    /// Returns `None` when nothing is eligible or the breaker defers dispatch. A deferral leaves
    /// the task queued and does not touch its retry budget.
    pub fn claim_next(&self, now: DateTime<Utc>) -> Option<Task> {
        let mut inner = self.lock();
        let id = inner.candidate(now)?.clone();
        let Some(admission) = self.breaker.try_admit(now) else {
            tracing::trace!(
                event = "grid.scheduler.dispatch_deferred",
                task_id = %id,
                "circuit open; dispatch deferred"
            );
            return None;
        };
        let task = match Self::start(&mut inner, &id, admission, now) {
            Ok(task) => task,
            Err(_) => {
                self.breaker.release(admission);
                return None;
            }
        };
        self.publish(task.to_result());
        drop(inner);
        Some(task)
    }

    /// Start a specific queued task, admitting it through the breaker. Fails with
    /// [`SchedulerError::CircuitOpen`] when the breaker defers dispatch.
    pub fn mark_running(&self, id: &TaskId, now: DateTime<Utc>) -> Result<Task, SchedulerError> {
        let mut inner = self.lock();
        let state = inner.entry_mut(id)?.task.state;
        if state != TaskState::Queued {
            return Err(SchedulerError::InvalidTransition {
                task_id: id.clone(),
                from: state,
                action: "start",
            });
        }
        let admission = self
            .breaker
            .try_admit(now)
            .ok_or_else(|| SchedulerError::CircuitOpen(id.clone()))?;
        let task = Self::start(&mut inner, id, admission, now)?;
        self.publish(task.to_result());
        Ok(task)
    }

    pub fn mark_completed(
        &self,
        id: &TaskId,
        output: Value,
        now: DateTime<Utc>,
    ) -> Result<TaskResult, SchedulerError> {
        let mut inner = self.lock();
        let entry = inner.entry_mut(id)?;
        if let Some(admission) = entry.in_flight.take() {
            self.breaker.record_success(admission);
        }
        if entry.task.state != TaskState::Running {
            return Err(SchedulerError::InvalidTransition {
                task_id: id.clone(),
                from: entry.task.state,
                action: "complete",
            });
        }

        entry.task.state = TaskState::Completed;
        entry.task.result = Some(output);
        entry.task.finished_at = Some(now);
        let result = entry.task.to_result();
        self.publish(result.clone());
        drop(inner);

        tracing::info!(
            event = "grid.scheduler.completed",
            task_id = %id,
            attempt = result.attempt,
            "task completed"
        );
        Ok(result)
    }

    /// Report a failed execution. Retryable failures requeue with exponential backoff until the
    /// retry budget is spent and count toward the breaker; non-retryable failures fail the task
    /// immediately and leave the breaker as it was.
    pub fn mark_failed(
        &self,
        id: &TaskId,
        failure: FailureInfo,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, SchedulerError> {
        let mut inner = self.lock();
        let entry = inner.entry_mut(id)?;
        // Only retryable failures speak for downstream health; a task that fails on its own
        // payload must not open the breaker for everyone else.
        if let Some(admission) = entry.in_flight.take() {
            if failure.retryable {
                self.breaker.record_failure(admission, now);
            } else {
                self.breaker.release(admission);
            }
        }
        if entry.task.state != TaskState::Running {
            return Err(SchedulerError::InvalidTransition {
                task_id: id.clone(),
                from: entry.task.state,
                action: "fail",
            });
        }

        let exhausted = entry.task.attempt >= self.cfg.max_retries;
        let retryable = failure.retryable;
        entry.task.last_error = Some(failure);

        if exhausted || !retryable {
            entry.task.state = TaskState::Failed;
            entry.task.finished_at = Some(now);
            let result = entry.task.to_result();
            self.publish(result.clone());
            drop(inner);

            tracing::warn!(
                event = "grid.scheduler.failed",
                task_id = %id,
                attempt = result.attempt,
                retryable,
                "task failed"
            );
            return Ok(FailureOutcome::Failed(result));
        }

        entry.task.attempt += 1;
        let attempt = entry.task.attempt;
        let eligible_after = now
            .checked_add_signed(to_chrono(self.backoff(attempt)))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        entry.task.state = TaskState::Queued;
        entry.task.eligible_after = eligible_after;
        let result = entry.task.to_result();
        inner.requeue(id);
        self.publish(result);
        drop(inner);

        tracing::info!(
            event = "grid.scheduler.retry_scheduled",
            task_id = %id,
            attempt,
            eligible_after = %eligible_after,
            "task requeued with backoff"
        );
        Ok(FailureOutcome::Requeued {
            attempt,
            eligible_after,
        })
    }

    /// The running execution of `id` was dropped without an outcome (it was cancelled). Clears
    /// the in-flight marker; a half-open trial slot held by it is given back.
    pub fn abandon(&self, id: &TaskId) {
        let mut inner = self.lock();
        if let Some(entry) = inner.tasks.get_mut(id) {
            if let Some(admission) = entry.in_flight.take() {
                self.breaker.release(admission);
            }
        }
    }

    /// One aging tick: every queued task waiting longer than the starvation threshold gains one
    /// unit of boost. Returns the number of boosted tasks.
    pub fn age(&self, now: DateTime<Utc>) -> usize {
        let threshold = to_chrono(self.cfg.starvation_threshold);
        let mut inner = self.lock();

        let starving: Vec<(QueueKey, TaskId)> = inner
            .queue
            .iter()
            .filter(|(key, _)| now - key.enqueued_at > threshold)
            .map(|(key, id)| (*key, id.clone()))
            .collect();

        for (key, id) in &starving {
            inner.queue.remove(key);
            if let Some(entry) = inner.tasks.get_mut(id) {
                entry.task.aging_boost = entry.task.aging_boost.saturating_add(1);
                let rekeyed = entry.key();
                inner.queue.insert(rekeyed, id.clone());
            }
        }

        if !starving.is_empty() {
            tracing::debug!(
                event = "grid.scheduler.aged",
                boosted = starving.len(),
                "aging tick boosted starving tasks"
            );
        }
        starving.len()
    }

    /// Drop terminal tasks that finished more than the retention window ago.
    pub fn prune_terminal(&self, now: DateTime<Utc>) -> usize {
        let retention = to_chrono(self.cfg.retention);
        let mut inner = self.lock();
        let before = inner.tasks.len();
        inner.tasks.retain(|_, e| {
            !(e.task.state.is_terminal()
                && e.in_flight.is_none()
                && e.task
                    .finished_at
                    .and_then(|t| t.checked_add_signed(retention))
                    .is_some_and(|expires| expires <= now))
        });
        before - inner.tasks.len()
    }

    pub fn status(&self) -> SchedulerStatus {
        let inner = self.lock();
        let running = inner
            .tasks
            .values()
            .filter(|e| e.task.state == TaskState::Running)
            .count();
        SchedulerStatus {
            queued: inner.queue.len(),
            running,
            tracked: inner.tasks.len(),
            circuit: self.breaker.snapshot(),
        }
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(MAX_BACKOFF_SHIFT);
        self.cfg
            .retry_base_delay
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
    }

    fn start(
        inner: &mut Inner,
        id: &TaskId,
        admission: Admission,
        now: DateTime<Utc>,
    ) -> Result<Task, SchedulerError> {
        let state = inner.entry_mut(id)?.task.state;
        if state != TaskState::Queued {
            return Err(SchedulerError::InvalidTransition {
                task_id: id.clone(),
                from: state,
                action: "start",
            });
        }
        inner.dequeue(id);
        let entry = inner.entry_mut(id)?;
        entry.task.state = TaskState::Running;
        entry.task.last_attempt_at = Some(now);
        entry.in_flight = Some(admission);
        Ok(entry.task.clone())
    }

    // Called with the lock held so subscribers observe transitions in the order they happened.
    fn publish(&self, result: TaskResult) {
        // No subscribers is the common case.
        let _ = self.events.send(result);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
