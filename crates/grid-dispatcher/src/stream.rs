//! Result streams: one [`TaskResult`] per externally visible change of a task, closing after the
//! terminal snapshot.

use futures_util::stream::{self, Stream};
use grid_core::scheduler::PriorityTaskScheduler;
use grid_core::{TaskId, TaskResult};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};

enum Phase {
    Start(TaskResult, broadcast::Receiver<TaskResult>),
    Follow {
        last: TaskResult,
        rx: broadcast::Receiver<TaskResult>,
    },
    Done,
}

pub(crate) fn task_results(
    scheduler: Arc<PriorityTaskScheduler>,
    initial: TaskResult,
    rx: broadcast::Receiver<TaskResult>,
) -> impl Stream<Item = TaskResult> + Send + 'static {
    let id = initial.task_id.clone();
    stream::unfold(Phase::Start(initial, rx), move |phase| {
        let scheduler = scheduler.clone();
        let id = id.clone();
        async move {
            match phase {
                Phase::Start(snapshot, rx) => Some(emit(snapshot, rx)),
                Phase::Follow { last, rx } => next_change(&scheduler, &id, last, rx).await,
                Phase::Done => None,
            }
        }
    })
}

fn emit(snapshot: TaskResult, rx: broadcast::Receiver<TaskResult>) -> (TaskResult, Phase) {
    let next = if snapshot.status.is_terminal() {
        Phase::Done
    } else {
        Phase::Follow {
            last: snapshot.clone(),
            rx,
        }
    };
    (snapshot, next)
}

async fn next_change(
    scheduler: &PriorityTaskScheduler,
    id: &TaskId,
    last: TaskResult,
    mut rx: broadcast::Receiver<TaskResult>,
) -> Option<(TaskResult, Phase)> {
    loop {
        let candidate = match rx.recv().await {
            Ok(update) if update.task_id == *id => update,
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(
                    event = "grid.stream.lagged",
                    task_id = %id,
                    skipped,
                    "result stream lagged; resynchronizing from snapshot"
                );
                // Pruned mid-stream: nothing further will ever be published.
                scheduler.query(id).ok()?
            }
            Err(RecvError::Closed) => return None,
        };
        if candidate != last {
            return Some(emit(candidate, rx));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use futures_util::StreamExt;
    use grid_core::breaker::CircuitBreaker;
    use grid_core::scheduler::SchedulerConfig;
    use grid_core::task::NewTask;
    use grid_core::{Priority, Role, TaskState};
    use serde_json::json;
    use std::time::Duration;

    fn scheduler() -> Arc<PriorityTaskScheduler> {
        Arc::new(PriorityTaskScheduler::new(
            SchedulerConfig::default(),
            Arc::new(CircuitBreaker::new(5, Duration::from_secs(30))),
        ))
    }

    fn submit(s: &PriorityTaskScheduler, id: &str) -> TaskId {
        s.enqueue(
            NewTask {
                id: TaskId::new(id),
                payload: json!({}),
                priority: Priority::Normal,
                backend: "echo".into(),
                owner_role: Role::Admin,
                owner_subject: "root".into(),
            },
            Utc::now(),
        )
        .unwrap()
        .task_id
    }

    #[tokio::test]
    async fn stream_ends_after_terminal_state() {
        let s = scheduler();
        let id = submit(&s, "t1");
        submit(&s, "other");
        let (initial, rx) = s.watch(&id).unwrap();
        let results = task_results(s.clone(), initial, rx);

        let now = Utc::now();
        s.claim_next(now).unwrap();
        s.claim_next(now).unwrap();
        s.mark_completed(&TaskId::new("other"), json!(0), now).unwrap();
        s.mark_completed(&id, json!({ "answer": 42 }), now).unwrap();

        let seen: Vec<TaskState> = results.map(|r| r.status).collect().await;
        assert_eq!(
            seen,
            [TaskState::Queued, TaskState::Running, TaskState::Completed]
        );
    }

    #[tokio::test]
    async fn terminal_task_streams_one_snapshot() {
        let s = scheduler();
        let id = submit(&s, "t1");
        s.cancel(&id, Utc::now()).unwrap();

        let (initial, rx) = s.watch(&id).unwrap();
        let seen: Vec<TaskResult> = task_results(s.clone(), initial, rx).collect().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].status, TaskState::Cancelled);
    }
}
