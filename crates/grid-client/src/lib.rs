//! Client for the grid submission protocol.
//!
//! [`GridClient`] wraps the dispatcher's HTTP surface. [`GridClient::run`] adds the degradation
//! policy used by interactive callers: every remote read carries its own deadline, and when a
//! deadline expires or the grid is unreachable the work is run on a local executor instead.
//! Deadline expiry is a client-side decision; the remote task is left to finish on its own.

use futures_util::stream::{self, Stream, StreamExt};
use grid_core::breaker::CircuitState;
use grid_core::executor::{ExecutionFailure, TaskExecutor};
use grid_core::{Role, TaskResult, TaskState};
use reqwest::{Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::time::Duration;

pub use grid_dispatcher::{GridStatusResponse, SubmitTaskRequest, SubmitTaskResponse};

pub mod sse;

use sse::SseDecoder;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("grid unavailable: {0}")]
    Unavailable(String),
    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
    #[error("rejected ({status}): {message}")]
    Rejected {
        status: StatusCode,
        message: String,
        required_roles: Vec<Role>,
    },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("local execution failed: {0}")]
    Local(#[from] ExecutionFailure),
}

impl ClientError {
    /// Whether [`GridClient::run`] may fall back to local execution.
    pub fn allows_fallback(&self) -> bool {
        matches!(
            self,
            ClientError::Unavailable(_) | ClientError::DeadlineExceeded(_)
        )
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    required_roles: Vec<Role>,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Deadline for the pre-flight status probe; `None` skips the probe.
    pub probe_deadline: Option<Duration>,
    pub submit_deadline: Duration,
    /// Deadline for reading the terminal result off the stream.
    pub result_deadline: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            probe_deadline: Some(Duration::from_secs(2)),
            submit_deadline: Duration::from_secs(5),
            result_deadline: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FallbackReason {
    Unavailable(String),
    DeadlineExceeded(Duration),
    /// The grid finished the task without completing it.
    NotCompleted(TaskResult),
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::Unavailable(why) => write!(f, "grid unavailable: {why}"),
            FallbackReason::DeadlineExceeded(d) => write!(f, "deadline of {d:?} exceeded"),
            FallbackReason::NotCompleted(r) => write!(f, "task {} ended {}", r.task_id, r.status),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Remote(TaskResult),
    Local {
        output: Value,
        reason: FallbackReason,
    },
}

impl RunOutcome {
    pub fn output(&self) -> Option<&Value> {
        match self {
            RunOutcome::Remote(result) => result.result.as_ref(),
            RunOutcome::Local { output, .. } => Some(output),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, RunOutcome::Local { .. })
    }
}

#[derive(Clone, Debug)]
pub struct GridClient {
    base_url: Url,
    token: Option<String>,
    http: reqwest::Client,
}

impl GridClient {
    pub fn new(base_url: &str, token: Option<String>) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|err| anyhow::anyhow!("parse grid base URL {base_url:?}: {err}"))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("grid base URL {base_url} cannot carry paths");
        }
        Ok(Self {
            base_url,
            token,
            http: reqwest::Client::new(),
        })
    }

    pub async fn submit(&self, req: &SubmitTaskRequest) -> Result<SubmitTaskResponse, ClientError> {
        let url = self.url(&["v1", "tasks"])?;
        let resp = self.send(self.http.post(url).json(req)).await?;
        decode(resp).await
    }

    pub async fn task(&self, task_id: &str) -> Result<TaskResult, ClientError> {
        let url = self.url(&["v1", "tasks", task_id])?;
        let resp = self.send(self.http.get(url)).await?;
        decode(resp).await
    }

    pub async fn cancel(&self, task_id: &str) -> Result<TaskResult, ClientError> {
        let url = self.url(&["v1", "tasks", task_id, "cancel"])?;
        let resp = self.send(self.http.post(url)).await?;
        decode(resp).await
    }

    pub async fn grid_status(&self) -> Result<GridStatusResponse, ClientError> {
        let url = self.url(&["v1", "status"])?;
        let resp = self.send(self.http.get(url)).await?;
        decode(resp).await
    }

    /// Follow a task's results until its terminal snapshot.
    pub async fn watch(
        &self,
        task_id: &str,
    ) -> Result<impl Stream<Item = Result<TaskResult, ClientError>> + Send, ClientError> {
        let url = self.url(&["v1", "tasks", task_id, "stream"])?;
        let resp = self
            .send(self.http.get(url).header(reqwest::header::ACCEPT, "text/event-stream"))
            .await?;
        Ok(task_results(Box::pin(resp.bytes_stream())))
    }

    /// True when the grid answers a status probe within `deadline` with capacity to dispatch.
    pub async fn available(&self, deadline: Duration) -> bool {
        match with_deadline(deadline, self.grid_status()).await {
            Ok(status) => status.worker_slots > 0 && status.circuit.state != CircuitState::Open,
            Err(err) => {
                tracing::debug!(
                    event = "grid.client.probe_failed",
                    error = %err,
                    "grid status probe failed"
                );
                false
            }
        }
    }

    /// Submit `req` and wait for its result, or run it on `local` when the grid cannot deliver.
    ///
    /// Rejections (bad request, authentication, permissions) are returned as errors; they would
    /// fail the same way on retry and are not masked by local execution.
    pub async fn run(
        &self,
        req: SubmitTaskRequest,
        opts: &RunOptions,
        local: &dyn TaskExecutor,
    ) -> Result<RunOutcome, ClientError> {
        let payload = req.payload.clone();
        let reason = match self.run_remote(&req, opts).await {
            Ok(result) if result.status == TaskState::Completed => {
                return Ok(RunOutcome::Remote(result))
            }
            Ok(result) => FallbackReason::NotCompleted(result),
            Err(ClientError::Unavailable(why)) => FallbackReason::Unavailable(why),
            Err(ClientError::DeadlineExceeded(d)) => FallbackReason::DeadlineExceeded(d),
            Err(err) => return Err(err),
        };

        tracing::warn!(
            event = "grid.client.fallback",
            reason = %reason,
            "running task locally"
        );
        let output = local.execute(&payload).await?;
        Ok(RunOutcome::Local { output, reason })
    }

    async fn run_remote(
        &self,
        req: &SubmitTaskRequest,
        opts: &RunOptions,
    ) -> Result<TaskResult, ClientError> {
        if let Some(deadline) = opts.probe_deadline {
            if !self.available(deadline).await {
                return Err(ClientError::Unavailable(
                    "no dispatch capacity reported".to_string(),
                ));
            }
        }

        let accepted = with_deadline(opts.submit_deadline, self.submit(req)).await?;
        tracing::debug!(
            event = "grid.client.submitted",
            task_id = %accepted.task_id,
            "task submitted"
        );

        with_deadline(
            opts.result_deadline,
            self.terminal_result(accepted.task_id.as_str()),
        )
        .await
    }

    async fn terminal_result(&self, task_id: &str) -> Result<TaskResult, ClientError> {
        let results = self.watch(task_id).await?;
        futures_util::pin_mut!(results);
        while let Some(result) = results.next().await {
            let result = result?;
            if result.status.is_terminal() {
                return Ok(result);
            }
        }
        Err(ClientError::Unavailable(
            "result stream closed before a terminal state".to_string(),
        ))
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<Response, ClientError> {
        let req = match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        };
        let resp = req
            .send()
            .await
            .map_err(|err| ClientError::Unavailable(err.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        if status.is_server_error() {
            return Err(ClientError::Unavailable(format!("status {status}: {text}")));
        }
        let (message, required_roles) = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => (body.error, body.required_roles),
            Err(_) => (text, Vec::new()),
        };
        Err(ClientError::Rejected {
            status,
            message,
            required_roles,
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::Protocol("grid base URL cannot carry paths".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, ClientError> {
    resp.json::<T>()
        .await
        .map_err(|err| ClientError::Protocol(err.to_string()))
}

async fn with_deadline<T>(
    deadline: Duration,
    fut: impl Future<Output = Result<T, ClientError>>,
) -> Result<T, ClientError> {
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| ClientError::DeadlineExceeded(deadline))?
}

/// Decode `task` events from an SSE body, ending after the first terminal snapshot.
pub fn task_results<S, B, E>(body: S) -> impl Stream<Item = Result<TaskResult, ClientError>>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: fmt::Display,
{
    struct Follow<S> {
        body: S,
        decoder: SseDecoder,
        pending: VecDeque<TaskResult>,
        done: bool,
    }

    let init = Follow {
        body,
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        done: false,
    };

    stream::unfold(init, |mut st| async move {
        loop {
            if let Some(result) = st.pending.pop_front() {
                if result.status.is_terminal() {
                    st.done = true;
                    st.pending.clear();
                }
                return Some((Ok(result), st));
            }
            if st.done {
                return None;
            }

            match st.body.next().await {
                Some(Ok(chunk)) => {
                    for event in st.decoder.push(chunk.as_ref()) {
                        if event.event != "task" {
                            continue;
                        }
                        match serde_json::from_str::<TaskResult>(&event.data) {
                            Ok(result) => st.pending.push_back(result),
                            Err(err) => {
                                st.done = true;
                                return Some((Err(ClientError::Protocol(err.to_string())), st));
                            }
                        }
                    }
                }
                Some(Err(err)) => {
                    st.done = true;
                    return Some((Err(ClientError::Unavailable(err.to_string())), st));
                }
                None => return None,
            }
        }
    })
}
