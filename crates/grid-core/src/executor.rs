//! Execution backends.
//!
//! The grid never interprets task payloads or results; a backend runs the payload and reports
//! either an opaque JSON result or a failure classified only as retryable or not. Backends are
//! registered by capability name in an [`ExecutorRegistry`] at process start and resolved by
//! name per task.

use crate::task::FailureInfo;
use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

pub const ECHO_BACKEND: &str = "echo";
pub const HTTP_BACKEND: &str = "http";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ExecutionFailure {
    pub retryable: bool,
    pub message: String,
}

impl ExecutionFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }
}

impl From<ExecutionFailure> for FailureInfo {
    fn from(value: ExecutionFailure) -> Self {
        FailureInfo {
            retryable: value.retryable,
            message: value.message,
        }
    }
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, payload: &Value) -> Result<Value, ExecutionFailure>;
}

/// Settings shared by backend factories.
#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub worker_url: Option<String>,
    pub request_timeout: Duration,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            worker_url: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

pub type ExecutorFactory =
    Box<dyn Fn(&BackendSettings) -> crate::Result<Arc<dyn TaskExecutor>> + Send + Sync>;

/// Capability name -> backend factory, populated explicitly at startup.
#[derive(Default)]
pub struct ExecutorRegistry {
    factories: BTreeMap<String, ExecutorFactory>,
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("backends", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `echo` and `http` backends.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.factories.insert(
            ECHO_BACKEND.to_string(),
            Box::new(|_| Ok(Arc::new(EchoExecutor) as Arc<dyn TaskExecutor>)),
        );
        registry.factories.insert(
            HTTP_BACKEND.to_string(),
            Box::new(|settings| {
                let url = settings
                    .worker_url
                    .clone()
                    .ok_or_else(|| crate::Error::msg("http backend requires a worker url"))?;
                let exec = HttpExecutor::new(url, settings.request_timeout)?;
                Ok(Arc::new(exec) as Arc<dyn TaskExecutor>)
            }),
        );
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> crate::Result<()>
    where
        F: Fn(&BackendSettings) -> crate::Result<Arc<dyn TaskExecutor>> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(crate::Error::msg(format!(
                "backend already registered: {name}"
            )));
        }
        self.factories.insert(name, Box::new(factory));
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Instantiate every backend whose factory accepts `settings`. Backends that cannot be built
    /// (e.g. `http` without a worker url) are skipped and logged.
    pub fn build(&self, settings: &BackendSettings) -> Executors {
        let mut by_name = HashMap::with_capacity(self.factories.len());
        for (name, factory) in &self.factories {
            match factory(settings) {
                Ok(exec) => {
                    by_name.insert(name.clone(), exec);
                }
                Err(err) => {
                    tracing::info!(
                        event = "grid.executor.backend_unavailable",
                        backend = %name,
                        error = %err,
                        "backend not available"
                    );
                }
            }
        }
        Executors { by_name }
    }
}

/// Instantiated backends, resolved by name.
#[derive(Clone, Default)]
pub struct Executors {
    by_name: HashMap<String, Arc<dyn TaskExecutor>>,
}

impl std::fmt::Debug for Executors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.by_name.keys().collect();
        names.sort();
        f.debug_struct("Executors").field("backends", &names).finish()
    }
}

impl Executors {
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn TaskExecutor>> {
        self.by_name.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// Returns the payload unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoExecutor;

#[async_trait]
impl TaskExecutor for EchoExecutor {
    async fn execute(&self, payload: &Value) -> Result<Value, ExecutionFailure> {
        Ok(payload.clone())
    }
}

/// Forwards the payload to a remote worker as a JSON `POST`.
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    url: String,
    http: reqwest::Client,
}

impl HttpExecutor {
    pub fn new(url: String, timeout: Duration) -> crate::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build worker http client")?;
        Ok(Self { url, http })
    }
}

#[async_trait]
impl TaskExecutor for HttpExecutor {
    async fn execute(&self, payload: &Value) -> Result<Value, ExecutionFailure> {
        let resp = self
            .http
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .map_err(|err| ExecutionFailure::retryable(format!("worker request failed: {err}")))?;

        let status = resp.status();
        if !status.is_success() {
            let retryable = status.is_server_error()
                || status == reqwest::StatusCode::TOO_MANY_REQUESTS
                || status == reqwest::StatusCode::REQUEST_TIMEOUT;
            return Err(ExecutionFailure {
                retryable,
                message: format!("worker returned {status}"),
            });
        }

        resp.json::<Value>()
            .await
            .map_err(|err| ExecutionFailure::fatal(format!("decode worker result: {err}")))
    }
}
