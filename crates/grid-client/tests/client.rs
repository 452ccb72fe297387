use async_trait::async_trait;
use chrono::Utc;
use clap::Parser;
use futures_util::StreamExt;
use grid_client::{
    ClientError, FallbackReason, GridClient, RunOptions, RunOutcome, SubmitTaskRequest,
};
use grid_core::auth::keys::{CachePolicy, KeySource};
use grid_core::auth::{IssuerConfig, IssuersFile, TokenValidator};
use grid_core::executor::{EchoExecutor, ExecutionFailure, ExecutorRegistry, TaskExecutor};
use grid_core::{Priority, Role, TaskState};
use grid_dispatcher::config::GridConfig;
use grid_dispatcher::{build_state_with, dispatch_options, GridServer};
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const SECRET: &[u8] = b"grid-test-hmac-secret-0123456789a";
const JWK_K: &str = "Z3JpZC10ZXN0LWhtYWMtc2VjcmV0LTAxMjM0NTY3ODlh";

const ISSUERS_YAML: &str = r#"
issuers:
  - name: lab
    issuer_url: https://idp.lab.example.org/realms/grid
    jwks_url: https://idp.lab.example.org/jwks
    audience: grid
    algorithms: [HS256]
    role_mapping:
      - kind: claim_contains
        claim: groups
        marker: grid-scientists
        role: SCIENTIST
"#;

struct StaticKeys;

#[async_trait]
impl KeySource for StaticKeys {
    async fn fetch(&self, _issuer: &IssuerConfig) -> anyhow::Result<JwkSet> {
        Ok(serde_json::from_value(json!({
            "keys": [{ "kty": "oct", "kid": "k1", "alg": "HS256", "k": JWK_K }]
        }))?)
    }
}

struct Sleepy;

#[async_trait]
impl TaskExecutor for Sleepy {
    async fn execute(&self, _payload: &Value) -> Result<Value, ExecutionFailure> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(Value::Null)
    }
}

/// Doubles a numeric payload, so local and remote results are distinguishable from echo.
struct Doubler;

#[async_trait]
impl TaskExecutor for Doubler {
    async fn execute(&self, payload: &Value) -> Result<Value, ExecutionFailure> {
        payload
            .as_i64()
            .map(|n| json!(n * 2))
            .ok_or_else(|| ExecutionFailure::fatal("payload is not a number"))
    }
}

fn token(groups: &[&str]) -> String {
    let now = Utc::now().timestamp();
    let claims = json!({
        "iss": "https://idp.lab.example.org/realms/grid",
        "aud": "grid",
        "sub": "ada",
        "iat": now,
        "exp": now + 600,
        "groups": groups,
    });
    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some("k1".to_string());
    encode(&header, &claims, &EncodingKey::from_secret(SECRET)).expect("mint token")
}

async fn start_grid(extra: &[&str]) -> anyhow::Result<GridServer> {
    let mut args = vec![
        "grid-dispatcher",
        "--dispatch-poll-ms",
        "10",
        "--retry-base-delay-ms",
        "10",
    ];
    args.extend_from_slice(extra);
    let cfg = GridConfig::try_parse_from(args)?;

    let issuers = IssuersFile::from_yaml(ISSUERS_YAML)?;
    let validator =
        TokenValidator::new(issuers.issuers, Arc::new(StaticKeys), CachePolicy::default())?;
    let mut registry = ExecutorRegistry::builtin();
    registry.register("sleepy", |_| Ok(Arc::new(Sleepy) as Arc<dyn TaskExecutor>))?;
    let state = build_state_with(&cfg, validator, &registry)?;

    GridServer::start(state, "127.0.0.1:0".parse()?, dispatch_options(&cfg)).await
}

fn client_for(server: &GridServer, groups: &[&str]) -> anyhow::Result<GridClient> {
    GridClient::new(&format!("http://{}", server.addr), Some(token(groups)))
}

fn request(payload: Value) -> SubmitTaskRequest {
    SubmitTaskRequest {
        task_id: None,
        payload,
        priority: Priority::High,
        backend: None,
    }
}

#[tokio::test]
async fn submit_then_watch_until_completed() -> anyhow::Result<()> {
    let server = start_grid(&[]).await?;
    let client = client_for(&server, &["grid-scientists"])?;

    let accepted = client.submit(&request(json!({ "shots": 8 }))).await?;
    anyhow::ensure!(accepted.status == TaskState::Queued);

    let results: Vec<_> = client
        .watch(accepted.task_id.as_str())
        .await?
        .collect()
        .await;
    let last = results
        .last()
        .ok_or_else(|| anyhow::anyhow!("empty stream"))?
        .as_ref()
        .map_err(|err| anyhow::anyhow!("{err}"))?;
    anyhow::ensure!(last.status == TaskState::Completed, "{last:?}");
    anyhow::ensure!(last.result == Some(json!({ "shots": 8 })));

    let again = client.task(accepted.task_id.as_str()).await?;
    anyhow::ensure!(&again == last, "terminal result changed: {again:?}");

    let status = client.grid_status().await?;
    anyhow::ensure!(status.worker_slots == 4 && status.queued_tasks == 0);

    server.shutdown().await
}

#[tokio::test]
async fn run_returns_the_remote_result_when_the_grid_delivers() -> anyhow::Result<()> {
    let server = start_grid(&[]).await?;
    let client = client_for(&server, &["grid-scientists"])?;

    let outcome = client
        .run(request(json!(21)), &RunOptions::default(), &Doubler)
        .await?;
    anyhow::ensure!(!outcome.is_local(), "{outcome:?}");
    anyhow::ensure!(outcome.output() == Some(&json!(21)), "{outcome:?}");

    server.shutdown().await
}

#[tokio::test]
async fn run_falls_back_locally_when_the_result_deadline_expires() -> anyhow::Result<()> {
    let server = start_grid(&[]).await?;
    let client = client_for(&server, &["grid-scientists"])?;

    let mut req = request(json!(5));
    req.backend = Some("sleepy".to_string());
    let opts = RunOptions {
        result_deadline: Duration::from_millis(200),
        ..RunOptions::default()
    };
    let outcome = client.run(req, &opts, &Doubler).await?;
    match outcome {
        RunOutcome::Local {
            output,
            reason: FallbackReason::DeadlineExceeded(d),
        } => {
            anyhow::ensure!(output == json!(10));
            anyhow::ensure!(d == Duration::from_millis(200));
        }
        other => anyhow::bail!("expected local fallback, got {other:?}"),
    }

    // The remote task is not cancelled by the client's deadline.
    let status = client.grid_status().await?;
    anyhow::ensure!(status.active_workers == 1, "{status:?}");

    server.shutdown().await
}

#[tokio::test]
async fn run_falls_back_locally_when_the_grid_is_unreachable() -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);

    let client = GridClient::new(&format!("http://{addr}"), Some(token(&[])))?;
    let outcome = client
        .run(request(json!({ "k": 1 })), &RunOptions::default(), &EchoExecutor)
        .await?;
    anyhow::ensure!(outcome.is_local(), "{outcome:?}");
    anyhow::ensure!(outcome.output() == Some(&json!({ "k": 1 })));
    Ok(())
}

#[tokio::test]
async fn permission_denial_is_not_masked_by_fallback() -> anyhow::Result<()> {
    let server = start_grid(&[]).await?;
    let viewer = client_for(&server, &["grid-observers"])?;

    let err = match viewer
        .run(request(json!(1)), &RunOptions::default(), &EchoExecutor)
        .await
    {
        Ok(outcome) => anyhow::bail!("viewer run succeeded: {outcome:?}"),
        Err(err) => err,
    };
    match err {
        ClientError::Rejected {
            status,
            required_roles,
            ..
        } => {
            anyhow::ensure!(status == reqwest::StatusCode::FORBIDDEN);
            anyhow::ensure!(required_roles == vec![Role::Admin, Role::Scientist]);
        }
        other => anyhow::bail!("expected rejection, got {other}"),
    }

    // Viewers may still observe the grid.
    anyhow::ensure!(viewer.available(Duration::from_secs(2)).await);

    server.shutdown().await
}
