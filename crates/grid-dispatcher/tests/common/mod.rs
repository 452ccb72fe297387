#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use clap::Parser;
use grid_core::auth::keys::{CachePolicy, KeySource};
use grid_core::auth::{IssuerConfig, IssuersFile, TokenValidator};
use grid_core::executor::ExecutorRegistry;
use grid_core::Role;
use grid_dispatcher::{build_state_with, config::GridConfig, AppState};
use http_body_util::BodyExt;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Value};
use tower::util::ServiceExt;

pub const ISS: &str = "https://idp.lab.example.org/realms/grid";
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
        claim: realm_access.roles
        marker: grid-admin
        role: ADMIN
      - kind: claim_contains
        claim: realm_access.roles
        marker: grid-scientist
        role: SCIENTIST
      - kind: claim_contains
        claim: realm_access.roles
        marker: grid-worker
        role: WORKER
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

pub fn config(extra: &[&str]) -> GridConfig {
    let mut args = vec![
        "grid-dispatcher",
        "--retry-base-delay-ms",
        "10",
        "--dispatch-poll-ms",
        "10",
        "--aging-interval-ms",
        "50",
    ];
    if !extra.contains(&"--default-backend") {
        args.extend_from_slice(&["--default-backend", "echo"]);
    }
    args.extend_from_slice(extra);
    GridConfig::try_parse_from(args).expect("test config")
}

pub fn validator() -> TokenValidator {
    let issuers = IssuersFile::from_yaml(ISSUERS_YAML).expect("issuers yaml");
    TokenValidator::new(
        issuers.issuers,
        std::sync::Arc::new(StaticKeys),
        CachePolicy::default(),
    )
    .expect("validator")
}

pub fn state(cfg: &GridConfig, registry: &ExecutorRegistry) -> AppState {
    build_state_with(cfg, validator(), registry).expect("build state")
}

pub fn claims(sub: &str, realm_roles: &[&str]) -> Value {
    let now = Utc::now().timestamp();
    json!({
        "iss": ISS,
        "aud": "grid",
        "sub": sub,
        "iat": now,
        "exp": now + 600,
        "realm_access": { "roles": realm_roles },
    })
}

pub fn mint(claims: &Value) -> String {
    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some("k1".to_string());
    encode(&header, claims, &EncodingKey::from_secret(SECRET)).expect("mint token")
}

pub fn token_for(role: Role) -> String {
    let marker = match role {
        Role::Admin => "grid-admin",
        Role::Scientist => "grid-scientist",
        Role::Worker => "grid-worker",
        Role::Viewer | Role::Anonymous => "offline_access",
    };
    mint(&claims(&role.as_str().to_ascii_lowercase(), &[marker]))
}

pub async fn call(
    app: &axum::Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> anyhow::Result<(StatusCode, Value)> {
    let (status, bytes) = call_raw(app, method, uri, token, body).await?;
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    Ok((status, body))
}

pub async fn call_raw(
    app: &axum::Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> anyhow::Result<(StatusCode, Vec<u8>)> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body)?))?,
        None => builder.body(Body::empty())?,
    };

    let response = app.clone().oneshot(request).await?;
    let status = response.status();
    let bytes = response.into_body().collect().await?.to_bytes();
    Ok((status, bytes.to_vec()))
}

/// Poll a task until `done` holds, or fail after `timeout`.
pub async fn wait_for_task(
    app: &axum::Router,
    token: &str,
    task_id: &str,
    timeout: std::time::Duration,
    done: impl Fn(&Value) -> bool,
) -> anyhow::Result<Value> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let uri = format!("/v1/tasks/{task_id}");
        let (status, body) = call(app, "GET", &uri, Some(token), None).await?;
        anyhow::ensure!(status == StatusCode::OK, "status {status}: {body}");
        if done(&body) {
            return Ok(body);
        }
        anyhow::ensure!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for task {task_id}; last={body}"
        );
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}
