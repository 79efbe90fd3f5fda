//! End-to-end tests against a fake backend gateway.
//!
//! An Axum server on a random port plays the backend: it answers
//! `check_access` by looking at the bearer delegation and echoes chat
//! prompts. The client side is the real HTTP connector, session manager and
//! task queue, so these cover:
//! - ownership check before the proxy is rebound
//! - bearer delegation on every authorized call
//! - `{"Ok"}` / `{"Err"}` envelopes and HTTP failures reaching the queue
//! - FIFO delivery across mixed outcomes

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header::AUTHORIZATION};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;

use picoclaw::AppContext;
use picoclaw::backend::api;
use picoclaw::backend::{BackendConnector, HttpConnector};
use picoclaw::error::{AuthError, CallError};
use picoclaw::identity::ProviderKind;
use picoclaw::queue::{ReplySource, TaskEvent, TaskFailure, TaskMode};

use common::{OWNER, StaticDelegation, principal, test_config};

const OWNER_DELEGATION: &str = "owner-delegation";
const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Gateway {
    /// (operation, authorization header) per call, in arrival order.
    calls: Mutex<Vec<(String, Option<String>)>>,
}

impl Gateway {
    fn calls_to(&self, operation: &str) -> Vec<Option<String>> {
        self.calls
            .lock()
            .iter()
            .filter(|(op, _)| op == operation)
            .map(|(_, auth)| auth.clone())
            .collect()
    }
}

async fn api_call(
    State(gateway): State<Arc<Gateway>>,
    Path(operation): Path<String>,
    headers: HeaderMap,
    axum::Json(args): axum::Json<Value>,
) -> Response {
    let auth = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    gateway.calls.lock().push((operation.clone(), auth.clone()));

    let owner = auth.as_deref() == Some(format!("Bearer {OWNER_DELEGATION}").as_str());
    let reply = match operation.as_str() {
        "check_access" => json!({ "Ok": owner }),
        "chat" => match args["prompt"].as_str().unwrap_or_default() {
            "boom" => return (StatusCode::INTERNAL_SERVER_ERROR, "kaboom").into_response(),
            _ if !owner => json!({ "Err": "Access denied" }),
            prompt => json!({ "Ok": format!("echo: {prompt}") }),
        },
        "browse" => json!({ "Ok": format!("read {}", args["url"].as_str().unwrap_or_default()) }),
        "get_history" => json!({
            "Ok": [
                { "role": "user", "content": "hi", "timestamp": 1_000_000_000u64 },
                { "role": "assistant", "content": "echo: hi", "timestamp": 2_000_000_000u64 }
            ]
        }),
        _ => return StatusCode::NOT_FOUND.into_response(),
    };
    axum::Json(reply).into_response()
}

fn is_bind_permission_error<E: std::fmt::Display>(err: &E) -> bool {
    err.to_string().contains("Operation not permitted")
}

/// Start the fake gateway on a random port. `None` when the sandbox forbids binding.
async fn start_gateway() -> Option<(SocketAddr, Arc<Gateway>)> {
    let gateway = Arc::new(Gateway::default());
    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/{operation}", post(api_call))
        .with_state(Arc::clone(&gateway));

    let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => listener,
        Err(e) if is_bind_permission_error(&e) => return None,
        Err(e) => panic!("Failed to bind test gateway: {e}"),
    };
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Some((addr, gateway))
}

fn context(
    addr: SocketAddr,
    dir: &std::path::Path,
    delegation: &str,
) -> (AppContext, mpsc::UnboundedReceiver<TaskEvent>, Arc<StaticDelegation>) {
    let config = test_config(&format!("http://{addr}"), dir);
    let connector: Arc<dyn BackendConnector> = Arc::new(HttpConnector::new(&config.backend));
    let provider = Arc::new(StaticDelegation::new(principal(OWNER), delegation));
    let (ctx, events) = AppContext::with_collaborators(
        config,
        connector,
        Arc::clone(&provider) as _,
        None,
    );
    (ctx, events, provider)
}

/// Next delivered or failed event, skipping progress notifications.
async fn next_settled(events: &mut mpsc::UnboundedReceiver<TaskEvent>) -> TaskEvent {
    loop {
        let event = timeout(TIMEOUT, events.recv())
            .await
            .expect("timed out waiting for a task event")
            .expect("event channel closed");
        if !matches!(event, TaskEvent::Started { .. }) {
            return event;
        }
    }
}

#[tokio::test]
async fn health_probe_reaches_gateway() {
    let Some((addr, _gateway)) = start_gateway().await else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&format!("http://{addr}"), dir.path());

    let body = HttpConnector::new(&config.backend).health().await.unwrap();
    assert_eq!(body, "ok");
}

#[tokio::test]
async fn owner_login_binds_delegation_to_every_call() {
    let Some((addr, gateway)) = start_gateway().await else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let (ctx, mut events, _provider) = context(addr, dir.path(), OWNER_DELEGATION);

    let logged_in = ctx.sessions.login(ProviderKind::Delegated).await.unwrap();
    assert_eq!(logged_in, principal(OWNER));
    assert!(ctx.sessions.is_authorized());
    assert!(!ctx.proxy.is_anonymous());

    ctx.queue.submit("hi", TaskMode::Chat).unwrap();
    match next_settled(&mut events).await {
        TaskEvent::Delivered { text, source, .. } => {
            assert_eq!(text, "echo: hi");
            assert_eq!(source, ReplySource::Backend);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let bearer = Some(format!("Bearer {OWNER_DELEGATION}"));
    assert_eq!(gateway.calls_to("check_access"), vec![bearer.clone()]);
    assert_eq!(gateway.calls_to("chat"), vec![bearer]);

    let history = api::get_history(&*ctx.proxy, 5).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].content, "echo: hi");
}

#[tokio::test]
async fn non_owner_is_rejected_and_stays_anonymous() {
    let Some((addr, gateway)) = start_gateway().await else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let (ctx, mut events, provider) = context(addr, dir.path(), "someone-else");

    let err = ctx.sessions.login(ProviderKind::Delegated).await.unwrap_err();
    assert!(matches!(err, AuthError::Rejected { .. }), "got {err:?}");
    assert!(!ctx.sessions.is_authorized());
    assert!(ctx.proxy.is_anonymous());
    assert_eq!(provider.released(), 1);

    // Anonymous calls carry no credential and are refused by the backend.
    ctx.queue.submit("hi", TaskMode::Chat).unwrap();
    match next_settled(&mut events).await {
        TaskEvent::Failed {
            failure: TaskFailure::Refused(message),
            ..
        } => assert_eq!(message, "Access denied"),
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(gateway.calls_to("chat"), vec![None]);
}

#[tokio::test]
async fn failures_are_reported_per_task_in_order() {
    let Some((addr, _gateway)) = start_gateway().await else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let (ctx, mut events, _provider) = context(addr, dir.path(), OWNER_DELEGATION);
    ctx.sessions.login(ProviderKind::Delegated).await.unwrap();

    let first = ctx.queue.submit("boom", TaskMode::Chat).unwrap();
    let second = ctx.queue.submit("https://example.com", TaskMode::Browse).unwrap();
    let third = ctx.queue.submit("after", TaskMode::Chat).unwrap();

    match next_settled(&mut events).await {
        TaskEvent::Failed {
            sequence,
            failure: TaskFailure::Call(CallError::Status { status, .. }),
        } => {
            assert_eq!(sequence, first);
            assert_eq!(status, 500);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    match next_settled(&mut events).await {
        TaskEvent::Delivered { sequence, text, .. } => {
            assert_eq!(sequence, second);
            assert_eq!(text, "read https://example.com");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    match next_settled(&mut events).await {
        TaskEvent::Delivered { sequence, text, .. } => {
            assert_eq!(sequence, third);
            assert_eq!(text, "echo: after");
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn principal_text_is_answered_without_the_backend() {
    let Some((addr, gateway)) = start_gateway().await else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let (ctx, mut events, _provider) = context(addr, dir.path(), OWNER_DELEGATION);

    ctx.queue.submit(common::SERVICE, TaskMode::Chat).unwrap();
    match next_settled(&mut events).await {
        TaskEvent::Delivered { text, source, .. } => {
            assert_eq!(source, ReplySource::Local);
            assert!(text.ends_with(&principal(common::SERVICE).account_id().to_hex()));
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(gateway.calls_to("chat").is_empty());
}

#[tokio::test]
async fn logout_returns_calls_to_anonymous() {
    let Some((addr, gateway)) = start_gateway().await else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let (ctx, mut events, provider) = context(addr, dir.path(), OWNER_DELEGATION);

    ctx.sessions.login(ProviderKind::Delegated).await.unwrap();
    ctx.sessions.logout().await.unwrap();
    assert!(ctx.proxy.is_anonymous());
    assert_eq!(provider.released(), 1);

    ctx.queue.submit("hi", TaskMode::Chat).unwrap();
    let _ = next_settled(&mut events).await;
    assert_eq!(gateway.calls_to("chat"), vec![None]);
}
