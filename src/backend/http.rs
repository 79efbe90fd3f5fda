//! HTTP transport to the backend gateway.
//!
//! `POST {base}/api/{operation}` with the JSON arguments as body. Delegated
//! handles add `Authorization: Bearer <delegation>`; the anonymous handle
//! sends no credentials.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};

use crate::backend::{BackendConnector, CallHandle, Reply};
use crate::config::BackendConfig;
use crate::error::CallError;
use crate::identity::DelegatedIdentity;
use crate::principal::Principal;

const MAX_ERROR_BODY: usize = 512;

/// Creates identity-bound handles sharing one connection pool.
#[derive(Clone)]
pub struct HttpConnector {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpConnector {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            client: build_client(config.call_timeout),
            base_url: config.url.clone(),
            timeout: config.call_timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Probe the gateway's `/health` route.
    pub async fn health(&self) -> Result<String, CallError> {
        let operation = "health";
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map_err(|e| classify_send_error(operation, self.timeout, e))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(CallError::Status {
                operation: operation.to_string(),
                status: status.as_u16(),
                body: truncate(&body),
            });
        }
        Ok(body)
    }

    fn handle(&self, principal: Principal, bearer: Option<SecretString>) -> HttpCallHandle {
        HttpCallHandle {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            timeout: self.timeout,
            principal,
            bearer,
        }
    }
}

impl BackendConnector for HttpConnector {
    fn anonymous(&self) -> Arc<dyn CallHandle> {
        Arc::new(self.handle(Principal::anonymous(), None))
    }

    fn delegated(&self, identity: &DelegatedIdentity) -> Arc<dyn CallHandle> {
        Arc::new(self.handle(
            identity.principal().clone(),
            Some(identity.delegation().clone()),
        ))
    }
}

/// A handle that calls the gateway as one principal.
pub struct HttpCallHandle {
    client: Client,
    base_url: String,
    timeout: Duration,
    principal: Principal,
    bearer: Option<SecretString>,
}

#[async_trait]
impl CallHandle for HttpCallHandle {
    fn principal(&self) -> Principal {
        self.principal.clone()
    }

    async fn call(&self, operation: &str, args: serde_json::Value) -> Result<Reply, CallError> {
        let mut request = self
            .client
            .post(format!("{}/api/{}", self.base_url, operation))
            .json(&args);
        if let Some(bearer) = &self.bearer {
            request = request.header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", bearer.expose_secret()),
            );
        }

        tracing::debug!(operation, principal = %self.principal, "Backend call");
        send_call(request, operation, self.timeout).await
    }
}

pub(crate) fn build_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Send a prepared call and decode the `{"Ok"|"Err"}` envelope.
pub(crate) async fn send_call(
    request: RequestBuilder,
    operation: &str,
    timeout: Duration,
) -> Result<Reply, CallError> {
    let response = request
        .send()
        .await
        .map_err(|e| classify_send_error(operation, timeout, e))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(CallError::Status {
            operation: operation.to_string(),
            status: status.as_u16(),
            body: truncate(&body),
        });
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| classify_send_error(operation, timeout, e))?;
    serde_json::from_slice::<Reply>(&bytes).map_err(|e| CallError::Protocol {
        operation: operation.to_string(),
        reason: format!("invalid result envelope: {e}"),
    })
}

pub(crate) fn classify_send_error(
    operation: &str,
    timeout: Duration,
    error: reqwest::Error,
) -> CallError {
    if error.is_timeout() {
        CallError::Timeout {
            operation: operation.to_string(),
            timeout,
        }
    } else {
        CallError::Transport {
            operation: operation.to_string(),
            reason: error.to_string(),
        }
    }
}

fn truncate(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_long_bodies_on_char_boundaries() {
        let body = "é".repeat(400);
        let cut = truncate(&body);
        assert!(cut.ends_with("..."));
        assert!(cut.len() <= MAX_ERROR_BODY + 3);
        assert_eq!(truncate("short"), "short");
    }

    #[tokio::test]
    async fn unreachable_backend_is_a_transport_error() {
        let config = BackendConfig {
            url: "http://127.0.0.1:9".to_string(),
            service_id: Principal::anonymous(),
            call_timeout: Duration::from_secs(2),
        };
        let connector = HttpConnector::new(&config);
        let handle = connector.anonymous();
        assert!(handle.principal().is_anonymous());

        let err = handle
            .call("chat", serde_json::json!({"prompt": "hi"}))
            .await
            .unwrap_err();
        assert_eq!(err.operation(), "chat");
        assert!(matches!(
            err,
            CallError::Transport { .. } | CallError::Timeout { .. }
        ));
    }
}
