//! Extension wallet reached through a local bridge process.
//!
//! The bridge exposes:
//! - `GET  /status`      -> `{"connected": bool, "principal": "..."|null}`
//! - `POST /connect`     `{"whitelist": ["<service>"]}` -> `{"principal": "..."|null}`
//! - `POST /disconnect`
//! - `POST /call/{op}`   same envelope as the backend gateway, signed by the wallet

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::backend::http::{build_client, send_call};
use crate::backend::{CallHandle, Reply};
use crate::error::{AuthError, CallError};
use crate::identity::{ExtensionWallet, ProviderKind};
use crate::principal::Principal;

const STATUS_TIMEOUT: Duration = Duration::from_secs(5);
// Connecting waits on the operator approving the request in the wallet.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct BridgeStatus {
    pub connected: bool,
    #[serde(default)]
    pub principal: Option<Principal>,
}

#[derive(Serialize)]
struct ConnectRequest<'a> {
    whitelist: [&'a str; 1],
}

#[derive(Deserialize)]
struct ConnectResponse {
    #[serde(default)]
    principal: Option<Principal>,
}

fn provider() -> String {
    ProviderKind::ExtensionWallet.as_str().to_string()
}

fn unavailable() -> AuthError {
    AuthError::ProviderUnavailable {
        provider: provider(),
    }
}

fn failed(reason: impl Into<String>) -> AuthError {
    AuthError::ProviderFailed {
        provider: provider(),
        reason: reason.into(),
    }
}

/// Wallet bridge client.
#[derive(Clone)]
pub struct BridgeWallet {
    client: Client,
    base_url: String,
    call_timeout: Duration,
}

impl BridgeWallet {
    pub fn new(base_url: impl Into<String>, call_timeout: Duration) -> Self {
        Self {
            client: build_client(call_timeout.max(CONNECT_TIMEOUT)),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            call_timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Whether the bridge is up, and who it is connected as.
    pub async fn status(&self) -> Result<BridgeStatus, AuthError> {
        let response = self
            .client
            .get(format!("{}/status", self.base_url))
            .timeout(STATUS_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                tracing::debug!("Wallet bridge unreachable: {}", e);
                unavailable()
            })?;

        if !response.status().is_success() {
            return Err(failed(format!("status returned HTTP {}", response.status())));
        }
        response
            .json::<BridgeStatus>()
            .await
            .map_err(|e| failed(format!("unreadable status: {e}")))
    }
}

#[async_trait]
impl ExtensionWallet for BridgeWallet {
    async fn connect(&self, allowed_service: &Principal) -> Result<Option<Principal>, AuthError> {
        let service = allowed_service.to_text();
        let response = self
            .client
            .post(format!("{}/connect", self.base_url))
            .timeout(CONNECT_TIMEOUT)
            .json(&ConnectRequest {
                whitelist: [service.as_str()],
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    unavailable()
                } else {
                    failed(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(failed(format!("connect returned HTTP {}", response.status())));
        }

        let body = response
            .json::<ConnectResponse>()
            .await
            .map_err(|e| failed(format!("unreadable connect response: {e}")))?;
        Ok(body.principal)
    }

    async fn disconnect(&self) -> Result<(), AuthError> {
        let response = self
            .client
            .post(format!("{}/disconnect", self.base_url))
            .timeout(STATUS_TIMEOUT)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(failed(format!(
                "disconnect returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn build_call_handle(
        &self,
        principal: &Principal,
    ) -> Result<Arc<dyn CallHandle>, AuthError> {
        Ok(Arc::new(WalletCallHandle {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            timeout: self.call_timeout,
            principal: principal.clone(),
        }))
    }
}

/// Calls routed through the wallet, which signs them as `principal`.
struct WalletCallHandle {
    client: Client,
    base_url: String,
    timeout: Duration,
    principal: Principal,
}

#[async_trait]
impl CallHandle for WalletCallHandle {
    fn principal(&self) -> Principal {
        self.principal.clone()
    }

    async fn call(&self, operation: &str, args: serde_json::Value) -> Result<Reply, CallError> {
        let request = self
            .client
            .post(format!("{}/call/{}", self.base_url, operation))
            .timeout(self.timeout)
            .header("X-Picoclaw-Principal", self.principal.to_text())
            .json(&args);

        tracing::debug!(operation, principal = %self.principal, "Wallet call");
        send_call(request, operation, self.timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_decodes_optional_principal() {
        let status: BridgeStatus =
            serde_json::from_str(r#"{"connected": true, "principal": "2vxsx-fae"}"#).unwrap();
        assert!(status.connected);
        assert!(status.principal.unwrap().is_anonymous());

        let status: BridgeStatus = serde_json::from_str(r#"{"connected": false}"#).unwrap();
        assert_eq!(status.principal, None);
    }

    #[test]
    fn connect_request_whitelists_the_service() {
        let body = serde_json::to_value(ConnectRequest {
            whitelist: ["rrkah-fqaaa-aaaaa-aaaaq-cai"],
        })
        .unwrap();
        assert_eq!(
            body,
            serde_json::json!({"whitelist": ["rrkah-fqaaa-aaaaa-aaaaq-cai"]})
        );
    }

    #[tokio::test]
    async fn missing_bridge_reads_as_unavailable() {
        let wallet = BridgeWallet::new("http://127.0.0.1:9/", Duration::from_secs(2));
        assert_eq!(wallet.base_url(), "http://127.0.0.1:9");

        let err = wallet
            .connect(&Principal::anonymous())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::ProviderUnavailable { .. }));
        assert!(err.user_message().contains("extension not found"));

        assert!(matches!(
            wallet.status().await.unwrap_err(),
            AuthError::ProviderUnavailable { .. }
        ));
    }
}
