//! One-shot ownership check run before a session is trusted.

use serde_json::{Value, json};

use crate::backend::{CallHandle, Reply, api};
use crate::error::{AuthError, CallError};

/// Outcome of [`AuthorizationGate::verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Admitted,
    /// The backend answered and said no.
    Rejected(String),
    /// No answer could be obtained.
    VerificationFailed(String),
}

impl Verdict {
    pub fn into_result(self) -> Result<(), AuthError> {
        match self {
            Self::Admitted => Ok(()),
            Self::Rejected(reason) => Err(AuthError::Rejected { reason }),
            Self::VerificationFailed(cause) => Err(AuthError::VerificationFailed { cause }),
        }
    }
}

/// Asks the backend whether the caller behind a handle may use it.
///
/// Exactly one backend call per verification, never retried.
#[derive(Debug, Default, Clone, Copy)]
pub struct AuthorizationGate;

impl AuthorizationGate {
    pub fn new() -> Self {
        Self
    }

    pub async fn verify(&self, handle: &dyn CallHandle) -> Verdict {
        let principal = handle.principal();
        match handle.call(api::CHECK_ACCESS, json!({})).await {
            Ok(Reply::Ok(Value::Bool(true))) => {
                tracing::info!(%principal, "Authorization admitted");
                Verdict::Admitted
            }
            Ok(Reply::Ok(Value::Bool(false))) => {
                tracing::info!(%principal, "Authorization rejected");
                Verdict::Rejected("Access denied".to_string())
            }
            Ok(Reply::Ok(other)) => {
                let cause = CallError::Protocol {
                    operation: api::CHECK_ACCESS.to_string(),
                    reason: format!("expected a boolean answer, got {other}"),
                };
                tracing::warn!(%principal, error = %cause, "Authorization check failed");
                Verdict::VerificationFailed(cause.to_string())
            }
            Ok(Reply::Err(reason)) => {
                tracing::info!(%principal, %reason, "Authorization rejected");
                Verdict::Rejected(reason)
            }
            Err(e) => {
                tracing::warn!(%principal, error = %e, "Authorization check failed");
                Verdict::VerificationFailed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::principal::Principal;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        principal: Principal,
        reply: Result<Reply, String>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(reply: Result<Reply, String>) -> Self {
            Self {
                principal: Principal::from_text("rrkah-fqaaa-aaaaa-aaaaq-cai").unwrap(),
                reply,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CallHandle for Scripted {
        fn principal(&self) -> Principal {
            self.principal.clone()
        }

        async fn call(&self, operation: &str, _args: serde_json::Value) -> Result<Reply, CallError> {
            assert_eq!(operation, api::CHECK_ACCESS);
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone().map_err(|reason| CallError::Transport {
                operation: operation.to_string(),
                reason,
            })
        }
    }

    #[tokio::test]
    async fn admitted_on_ok() {
        let handle = Scripted::new(Ok(Reply::ok(true)));
        assert_eq!(AuthorizationGate::new().verify(&handle).await, Verdict::Admitted);
        assert_eq!(handle.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn backend_refusal_is_rejected() {
        let handle = Scripted::new(Ok(Reply::err("Access denied")));
        assert_eq!(
            AuthorizationGate::new().verify(&handle).await,
            Verdict::Rejected("Access denied".to_string())
        );

        let handle = Scripted::new(Ok(Reply::ok(false)));
        assert!(matches!(
            AuthorizationGate::new().verify(&handle).await,
            Verdict::Rejected(_)
        ));
    }

    #[tokio::test]
    async fn transport_failure_is_not_retried() {
        let handle = Scripted::new(Err("connection reset".to_string()));
        let verdict = AuthorizationGate::new().verify(&handle).await;
        assert!(matches!(verdict, Verdict::VerificationFailed(_)));
        assert_eq!(handle.calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            verdict.into_result(),
            Err(AuthError::VerificationFailed { .. })
        ));
    }

    #[tokio::test]
    async fn only_an_explicit_true_admits() {
        for value in [
            Value::Null,
            json!({ "authorized": false }),
            json!({ "authorized": true }),
            json!("denied"),
            json!(0),
            json!(1),
            json!([true]),
        ] {
            let handle = Scripted::new(Ok(Reply::Ok(value.clone())));
            let verdict = AuthorizationGate::new().verify(&handle).await;
            match verdict {
                Verdict::VerificationFailed(cause) => {
                    assert!(cause.contains("check_access"), "value {value}: {cause}")
                }
                other => panic!("value {value} produced {other:?}"),
            }
            assert_eq!(handle.calls.load(Ordering::SeqCst), 1);
        }
    }
}
