//! Session and authorization state machine.
//!
//! ```text
//! Anonymous -> Authenticating -> Verifying -> Authorized -> Disconnecting -> Anonymous
//!                   |               |
//!                   +---------------+--> Anonymous (provider failure, rejection)
//! ```
//!
//! The proxy is rebound to a new principal only after the gate admits it, and
//! back to the anonymous handle whenever the session leaves `Authorized`.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::auth::AuthorizationGate;
use crate::error::AuthError;
use crate::identity::{
    AcquiredIdentity, DelegatedIdentityProvider, ExtensionWallet, IdentityKind,
    MAX_DELEGATION_TTL, ProviderKind,
};
use crate::principal::Principal;
use crate::proxy::ServiceProxy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Anonymous,
    Authenticating,
    Verifying,
    Authorized,
    Disconnecting,
}

/// Who the client is talking to the backend as.
///
/// `principal` is present iff `identity_kind != None`; `authorized` implies
/// `identity_kind != None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub identity_kind: IdentityKind,
    pub principal: Option<Principal>,
    pub authorized: bool,
}

impl Session {
    pub fn anonymous() -> Self {
        Self {
            identity_kind: IdentityKind::None,
            principal: None,
            authorized: false,
        }
    }
}

/// Read-only view for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub session: Session,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeOutcome {
    NothingToResume,
    Resumed(Principal),
}

struct Inner {
    state: SessionState,
    session: Session,
    active: Option<AcquiredIdentity>,
}

pub struct SessionManager {
    proxy: Arc<ServiceProxy>,
    gate: AuthorizationGate,
    delegated: Arc<dyn DelegatedIdentityProvider>,
    wallet: Option<Arc<dyn ExtensionWallet>>,
    service_id: Principal,
    inner: RwLock<Inner>,
    /// Held for the whole of a login, resume or logout.
    transition: Mutex<()>,
}

impl SessionManager {
    pub fn new(
        proxy: Arc<ServiceProxy>,
        delegated: Arc<dyn DelegatedIdentityProvider>,
        wallet: Option<Arc<dyn ExtensionWallet>>,
        service_id: Principal,
    ) -> Self {
        Self {
            proxy,
            gate: AuthorizationGate::new(),
            delegated,
            wallet,
            service_id,
            inner: RwLock::new(Inner {
                state: SessionState::Anonymous,
                session: Session::anonymous(),
                active: None,
            }),
            transition: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.read();
        SessionSnapshot {
            state: inner.state,
            session: inner.session.clone(),
        }
    }

    pub fn is_authorized(&self) -> bool {
        self.inner.read().session.authorized
    }

    /// Recover a persisted delegated identity and re-verify it.
    pub async fn resume_session(&self) -> Result<ResumeOutcome, AuthError> {
        let _guard = self
            .transition
            .try_lock()
            .map_err(|_| AuthError::TransitionInProgress)?;

        if let Some(principal) = self.authorized_principal() {
            return Ok(ResumeOutcome::Resumed(principal));
        }

        let Some(identity) = self.delegated.resume_delegated().await? else {
            tracing::debug!("No stored identity to resume");
            return Ok(ResumeOutcome::NothingToResume);
        };

        tracing::info!(principal = %identity.principal(), "Resuming stored session");
        self.set_state(SessionState::Authenticating);
        self.admit(AcquiredIdentity::Delegated(identity))
            .await
            .map(ResumeOutcome::Resumed)
    }

    /// Authenticate with `provider`, then verify ownership.
    ///
    /// Logging in while already authorized tears down the current session
    /// first.
    pub async fn login(&self, provider: ProviderKind) -> Result<Principal, AuthError> {
        let _guard = self
            .transition
            .try_lock()
            .map_err(|_| AuthError::TransitionInProgress)?;

        if self.inner.read().active.is_some() {
            self.disconnect().await;
        }

        tracing::info!(provider = %provider, "Login started");
        self.set_state(SessionState::Authenticating);

        let acquired = match provider {
            ProviderKind::Delegated => self
                .delegated
                .acquire_delegated(MAX_DELEGATION_TTL)
                .await
                .map(AcquiredIdentity::Delegated),
            ProviderKind::ExtensionWallet => self.connect_wallet().await,
        };

        match acquired {
            Ok(acquired) => self.admit(acquired).await,
            Err(e) => {
                tracing::info!(provider = %provider, error = %e, "Login failed");
                self.reset_anonymous();
                Err(e)
            }
        }
    }

    /// End the session. Provider teardown failures are logged, never returned.
    pub async fn logout(&self) -> Result<(), AuthError> {
        let _guard = self
            .transition
            .try_lock()
            .map_err(|_| AuthError::TransitionInProgress)?;

        self.disconnect().await;
        Ok(())
    }

    async fn connect_wallet(&self) -> Result<AcquiredIdentity, AuthError> {
        let wallet = self
            .wallet
            .clone()
            .ok_or_else(|| AuthError::ProviderUnavailable {
                provider: ProviderKind::ExtensionWallet.as_str().to_string(),
            })?;

        match wallet.connect(&self.service_id).await? {
            Some(principal) if principal.is_anonymous() => {
                if let Err(e) = wallet.disconnect().await {
                    tracing::warn!(error = %e, "Wallet teardown failed");
                }
                Err(AuthError::ProviderFailed {
                    provider: ProviderKind::ExtensionWallet.as_str().to_string(),
                    reason: "wallet returned the anonymous principal".to_string(),
                })
            }
            Some(principal) => Ok(AcquiredIdentity::Wallet { principal, wallet }),
            None => Err(AuthError::ProviderFailed {
                provider: ProviderKind::ExtensionWallet.as_str().to_string(),
                reason: "connection request was declined".to_string(),
            }),
        }
    }

    /// Verify an acquired identity and bind it on admission.
    async fn admit(&self, acquired: AcquiredIdentity) -> Result<Principal, AuthError> {
        let principal = acquired.principal().clone();
        {
            let mut inner = self.inner.write();
            inner.state = SessionState::Verifying;
            inner.session = Session {
                identity_kind: acquired.kind(),
                principal: Some(principal.clone()),
                authorized: false,
            };
        }

        let handle = match acquired
            .build_call_handle(self.proxy.connector().as_ref())
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                self.release(&acquired).await;
                self.reset_anonymous();
                return Err(e);
            }
        };

        if let Err(e) = self.gate.verify(handle.as_ref()).await.into_result() {
            self.release(&acquired).await;
            self.reset_anonymous();
            return Err(e);
        }

        self.proxy.rebind(Some(handle));
        {
            let mut inner = self.inner.write();
            inner.state = SessionState::Authorized;
            inner.session.authorized = true;
            inner.active = Some(acquired);
        }
        tracing::info!(%principal, "Session authorized");
        Ok(principal)
    }

    async fn disconnect(&self) {
        self.set_state(SessionState::Disconnecting);
        self.proxy.rebind(None);

        let active = self.inner.write().active.take();
        if let Some(acquired) = active {
            self.release(&acquired).await;
        }

        self.reset_anonymous();
        tracing::info!("Session ended");
    }

    /// Provider-specific teardown. Failures are logged only.
    async fn release(&self, acquired: &AcquiredIdentity) {
        let result = match acquired {
            AcquiredIdentity::Delegated(_) => self.delegated.release_delegated().await,
            AcquiredIdentity::Wallet { wallet, .. } => wallet.disconnect().await,
        };
        if let Err(e) = result {
            tracing::warn!(kind = %acquired.kind(), error = %e, "Identity teardown failed");
        }
    }

    fn authorized_principal(&self) -> Option<Principal> {
        let inner = self.inner.read();
        if inner.session.authorized {
            inner.session.principal.clone()
        } else {
            None
        }
    }

    fn set_state(&self, state: SessionState) {
        self.inner.write().state = state;
    }

    fn reset_anonymous(&self) {
        let mut inner = self.inner.write();
        inner.state = SessionState::Anonymous;
        inner.session = Session::anonymous();
        inner.active = None;
    }
}
