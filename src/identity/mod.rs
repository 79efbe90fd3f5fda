//! Identity providers.
//!
//! Two providers can authenticate the operator: a delegated identity issued
//! by an external identity provider, and an extension wallet that signs calls
//! itself. Both are reduced to an [`AcquiredIdentity`], a tagged variant
//! exposing only what the session manager needs: the principal and a way to
//! build a call handle for it.

pub mod delegated;
pub mod wallet;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::backend::{BackendConnector, CallHandle};
use crate::error::AuthError;
use crate::principal::Principal;

pub use self::delegated::{BrowserIdentityProvider, DelegationStore};
pub use self::wallet::BridgeWallet;

/// Longest validity requested for a delegated identity (7 days).
pub const MAX_DELEGATION_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Which provider the operator chose to log in with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Delegated,
    ExtensionWallet,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delegated => "delegated",
            Self::ExtensionWallet => "extension_wallet",
        }
    }

    /// Parse the names accepted by `/login <provider>`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "delegated" | "identity" | "ii" => Some(Self::Delegated),
            "wallet" | "extension" | "extension_wallet" | "plug" => Some(Self::ExtensionWallet),
            _ => None,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which kind of identity backs the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    #[default]
    None,
    DelegatedIdentity,
    ExtensionWallet,
}

impl From<ProviderKind> for IdentityKind {
    fn from(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::Delegated => Self::DelegatedIdentity,
            ProviderKind::ExtensionWallet => Self::ExtensionWallet,
        }
    }
}

impl fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::DelegatedIdentity => "delegated identity",
            Self::ExtensionWallet => "extension wallet",
        })
    }
}

/// A session credential issued by the identity provider.
#[derive(Clone)]
pub struct DelegatedIdentity {
    principal: Principal,
    delegation: SecretString,
    expires_at: DateTime<Utc>,
}

impl DelegatedIdentity {
    pub fn new(principal: Principal, delegation: SecretString, expires_at: DateTime<Utc>) -> Self {
        Self {
            principal,
            delegation,
            expires_at,
        }
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn delegation(&self) -> &SecretString {
        &self.delegation
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

impl fmt::Debug for DelegatedIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegatedIdentity")
            .field("principal", &self.principal)
            .field("delegation", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of delegated identities.
#[async_trait]
pub trait DelegatedIdentityProvider: Send + Sync {
    /// Run the interactive round trip. The issued delegation never outlives
    /// `max_lifetime`.
    async fn acquire_delegated(
        &self,
        max_lifetime: Duration,
    ) -> Result<DelegatedIdentity, AuthError>;

    /// A still-valid identity persisted by an earlier run, if any.
    async fn resume_delegated(&self) -> Result<Option<DelegatedIdentity>, AuthError>;

    /// Forget the persisted identity.
    async fn release_delegated(&self) -> Result<(), AuthError>;
}

/// A signer living outside the process.
#[async_trait]
pub trait ExtensionWallet: Send + Sync {
    /// Ask the wallet to connect, allowing calls to `allowed_service` only.
    /// `Ok(None)` means the operator declined.
    async fn connect(&self, allowed_service: &Principal) -> Result<Option<Principal>, AuthError>;

    async fn disconnect(&self) -> Result<(), AuthError>;

    /// Call handle whose calls are signed by the wallet as `principal`.
    async fn build_call_handle(
        &self,
        principal: &Principal,
    ) -> Result<Arc<dyn CallHandle>, AuthError>;
}

/// The outcome of a provider round trip, before authorization.
#[derive(Clone)]
pub enum AcquiredIdentity {
    Delegated(DelegatedIdentity),
    Wallet {
        principal: Principal,
        wallet: Arc<dyn ExtensionWallet>,
    },
}

impl AcquiredIdentity {
    pub fn kind(&self) -> IdentityKind {
        match self {
            Self::Delegated(_) => IdentityKind::DelegatedIdentity,
            Self::Wallet { .. } => IdentityKind::ExtensionWallet,
        }
    }

    pub fn principal(&self) -> &Principal {
        match self {
            Self::Delegated(identity) => identity.principal(),
            Self::Wallet { principal, .. } => principal,
        }
    }

    pub async fn build_call_handle(
        &self,
        connector: &dyn BackendConnector,
    ) -> Result<Arc<dyn CallHandle>, AuthError> {
        match self {
            Self::Delegated(identity) => Ok(connector.delegated(identity)),
            Self::Wallet { principal, wallet } => wallet.build_call_handle(principal).await,
        }
    }
}

impl fmt::Debug for AcquiredIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delegated(identity) => f.debug_tuple("Delegated").field(identity).finish(),
            Self::Wallet { principal, .. } => f
                .debug_struct("Wallet")
                .field("principal", principal)
                .finish_non_exhaustive(),
        }
    }
}
